//! NetBIOS session service framing
//!
//! Direct-hosted SMB (port 445) prefixes every message with the 4-byte
//! session service header: a message type byte and a 24-bit length.

use crate::error::{Error, Result};
use bytes::BufMut;
use std::convert::TryFrom;

pub mod frame;

pub use frame::FrameDecoder;

/// NetBIOS session message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NetBiosMessageType {
    SessionMessage = 0x00,
    SessionRequest = 0x81,
    PositiveResponse = 0x82,
    NegativeResponse = 0x83,
    RetargetResponse = 0x84,
    Keepalive = 0x85,
}

impl TryFrom<u8> for NetBiosMessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Self::SessionMessage),
            0x81 => Ok(Self::SessionRequest),
            0x82 => Ok(Self::PositiveResponse),
            0x83 => Ok(Self::NegativeResponse),
            0x84 => Ok(Self::RetargetResponse),
            0x85 => Ok(Self::Keepalive),
            _ => Err(Error::Protocol(format!(
                "Invalid NetBIOS message type: 0x{:02x}",
                value
            ))),
        }
    }
}

/// NetBIOS session service header (4 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetBiosHeader {
    pub message_type: NetBiosMessageType,
    /// Payload length (24 bits on direct-hosted transports)
    pub length: u32,
}

impl NetBiosHeader {
    pub const MAX_LENGTH: u32 = 0x00FF_FFFF;
    pub const SIZE: usize = 4;

    pub fn new(message_type: NetBiosMessageType, length: u32) -> Result<Self> {
        if length > Self::MAX_LENGTH {
            return Err(Error::InvalidParameter(format!(
                "NetBIOS payload of {} bytes exceeds {}",
                length,
                Self::MAX_LENGTH
            )));
        }
        Ok(Self {
            message_type,
            length,
        })
    }

    pub fn session_message(length: u32) -> Result<Self> {
        Self::new(NetBiosMessageType::SessionMessage, length)
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                need: Self::SIZE,
                have: buf.len(),
            });
        }
        let message_type = NetBiosMessageType::try_from(buf[0])?;
        let length = u32::from_be_bytes([0, buf[1], buf[2], buf[3]]);
        Ok(Self {
            message_type,
            length,
        })
    }

    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.message_type as u8);
        buf.put_slice(&self.length.to_be_bytes()[1..]);
    }
}

//! SMB2 protocol header

use super::smb2_constants::*;
use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::convert::TryFrom;

/// SMB2 Header structure (sync and async forms)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2Header {
    pub credit_charge: u16,
    pub status: u32,
    pub command: Smb2Command,
    pub credit: u16,
    pub flags: Smb2HeaderFlags,
    pub next_command: u32,
    pub message_id: u64,
    /// Present only when `ASYNC_COMMAND` is set
    pub async_id: u64,
    pub process_id: u32,
    pub tree_id: u32,
    pub session_id: u64,
    pub signature: [u8; 16],
}

impl Smb2Header {
    pub const SIZE: usize = SMB2_HEADER_SIZE;

    pub fn new(command: Smb2Command) -> Self {
        Self {
            credit_charge: 1,
            status: 0,
            command,
            credit: 1,
            flags: Smb2HeaderFlags::empty(),
            next_command: 0,
            message_id: 0,
            async_id: 0,
            process_id: 0xFEFF,
            tree_id: 0,
            session_id: 0,
            signature: [0; 16],
        }
    }

    pub fn is_response(&self) -> bool {
        self.flags.contains(Smb2HeaderFlags::SERVER_TO_REDIR)
    }

    pub fn is_async(&self) -> bool {
        self.flags.contains(Smb2HeaderFlags::ASYNC_COMMAND)
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                need: Self::SIZE,
                have: buf.len(),
            });
        }
        if buf[0..4] != SMB2_MAGIC {
            return Err(Error::InvalidHeader("Invalid SMB2 magic".into()));
        }
        let structure_size = LittleEndian::read_u16(&buf[4..6]);
        if structure_size != 64 {
            return Err(Error::InvalidHeader(format!(
                "Unexpected header structure size {}",
                structure_size
            )));
        }

        let flags = Smb2HeaderFlags::from_bits_truncate(LittleEndian::read_u32(&buf[16..20]));
        let (async_id, process_id, tree_id) = if flags.contains(Smb2HeaderFlags::ASYNC_COMMAND) {
            (LittleEndian::read_u64(&buf[32..40]), 0, 0)
        } else {
            (
                0,
                LittleEndian::read_u32(&buf[32..36]),
                LittleEndian::read_u32(&buf[36..40]),
            )
        };
        let mut signature = [0u8; 16];
        signature.copy_from_slice(&buf[48..64]);

        Ok(Self {
            credit_charge: LittleEndian::read_u16(&buf[6..8]),
            status: LittleEndian::read_u32(&buf[8..12]),
            command: Smb2Command::try_from(LittleEndian::read_u16(&buf[12..14]))?,
            credit: LittleEndian::read_u16(&buf[14..16]),
            flags,
            next_command: LittleEndian::read_u32(&buf[20..24]),
            message_id: LittleEndian::read_u64(&buf[24..32]),
            async_id,
            process_id,
            tree_id,
            session_id: LittleEndian::read_u64(&buf[40..48]),
            signature,
        })
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&SMB2_MAGIC);
        // Writes into a Vec cannot fail
        let _ = buf.write_u16::<LittleEndian>(64);
        let _ = buf.write_u16::<LittleEndian>(self.credit_charge);
        let _ = buf.write_u32::<LittleEndian>(self.status);
        let _ = buf.write_u16::<LittleEndian>(self.command as u16);
        let _ = buf.write_u16::<LittleEndian>(self.credit);
        let _ = buf.write_u32::<LittleEndian>(self.flags.bits());
        let _ = buf.write_u32::<LittleEndian>(self.next_command);
        let _ = buf.write_u64::<LittleEndian>(self.message_id);
        if self.is_async() {
            let _ = buf.write_u64::<LittleEndian>(self.async_id);
        } else {
            let _ = buf.write_u32::<LittleEndian>(self.process_id);
            let _ = buf.write_u32::<LittleEndian>(self.tree_id);
        }
        let _ = buf.write_u64::<LittleEndian>(self.session_id);
        buf.extend_from_slice(&self.signature);
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        self.write_to(&mut buf);
        buf
    }
}

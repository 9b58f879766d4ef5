//! Session message encoding and incremental decoding

use super::{NetBiosHeader, NetBiosMessageType};
use crate::error::Result;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

/// Prefix `payload` with a session message header.
pub fn encode_session_message(payload: &[u8]) -> Result<Bytes> {
    let header = NetBiosHeader::session_message(payload.len() as u32)?;
    let mut buf = BytesMut::with_capacity(NetBiosHeader::SIZE + payload.len());
    header.write_to(&mut buf);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Accumulates stream bytes and yields complete session message payloads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(65536),
        }
    }

    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Next complete payload, skipping keep-alives. `None` needs more input.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            if self.buffer.len() < NetBiosHeader::SIZE {
                return Ok(None);
            }
            let header = NetBiosHeader::parse(&self.buffer)?;
            let total = NetBiosHeader::SIZE + header.length as usize;
            if self.buffer.len() < total {
                self.buffer.reserve(total - self.buffer.len());
                return Ok(None);
            }
            let mut message = self.buffer.split_to(total);
            let payload = message.split_off(NetBiosHeader::SIZE).freeze();
            match header.message_type {
                NetBiosMessageType::SessionMessage => return Ok(Some(payload)),
                other => trace!(message_type = ?other, "Skipping NetBIOS control message"),
            }
        }
    }
}

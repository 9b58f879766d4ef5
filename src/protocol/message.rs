//! Generic SMB2 request/response exchange
//!
//! A [`Request`] carries an operation kind and its parameters and knows how to
//! encode itself behind an SMB2 header. A [`Response`] exposes the wire status,
//! the decoded body for the commands this layer drives, and optionally the raw
//! frame when the caller asked for it to be retained.

use super::header::Smb2Header;
use super::smb2_constants::*;
use super::status::{self, StatusEntry};
use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use bytes::Bytes;
use std::convert::TryFrom;
use uuid::Uuid;

/// Credits requested with every outbound request
const CREDIT_REQUEST: u16 = 32;

/// File id used for FSCTLs that do not target an open handle
pub const NO_FILE_ID: [u8; 16] = [0xFF; 16];

/// Operation kind and parameters of an outbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Negotiate {
        dialects: Vec<Smb2Dialect>,
        security_mode: SecurityMode,
        capabilities: Smb2Capabilities,
        client_guid: Uuid,
    },
    SessionSetup {
        flags: SessionSetupFlags,
        security_mode: SecurityMode,
        security_blob: Bytes,
        previous_session_id: u64,
    },
    Logoff,
    TreeConnect {
        path: String,
        /// Honored by SMB 3.1.1 servers only; sent as reserved otherwise
        flags: u16,
    },
    TreeDisconnect,
    Echo,
    Ioctl {
        ctl_code: u32,
        file_id: [u8; 16],
        input: Bytes,
        max_output: u32,
    },
    /// Pre-encoded body for commands driven by upper layers
    Raw { command: Smb2Command, body: Bytes },
}

impl Operation {
    pub fn command(&self) -> Smb2Command {
        match self {
            Operation::Negotiate { .. } => Smb2Command::Negotiate,
            Operation::SessionSetup { .. } => Smb2Command::SessionSetup,
            Operation::Logoff => Smb2Command::Logoff,
            Operation::TreeConnect { .. } => Smb2Command::TreeConnect,
            Operation::TreeDisconnect => Smb2Command::TreeDisconnect,
            Operation::Echo => Smb2Command::Echo,
            Operation::Ioctl { .. } => Smb2Command::Ioctl,
            Operation::Raw { command, .. } => *command,
        }
    }
}

/// Outbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub operation: Operation,
    pub session_id: u64,
    pub tree_id: u32,
    pub flags: Smb2HeaderFlags,
}

impl Request {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            session_id: 0,
            tree_id: 0,
            flags: Smb2HeaderFlags::empty(),
        }
    }

    pub fn with_session(mut self, session_id: u64) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_tree(mut self, tree_id: u32) -> Self {
        self.tree_id = tree_id;
        self
    }

    pub fn with_dfs(mut self, dfs: bool) -> Self {
        self.flags.set(Smb2HeaderFlags::DFS_OPERATIONS, dfs);
        self
    }

    pub fn command(&self) -> Smb2Command {
        self.operation.command()
    }

    /// Encode header and body. `dialect` selects dialect-dependent fields.
    pub fn encode(&self, message_id: u64, dialect: Option<Smb2Dialect>) -> Result<Bytes> {
        let mut header = Smb2Header::new(self.command());
        header.message_id = message_id;
        header.session_id = self.session_id;
        header.tree_id = self.tree_id;
        header.flags = self.flags;
        header.credit = CREDIT_REQUEST;

        let mut buf = Vec::with_capacity(Smb2Header::SIZE + 128);
        header.write_to(&mut buf);
        self.encode_body(&mut buf, dialect)?;
        Ok(Bytes::from(buf))
    }

    fn encode_body(&self, buf: &mut Vec<u8>, dialect: Option<Smb2Dialect>) -> Result<()> {
        match &self.operation {
            Operation::Negotiate {
                dialects,
                security_mode,
                capabilities,
                client_guid,
            } => {
                if dialects.is_empty() {
                    return Err(Error::InvalidParameter("no dialects offered".into()));
                }
                buf.write_u16::<LittleEndian>(structure_size::NEGOTIATE_REQUEST)?;
                buf.write_u16::<LittleEndian>(dialects.len() as u16)?;
                buf.write_u16::<LittleEndian>(security_mode.bits())?;
                buf.write_u16::<LittleEndian>(0)?;
                buf.write_u32::<LittleEndian>(capabilities.bits())?;
                buf.extend_from_slice(client_guid.as_bytes());
                buf.write_u64::<LittleEndian>(0)?;
                for dialect in dialects {
                    buf.write_u16::<LittleEndian>(*dialect as u16)?;
                }
            }
            Operation::SessionSetup {
                flags,
                security_mode,
                security_blob,
                previous_session_id,
            } => {
                let blob_len = u16::try_from(security_blob.len()).map_err(|_| {
                    Error::InvalidParameter("security blob exceeds 64 KiB".into())
                })?;
                buf.write_u16::<LittleEndian>(structure_size::SESSION_SETUP_REQUEST)?;
                buf.push(flags.bits());
                buf.push(security_mode.bits() as u8);
                buf.write_u32::<LittleEndian>(0)?;
                buf.write_u32::<LittleEndian>(0)?;
                buf.write_u16::<LittleEndian>((Smb2Header::SIZE + 24) as u16)?;
                buf.write_u16::<LittleEndian>(blob_len)?;
                buf.write_u64::<LittleEndian>(*previous_session_id)?;
                if security_blob.is_empty() {
                    buf.push(0);
                } else {
                    buf.extend_from_slice(security_blob);
                }
            }
            Operation::TreeConnect { path, flags } => {
                let path = encode_utf16le(path);
                let path_len = u16::try_from(path.len())
                    .map_err(|_| Error::InvalidParameter("tree path too long".into()))?;
                let flags = match dialect {
                    Some(Smb2Dialect::Smb311) => *flags,
                    _ => 0,
                };
                buf.write_u16::<LittleEndian>(structure_size::TREE_CONNECT_REQUEST)?;
                buf.write_u16::<LittleEndian>(flags)?;
                buf.write_u16::<LittleEndian>((Smb2Header::SIZE + 8) as u16)?;
                buf.write_u16::<LittleEndian>(path_len)?;
                buf.extend_from_slice(&path);
            }
            Operation::Logoff | Operation::TreeDisconnect | Operation::Echo => {
                buf.write_u16::<LittleEndian>(structure_size::EMPTY)?;
                buf.write_u16::<LittleEndian>(0)?;
            }
            Operation::Ioctl {
                ctl_code,
                file_id,
                input,
                max_output,
            } => {
                let input_offset = if input.is_empty() {
                    0
                } else {
                    (Smb2Header::SIZE + 56) as u32
                };
                buf.write_u16::<LittleEndian>(structure_size::IOCTL_REQUEST)?;
                buf.write_u16::<LittleEndian>(0)?;
                buf.write_u32::<LittleEndian>(*ctl_code)?;
                buf.extend_from_slice(file_id);
                buf.write_u32::<LittleEndian>(input_offset)?;
                buf.write_u32::<LittleEndian>(input.len() as u32)?;
                buf.write_u32::<LittleEndian>(0)?;
                buf.write_u32::<LittleEndian>(0)?;
                buf.write_u32::<LittleEndian>(0)?;
                buf.write_u32::<LittleEndian>(*max_output)?;
                buf.write_u32::<LittleEndian>(IOCTL_IS_FSCTL)?;
                buf.write_u32::<LittleEndian>(0)?;
                if input.is_empty() {
                    buf.push(0);
                } else {
                    buf.extend_from_slice(input);
                }
            }
            Operation::Raw { body, .. } => buf.extend_from_slice(body),
        }
        Ok(())
    }
}

/// Negotiated parameters from a NEGOTIATE response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateInfo {
    pub dialect: Smb2Dialect,
    pub security_mode: SecurityMode,
    pub capabilities: Smb2Capabilities,
    pub server_guid: Uuid,
    pub max_transact_size: u32,
    pub max_read_size: u32,
    pub max_write_size: u32,
    pub security_blob: Bytes,
}

/// Share parameters from a TREE_CONNECT response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeConnectInfo {
    pub share_type: ShareType,
    pub share_flags: ShareFlags,
    pub capabilities: ShareCapabilities,
    pub maximal_access: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Negotiate(NegotiateInfo),
    SessionSetup {
        session_flags: SessionFlags,
        security_blob: Bytes,
    },
    TreeConnect(TreeConnectInfo),
    Ioctl { ctl_code: u32, output: Bytes },
    Raw(Bytes),
    Empty,
}

/// Inbound response
#[derive(Debug, Clone)]
pub struct Response {
    header: Smb2Header,
    body: ResponseBody,
    raw: Option<Bytes>,
}

impl Response {
    /// Decode a complete frame. With `retain` the frame stays available via
    /// [`Response::raw_payload`].
    pub fn decode(frame: Bytes, retain: bool, dialect: Option<Smb2Dialect>) -> Result<Self> {
        let header = Smb2Header::parse(&frame)?;
        if !header.is_response() {
            return Err(Error::InvalidHeader("frame is not a response".into()));
        }
        let body = if carries_body(&header) {
            decode_body(&header, &frame, dialect)?
        } else {
            ResponseBody::Empty
        };
        Ok(Self {
            header,
            body,
            raw: retain.then_some(frame),
        })
    }

    pub fn header(&self) -> &Smb2Header {
        &self.header
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub fn status(&self) -> u32 {
        self.header.status
    }

    pub fn status_entry(&self) -> StatusEntry {
        status::lookup(self.header.status)
    }

    pub fn message_id(&self) -> u64 {
        self.header.message_id
    }

    pub fn session_id(&self) -> u64 {
        self.header.session_id
    }

    pub fn tree_id(&self) -> u32 {
        self.header.tree_id
    }

    /// Service confirmed by a TREE_CONNECT response.
    pub fn service(&self) -> Option<&'static str> {
        match &self.body {
            ResponseBody::TreeConnect(info) => Some(info.share_type.service()),
            _ => None,
        }
    }

    /// A TREE_CONNECT response that succeeded and handed out a tree id.
    pub fn is_valid(&self) -> bool {
        matches!(self.body, ResponseBody::TreeConnect(_))
            && self.header.status == status::STATUS_SUCCESS
            && self.header.tree_id != 0
    }

    pub fn raw_payload(&self) -> Option<&Bytes> {
        self.raw.as_ref()
    }

    /// Map the status to an error unless it is success, informational or a warning.
    /// A namespace redirect becomes [`Error::DfsRedirect`] for `path`.
    pub fn check(&self, path: &str) -> Result<()> {
        let code = self.header.status;
        if status::is_redirect(code) {
            return Err(Error::DfsRedirect {
                path: path.to_string(),
            });
        }
        if status::severity(code).is_error() {
            return Err(Error::from_status(code));
        }
        Ok(())
    }
}

fn carries_body(header: &Smb2Header) -> bool {
    match header.status {
        status::STATUS_SUCCESS => true,
        status::STATUS_MORE_PROCESSING_REQUIRED => header.command == Smb2Command::SessionSetup,
        status::STATUS_BUFFER_OVERFLOW => header.command == Smb2Command::Ioctl,
        _ => false,
    }
}

fn decode_body(
    header: &Smb2Header,
    frame: &Bytes,
    dialect: Option<Smb2Dialect>,
) -> Result<ResponseBody> {
    let body = &frame[Smb2Header::SIZE..];
    let decoded = match header.command {
        Smb2Command::Negotiate => {
            ensure_len(body, 64)?;
            let dialect = Smb2Dialect::try_from(LittleEndian::read_u16(&body[4..6]))?;
            let server_guid = Uuid::from_slice(&body[8..24])
                .map_err(|e| Error::ParseError(format!("server guid: {}", e)))?;
            let security_blob = slice_at(
                frame,
                LittleEndian::read_u16(&body[56..58]) as usize,
                LittleEndian::read_u16(&body[58..60]) as usize,
            )?;
            ResponseBody::Negotiate(NegotiateInfo {
                dialect,
                security_mode: SecurityMode::from_bits_truncate(LittleEndian::read_u16(
                    &body[2..4],
                )),
                capabilities: Smb2Capabilities::from_bits_truncate(LittleEndian::read_u32(
                    &body[24..28],
                )),
                server_guid,
                max_transact_size: LittleEndian::read_u32(&body[28..32]),
                max_read_size: LittleEndian::read_u32(&body[32..36]),
                max_write_size: LittleEndian::read_u32(&body[36..40]),
                security_blob,
            })
        }
        Smb2Command::SessionSetup => {
            ensure_len(body, 8)?;
            let security_blob = slice_at(
                frame,
                LittleEndian::read_u16(&body[4..6]) as usize,
                LittleEndian::read_u16(&body[6..8]) as usize,
            )?;
            ResponseBody::SessionSetup {
                session_flags: SessionFlags::from_bits_truncate(LittleEndian::read_u16(
                    &body[2..4],
                )),
                security_blob,
            }
        }
        Smb2Command::TreeConnect => {
            ensure_len(body, 16)?;
            // Share capabilities only exist from SMB 3.0 on
            let capabilities = match dialect {
                Some(d) if d.is_modern() => {
                    ShareCapabilities::from_bits_truncate(LittleEndian::read_u32(&body[8..12]))
                }
                _ => ShareCapabilities::empty(),
            };
            ResponseBody::TreeConnect(TreeConnectInfo {
                share_type: ShareType::try_from(body[2])?,
                share_flags: ShareFlags::from_bits_truncate(LittleEndian::read_u32(&body[4..8])),
                capabilities,
                maximal_access: LittleEndian::read_u32(&body[12..16]),
            })
        }
        Smb2Command::Ioctl => {
            ensure_len(body, 48)?;
            let output = slice_at(
                frame,
                LittleEndian::read_u32(&body[32..36]) as usize,
                LittleEndian::read_u32(&body[36..40]) as usize,
            )?;
            ResponseBody::Ioctl {
                ctl_code: LittleEndian::read_u32(&body[4..8]),
                output,
            }
        }
        Smb2Command::Logoff | Smb2Command::TreeDisconnect | Smb2Command::Echo => {
            ResponseBody::Empty
        }
        _ => ResponseBody::Raw(frame.slice(Smb2Header::SIZE..)),
    };
    Ok(decoded)
}

fn ensure_len(body: &[u8], need: usize) -> Result<()> {
    if body.len() < need {
        return Err(Error::BufferTooSmall {
            need,
            have: body.len(),
        });
    }
    Ok(())
}

/// Buffer addressed by an offset from the start of the header.
fn slice_at(frame: &Bytes, offset: usize, len: usize) -> Result<Bytes> {
    if len == 0 {
        return Ok(Bytes::new());
    }
    let end = offset
        .checked_add(len)
        .ok_or_else(|| Error::ParseError("buffer offset overflow".into()))?;
    if offset < Smb2Header::SIZE || end > frame.len() {
        return Err(Error::ParseError(format!(
            "buffer {}..{} outside frame of {} bytes",
            offset,
            end,
            frame.len()
        )));
    }
    Ok(frame.slice(offset..end))
}

pub(crate) fn encode_utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

pub(crate) fn decode_utf16le(bytes: &[u8]) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(Error::ParseError("odd UTF-16 byte count".into()));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).map_err(|e| Error::ParseError(format!("invalid UTF-16: {}", e)))
}

#[cfg(test)]
mod tests;

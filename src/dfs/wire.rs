//! DFS referral request and response encoding
//!
//! REQ_GET_DFS_REFERRAL goes out as the input of an
//! `FSCTL_DFS_GET_REFERRALS` IOCTL on the `IPC$` tree; RESP_GET_DFS_REFERRAL
//! comes back in the IOCTL output. Versions 2 to 4 are understood.

use super::{normalize, Referral, ReferralSource};
use crate::client::SmbClient;
use crate::error::{Error, Result};
use crate::protocol::dispatch::RequestFlags;
use crate::protocol::message::{
    decode_utf16le, encode_utf16le, Operation, Request, ResponseBody, NO_FILE_ID,
};
use crate::protocol::smb2_constants::{fsctl, IPC_SHARE, SERVICE_WILDCARD};
use crate::protocol::status;
use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use bytes::Bytes;
use std::sync::Weak;
use std::time::Duration;
use tracing::debug;

/// Highest referral version we ask for
pub const MAX_REFERRAL_LEVEL: u16 = 4;

/// Output buffer offered to the server
const MAX_REFERRAL_OUTPUT: u32 = 56 * 1024;

/// ServerType: target is a namespace root
pub const SERVER_TYPE_ROOT: u16 = 0x0001;
/// ReferralEntryFlags: entry is a name list (domain or DC referral)
pub const FLAG_NAME_LIST: u16 = 0x0002;

/// One decoded referral entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferralEntry {
    pub version: u16,
    pub server_type: u16,
    pub flags: u16,
    pub ttl: u32,
    pub dfs_path: String,
    pub alternate_path: String,
    /// `\server\share[\path]`, empty for name lists
    pub network_address: String,
    /// Domain name of a name-list entry
    pub special_name: String,
    pub expanded_names: Vec<String>,
}

impl ReferralEntry {
    pub fn is_root(&self) -> bool {
        self.server_type & SERVER_TYPE_ROOT != 0
    }

    pub fn is_name_list(&self) -> bool {
        self.flags & FLAG_NAME_LIST != 0
    }
}

/// Decoded RESP_GET_DFS_REFERRAL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferralResponse {
    /// Bytes of the request path the server matched
    pub path_consumed: u16,
    pub header_flags: u32,
    pub entries: Vec<ReferralEntry>,
}

pub fn encode_request(path: &str) -> Bytes {
    let mut buf = Vec::with_capacity(4 + path.len() * 2);
    // Writes into a Vec cannot fail
    let _ = buf.write_u16::<LittleEndian>(MAX_REFERRAL_LEVEL);
    buf.extend_from_slice(&encode_utf16le(path));
    buf.extend_from_slice(&[0, 0]);
    Bytes::from(buf)
}

pub fn decode_response(buf: &[u8]) -> Result<ReferralResponse> {
    need(buf, 0, 8)?;
    let path_consumed = LittleEndian::read_u16(&buf[0..2]);
    let count = LittleEndian::read_u16(&buf[2..4]) as usize;
    let header_flags = LittleEndian::read_u32(&buf[4..8]);

    let mut entries = Vec::with_capacity(count);
    let mut offset = 8;
    for _ in 0..count {
        need(buf, offset, 4)?;
        let version = LittleEndian::read_u16(&buf[offset..offset + 2]);
        let size = LittleEndian::read_u16(&buf[offset + 2..offset + 4]) as usize;
        if size < 4 {
            return Err(Error::ParseError(format!("referral entry size {}", size)));
        }
        entries.push(decode_entry(buf, offset, version)?);
        offset += size;
    }
    Ok(ReferralResponse {
        path_consumed,
        header_flags,
        entries,
    })
}

fn decode_entry(buf: &[u8], start: usize, version: u16) -> Result<ReferralEntry> {
    let at = |field: usize| LittleEndian::read_u16(&buf[start + field..start + field + 2]);
    match version {
        2 => {
            need(buf, start, 22)?;
            Ok(ReferralEntry {
                version,
                server_type: at(4),
                flags: at(6),
                ttl: LittleEndian::read_u32(&buf[start + 12..start + 16]),
                dfs_path: string_at(buf, start, at(16))?,
                alternate_path: string_at(buf, start, at(18))?,
                network_address: string_at(buf, start, at(20))?,
                special_name: String::new(),
                expanded_names: Vec::new(),
            })
        }
        3 | 4 => {
            need(buf, start, 18)?;
            let flags = at(6);
            let ttl = LittleEndian::read_u32(&buf[start + 8..start + 12]);
            if flags & FLAG_NAME_LIST != 0 {
                let count = at(14) as usize;
                let mut names = Vec::with_capacity(count);
                let mut name_offset = start + at(16) as usize;
                for _ in 0..count {
                    let name = cstring_utf16(buf, name_offset)?;
                    name_offset += (name.encode_utf16().count() + 1) * 2;
                    names.push(name);
                }
                Ok(ReferralEntry {
                    version,
                    server_type: at(4),
                    flags,
                    ttl,
                    dfs_path: String::new(),
                    alternate_path: String::new(),
                    network_address: String::new(),
                    special_name: string_at(buf, start, at(12))?,
                    expanded_names: names,
                })
            } else {
                Ok(ReferralEntry {
                    version,
                    server_type: at(4),
                    flags,
                    ttl,
                    dfs_path: string_at(buf, start, at(12))?,
                    alternate_path: string_at(buf, start, at(14))?,
                    network_address: string_at(buf, start, at(16))?,
                    special_name: String::new(),
                    expanded_names: Vec::new(),
                })
            }
        }
        other => Err(Error::ParseError(format!(
            "unsupported referral version {}",
            other
        ))),
    }
}

fn need(buf: &[u8], offset: usize, len: usize) -> Result<()> {
    if offset + len > buf.len() {
        return Err(Error::BufferTooSmall {
            need: offset + len,
            have: buf.len(),
        });
    }
    Ok(())
}

fn string_at(buf: &[u8], entry: usize, offset: u16) -> Result<String> {
    if offset == 0 {
        return Ok(String::new());
    }
    cstring_utf16(buf, entry + offset as usize)
}

/// NUL terminated UTF-16LE string starting at `offset`.
fn cstring_utf16(buf: &[u8], offset: usize) -> Result<String> {
    let mut end = offset;
    loop {
        need(buf, end, 2)?;
        if buf[end] == 0 && buf[end + 1] == 0 {
            break;
        }
        end += 2;
    }
    decode_utf16le(&buf[offset..end])
}

impl ReferralResponse {
    /// Turn target entries into [`Referral`]s for `request_path`.
    /// Name-list entries carry no share target and are skipped.
    pub fn into_referrals(self, request_path: &str) -> Vec<Referral> {
        let request_path = normalize(request_path);
        let consumed_chars = (self.path_consumed / 2) as usize;
        let link = normalize(&request_path.chars().take(consumed_chars).collect::<String>());
        let requested_host = request_path
            .split('\\')
            .find(|c| !c.is_empty())
            .unwrap_or("")
            .to_string();

        self.entries
            .into_iter()
            .filter(|e| !e.is_name_list())
            .filter_map(|e| {
                let mut parts = e
                    .network_address
                    .split('\\')
                    .filter(|c| !c.is_empty())
                    .map(str::to_string);
                let server = parts.next()?;
                let share = parts.next()?;
                let path = parts.collect::<Vec<_>>().join("\\");
                // A root served by a different host is a domain-based namespace
                let domain = (e.is_root() && !server.eq_ignore_ascii_case(&requested_host))
                    .then(|| requested_host.clone());
                Some(Referral {
                    server,
                    share,
                    path,
                    domain,
                    ttl: Duration::from_secs(u64::from(e.ttl)),
                    link: if link.is_empty() {
                        request_path.clone()
                    } else {
                        link.clone()
                    },
                })
            })
            .collect()
    }
}

/// Fetches referrals over the client's own sessions
pub struct ClientReferralSource {
    client: Weak<SmbClient>,
}

impl ClientReferralSource {
    pub fn new(client: Weak<SmbClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ReferralSource for ClientReferralSource {
    async fn fetch(&self, path: &str) -> Result<Vec<Referral>> {
        let client = self
            .client
            .upgrade()
            .ok_or_else(|| Error::InvalidState("client has been dropped".into()))?;
        let path = normalize(path);
        let host = path
            .split('\\')
            .find(|c| !c.is_empty())
            .ok_or_else(|| Error::NotDfsPath(path.clone()))?
            .to_string();

        let session = client.session_for(&host).await?;
        let result = async {
            let tree = session.get_or_create_tree(IPC_SHARE, SERVICE_WILDCARD).await?;
            let request = Request::new(Operation::Ioctl {
                ctl_code: fsctl::DFS_GET_REFERRALS,
                file_id: NO_FILE_ID,
                input: encode_request(&path),
                max_output: MAX_REFERRAL_OUTPUT,
            });
            let response = tree.send(request, RequestFlags::NONE).await;
            tree.release();
            response
        }
        .await;
        session.release();

        let response = result?;
        match response.status() {
            status::STATUS_NOT_FOUND | status::STATUS_FS_DRIVER_REQUIRED => {
                return Err(Error::NotDfsPath(path))
            }
            _ => response.check(&path)?,
        }
        let output = match response.body() {
            ResponseBody::Ioctl { output, .. } => output.clone(),
            _ => return Err(Error::Protocol("referral response without IOCTL body".into())),
        };
        let decoded = decode_response(&output)?;
        debug!(path = %path, entries = decoded.entries.len(), "Received referral response");
        Ok(decoded.into_referrals(&path))
    }
}

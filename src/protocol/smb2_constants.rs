//! SMB2/3 protocol constants used by the lifecycle layer

use bitflags::bitflags;
use std::convert::TryFrom;

/// SMB2 magic as bytes
pub const SMB2_MAGIC: [u8; 4] = [0xFE, b'S', b'M', b'B'];

/// SMB2 header size
pub const SMB2_HEADER_SIZE: usize = 64;

/// Default direct-hosted SMB port
pub const SMB_PORT: u16 = 445;

/// Name of the administrative pipe share
pub const IPC_SHARE: &str = "IPC$";

/// Service placeholder meaning "any service"
pub const SERVICE_WILDCARD: &str = "?????";

pub mod structure_size {
    pub const NEGOTIATE_REQUEST: u16 = 36;
    pub const NEGOTIATE_RESPONSE: u16 = 65;
    pub const SESSION_SETUP_REQUEST: u16 = 25;
    pub const SESSION_SETUP_RESPONSE: u16 = 9;
    pub const TREE_CONNECT_REQUEST: u16 = 9;
    pub const TREE_CONNECT_RESPONSE: u16 = 16;
    pub const IOCTL_REQUEST: u16 = 57;
    pub const IOCTL_RESPONSE: u16 = 49;
    /// LOGOFF, TREE_DISCONNECT and ECHO share this layout
    pub const EMPTY: u16 = 4;
    pub const ERROR_RESPONSE: u16 = 9;
}

/// FSCTL codes sent over IOCTL
pub mod fsctl {
    pub const DFS_GET_REFERRALS: u32 = 0x0006_0194;
    pub const DFS_GET_REFERRALS_EX: u32 = 0x0006_01B0;
    pub const QUERY_NETWORK_INTERFACE_INFO: u32 = 0x0014_01FC;
}

/// IOCTL request flag marking an FSCTL
pub const IOCTL_IS_FSCTL: u32 = 0x0000_0001;

/// SMB2 Commands (opcodes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Smb2Command {
    Negotiate = 0x00,
    SessionSetup = 0x01,
    Logoff = 0x02,
    TreeConnect = 0x03,
    TreeDisconnect = 0x04,
    Create = 0x05,
    Close = 0x06,
    Flush = 0x07,
    Read = 0x08,
    Write = 0x09,
    Lock = 0x0A,
    Ioctl = 0x0B,
    Cancel = 0x0C,
    Echo = 0x0D,
    QueryDirectory = 0x0E,
    ChangeNotify = 0x0F,
    QueryInfo = 0x10,
    SetInfo = 0x11,
    OplockBreak = 0x12,
}

impl TryFrom<u16> for Smb2Command {
    type Error = crate::Error;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        let command = match value {
            0x00 => Self::Negotiate,
            0x01 => Self::SessionSetup,
            0x02 => Self::Logoff,
            0x03 => Self::TreeConnect,
            0x04 => Self::TreeDisconnect,
            0x05 => Self::Create,
            0x06 => Self::Close,
            0x07 => Self::Flush,
            0x08 => Self::Read,
            0x09 => Self::Write,
            0x0A => Self::Lock,
            0x0B => Self::Ioctl,
            0x0C => Self::Cancel,
            0x0D => Self::Echo,
            0x0E => Self::QueryDirectory,
            0x0F => Self::ChangeNotify,
            0x10 => Self::QueryInfo,
            0x11 => Self::SetInfo,
            0x12 => Self::OplockBreak,
            _ => {
                return Err(crate::Error::ParseError(format!(
                    "Invalid SMB2 command: 0x{:04x}",
                    value
                )))
            }
        };
        Ok(command)
    }
}

bitflags! {
    /// SMB2 header flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Smb2HeaderFlags: u32 {
        const SERVER_TO_REDIR = 0x0000_0001;
        const ASYNC_COMMAND = 0x0000_0002;
        const RELATED_OPERATIONS = 0x0000_0004;
        const SIGNED = 0x0000_0008;
        const DFS_OPERATIONS = 0x1000_0000;
        const REPLAY_OPERATION = 0x2000_0000;
    }
}

bitflags! {
    /// SMB2 negotiate security mode
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SecurityMode: u16 {
        const SIGNING_ENABLED = 0x0001;
        const SIGNING_REQUIRED = 0x0002;
    }
}

bitflags! {
    /// SMB2 global capabilities
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Smb2Capabilities: u32 {
        const DFS = 0x0000_0001;
        const LEASING = 0x0000_0002;
        const LARGE_MTU = 0x0000_0004;
        const MULTI_CHANNEL = 0x0000_0008;
        const PERSISTENT_HANDLES = 0x0000_0010;
        const DIRECTORY_LEASING = 0x0000_0020;
        const ENCRYPTION = 0x0000_0040;
    }
}

bitflags! {
    /// SESSION_SETUP request flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SessionSetupFlags: u8 {
        const BINDING = 0x01;
    }
}

bitflags! {
    /// SESSION_SETUP response session flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SessionFlags: u16 {
        const IS_GUEST = 0x0001;
        const IS_NULL = 0x0002;
        const ENCRYPT_DATA = 0x0004;
    }
}

bitflags! {
    /// Share flags returned by TREE_CONNECT
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ShareFlags: u32 {
        const DFS = 0x0000_0001;
        const DFS_ROOT = 0x0000_0002;
        const AUTO_CACHING = 0x0000_0010;
        const VDO_CACHING = 0x0000_0020;
        const RESTRICT_EXCLUSIVE_OPENS = 0x0000_0100;
        const FORCE_SHARED_DELETE = 0x0000_0200;
        const ALLOW_NAMESPACE_CACHING = 0x0000_0400;
        const ACCESS_BASED_DIRECTORY_ENUM = 0x0000_0800;
        const FORCE_LEVELII_OPLOCK = 0x0000_1000;
        const ENABLE_HASH_V1 = 0x0000_2000;
        const ENABLE_HASH_V2 = 0x0000_4000;
        const ENCRYPT_DATA = 0x0000_8000;
        const IDENTITY_REMOTING = 0x0004_0000;
        const COMPRESS_DATA = 0x0010_0000;
    }
}

bitflags! {
    /// Share capabilities returned by TREE_CONNECT (SMB 3.x)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ShareCapabilities: u32 {
        const DFS = 0x0000_0008;
        const CONTINUOUS_AVAILABILITY = 0x0000_0010;
        const SCALEOUT = 0x0000_0020;
        const CLUSTER = 0x0000_0040;
        const ASYMMETRIC = 0x0000_0080;
        const REDIRECT_TO_OWNER = 0x0000_0100;
    }
}

/// Share type byte of a TREE_CONNECT response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShareType {
    Disk = 0x01,
    Pipe = 0x02,
    Print = 0x03,
}

impl TryFrom<u8> for ShareType {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Disk),
            0x02 => Ok(Self::Pipe),
            0x03 => Ok(Self::Print),
            _ => Err(crate::Error::ParseError(format!(
                "Invalid share type: 0x{:02x}",
                value
            ))),
        }
    }
}

impl ShareType {
    /// Service string the server confirms for this share type.
    pub fn service(self) -> &'static str {
        match self {
            ShareType::Disk => "A:",
            ShareType::Pipe => "IPC",
            ShareType::Print => "LPT1:",
        }
    }
}

/// SMB2 dialect versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum Smb2Dialect {
    Smb202 = 0x0202,
    Smb210 = 0x0210,
    Smb300 = 0x0300,
    Smb302 = 0x0302,
    Smb311 = 0x0311,
}

impl TryFrom<u16> for Smb2Dialect {
    type Error = crate::Error;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0202 => Ok(Self::Smb202),
            0x0210 => Ok(Self::Smb210),
            0x0300 => Ok(Self::Smb300),
            0x0302 => Ok(Self::Smb302),
            0x0311 => Ok(Self::Smb311),
            _ => Err(crate::Error::UnsupportedDialect(format!("0x{:04x}", value))),
        }
    }
}

impl Smb2Dialect {
    /// SMB 3.x dialects; the 2.x family is treated as legacy.
    pub fn is_modern(self) -> bool {
        self >= Smb2Dialect::Smb300
    }
}

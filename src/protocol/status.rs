//! NTSTATUS catalog
//!
//! Maps 32-bit wire status codes to a severity class and a human readable
//! message. The lookup is total: unknown codes resolve to a generic entry.

use std::fmt;

pub const STATUS_SUCCESS: u32 = 0x0000_0000;
pub const STATUS_PENDING: u32 = 0x0000_0103;
pub const STATUS_BUFFER_OVERFLOW: u32 = 0x8000_0005;
pub const STATUS_NO_MORE_FILES: u32 = 0x8000_0006;
pub const STATUS_UNSUCCESSFUL: u32 = 0xC000_0001;
pub const STATUS_NOT_IMPLEMENTED: u32 = 0xC000_0002;
pub const STATUS_INVALID_PARAMETER: u32 = 0xC000_000D;
pub const STATUS_MORE_PROCESSING_REQUIRED: u32 = 0xC000_0016;
pub const STATUS_ACCESS_DENIED: u32 = 0xC000_0022;
pub const STATUS_OBJECT_NAME_NOT_FOUND: u32 = 0xC000_0034;
pub const STATUS_LOGON_FAILURE: u32 = 0xC000_006D;
pub const STATUS_NOT_SUPPORTED: u32 = 0xC000_00BB;
pub const STATUS_NETWORK_NAME_DELETED: u32 = 0xC000_00C9;
pub const STATUS_BAD_NETWORK_NAME: u32 = 0xC000_00CC;
pub const STATUS_FS_DRIVER_REQUIRED: u32 = 0xC000_019C;
pub const STATUS_USER_SESSION_DELETED: u32 = 0xC000_0203;
pub const STATUS_NOT_FOUND: u32 = 0xC000_0225;
pub const STATUS_PATH_NOT_COVERED: u32 = 0xC000_0257;
pub const STATUS_NETWORK_SESSION_EXPIRED: u32 = 0xC000_035C;

/// Message used for codes that are not in the table.
pub const UNKNOWN_STATUS_MESSAGE: &str = "Unknown status code";

/// Status codes, index-aligned with [`STATUS_MESSAGES`].
pub const STATUS_CODES: &[u32] = &[
    STATUS_SUCCESS,
    STATUS_PENDING,
    0x0000_0104,
    0x0000_010B,
    0x0000_010C,
    0x4000_0000,
    STATUS_BUFFER_OVERFLOW,
    STATUS_NO_MORE_FILES,
    0x8000_001A,
    STATUS_UNSUCCESSFUL,
    STATUS_NOT_IMPLEMENTED,
    0xC000_0003,
    0xC000_0005,
    0xC000_0008,
    STATUS_INVALID_PARAMETER,
    0xC000_000E,
    0xC000_000F,
    0xC000_0010,
    STATUS_MORE_PROCESSING_REQUIRED,
    STATUS_ACCESS_DENIED,
    0xC000_0023,
    0xC000_0033,
    STATUS_OBJECT_NAME_NOT_FOUND,
    0xC000_0035,
    0xC000_0037,
    0xC000_0039,
    0xC000_003A,
    0xC000_003B,
    0xC000_0043,
    0xC000_0056,
    0xC000_005E,
    0xC000_0064,
    0xC000_006A,
    STATUS_LOGON_FAILURE,
    0xC000_006E,
    0xC000_006F,
    0xC000_0070,
    0xC000_0071,
    0xC000_0072,
    0xC000_009A,
    0xC000_00AB,
    0xC000_00AC,
    0xC000_00AD,
    0xC000_00AE,
    0xC000_00B0,
    0xC000_00B1,
    0xC000_00B3,
    0xC000_00B5,
    0xC000_00BA,
    STATUS_NOT_SUPPORTED,
    0xC000_00BD,
    0xC000_00BE,
    STATUS_NETWORK_NAME_DELETED,
    0xC000_00CA,
    STATUS_BAD_NETWORK_NAME,
    0xC000_00D0,
    0xC000_00DF,
    0xC000_0103,
    0xC000_0120,
    0xC000_0121,
    0xC000_0128,
    0xC000_014B,
    0xC000_015B,
    STATUS_FS_DRIVER_REQUIRED,
    STATUS_USER_SESSION_DELETED,
    0xC000_0224,
    STATUS_NOT_FOUND,
    0xC000_0234,
    0xC000_023C,
    STATUS_PATH_NOT_COVERED,
    0xC000_0279,
    STATUS_NETWORK_SESSION_EXPIRED,
    0xC000_0380,
];

/// Messages, index-aligned with [`STATUS_CODES`].
pub const STATUS_MESSAGES: &[&str] = &[
    "The operation completed successfully.",
    "The operation that was requested is pending completion.",
    "A notify change request is being completed.",
    "A notify change request is being completed and the information is returned in the caller's buffer.",
    "A notify change request is being completed but the buffer was too small.",
    "An object with this name already exists.",
    "The data was too large to fit into the specified buffer.",
    "No more files were found which match the file specification.",
    "No more entries are available from an enumeration operation.",
    "The requested operation was unsuccessful.",
    "The requested operation is not implemented.",
    "The specified information class is invalid.",
    "Invalid access to memory location.",
    "The handle is invalid.",
    "The parameter is incorrect.",
    "The system cannot find the device specified.",
    "The system cannot find the file specified.",
    "The specified request is not a valid operation for the target device.",
    "More processing is required to complete this request.",
    "Access is denied.",
    "The data area passed to a system call is too small.",
    "The object name is invalid.",
    "The system cannot find the file specified.",
    "Cannot create a file when that file already exists.",
    "The port is disconnected.",
    "The object path is invalid.",
    "The system cannot find the path specified.",
    "The object path syntax is bad.",
    "The process cannot access the file because it is being used by another process.",
    "The file is pending deletion.",
    "There are currently no logon servers available to service the logon request.",
    "The specified user does not exist.",
    "The specified network password is not correct.",
    "Logon failure: unknown user name or bad password.",
    "Logon failure: user account restriction.",
    "Logon failure: account logon time restriction violation.",
    "Logon failure: user not allowed to log on to this computer.",
    "Logon failure: the specified account password has expired.",
    "Logon failure: account currently disabled.",
    "Insufficient system resources exist to complete the API.",
    "The requested pipe instance is not available.",
    "The pipe is not available.",
    "The pipe state is invalid.",
    "All pipe instances are busy.",
    "No process is on the other end of the pipe.",
    "The pipe is being closed.",
    "Waiting for a process to open the other end of the pipe.",
    "The I/O operation timed out.",
    "The file that was specified is a directory.",
    "The request is not supported.",
    "A duplicate name exists on the network.",
    "The network path was not found.",
    "The specified network name is no longer available.",
    "Network access is denied.",
    "The network name cannot be found.",
    "No more connections can be made to this remote computer at this time.",
    "The specified domain did not exist.",
    "The directory name is invalid.",
    "The I/O request was canceled.",
    "An attempt has been made to remove a file or directory that cannot be deleted.",
    "An I/O request other than close was performed on a file after it was closed.",
    "The pipe operation has failed because the other end of the pipe has been closed.",
    "Logon failure: the user has not been granted the requested logon type at this computer.",
    "The file system driver required for the operation is not present.",
    "The user session was deleted.",
    "User must change password before first logon.",
    "The object was not found.",
    "The referenced account is currently locked out and may not be logged on to.",
    "The network connection was aborted by the local system.",
    "The remote system is not reachable by the transport.",
    "The IO operation on the reparse point failed.",
    "The client session has expired and must re-authenticate.",
    "The smart card does not contain the requested key.",
];

/// Severity class, taken from bits 30 and 31 of the status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Success,
    Informational,
    Warning,
    Error,
}

impl Severity {
    pub fn of(code: u32) -> Self {
        match code >> 30 {
            0b00 => Severity::Success,
            0b01 => Severity::Informational,
            0b10 => Severity::Warning,
            _ => Severity::Error,
        }
    }

    pub fn is_error(self) -> bool {
        self == Severity::Error
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Success => "success",
            Severity::Informational => "informational",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        f.write_str(name)
    }
}

/// One resolved catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusEntry {
    pub code: u32,
    pub severity: Severity,
    pub message: &'static str,
    pub known: bool,
}

impl StatusEntry {
    pub fn is_error(&self) -> bool {
        self.severity.is_error()
    }
}

impl fmt::Display for StatusEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:08X})", self.message, self.code)
    }
}

/// Resolve a status code. Never fails.
pub fn lookup(code: u32) -> StatusEntry {
    let index = STATUS_CODES.iter().position(|&c| c == code);
    StatusEntry {
        code,
        severity: Severity::of(code),
        message: index
            .and_then(|i| STATUS_MESSAGES.get(i).copied())
            .unwrap_or(UNKNOWN_STATUS_MESSAGE),
        known: index.is_some(),
    }
}

pub fn severity(code: u32) -> Severity {
    Severity::of(code)
}

pub fn message(code: u32) -> &'static str {
    lookup(code).message
}

/// Namespace redirect: the path lies under a DFS link on another server.
pub fn is_redirect(code: u32) -> bool {
    code == STATUS_PATH_NOT_COVERED
}

/// Session key material expired; the logon must be redone.
pub fn is_session_expired(code: u32) -> bool {
    code == STATUS_NETWORK_SESSION_EXPIRED || code == STATUS_USER_SESSION_DELETED
}

//! SMB2 wire definitions used by the lifecycle layer

pub mod dispatch;
pub mod header;
pub mod message;
pub mod smb2_constants;
pub mod status;

pub use dispatch::RequestFlags;
pub use header::Smb2Header;
pub use message::{Operation, Request, Response, ResponseBody};
pub use status::{Severity, StatusEntry};

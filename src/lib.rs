//! SMB2/3 client connection, session and tree lifecycle
//!
//! Transports are shared and reference counted, sessions log on once and
//! re-authenticate when the server expires them, trees are cached per
//! session and DFS referrals are followed when connecting. Sessions can
//! spread requests over several channels.

#![allow(missing_docs)]
#![forbid(unsafe_code)]

pub mod auth;
pub mod client;
pub mod config;
pub mod dfs;
pub mod error;
pub mod multichannel;
pub mod netbios;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod tree;

#[cfg(test)]
pub(crate) mod test_support;

pub use client::{SmbClient, UncPath};
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use session::{SessionState, SmbSession};
pub use tree::{SmbTree, TreeType};

//! Credentials capability for SMB sessions
//!
//! The session layer only needs to refresh or renew credentials and to run
//! the logon token exchange. Mechanism internals live behind
//! [`SecurityContext`].

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Logon identity bound to a session
#[async_trait]
pub trait Credentials: Send + Sync + fmt::Debug {
    /// Printable principal, e.g. `DOMAIN\user`
    fn principal(&self) -> String;

    fn is_anonymous(&self) -> bool;

    fn is_guest(&self) -> bool;

    /// Revalidate key material in place. Fails with an authentication error
    /// when the material cannot be refreshed.
    async fn refresh(&self) -> Result<()>;

    fn is_renewable(&self) -> bool {
        false
    }

    /// Obtain fresh credentials. `None` means renewal was attempted and
    /// produced nothing usable.
    async fn renew(&self) -> Option<Arc<dyn Credentials>> {
        None
    }

    /// Start a logon exchange against `target_host`.
    fn create_context(&self, target_host: &str) -> Result<Box<dyn SecurityContext>>;
}

/// One in-progress logon token exchange
pub trait SecurityContext: Send {
    /// First token sent in SESSION_SETUP
    fn initial_token(&mut self) -> Result<Bytes>;

    /// Consume a server token. Returns the next token to send, or `None`
    /// when the exchange is complete on the client side.
    fn step(&mut self, server_token: &[u8]) -> Result<Option<Bytes>>;

    /// Session key once established
    fn session_key(&self) -> Option<Vec<u8>>;
}

/// Null session logon
#[derive(Debug, Clone, Default)]
pub struct AnonymousCredentials;

#[async_trait]
impl Credentials for AnonymousCredentials {
    fn principal(&self) -> String {
        String::new()
    }

    fn is_anonymous(&self) -> bool {
        true
    }

    fn is_guest(&self) -> bool {
        false
    }

    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    fn create_context(&self, _target_host: &str) -> Result<Box<dyn SecurityContext>> {
        Ok(Box::new(NullContext))
    }
}

/// Context that sends empty tokens
#[derive(Debug, Default)]
pub struct NullContext;

impl SecurityContext for NullContext {
    fn initial_token(&mut self) -> Result<Bytes> {
        Ok(Bytes::new())
    }

    fn step(&mut self, _server_token: &[u8]) -> Result<Option<Bytes>> {
        Ok(None)
    }

    fn session_key(&self) -> Option<Vec<u8>> {
        None
    }
}

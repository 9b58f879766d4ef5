//! Tree connections
//!
//! An [`SmbTree`] is one mounted share within a session. The session owns
//! the tree cache; a tree only keeps a weak back-reference to its session.

use crate::dfs::{is_component_prefix, normalize, Referral};
use crate::error::{Error, Result};
use crate::protocol::dispatch::RequestFlags;
use crate::protocol::message::{Operation, Request, Response, ResponseBody};
use crate::protocol::smb2_constants::{ShareCapabilities, ShareFlags, IPC_SHARE, SERVICE_WILDCARD};
use crate::session::SmbSession;
use parking_lot::Mutex;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

/// What kind of endpoint a tree mounts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeType {
    Share,
    Printer,
    Comm,
    NamedPipe,
}

impl TreeType {
    /// Classify from the share name and requested service.
    pub fn classify(share: &str, service: &str) -> Self {
        if share.eq_ignore_ascii_case(IPC_SHARE) || service.eq_ignore_ascii_case("IPC") {
            TreeType::NamedPipe
        } else if service
            .get(..3)
            .map_or(false, |prefix| prefix.eq_ignore_ascii_case("LPT"))
        {
            TreeType::Printer
        } else if service.eq_ignore_ascii_case("COMM") {
            TreeType::Comm
        } else {
            TreeType::Share
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeState {
    Disconnected,
    Connecting,
    Connected,
}

pub struct SmbTree {
    session: Weak<SmbSession>,
    /// Local id of the owning session
    session_key: u64,
    share: String,
    /// Service the tree was requested with; part of its identity
    service: String,
    tree_type: TreeType,
    trace_usage: bool,
    state: Mutex<TreeState>,
    connect_lock: tokio::sync::Mutex<()>,
    tree_id: AtomicU32,
    confirmed_service: Mutex<Option<String>>,
    share_flags: Mutex<(ShareFlags, ShareCapabilities)>,
    is_dfs: AtomicBool,
    in_domain_dfs: AtomicBool,
    usage: AtomicUsize,
    /// (normalized path, referral) pairs
    referrals: Mutex<Vec<(String, Referral)>>,
}

impl SmbTree {
    pub(crate) fn new(
        session: Weak<SmbSession>,
        session_key: u64,
        share: &str,
        service: &str,
        trace_usage: bool,
    ) -> Self {
        Self {
            session,
            session_key,
            share: share.to_string(),
            service: service.to_string(),
            tree_type: TreeType::classify(share, service),
            trace_usage,
            state: Mutex::new(TreeState::Disconnected),
            connect_lock: tokio::sync::Mutex::new(()),
            tree_id: AtomicU32::new(0),
            confirmed_service: Mutex::new(None),
            share_flags: Mutex::new((ShareFlags::empty(), ShareCapabilities::empty())),
            is_dfs: AtomicBool::new(false),
            in_domain_dfs: AtomicBool::new(false),
            usage: AtomicUsize::new(0),
            referrals: Mutex::new(Vec::new()),
        }
    }

    pub fn share(&self) -> &str {
        &self.share
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Service confirmed by the server on the last connect
    pub fn confirmed_service(&self) -> Option<String> {
        self.confirmed_service.lock().clone()
    }

    pub fn tree_type(&self) -> TreeType {
        self.tree_type
    }

    pub fn state(&self) -> TreeState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == TreeState::Connected
    }

    pub fn tree_id(&self) -> u32 {
        self.tree_id.load(Ordering::SeqCst)
    }

    pub fn share_flags(&self) -> ShareFlags {
        self.share_flags.lock().0
    }

    pub fn share_capabilities(&self) -> ShareCapabilities {
        self.share_flags.lock().1
    }

    pub fn is_dfs(&self) -> bool {
        self.is_dfs.load(Ordering::SeqCst)
    }

    pub fn session(&self) -> Option<Arc<SmbSession>> {
        self.session.upgrade()
    }

    /// Same share (case-insensitive) and the same service, or this tree
    /// was requested for any service.
    pub fn matches(&self, share: &str, service: &str) -> bool {
        self.share.eq_ignore_ascii_case(share)
            && (self.service == service || self.service == SERVICE_WILDCARD)
    }

    pub fn mark_domain_dfs(&self) {
        if !self.in_domain_dfs.swap(true, Ordering::SeqCst) {
            debug!(share = %self.share, "Tree marked as domain DFS");
        }
    }

    pub fn is_in_domain_dfs(&self) -> bool {
        self.in_domain_dfs.load(Ordering::SeqCst)
    }

    /// Connect the tree. `override_path` replaces the `\\host\share` path
    /// when connecting through a referral.
    ///
    /// SMB2 TREE_CONNECT carries no service field, so `override_service` is
    /// only logged. The stored service stays the one the tree was created
    /// with and the confirmed service comes from the server's share type.
    ///
    /// A namespace redirect comes back as [`Error::DfsRedirect`].
    pub async fn tree_connect(
        &self,
        override_path: Option<&str>,
        override_service: Option<&str>,
    ) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        let session = self.live_session()?;
        let path = match override_path {
            Some(path) => path.to_string(),
            None => format!(r"\\{}\{}", session.target_host(), self.share),
        };
        let service = override_service.unwrap_or(&self.service);

        *self.state.lock() = TreeState::Connecting;
        debug!(path = %path, service, "Connecting tree");
        let request = Request::new(Operation::TreeConnect {
            path: path.clone(),
            flags: 0,
        });
        let outcome = match session.send(&request, RequestFlags::NONE).await {
            Ok(response) => self.accept(&path, &response),
            Err(e) => Err(e),
        };
        if let Err(e) = &outcome {
            *self.state.lock() = TreeState::Disconnected;
            if e.is_redirect() {
                debug!(path = %path, "Tree connect redirected");
            } else {
                warn!(path = %path, error = %e, "Tree connect failed");
            }
        }
        outcome
    }

    fn accept(&self, path: &str, response: &Response) -> Result<()> {
        response.check(path)?;
        if !response.is_valid() {
            return Err(Error::Protocol(format!(
                "tree connect to {} returned no usable tree id",
                path
            )));
        }
        if let ResponseBody::TreeConnect(info) = response.body() {
            let dfs = info
                .share_flags
                .intersects(ShareFlags::DFS | ShareFlags::DFS_ROOT)
                || info.capabilities.contains(ShareCapabilities::DFS);
            self.is_dfs.store(dfs, Ordering::SeqCst);
            *self.share_flags.lock() = (info.share_flags, info.capabilities);
        }
        *self.confirmed_service.lock() = response.service().map(str::to_string);
        self.tree_id.store(response.tree_id(), Ordering::SeqCst);
        *self.state.lock() = TreeState::Connected;
        info!(
            path = %path,
            tree_id = response.tree_id(),
            service = ?response.service(),
            dfs = self.is_dfs(),
            "Tree connected"
        );
        Ok(())
    }

    /// Disconnect the tree. The request is skipped when `in_error` is set or
    /// the tree is not connected. Never fails.
    pub async fn tree_disconnect(&self, in_error: bool, in_use: bool) {
        let _guard = self.connect_lock.lock().await;
        if !self.is_connected() {
            return;
        }
        if in_use || self.usage_count() > 0 {
            debug!(share = %self.share, usage = self.usage_count(), "Disconnecting tree still in use");
        }
        let tree_id = self.tree_id();
        if !in_error {
            if let Some(session) = self.session.upgrade() {
                let request = Request::new(Operation::TreeDisconnect).with_tree(tree_id);
                match session.send(&request, RequestFlags::NO_RETRY).await {
                    Ok(response) => {
                        if let Err(e) = response.check(&self.share) {
                            debug!(share = %self.share, error = %e, "Tree disconnect rejected");
                        }
                    }
                    Err(e) => debug!(share = %self.share, error = %e, "Tree disconnect failed"),
                }
            }
        }
        self.invalidate();
        debug!(share = %self.share, tree_id, "Tree disconnected");
    }

    /// Forget the tree id without talking to the server.
    pub(crate) fn invalidate(&self) {
        *self.state.lock() = TreeState::Disconnected;
        self.tree_id.store(0, Ordering::SeqCst);
    }

    /// Send a tree-scoped request, connecting first if needed. A tree id
    /// invalidated by re-authentication is reconnected once.
    pub async fn send(&self, request: Request, flags: RequestFlags) -> Result<Response> {
        let mut reconnected = false;
        loop {
            self.tree_connect(None, None).await?;
            let session = self.live_session()?;
            let scoped = request
                .clone()
                .with_tree(self.tree_id())
                .with_dfs(self.is_dfs());
            match session.send(&scoped, flags).await {
                Err(Error::StaleTree(reason)) if !reconnected => {
                    debug!(share = %self.share, reason = %reason, "Reconnecting stale tree");
                    reconnected = true;
                }
                result => return result,
            }
        }
    }

    fn live_session(&self) -> Result<Arc<SmbSession>> {
        self.session.upgrade().ok_or_else(|| {
            Error::InvalidState(format!("session of tree {} is gone", self.share))
        })
    }

    pub fn usage_count(&self) -> usize {
        self.usage.load(Ordering::SeqCst)
    }

    /// Take a reference. The first one also holds the session.
    pub fn acquire(self: &Arc<Self>) -> Arc<Self> {
        let previous = self.usage.fetch_add(1, Ordering::SeqCst);
        self.log_usage("acquire", previous + 1);
        if previous == 0 {
            if let Some(session) = self.session.upgrade() {
                session.acquire();
            }
        }
        Arc::clone(self)
    }

    /// Drop a reference. Releasing the last one releases the session.
    pub fn release(&self) {
        match self
            .usage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(1) => {
                self.log_usage("release", 0);
                if let Some(session) = self.session.upgrade() {
                    session.release();
                }
            }
            Ok(previous) => self.log_usage("release", previous - 1),
            Err(_) => warn!(
                share = %self.share,
                "Tree released more often than acquired, count stays at zero"
            ),
        }
    }

    fn log_usage(&self, op: &str, count: usize) {
        if self.trace_usage {
            debug!(share = %self.share, op, count, "Tree usage");
        } else {
            trace!(share = %self.share, op, count, "Tree usage");
        }
    }

    /// Remember the referral that led to `path` on this tree.
    pub fn set_tree_referral(&self, referral: Referral, path: &str) {
        let key = normalize(path);
        let mut referrals = self.referrals.lock();
        referrals.retain(|(k, _)| !k.eq_ignore_ascii_case(&key));
        referrals.push((key, referral));
    }

    /// Referral stored for the longest path that is a component prefix of `path`.
    pub fn get_tree_referral(&self, path: &str) -> Option<Referral> {
        let path = normalize(path);
        if path.is_empty() {
            return None;
        }
        self.referrals
            .lock()
            .iter()
            .filter(|(key, _)| is_component_prefix(key, &path))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, referral)| referral.clone())
    }
}

impl PartialEq for SmbTree {
    fn eq(&self, other: &Self) -> bool {
        self.session_key == other.session_key
            && self.share.eq_ignore_ascii_case(&other.share)
            && self.service == other.service
    }
}

impl Eq for SmbTree {}

impl Hash for SmbTree {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.session_key.hash(state);
        self.share.to_ascii_uppercase().hash(state);
        self.service.hash(state);
    }
}

impl std::fmt::Debug for SmbTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmbTree")
            .field("share", &self.share)
            .field("service", &self.service)
            .field("type", &self.tree_type)
            .field("state", &self.state())
            .field("tree_id", &self.tree_id())
            .finish()
    }
}

#[cfg(test)]
mod tests;

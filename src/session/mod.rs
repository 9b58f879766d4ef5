//! Authenticated SMB sessions
//!
//! An [`SmbSession`] is one logon on a primary transport, optionally spread
//! over extra channels by the [`ChannelManager`]. It owns the cache of trees
//! connected through it and re-authenticates when the server expires it.

use crate::auth::Credentials;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::multichannel::{ChannelManager, NetworkInterfaceInfo};
use crate::protocol::dispatch::RequestFlags;
use crate::protocol::message::{Operation, Request, Response, ResponseBody, NO_FILE_ID};
use crate::protocol::smb2_constants::{
    fsctl, SessionFlags, SessionSetupFlags, IPC_SHARE, SERVICE_WILDCARD,
};
use crate::protocol::status;
use crate::transport::SmbTransport;
use crate::tree::SmbTree;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Upper bound on SESSION_SETUP round trips in one logon
const MAX_LOGON_ROUNDS: usize = 8;

/// Output buffer offered for the interface query
const MAX_INTERFACE_OUTPUT: u32 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotConnected,
    Authenticating,
    Ready,
    /// Authentication failed; the session cannot be used again
    Expired,
}

/// Result of one completed logon exchange
struct Logon {
    session_id: u64,
    flags: SessionFlags,
    key: Option<Vec<u8>>,
}

pub struct SmbSession {
    id: u64,
    target_host: String,
    config: Arc<ClientConfig>,
    credentials: RwLock<Arc<dyn Credentials>>,
    primary: RwLock<Arc<SmbTransport>>,
    /// Whether this session currently holds a reference on `primary`
    primary_held: AtomicBool,
    channels: Option<Arc<ChannelManager>>,
    state: Mutex<SessionState>,
    auth_lock: tokio::sync::Mutex<()>,
    session_id: AtomicU64,
    session_key: Mutex<Option<Vec<u8>>>,
    session_flags: Mutex<SessionFlags>,
    established: Mutex<Option<Instant>>,
    trees: Mutex<Vec<Arc<SmbTree>>>,
    usage: AtomicUsize,
}

impl SmbSession {
    /// `transport` must already be acquired; the session takes over that
    /// reference.
    pub fn new(
        target_host: impl Into<String>,
        transport: Arc<SmbTransport>,
        credentials: Arc<dyn Credentials>,
        config: Arc<ClientConfig>,
        channels: Option<Arc<ChannelManager>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            target_host: target_host.into(),
            config,
            credentials: RwLock::new(credentials),
            primary: RwLock::new(transport),
            primary_held: AtomicBool::new(true),
            channels,
            state: Mutex::new(SessionState::NotConnected),
            auth_lock: tokio::sync::Mutex::new(()),
            session_id: AtomicU64::new(0),
            session_key: Mutex::new(None),
            session_flags: Mutex::new(SessionFlags::empty()),
            established: Mutex::new(None),
            trees: Mutex::new(Vec::new()),
            usage: AtomicUsize::new(0),
        })
    }

    /// Local identity, stable across re-authentication
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target_host(&self) -> &str {
        &self.target_host
    }

    pub fn config(&self) -> &Arc<ClientConfig> {
        &self.config
    }

    /// Wire session id, zero until logged on
    pub fn session_id(&self) -> u64 {
        self.session_id.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// False once the session expired or lost its primary transport for good.
    pub fn is_usable(&self) -> bool {
        self.state() != SessionState::Expired && !self.primary_transport().is_failed()
    }

    pub fn credentials(&self) -> Arc<dyn Credentials> {
        Arc::clone(&self.credentials.read())
    }

    pub fn is_guest(&self) -> bool {
        self.session_flags.lock().contains(SessionFlags::IS_GUEST) || self.credentials().is_guest()
    }

    pub fn is_anonymous(&self) -> bool {
        self.session_flags.lock().contains(SessionFlags::IS_NULL)
            || self.credentials().is_anonymous()
    }

    pub fn has_session_key(&self) -> bool {
        self.session_key.lock().is_some()
    }

    pub fn primary_transport(&self) -> Arc<SmbTransport> {
        Arc::clone(&self.primary.read())
    }

    pub fn channel_manager(&self) -> Option<&Arc<ChannelManager>> {
        self.channels.as_ref()
    }

    pub fn tree_count(&self) -> usize {
        self.trees.lock().len()
    }

    pub fn usage_count(&self) -> usize {
        self.usage.load(Ordering::SeqCst)
    }

    /// Log on. Concurrent callers share one attempt.
    pub async fn authenticate(&self) -> Result<()> {
        let _guard = self.auth_lock.lock().await;
        match self.state() {
            SessionState::Ready => return Ok(()),
            SessionState::Expired => return Err(self.expired_error()),
            _ => {}
        }

        let transport = self.primary_transport();
        transport.connect().await?;
        self.set_state(SessionState::Authenticating);
        debug!(session = self.id, host = %self.target_host, "Authenticating");

        match self.logon(&transport, 0, None).await {
            Ok(logon) => {
                self.apply(logon);
                info!(
                    session = self.id,
                    session_id = format_args!("{:#x}", self.session_id()),
                    host = %self.target_host,
                    "Session established"
                );
                Ok(())
            }
            Err(e) => {
                self.set_state(if e.is_authentication() {
                    SessionState::Expired
                } else {
                    SessionState::NotConnected
                });
                warn!(session = self.id, error = %e, "Logon failed");
                Err(e)
            }
        }
    }

    fn expired_error(&self) -> Error {
        Error::authentication(format!(
            "session {} to {} has expired",
            self.id, self.target_host
        ))
    }

    fn apply(&self, logon: Logon) {
        self.session_id.store(logon.session_id, Ordering::SeqCst);
        *self.session_flags.lock() = logon.flags;
        *self.session_key.lock() = logon.key;
        *self.established.lock() = Some(Instant::now());
        self.set_state(SessionState::Ready);
    }

    /// Run the SESSION_SETUP exchange on `transport`. With `binding` set the
    /// exchange binds `transport` to that existing wire session.
    async fn logon(
        &self,
        transport: &Arc<SmbTransport>,
        previous_session_id: u64,
        binding: Option<u64>,
    ) -> Result<Logon> {
        let credentials = self.credentials();
        let mut context = credentials
            .create_context(&self.target_host)
            .map_err(|e| Error::authentication_caused("cannot start logon", e))?;
        let mut token = context
            .initial_token()
            .map_err(|e| Error::authentication_caused("cannot build logon token", e))?;
        let flags = match binding {
            Some(_) => SessionSetupFlags::BINDING,
            None => SessionSetupFlags::empty(),
        };
        let mut session_id = binding.unwrap_or(0);

        for round in 0..MAX_LOGON_ROUNDS {
            let request = Request::new(Operation::SessionSetup {
                flags,
                security_mode: self.config.security_mode,
                security_blob: token,
                previous_session_id,
            })
            .with_session(session_id);
            let response = transport.send(&request, RequestFlags::NONE).await?;
            session_id = response.session_id();
            let (session_flags, blob) = match response.body() {
                ResponseBody::SessionSetup {
                    session_flags,
                    security_blob,
                } => (*session_flags, security_blob.clone()),
                _ => (SessionFlags::empty(), Bytes::new()),
            };
            trace!(session = self.id, round, status = format_args!("{:#010x}", response.status()), "Logon round");

            match response.status() {
                status::STATUS_SUCCESS => {
                    if !blob.is_empty() {
                        context
                            .step(&blob)
                            .map_err(|e| Error::authentication_caused("final logon token rejected", e))?;
                    }
                    return Ok(Logon {
                        session_id,
                        flags: session_flags,
                        key: context.session_key(),
                    });
                }
                status::STATUS_MORE_PROCESSING_REQUIRED => {
                    token = context
                        .step(&blob)
                        .map_err(|e| Error::authentication_caused("logon challenge rejected", e))?
                        .ok_or_else(|| {
                            Error::authentication("server expects another logon token")
                        })?;
                }
                code => {
                    return Err(Error::authentication_caused(
                        format!("logon to {} rejected", self.target_host),
                        Error::from_status(code),
                    ))
                }
            }
        }
        Err(Error::authentication(format!(
            "logon to {} did not finish within {} rounds",
            self.target_host, MAX_LOGON_ROUNDS
        )))
    }

    /// Renew or refresh the credentials and log on again, replacing the
    /// wire session `stale_id`. Trees connected under it are invalidated.
    async fn reauthenticate(&self, stale_id: u64) -> Result<()> {
        let _guard = self.auth_lock.lock().await;
        if self.state() == SessionState::Expired {
            return Err(self.expired_error());
        }
        if self.state() == SessionState::Ready && self.session_id() != stale_id {
            // Another caller already did it
            return Ok(());
        }

        let credentials = self.credentials();
        if credentials.is_renewable() {
            match credentials.renew().await {
                Some(renewed) => *self.credentials.write() = renewed,
                None => {
                    self.set_state(SessionState::Expired);
                    return Err(Error::authentication(format!(
                        "credential renewal for {} produced no usable credentials",
                        credentials.principal()
                    )));
                }
            }
        } else if let Err(e) = credentials.refresh().await {
            self.set_state(SessionState::Expired);
            return Err(if e.is_authentication() {
                e
            } else {
                Error::authentication_caused("credential refresh failed", e)
            });
        }

        self.set_state(SessionState::Authenticating);
        for tree in self.trees.lock().iter() {
            tree.invalidate();
        }
        if let Some(manager) = &self.channels {
            // Channels were bound to the old wire session
            manager.remove_channels(self.id).await;
        }

        let transport = self.primary_transport();
        match self.logon(&transport, stale_id, None).await {
            Ok(logon) => {
                self.apply(logon);
                info!(
                    session = self.id,
                    previous = format_args!("{:#x}", stale_id),
                    session_id = format_args!("{:#x}", self.session_id()),
                    "Session re-authenticated"
                );
                Ok(())
            }
            Err(e) => {
                self.set_state(if e.is_authentication() {
                    SessionState::Expired
                } else {
                    SessionState::NotConnected
                });
                Err(e)
            }
        }
    }

    async fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            SessionState::Ready => {
                let established = *self.established.lock();
                let stale = established
                    .map(|t| t.elapsed() >= self.config.session_timeout)
                    .unwrap_or(false);
                if stale {
                    debug!(session = self.id, "Session key material expired");
                    self.reauthenticate(self.session_id()).await
                } else {
                    Ok(())
                }
            }
            SessionState::Expired => Err(self.expired_error()),
            SessionState::NotConnected | SessionState::Authenticating => {
                self.authenticate().await
            }
        }
    }

    /// Send a request in this session, authenticating first if needed.
    ///
    /// An expired-session status triggers one re-authentication. Requests
    /// without a tree are then resent; tree-scoped requests fail with
    /// [`Error::StaleTree`] so their tree can reconnect. Losing the
    /// transport a request went out on drops that channel and, when an
    /// alternative exists, retries once unless `NO_RETRY` is set.
    pub async fn send(&self, request: &Request, flags: RequestFlags) -> Result<Response> {
        let mut reauthenticated = false;
        let mut switched_channel = false;
        loop {
            self.ensure_ready().await?;
            let session_id = self.session_id();
            let mut request = request.clone();
            request.session_id = session_id;

            let transport = self.select_transport();
            match transport.send(&request, flags).await {
                Ok(response)
                    if status::is_session_expired(response.status()) && !reauthenticated =>
                {
                    warn!(
                        session = self.id,
                        status = %response.status_entry(),
                        "Server expired the session"
                    );
                    reauthenticated = true;
                    self.reauthenticate(session_id).await?;
                    if request.tree_id != 0 {
                        return Err(Error::StaleTree(format!(
                            "tree {} was connected under session {:#x}",
                            request.tree_id, session_id
                        )));
                    }
                }
                Ok(response) => return Ok(response),
                Err(e) if transport.is_failed() && !switched_channel => {
                    let alternative = self.handle_transport_failure(&transport).await;
                    if !alternative || flags.no_retry() {
                        return Err(e);
                    }
                    switched_channel = true;
                    debug!(session = self.id, error = %e, "Retrying on another channel");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn select_transport(&self) -> Arc<SmbTransport> {
        let primary = self.primary_transport();
        match &self.channels {
            Some(manager) => manager.select(self.id, &primary),
            None => primary,
        }
    }

    /// Drop a failed transport. Returns whether another usable transport
    /// remains for this session.
    async fn handle_transport_failure(&self, failed: &Arc<SmbTransport>) -> bool {
        let Some(manager) = &self.channels else {
            return false;
        };
        let primary = self.primary_transport();
        if !Arc::ptr_eq(failed, &primary) {
            manager.handle_channel_failure(self.id, failed).await;
            return primary.is_connected();
        }
        match manager.take_replacement(self.id, self.config.multi_channel.promotion) {
            Some(replacement) => {
                info!(
                    session = self.id,
                    old = primary.id(),
                    new = replacement.id(),
                    "Primary transport lost, promoted channel"
                );
                let old = std::mem::replace(&mut *self.primary.write(), replacement);
                if self.primary_held.load(Ordering::SeqCst) {
                    old.release();
                } else {
                    // The promoted channel's reference becomes the primary's
                    self.primary_held.store(true, Ordering::SeqCst);
                }
                true
            }
            None => false,
        }
    }

    /// Bind `transport` as an extra channel of this session.
    pub(crate) async fn bind_channel(&self, transport: &Arc<SmbTransport>) -> Result<()> {
        self.ensure_ready().await?;
        let session_id = self.session_id();
        self.logon(transport, 0, Some(session_id)).await?;
        debug!(session = self.id, transport = transport.id(), "Channel bound to session");
        Ok(())
    }

    /// Cached tree matching `share`/`service`, created disconnected if
    /// absent. An empty share means `IPC$`, an empty service any service.
    /// The returned tree is acquired.
    pub fn get_tree(self: &Arc<Self>, share: &str, service: &str) -> Arc<SmbTree> {
        let share = if share.is_empty() { IPC_SHARE } else { share };
        let service = if service.is_empty() {
            SERVICE_WILDCARD
        } else {
            service
        };
        let tree = {
            let mut trees = self.trees.lock();
            match trees.iter().find(|t| t.matches(share, service)) {
                Some(tree) => Arc::clone(tree),
                None => {
                    let tree = Arc::new(SmbTree::new(
                        Arc::downgrade(self),
                        self.id,
                        share,
                        service,
                        self.config.trace_resource_usage,
                    ));
                    debug!(session = self.id, share, service, "New tree");
                    trees.push(Arc::clone(&tree));
                    tree
                }
            }
        };
        tree.acquire()
    }

    /// Connected tree for `share`/`service`; the returned tree is acquired.
    pub async fn get_or_create_tree(
        self: &Arc<Self>,
        share: &str,
        service: &str,
    ) -> Result<Arc<SmbTree>> {
        let tree = self.get_tree(share, service);
        match tree.tree_connect(None, None).await {
            Ok(()) => Ok(tree),
            Err(e) => {
                tree.release();
                Err(e)
            }
        }
    }

    /// Ask the server for its network interfaces over `IPC$`.
    pub async fn query_network_interfaces(self: &Arc<Self>) -> Result<Vec<NetworkInterfaceInfo>> {
        let tree = self.get_or_create_tree(IPC_SHARE, SERVICE_WILDCARD).await?;
        let request = Request::new(Operation::Ioctl {
            ctl_code: fsctl::QUERY_NETWORK_INTERFACE_INFO,
            file_id: NO_FILE_ID,
            input: Bytes::new(),
            max_output: MAX_INTERFACE_OUTPUT,
        });
        let response = tree.send(request, RequestFlags::NONE).await;
        tree.release();
        let response = response?;
        response.check(IPC_SHARE)?;
        match response.body() {
            ResponseBody::Ioctl { output, .. } => NetworkInterfaceInfo::parse_list(output),
            _ => Err(Error::Protocol("interface query returned no IOCTL body".into())),
        }
    }

    pub fn acquire(self: &Arc<Self>) -> Arc<Self> {
        let previous = self.usage.fetch_add(1, Ordering::SeqCst);
        self.log_usage("acquire", previous + 1);
        if previous == 0 && !self.primary_held.swap(true, Ordering::SeqCst) {
            self.primary_transport().acquire();
        }
        Arc::clone(self)
    }

    /// Drop a reference. At zero the session logs off in the background
    /// and releases its primary transport, which stays open for others.
    pub fn release(self: &Arc<Self>) {
        match self
            .usage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(1) => {
                self.log_usage("release", 0);
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    debug!(session = self.id, "No runtime for session teardown");
                    return;
                };
                let session = Arc::clone(self);
                runtime.spawn(async move {
                    if session.usage_count() == 0 {
                        session.teardown().await;
                    }
                });
            }
            Ok(previous) => self.log_usage("release", previous - 1),
            Err(_) => warn!(
                session = self.id,
                "Session released more often than acquired, count stays at zero"
            ),
        }
    }

    fn log_usage(&self, op: &str, count: usize) {
        if self.config.trace_resource_usage {
            debug!(session = self.id, op, count, "Session usage");
        } else {
            trace!(session = self.id, op, count, "Session usage");
        }
    }

    async fn teardown(&self) {
        self.logoff(false).await;
        if self.usage_count() == 0 && self.primary_held.swap(false, Ordering::SeqCst) {
            self.primary_transport().release();
        }
    }

    /// Disconnect every tree, log off unless `in_error`, and drop this
    /// session's channels. Never fails.
    pub async fn logoff(&self, in_error: bool) {
        let trees: Vec<_> = self.trees.lock().clone();
        for tree in &trees {
            tree.tree_disconnect(in_error, tree.usage_count() > 0).await;
        }
        // Held trees stay cached so their next use reconnects in place
        self.trees.lock().retain(|tree| tree.usage_count() > 0);

        let _guard = self.auth_lock.lock().await;
        if self.state() == SessionState::Ready && !in_error {
            let request = Request::new(Operation::Logoff).with_session(self.session_id());
            match self.primary_transport().send(&request, RequestFlags::NO_RETRY).await {
                Ok(response) => {
                    if let Err(e) = response.check(&self.target_host) {
                        debug!(session = self.id, error = %e, "Logoff rejected");
                    }
                }
                Err(e) => debug!(session = self.id, error = %e, "Logoff failed"),
            }
        }
        if let Some(manager) = &self.channels {
            manager.remove_channels(self.id).await;
        }
        self.session_id.store(0, Ordering::SeqCst);
        *self.session_key.lock() = None;
        *self.established.lock() = None;
        {
            let mut state = self.state.lock();
            if *state != SessionState::Expired {
                *state = SessionState::NotConnected;
            }
        }
        info!(session = self.id, host = %self.target_host, trees = trees.len(), "Logged off");
    }

    /// Log off and give up the primary transport. Used when the client closes.
    pub async fn shutdown(&self) {
        self.logoff(false).await;
        if self.primary_held.swap(false, Ordering::SeqCst) {
            self.primary_transport().release();
        }
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }
}

impl std::fmt::Debug for SmbSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmbSession")
            .field("id", &self.id)
            .field("host", &self.target_host)
            .field("state", &self.state())
            .field("session_id", &self.session_id())
            .finish()
    }
}

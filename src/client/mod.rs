//! SMB client context
//!
//! [`SmbClient`] ties the layers together: it resolves hosts, shares
//! transports through the pool, keeps one session per server and connects
//! trees, following DFS referrals when a share turns out to be a namespace
//! link.

use crate::auth::Credentials;
use crate::config::ClientConfig;
use crate::dfs::{ClientReferralSource, Referral, ReferralChain, ReferralResolver, ReferralSource};
use crate::error::{Error, Result};
use crate::multichannel::{ChannelManager, ChannelStatistics};
use crate::protocol::smb2_constants::{IPC_SHARE, SERVICE_WILDCARD};
use crate::session::SmbSession;
use crate::transport::{Connector, TcpConnector, TransportPool};
use crate::tree::SmbTree;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// `\\host\share\path`, `//host/share/path` or `smb://host/share/path`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UncPath {
    pub host: String,
    pub share: String,
    /// Below the share, backslash separated, no leading separator
    pub path: String,
}

impl UncPath {
    pub fn parse(input: &str) -> Result<Self> {
        let scheme = input
            .get(..6)
            .map_or(false, |head| head.eq_ignore_ascii_case("smb://"));
        let rest = if scheme {
            &input[6..]
        } else if let Some(rest) = input
            .strip_prefix(r"\\")
            .or_else(|| input.strip_prefix("//"))
        {
            rest
        } else {
            return Err(Error::InvalidParameter(format!(
                "{:?} is not a UNC path",
                input
            )));
        };
        let mut parts = rest.split(['\\', '/']).filter(|c| !c.is_empty());
        let host = parts
            .next()
            .ok_or_else(|| Error::InvalidParameter(format!("{:?} names no host", input)))?;
        let share = parts.next().unwrap_or(IPC_SHARE);
        let path = parts.collect::<Vec<_>>().join("\\");
        Ok(Self {
            host: host.to_string(),
            share: share.to_string(),
            path,
        })
    }

    /// Path in the form referral servers expect: `\host\share[\path]`
    pub fn dfs_path(&self) -> String {
        let mut out = format!(r"\{}\{}", self.host, self.share);
        if !self.path.is_empty() {
            out.push('\\');
            out.push_str(&self.path);
        }
        out
    }
}

impl fmt::Display for UncPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, r"\{}", self.dfs_path())
    }
}

/// Snapshot of what the client holds open
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStatistics {
    pub sessions: usize,
    pub transports: usize,
    pub cached_referrals: usize,
    pub channels: Option<ChannelStatistics>,
}

impl fmt::Display for ClientStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sessions={} transports={} referrals={}",
            self.sessions, self.transports, self.cached_referrals
        )?;
        if let Some(channels) = &self.channels {
            write!(f, " {}", channels)?;
        }
        Ok(())
    }
}

/// Where a tree connect stands while referrals are followed
enum ConnectState {
    Idle,
    Connecting {
        host: String,
        share: String,
        referral: Option<Referral>,
    },
    Redirected {
        path: String,
    },
    Connected(Arc<SmbTree>),
    Failed(Error),
}

pub struct SmbClient {
    config: Arc<ClientConfig>,
    credentials: Arc<dyn Credentials>,
    pool: TransportPool,
    channels: Option<Arc<ChannelManager>>,
    sessions: Mutex<Vec<Arc<SmbSession>>>,
    resolver: ReferralResolver,
    static_hosts: Mutex<HashMap<String, Vec<IpAddr>>>,
    closed: AtomicBool,
}

impl SmbClient {
    /// Client whose referrals are fetched over its own `IPC$` trees.
    pub fn new(
        config: ClientConfig,
        credentials: Arc<dyn Credentials>,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let source: Arc<dyn ReferralSource> = Arc::new(ClientReferralSource::new(weak.clone()));
            Self::build(config, credentials, connector, source)
        })
    }

    /// Client over plain TCP.
    pub fn tcp(config: ClientConfig, credentials: Arc<dyn Credentials>) -> Arc<Self> {
        Self::new(config, credentials, Arc::new(TcpConnector::new()))
    }

    /// Client with an external referral source.
    pub fn with_referral_source(
        config: ClientConfig,
        credentials: Arc<dyn Credentials>,
        connector: Arc<dyn Connector>,
        source: Arc<dyn ReferralSource>,
    ) -> Arc<Self> {
        Arc::new(Self::build(config, credentials, connector, source))
    }

    fn build(
        config: ClientConfig,
        credentials: Arc<dyn Credentials>,
        connector: Arc<dyn Connector>,
        source: Arc<dyn ReferralSource>,
    ) -> Self {
        let config = Arc::new(config);
        let channels = config.multi_channel.enabled.then(|| {
            let manager = ChannelManager::new(Arc::clone(&config), Arc::clone(&connector));
            manager.start_health_monitor();
            manager
        });
        Self {
            resolver: ReferralResolver::new(config.dfs.clone(), source),
            pool: TransportPool::new(Arc::clone(&config), connector),
            config,
            credentials,
            channels,
            sessions: Mutex::new(Vec::new()),
            static_hosts: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Arc<ClientConfig> {
        &self.config
    }

    pub fn pool(&self) -> &TransportPool {
        &self.pool
    }

    pub fn channel_manager(&self) -> Option<&Arc<ChannelManager>> {
        self.channels.as_ref()
    }

    pub fn referrals(&self) -> &ReferralResolver {
        &self.resolver
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Pin `host` to fixed addresses instead of asking the system resolver.
    pub fn add_static_host(&self, host: &str, addrs: Vec<IpAddr>) {
        self.static_hosts
            .lock()
            .insert(host.to_ascii_lowercase(), addrs);
    }

    async fn resolve_host(&self, host: &str) -> Result<Vec<SocketAddr>> {
        let port = self.config.port;
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }
        let pinned = self
            .static_hosts
            .lock()
            .get(&host.to_ascii_lowercase())
            .cloned();
        if let Some(ips) = pinned {
            return Ok(ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect());
        }
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| Error::connection_caused(format!("cannot resolve {}", host), e.into()))?
            .collect();
        debug!(host, count = addrs.len(), "Resolved host");
        Ok(addrs)
    }

    /// Authenticated session to `host`, shared with other callers. The
    /// returned session is acquired; release it when done.
    pub async fn session_for(&self, host: &str) -> Result<Arc<SmbSession>> {
        if self.is_closed() {
            return Err(Error::InvalidState("client is closed".into()));
        }
        if let Some(session) = self.find_session(host) {
            return match session.authenticate().await {
                Ok(()) => Ok(session),
                Err(e) => {
                    session.release();
                    Err(e)
                }
            };
        }

        let addrs = self.resolve_host(host).await?;
        let transport = self.pool.connect(host, &addrs, None, false).await?;
        let (session, created) = {
            let mut sessions = self.sessions.lock();
            match sessions
                .iter()
                .find(|s| s.target_host().eq_ignore_ascii_case(host) && s.is_usable())
            {
                Some(existing) => {
                    // Lost the race to another caller
                    transport.release();
                    (existing.acquire(), false)
                }
                None => {
                    let session = SmbSession::new(
                        host,
                        transport,
                        Arc::clone(&self.credentials),
                        Arc::clone(&self.config),
                        self.channels.clone(),
                    );
                    sessions.push(Arc::clone(&session));
                    (session.acquire(), true)
                }
            }
        };

        if let Err(e) = session.authenticate().await {
            session.release();
            return Err(e);
        }
        if created {
            if let Err(e) = self.prepare(&session).await {
                session.release();
                return Err(e);
            }
        }
        Ok(session)
    }

    /// Cached usable session to `host`, acquired. Unusable sessions are
    /// dropped and shut down in the background.
    fn find_session(&self, host: &str) -> Option<Arc<SmbSession>> {
        let (found, dead) = {
            let mut sessions = self.sessions.lock();
            let (live, dead): (Vec<_>, Vec<_>) =
                sessions.drain(..).partition(|s| s.is_usable());
            *sessions = live;
            let found = sessions
                .iter()
                .find(|s| s.target_host().eq_ignore_ascii_case(host))
                .map(|s| s.acquire());
            (found, dead)
        };
        if !dead.is_empty() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                for session in dead {
                    debug!(session = session.id(), "Dropping unusable session");
                    runtime.spawn(async move { session.shutdown().await });
                }
            }
        }
        found
    }

    /// Bind extra channels and connect the logon share of a new session.
    async fn prepare(&self, session: &Arc<SmbSession>) -> Result<()> {
        if let Some(manager) = &self.channels {
            match manager.establish_channels(session).await {
                Ok(0) => {}
                Ok(count) => info!(session = session.id(), count, "Channels established"),
                Err(e) => warn!(session = session.id(), error = %e, "Could not establish channels"),
            }
        }
        if let Some(share) = &self.config.logon_share {
            let tree = session.get_or_create_tree(share, SERVICE_WILDCARD).await?;
            tree.release();
        }
        Ok(())
    }

    /// Connect the tree named by `unc`, following referrals.
    ///
    /// Referral targets are tried in order; when every target fails the
    /// last error is returned and the cached referral is dropped. The
    /// returned tree is acquired.
    pub async fn connect_tree(&self, unc: &str) -> Result<Arc<SmbTree>> {
        let unc = UncPath::parse(unc)?;
        let original = unc.dfs_path();
        let max_redirects = self.config.dfs.max_redirects;
        let mut redirects = 0usize;
        let mut candidates: VecDeque<Referral> = VecDeque::new();
        let mut chain_path: Option<String> = None;
        let mut state = ConnectState::Idle;

        loop {
            state = match state {
                ConnectState::Idle => ConnectState::Connecting {
                    host: unc.host.clone(),
                    share: unc.share.clone(),
                    referral: None,
                },
                ConnectState::Connecting {
                    host,
                    share,
                    referral,
                } => match self.try_connect(&host, &share).await {
                    Ok(tree) => {
                        if let Some(referral) = referral {
                            if referral.domain.is_some() {
                                tree.mark_domain_dfs();
                            }
                            tree.set_tree_referral(referral, &original);
                        }
                        ConnectState::Connected(tree)
                    }
                    Err(Error::DfsRedirect { .. }) => {
                        redirects += 1;
                        if redirects > max_redirects {
                            ConnectState::Failed(Error::NoReferral(format!(
                                "{} exceeded {} redirects",
                                unc, max_redirects
                            )))
                        } else {
                            let path = match &referral {
                                Some(referral) => referral.resolve_path(&original),
                                None => original.clone(),
                            };
                            debug!(path = %path, redirects, "Following redirect");
                            ConnectState::Redirected { path }
                        }
                    }
                    Err(e) => match candidates.pop_front() {
                        Some(next) => {
                            warn!(
                                failed = %referral.map(|r| r.target()).unwrap_or_default(),
                                error = %e,
                                next = %next.target(),
                                "Referral target failed, trying next"
                            );
                            Self::connecting(next)
                        }
                        None => {
                            if let Some(path) = &chain_path {
                                self.resolver.invalidate(path);
                            }
                            ConnectState::Failed(e)
                        }
                    },
                },
                ConnectState::Redirected { path } => match self.resolver.resolve(&path).await {
                    Ok(chain) => {
                        candidates = Self::candidates(&chain);
                        chain_path = Some(path);
                        match candidates.pop_front() {
                            Some(first) => Self::connecting(first),
                            None => ConnectState::Failed(Error::NoReferral(unc.to_string())),
                        }
                    }
                    Err(e) => ConnectState::Failed(e),
                },
                ConnectState::Connected(tree) => {
                    debug!(unc = %unc, tree_id = tree.tree_id(), redirects, "Tree ready");
                    return Ok(tree);
                }
                ConnectState::Failed(e) => {
                    warn!(unc = %unc, error = %e, "Tree connect failed");
                    return Err(e);
                }
            };
        }
    }

    fn candidates(chain: &ReferralChain) -> VecDeque<Referral> {
        chain.iter().cloned().collect()
    }

    fn connecting(referral: Referral) -> ConnectState {
        ConnectState::Connecting {
            host: referral.server.clone(),
            share: referral.share.clone(),
            referral: Some(referral),
        }
    }

    async fn try_connect(&self, host: &str, share: &str) -> Result<Arc<SmbTree>> {
        let session = self.session_for(host).await?;
        let tree = session.get_or_create_tree(share, SERVICE_WILDCARD).await;
        // A connected tree holds its session itself
        session.release();
        tree
    }

    /// Resolve the referral chain for `unc` without connecting.
    pub async fn resolve(&self, unc: &str) -> Result<ReferralChain> {
        let unc = UncPath::parse(unc)?;
        self.resolver.resolve(&unc.dfs_path()).await
    }

    pub fn statistics(&self) -> ClientStatistics {
        ClientStatistics {
            sessions: self.sessions.lock().len(),
            transports: self.pool.len(),
            cached_referrals: self.resolver.cached_len(),
            channels: self.channels.as_ref().map(|m| m.statistics()),
        }
    }

    /// Log off every session and close every transport. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let sessions: Vec<_> = self.sessions.lock().drain(..).collect();
        info!(sessions = sessions.len(), "Closing client");
        for session in sessions {
            session.shutdown().await;
        }
        if let Some(manager) = &self.channels {
            manager.shutdown().await;
        }
        self.pool.close().await;
        self.resolver.clear();
    }
}

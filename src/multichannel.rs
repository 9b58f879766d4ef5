//! SMB 3.x multi-channel support
//!
//! [`ChannelManager`] opens extra transports to the same server, binds them
//! to an existing session and picks a transport for each outbound request.
//! A failed channel leaves the rotation for good; promoting a channel to
//! primary is up to the session.

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::protocol::smb2_constants::Smb2Capabilities;
use crate::session::SmbSession;
use crate::transport::{Connector, Endpoint, SmbTransport};
use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How requests are spread over a session's channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalancing {
    RoundRobin,
    LeastOutstanding,
    Random,
    /// Primary only while it is healthy
    FailoverOnly,
}

impl FromStr for LoadBalancing {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match squash(s).as_str() {
            "roundrobin" => Ok(Self::RoundRobin),
            "leastoutstanding" | "leastloaded" => Ok(Self::LeastOutstanding),
            "random" => Ok(Self::Random),
            "failoveronly" | "failover" => Ok(Self::FailoverOnly),
            _ => Err(Error::InvalidParameter(format!(
                "unknown load balancing strategy {:?}",
                s
            ))),
        }
    }
}

/// Which channel replaces a lost primary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionPolicy {
    FirstCreated,
    LeastOutstanding,
}

impl FromStr for PromotionPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match squash(s).as_str() {
            "firstcreated" | "oldest" => Ok(Self::FirstCreated),
            "leastoutstanding" => Ok(Self::LeastOutstanding),
            _ => Err(Error::InvalidParameter(format!(
                "unknown promotion policy {:?}",
                s
            ))),
        }
    }
}

fn squash(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .collect::<String>()
        .to_ascii_lowercase()
}

/// A secondary channel bound to a session
pub struct ChannelInfo {
    pub id: u64,
    pub transport: Arc<SmbTransport>,
    pub local: Option<IpAddr>,
    pub remote: SocketAddr,
    pub created: Instant,
    requests: AtomicU64,
}

impl ChannelInfo {
    pub fn is_healthy(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for ChannelInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelInfo")
            .field("id", &self.id)
            .field("transport", &self.transport.id())
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

/// Consistent snapshot of channel counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStatistics {
    pub active_sessions: usize,
    pub total_channels: usize,
    pub total_requests: u64,
    pub total_channels_created: u64,
}

impl fmt::Display for ChannelStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sessions={} channels={} requests={} created={}",
            self.active_sessions,
            self.total_channels,
            self.total_requests,
            self.total_channels_created
        )
    }
}

#[derive(Default)]
struct SessionChannels {
    channels: Vec<Arc<ChannelInfo>>,
    cursor: usize,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<u64, SessionChannels>,
    total_requests: u64,
    total_channels_created: u64,
}

pub struct ChannelManager {
    config: Arc<ClientConfig>,
    connector: Arc<dyn Connector>,
    inner: Mutex<Inner>,
    next_channel_id: AtomicU64,
    shut_down: AtomicBool,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelManager {
    pub fn new(config: Arc<ClientConfig>, connector: Arc<dyn Connector>) -> Arc<Self> {
        Arc::new(Self {
            config,
            connector,
            inner: Mutex::new(Inner::default()),
            next_channel_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
            monitor: Mutex::new(None),
        })
    }

    /// Open a channel from `local` to `remote` and bind it to `session`.
    ///
    /// A missing remote defaults to the session's server. Every failure is
    /// reported as a connection error wrapping the cause.
    pub async fn create_channel(
        &self,
        local: Option<IpAddr>,
        remote: Option<SocketAddr>,
        session: &Arc<SmbSession>,
    ) -> Result<Arc<ChannelInfo>> {
        self.try_create_channel(local, remote, session)
            .await
            .map_err(|e| Error::connection_caused("Failed to create multi-channel transport", e))
    }

    async fn try_create_channel(
        &self,
        local: Option<IpAddr>,
        remote: Option<SocketAddr>,
        session: &Arc<SmbSession>,
    ) -> Result<Arc<ChannelInfo>> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(Error::InvalidState("channel manager is shut down".into()));
        }
        let remote = match (local, remote) {
            (None, None) => {
                return Err(Error::InvalidParameter(
                    "neither local nor remote address given".into(),
                ))
            }
            (_, Some(remote)) => remote,
            (Some(_), None) => session.primary_transport().endpoint().addr,
        };
        if self.channel_count(session.id()) >= self.config.multi_channel.max_channels {
            return Err(self.limit_reached(session.id()));
        }

        let transport = self
            .create_channel_transport(session.target_host(), remote, local)
            .await?;
        if let Err(e) = session.bind_channel(&transport).await {
            transport.release();
            transport.close().await;
            return Err(e);
        }

        let channel = Arc::new(ChannelInfo {
            id: self.next_channel_id.fetch_add(1, Ordering::SeqCst),
            transport,
            local,
            remote,
            created: Instant::now(),
            requests: AtomicU64::new(0),
        });
        // Concurrent creations may have filled the session while connecting
        let added = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let channels = &mut inner.sessions.entry(session.id()).or_default().channels;
            if channels.len() >= self.config.multi_channel.max_channels {
                false
            } else {
                channels.push(Arc::clone(&channel));
                inner.total_channels_created += 1;
                true
            }
        };
        if !added {
            channel.transport.release();
            channel.transport.close().await;
            return Err(self.limit_reached(session.id()));
        }
        info!(
            session = session.id(),
            channel = channel.id,
            remote = %remote,
            local = ?local,
            "Channel bound"
        );
        Ok(channel)
    }

    fn limit_reached(&self, session_id: u64) -> Error {
        Error::InvalidState(format!(
            "session {} already has {} channels",
            session_id, self.config.multi_channel.max_channels
        ))
    }

    /// Connect an exclusive transport and check that it can carry a channel.
    pub(crate) async fn create_channel_transport(
        &self,
        host: &str,
        remote: SocketAddr,
        local: Option<IpAddr>,
    ) -> Result<Arc<SmbTransport>> {
        let transport = SmbTransport::new(
            Endpoint::new(host, remote),
            local,
            Arc::clone(&self.config),
            Arc::clone(&self.connector),
        )
        .acquire();
        if let Err(e) = transport.connect().await {
            transport.release();
            return Err(e);
        }
        if !transport.is_modern_dialect()
            || !transport.has_capability(Smb2Capabilities::MULTI_CHANNEL)
        {
            transport.release();
            transport.close().await;
            return Err(Error::connection(
                "Server does not support SMB multi-channel capability",
            ));
        }
        Ok(transport)
    }

    pub fn channel_count(&self, session_id: u64) -> usize {
        self.inner
            .lock()
            .sessions
            .get(&session_id)
            .map_or(0, |s| s.channels.len())
    }

    pub fn channels(&self, session_id: u64) -> Vec<Arc<ChannelInfo>> {
        self.inner
            .lock()
            .sessions
            .get(&session_id)
            .map(|s| s.channels.clone())
            .unwrap_or_default()
    }

    /// Transport for the next request of `session_id`.
    pub fn select(&self, session_id: u64, primary: &Arc<SmbTransport>) -> Arc<SmbTransport> {
        let strategy = self.config.multi_channel.load_balancing;
        let mut inner = self.inner.lock();
        inner.total_requests += 1;
        let Some(entry) = inner.sessions.get_mut(&session_id) else {
            return Arc::clone(primary);
        };
        let healthy: Vec<&Arc<ChannelInfo>> =
            entry.channels.iter().filter(|c| c.is_healthy()).collect();
        if healthy.is_empty() {
            return Arc::clone(primary);
        }

        // Slot 0 is the primary when it is usable
        let primary_ok = primary.is_connected();
        let offset = usize::from(primary_ok);
        let slots = healthy.len() + offset;
        let slot = match strategy {
            LoadBalancing::FailoverOnly => 0,
            LoadBalancing::RoundRobin => {
                let slot = entry.cursor % slots;
                entry.cursor = entry.cursor.wrapping_add(1);
                slot
            }
            LoadBalancing::Random => rand::thread_rng().gen_range(0..slots),
            LoadBalancing::LeastOutstanding => {
                let load = |slot: usize| {
                    if primary_ok && slot == 0 {
                        primary.in_flight()
                    } else {
                        healthy[slot - offset].transport.in_flight()
                    }
                };
                (0..slots).min_by_key(|s| load(*s)).unwrap_or(0)
            }
        };
        if primary_ok && slot == 0 {
            return Arc::clone(primary);
        }
        let channel = healthy[slot - offset];
        channel.requests.fetch_add(1, Ordering::Relaxed);
        Arc::clone(&channel.transport)
    }

    /// Drop the channel carried by `transport` from rotation.
    pub async fn handle_channel_failure(&self, session_id: u64, transport: &Arc<SmbTransport>) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.sessions.get_mut(&session_id) else {
                return false;
            };
            let position = entry
                .channels
                .iter()
                .position(|c| Arc::ptr_eq(&c.transport, transport));
            let removed = position.map(|p| entry.channels.remove(p));
            if entry.channels.is_empty() {
                inner.sessions.remove(&session_id);
            }
            removed
        };
        match removed {
            Some(channel) => {
                warn!(session = session_id, channel = channel.id, "Channel failed, removed from rotation");
                channel.transport.release();
                channel.transport.close().await;
                true
            }
            None => false,
        }
    }

    /// Detach a healthy channel to become the new primary of `session_id`.
    /// The returned transport keeps the channel's reference.
    pub fn take_replacement(
        &self,
        session_id: u64,
        policy: PromotionPolicy,
    ) -> Option<Arc<SmbTransport>> {
        let mut inner = self.inner.lock();
        let entry = inner.sessions.get_mut(&session_id)?;
        let candidates = entry
            .channels
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_healthy());
        let chosen = match policy {
            PromotionPolicy::FirstCreated => candidates.min_by_key(|(_, c)| c.id),
            PromotionPolicy::LeastOutstanding => {
                candidates.min_by_key(|(_, c)| (c.transport.in_flight(), c.id))
            }
        }
        .map(|(index, _)| index)?;
        let channel = entry.channels.remove(chosen);
        if entry.channels.is_empty() {
            inner.sessions.remove(&session_id);
        }
        info!(session = session_id, channel = channel.id, "Promoting channel to primary");
        Some(Arc::clone(&channel.transport))
    }

    /// Close and forget every channel of `session_id`.
    pub async fn remove_channels(&self, session_id: u64) {
        let removed = self.inner.lock().sessions.remove(&session_id);
        if let Some(entry) = removed {
            debug!(session = session_id, count = entry.channels.len(), "Removing channels");
            for channel in entry.channels {
                channel.transport.release();
                channel.transport.close().await;
            }
        }
    }

    /// Drop channels whose transport failed. Returns how many went.
    pub fn prune_failed(&self) -> usize {
        let mut pruned = Vec::new();
        {
            let mut inner = self.inner.lock();
            for (session_id, entry) in inner.sessions.iter_mut() {
                entry.channels.retain(|c| {
                    let failed = c.transport.is_failed();
                    if failed {
                        pruned.push((*session_id, Arc::clone(c)));
                    }
                    !failed
                });
            }
            inner.sessions.retain(|_, entry| !entry.channels.is_empty());
        }
        for (session_id, channel) in &pruned {
            warn!(session = session_id, channel = channel.id, "Pruned failed channel");
            channel.transport.release();
        }
        pruned.len()
    }

    /// Periodically prune failed channels until shutdown.
    pub fn start_health_monitor(self: &Arc<Self>) {
        let interval = self.config.multi_channel.health_check_interval;
        if interval.is_zero() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime for the channel health monitor");
            return;
        };
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                if manager.shut_down.load(Ordering::SeqCst) {
                    break;
                }
                manager.prune_failed();
            }
        });
        if let Some(previous) = self.monitor.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Bind channels to the interfaces the server advertises, up to the
    /// configured limit. Returns how many were created.
    pub async fn establish_channels(&self, session: &Arc<SmbSession>) -> Result<usize> {
        if !self.config.multi_channel.enabled {
            return Ok(0);
        }
        let primary = session.primary_transport();
        if !primary.is_modern_dialect() || !primary.has_capability(Smb2Capabilities::MULTI_CHANNEL) {
            debug!(session = session.id(), "Server does not offer multi-channel");
            return Ok(0);
        }
        let mut interfaces = session.query_network_interfaces().await?;
        interfaces.sort_by(|a, b| b.link_speed.cmp(&a.link_speed));

        let primary_addr = primary.endpoint().addr;
        let port = primary_addr.port();
        let mut created = 0;
        for interface in interfaces
            .iter()
            .filter(|i| i.address.ip() != primary_addr.ip())
        {
            if self.channel_count(session.id()) >= self.config.multi_channel.max_channels {
                break;
            }
            let remote = SocketAddr::new(interface.address.ip(), port);
            match self.create_channel(None, Some(remote), session).await {
                Ok(_) => created += 1,
                Err(e) => warn!(remote = %remote, error = %e, "Could not bind channel"),
            }
        }
        Ok(created)
    }

    pub fn statistics(&self) -> ChannelStatistics {
        let inner = self.inner.lock();
        ChannelStatistics {
            active_sessions: inner.sessions.len(),
            total_channels: inner.sessions.values().map(|s| s.channels.len()).sum(),
            total_requests: inner.total_requests,
            total_channels_created: inner.total_channels_created,
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Close every channel of every session. Never fails; idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }
        let sessions: Vec<_> = self.inner.lock().sessions.drain().collect();
        let count: usize = sessions.iter().map(|(_, s)| s.channels.len()).sum();
        info!(channels = count, "Shutting down channel manager");
        for (_, entry) in sessions {
            for channel in entry.channels {
                channel.transport.release();
                channel.transport.close().await;
            }
        }
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.get_mut().take() {
            monitor.abort();
        }
    }
}

bitflags! {
    /// NETWORK_INTERFACE_INFO capability bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InterfaceCapabilities: u32 {
        const RSS = 0x0000_0001;
        const RDMA = 0x0000_0002;
    }
}

/// One server interface from FSCTL_QUERY_NETWORK_INTERFACE_INFO
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterfaceInfo {
    pub if_index: u32,
    pub capabilities: InterfaceCapabilities,
    /// Bits per second
    pub link_speed: u64,
    pub address: SocketAddr,
}

impl NetworkInterfaceInfo {
    /// Fixed size of one entry on the wire
    pub const ENTRY_SIZE: usize = 152;

    const AF_INET: u16 = 0x0002;
    const AF_INET6: u16 = 0x0017;

    /// Decode the chained entries of an interface query response.
    /// Entries with an unknown address family are skipped.
    pub fn parse_list(buf: &[u8]) -> Result<Vec<Self>> {
        let mut interfaces = Vec::new();
        let mut offset = 0usize;
        loop {
            if offset + Self::ENTRY_SIZE > buf.len() {
                return Err(Error::BufferTooSmall {
                    need: offset + Self::ENTRY_SIZE,
                    have: buf.len(),
                });
            }
            let entry = &buf[offset..offset + Self::ENTRY_SIZE];
            let next = LittleEndian::read_u32(&entry[0..4]) as usize;
            if let Some(info) = Self::parse_entry(entry) {
                interfaces.push(info);
            }
            if next == 0 {
                break;
            }
            offset += next;
        }
        Ok(interfaces)
    }

    fn parse_entry(entry: &[u8]) -> Option<Self> {
        let sockaddr = &entry[24..];
        let port = u16::from_be_bytes([sockaddr[2], sockaddr[3]]);
        let ip = match LittleEndian::read_u16(&sockaddr[0..2]) {
            Self::AF_INET => IpAddr::V4(Ipv4Addr::new(
                sockaddr[4],
                sockaddr[5],
                sockaddr[6],
                sockaddr[7],
            )),
            Self::AF_INET6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&sockaddr[8..24]);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => return None,
        };
        Some(Self {
            if_index: LittleEndian::read_u32(&entry[4..8]),
            capabilities: InterfaceCapabilities::from_bits_truncate(LittleEndian::read_u32(
                &entry[8..12],
            )),
            link_speed: LittleEndian::read_u64(&entry[16..24]),
            address: SocketAddr::new(ip, port),
        })
    }
}

//! Transport pool
//!
//! Shares one transport per (remote address, local address) pair unless a
//! caller asks for an exclusive one. Failed transports are evicted on lookup
//! and never handed out again.

use super::{Connector, Endpoint, SmbTransport};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct TransportPool {
    config: Arc<ClientConfig>,
    connector: Arc<dyn Connector>,
    transports: Mutex<Vec<Arc<SmbTransport>>>,
    /// Connect failures per remote address, used to order failover candidates
    fail_counts: Mutex<HashMap<SocketAddr, u32>>,
    closed: AtomicBool,
}

impl TransportPool {
    pub fn new(config: Arc<ClientConfig>, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            transports: Mutex::new(Vec::new()),
            fail_counts: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Arc<ClientConfig> {
        &self.config
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::clone(&self.connector)
    }

    /// Acquired transport for `endpoint`, not necessarily connected yet.
    pub fn get_transport(
        &self,
        endpoint: &Endpoint,
        local: Option<IpAddr>,
        exclusive: bool,
    ) -> Result<Arc<SmbTransport>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::InvalidState("transport pool is closed".into()));
        }
        let mut transports = self.transports.lock();
        transports.retain(|t| {
            let keep = !t.is_failed();
            if !keep {
                debug!(transport = t.id(), endpoint = %t.endpoint(), "Evicting failed transport");
            }
            keep
        });

        if !exclusive {
            if let Some(existing) = transports
                .iter()
                .find(|t| t.endpoint().addr == endpoint.addr && t.local_addr() == local)
            {
                return Ok(existing.acquire());
            }
        }

        let transport = SmbTransport::new(
            endpoint.clone(),
            local,
            Arc::clone(&self.config),
            Arc::clone(&self.connector),
        );
        debug!(
            transport = transport.id(),
            endpoint = %endpoint,
            exclusive,
            "Created transport"
        );
        transports.push(Arc::clone(&transport));
        Ok(transport.acquire())
    }

    /// Connect to `host` trying each address in turn, least failed first.
    ///
    /// Returns an acquired, connected transport or the last connect error.
    pub async fn connect(
        &self,
        host: &str,
        addrs: &[SocketAddr],
        local: Option<IpAddr>,
        exclusive: bool,
    ) -> Result<Arc<SmbTransport>> {
        if addrs.is_empty() {
            return Err(Error::connection(format!("no addresses for {}", host)));
        }
        let mut candidates = addrs.to_vec();
        {
            let counts = self.fail_counts.lock();
            candidates.sort_by_key(|a| counts.get(a).copied().unwrap_or(0));
        }

        let mut last_error = None;
        for addr in candidates {
            let endpoint = Endpoint::new(host, addr);
            let transport = self.get_transport(&endpoint, local, exclusive)?;
            match transport.connect().await {
                Ok(()) => {
                    self.fail_counts.lock().remove(&addr);
                    return Ok(transport);
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "Connect failed, trying next address");
                    *self.fail_counts.lock().entry(addr).or_insert(0) += 1;
                    transport.release();
                    self.remove(&transport);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::connection(format!("cannot reach {}", host))))
    }

    /// Forget `transport`; it stays usable for whoever still holds it.
    pub fn remove(&self, transport: &Arc<SmbTransport>) {
        self.transports
            .lock()
            .retain(|t| !Arc::ptr_eq(t, transport));
    }

    pub fn fail_count(&self, addr: &SocketAddr) -> u32 {
        self.fail_counts.lock().get(addr).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.transports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close every pooled transport. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let transports: Vec<_> = self.transports.lock().drain(..).collect();
        info!(count = transports.len(), "Closing transport pool");
        for transport in transports {
            transport.close().await;
        }
    }
}

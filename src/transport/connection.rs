//! Reference-counted SMB transport
//!
//! One physical connection to one endpoint. `connect()` opens the link and
//! negotiates; `send()` multiplexes requests over it and correlates responses
//! by message id. I/O failures move the transport to `Failed` for good.

use super::mux::ResponseTable;
use super::{Connector, Endpoint, FrameReader, FrameWriter};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::protocol::dispatch::RequestFlags;
use crate::protocol::header::Smb2Header;
use crate::protocol::message::{NegotiateInfo, Operation, Request, Response, ResponseBody};
use crate::protocol::smb2_constants::{Smb2Capabilities, Smb2Dialect};
use crate::protocol::status::{self, STATUS_PENDING};
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// Transport lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

pub struct SmbTransport {
    id: u64,
    endpoint: Endpoint,
    local_addr: Option<IpAddr>,
    config: Arc<ClientConfig>,
    connector: Arc<dyn Connector>,
    state: Mutex<TransportState>,
    failure: Mutex<Option<String>>,
    connect_lock: tokio::sync::Mutex<()>,
    writer: tokio::sync::Mutex<Option<Box<dyn FrameWriter>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    negotiated: Mutex<Option<NegotiateInfo>>,
    bound_addr: Mutex<Option<SocketAddr>>,
    responses: Arc<ResponseTable>,
    next_message_id: AtomicU64,
    /// Bumped per link; stale receive loops compare against it
    generation: AtomicU64,
    usage: AtomicUsize,
    /// Bumped by acquire/connect to cancel a pending idle close
    idle_epoch: AtomicU64,
}

impl SmbTransport {
    pub fn new(
        endpoint: Endpoint,
        local_addr: Option<IpAddr>,
        config: Arc<ClientConfig>,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed),
            endpoint,
            local_addr,
            config,
            connector,
            state: Mutex::new(TransportState::Disconnected),
            failure: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            negotiated: Mutex::new(None),
            bound_addr: Mutex::new(None),
            responses: ResponseTable::new(),
            next_message_id: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            usage: AtomicUsize::new(0),
            idle_epoch: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Requested local address
    pub fn local_addr(&self) -> Option<IpAddr> {
        self.local_addr
    }

    /// Local socket address of the current link
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock()
    }

    pub fn state(&self) -> TransportState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }

    pub fn is_failed(&self) -> bool {
        self.state() == TransportState::Failed
    }

    pub fn negotiated(&self) -> Option<NegotiateInfo> {
        self.negotiated.lock().clone()
    }

    pub fn dialect(&self) -> Option<Smb2Dialect> {
        self.negotiated.lock().as_ref().map(|n| n.dialect)
    }

    /// True when an SMB 3.x dialect was negotiated.
    pub fn is_modern_dialect(&self) -> bool {
        self.dialect().map(Smb2Dialect::is_modern).unwrap_or(false)
    }

    pub fn has_capability(&self, capability: Smb2Capabilities) -> bool {
        self.negotiated
            .lock()
            .as_ref()
            .map(|n| n.capabilities.contains(capability))
            .unwrap_or(false)
    }

    /// Requests currently awaiting correlation
    pub fn in_flight(&self) -> usize {
        self.responses.in_flight()
    }

    pub fn usage_count(&self) -> usize {
        self.usage.load(Ordering::SeqCst)
    }

    /// Open the link and negotiate. Concurrent callers share one attempt.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        self.idle_epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(settled) = self.settled() {
            return settled;
        }
        let _guard = self.connect_lock.lock().await;
        if let Some(settled) = self.settled() {
            return settled;
        }

        self.set_state(TransportState::Connecting);
        debug!(transport = self.id, endpoint = %self.endpoint, "Connecting");
        let result = match tokio::time::timeout(self.config.connect_timeout, self.establish()).await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "connect to {} exceeded {:?}",
                self.endpoint, self.config.connect_timeout
            ))),
        };

        match result {
            Ok(info) => {
                info!(
                    transport = self.id,
                    endpoint = %self.endpoint,
                    dialect = ?info.dialect,
                    "Transport connected"
                );
                *self.negotiated.lock() = Some(info);
                self.set_state(TransportState::Connected);
                Ok(())
            }
            Err(e) => {
                self.mark_failed(&e.to_string());
                Err(Error::connection_caused(
                    format!("Failed to connect to {}", self.endpoint),
                    e,
                ))
            }
        }
    }

    /// Outcome for callers arriving after an attempt already finished.
    fn settled(&self) -> Option<Result<()>> {
        match self.state() {
            TransportState::Connected => Some(Ok(())),
            TransportState::Failed => Some(Err(self.failed_error())),
            _ => None,
        }
    }

    fn failed_error(&self) -> Error {
        let reason = self
            .failure
            .lock()
            .clone()
            .unwrap_or_else(|| "unknown failure".to_string());
        Error::connection(format!(
            "transport {} to {} has failed: {}",
            self.id, self.endpoint, reason
        ))
    }

    async fn establish(self: &Arc<Self>) -> Result<NegotiateInfo> {
        let link = self
            .connector
            .open(self.endpoint.addr, self.local_addr)
            .await?;
        *self.bound_addr.lock() = link.local_addr;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.responses.reopen();
        self.next_message_id.store(0, Ordering::SeqCst);
        *self.writer.lock().await = Some(link.writer);
        let handle = tokio::spawn(receive_loop(
            Arc::downgrade(self),
            Arc::clone(&self.responses),
            link.reader,
            generation,
        ));
        if let Some(previous) = self.reader.lock().replace(handle) {
            previous.abort();
        }

        let request = Request::new(Operation::Negotiate {
            dialects: self.config.dialects.clone(),
            security_mode: self.config.security_mode,
            capabilities: self.config.capabilities,
            client_guid: self.config.client_guid,
        });
        let response = self.exchange(&request, RequestFlags::NONE).await?;
        if response.status() != status::STATUS_SUCCESS {
            return Err(Error::connection(format!(
                "negotiation rejected: {}",
                response.status_entry()
            )));
        }
        match response.body() {
            ResponseBody::Negotiate(info) if self.config.dialects.contains(&info.dialect) => {
                Ok(info.clone())
            }
            ResponseBody::Negotiate(info) => Err(Error::UnsupportedDialect(format!(
                "server selected {:?} which was not offered",
                info.dialect
            ))),
            _ => Err(Error::Protocol("malformed negotiate response".into())),
        }
    }

    /// Send a request and wait for its correlated response.
    ///
    /// The response is returned whatever its status; interpreting the status
    /// is up to the caller.
    pub async fn send(&self, request: &Request, flags: RequestFlags) -> Result<Response> {
        match self.state() {
            TransportState::Connected => {}
            TransportState::Failed => return Err(self.failed_error()),
            state => {
                return Err(Error::InvalidState(format!(
                    "transport {} is {:?}",
                    self.id, state
                )))
            }
        }

        let retries = if flags.no_retry() {
            0
        } else {
            self.config.send_retries
        };
        let mut attempt = 0;
        loop {
            match self.exchange(request, flags).await {
                Err(e) if e.is_transient() && attempt < retries && self.is_connected() => {
                    attempt += 1;
                    warn!(
                        transport = self.id,
                        attempt,
                        error = %e,
                        "Recoverable send failure, retrying"
                    );
                }
                result => return result,
            }
        }
    }

    async fn exchange(&self, request: &Request, flags: RequestFlags) -> Result<Response> {
        let message_id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        let dialect = self.dialect();
        let frame = request.encode(message_id, dialect)?;
        let pending = self.responses.register(message_id)?;

        self.write(frame).await?;
        trace!(
            transport = self.id,
            message_id,
            command = ?request.command(),
            "Request sent"
        );

        let frame = if flags.no_timeout() {
            pending.wait().await?
        } else {
            match tokio::time::timeout(self.config.response_timeout, pending.wait()).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(Error::Timeout(format!(
                        "no response to message {} from {} within {:?}",
                        message_id, self.endpoint, self.config.response_timeout
                    )))
                }
            }
        };
        Response::decode(frame, flags.retain_payload(), dialect)
    }

    async fn write(&self, frame: Bytes) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let link = writer.as_mut().ok_or_else(|| {
            Error::ConnectionLost(format!("transport {} has no open link", self.id))
        })?;
        match link.write_frame(frame).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                writer.take();
                drop(writer);
                self.mark_failed(&e.to_string());
                Err(Error::connection_caused(
                    format!("send to {} failed", self.endpoint),
                    e,
                ))
            }
        }
    }

    pub fn acquire(self: &Arc<Self>) -> Arc<Self> {
        let count = self.usage.fetch_add(1, Ordering::SeqCst) + 1;
        self.idle_epoch.fetch_add(1, Ordering::SeqCst);
        self.log_usage("acquire", count);
        Arc::clone(self)
    }

    /// Drop one reference. The link closes after the idle grace window once
    /// nobody holds or reconnects the transport.
    pub fn release(self: &Arc<Self>) {
        match self
            .usage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(1) => {
                self.log_usage("release", 0);
                self.schedule_idle_close();
            }
            Ok(previous) => self.log_usage("release", previous - 1),
            Err(_) => warn!(
                transport = self.id,
                "Transport released more often than acquired, count stays at zero"
            ),
        }
    }

    fn log_usage(&self, op: &str, count: usize) {
        if self.config.trace_resource_usage {
            debug!(transport = self.id, op, count, "Transport usage");
        } else {
            trace!(transport = self.id, op, count, "Transport usage");
        }
    }

    fn schedule_idle_close(self: &Arc<Self>) {
        if !self.is_connected() {
            return;
        }
        let epoch = self.idle_epoch.load(Ordering::SeqCst);
        let grace = self.config.idle_grace;
        let weak = Arc::downgrade(self);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(transport = self.id, "No runtime for idle close, link closes on drop");
            return;
        };
        runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(transport) = weak.upgrade() {
                if transport.usage_count() == 0
                    && transport.idle_epoch.load(Ordering::SeqCst) == epoch
                {
                    debug!(transport = transport.id, "Closing idle transport");
                    transport.close().await;
                }
            }
        });
    }

    /// Tear the link down. Never fails; a failed transport stays failed.
    pub async fn close(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.state.lock();
            if *state != TransportState::Failed {
                *state = TransportState::Disconnected;
            }
        }
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!(transport = self.id, error = %e, "Error shutting down link");
            }
        }
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        let failed = self.responses.fail_all("transport closed");
        if failed > 0 {
            debug!(transport = self.id, failed, "Failed requests pending at close");
        }
        *self.negotiated.lock() = None;
    }

    fn link_lost(&self, generation: u64, reason: &str) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.mark_failed(reason);
    }

    fn mark_failed(&self, reason: &str) {
        {
            let mut state = self.state.lock();
            if *state == TransportState::Failed {
                return;
            }
            *state = TransportState::Failed;
        }
        *self.failure.lock() = Some(reason.to_string());
        warn!(transport = self.id, endpoint = %self.endpoint, reason, "Transport failed");
        self.responses.fail_all(reason);
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn has_receive_task(&self) -> bool {
        self.reader.lock().is_some()
    }

    fn set_state(&self, state: TransportState) {
        *self.state.lock() = state;
    }
}

impl Drop for SmbTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.get_mut().take() {
            handle.abort();
        }
    }
}

async fn receive_loop(
    transport: Weak<SmbTransport>,
    table: Arc<ResponseTable>,
    mut reader: Box<dyn FrameReader>,
    generation: u64,
) {
    let reason = loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => {
                let header = match Smb2Header::parse(&frame) {
                    Ok(header) => header,
                    Err(e) => break format!("malformed frame: {}", e),
                };
                if header.is_async() && header.status == STATUS_PENDING {
                    trace!(message_id = header.message_id, "Interim response");
                    continue;
                }
                if !table.dispatch(header.message_id, frame) {
                    debug!(
                        message_id = header.message_id,
                        command = ?header.command,
                        "Dropping response without a waiting request"
                    );
                }
            }
            Ok(None) => break "connection closed by peer".to_string(),
            Err(e) => break format!("receive failed: {}", e),
        }
    };
    match transport.upgrade() {
        Some(transport) => transport.link_lost(generation, &reason),
        None => {
            table.fail_all(&reason);
        }
    }
}

impl std::fmt::Debug for SmbTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmbTransport")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("local_addr", &self.local_addr)
            .field("state", &self.state())
            .field("usage", &self.usage_count())
            .finish()
    }
}

#[cfg(test)]
mod tests;

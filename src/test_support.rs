//! In-memory SMB2 server for tests
//!
//! [`MockServer`] answers the commands the lifecycle layer drives and can be
//! scripted per command. [`MockConnector`] hands out links to it, and
//! [`spawn_tcp_server`] exposes the same server on a loopback socket.

use crate::error::{Error, Result};
use crate::netbios::frame::{encode_session_message, FrameDecoder};
use crate::protocol::header::Smb2Header;
use crate::protocol::message::decode_utf16le;
use crate::protocol::smb2_constants::*;
use crate::protocol::status;
use crate::transport::{Connector, FrameReader, FrameWriter, Link};
use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

struct LinkHandle {
    closed: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<Option<Bytes>>,
}

/// Scriptable SMB2 server state shared by every link
pub struct MockServer {
    pub dialect: Mutex<Smb2Dialect>,
    pub capabilities: Mutex<Smb2Capabilities>,
    /// Share names (upper case) answered with PATH_NOT_COVERED
    pub redirect_shares: Mutex<HashSet<String>>,
    /// Share names (upper case) answered with BAD_NETWORK_NAME
    pub missing_shares: Mutex<HashSet<String>>,
    /// Share names (upper case) flagged as DFS roots
    pub dfs_shares: Mutex<HashSet<String>>,
    /// Addresses whose connect attempts are refused
    pub refused: Mutex<HashSet<SocketAddr>>,
    /// One-shot statuses returned before normal handling
    scripted: Mutex<HashMap<Smb2Command, VecDeque<u32>>>,
    /// Commands that never get an answer
    pub silent: Mutex<HashSet<Smb2Command>>,
    /// Commands answered with an async STATUS_PENDING before the final reply
    pub interim: Mutex<HashSet<Smb2Command>>,
    /// Failures injected into the next writes
    pub write_faults: Mutex<VecDeque<io::ErrorKind>>,
    /// IOCTL outputs by control code
    pub ioctl_outputs: Mutex<HashMap<u32, Bytes>>,
    /// Hold responses until `release_held` is called
    pub hold_responses: AtomicBool,
    held: Mutex<Vec<(mpsc::UnboundedSender<Option<Bytes>>, Bytes)>>,
    counts: Mutex<HashMap<Smb2Command, usize>>,
    tree_paths: Mutex<Vec<String>>,
    bindings: AtomicUsize,
    links: Mutex<Vec<LinkHandle>>,
    pub opens: AtomicUsize,
    next_tree_id: AtomicU32,
    next_session_id: AtomicU64,
}

impl MockServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dialect: Mutex::new(Smb2Dialect::Smb302),
            capabilities: Mutex::new(Smb2Capabilities::DFS | Smb2Capabilities::MULTI_CHANNEL),
            redirect_shares: Mutex::new(HashSet::new()),
            missing_shares: Mutex::new(HashSet::new()),
            dfs_shares: Mutex::new(HashSet::new()),
            refused: Mutex::new(HashSet::new()),
            scripted: Mutex::new(HashMap::new()),
            silent: Mutex::new(HashSet::new()),
            interim: Mutex::new(HashSet::new()),
            write_faults: Mutex::new(VecDeque::new()),
            ioctl_outputs: Mutex::new(HashMap::new()),
            hold_responses: AtomicBool::new(false),
            held: Mutex::new(Vec::new()),
            counts: Mutex::new(HashMap::new()),
            tree_paths: Mutex::new(Vec::new()),
            bindings: AtomicUsize::new(0),
            links: Mutex::new(Vec::new()),
            opens: AtomicUsize::new(0),
            next_tree_id: AtomicU32::new(1),
            next_session_id: AtomicU64::new(0x1000),
        })
    }

    pub fn connector(self: &Arc<Self>) -> Arc<MockConnector> {
        Arc::new(MockConnector {
            server: Arc::clone(self),
        })
    }

    /// Answer the next `command` with `status` and an empty body.
    pub fn script(&self, command: Smb2Command, status: u32) {
        self.scripted
            .lock()
            .entry(command)
            .or_default()
            .push_back(status);
    }

    pub fn count(&self, command: Smb2Command) -> usize {
        self.counts.lock().get(&command).copied().unwrap_or(0)
    }

    pub fn tree_paths(&self) -> Vec<String> {
        self.tree_paths.lock().clone()
    }

    pub fn bindings(&self) -> usize {
        self.bindings.load(Ordering::SeqCst)
    }

    pub fn open_links(&self) -> usize {
        self.links
            .lock()
            .iter()
            .filter(|l| !l.closed.load(Ordering::SeqCst))
            .count()
    }

    /// Drop every open link as if the server went away.
    pub fn kill_links(&self) {
        for link in self.links.lock().drain(..) {
            link.closed.store(true, Ordering::SeqCst);
            let _ = link.tx.send(None);
        }
    }

    /// Deliver held responses, last one first.
    pub fn release_held_reversed(&self) {
        let held: Vec<_> = self.held.lock().drain(..).collect();
        for (tx, frame) in held.into_iter().rev() {
            let _ = tx.send(Some(frame));
        }
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    /// Produce the response for one request frame.
    pub fn handle(&self, frame: &[u8]) -> Option<Bytes> {
        let header = Smb2Header::parse(frame).ok()?;
        let body = &frame[Smb2Header::SIZE..];
        *self.counts.lock().entry(header.command).or_insert(0) += 1;

        if self.silent.lock().contains(&header.command) {
            return None;
        }
        let scripted = self
            .scripted
            .lock()
            .get_mut(&header.command)
            .and_then(|q| q.pop_front());
        if let Some(code) = scripted {
            return Some(response(&header, code, header.tree_id, error_body()));
        }

        let reply = match header.command {
            Smb2Command::Negotiate => response(
                &header,
                status::STATUS_SUCCESS,
                0,
                negotiate_body(*self.dialect.lock(), *self.capabilities.lock()),
            ),
            Smb2Command::SessionSetup => {
                let binding = body.get(2).copied().unwrap_or(0) & 0x01 != 0;
                let mut reply_header = header.clone();
                if binding {
                    self.bindings.fetch_add(1, Ordering::SeqCst);
                } else if header.session_id == 0 {
                    reply_header.session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
                }
                response(&reply_header, status::STATUS_SUCCESS, 0, session_setup_body(0))
            }
            Smb2Command::TreeConnect => self.tree_connect(&header, body),
            Smb2Command::Ioctl => {
                let ctl_code = LittleEndian::read_u32(&body[4..8]);
                match self.ioctl_outputs.lock().get(&ctl_code) {
                    Some(output) => response(
                        &header,
                        status::STATUS_SUCCESS,
                        header.tree_id,
                        ioctl_body(ctl_code, output),
                    ),
                    None => response(
                        &header,
                        status::STATUS_NOT_FOUND,
                        header.tree_id,
                        error_body(),
                    ),
                }
            }
            _ => response(&header, status::STATUS_SUCCESS, header.tree_id, empty_body()),
        };
        Some(reply)
    }

    fn tree_connect(&self, header: &Smb2Header, body: &[u8]) -> Bytes {
        let offset = LittleEndian::read_u16(&body[4..6]) as usize - Smb2Header::SIZE;
        let len = LittleEndian::read_u16(&body[6..8]) as usize;
        let path = decode_utf16le(&body[offset..offset + len]).unwrap_or_default();
        self.tree_paths.lock().push(path.clone());

        let share = path.rsplit('\\').next().unwrap_or("").to_uppercase();
        if self.redirect_shares.lock().contains(&share) {
            return response(header, status::STATUS_PATH_NOT_COVERED, 0, error_body());
        }
        if self.missing_shares.lock().contains(&share) {
            return response(header, status::STATUS_BAD_NETWORK_NAME, 0, error_body());
        }
        let share_type = if share == IPC_SHARE {
            ShareType::Pipe
        } else if share.starts_with("LPT") {
            ShareType::Print
        } else {
            ShareType::Disk
        };
        let share_flags = if self.dfs_shares.lock().contains(&share) {
            ShareFlags::DFS | ShareFlags::DFS_ROOT
        } else {
            ShareFlags::empty()
        };
        let tree_id = self.next_tree_id.fetch_add(1, Ordering::SeqCst);
        response(
            header,
            status::STATUS_SUCCESS,
            tree_id,
            tree_connect_body(share_type, share_flags, ShareCapabilities::empty()),
        )
    }

    fn deliver(&self, tx: &mpsc::UnboundedSender<Option<Bytes>>, frame: Bytes) {
        if self.hold_responses.load(Ordering::SeqCst) {
            self.held.lock().push((tx.clone(), frame));
        } else {
            let _ = tx.send(Some(frame));
        }
    }
}

/// Build a response frame for `request`.
pub fn response(request: &Smb2Header, code: u32, tree_id: u32, body: Vec<u8>) -> Bytes {
    let mut header = request.clone();
    header.flags = Smb2HeaderFlags::SERVER_TO_REDIR;
    header.status = code;
    header.tree_id = tree_id;
    header.credit = 32;
    let mut buf = header.serialize();
    buf.extend_from_slice(&body);
    Bytes::from(buf)
}

/// Async STATUS_PENDING interim reply for `request`.
pub fn interim_response(request: &Smb2Header) -> Bytes {
    let mut header = request.clone();
    header.flags = Smb2HeaderFlags::SERVER_TO_REDIR | Smb2HeaderFlags::ASYNC_COMMAND;
    header.status = status::STATUS_PENDING;
    header.async_id = 0xA5;
    let mut buf = header.serialize();
    buf.extend_from_slice(&error_body());
    Bytes::from(buf)
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    condition()
}

pub fn error_body() -> Vec<u8> {
    vec![9, 0, 0, 0, 0, 0, 0, 0, 0]
}

pub fn empty_body() -> Vec<u8> {
    vec![4, 0, 0, 0]
}

pub fn negotiate_body(dialect: Smb2Dialect, capabilities: Smb2Capabilities) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_u16::<LittleEndian>(65).unwrap();
    buf.write_u16::<LittleEndian>(SecurityMode::SIGNING_ENABLED.bits())
        .unwrap();
    buf.write_u16::<LittleEndian>(dialect as u16).unwrap();
    buf.write_u16::<LittleEndian>(0).unwrap();
    buf.extend_from_slice(&[0x5A; 16]);
    buf.write_u32::<LittleEndian>(capabilities.bits()).unwrap();
    for _ in 0..3 {
        buf.write_u32::<LittleEndian>(1 << 20).unwrap();
    }
    buf.write_u64::<LittleEndian>(0).unwrap();
    buf.write_u64::<LittleEndian>(0).unwrap();
    buf.write_u16::<LittleEndian>(0).unwrap();
    buf.write_u16::<LittleEndian>(0).unwrap();
    buf.write_u32::<LittleEndian>(0).unwrap();
    buf
}

pub fn session_setup_body(session_flags: u16) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_u16::<LittleEndian>(9).unwrap();
    buf.write_u16::<LittleEndian>(session_flags).unwrap();
    buf.write_u16::<LittleEndian>(0).unwrap();
    buf.write_u16::<LittleEndian>(0).unwrap();
    buf.push(0);
    buf
}

pub fn tree_connect_body(
    share_type: ShareType,
    share_flags: ShareFlags,
    capabilities: ShareCapabilities,
) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_u16::<LittleEndian>(16).unwrap();
    buf.push(share_type as u8);
    buf.push(0);
    buf.write_u32::<LittleEndian>(share_flags.bits()).unwrap();
    buf.write_u32::<LittleEndian>(capabilities.bits()).unwrap();
    buf.write_u32::<LittleEndian>(0x001F_01FF).unwrap();
    buf
}

pub fn ioctl_body(ctl_code: u32, output: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_u16::<LittleEndian>(49).unwrap();
    buf.write_u16::<LittleEndian>(0).unwrap();
    buf.write_u32::<LittleEndian>(ctl_code).unwrap();
    buf.extend_from_slice(&[0xFF; 16]);
    buf.write_u32::<LittleEndian>(0).unwrap();
    buf.write_u32::<LittleEndian>(0).unwrap();
    buf.write_u32::<LittleEndian>((Smb2Header::SIZE + 48) as u32)
        .unwrap();
    buf.write_u32::<LittleEndian>(output.len() as u32).unwrap();
    buf.write_u32::<LittleEndian>(0).unwrap();
    buf.write_u32::<LittleEndian>(0).unwrap();
    buf.extend_from_slice(output);
    buf
}

/// Connector whose links talk to a [`MockServer`]
pub struct MockConnector {
    server: Arc<MockServer>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, remote: SocketAddr, local: Option<IpAddr>) -> Result<Link> {
        if self.server.refused.lock().contains(&remote) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{} refused the connection", remote),
            )));
        }
        self.server.opens.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        self.server.links.lock().push(LinkHandle {
            closed: Arc::clone(&closed),
            tx: tx.clone(),
        });
        Ok(Link {
            reader: Box::new(MockReader { rx }),
            writer: Box::new(MockWriter {
                server: Arc::clone(&self.server),
                tx,
                closed,
            }),
            local_addr: local.map(|ip| SocketAddr::new(ip, 49152)),
        })
    }
}

struct MockReader {
    rx: mpsc::UnboundedReceiver<Option<Bytes>>,
}

#[async_trait]
impl FrameReader for MockReader {
    async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        Ok(self.rx.recv().await.flatten())
    }
}

struct MockWriter {
    server: Arc<MockServer>,
    tx: mpsc::UnboundedSender<Option<Bytes>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl FrameWriter for MockWriter {
    async fn write_frame(&mut self, frame: Bytes) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "link closed",
            )));
        }
        let fault = self.server.write_faults.lock().pop_front();
        if let Some(kind) = fault {
            let transient = matches!(
                kind,
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            );
            if !transient {
                self.closed.store(true, Ordering::SeqCst);
                let _ = self.tx.send(None);
            }
            return Err(Error::Io(io::Error::new(kind, "injected write failure")));
        }
        if let Ok(header) = Smb2Header::parse(&frame) {
            if self.server.interim.lock().contains(&header.command) {
                self.server.deliver(&self.tx, interim_response(&header));
            }
        }
        if let Some(reply) = self.server.handle(&frame) {
            self.server.deliver(&self.tx, reply);
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.tx.send(None);
        Ok(())
    }
}

/// Serve `server` on a loopback TCP socket with NetBIOS framing.
pub async fn spawn_tcp_server(server: Arc<MockServer>) -> SocketAddr {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                let mut decoder = FrameDecoder::new();
                loop {
                    while let Ok(Some(frame)) = decoder.next_frame() {
                        if let Some(reply) = server.handle(&frame) {
                            let message = encode_session_message(&reply).unwrap();
                            if stream.write_all(&message).await.is_err() {
                                return;
                            }
                        }
                    }
                    match stream.read_buf(decoder.buffer_mut()).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    }
                }
            });
        }
    });
    local
}

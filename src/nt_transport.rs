use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use hashbrown::{HashMap, HashSet};

use crate::nt_config::ClusterConfig;
use crate::nt_interface::NodeId;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const IO_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Destination is not in the cluster table
    UnknownNode(NodeId),
    /// Destination did not accept the connection
    Unreachable(NodeId),
    Io(String),
    /// Local endpoint is shut down
    Disconnected,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::UnknownNode(id) => write!(f, "node {} is not in the cluster", id),
            TransportError::Unreachable(id) => write!(f, "node {} is unreachable", id),
            TransportError::Io(reason) => write!(f, "i/o error: {}", reason),
            TransportError::Disconnected => write!(f, "transport is shut down"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// Best-effort, unordered delivery of text lines between nodes.
///
/// A failed `send` only means this attempt did not go through; the protocol
/// above treats it like any other lost message.
pub trait Transport: Send + Sync {
    fn send(&self, to: NodeId, payload: &str) -> Result<(), TransportError>;

    /// Next received line, or `None` when `timeout` elapsed first
    fn receive(&self, timeout: Duration) -> Result<Option<String>, TransportError>;
}

fn poll(inbox: &Receiver<String>, timeout: Duration) -> Result<Option<String>, TransportError> {
    match inbox.recv_timeout(timeout) {
        Ok(line) => Ok(Some(line)),
        Err(RecvTimeoutError::Timeout) => Ok(None),
        Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
    }
}

// ============================================================================
// TCP
// ============================================================================

/// One short-lived connection per message, newline terminated.
pub struct TcpTransport {
    id: NodeId,
    peers: HashMap<NodeId, String>,
    local: SocketAddr,
    inbox: Receiver<String>,
    shutdown: Arc<AtomicBool>,
}

impl TcpTransport {
    /// Listen on this node's address from the cluster table
    pub fn bind(id: NodeId, cluster: &ClusterConfig) -> Result<Self, TransportError> {
        let peers: HashMap<NodeId, String> = cluster
            .node_ids()
            .into_iter()
            .filter_map(|peer| {
                let address = cluster.address(peer)?;
                let port = cluster.port(peer)?;
                Some((peer, format!("{}:{}", address, port)))
            })
            .collect();
        let own = peers.get(&id).ok_or(TransportError::UnknownNode(id))?;

        let listener = TcpListener::bind(own.as_str())?;
        let local = listener.local_addr()?;
        let (sender, inbox) = unbounded::<String>();
        let shutdown = Arc::new(AtomicBool::new(false));

        let stop = shutdown.clone();
        thread::Builder::new()
            .name(format!("nt-listen-{}", id))
            .spawn(move || accept_loop(listener, sender, stop))?;

        log::debug!("node {} listening on {}", id, local);
        Ok(Self {
            id,
            peers,
            local,
            inbox,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn resolve(&self, to: NodeId) -> Result<SocketAddr, TransportError> {
        let address = self.peers.get(&to).ok_or(TransportError::UnknownNode(to))?;
        address
            .to_socket_addrs()?
            .next()
            .ok_or(TransportError::Unreachable(to))
    }
}

fn accept_loop(listener: TcpListener, sender: Sender<String>, shutdown: Arc<AtomicBool>) {
    for stream in listener.incoming() {
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("accept failed: {}", e);
                continue;
            }
        };
        let sender = sender.clone();
        let _ = thread::spawn(move || read_lines(stream, sender));
    }
}

fn read_lines(stream: TcpStream, sender: Sender<String>) {
    if let Err(e) = stream.set_read_timeout(Some(IO_TIMEOUT)) {
        log::warn!("cannot set read timeout: {}", e);
    }
    for line in BufReader::new(stream).lines() {
        match line {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => {
                if sender.send(line).is_err() {
                    return;
                }
            }
            Err(e) => {
                log::debug!("connection closed: {}", e);
                return;
            }
        }
    }
}

impl Transport for TcpTransport {
    fn send(&self, to: NodeId, payload: &str) -> Result<(), TransportError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }
        let addr = self.resolve(to)?;
        let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|_| TransportError::Unreachable(to))?;
        stream.set_write_timeout(Some(IO_TIMEOUT))?;
        stream.write_all(payload.as_bytes())?;
        stream.write_all(b"\n")?;
        stream.flush()?;
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<Option<String>, TransportError> {
        poll(&self.inbox, timeout)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        // wake the accept loop so it observes the flag
        let _ = TcpStream::connect_timeout(&self.local, CONNECT_TIMEOUT);
        log::debug!("node {} stopped listening", self.id);
    }
}

// ============================================================================
// In-memory network
// ============================================================================

#[derive(Default)]
struct MemoryInner {
    inboxes: HashMap<NodeId, Sender<String>>,
    disconnected: HashSet<NodeId>,
}

/// Process-local network for tests and the threaded driver.
///
/// Disconnected nodes neither send nor receive; messages to them are dropped
/// silently, as on a real network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Endpoint for `id`; joining again replaces the previous inbox
    pub fn join(&self, id: NodeId) -> MemoryTransport {
        let (sender, inbox) = unbounded();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.inboxes.insert(id, sender);
        inner.disconnected.remove(&id);
        MemoryTransport {
            id,
            network: self.clone(),
            inbox,
        }
    }

    pub fn disconnect(&self, id: NodeId) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .disconnected
            .insert(id);
    }

    pub fn reconnect(&self, id: NodeId) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .disconnected
            .remove(&id);
    }

    pub fn is_connected(&self, id: NodeId) -> bool {
        !self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .disconnected
            .contains(&id)
    }

    fn deliver(&self, from: NodeId, to: NodeId, payload: &str) -> Result<(), TransportError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.disconnected.contains(&from) {
            return Err(TransportError::Disconnected);
        }
        let inbox = inner.inboxes.get(&to).ok_or(TransportError::UnknownNode(to))?;
        if inner.disconnected.contains(&to) {
            return Ok(());
        }
        // a dropped receiver behaves like a crashed peer
        let _ = inbox.send(payload.to_string());
        Ok(())
    }
}

pub struct MemoryTransport {
    id: NodeId,
    network: MemoryNetwork,
    inbox: Receiver<String>,
}

impl MemoryTransport {
    pub fn id(&self) -> NodeId {
        self.id
    }
}

impl Transport for MemoryTransport {
    fn send(&self, to: NodeId, payload: &str) -> Result<(), TransportError> {
        self.network.deliver(self.id, to, payload)
    }

    fn receive(&self, timeout: Duration) -> Result<Option<String>, TransportError> {
        if !self.network.is_connected(self.id) {
            thread::sleep(timeout);
            return Ok(None);
        }
        poll(&self.inbox, timeout)
    }
}

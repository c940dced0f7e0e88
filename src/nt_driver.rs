use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::nt_codec::WireCodec;
use crate::nt_config::ProtocolConfig;
use crate::nt_interface::{MessageEnvelope, MutualExclusion, NodeId};
use crate::nt_node::NtNode;
use crate::nt_queue::RequestOutcome;
use crate::nt_transport::{Transport, TransportError};

/// How often a blocked `acquire` re-checks for shutdown
const WAIT_SLICE: Duration = Duration::from_millis(50);

struct Shared {
    node: Mutex<NtNode>,
    changed: Condvar,
    transport: Arc<dyn Transport>,
    codec: WireCodec,
    running: AtomicBool,
    tick: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, NtNode> {
        self.node.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` under the node lock, then sends what it produced without the lock
    fn step<R>(&self, f: impl FnOnce(&mut NtNode, &mut Vec<MessageEnvelope>) -> R) -> R {
        let mut out = Vec::new();
        let result = {
            let mut node = self.lock();
            let result = f(&mut node, &mut out);
            self.changed.notify_all();
            result
        };
        self.send_all(out);
        result
    }

    fn send_all(&self, out: Vec<MessageEnvelope>) {
        for envelope in out {
            let line = self.codec.encode(&envelope);
            if let Err(e) = self.transport.send(envelope.receiver, &line) {
                log::debug!(
                    "node {} could not send {} to {}: {}",
                    envelope.sender,
                    envelope.message.kind(),
                    envelope.receiver,
                    e
                );
            }
        }
    }

    fn on_line(&self, id: NodeId, line: &str) {
        match self.codec.decode(line, id) {
            Ok(envelope) => self.step(|node, out| node.handle_message(&envelope, out)),
            Err(e) => log::warn!("node {} dropped malformed message '{}': {}", id, line, e),
        }
    }
}

/// Drives one `NtNode` on its own thread: inbound lines from the transport
/// and a periodic tick, one at a time under the node lock.
pub struct NodeHandle {
    id: NodeId,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn start(
        node: NtNode,
        transport: Arc<dyn Transport>,
        config: &ProtocolConfig,
    ) -> std::io::Result<Self> {
        let id = node.id();
        let shared = Arc::new(Shared {
            node: Mutex::new(node),
            changed: Condvar::new(),
            transport,
            codec: WireCodec::new(config.fault_tolerance),
            running: AtomicBool::new(true),
            tick: Duration::from_millis(config.tick_duration_ms),
        });

        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name(format!("nt-node-{}", id))
            .spawn(move || run(id, worker_shared))?;

        Ok(Self {
            id,
            shared,
            worker: Some(worker),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Block until inside the critical section; false if the handle shut down first
    pub fn acquire(&self) -> bool {
        self.wait_for_token(None)
    }

    /// Like `acquire`, giving up after `timeout`. The request stays queued.
    pub fn try_acquire(&self, timeout: Duration) -> bool {
        self.wait_for_token(Some(Instant::now() + timeout))
    }

    /// Leave the critical section; false when not inside it
    pub fn release(&self) -> bool {
        self.shared.step(|node, out| node.release_token(out))
    }

    pub fn in_critical_section(&self) -> bool {
        self.shared.lock().in_critical_section()
    }

    /// Read-only access to the node, for inspection
    pub fn with_node<R>(&self, f: impl FnOnce(&NtNode) -> R) -> R {
        f(&self.shared.lock())
    }

    pub fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.changed.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("node {} worker panicked", self.id);
            }
        }
    }

    fn wait_for_token(&self, deadline: Option<Instant>) -> bool {
        let outcome = self.shared.step(|node, out| node.request_token(out));
        if outcome == RequestOutcome::Granted {
            return true;
        }

        let mut node = self.shared.lock();
        loop {
            if node.in_critical_section() {
                return true;
            }
            if !self.shared.running.load(Ordering::Acquire) {
                return false;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return false;
                    }
                    left.min(WAIT_SLICE)
                }
                None => WAIT_SLICE,
            };
            node = self
                .shared
                .changed
                .wait_timeout(node, slice)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl MutualExclusion for NodeHandle {
    fn request_token(&self) {
        if !self.acquire() {
            log::warn!("node {} stopped before obtaining the token", self.id);
        }
    }

    fn release_token(&self) {
        if !self.release() {
            log::warn!("node {} released outside the critical section", self.id);
        }
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(id: NodeId, shared: Arc<Shared>) {
    let mut next_tick = Instant::now() + shared.tick;
    while shared.running.load(Ordering::Acquire) {
        match shared
            .transport
            .receive(next_tick.saturating_duration_since(Instant::now()))
        {
            Ok(Some(line)) => shared.on_line(id, &line),
            Ok(None) => {}
            Err(TransportError::Disconnected) => {
                log::error!("node {} transport closed", id);
                break;
            }
            Err(e) => {
                log::warn!("node {} receive failed: {}", id, e);
                thread::sleep(next_tick.saturating_duration_since(Instant::now()));
            }
        }

        if Instant::now() >= next_tick {
            shared.step(|node, out| node.tick(out));
            next_tick += shared.tick;
        }
    }
    shared.running.store(false, Ordering::Release);
    shared.changed.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::nt_transport::MemoryNetwork;

    fn fast_config() -> ProtocolConfig {
        ProtocolConfig {
            fault_tolerance: 2,
            msg_timeout: 10,
            ping_interval: 5,
            request_timeout: 60,
            election_window: 10,
            tick_duration_ms: 10,
        }
    }

    fn cluster(network: &MemoryNetwork, n: NodeId) -> Vec<NodeHandle> {
        let peers: Vec<NodeId> = (1..=n).collect();
        peers
            .iter()
            .map(|&id| {
                let node = NtNode::new(id, peers.clone(), fast_config());
                let transport: Arc<dyn Transport> = Arc::new(network.join(id));
                NodeHandle::start(node, transport, &fast_config()).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_holder_acquires_immediately() {
        let network = MemoryNetwork::new();
        let nodes = cluster(&network, 2);
        assert!(nodes[0].try_acquire(Duration::from_millis(100)));
        assert!(nodes[0].in_critical_section());
        assert!(nodes[0].release());
        assert!(!nodes[0].release());
    }

    #[test]
    fn test_threads_never_overlap() {
        let network = MemoryNetwork::new();
        let nodes: Vec<Arc<NodeHandle>> = cluster(&network, 4).into_iter().map(Arc::new).collect();
        let inside = Arc::new(AtomicUsize::new(0));
        let entries = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = nodes
            .iter()
            .cloned()
            .map(|handle| {
                let inside = inside.clone();
                let entries = entries.clone();
                thread::spawn(move || {
                    for _ in 0..3 {
                        assert!(handle.try_acquire(Duration::from_secs(10)));
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        thread::sleep(Duration::from_millis(2));
                        inside.fetch_sub(1, Ordering::SeqCst);
                        entries.fetch_add(1, Ordering::SeqCst);
                        assert!(handle.release());
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(entries.load(Ordering::SeqCst), 12);
    }

    #[test]
    fn test_recovers_from_dead_holder() {
        let network = MemoryNetwork::new();
        let nodes = cluster(&network, 3);
        network.disconnect(1);

        assert!(nodes[1].try_acquire(Duration::from_secs(5)));
        assert!(nodes[1].with_node(|n| n.has_token()));
        nodes[1].release_token();

        assert!(nodes[2].try_acquire(Duration::from_secs(5)));
    }

    #[test]
    fn test_shutdown_unblocks_waiter() {
        let network = MemoryNetwork::new();
        let mut nodes = cluster(&network, 2);
        network.disconnect(1);
        nodes[1].shutdown();
        assert!(!nodes[1].acquire());
    }
}

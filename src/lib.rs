//! # nt_rust - Fault-Tolerant Naimi-Trehel Mutual Exclusion
//!
//! A Rust implementation of the Naimi-Trehel token-queue algorithm for
//! distributed mutual exclusion, extended with failure detection and token
//! recovery. At most one node is ever inside the critical section; requests
//! are served in FIFO order through a distributed queue of `next` pointers.
//!
//! ## Core Components
//!
//! - **NtNode**: Sans-IO node combining the queue engine and the failure detector
//! - **QueueEngine**: Request routing, COMMIT bookkeeping and token passing
//! - **FailureDetector**: PING/PONG liveness, predecessor probing, queue search,
//!   election and token regeneration
//! - **WireCodec**: Space separated text encoding of every message
//! - **NodeHandle**: Threaded driver binding a node to a `Transport`
//!
//! ## Usage with Network Layer
//!
//! The protocol core never touches a socket. Either drive it yourself:
//! 1. Create an `NtNode` per participant
//! 2. Route `MessageEnvelope`s between nodes via your network
//! 3. Call `node.tick()` periodically and `node.handle_message()` as messages arrive
//!
//! or hand it to a `NodeHandle` together with a `TcpTransport`:
//!
//! ```no_run
//! use std::sync::Arc;
//! use nt_rust::{ClusterConfig, LogEventSink, MutualExclusion, NodeHandle, NtNode, TcpTransport};
//!
//! let cluster = ClusterConfig::from_env_file("config.env").unwrap();
//! let transport = Arc::new(TcpTransport::bind(2, &cluster).unwrap());
//! let node = NtNode::from_cluster(2, &cluster, Box::new(LogEventSink::new()));
//! let handle = NodeHandle::start(node, transport, &cluster.protocol).unwrap();
//!
//! handle.request_token();
//! // critical section
//! handle.release_token();
//! ```
//!
//! ## Testing and Simulation
//!
//! The `simulator/` directory holds a round-based harness that runs whole
//! clusters in one process with message loss, delay and scheduled crashes.

// Protocol core
pub mod nt_interface;
pub mod nt_state;
pub mod nt_queue;
pub mod nt_recovery;
pub mod nt_node;

// Wire and configuration
pub mod nt_codec;
pub mod nt_config;

// Runtime
pub mod nt_transport;
pub mod nt_fault;
pub mod nt_driver;
pub mod nt_log_sink;

pub use nt_codec::{CodecError, WireCodec};
pub use nt_config::{ClusterConfig, ConfigError, NodeAddress, ProtocolConfig};
pub use nt_driver::NodeHandle;
pub use nt_fault::{FaultConfig, FaultInjector, FaultyTransport, Verdict};
pub use nt_interface::{
    Event, EventSink, Mechanism, Message, MessageEnvelope, MutualExclusion, NoOpSink, NodeId,
    NtTime, Position,
};
pub use nt_log_sink::{LogEventSink, MemorySink};
pub use nt_node::NtNode;
pub use nt_queue::RequestOutcome;
pub use nt_recovery::RecoveryPhase;
pub use nt_transport::{MemoryNetwork, TcpTransport, Transport, TransportError};

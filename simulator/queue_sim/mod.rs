//! Token queue simulator module
//!
//! Runs a whole cluster of sans-IO nodes in one process, round by round:
//! - Random critical section workload
//! - Message loss, delay and in-transit modification
//! - Scheduled crashes, including the current token holder
//! - Safety check after every round

pub mod config;
pub mod runner;
pub mod stats;

pub use config::{NetworkConfig, QueueSimConfig, ScheduledEvent, WorkloadConfig};
pub use runner::QueueSimRunner;

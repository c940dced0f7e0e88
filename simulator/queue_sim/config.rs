//! Configuration for the token queue simulator

use nt_rust::{FaultConfig, NodeId, ProtocolConfig};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;

/// Configuration for a queue simulation
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSimConfig {
    /// Number of simulation rounds (one protocol tick each)
    pub rounds: usize,

    /// Nodes 1..=num_nodes, node 1 starts with the token
    pub num_nodes: u32,

    /// Random seed (None = generate random)
    #[serde(skip)]
    pub seed: Option<[u8; 32]>,

    /// Protocol timers, in rounds
    pub protocol: ProtocolConfig,

    pub workload: WorkloadConfig,

    pub network: NetworkConfig,

    /// Crashes and network changes at fixed rounds
    pub events: Vec<ScheduledEvent>,
}

impl Default for QueueSimConfig {
    fn default() -> Self {
        Self {
            rounds: 500,
            num_nodes: 5,
            seed: None,
            protocol: ProtocolConfig {
                fault_tolerance: 2,
                msg_timeout: 3,
                ping_interval: 2,
                request_timeout: 40,
                election_window: 3,
                tick_duration_ms: 1,
            },
            workload: WorkloadConfig::default(),
            network: NetworkConfig::default(),
            events: Vec::new(),
        }
    }
}

impl QueueSimConfig {
    /// Get or generate seed
    pub fn resolve_seed(&self) -> [u8; 32] {
        self.seed.unwrap_or_else(|| {
            let mut temp_rng = StdRng::from_entropy();
            let mut seed = [0u8; 32];
            use rand::RngCore;
            temp_rng.fill_bytes(&mut seed);
            seed
        })
    }
}

/// How often nodes ask for the critical section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Chance per round that an idle node issues a request
    pub request_probability: f64,

    /// Rounds spent inside the critical section
    pub cs_rounds: usize,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            request_probability: 0.1,
            cs_rounds: 2,
        }
    }
}

/// Network behavior simulation
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Fraction of messages that are delayed by extra rounds
    pub delay_fraction: f64,

    /// Fraction of messages that are lost
    pub loss_fraction: f64,

    /// Fraction of messages whose payload is modified in transit
    pub corruption_fraction: f64,

    /// Upper bound on the extra delay of a delayed message
    pub max_delay_rounds: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            delay_fraction: 0.0,
            loss_fraction: 0.0,
            corruption_fraction: 0.0,
            max_delay_rounds: 2,
        }
    }
}

impl NetworkConfig {
    pub fn fault_config(&self) -> FaultConfig {
        FaultConfig {
            loss: self.loss_fraction,
            delay: self.delay_fraction,
            corruption: self.corruption_fraction,
            ..FaultConfig::default()
        }
    }

    pub fn is_lossy(&self) -> bool {
        self.loss_fraction > 0.0 || self.corruption_fraction > 0.0
    }
}

// ============================================================================
// Event Scheduling
// ============================================================================

/// A single scheduled event
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduledEvent {
    /// Round number when event triggers
    pub round: usize,

    /// The event to trigger
    #[serde(flatten)]
    pub event: SimEvent,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SimEvent {
    /// Node stops for good
    Crash { node: NodeId },

    /// Whoever holds the token at that round (or the first round after it
    /// in which someone does) stops for good
    CrashTokenHolder,

    /// Change network conditions
    NetworkCondition {
        delay_fraction: Option<f64>,
        loss_fraction: Option<f64>,
        corruption_fraction: Option<f64>,
    },
}

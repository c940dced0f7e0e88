//! Token queue simulation runner
//!
//! Every round delivers the messages due in that round, ticks every live node
//! once, then lets the workload enter, leave or request the critical section.
//! Messages cross the network as encoded lines, so corruption is caught by the
//! same codec the TCP transport uses.

use super::config::{QueueSimConfig, SimEvent};
use super::stats::{CsStats, MessageStats, RecoveryStats, SimResult};
use log::info;
use nt_rust::{
    Event, FaultInjector, MemorySink, MessageEnvelope, NodeId, NtNode, Verdict, WireCodec,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

/// Encoded message on its way to `receiver`
struct InFlight {
    due: usize,
    receiver: NodeId,
    line: String,
}

/// Token queue simulation runner
pub struct QueueSimRunner {
    config: QueueSimConfig,
    rng: StdRng,
    seed: [u8; 32],
    injector: FaultInjector,
    codec: WireCodec,

    nodes: BTreeMap<NodeId, NtNode>,
    crashed: Vec<NodeId>,
    sink: MemorySink,

    in_flight: Vec<InFlight>,
    cs_remaining: BTreeMap<NodeId, usize>,
    holder_crash_pending: bool,

    // Metrics
    current_round: usize,
    message_stats: MessageStats,
    safety_violations: usize,
    max_concurrent: usize,
    inside: Vec<NodeId>,
    healed_at: Option<usize>,
    entries_after_heal: usize,
}

impl QueueSimRunner {
    pub fn new(config: QueueSimConfig) -> Self {
        let seed = config.resolve_seed();
        let mut rng = StdRng::from_seed(seed);

        let mut fault_seed = [0u8; 32];
        rng.fill(&mut fault_seed);
        let injector = FaultInjector::new(config.network.fault_config(), fault_seed);

        let sink = MemorySink::new();
        let ids: Vec<NodeId> = (1..=config.num_nodes).collect();
        let nodes = ids
            .iter()
            .map(|&id| {
                let node = NtNode::new_with_sink(
                    id,
                    ids.clone(),
                    config.protocol.clone(),
                    Box::new(sink.clone()),
                );
                (id, node)
            })
            .collect();

        Self {
            codec: WireCodec::new(config.protocol.fault_tolerance),
            config,
            rng,
            seed,
            injector,
            nodes,
            crashed: Vec::new(),
            sink,
            in_flight: Vec::new(),
            cs_remaining: BTreeMap::new(),
            holder_crash_pending: false,
            current_round: 0,
            message_stats: MessageStats::default(),
            safety_violations: 0,
            max_concurrent: 0,
            inside: Vec::new(),
            healed_at: None,
            entries_after_heal: 0,
        }
    }

    pub fn run(mut self) -> SimResult {
        info!(
            "simulating {} nodes for {} rounds",
            self.config.num_nodes, self.config.rounds
        );
        for round in 0..self.config.rounds {
            self.current_round = round;
            self.apply_events();
            self.deliver();
            self.tick_nodes();
            self.run_workload();
            self.check_safety();
        }
        self.finish()
    }

    fn apply_events(&mut self) {
        let round = self.current_round;
        let due: Vec<SimEvent> = self
            .config
            .events
            .iter()
            .filter(|e| e.round == round)
            .map(|e| e.event.clone())
            .collect();

        for event in due {
            match event {
                SimEvent::Crash { node } => self.crash(node),
                SimEvent::CrashTokenHolder => self.holder_crash_pending = true,
                SimEvent::NetworkCondition {
                    delay_fraction,
                    loss_fraction,
                    corruption_fraction,
                } => {
                    let was_lossy = self.config.network.is_lossy();
                    if let Some(v) = delay_fraction {
                        self.config.network.delay_fraction = v;
                    }
                    if let Some(v) = loss_fraction {
                        self.config.network.loss_fraction = v;
                    }
                    if let Some(v) = corruption_fraction {
                        self.config.network.corruption_fraction = v;
                    }
                    if was_lossy && !self.config.network.is_lossy() {
                        self.healed_at = Some(round);
                        self.entries_after_heal = 0;
                    } else if self.config.network.is_lossy() {
                        self.healed_at = None;
                    }
                    let mut fault_seed = [0u8; 32];
                    self.rng.fill(&mut fault_seed);
                    self.injector =
                        FaultInjector::new(self.config.network.fault_config(), fault_seed);
                    info!("round {}: network now {:?}", round, self.config.network);
                }
            }
        }

        if self.holder_crash_pending {
            let holder = self
                .nodes
                .iter()
                .find(|(_, node)| node.has_token())
                .map(|(&id, _)| id);
            if let Some(holder) = holder {
                self.holder_crash_pending = false;
                self.crash(holder);
            }
        }
    }

    fn crash(&mut self, id: NodeId) {
        if self.nodes.remove(&id).is_some() {
            info!("round {}: node {} crashed", self.current_round, id);
            self.crashed.push(id);
            self.cs_remaining.remove(&id);
        }
    }

    fn deliver(&mut self) {
        let round = self.current_round;
        let (due, later): (Vec<InFlight>, Vec<InFlight>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(|m| m.due <= round);
        self.in_flight = later;

        let mut out = Vec::new();
        for message in due {
            // crashed receivers drop everything
            let Some(node) = self.nodes.get_mut(&message.receiver) else {
                continue;
            };
            match self.codec.decode(&message.line, message.receiver) {
                Ok(envelope) => node.handle_message(&envelope, &mut out),
                Err(_) => self.message_stats.rejected += 1,
            }
        }
        self.route(out);
    }

    fn tick_nodes(&mut self) {
        let mut out = Vec::new();
        for node in self.nodes.values_mut() {
            node.tick(&mut out);
        }
        self.route(out);
    }

    fn run_workload(&mut self) {
        let cs_rounds = self.config.workload.cs_rounds.max(1);
        let probability = self.config.workload.request_probability.clamp(0.0, 1.0);
        let mut out = Vec::new();

        for (&id, node) in self.nodes.iter_mut() {
            if node.in_critical_section() {
                let left = self.cs_remaining.entry(id).or_insert(cs_rounds);
                if *left <= 1 {
                    node.release_token(&mut out);
                    self.cs_remaining.remove(&id);
                } else {
                    *left -= 1;
                }
            } else if !node.is_waiting() && self.rng.gen_bool(probability) {
                node.request_token(&mut out);
            }
        }
        self.route(out);
    }

    fn check_safety(&mut self) {
        let inside: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.in_critical_section())
            .map(|(&id, _)| id)
            .collect();
        self.max_concurrent = self.max_concurrent.max(inside.len());
        if self.healed_at.is_some() {
            self.entries_after_heal += inside
                .iter()
                .filter(|id| !self.inside.contains(id))
                .count();
        }
        if inside.len() > 1 {
            self.safety_violations += 1;
            log::warn!(
                "round {}: nodes {:?} inside the critical section together",
                self.current_round,
                inside
            );
        }
        self.inside = inside;
    }

    /// Put envelopes on the wire, one round of latency plus injected faults
    fn route(&mut self, envelopes: Vec<MessageEnvelope>) {
        let next_round = self.current_round + 1;
        for envelope in envelopes {
            self.message_stats.total_messages += 1;
            *self
                .message_stats
                .per_type
                .entry(envelope.message.kind())
                .or_insert(0) += 1;

            let line = self.codec.encode(&envelope);
            let (due, line) = match self.injector.judge() {
                Verdict::Lose => {
                    self.message_stats.lost += 1;
                    continue;
                }
                Verdict::Delay => {
                    self.message_stats.delayed += 1;
                    let max_delay = self.config.network.max_delay_rounds.max(1);
                    (next_round + self.rng.gen_range(1..=max_delay), line)
                }
                Verdict::Corrupt => (next_round, FaultInjector::corrupt(&line)),
                // node faults are scheduled explicitly, not drawn per message
                Verdict::Deliver | Verdict::Disconnect | Verdict::Crash => (next_round, line),
            };
            self.in_flight.push(InFlight {
                due,
                receiver: envelope.receiver,
                line,
            });
        }
    }

    fn finish(self) -> SimResult {
        let mut cs_stats = CsStats {
            safety_violations: self.safety_violations,
            max_concurrent: self.max_concurrent,
            waiting_at_end: self.nodes.values().filter(|n| n.is_waiting()).count(),
            entries_after_heal: self.entries_after_heal,
            ..CsStats::default()
        };
        for id in 1..=self.config.num_nodes {
            cs_stats.entries_per_node.insert(id, 0);
        }

        let mut recovery_stats = RecoveryStats {
            crashed: self.crashed.clone(),
            ..RecoveryStats::default()
        };

        for (_, node, event) in self.sink.events() {
            match event {
                Event::CriticalSectionEntered { .. } => {
                    cs_stats.total_entries += 1;
                    *cs_stats.entries_per_node.entry(node).or_insert(0) += 1;
                }
                Event::RecoveryStarted { mechanism } => {
                    *recovery_stats
                        .started
                        .entry(mechanism.to_string())
                        .or_insert(0) += 1;
                }
                Event::TokenRegenerated => recovery_stats.regenerations += 1,
                Event::TokenDiscarded { .. } => recovery_stats.discarded += 1,
                _ => {}
            }
        }

        SimResult {
            seed_used: self.seed,
            rounds_completed: self.config.rounds,
            live_nodes: self.nodes.len(),
            healed_at_round: self.healed_at,
            cs_stats,
            recovery_stats,
            message_stats: self.message_stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue_sim::config::{NetworkConfig, ScheduledEvent, WorkloadConfig};

    fn base_config(seed: u8) -> QueueSimConfig {
        QueueSimConfig {
            rounds: 400,
            num_nodes: 5,
            seed: Some([seed; 32]),
            workload: WorkloadConfig {
                request_probability: 0.1,
                cs_rounds: 2,
            },
            ..QueueSimConfig::default()
        }
    }

    #[test]
    fn test_fault_free_run_is_safe_and_fair() {
        let result = QueueSimRunner::new(base_config(1)).run();

        assert_eq!(result.cs_stats.safety_violations, 0);
        assert!(result.cs_stats.max_concurrent <= 1);
        assert!(result.cs_stats.entries_per_node.values().all(|&n| n > 0));
        assert_eq!(result.recovery_stats.regenerations, 0);
        assert_eq!(result.message_stats.lost, 0);
        assert_eq!(result.message_stats.rejected, 0);
    }

    #[test]
    fn test_same_seed_same_result() {
        let a = QueueSimRunner::new(base_config(9)).run();
        let b = QueueSimRunner::new(base_config(9)).run();
        assert_eq!(a.cs_stats.entries_per_node, b.cs_stats.entries_per_node);
        assert_eq!(a.message_stats.total_messages, b.message_stats.total_messages);
    }

    #[test]
    fn test_holder_crash_regenerates_safely() {
        let mut config = base_config(2);
        config.events = vec![ScheduledEvent {
            round: 100,
            event: SimEvent::CrashTokenHolder,
        }];
        let result = QueueSimRunner::new(config).run();

        assert_eq!(result.recovery_stats.crashed.len(), 1);
        assert_eq!(result.cs_stats.safety_violations, 0);
        assert!(result.recovery_stats.regenerations >= 1);
        assert!(result.cs_stats.total_entries > 0);
    }

    #[test]
    fn test_corrupted_messages_are_rejected() {
        let mut config = base_config(3);
        config.rounds = 100;
        config.network = NetworkConfig {
            corruption_fraction: 0.2,
            ..NetworkConfig::default()
        };
        let result = QueueSimRunner::new(config).run();

        assert!(result.message_stats.total_messages > 0);
        assert!(result.message_stats.rejected > 0);
    }

    #[test]
    fn test_service_resumes_after_loss_heals() {
        let mut config = base_config(5);
        config.rounds = 1000;
        config.network = NetworkConfig {
            loss_fraction: 0.02,
            ..NetworkConfig::default()
        };
        config.events = vec![ScheduledEvent {
            round: 300,
            event: SimEvent::NetworkCondition {
                delay_fraction: None,
                loss_fraction: Some(0.0),
                corruption_fraction: None,
            },
        }];
        let result = QueueSimRunner::new(config).run();

        assert!(result.message_stats.lost > 0);
        assert_eq!(result.healed_at_round, Some(300));
        assert!(result.cs_stats.entries_after_heal > 0);
        assert!(result.cs_stats.waiting_at_end < 5);
        assert!(!result.stalled_after_heal());
    }

    #[test]
    fn test_entries_before_heal_are_not_counted() {
        let mut config = base_config(6);
        config.rounds = 200;
        config.network = NetworkConfig {
            loss_fraction: 0.05,
            ..NetworkConfig::default()
        };
        let result = QueueSimRunner::new(config).run();

        assert_eq!(result.healed_at_round, None);
        assert_eq!(result.cs_stats.entries_after_heal, 0);
        assert!(!result.stalled_after_heal());
    }
}

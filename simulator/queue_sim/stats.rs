//! Statistics and results for the token queue simulator

use nt_rust::NodeId;
use std::collections::BTreeMap;

/// Simulation result
#[derive(Debug)]
pub struct SimResult {
    /// Seed used for the simulation
    pub seed_used: [u8; 32],

    /// Number of rounds completed
    pub rounds_completed: usize,

    /// Nodes still running at the end
    pub live_nodes: usize,

    /// Round at which the network last went from lossy to loss-free
    pub healed_at_round: Option<usize>,

    pub cs_stats: CsStats,

    pub recovery_stats: RecoveryStats,

    pub message_stats: MessageStats,
}

impl SimResult {
    /// The network healed but the queue did not serve requests again
    pub fn stalled_after_heal(&self) -> bool {
        self.healed_at_round.is_some()
            && (self.cs_stats.entries_after_heal == 0
                || self.cs_stats.waiting_at_end >= self.live_nodes)
    }

    /// Print a summary of the simulation results
    pub fn print_summary(&self) {
        println!("\n╔════════════════════════════════════════════════════════╗");
        println!("║        Token Queue Simulation Results                  ║");
        println!("╚════════════════════════════════════════════════════════╝\n");

        println!("Configuration:");
        println!("  Seed: {:?}", self.seed_used);
        println!("  Rounds: {}\n", self.rounds_completed);

        println!("Critical Section:");
        println!("  Total entries: {}", self.cs_stats.total_entries);
        for (node, entries) in &self.cs_stats.entries_per_node {
            println!("    node {:>3}: {}", node, entries);
        }
        println!(
            "  Safety violations: {} (max {} nodes inside at once)",
            self.cs_stats.safety_violations, self.cs_stats.max_concurrent
        );
        println!("  Requests still waiting: {}", self.cs_stats.waiting_at_end);
        if let Some(round) = self.healed_at_round {
            println!(
                "  Entries since the network healed at round {}: {}",
                round, self.cs_stats.entries_after_heal
            );
        }
        println!();

        println!("Recovery:");
        println!("  Crashed nodes: {:?}", self.recovery_stats.crashed);
        for (mechanism, count) in &self.recovery_stats.started {
            println!("  {}: {}", mechanism, count);
        }
        println!(
            "  Tokens regenerated: {}",
            self.recovery_stats.regenerations
        );
        println!("  Tokens discarded: {}", self.recovery_stats.discarded);
        println!();

        println!("Message Statistics:");
        println!("  Total messages: {}", self.message_stats.total_messages);
        for (kind, count) in &self.message_stats.per_type {
            println!("    {:<17} {}", kind, count);
        }
        println!("  Lost: {}", self.message_stats.lost);
        println!("  Delayed: {}", self.message_stats.delayed);
        println!("  Rejected (malformed): {}", self.message_stats.rejected);
        println!();
    }
}

#[derive(Debug, Default)]
pub struct CsStats {
    pub total_entries: usize,

    pub entries_per_node: BTreeMap<NodeId, usize>,

    /// Rounds in which more than one live node was inside the critical section
    pub safety_violations: usize,

    pub max_concurrent: usize,

    pub waiting_at_end: usize,

    /// Entries counted from the round the network healed
    pub entries_after_heal: usize,
}

#[derive(Debug, Default)]
pub struct RecoveryStats {
    pub crashed: Vec<NodeId>,

    /// Recovery mechanism starts, keyed by mechanism name
    pub started: BTreeMap<String, usize>,

    pub regenerations: usize,

    pub discarded: usize,
}

/// Message statistics
#[derive(Debug, Default)]
pub struct MessageStats {
    /// Total message count
    pub total_messages: usize,

    pub per_type: BTreeMap<&'static str, usize>,

    pub lost: usize,

    pub delayed: usize,

    /// Dropped by the codec after modification in transit
    pub rejected: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healed_result(entries_after_heal: usize, waiting_at_end: usize) -> SimResult {
        SimResult {
            seed_used: [0; 32],
            rounds_completed: 100,
            live_nodes: 4,
            healed_at_round: Some(50),
            cs_stats: CsStats {
                entries_after_heal,
                waiting_at_end,
                ..CsStats::default()
            },
            recovery_stats: RecoveryStats::default(),
            message_stats: MessageStats::default(),
        }
    }

    #[test]
    fn test_stall_after_heal() {
        assert!(!healed_result(7, 2).stalled_after_heal());
        assert!(healed_result(0, 0).stalled_after_heal());
        assert!(healed_result(7, 4).stalled_after_heal());

        let mut never_healed = healed_result(0, 4);
        never_healed.healed_at_round = None;
        assert!(!never_healed.stalled_after_heal());
    }
}

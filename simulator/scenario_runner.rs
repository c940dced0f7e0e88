// Scenario Runner - Load and execute scenario YAML files
//
// Usage:
//   cargo run --bin scenario_runner scenarios/holder_crash.yaml
//   cargo run --bin scenario_runner scenarios/  (runs all .yaml files in directory)
//   cargo run --bin scenario_runner scenarios/holder_crash.yaml --seed 0x1234...

mod queue_sim;

use queue_sim::stats::SimResult;
use queue_sim::{NetworkConfig, QueueSimConfig, QueueSimRunner, ScheduledEvent, WorkloadConfig};
use nt_rust::ProtocolConfig;
use std::env;
use std::fs;
use std::path::Path;

/// Simplified scenario file format
#[derive(Debug, serde::Deserialize)]
struct ScenarioFile {
    /// Scenario metadata
    #[serde(default)]
    meta: ScenarioMeta,

    /// Configuration overrides
    config: ScenarioConfig,

    /// Event schedule
    #[serde(default)]
    events: Vec<ScheduledEvent>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct ScenarioMeta {
    name: Option<String>,
    description: Option<String>,
    hypothesis: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct ScenarioConfig {
    rounds: usize,

    num_nodes: u32,

    #[serde(default)]
    protocol: Option<ProtocolConfig>,

    #[serde(default)]
    workload: Option<WorkloadConfig>,

    #[serde(default)]
    network: Option<NetworkConfig>,
}

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <scenario.yaml | directory/> [--seed SEED_HEX]", args[0]);
        eprintln!("\nExamples:");
        eprintln!("  {} scenarios/holder_crash.yaml", args[0]);
        eprintln!("  {} scenarios/", args[0]);
        eprintln!("  {} scenarios/holder_crash.yaml --seed 0x123456...", args[0]);
        std::process::exit(1);
    }

    let path = Path::new(&args[1]);

    // Parse optional seed
    let seed: Option<[u8; 32]> = if args.len() >= 4 && args[2] == "--seed" {
        match parse_seed_hex(&args[3]) {
            Ok(seed) => Some(seed),
            Err(e) => {
                eprintln!("Invalid hex seed: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let all_safe = if path.is_file() {
        run_scenario_file(path, seed)
    } else if path.is_dir() {
        run_scenario_directory(path, seed)
    } else {
        eprintln!("Error: Path does not exist: {}", path.display());
        std::process::exit(1);
    };

    if !all_safe {
        std::process::exit(2);
    }
}

fn run_scenario_directory(dir: &Path, seed: Option<[u8; 32]>) -> bool {
    let mut scenarios = Vec::new();

    // Find all .yaml files
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let ext = path.extension().and_then(|s| s.to_str());
            if ext == Some("yaml") || ext == Some("yml") {
                scenarios.push(path);
            }
        }
    }

    scenarios.sort();

    if scenarios.is_empty() {
        eprintln!("No .yaml files found in {}", dir.display());
        std::process::exit(1);
    }

    println!("\n╔════════════════════════════════════════════════════════╗");
    println!("║  SCENARIO RUNNER - Multiple Scenarios                 ║");
    println!("╚════════════════════════════════════════════════════════╝\n");
    println!("Found {} scenario(s) to run\n", scenarios.len());

    let mut all_safe = true;
    for (i, scenario_path) in scenarios.iter().enumerate() {
        println!("\n{}/{} Running: {}\n", i + 1, scenarios.len(), scenario_path.display());
        all_safe &= run_scenario_file(scenario_path, seed);
    }

    println!("\n╔════════════════════════════════════════════════════════╗");
    println!("║  All scenarios complete!                               ║");
    println!("╚════════════════════════════════════════════════════════╝\n");
    all_safe
}

/// Returns false when the run broke mutual exclusion on a loss-free network
fn run_scenario_file(path: &Path, seed: Option<[u8; 32]>) -> bool {
    println!("Loading scenario from: {}", path.display());

    let yaml_content = fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("Failed to read {}: {}", path.display(), e);
        std::process::exit(1);
    });

    let scenario: ScenarioFile = serde_yaml::from_str(&yaml_content).unwrap_or_else(|e| {
        eprintln!("Failed to parse {}: {}", path.display(), e);
        std::process::exit(1);
    });

    // Print scenario header
    println!("\n╔════════════════════════════════════════════════════════╗");
    match scenario.meta.name {
        Some(ref name) => {
            println!("║  {}  {}", name, " ".repeat(54_usize.saturating_sub(name.len())))
        }
        None => println!(
            "║  Scenario: {}  ",
            path.file_stem().and_then(|s| s.to_str()).unwrap_or("?")
        ),
    }
    println!("╚════════════════════════════════════════════════════════╝\n");

    if let Some(ref desc) = scenario.meta.description {
        println!("{}\n", desc);
    }

    if let Some(ref hypothesis) = scenario.meta.hypothesis {
        println!("Hypothesis:");
        println!("  {}\n", hypothesis);
    }

    // Build configuration
    let mut config = QueueSimConfig {
        rounds: scenario.config.rounds,
        num_nodes: scenario.config.num_nodes,
        seed,
        events: scenario.events,
        ..QueueSimConfig::default()
    };
    if let Some(protocol) = scenario.config.protocol {
        config.protocol = protocol;
    }
    if let Some(workload) = scenario.config.workload {
        config.workload = workload;
    }
    if let Some(network) = scenario.config.network {
        config.network = network;
    }
    let lossy = config.network.is_lossy();

    println!("Configuration:");
    println!("  Rounds: {}", config.rounds);
    println!("  Nodes: {}", config.num_nodes);
    println!("  Fault tolerance k: {}", config.protocol.fault_tolerance);
    println!(
        "  Request probability: {:.2}",
        config.workload.request_probability
    );
    println!(
        "  Network: loss={:.2} delay={:.2} corruption={:.2}",
        config.network.loss_fraction,
        config.network.delay_fraction,
        config.network.corruption_fraction
    );
    println!("  Scheduled events: {}", config.events.len());
    println!("\nStarting simulation...\n");

    let runner = QueueSimRunner::new(config);
    let result = runner.run();

    result.print_summary();
    judge(&result, lossy)
}

/// A scenario fails on any overlap without loss, or when requests stay
/// unserved after the network heals
fn judge(result: &SimResult, lossy: bool) -> bool {
    let violations = result.cs_stats.safety_violations;
    if result.stalled_after_heal() {
        println!(
            "✗ Requests stalled after the network healed ({} waiting, {} entries since)\n",
            result.cs_stats.waiting_at_end, result.cs_stats.entries_after_heal
        );
        false
    } else if violations > 0 && lossy {
        println!("⚠ {} safety violation(s) on a lossy network\n", violations);
        true
    } else if violations > 0 {
        println!("✗ Mutual exclusion violated {} time(s)\n", violations);
        false
    } else {
        println!("\n✓ Scenario complete!\n");
        true
    }
}

fn parse_seed_hex(hex: &str) -> Result<[u8; 32], std::num::ParseIntError> {
    let hex = hex.strip_prefix("0x").unwrap_or(hex);
    let mut seed = [0u8; 32];

    for (i, chunk) in hex.as_bytes().chunks(2).take(32).enumerate() {
        let byte_str = String::from_utf8_lossy(chunk);
        seed[i] = u8::from_str_radix(&byte_str, 16)?;
    }

    Ok(seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue_sim::config::SimEvent;
    use crate::queue_sim::stats::{CsStats, MessageStats, RecoveryStats};

    #[test]
    fn test_parse_seed_hex() {
        let seed = parse_seed_hex("0x0aff").unwrap();
        assert_eq!(seed[0], 0x0a);
        assert_eq!(seed[1], 0xff);
        assert!(seed[2..].iter().all(|&b| b == 0));
        assert!(parse_seed_hex("zz").is_err());
    }

    #[test]
    fn test_scenario_file_parses() {
        let yaml = r#"
meta:
  name: holder crash
config:
  rounds: 300
  num_nodes: 4
  protocol:
    fault_tolerance: 1
    request_timeout: 30
  network:
    loss_fraction: 0.01
events:
  - round: 50
    type: crash_token_holder
  - round: 80
    type: crash
    node: 3
  - round: 120
    type: network_condition
    loss_fraction: 0.0
    corruption_fraction: 0.0
"#;
        let scenario: ScenarioFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(scenario.config.num_nodes, 4);
        let protocol = scenario.config.protocol.unwrap();
        assert_eq!(protocol.fault_tolerance, 1);
        assert_eq!(protocol.msg_timeout, ProtocolConfig::default().msg_timeout);
        assert_eq!(scenario.events.len(), 3);
        assert_eq!(scenario.events[0].event, SimEvent::CrashTokenHolder);
        assert_eq!(scenario.events[1].event, SimEvent::Crash { node: 3 });
        assert_eq!(
            scenario.events[2].event,
            SimEvent::NetworkCondition {
                delay_fraction: None,
                loss_fraction: Some(0.0),
                corruption_fraction: Some(0.0),
            }
        );
    }

    fn result(healed_at_round: Option<usize>, entries_after_heal: usize) -> SimResult {
        SimResult {
            seed_used: [0; 32],
            rounds_completed: 600,
            live_nodes: 5,
            healed_at_round,
            cs_stats: CsStats {
                entries_after_heal,
                waiting_at_end: 5,
                ..CsStats::default()
            },
            recovery_stats: RecoveryStats::default(),
            message_stats: MessageStats::default(),
        }
    }

    #[test]
    fn test_stall_after_heal_fails_scenario() {
        assert!(!judge(&result(Some(300), 0), true));
        assert!(!judge(&result(Some(300), 12), true));

        let mut served = result(Some(300), 12);
        served.cs_stats.waiting_at_end = 1;
        served.cs_stats.safety_violations = 1;
        assert!(judge(&served, true));
        assert!(!judge(&served, false));

        assert!(judge(&result(None, 0), false));
    }
}

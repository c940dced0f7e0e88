//! Token Queue Simulation Example
//!
//! Run with: cargo run --example queue_simulation

mod queue_sim;

use log::info;
use queue_sim::config::SimEvent;
use queue_sim::{NetworkConfig, QueueSimConfig, ScheduledEvent, WorkloadConfig};
use simple_logger::SimpleLogger;

fn main() {
    if let Err(e) = SimpleLogger::new().with_level(log::LevelFilter::Info).init() {
        eprintln!("cannot initialise logger: {}", e);
    }

    println!("╔════════════════════════════════════════════════════════╗");
    println!("║        Token Queue Simulator                           ║");
    println!("╚════════════════════════════════════════════════════════╝\n");

    info!("Setting up token queue simulation...");

    let config = QueueSimConfig {
        rounds: 1000,
        num_nodes: 8,
        seed: None, // Will be auto-generated

        workload: WorkloadConfig {
            request_probability: 0.05,
            cs_rounds: 3,
        },

        network: NetworkConfig {
            delay_fraction: 0.1,
            loss_fraction: 0.0,
            corruption_fraction: 0.0,
            max_delay_rounds: 1,
        },

        // lose the token twice, then a queued node
        events: vec![
            ScheduledEvent {
                round: 200,
                event: SimEvent::CrashTokenHolder,
            },
            ScheduledEvent {
                round: 500,
                event: SimEvent::CrashTokenHolder,
            },
            ScheduledEvent {
                round: 700,
                event: SimEvent::Crash { node: 5 },
            },
        ],

        ..QueueSimConfig::default()
    };

    info!("Configuration:");
    info!("  Nodes: {}", config.num_nodes);
    info!("  Rounds: {}", config.rounds);
    info!("  Request probability: {}", config.workload.request_probability);
    info!("  Network delay: {}", config.network.delay_fraction);
    info!("  Network loss: {}", config.network.loss_fraction);
    info!("");

    info!("Starting simulation...");

    let runner = queue_sim::QueueSimRunner::new(config);
    let result = runner.run();

    // Display results
    result.print_summary();

    info!("✓ Simulation complete!");
}

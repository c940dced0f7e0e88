use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{error, info, LevelFilter};
use rand::Rng;
use simple_logger::SimpleLogger;

use nt_rust::{
    ClusterConfig, ConfigError, FaultConfig, FaultInjector, FaultyTransport, LogEventSink,
    MutualExclusion, NodeHandle, NodeId, NtNode, TcpTransport, Transport,
};

const ENV_FILE: &str = "config.env";
const YAML_FILE: &str = "config.yaml";

/// Time spent inside the critical section per round
const CS_DURATION: Duration = Duration::from_millis(500);

fn load_cluster() -> Result<ClusterConfig, ConfigError> {
    if Path::new(ENV_FILE).exists() {
        ClusterConfig::from_env_file(ENV_FILE)
    } else if Path::new(YAML_FILE).exists() {
        let yaml = std::fs::read_to_string(YAML_FILE).map_err(|e| ConfigError::Io {
            path: YAML_FILE.to_string(),
            reason: e.to_string(),
        })?;
        ClusterConfig::from_yaml_str(&yaml)
    } else {
        ClusterConfig::from_env()
    }
}

fn parse_node_id() -> Option<NodeId> {
    std::env::args().nth(1)?.parse().ok().filter(|&id| id > 0)
}

fn main() -> ExitCode {
    if let Err(e) = SimpleLogger::new().with_level(LevelFilter::Info).env().init() {
        eprintln!("cannot initialise logger: {}", e);
    }

    let Some(id) = parse_node_id() else {
        eprintln!("Usage: naimi-trehel <node_id>");
        return ExitCode::FAILURE;
    };

    let cluster = match load_cluster() {
        Ok(cluster) => cluster,
        Err(e) => {
            error!("configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if !cluster.contains(id) {
        error!(
            "node {} is not part of the {}-node cluster",
            id,
            cluster.total_nodes()
        );
        return ExitCode::FAILURE;
    }

    let faults = match FaultConfig::from_env() {
        Ok(faults) => faults,
        Err(e) => {
            error!("fault configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let tcp = match TcpTransport::bind(id, &cluster) {
        Ok(tcp) => tcp,
        Err(e) => {
            error!("node {} cannot listen: {}", id, e);
            return ExitCode::FAILURE;
        }
    };
    let transport: Arc<dyn Transport> = if faults.is_enabled() {
        info!("fault injection enabled: {:?}", faults);
        Arc::new(FaultyTransport::new(tcp, FaultInjector::from_entropy(faults)))
    } else {
        Arc::new(tcp)
    };

    let node = NtNode::from_cluster(id, &cluster, Box::new(LogEventSink::new()));
    let handle = match NodeHandle::start(node, transport, &cluster.protocol) {
        Ok(handle) => handle,
        Err(e) => {
            error!("node {} cannot start: {}", id, e);
            return ExitCode::FAILURE;
        }
    };
    info!("node {} started, {} nodes in cluster", id, cluster.total_nodes());

    let mut rng = rand::thread_rng();
    loop {
        thread::sleep(Duration::from_secs(rng.gen_range(0..=5)));
        handle.request_token();
        info!("node {} enter cs", id);
        thread::sleep(CS_DURATION);
        handle.release_token();
    }
}

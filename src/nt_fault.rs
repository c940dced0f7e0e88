use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::nt_config::ConfigError;
use crate::nt_interface::NodeId;
use crate::nt_transport::{Transport, TransportError};

/// Marker appended to a payload by the corruption fault
pub const MODIFIED_MARKER: &str = "(Modified)";

/// Per-message fault probabilities, all zero by default
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    pub loss: f64,
    pub delay: f64,
    pub corruption: f64,

    /// Recoverable network outage of the sending node
    pub disconnect: f64,

    /// Permanent loss of the sending node
    pub crash: f64,

    pub delay_ms: u64,
    pub outage_ms: u64,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            loss: 0.0,
            delay: 0.0,
            corruption: 0.0,
            disconnect: 0.0,
            crash: 0.0,
            delay_ms: 200,
            outage_ms: 5000,
        }
    }
}

impl FaultConfig {
    /// Read the optional `NT_FAULT_*` keys; absent keys keep their defaults
    pub fn from_key_values<I, K, V>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let values: HashMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let mut config = FaultConfig::default();
        let probabilities: [(&str, &mut f64); 5] = [
            ("NT_FAULT_LOSS", &mut config.loss),
            ("NT_FAULT_DELAY", &mut config.delay),
            ("NT_FAULT_CORRUPTION", &mut config.corruption),
            ("NT_FAULT_DISCONNECT", &mut config.disconnect),
            ("NT_FAULT_CRASH", &mut config.crash),
        ];
        for (key, slot) in probabilities {
            if let Some(raw) = values.get(key) {
                *slot = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: raw.clone(),
                })?;
            }
        }
        for (key, slot) in [
            ("NT_FAULT_DELAY_MS", &mut config.delay_ms),
            ("NT_FAULT_OUTAGE_MS", &mut config.outage_ms),
        ] {
            if let Some(raw) = values.get(key) {
                *slot = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: raw.clone(),
                })?;
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_key_values(std::env::vars())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let all = [
            self.loss,
            self.delay,
            self.corruption,
            self.disconnect,
            self.crash,
        ];
        if all.iter().any(|p| !(0.0..=1.0).contains(p)) {
            return Err(ConfigError::Invalid(
                "fault probabilities must lie in [0, 1]".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.loss > 0.0
            || self.delay > 0.0
            || self.corruption > 0.0
            || self.disconnect > 0.0
            || self.crash > 0.0
    }
}

/// Fate of one outgoing message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Deliver,
    Lose,
    Delay,
    Corrupt,
    /// Sender goes offline for a while
    Disconnect,
    /// Sender dies for good
    Crash,
}

/// Seeded dice for the fault model; the same seed replays the same faults
pub struct FaultInjector {
    config: FaultConfig,
    rng: StdRng,
}

impl FaultInjector {
    pub fn new(config: FaultConfig, seed: [u8; 32]) -> Self {
        Self {
            config,
            rng: StdRng::from_seed(seed),
        }
    }

    pub fn from_entropy(config: FaultConfig) -> Self {
        Self {
            config,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn config(&self) -> &FaultConfig {
        &self.config
    }

    /// Node faults are drawn before message faults
    pub fn judge(&mut self) -> Verdict {
        if self.roll(self.config.crash) {
            Verdict::Crash
        } else if self.roll(self.config.disconnect) {
            Verdict::Disconnect
        } else if self.roll(self.config.loss) {
            Verdict::Lose
        } else if self.roll(self.config.delay) {
            Verdict::Delay
        } else if self.roll(self.config.corruption) {
            Verdict::Corrupt
        } else {
            Verdict::Deliver
        }
    }

    pub fn corrupt(payload: &str) -> String {
        format!("{}{}", payload, MODIFIED_MARKER)
    }

    fn roll(&mut self, probability: f64) -> bool {
        probability > 0.0 && self.rng.gen::<f64>() < probability
    }
}

/// Transport wrapper applying a `FaultInjector` to every send.
///
/// While disconnected or crashed the node neither sends nor receives;
/// inbound traffic during an outage is drained and lost.
pub struct FaultyTransport<T: Transport> {
    inner: Arc<T>,
    injector: Mutex<FaultInjector>,
    outage_until: Mutex<Option<Instant>>,
    crashed: AtomicBool,
}

impl<T: Transport + 'static> FaultyTransport<T> {
    pub fn new(inner: T, injector: FaultInjector) -> Self {
        Self {
            inner: Arc::new(inner),
            injector: Mutex::new(injector),
            outage_until: Mutex::new(None),
            crashed: AtomicBool::new(false),
        }
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::Acquire)
    }

    pub fn is_offline(&self) -> bool {
        if self.is_crashed() {
            return true;
        }
        let mut outage = self
            .outage_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match *outage {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                *outage = None;
                log::info!("network restored");
                false
            }
            None => false,
        }
    }

    fn delay_ms(&self) -> u64 {
        self.injector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .config()
            .delay_ms
    }
}

impl<T: Transport + 'static> Transport for FaultyTransport<T> {
    fn send(&self, to: NodeId, payload: &str) -> Result<(), TransportError> {
        if self.is_offline() {
            return Err(TransportError::Disconnected);
        }
        let verdict = self
            .injector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .judge();

        match verdict {
            Verdict::Deliver => self.inner.send(to, payload),
            Verdict::Lose => {
                log::debug!("fault: lost message to {}: {}", to, payload);
                Ok(())
            }
            Verdict::Delay => {
                let inner = self.inner.clone();
                let payload = payload.to_string();
                let delay = Duration::from_millis(self.delay_ms());
                log::debug!("fault: delaying message to {} by {:?}", to, delay);
                thread::spawn(move || {
                    thread::sleep(delay);
                    if let Err(e) = inner.send(to, &payload) {
                        log::debug!("delayed message to {} failed: {}", to, e);
                    }
                });
                Ok(())
            }
            Verdict::Corrupt => {
                let modified = FaultInjector::corrupt(payload);
                log::debug!("fault: modified message to {}: {}", to, modified);
                self.inner.send(to, &modified)
            }
            Verdict::Disconnect => {
                let outage = Duration::from_millis(
                    self.injector
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .config()
                        .outage_ms,
                );
                *self
                    .outage_until
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now() + outage);
                log::warn!("fault: network disconnected for {:?}", outage);
                Err(TransportError::Disconnected)
            }
            Verdict::Crash => {
                self.crashed.store(true, Ordering::Release);
                log::warn!("fault: node crashed");
                Err(TransportError::Disconnected)
            }
        }
    }

    fn receive(&self, timeout: Duration) -> Result<Option<String>, TransportError> {
        let line = self.inner.receive(timeout)?;
        if self.is_offline() {
            return Ok(None);
        }
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nt_transport::MemoryNetwork;

    const WAIT: Duration = Duration::from_millis(300);

    fn only(verdict: Verdict) -> FaultConfig {
        let mut config = FaultConfig::default();
        match verdict {
            Verdict::Lose => config.loss = 1.0,
            Verdict::Delay => config.delay = 1.0,
            Verdict::Corrupt => config.corruption = 1.0,
            Verdict::Disconnect => config.disconnect = 1.0,
            Verdict::Crash => config.crash = 1.0,
            Verdict::Deliver => {}
        }
        config
    }

    #[test]
    fn test_default_config_is_disabled() {
        let config = FaultConfig::default();
        assert!(!config.is_enabled());
        let mut injector = FaultInjector::new(config, [7u8; 32]);
        assert!((0..100).all(|_| injector.judge() == Verdict::Deliver));
    }

    #[test]
    fn test_same_seed_same_faults() {
        let config = FaultConfig {
            loss: 0.3,
            delay: 0.3,
            ..FaultConfig::default()
        };
        let mut a = FaultInjector::new(config.clone(), [3u8; 32]);
        let mut b = FaultInjector::new(config, [3u8; 32]);
        let run_a: Vec<Verdict> = (0..50).map(|_| a.judge()).collect();
        let run_b: Vec<Verdict> = (0..50).map(|_| b.judge()).collect();
        assert_eq!(run_a, run_b);
        assert!(run_a.contains(&Verdict::Lose));
    }

    #[test]
    fn test_crash_takes_precedence() {
        let config = FaultConfig {
            crash: 1.0,
            loss: 1.0,
            ..FaultConfig::default()
        };
        let mut injector = FaultInjector::new(config, [0u8; 32]);
        assert_eq!(injector.judge(), Verdict::Crash);
    }

    #[test]
    fn test_from_key_values() {
        let config = FaultConfig::from_key_values(vec![
            ("NT_FAULT_LOSS", "0.25"),
            ("NT_FAULT_DELAY_MS", "50"),
            ("TOTAL_NODES", "3"),
        ])
        .unwrap();
        assert_eq!(config.loss, 0.25);
        assert_eq!(config.delay_ms, 50);
        assert!(config.is_enabled());

        let bad = FaultConfig::from_key_values(vec![("NT_FAULT_CRASH", "often")]);
        assert!(matches!(bad, Err(ConfigError::InvalidValue { .. })));
        let out_of_range = FaultConfig::from_key_values(vec![("NT_FAULT_LOSS", "1.5")]);
        assert!(matches!(out_of_range, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_corruption_appends_marker() {
        let network = MemoryNetwork::new();
        let a = FaultyTransport::new(
            network.join(1),
            FaultInjector::new(only(Verdict::Corrupt), [1u8; 32]),
        );
        let b = network.join(2);

        a.send(2, "TOKEN 1").unwrap();
        assert_eq!(b.receive(WAIT).unwrap().as_deref(), Some("TOKEN 1(Modified)"));
    }

    #[test]
    fn test_loss_and_delay() {
        let network = MemoryNetwork::new();
        let lossy = FaultyTransport::new(
            network.join(1),
            FaultInjector::new(only(Verdict::Lose), [1u8; 32]),
        );
        let mut slow_config = only(Verdict::Delay);
        slow_config.delay_ms = 20;
        let slow = FaultyTransport::new(network.join(3), FaultInjector::new(slow_config, [1u8; 32]));
        let b = network.join(2);

        lossy.send(2, "PING 1").unwrap();
        assert_eq!(b.receive(Duration::from_millis(50)).unwrap(), None);

        slow.send(2, "PING 3").unwrap();
        assert_eq!(b.receive(WAIT).unwrap().as_deref(), Some("PING 3"));
    }

    #[test]
    fn test_crash_silences_node() {
        let network = MemoryNetwork::new();
        let a = FaultyTransport::new(
            network.join(1),
            FaultInjector::new(only(Verdict::Crash), [1u8; 32]),
        );
        let b = network.join(2);

        assert_eq!(a.send(2, "PING 1"), Err(TransportError::Disconnected));
        assert!(a.is_crashed());

        b.send(1, "PONG 2").unwrap();
        assert_eq!(a.receive(Duration::from_millis(50)).unwrap(), None);
    }

    #[test]
    fn test_disconnect_is_temporary() {
        let network = MemoryNetwork::new();
        let mut config = only(Verdict::Disconnect);
        config.outage_ms = 30;
        let a = FaultyTransport::new(network.join(1), FaultInjector::new(config, [1u8; 32]));

        assert_eq!(a.send(2, "PING 1"), Err(TransportError::Disconnected));
        assert!(a.is_offline());
        thread::sleep(Duration::from_millis(60));
        assert!(!a.is_offline());
        assert!(!a.is_crashed());
    }
}

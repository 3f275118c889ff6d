use crate::core::{ChaosAction, DeviceId, NodeIdentity, Topics};
use crate::logging::LogLevel;
use crate::lock::RecoveryPolicy;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("cannot read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("cannot parse config: {0}")]
  Parse(#[from] toml::de::Error),
  #[error("invalid config: {0}")]
  Invalid(String),
}

mod millis {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    u64::deserialize(d).map(Duration::from_millis)
  }
}

mod opt_millis {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
      Some(d) => s.serialize_some(&(d.as_millis() as u64)),
      None => s.serialize_none(),
    }
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
    Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
  }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
  /// How often a follower checks whether the coordinator's lease is still fresh.
  ///
  /// default: `1 second`
  #[serde(rename = "lease_poll_ms", with = "millis")]
  pub lease_poll: Duration,
  /// How long a lease stays valid after it was last observed.
  ///
  /// default: `5 seconds`
  #[serde(rename = "lease_duration_ms", with = "millis")]
  pub lease_duration: Duration,
  /// How often the coordinator re-broadcasts its lease. MUST be shorter than `lease_duration`.
  ///
  /// default: `2 seconds`
  #[serde(rename = "lease_renew_ms", with = "millis")]
  pub lease_renew: Duration,
  /// How long a candidate waits for an ALIVE from a higher-ranked node.
  ///
  /// default: `2 seconds`
  #[serde(rename = "election_timeout_ms", with = "millis")]
  pub election_timeout: Duration,
  /// How long a candidate collects quorum acks before deciding.
  ///
  /// default: `1 second`
  #[serde(rename = "quorum_wait_ms", with = "millis")]
  pub quorum_wait: Duration,
}
impl Default for ElectionConfig {
  fn default() -> Self {
    ElectionConfig {
      lease_poll: Duration::from_millis(1000),
      lease_duration: Duration::from_millis(5000),
      lease_renew: Duration::from_millis(2000),
      election_timeout: Duration::from_millis(2000),
      quorum_wait: Duration::from_millis(1000),
    }
  }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
  /// How long a client keeps the lock once granted.
  ///
  /// default: `3 seconds`
  #[serde(rename = "critical_section_ms", with = "millis")]
  pub critical_section: Duration,
  /// Slack added to `critical_section` before the coordinator force-releases a silent holder.
  ///
  /// default: `2 seconds`
  #[serde(rename = "watchdog_margin_ms", with = "millis")]
  pub watchdog_margin: Duration,
  /// If set, the node asks for the lock on this period whenever it neither holds nor waits for it.
  ///
  /// default: `None`
  #[serde(rename = "lock_attempt_interval_ms", with = "opt_millis")]
  pub lock_attempt_interval: Option<Duration>,
  /// Where the write-ahead log lives. `None` keeps it in memory.
  ///
  /// default: `None`
  pub wal_path: Option<PathBuf>,
  /// What to do with a torn final frame when the log is opened.
  ///
  /// default: `RecoveryPolicy::TruncateTail`
  pub recovery: RecoveryPolicy,
}
impl LockConfig {
  pub fn watchdog(&self) -> Duration {
    self.critical_section + self.watchdog_margin
  }
}
impl Default for LockConfig {
  fn default() -> Self {
    LockConfig {
      critical_section: Duration::from_millis(3000),
      watchdog_margin: Duration::from_millis(2000),
      lock_attempt_interval: None,
      wal_path: None,
      recovery: RecoveryPolicy::TruncateTail,
    }
  }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
  /// Speed of the local clock relative to real time. `1.0` is a perfect clock.
  ///
  /// default: `1.0`
  pub drift_rate: f64,
  /// Time samples with a longer round trip are discarded.
  ///
  /// default: `500 milliseconds`
  #[serde(rename = "max_rtt_ms", with = "millis")]
  pub max_rtt: Duration,
  /// How often to ask the time source for the time.
  ///
  /// default: `10 seconds`
  #[serde(rename = "sync_interval_ms", with = "millis")]
  pub sync_interval: Duration,
  /// Inbound messages whose vector stamp (in any slot) or Lamport stamp runs more than this many
  /// ticks ahead of local knowledge are dropped. `None` accepts everything.
  ///
  /// default: `None`
  pub max_vector_jump: Option<u64>,
}
impl Default for ClockConfig {
  fn default() -> Self {
    ClockConfig {
      drift_rate: 1.0,
      max_rtt: Duration::from_millis(500),
      sync_interval: Duration::from_millis(10000),
      max_vector_jump: None,
    }
  }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
  /// default: `5 seconds`
  #[serde(rename = "telemetry_interval_ms", with = "millis")]
  pub telemetry_interval: Duration,
  /// How often the node re-announces itself online.
  ///
  /// default: `5 seconds`
  #[serde(rename = "heartbeat_interval_ms", with = "millis")]
  pub heartbeat_interval: Duration,
  /// default: `5 seconds`
  #[serde(rename = "gossip_interval_ms", with = "millis")]
  pub gossip_interval: Duration,
  /// Turns off telemetry publishing only. Presence and gossip stay on.
  ///
  /// default: `true`
  pub enabled: bool,
}
impl Default for TelemetryConfig {
  fn default() -> Self {
    TelemetryConfig {
      telemetry_interval: Duration::from_millis(5000),
      heartbeat_interval: Duration::from_millis(5000),
      gossip_interval: Duration::from_millis(5000),
      enabled: true,
    }
  }
}

/// Everything one node needs to run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
  pub id: DeviceId,
  pub priority: u32,
  pub vector_index: usize,
  pub total_nodes: usize,
  #[serde(default)]
  pub topics: Topics,
  #[serde(default)]
  pub election: ElectionConfig,
  #[serde(default)]
  pub lock: LockConfig,
  #[serde(default)]
  pub clock: ClockConfig,
  #[serde(default)]
  pub telemetry: TelemetryConfig,
  #[serde(default)]
  pub log_level: LogLevel,
}
impl NodeConfig {
  /// A node with default settings for every section.
  pub fn new(id: DeviceId, priority: u32, vector_index: usize, total_nodes: usize) -> NodeConfig {
    NodeConfig {
      id: id,
      priority: priority,
      vector_index: vector_index,
      total_nodes: total_nodes,
      topics: Topics::default(),
      election: ElectionConfig::default(),
      lock: LockConfig::default(),
      clock: ClockConfig::default(),
      telemetry: TelemetryConfig::default(),
      log_level: LogLevel::default(),
    }
  }

  pub fn identity(&self) -> NodeIdentity {
    NodeIdentity::new(self.id.clone(), self.priority, self.vector_index, self.total_nodes)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    let invalid = |msg: String| Err(ConfigError::Invalid(format!("{}: {}", self.id, msg)));
    if self.id.as_str().is_empty() || self.id.as_str().contains(['/', '+', '#']) {
      return invalid(format!("{:?} is not a usable device id", self.id.as_str()));
    }
    if self.total_nodes == 0 {
      return invalid("total_nodes must be at least 1".to_string());
    }
    if self.vector_index >= self.total_nodes {
      return invalid(format!(
        "vector_index {} is out of range for {} nodes",
        self.vector_index, self.total_nodes
      ));
    }
    if self.election.lease_renew >= self.election.lease_duration {
      return invalid(format!(
        "lease_renew ({:?}) must be shorter than lease_duration ({:?})",
        self.election.lease_renew, self.election.lease_duration
      ));
    }
    if !(self.clock.drift_rate.is_finite() && self.clock.drift_rate > 0.0) {
      return invalid(format!("drift_rate must be positive, got {}", self.clock.drift_rate));
    }
    if self.lock.critical_section.is_zero() {
      return invalid("critical_section must be positive".to_string());
    }
    Ok(())
  }
}

/// One member of a fleet. Settings left out are taken from the fleet's shared sections.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FleetNode {
  pub id: DeviceId,
  pub priority: u32,
  #[serde(default)]
  pub drift_rate: Option<f64>,
  #[serde(default)]
  pub wal_path: Option<PathBuf>,
}

/// A KILL or REVIVE the simulator publishes on the chaos channel at a fixed point in time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledChaos {
  pub at_ms: u64,
  pub target: DeviceId,
  pub action: ChaosAction,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
  pub topics: Topics,
  pub log_level: LogLevel,
  pub election: ElectionConfig,
  pub lock: LockConfig,
  pub clock: ClockConfig,
  pub telemetry: TelemetryConfig,
  pub nodes: Vec<FleetNode>,
  /// Whether the simulator also runs a time source.
  ///
  /// default: `true`
  pub time_server: bool,
  /// Whether the simulator also runs the chaos attacker.
  ///
  /// default: `false`
  pub attacker: bool,
  pub chaos: Vec<ScheduledChaos>,
}
impl Default for FleetConfig {
  fn default() -> Self {
    let nodes = (1..=5)
      .map(|i| FleetNode {
        id: DeviceId::new(format!("sensor-{:03}", i)),
        priority: i,
        drift_rate: None,
        wal_path: None,
      })
      .collect();
    FleetConfig {
      topics: Topics::default(),
      log_level: LogLevel::default(),
      election: ElectionConfig::default(),
      lock: LockConfig::default(),
      clock: ClockConfig::default(),
      telemetry: TelemetryConfig::default(),
      nodes: nodes,
      time_server: true,
      attacker: false,
      chaos: vec![],
    }
  }
}
impl FleetConfig {
  pub fn load<P: AsRef<Path>>(path: P) -> Result<FleetConfig, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
      path: path.to_path_buf(),
      source: e,
    })?;
    FleetConfig::parse(&text)
  }

  pub fn parse(text: &str) -> Result<FleetConfig, ConfigError> {
    let config: FleetConfig = toml::from_str(text)?;
    config.validate()?;
    Ok(config)
  }

  /// Per-node configs, with vector slots assigned in listing order.
  pub fn node_configs(&self) -> Vec<NodeConfig> {
    let total = self.nodes.len();
    self
      .nodes
      .iter()
      .enumerate()
      .map(|(i, node)| {
        let mut config = NodeConfig::new(node.id.clone(), node.priority, i, total);
        config.topics = self.topics.clone();
        config.election = self.election.clone();
        config.lock = self.lock.clone();
        config.clock = self.clock.clone();
        config.telemetry = self.telemetry.clone();
        config.log_level = self.log_level;
        if let Some(rate) = node.drift_rate {
          config.clock.drift_rate = rate;
        }
        if let Some(path) = &node.wal_path {
          config.lock.wal_path = Some(path.clone());
        }
        config
      })
      .collect()
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.nodes.is_empty() {
      return Err(ConfigError::Invalid("a fleet needs at least one node".to_string()));
    }
    if let Some(dup) = self.nodes.iter().map(|n| &n.id).duplicates().next() {
      return Err(ConfigError::Invalid(format!("duplicate node id {}", dup)));
    }
    for node in self.node_configs() {
      node.validate()?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_valid() {
    FleetConfig::default().validate().unwrap();
    NodeConfig::new("a".into(), 1, 0, 1).validate().unwrap();
    assert_eq!(LockConfig::default().watchdog(), Duration::from_secs(5));
  }

  #[test]
  fn parse_fills_in_defaults() {
    let config = FleetConfig::parse(
      r#"
        log_level = "debug"
        attacker = true

        [election]
        lease_duration_ms = 3000
        lease_renew_ms = 1000

        [clock]
        max_vector_jump = 10

        [[nodes]]
        id = "sensor-001"
        priority = 1
        drift_rate = 1.2

        [[nodes]]
        id = "sensor-002"
        priority = 2
        wal_path = "/tmp/sensor-002.wal"

        [[chaos]]
        at_ms = 20000
        target = "sensor-002"
        action = "KILL"
      "#,
    )
    .unwrap();
    assert_eq!(config.log_level, LogLevel::Debug);
    assert_eq!(config.election.lease_duration, Duration::from_secs(3));
    assert_eq!(config.election.lease_poll, Duration::from_secs(1));
    assert!(config.time_server);
    let nodes = config.node_configs();
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0].clock.drift_rate, 1.2);
    assert_eq!(nodes[0].clock.max_vector_jump, Some(10));
    assert_eq!(nodes[1].vector_index, 1);
    assert_eq!(nodes[1].total_nodes, 2);
    assert_eq!(nodes[1].lock.wal_path, Some(PathBuf::from("/tmp/sensor-002.wal")));
    assert_eq!(config.chaos[0].action, ChaosAction::Kill);
  }

  #[test]
  fn rejects_inconsistent_settings() {
    let bad = |text: &str| matches!(FleetConfig::parse(text), Err(ConfigError::Invalid(_)));
    assert!(bad("nodes = []"));
    assert!(bad(
      r#"
        [[nodes]]
        id = "a"
        priority = 1
        [[nodes]]
        id = "a"
        priority = 2
      "#
    ));
    assert!(bad(
      r#"
        [election]
        lease_renew_ms = 5000
        lease_duration_ms = 5000
      "#
    ));
    assert!(bad(
      r#"
        [clock]
        drift_rate = 0.0
      "#
    ));
    let mut node = NodeConfig::new("a".into(), 1, 3, 3);
    assert!(node.validate().is_err());
    node.vector_index = 0;
    node.id = "a/b".into();
    assert!(node.validate().is_err());
    assert!(matches!(FleetConfig::parse("nodes = 3"), Err(ConfigError::Parse(_))));
    assert!(matches!(
      FleetConfig::load("/definitely/not/here.toml"),
      Err(ConfigError::Read { .. })
    ));
  }
}

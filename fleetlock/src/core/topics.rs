use crate::core::DeviceId;
use serde::{Deserialize, Serialize};

/// The fleet's topic layout, rooted at a configurable base.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topics {
  pub base: String,
}
impl Default for Topics {
  fn default() -> Self {
    Topics {
      base: "utp/sistemas_distribuidos/grupo1".to_string(),
    }
  }
}

/// What a concrete topic string addresses. Parameterized topics carry the device they name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TopicKind {
  LockRequest,
  LockRelease,
  LockGrant(DeviceId),
  LockStatus,
  Election,
  Coordinator,
  Lease,
  QuorumCheck,
  QuorumAck,
  TimeRequest,
  TimeResponse(DeviceId),
  ChaosControl,
  Gossip(DeviceId),
  Status(DeviceId),
  Telemetry(DeviceId),
}

impl Topics {
  pub fn new<S: Into<String>>(base: S) -> Topics {
    Topics { base: base.into() }
  }

  fn join(&self, rest: &str) -> String {
    format!("{}/{}", self.base, rest)
  }

  pub fn lock_request(&self) -> String {
    self.join("mutex/request")
  }

  pub fn lock_release(&self) -> String {
    self.join("mutex/release")
  }

  pub fn lock_grant(&self, id: &DeviceId) -> String {
    self.join(&format!("mutex/grant/{}", id))
  }

  pub fn lock_status(&self) -> String {
    self.join("mutex/status")
  }

  pub fn election(&self) -> String {
    self.join("election/messages")
  }

  pub fn coordinator(&self) -> String {
    self.join("election/coordinator")
  }

  pub fn lease(&self) -> String {
    self.join("election/lease")
  }

  pub fn quorum_check(&self) -> String {
    self.join("election/quorum/check")
  }

  pub fn quorum_ack(&self) -> String {
    self.join("election/quorum/ack")
  }

  pub fn time_request(&self) -> String {
    self.join("time/request")
  }

  pub fn time_response(&self, id: &DeviceId) -> String {
    self.join(&format!("time/response/{}", id))
  }

  pub fn chaos_control(&self) -> String {
    self.join("chaos/control")
  }

  pub fn gossip(&self, id: &DeviceId) -> String {
    self.join(&format!("internal/gossip/{}", id))
  }

  pub fn gossip_filter(&self) -> String {
    self.join("internal/gossip/+")
  }

  pub fn status(&self, id: &DeviceId) -> String {
    self.join(&format!("{}/status", id))
  }

  pub fn status_filter(&self) -> String {
    self.join("+/status")
  }

  pub fn telemetry(&self, id: &DeviceId) -> String {
    self.join(&format!("{}/telemetry", id))
  }

  pub fn telemetry_filter(&self) -> String {
    self.join("+/telemetry")
  }

  /// Maps a concrete topic back to what it addresses. Fixed topics are matched before the
  /// per-device families, so a device named `mutex` cannot shadow `mutex/status`.
  pub fn classify(&self, topic: &str) -> Option<TopicKind> {
    let rest = topic.strip_prefix(self.base.as_str())?.strip_prefix('/')?;
    let fixed = match rest {
      "mutex/request" => Some(TopicKind::LockRequest),
      "mutex/release" => Some(TopicKind::LockRelease),
      "mutex/status" => Some(TopicKind::LockStatus),
      "election/messages" => Some(TopicKind::Election),
      "election/coordinator" => Some(TopicKind::Coordinator),
      "election/lease" => Some(TopicKind::Lease),
      "election/quorum/check" => Some(TopicKind::QuorumCheck),
      "election/quorum/ack" => Some(TopicKind::QuorumAck),
      "time/request" => Some(TopicKind::TimeRequest),
      "chaos/control" => Some(TopicKind::ChaosControl),
      _ => None,
    };
    if fixed.is_some() {
      return fixed;
    }
    let device = |s: &str| Some(DeviceId::from(s)).filter(|_| !s.is_empty() && !s.contains('/'));
    if let Some(id) = rest.strip_prefix("mutex/grant/") {
      return device(id).map(TopicKind::LockGrant);
    }
    if let Some(id) = rest.strip_prefix("time/response/") {
      return device(id).map(TopicKind::TimeResponse);
    }
    if let Some(id) = rest.strip_prefix("internal/gossip/") {
      return device(id).map(TopicKind::Gossip);
    }
    if let Some(id) = rest.strip_suffix("/status") {
      return device(id).map(TopicKind::Status);
    }
    if let Some(id) = rest.strip_suffix("/telemetry") {
      return device(id).map(TopicKind::Telemetry);
    }
    None
  }
}

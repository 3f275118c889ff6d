use crate::bus::{Delivery, Publication};
use crate::core::{DeviceId, TopicKind, Topics};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Causality stamp attached to everything a node publishes. Absent on messages from devices that
/// do not keep clocks (operators, the time source).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
  #[serde(rename = "lamport_ts", default, skip_serializing_if = "Option::is_none")]
  pub lamport: Option<u64>,
  #[serde(rename = "vector_clock", default, skip_serializing_if = "Option::is_none")]
  pub vector: Option<Vec<u64>>,
}
impl Stamp {
  pub fn none() -> Stamp {
    Stamp::default()
  }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRef {
  pub device_id: DeviceId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Granted {
  pub status: GrantStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantStatus {
  Granted,
}

/// Aggregate lock state as published, retained, on the status topic.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStatus {
  #[serde(alias = "isAvailable")]
  pub available: bool,
  pub holder: Option<DeviceId>,
  pub queue: Vec<DeviceId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ElectionMsg {
  #[serde(rename = "ELECTION", rename_all = "camelCase")]
  Election { from_priority: u32, from_id: DeviceId },
  #[serde(rename = "ALIVE", rename_all = "camelCase")]
  Alive {
    from_priority: u32,
    from_id: DeviceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to_priority: Option<u32>,
  },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Announcement {
  #[serde(rename = "VICTORY", rename_all = "camelCase")]
  Victory { coordinator_id: DeviceId, priority: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
  pub coordinator_id: DeviceId,
  pub priority: u32,
  pub timestamp: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuorumCheck {
  pub candidate_id: DeviceId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuorumAck {
  pub from: DeviceId,
  pub candidate_id: DeviceId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRequest {
  pub device_id: DeviceId,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub t1: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeResponse {
  pub server_time: u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub t1: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
  Online,
  Offline,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
  #[serde(default)]
  pub device_id: DeviceId,
  pub status: PresenceStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChaosAction {
  Kill,
  Revive,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChaosCommand {
  pub target_id: DeviceId,
  pub action: ChaosAction,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
  pub device_id: DeviceId,
  pub temperatura: f64,
  pub humedad: f64,
  pub timestamp: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GossipView {
  pub sender_id: DeviceId,
  #[serde(alias = "knownPeers")]
  pub known_nodes: Vec<DeviceId>,
}

#[derive(Debug, Error)]
pub enum DecodeError {
  #[error("topic {0:?} is not part of this fleet")]
  UnknownTopic(String),
  #[error("malformed payload on {topic:?}: {source}")]
  Malformed {
    topic: String,
    #[source]
    source: serde_json::Error,
  },
}

/// Every message the fleet exchanges. Decoded once from `(topic, payload)` at the boundary and
/// matched exhaustively afterwards.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
  LockRequest(DeviceRef),
  LockRelease(DeviceRef),
  /// The grant addressed to the named device.
  LockGrant(DeviceId),
  LockStatus(LockStatus),
  Election(ElectionMsg),
  Coordinator(Announcement),
  Lease(Lease),
  QuorumCheck(QuorumCheck),
  QuorumAck(QuorumAck),
  TimeRequest(TimeRequest),
  /// A time response addressed to the named device.
  TimeResponse(DeviceId, TimeResponse),
  /// Online/offline announcement. The topic's device wins over the payload's.
  Presence(Presence),
  Chaos(ChaosCommand),
  Telemetry(Telemetry),
  Gossip(GossipView),
}

fn body<T: DeserializeOwned>(topic: &str, payload: &[u8]) -> Result<T, DecodeError> {
  serde_json::from_slice(payload).map_err(|e| DecodeError::Malformed {
    topic: topic.to_string(),
    source: e,
  })
}

#[derive(Serialize)]
struct StampedRef<'a, T> {
  #[serde(flatten)]
  body: &'a T,
  #[serde(flatten)]
  stamp: &'a Stamp,
}

fn stamped<T: Serialize>(body: &T, stamp: &Stamp) -> serde_json::Result<Vec<u8>> {
  serde_json::to_vec(&StampedRef {
    body: body,
    stamp: stamp,
  })
}

impl Message {
  pub fn decode(topics: &Topics, topic: &str, payload: &[u8]) -> Result<(Message, Stamp), DecodeError> {
    let kind = topics
      .classify(topic)
      .ok_or_else(|| DecodeError::UnknownTopic(topic.to_string()))?;
    let msg = match kind {
      TopicKind::LockRequest => Message::LockRequest(body(topic, payload)?),
      TopicKind::LockRelease => Message::LockRelease(body(topic, payload)?),
      TopicKind::LockGrant(id) => {
        let _: Granted = body(topic, payload)?;
        Message::LockGrant(id)
      }
      TopicKind::LockStatus => Message::LockStatus(body(topic, payload)?),
      TopicKind::Election => Message::Election(body(topic, payload)?),
      TopicKind::Coordinator => Message::Coordinator(body(topic, payload)?),
      TopicKind::Lease => Message::Lease(body(topic, payload)?),
      TopicKind::QuorumCheck => Message::QuorumCheck(body(topic, payload)?),
      TopicKind::QuorumAck => Message::QuorumAck(body(topic, payload)?),
      TopicKind::TimeRequest => Message::TimeRequest(body(topic, payload)?),
      TopicKind::TimeResponse(id) => Message::TimeResponse(id, body(topic, payload)?),
      TopicKind::ChaosControl => Message::Chaos(body(topic, payload)?),
      TopicKind::Gossip(_) => Message::Gossip(body(topic, payload)?),
      TopicKind::Status(id) => {
        let mut presence: Presence = body(topic, payload)?;
        presence.device_id = id;
        Message::Presence(presence)
      }
      TopicKind::Telemetry(_) => Message::Telemetry(body(topic, payload)?),
    };
    // A stamp that fails to parse is treated as absent rather than poisoning the message.
    let stamp = serde_json::from_slice::<Stamp>(payload).unwrap_or_default();
    Ok((msg, stamp))
  }

  pub fn topic(&self, topics: &Topics) -> String {
    match self {
      Message::LockRequest(_) => topics.lock_request(),
      Message::LockRelease(_) => topics.lock_release(),
      Message::LockGrant(id) => topics.lock_grant(id),
      Message::LockStatus(_) => topics.lock_status(),
      Message::Election(_) => topics.election(),
      Message::Coordinator(_) => topics.coordinator(),
      Message::Lease(_) => topics.lease(),
      Message::QuorumCheck(_) => topics.quorum_check(),
      Message::QuorumAck(_) => topics.quorum_ack(),
      Message::TimeRequest(_) => topics.time_request(),
      Message::TimeResponse(id, _) => topics.time_response(id),
      Message::Presence(p) => topics.status(&p.device_id),
      Message::Chaos(_) => topics.chaos_control(),
      Message::Telemetry(t) => topics.telemetry(&t.device_id),
      Message::Gossip(g) => topics.gossip(&g.sender_id),
    }
  }

  pub fn delivery(&self) -> Delivery {
    match self {
      Message::LockRequest(_)
      | Message::LockRelease(_)
      | Message::LockGrant(_)
      | Message::LockStatus(_)
      | Message::Coordinator(_)
      | Message::Presence(_) => Delivery::Acknowledged,
      Message::Election(_)
      | Message::Lease(_)
      | Message::QuorumCheck(_)
      | Message::QuorumAck(_)
      | Message::TimeRequest(_)
      | Message::TimeResponse(_, _)
      | Message::Chaos(_)
      | Message::Telemetry(_)
      | Message::Gossip(_) => Delivery::FireAndForget,
    }
  }

  pub fn retained(&self) -> bool {
    matches!(
      self,
      Message::LockStatus(_) | Message::Coordinator(_) | Message::Presence(_)
    )
  }

  pub fn encode(&self, stamp: &Stamp) -> serde_json::Result<Vec<u8>> {
    match self {
      Message::LockRequest(b) => stamped(b, stamp),
      Message::LockRelease(b) => stamped(b, stamp),
      Message::LockGrant(_) => stamped(
        &Granted {
          status: GrantStatus::Granted,
        },
        stamp,
      ),
      Message::LockStatus(b) => stamped(b, stamp),
      Message::Election(b) => stamped(b, stamp),
      Message::Coordinator(b) => stamped(b, stamp),
      Message::Lease(b) => stamped(b, stamp),
      Message::QuorumCheck(b) => stamped(b, stamp),
      Message::QuorumAck(b) => stamped(b, stamp),
      Message::TimeRequest(b) => stamped(b, stamp),
      Message::TimeResponse(_, b) => stamped(b, stamp),
      Message::Presence(b) => stamped(b, stamp),
      Message::Chaos(b) => stamped(b, stamp),
      Message::Telemetry(b) => stamped(b, stamp),
      Message::Gossip(b) => stamped(b, stamp),
    }
  }

  /// Encodes into a ready-to-publish [`Publication`] with this message's delivery and retain
  /// settings.
  pub fn publication(&self, topics: &Topics, stamp: &Stamp) -> serde_json::Result<Publication> {
    Ok(Publication::new(
      self.topic(topics),
      self.encode(stamp)?,
      self.delivery(),
      self.retained(),
    ))
  }
}

//! Types shared by every layer: who a node is, where messages go, what they say, and what a node
//! asks its driver to do.

mod identity;
mod message;
mod timers;
mod topics;

use crate::bus::Publication;
use std::time::Duration;

#[rustfmt::skip]
pub use {
  identity::DeviceId,
  identity::NodeIdentity,
  message::Announcement,
  message::ChaosAction,
  message::ChaosCommand,
  message::DecodeError,
  message::DeviceRef,
  message::ElectionMsg,
  message::Granted,
  message::GrantStatus,
  message::GossipView,
  message::Lease,
  message::LockStatus,
  message::Message,
  message::Presence,
  message::PresenceStatus,
  message::QuorumAck,
  message::QuorumCheck,
  message::Stamp,
  message::Telemetry,
  message::TimeRequest,
  message::TimeResponse,
  timers::TimerKey,
  timers::Timers,
  topics::TopicKind,
  topics::Topics,
};

/// Something a node wants done on its behalf. Produced by the engine, executed by a driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
  Publish(Publication),
  Subscribe(String),
  Unsubscribe(String),
  /// Deliver `NodeEvent::Timer { key, generation }` back after `after` has elapsed.
  ArmTimer {
    key: TimerKey,
    generation: u64,
    after: Duration,
  },
}

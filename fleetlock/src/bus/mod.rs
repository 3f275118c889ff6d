//! The publish/subscribe boundary every node talks through.
//!
//! The engine never assumes a particular transport. It needs exactly what an MQTT-style broker
//! offers: topic-addressed publishing with a per-message [`Delivery`] quality, a "retain last
//! message" flag, wildcard subscriptions, and a testament the broker publishes on a client's behalf
//! when the client disappears without saying goodbye. [`MessageBus`] is that seam.
//!
//! [`LocalBus`] is an in-process broker implementing these semantics over tokio channels. It is
//! what the simulator binary and the runtime tests run on. The routing rules live in [`Broker`], a
//! plain data structure, so the deterministic [`Simulation`](crate::testkit::Simulation) can reuse
//! them without any async machinery.
//!
//! Nothing here promises ordering across topics or exactly-once delivery. The engine is written to
//! survive duplicates, drops and reordering of every control message.

mod broker;
mod local;

use async_trait::async_trait;
use thiserror::Error;

#[rustfmt::skip]
pub use {
  broker::Broker,
  broker::topic_matches,
  local::LocalBus,
  local::LocalBusClient,
};

/// Delivery quality requested for a single publication.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Delivery {
  /// At most once. May be dropped silently.
  FireAndForget,
  /// At least once. The broker retries until the subscriber acknowledges, so it may duplicate.
  Acknowledged,
}

/// A message on the bus, either going out or coming in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Publication {
  pub topic: String,
  pub payload: Vec<u8>,
  pub delivery: Delivery,
  pub retain: bool,
}
impl Publication {
  pub fn new(topic: String, payload: Vec<u8>, delivery: Delivery, retain: bool) -> Self {
    Publication {
      topic: topic,
      payload: payload,
      delivery: delivery,
      retain: retain,
    }
  }
}

#[derive(Debug, Error)]
pub enum BusError {
  #[error("client {0} is not connected")]
  Disconnected(String),
  #[error("invalid topic filter {0:?}")]
  InvalidFilter(String),
}

/// The operations a node performs against the bus. Completion is fire-and-forget from the
/// caller's perspective; an `Err` only reports that the client itself is unusable.
#[async_trait]
pub trait MessageBus: Send + Sync {
  async fn publish(&self, publication: Publication) -> Result<(), BusError>;
  async fn subscribe(&self, filter: &str) -> Result<(), BusError>;
  async fn unsubscribe(&self, filter: &str) -> Result<(), BusError>;
}

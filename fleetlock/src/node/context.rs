use crate::clock::ClockSyncAgent;
use crate::core::{Effect, Message, NodeIdentity, TimerKey, Timers, Topics};
use std::time::Duration;
use tracing::{error, trace};

/// The part of a node every role handler gets to touch: identity, clocks, timers, and the outbox
/// of effects for the current event.
pub struct NodeContext {
  pub identity: NodeIdentity,
  pub topics: Topics,
  pub clock: ClockSyncAgent,
  pub timers: Timers,
  wall_ms: u64,
  muted: bool,
  effects: Vec<Effect>,
}
impl NodeContext {
  pub fn new(identity: NodeIdentity, topics: Topics, clock: ClockSyncAgent) -> NodeContext {
    NodeContext {
      identity: identity,
      topics: topics,
      clock: clock,
      timers: Timers::new(),
      wall_ms: 0,
      muted: false,
      effects: Vec::new(),
    }
  }

  /// Driver time of the event being handled, in milliseconds.
  pub fn now(&self) -> u64 {
    self.wall_ms
  }

  /// This node's best estimate of true time.
  pub fn synced_now(&self) -> u64 {
    self.clock.synced_now(self.wall_ms)
  }

  pub(crate) fn begin(&mut self, wall_ms: u64) {
    self.wall_ms = wall_ms;
  }

  pub(crate) fn take_effects(&mut self) -> Vec<Effect> {
    std::mem::take(&mut self.effects)
  }

  pub fn muted(&self) -> bool {
    self.muted
  }

  pub(crate) fn set_muted(&mut self, muted: bool) {
    self.muted = muted;
  }

  /// Stamps and queues a message. Nothing leaves a muted node.
  pub fn publish(&mut self, msg: Message) {
    if self.muted {
      trace!(node = %self.identity.id, ?msg, "muted, not publishing");
      return;
    }
    let stamp = self.clock.stamp();
    match msg.publication(&self.topics, &stamp) {
      Ok(p) => self.effects.push(Effect::Publish(p)),
      Err(e) => error!(node = %self.identity.id, ?msg, "cannot encode message: {}", e),
    }
  }

  pub fn subscribe(&mut self, filter: String) {
    self.effects.push(Effect::Subscribe(filter));
  }

  pub fn unsubscribe(&mut self, filter: String) {
    self.effects.push(Effect::Unsubscribe(filter));
  }

  pub fn arm(&mut self, key: TimerKey, after: Duration) {
    let effect = self.timers.arm(key, after);
    self.effects.push(effect);
  }

  pub fn cancel(&mut self, key: TimerKey) {
    self.timers.cancel(key);
  }
}

use crate::core::{DeviceRef, Message, TimerKey};
use crate::node::NodeContext;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientPhase {
  Idle,
  Waiting,
  Holding,
}

/// This node's side of the lock as a requester, independent of who coordinates.
pub struct LockClient {
  phase: ClientPhase,
  critical_section: Duration,
  attempt_interval: Option<Duration>,
}
impl LockClient {
  pub fn new(critical_section: Duration, attempt_interval: Option<Duration>) -> LockClient {
    LockClient {
      phase: ClientPhase::Idle,
      critical_section: critical_section,
      attempt_interval: attempt_interval,
    }
  }

  pub fn phase(&self) -> ClientPhase {
    self.phase
  }

  pub fn start(&mut self, ctx: &mut NodeContext) {
    if let Some(interval) = self.attempt_interval {
      ctx.arm(TimerKey::LockAttempt, interval);
    }
  }

  pub fn acquire(&mut self, ctx: &mut NodeContext) {
    if self.phase == ClientPhase::Idle {
      self.phase = ClientPhase::Waiting;
      self.request(ctx);
    }
  }

  pub fn release(&mut self, ctx: &mut NodeContext) {
    match self.phase {
      ClientPhase::Holding => self.finish(ctx),
      // Whatever grant is still on its way will be handed straight back.
      ClientPhase::Waiting => self.phase = ClientPhase::Idle,
      ClientPhase::Idle => {}
    }
  }

  pub fn on_attempt_timer(&mut self, ctx: &mut NodeContext) {
    self.acquire(ctx);
    if let Some(interval) = self.attempt_interval {
      ctx.arm(TimerKey::LockAttempt, interval);
    }
  }

  pub fn on_grant(&mut self, ctx: &mut NodeContext) {
    match self.phase {
      ClientPhase::Waiting => {
        info!(node = %ctx.identity.id, "entering critical section");
        self.phase = ClientPhase::Holding;
        ctx.arm(TimerKey::CriticalSection, self.critical_section);
      }
      ClientPhase::Holding => debug!(node = %ctx.identity.id, "duplicate grant"),
      ClientPhase::Idle => {
        debug!(node = %ctx.identity.id, "unwanted grant, releasing");
        self.send_release(ctx);
      }
    }
  }

  pub fn on_critical_section_end(&mut self, ctx: &mut NodeContext) {
    if self.phase == ClientPhase::Holding {
      self.finish(ctx);
    }
  }

  /// A new coordinator may never have seen a request sent while there was none.
  pub fn on_new_coordinator(&mut self, ctx: &mut NodeContext) {
    if self.phase == ClientPhase::Waiting {
      self.request(ctx);
    }
  }

  /// Forgets any interest in the lock without telling anyone. Used when the node dies.
  pub fn reset(&mut self, ctx: &mut NodeContext) {
    self.phase = ClientPhase::Idle;
    ctx.cancel(TimerKey::CriticalSection);
  }

  fn finish(&mut self, ctx: &mut NodeContext) {
    info!(node = %ctx.identity.id, "leaving critical section");
    self.phase = ClientPhase::Idle;
    ctx.cancel(TimerKey::CriticalSection);
    self.send_release(ctx);
  }

  fn request(&mut self, ctx: &mut NodeContext) {
    let me = DeviceRef {
      device_id: ctx.identity.id.clone(),
    };
    ctx.publish(Message::LockRequest(me));
  }

  fn send_release(&mut self, ctx: &mut NodeContext) {
    let me = DeviceRef {
      device_id: ctx.identity.id.clone(),
    };
    ctx.publish(Message::LockRelease(me));
  }
}

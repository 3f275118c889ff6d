use crate::core::{DeviceId, Message, TimerKey};
use crate::lock::{LockState, WalEntry, WalError, WalOperation, WriteAheadLog};
use crate::node::NodeContext;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Arbitrates the lock while this node is coordinator. Inactive (no state at all) otherwise.
pub struct LockCoordinator {
  wal: Box<dyn WriteAheadLog>,
  watchdog: Duration,
  state: Option<LockState>,
}
impl LockCoordinator {
  pub fn new(wal: Box<dyn WriteAheadLog>, watchdog: Duration) -> LockCoordinator {
    LockCoordinator {
      wal: wal,
      watchdog: watchdog,
      state: None,
    }
  }

  pub fn is_active(&self) -> bool {
    self.state.is_some()
  }

  pub fn state(&self) -> Option<&LockState> {
    self.state.as_ref()
  }

  /// Rebuilds the lock from the log and starts serving requests. On a damaged log the coordinator
  /// stays inactive and the error is returned.
  pub fn activate(&mut self, ctx: &mut NodeContext) -> Result<(), WalError> {
    self.state = None;
    ctx.cancel(TimerKey::Watchdog);
    let entries = self.wal.replay()?;
    let state = LockState::replay(&entries);
    info!(
      node = %ctx.identity.id,
      entries = entries.len(),
      holder = ?state.holder(),
      queue = state.queue().len(),
      "lock state recovered"
    );
    let held = !state.available();
    self.state = Some(state);
    ctx.subscribe(ctx.topics.lock_request());
    ctx.subscribe(ctx.topics.lock_release());
    if held {
      // How long the holder has already had it is unknown, so it gets a full window.
      ctx.arm(TimerKey::Watchdog, self.watchdog);
    } else {
      // A crash between logging a release and logging the next grant leaves waiters behind.
      self.grant_next(ctx);
    }
    self.publish_status(ctx);
    Ok(())
  }

  pub fn deactivate(&mut self, ctx: &mut NodeContext) {
    if self.state.take().is_some() {
      ctx.unsubscribe(ctx.topics.lock_request());
      ctx.unsubscribe(ctx.topics.lock_release());
      ctx.cancel(TimerKey::Watchdog);
      debug!(node = %ctx.identity.id, "lock state discarded");
    }
  }

  pub fn on_request(&mut self, ctx: &mut NodeContext, device: &DeviceId) {
    let (available, backlog, known) = match &self.state {
      Some(state) => (
        state.available(),
        !state.queue().is_empty(),
        state.is_holder(device) || state.is_waiting(device),
      ),
      None => return,
    };
    if available && !backlog {
      self.grant(ctx, device);
    } else {
      if !known && self.commit(ctx, WalOperation::Queue, device) {
        debug!(node = %ctx.identity.id, device = %device, "queued");
      }
      // A free lock with waiters means an earlier grant never made it into the log.
      if available {
        self.grant_next(ctx);
      }
    }
    self.publish_status(ctx);
  }

  pub fn on_release(&mut self, ctx: &mut NodeContext, device: &DeviceId) {
    let holds = match &self.state {
      Some(state) => state.is_holder(device),
      None => return,
    };
    if !holds {
      warn!(node = %ctx.identity.id, device = %device, "ignoring release from a non-holder");
      return;
    }
    self.release(ctx, device);
  }

  pub fn on_watchdog(&mut self, ctx: &mut NodeContext) {
    let holder = match self.state.as_ref().and_then(|s| s.holder()) {
      Some(holder) => holder.clone(),
      None => return,
    };
    warn!(node = %ctx.identity.id, holder = %holder, "critical section overran, forcing release");
    self.release(ctx, &holder);
  }

  fn release(&mut self, ctx: &mut NodeContext, holder: &DeviceId) {
    if !self.commit(ctx, WalOperation::Release, holder) {
      return;
    }
    ctx.cancel(TimerKey::Watchdog);
    info!(node = %ctx.identity.id, device = %holder, "lock released");
    self.grant_next(ctx);
    self.publish_status(ctx);
  }

  fn grant_next(&mut self, ctx: &mut NodeContext) {
    let next = self.state.as_ref().and_then(|s| s.next_in_line()).cloned();
    if let Some(next) = next {
      self.grant(ctx, &next);
    }
  }

  fn grant(&mut self, ctx: &mut NodeContext, device: &DeviceId) {
    if !self.commit(ctx, WalOperation::Grant, device) {
      return;
    }
    info!(node = %ctx.identity.id, device = %device, "lock granted");
    ctx.publish(Message::LockGrant(device.clone()));
    ctx.arm(TimerKey::Watchdog, self.watchdog);
  }

  /// Logs the transition, then applies it. Returns false, leaving the state untouched, if it
  /// could not be logged.
  fn commit(&mut self, ctx: &mut NodeContext, operation: WalOperation, target: &DeviceId) -> bool {
    let state = match &mut self.state {
      Some(state) => state,
      None => return false,
    };
    let entry = WalEntry::new(ctx.synced_now(), operation, target.clone());
    if let Err(e) = self.wal.append(&entry) {
      error!(node = %ctx.identity.id, ?operation, target = %target, "cannot log transition: {}", e);
      return false;
    }
    state.apply(operation, target);
    true
  }

  fn publish_status(&self, ctx: &mut NodeContext) {
    if let Some(state) = &self.state {
      ctx.publish(Message::LockStatus(state.status()));
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bus::Publication;
  use crate::clock::ClockSyncAgent;
  use crate::config::ClockConfig;
  use crate::core::{Effect, LockStatus, NodeIdentity, Topics};
  use crate::lock::MemoryWal;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::Arc;

  fn context() -> NodeContext {
    let identity = NodeIdentity::new("sensor-005".into(), 5, 4, 5);
    let clock = ClockSyncAgent::new(4, 5, &ClockConfig::default(), 0);
    NodeContext::new(identity, Topics::new("fleet"), clock)
  }

  fn published(ctx: &mut NodeContext) -> Vec<Message> {
    let topics = ctx.topics.clone();
    ctx
      .take_effects()
      .into_iter()
      .filter_map(|e| match e {
        Effect::Publish(Publication { topic, payload, .. }) => {
          Some(Message::decode(&topics, &topic, &payload).unwrap().0)
        }
        _ => None,
      })
      .collect()
  }

  fn status(holder: Option<&str>, queue: &[&str]) -> Message {
    Message::LockStatus(LockStatus {
      available: holder.is_none(),
      holder: holder.map(DeviceId::from),
      queue: queue.iter().map(|s| DeviceId::from(*s)).collect(),
    })
  }

  #[test]
  fn fifo_grants_and_log_before_commit() {
    let wal = MemoryWal::new();
    let mut c = LockCoordinator::new(Box::new(wal.clone()), Duration::from_secs(5));
    let mut ctx = context();
    c.activate(&mut ctx).unwrap();
    assert_eq!(published(&mut ctx), vec![status(None, &[])]);

    c.on_request(&mut ctx, &"a".into());
    c.on_request(&mut ctx, &"b".into());
    c.on_request(&mut ctx, &"a".into());
    c.on_request(&mut ctx, &"c".into());
    c.on_request(&mut ctx, &"b".into());
    assert_eq!(
      published(&mut ctx),
      vec![
        Message::LockGrant("a".into()),
        status(Some("a"), &[]),
        status(Some("a"), &["b"]),
        status(Some("a"), &["b"]),
        status(Some("a"), &["b", "c"]),
        status(Some("a"), &["b", "c"]),
      ]
    );

    c.on_release(&mut ctx, &"c".into());
    assert!(published(&mut ctx).is_empty());
    c.on_release(&mut ctx, &"a".into());
    assert_eq!(
      published(&mut ctx),
      vec![Message::LockGrant("b".into()), status(Some("b"), &["c"])]
    );

    let ops = wal
      .entries()
      .unwrap()
      .into_iter()
      .map(|e| (e.operation, e.target_id.to_string()))
      .collect::<Vec<_>>();
    assert_eq!(
      ops,
      vec![
        (WalOperation::Grant, "a".to_string()),
        (WalOperation::Queue, "b".to_string()),
        (WalOperation::Queue, "c".to_string()),
        (WalOperation::Release, "a".to_string()),
        (WalOperation::Grant, "b".to_string()),
      ]
    );
    assert_eq!(LockState::replay(&wal.entries().unwrap()), c.state().unwrap().clone());
  }

  /// Refuses to log grants while `failing` is set.
  struct FailingGrants {
    inner: MemoryWal,
    failing: Arc<AtomicBool>,
  }
  impl WriteAheadLog for FailingGrants {
    fn append(&mut self, entry: &WalEntry) -> Result<(), WalError> {
      if entry.operation == WalOperation::Grant && self.failing.load(Ordering::SeqCst) {
        return Err(WalError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")));
      }
      self.inner.append(entry)
    }

    fn replay(&mut self) -> Result<Vec<WalEntry>, WalError> {
      self.inner.replay()
    }
  }

  #[test]
  fn waiter_keeps_its_turn_after_a_failed_grant() {
    let failing = Arc::new(AtomicBool::new(false));
    let wal = FailingGrants {
      inner: MemoryWal::new(),
      failing: failing.clone(),
    };
    let mut c = LockCoordinator::new(Box::new(wal), Duration::from_secs(5));
    let mut ctx = context();
    c.activate(&mut ctx).unwrap();
    c.on_request(&mut ctx, &"a".into());
    c.on_request(&mut ctx, &"b".into());
    failing.store(true, Ordering::SeqCst);
    c.on_release(&mut ctx, &"a".into());
    assert!(c.state().unwrap().available());
    published(&mut ctx);

    failing.store(false, Ordering::SeqCst);
    c.on_request(&mut ctx, &"c".into());
    assert_eq!(
      published(&mut ctx),
      vec![Message::LockGrant("b".into()), status(Some("b"), &["c"])]
    );
  }

  #[test]
  fn watchdog_forces_release_and_grants_next() {
    let mut c = LockCoordinator::new(Box::new(MemoryWal::new()), Duration::from_secs(5));
    let mut ctx = context();
    c.activate(&mut ctx).unwrap();
    c.on_request(&mut ctx, &"sensor-002".into());
    c.on_request(&mut ctx, &"sensor-004".into());
    published(&mut ctx);
    c.on_watchdog(&mut ctx);
    assert_eq!(
      published(&mut ctx),
      vec![Message::LockGrant("sensor-004".into()), status(Some("sensor-004"), &[])]
    );
    assert!(ctx.timers.is_armed(TimerKey::Watchdog));
  }

  #[test]
  fn successor_recovers_holder_and_waiters() {
    let wal = MemoryWal::new();
    let mut old = LockCoordinator::new(Box::new(wal.clone()), Duration::from_secs(5));
    let mut ctx = context();
    old.activate(&mut ctx).unwrap();
    old.on_request(&mut ctx, &"sensor-002".into());
    old.on_request(&mut ctx, &"sensor-003".into());

    let mut new = LockCoordinator::new(Box::new(wal), Duration::from_secs(5));
    let mut ctx2 = context();
    new.activate(&mut ctx2).unwrap();
    assert!(ctx2.timers.is_armed(TimerKey::Watchdog));
    assert_eq!(published(&mut ctx2), vec![status(Some("sensor-002"), &["sensor-003"])]);
  }

  #[test]
  fn waiters_left_without_holder_get_granted_on_activation() {
    let mut wal = MemoryWal::new();
    wal.append(&WalEntry::new(1, WalOperation::Grant, "a".into())).unwrap();
    wal.append(&WalEntry::new(2, WalOperation::Queue, "b".into())).unwrap();
    wal.append(&WalEntry::new(3, WalOperation::Release, "a".into())).unwrap();
    let mut c = LockCoordinator::new(Box::new(wal), Duration::from_secs(5));
    let mut ctx = context();
    c.activate(&mut ctx).unwrap();
    assert_eq!(
      published(&mut ctx),
      vec![Message::LockGrant("b".into()), status(Some("b"), &[])]
    );
  }

  #[test]
  fn damaged_log_keeps_coordinator_inactive() {
    let mut bytes = Vec::new();
    let mut healthy = MemoryWal::new();
    healthy.append(&WalEntry::new(1, WalOperation::Grant, "a".into())).unwrap();
    healthy.append(&WalEntry::new(2, WalOperation::Queue, "b".into())).unwrap();
    bytes.extend(healthy.bytes());
    bytes[9] ^= 0x55;
    let wal = MemoryWal::from_bytes(bytes, Default::default());
    let mut c = LockCoordinator::new(Box::new(wal), Duration::from_secs(5));
    let mut ctx = context();
    assert!(c.activate(&mut ctx).is_err());
    assert!(!c.is_active());
    c.on_request(&mut ctx, &"x".into());
    assert!(ctx.take_effects().is_empty());
  }

  #[test]
  fn deactivate_unsubscribes_and_forgets() {
    let mut c = LockCoordinator::new(Box::new(MemoryWal::new()), Duration::from_secs(5));
    let mut ctx = context();
    c.activate(&mut ctx).unwrap();
    c.on_request(&mut ctx, &"a".into());
    ctx.take_effects();
    c.deactivate(&mut ctx);
    assert!(!c.is_active());
    assert!(!ctx.timers.is_armed(TimerKey::Watchdog));
    assert_eq!(
      ctx.take_effects(),
      vec![
        Effect::Unsubscribe("fleet/mutex/request".to_string()),
        Effect::Unsubscribe("fleet/mutex/release".to_string()),
      ]
    );
  }
}

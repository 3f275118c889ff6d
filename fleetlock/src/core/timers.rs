use crate::core::Effect;
use std::collections::HashMap;
use std::time::Duration;

/// What a timer is for. A node has at most one live timer per key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKey {
  LeasePoll,
  ElectionTimeout,
  QuorumWait,
  Watchdog,
  LeaseRenew,
  Heartbeat,
  TimeSync,
  Telemetry,
  Gossip,
  LockAttempt,
  CriticalSection,
}

/// Generation bookkeeping for a node's timers.
///
/// Arming a key supersedes whatever was armed under it before: the driver still delivers the old
/// fire, but [`Timers::fire`] reports it stale. Cancelling is just bumping the generation.
#[derive(Debug, Default)]
pub struct Timers {
  generations: HashMap<TimerKey, u64>,
  armed: HashMap<TimerKey, u64>,
}
impl Timers {
  pub fn new() -> Timers {
    Timers::default()
  }

  pub fn arm(&mut self, key: TimerKey, after: Duration) -> Effect {
    let generation = self.generations.entry(key).or_insert(0);
    *generation += 1;
    self.armed.insert(key, *generation);
    Effect::ArmTimer {
      key: key,
      generation: *generation,
      after: after,
    }
  }

  pub fn cancel(&mut self, key: TimerKey) {
    if self.armed.remove(&key).is_some() {
      *self.generations.entry(key).or_insert(0) += 1;
    }
  }

  pub fn cancel_all(&mut self) {
    let keys = self.armed.keys().copied().collect::<Vec<_>>();
    for key in keys {
      self.cancel(key);
    }
  }

  pub fn is_armed(&self, key: TimerKey) -> bool {
    self.armed.contains_key(&key)
  }

  /// Consumes a fire. Returns whether it is the live one; a live fire disarms the key.
  pub fn fire(&mut self, key: TimerKey, generation: u64) -> bool {
    match self.armed.get(&key) {
      Some(g) if *g == generation => {
        self.armed.remove(&key);
        true
      }
      _ => false,
    }
  }
}

#[test]
fn test_rearm_makes_old_fire_stale() {
  let mut timers = Timers::new();
  let first = match timers.arm(TimerKey::Watchdog, Duration::from_secs(1)) {
    Effect::ArmTimer { generation, .. } => generation,
    _ => unreachable!(),
  };
  let second = match timers.arm(TimerKey::Watchdog, Duration::from_secs(1)) {
    Effect::ArmTimer { generation, .. } => generation,
    _ => unreachable!(),
  };
  assert!(!timers.fire(TimerKey::Watchdog, first));
  assert!(timers.fire(TimerKey::Watchdog, second));
  assert!(!timers.fire(TimerKey::Watchdog, second));
}

#[test]
fn test_cancel() {
  let mut timers = Timers::new();
  let gen = match timers.arm(TimerKey::LeaseRenew, Duration::from_millis(10)) {
    Effect::ArmTimer { generation, .. } => generation,
    _ => unreachable!(),
  };
  timers.arm(TimerKey::Heartbeat, Duration::from_millis(10));
  timers.cancel_all();
  assert!(!timers.is_armed(TimerKey::Heartbeat));
  assert!(!timers.fire(TimerKey::LeaseRenew, gen));
}

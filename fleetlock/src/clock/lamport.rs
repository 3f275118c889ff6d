/// Scalar logical clock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LamportClock {
  time: u64,
}
impl LamportClock {
  pub fn new() -> LamportClock {
    LamportClock::default()
  }

  pub fn time(&self) -> u64 {
    self.time
  }

  /// Advances for a locally generated event and returns the stamp to attach. Pinned at
  /// `u64::MAX` once a peer has pushed it there.
  pub fn tick(&mut self) -> u64 {
    self.time = self.time.saturating_add(1);
    self.time
  }

  /// Absorbs a received stamp. The next `tick` will exceed it.
  pub fn observe(&mut self, remote: u64) {
    self.time = self.time.max(remote);
  }
}

#[test]
fn test_tick_dominates_observed() {
  let mut clock = LamportClock::new();
  assert_eq!(clock.tick(), 1);
  clock.observe(10);
  assert_eq!(clock.time(), 10);
  assert_eq!(clock.tick(), 11);
  clock.observe(3);
  assert_eq!(clock.tick(), 12);
}

#[test]
fn test_tick_saturates() {
  let mut clock = LamportClock::new();
  clock.observe(u64::MAX);
  assert_eq!(clock.tick(), u64::MAX);
  clock.observe(5);
  assert_eq!(clock.time(), u64::MAX);
}

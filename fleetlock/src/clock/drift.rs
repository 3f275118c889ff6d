/// A local clock that runs fast or slow relative to real time.
///
/// Real time is whatever the driver passes in as `wall_ms`. The simulated reading starts equal to
/// it at `anchor` and then advances at `rate` times real speed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DriftingClock {
  rate: f64,
  anchor_wall: u64,
  anchor_local: u64,
}
impl DriftingClock {
  pub fn new(rate: f64, wall_ms: u64) -> DriftingClock {
    DriftingClock {
      rate: rate,
      anchor_wall: wall_ms,
      anchor_local: wall_ms,
    }
  }

  pub fn rate(&self) -> f64 {
    self.rate
  }

  pub fn now(&self, wall_ms: u64) -> u64 {
    let elapsed = wall_ms.saturating_sub(self.anchor_wall) as f64;
    self.anchor_local + (elapsed * self.rate).round() as u64
  }

  /// Changes the drift rate from now on without making the local reading jump.
  pub fn set_rate(&mut self, rate: f64, wall_ms: u64) {
    self.anchor_local = self.now(wall_ms);
    self.anchor_wall = wall_ms;
    self.rate = rate;
  }
}

#[test]
fn test_drift() {
  let mut clock = DriftingClock::new(1.5, 1000);
  assert_eq!(clock.now(1000), 1000);
  assert_eq!(clock.now(3000), 4000);
  clock.set_rate(0.5, 3000);
  assert_eq!(clock.now(3000), 4000);
  assert_eq!(clock.now(5000), 5000);
}

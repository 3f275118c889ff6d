use crate::core::DeviceId;
use std::time::Duration;

/// The last lease this node accepted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseRecord {
  pub holder_id: DeviceId,
  pub holder_priority: u32,
  /// Driver time at which the lease was observed.
  pub issued_at: u64,
}

/// Tracks whether some coordinator has shown signs of life recently enough.
#[derive(Debug)]
pub struct LeaseManager {
  duration: u64,
  record: Option<LeaseRecord>,
  fresh_until: Option<u64>,
}
impl LeaseManager {
  pub fn new(duration: Duration) -> LeaseManager {
    LeaseManager {
      duration: duration.as_millis() as u64,
      record: None,
      fresh_until: None,
    }
  }

  pub fn record(&self) -> Option<&LeaseRecord> {
    self.record.as_ref()
  }

  pub fn is_fresh(&self, now: u64) -> bool {
    self.fresh_until.map_or(false, |until| now < until)
  }

  pub fn observe(&mut self, holder_id: DeviceId, holder_priority: u32, now: u64) {
    self.record = Some(LeaseRecord {
      holder_id: holder_id,
      holder_priority: holder_priority,
      issued_at: now,
    });
    self.hold_off(now);
  }

  /// Treats the lease as fresh for one more full duration from `now` without recording a holder.
  pub fn hold_off(&mut self, now: u64) {
    let until = now + self.duration;
    self.fresh_until = Some(self.fresh_until.map_or(until, |t| t.max(until)));
  }

  pub fn expire(&mut self) {
    self.fresh_until = None;
  }
}

#[test]
fn test_freshness() {
  let mut lease = LeaseManager::new(Duration::from_secs(5));
  assert!(!lease.is_fresh(0));
  lease.observe("sensor-005".into(), 5, 1_000);
  assert!(lease.is_fresh(5_999));
  assert!(!lease.is_fresh(6_000));
  lease.hold_off(500);
  assert!(!lease.is_fresh(6_000));
  lease.expire();
  assert!(!lease.is_fresh(1_001));
  assert_eq!(lease.record().map(|r| r.holder_priority), Some(5));
}

use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
  Applied { offset: i64, rtt: u64 },
  /// The round trip was too long to trust. The previous offset stays.
  Rejected { rtt: u64 },
  /// There was no request outstanding to match the response against.
  Ignored,
}

/// Cristian's method: assume the server read its clock halfway through the round trip.
#[derive(Clone, Copy, Debug)]
pub struct OffsetEstimator {
  max_rtt: u64,
  offset: i64,
}
impl OffsetEstimator {
  pub fn new(max_rtt: Duration) -> OffsetEstimator {
    OffsetEstimator {
      max_rtt: max_rtt.as_millis() as u64,
      offset: 0,
    }
  }

  pub fn offset(&self) -> i64 {
    self.offset
  }

  /// `t1` and `t2` are local readings at send and receive, `server_time` the server's reply.
  pub fn sample(&mut self, t1: u64, t2: u64, server_time: u64) -> SyncOutcome {
    let rtt = t2.saturating_sub(t1);
    if rtt > self.max_rtt {
      return SyncOutcome::Rejected { rtt: rtt };
    }
    let corrected = server_time as i64 + (rtt / 2) as i64;
    self.offset = corrected - t2 as i64;
    SyncOutcome::Applied {
      offset: self.offset,
      rtt: rtt,
    }
  }
}

#[test]
fn test_cristian() {
  let mut est = OffsetEstimator::new(Duration::from_millis(500));
  assert_eq!(est.sample(100, 300, 1_000), SyncOutcome::Applied { offset: 800, rtt: 200 });
  assert_eq!(est.sample(100, 700, 50), SyncOutcome::Rejected { rtt: 600 });
  assert_eq!(est.offset(), 800);
  assert_eq!(est.sample(100, 600, 0), SyncOutcome::Applied { offset: -350, rtt: 500 });
}

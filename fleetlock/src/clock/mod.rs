//! Physical and logical time for one node.
//!
//! [`ClockSyncAgent`] owns everything time-related a node keeps: the (possibly drifting) local
//! clock, the offset learned from the time source, and the Lamport and vector clocks stamped onto
//! outgoing messages.

mod drift;
mod lamport;
mod offset;
mod vector;

use crate::config::ClockConfig;
use crate::core::{Stamp, TimeResponse};
use tracing::{debug, warn};

#[rustfmt::skip]
pub use {
  drift::DriftingClock,
  lamport::LamportClock,
  offset::OffsetEstimator,
  offset::SyncOutcome,
  vector::Causality,
  vector::VectorClock,
};

/// What happened to an inbound stamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
  Merged,
  /// The stamp ran further ahead of local knowledge than the configured guard allows. Nothing was
  /// merged and the message should be dropped.
  Rejected { jump: u64 },
}

pub struct ClockSyncAgent {
  index: usize,
  clock: DriftingClock,
  offset: OffsetEstimator,
  lamport: LamportClock,
  vector: VectorClock,
  pending_t1: Option<u64>,
  max_vector_jump: Option<u64>,
}
impl ClockSyncAgent {
  pub fn new(index: usize, total_nodes: usize, config: &ClockConfig, wall_ms: u64) -> ClockSyncAgent {
    ClockSyncAgent {
      index: index,
      clock: DriftingClock::new(config.drift_rate, wall_ms),
      offset: OffsetEstimator::new(config.max_rtt),
      lamport: LamportClock::new(),
      vector: VectorClock::new(total_nodes),
      pending_t1: None,
      max_vector_jump: config.max_vector_jump,
    }
  }

  pub fn local_now(&self, wall_ms: u64) -> u64 {
    self.clock.now(wall_ms)
  }

  /// Local time corrected by the last accepted offset.
  pub fn synced_now(&self, wall_ms: u64) -> u64 {
    let corrected = self.local_now(wall_ms) as i64 + self.offset.offset();
    corrected.max(0) as u64
  }

  pub fn offset(&self) -> i64 {
    self.offset.offset()
  }

  pub fn lamport(&self) -> u64 {
    self.lamport.time()
  }

  pub fn vector(&self) -> &VectorClock {
    &self.vector
  }

  pub fn drift_rate(&self) -> f64 {
    self.clock.rate()
  }

  pub fn set_drift(&mut self, rate: f64, wall_ms: u64) {
    self.clock.set_rate(rate, wall_ms);
  }

  /// Records the send time of a time request and returns it as `t1`.
  pub fn begin_sync(&mut self, wall_ms: u64) -> u64 {
    let t1 = self.local_now(wall_ms);
    self.pending_t1 = Some(t1);
    t1
  }

  pub fn on_time_response(&mut self, response: &TimeResponse, wall_ms: u64) -> SyncOutcome {
    let t1 = match (self.pending_t1, response.t1) {
      (Some(pending), None) => pending,
      (Some(pending), Some(echoed)) if pending == echoed => pending,
      _ => {
        debug!(server_time = response.server_time, "time response without a matching request");
        return SyncOutcome::Ignored;
      }
    };
    self.pending_t1 = None;
    let t2 = self.local_now(wall_ms);
    let outcome = self.offset.sample(t1, t2, response.server_time);
    match outcome {
      SyncOutcome::Applied { offset, rtt } => debug!(offset, rtt, "clock offset updated"),
      SyncOutcome::Rejected { rtt } => warn!(rtt, "time sample discarded, round trip too long"),
      SyncOutcome::Ignored => {}
    }
    outcome
  }

  /// Advances both logical clocks for a local event and returns the stamp to publish with it.
  pub fn stamp(&mut self) -> Stamp {
    let lamport = self.lamport.tick();
    self.vector.increment(self.index);
    Stamp {
      lamport: Some(lamport),
      vector: Some(self.vector.slots().to_vec()),
    }
  }

  pub fn observe(&mut self, stamp: &Stamp) -> Observation {
    if let Some(guard) = self.max_vector_jump {
      let vector_jump = stamp.vector.as_ref().map_or(0, |remote| self.vector.max_jump(remote));
      let lamport_jump = stamp.lamport.map_or(0, |remote| remote.saturating_sub(self.lamport.time()));
      let jump = vector_jump.max(lamport_jump);
      if jump > guard {
        return Observation::Rejected { jump: jump };
      }
    }
    if let Some(remote) = stamp.lamport {
      self.lamport.observe(remote);
    }
    if let Some(remote) = &stamp.vector {
      self.vector.merge(remote);
    }
    Observation::Merged
  }
}

//! Choosing the coordinator.
//!
//! A follower that stops hearing leases contests. Candidates defer to anyone who outranks them,
//! and a surviving candidate only declares victory after a strict majority of the fleet answered
//! its quorum check. The coordinator keeps re-broadcasting its lease and yields to any coordinator
//! it learns of that ranks at least as high.

mod engine;
mod lease;
mod quorum;

#[rustfmt::skip]
pub use {
  engine::ElectionEngine,
  engine::Role,
  engine::Transition,
  lease::LeaseManager,
  lease::LeaseRecord,
  quorum::QuorumGate,
};

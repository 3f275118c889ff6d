use crate::core::DeviceId;
use std::collections::BTreeSet;

/// Counts distinct nodes that answered this node's quorum check.
#[derive(Debug, Default)]
pub struct QuorumGate {
  acks: BTreeSet<DeviceId>,
}
impl QuorumGate {
  pub fn new() -> QuorumGate {
    QuorumGate::default()
  }

  /// Starts a fresh count with this node's own vote.
  pub fn begin(&mut self, me: &DeviceId) {
    self.acks.clear();
    self.acks.insert(me.clone());
  }

  pub fn record(&mut self, from: &DeviceId) {
    self.acks.insert(from.clone());
  }

  pub fn count(&self) -> usize {
    self.acks.len()
  }

  pub fn reached(&self, quorum_size: usize) -> bool {
    self.count() >= quorum_size
  }

  pub fn reset(&mut self) {
    self.acks.clear();
  }
}

#[test]
fn test_duplicate_acks_count_once() {
  let mut gate = QuorumGate::new();
  gate.begin(&"a".into());
  gate.record(&"b".into());
  gate.record(&"b".into());
  gate.record(&"a".into());
  assert_eq!(gate.count(), 2);
  assert!(!gate.reached(3));
  gate.record(&"c".into());
  assert!(gate.reached(3));
  gate.reset();
  assert_eq!(gate.count(), 0);
}

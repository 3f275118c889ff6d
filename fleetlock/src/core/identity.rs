use serde::{Deserialize, Serialize};
use std::fmt;

/// The globally unique name of a node (or of any other device talking on the bus).
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);
impl DeviceId {
  pub fn new<S: Into<String>>(s: S) -> DeviceId {
    DeviceId(s.into())
  }

  pub fn as_str(&self) -> &str {
    self.0.as_str()
  }
}
impl fmt::Display for DeviceId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}
impl From<&str> for DeviceId {
  fn from(s: &str) -> Self {
    DeviceId(s.to_string())
  }
}
impl From<String> for DeviceId {
  fn from(s: String) -> Self {
    DeviceId(s)
  }
}

/// Who this node is. Fixed for the life of the process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
  pub id: DeviceId,
  pub priority: u32,
  /// This node's slot in the fleet-wide vector clock.
  pub vector_index: usize,
  pub total_nodes: usize,
}
impl NodeIdentity {
  pub fn new(id: DeviceId, priority: u32, vector_index: usize, total_nodes: usize) -> Self {
    NodeIdentity {
      id: id,
      priority: priority,
      vector_index: vector_index,
      total_nodes: total_nodes,
    }
  }

  /// A strict majority of the known fleet.
  pub fn quorum_size(&self) -> usize {
    self.total_nodes / 2 + 1
  }

  /// Candidacies are ranked by priority first, then by id, so two nodes never tie.
  pub fn outranks(&self, priority: u32, id: &DeviceId) -> bool {
    (self.priority, &self.id) > (priority, id)
  }

  pub fn outranked_by(&self, priority: u32, id: &DeviceId) -> bool {
    (priority, id) > (self.priority, &self.id)
  }
}

#[test]
fn test_quorum_size() {
  let sizes = (1..=7)
    .map(|n| NodeIdentity::new("n".into(), 0, 0, n).quorum_size())
    .collect::<Vec<_>>();
  assert_eq!(sizes, vec![1, 2, 2, 3, 3, 4, 4]);
}

#[test]
fn test_rank_tie_break() {
  let me = NodeIdentity::new("sensor-002".into(), 5, 1, 3);
  assert!(me.outranks(3, &"sensor-009".into()));
  assert!(me.outranks(5, &"sensor-001".into()));
  assert!(me.outranked_by(5, &"sensor-003".into()));
  assert!(!me.outranks(5, &"sensor-002".into()));
  assert!(!me.outranked_by(5, &"sensor-002".into()));
}

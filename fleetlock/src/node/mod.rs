//! A fleet member as a pure state machine.

mod context;
mod coord_node;
mod peers;

use crate::core::{DeviceId, LockStatus};
use crate::election::Role;
use crate::lock::ClientPhase;

#[rustfmt::skip]
pub use {
  context::NodeContext,
  coord_node::CoordNode,
  coord_node::NodeCmd,
  coord_node::NodeEvent,
  peers::PeerView,
};

/// A point-in-time view of a node, for operators and tests.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeSnapshot {
  pub id: DeviceId,
  pub role: Role,
  pub leader: Option<DeviceId>,
  pub killed: bool,
  pub client: ClientPhase,
  /// The lock as arbitrated here, when this node is the active coordinator.
  pub lock: Option<LockStatus>,
  /// The last lock status seen on the bus.
  pub last_status: Option<LockStatus>,
  pub offset: i64,
  pub lamport: u64,
  pub vector: Vec<u64>,
  pub peers: Vec<DeviceId>,
}

use crate::core::{DeviceId, GossipView, Presence, PresenceStatus};
use im::OrdSet;

/// Which other nodes this node believes are up, built from presence announcements and gossip.
#[derive(Clone, Debug, Default)]
pub struct PeerView {
  online: OrdSet<DeviceId>,
}
impl PeerView {
  pub fn new() -> PeerView {
    PeerView::default()
  }

  pub fn on_presence(&mut self, me: &DeviceId, presence: &Presence) {
    if presence.device_id == *me {
      return;
    }
    match presence.status {
      PresenceStatus::Online => self.online.insert(presence.device_id.clone()),
      PresenceStatus::Offline => self.online.remove(&presence.device_id),
    };
  }

  /// Anyone gossiping is up. Their view of others is not taken on trust.
  pub fn on_gossip(&mut self, me: &DeviceId, view: &GossipView) {
    if view.sender_id != *me {
      self.online.insert(view.sender_id.clone());
    }
  }

  pub fn known(&self) -> Vec<DeviceId> {
    self.online.iter().cloned().collect()
  }

  pub fn len(&self) -> usize {
    self.online.len()
  }
}

#[test]
fn test_offline_peers_drop_out() {
  let me = DeviceId::from("sensor-001");
  let mut view = PeerView::new();
  let presence = |id: &str, status| Presence {
    device_id: id.into(),
    status: status,
  };
  view.on_presence(&me, &presence("sensor-003", PresenceStatus::Online));
  view.on_presence(&me, &presence("sensor-001", PresenceStatus::Online));
  view.on_gossip(
    &me,
    &GossipView {
      sender_id: "sensor-002".into(),
      known_nodes: vec!["ghost".into()],
    },
  );
  let known: std::collections::BTreeSet<DeviceId> = view.known().into_iter().collect();
  assert_eq!(known, maplit::btreeset! {"sensor-002".into(), "sensor-003".into()});
  view.on_presence(&me, &presence("sensor-003", PresenceStatus::Offline));
  assert_eq!(view.len(), 1);
}

use fleetlock::config::NodeConfig;
use fleetlock::core::{ChaosAction, DeviceId, Message, PresenceStatus, Topics};
use fleetlock::election::Role;
use fleetlock::testkit::{ChaosAttacker, SimConfig, Simulation};
use std::time::Duration;

fn sensors(max_vector_jump: Option<u64>) -> Vec<NodeConfig> {
  (1..=5)
    .map(|i| {
      let mut config = NodeConfig::new(DeviceId::new(format!("sensor-{:03}", i)), i as u32, i - 1, 5);
      config.topics = Topics::new("fleet");
      config.clock.max_vector_jump = max_vector_jump;
      config
    })
    .collect()
}

fn elected(max_vector_jump: Option<u64>) -> Simulation {
  let mut sim = Simulation::fleet(sensors(max_vector_jump), SimConfig::default());
  let expected = vec![DeviceId::from("sensor-005")];
  assert!(sim.run_until_true(Duration::from_secs(15), |s| s.coordinators() == expected));
  sim
}

fn presence(sim: &Simulation, id: &str) -> Vec<PresenceStatus> {
  sim
    .messages_on(&sim.topics().status(&id.into()))
    .into_iter()
    .filter_map(|(_, m)| match m {
      Message::Presence(p) => Some(p.status),
      _ => None,
    })
    .collect()
}

#[test]
fn killed_node_goes_silent_until_revived() {
  let mut sim = elected(None);
  sim.chaos("sensor-002", ChaosAction::Kill);
  sim.run_for(Duration::from_millis(50));
  assert!(sim.node("sensor-002").unwrap().is_killed());
  assert_eq!(presence(&sim, "sensor-002").last(), Some(&PresenceStatus::Offline));

  let published = sim.history().len();
  let lamport = sim.node("sensor-002").unwrap().clock().lamport();
  sim.run_for(Duration::from_secs(20));
  let spoke = sim.history()[published..]
    .iter()
    .any(|(_, p)| p.topic.contains("sensor-002") && !p.topic.contains("mutex/grant"));
  assert!(!spoke, "a dead node published");
  // Nothing is processed either, so its logical clock stands still.
  assert_eq!(sim.node("sensor-002").unwrap().clock().lamport(), lamport);

  sim.chaos("sensor-002", ChaosAction::Revive);
  sim.run_for(Duration::from_secs(12));
  assert!(!sim.node("sensor-002").unwrap().is_killed());
  assert_eq!(presence(&sim, "sensor-002").last(), Some(&PresenceStatus::Online));
  assert!(sim.node("sensor-002").unwrap().clock().lamport() > lamport);
  for id in sim.ids().iter().filter(|id| id.as_str() != "sensor-002") {
    let peers = sim.snapshot(id.as_str()).unwrap().peers;
    assert!(peers.contains(&"sensor-002".into()), "{} lost sensor-002", id);
  }
}

#[test]
fn killing_the_coordinator_elects_the_next_in_rank() {
  let mut sim = elected(None);
  sim.chaos("sensor-005", ChaosAction::Kill);
  let expected = vec![DeviceId::from("sensor-004")];
  assert!(sim.run_until_true(Duration::from_secs(15), |s| s.coordinators() == expected));
  for id in ["sensor-001", "sensor-002", "sensor-003"] {
    let peers = sim.snapshot(id).unwrap().peers;
    assert!(!peers.contains(&"sensor-005".into()), "{} still sees sensor-005", id);
  }

  // Revived, the old coordinator still outranks everyone and reclaims the role.
  sim.chaos("sensor-005", ChaosAction::Revive);
  sim.run_for(Duration::from_secs(10));
  assert_eq!(sim.coordinators(), vec![DeviceId::from("sensor-005")]);
  assert_eq!(sim.node("sensor-004").unwrap().role(), Role::Follower);
}

#[test]
fn chaos_for_someone_else_is_ignored() {
  let mut sim = elected(None);
  sim.chaos("sensor-404", ChaosAction::Kill);
  sim.run_for(Duration::from_secs(1));
  for id in sim.ids() {
    assert!(!sim.node(id.as_str()).unwrap().is_killed(), "{}", id);
  }
}

#[test]
fn skewed_vector_clocks_are_absorbed_without_a_guard() {
  let mut sim = elected(None);
  let attacker = ChaosAttacker::new(sim.topics().clone(), sim.ids(), 9);
  sim.inject(attacker.skew());
  sim.run_for(Duration::from_millis(100));
  for id in sim.ids() {
    let snapshot = sim.snapshot(id.as_str()).unwrap();
    assert!(snapshot.vector[0] >= 5000, "{}: {:?}", id, snapshot.vector);
    assert!(snapshot.lamport >= 99999, "{}", id);
  }
}

#[test]
fn vector_jump_guard_drops_skewed_messages() {
  let mut sim = elected(Some(1000));
  let attacker = ChaosAttacker::new(sim.topics().clone(), sim.ids(), 9);
  sim.inject(attacker.skew());
  sim.run_for(Duration::from_secs(5));
  for id in sim.ids() {
    let snapshot = sim.snapshot(id.as_str()).unwrap();
    assert!(snapshot.vector[0] < 5000, "{}: {:?}", id, snapshot.vector);
    assert!(snapshot.lamport < 99999, "{}", id);
  }
  // The fleet carries on regardless.
  assert_eq!(sim.coordinators(), vec![DeviceId::from("sensor-005")]);
}

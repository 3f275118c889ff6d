use fleetlock::config::NodeConfig;
use fleetlock::core::{DeviceId, Topics};
use fleetlock::lock::ClientPhase;
use fleetlock::node::NodeCmd;
use fleetlock::testkit::{ChaosAttacker, SimConfig, Simulation};
use std::time::Duration;

const COORDINATOR: &str = "sensor-005";

fn sensors(n: usize, attempt_interval: Option<Duration>) -> Vec<NodeConfig> {
  (1..=n)
    .map(|i| {
      let mut config = NodeConfig::new(DeviceId::new(format!("sensor-{:03}", i)), i as u32, i - 1, n);
      config.topics = Topics::new("fleet");
      config.lock.lock_attempt_interval = attempt_interval;
      config
    })
    .collect()
}

fn elected(n: usize, attempt_interval: Option<Duration>) -> Simulation {
  let mut sim = Simulation::fleet(sensors(n, attempt_interval), SimConfig::default());
  let coordinator = vec![DeviceId::from(COORDINATOR)];
  assert!(sim.run_until_true(Duration::from_secs(15), |s| s.coordinators() == coordinator));
  sim
}

fn granted(sim: &Simulation) -> Vec<String> {
  sim.grants().iter().map(|(_, id)| id.to_string()).collect()
}

#[test]
fn requests_are_served_in_arrival_order() {
  let mut sim = elected(5, None);
  sim.command("sensor-001", NodeCmd::AcquireLock);
  sim.command_after(Duration::from_millis(20), "sensor-003", NodeCmd::AcquireLock);
  sim.command_after(Duration::from_millis(40), "sensor-002", NodeCmd::AcquireLock);
  sim.run_for(Duration::from_millis(500));

  assert_eq!(sim.node("sensor-001").unwrap().client_phase(), ClientPhase::Holding);
  let state = sim.node(COORDINATOR).unwrap().lock_state().unwrap();
  assert_eq!(state.holder(), Some(&DeviceId::from("sensor-001")));
  assert_eq!(
    state.queue().iter().cloned().collect::<Vec<_>>(),
    vec![DeviceId::from("sensor-003"), DeviceId::from("sensor-002")]
  );

  // Each holder keeps the lock for its three second critical section.
  sim.run_for(Duration::from_secs(10));
  assert_eq!(granted(&sim), vec!["sensor-001", "sensor-003", "sensor-002"]);
  assert!(sim.violations().is_empty());
  let state = sim.node(COORDINATOR).unwrap().lock_state().unwrap();
  assert!(state.available());
  assert!(state.queue().is_empty());
}

#[test]
fn status_is_retained_for_every_node() {
  let mut sim = elected(5, None);
  sim.command("sensor-002", NodeCmd::AcquireLock);
  sim.run_for(Duration::from_millis(200));
  for id in sim.ids() {
    let status = sim.snapshot(id.as_str()).unwrap().last_status.unwrap();
    assert!(!status.available, "{}", id);
    assert_eq!(status.holder, Some("sensor-002".into()));
  }
}

#[test]
fn early_release_hands_over_immediately() {
  let mut sim = elected(5, None);
  sim.command("sensor-001", NodeCmd::AcquireLock);
  sim.command_after(Duration::from_millis(20), "sensor-002", NodeCmd::AcquireLock);
  sim.command_after(Duration::from_millis(200), "sensor-001", NodeCmd::ReleaseLock);
  sim.run_for(Duration::from_millis(400));
  assert_eq!(granted(&sim), vec!["sensor-001", "sensor-002"]);
  assert_eq!(sim.node("sensor-001").unwrap().client_phase(), ClientPhase::Idle);
  assert_eq!(sim.node("sensor-002").unwrap().client_phase(), ClientPhase::Holding);
}

#[test]
fn contention_never_breaks_exclusion() {
  let mut sim = elected(5, Some(Duration::from_millis(1500)));
  sim.run_for(Duration::from_secs(120));
  assert!(sim.violations().is_empty(), "{:?}", sim.violations());
  let grants = granted(&sim);
  assert!(grants.len() >= 20, "{:?}", grants);
  for id in sim.ids() {
    assert!(grants.contains(&id.to_string()), "{} starved", id);
  }
  // Every grant was logged before it was published.
  let logged = sim
    .wal()
    .entries()
    .unwrap()
    .iter()
    .filter(|e| e.operation == fleetlock::lock::WalOperation::Grant)
    .count();
  assert_eq!(logged, grants.len());
}

#[test]
fn spoofed_release_from_a_non_holder_is_ignored() {
  let mut sim = elected(5, None);
  sim.command("sensor-001", NodeCmd::AcquireLock);
  sim.command_after(Duration::from_millis(20), "sensor-002", NodeCmd::AcquireLock);
  sim.run_for(Duration::from_millis(200));

  let attacker = ChaosAttacker::new(sim.topics().clone(), sim.ids(), 1);
  sim.inject(attacker.poison(&"sensor-002".into()));
  sim.inject(attacker.poison(&"sensor-004".into()));
  sim.run_for(Duration::from_millis(200));

  let state = sim.node(COORDINATOR).unwrap().lock_state().unwrap();
  assert_eq!(state.holder(), Some(&DeviceId::from("sensor-001")));
  assert!(state.is_waiting(&"sensor-002".into()));
  assert_eq!(granted(&sim), vec!["sensor-001"]);
}

#[test]
fn grant_to_a_node_that_gave_up_is_returned() {
  let mut sim = elected(5, None);
  sim.command("sensor-001", NodeCmd::AcquireLock);
  sim.command_after(Duration::from_millis(20), "sensor-002", NodeCmd::AcquireLock);
  // sensor-002 loses interest while still queued.
  sim.command_after(Duration::from_millis(100), "sensor-002", NodeCmd::ReleaseLock);
  sim.command_after(Duration::from_millis(20), "sensor-003", NodeCmd::AcquireLock);
  sim.run_for(Duration::from_secs(8));
  // The queued grant still reaches sensor-002, which hands it straight back.
  assert_eq!(granted(&sim), vec!["sensor-001", "sensor-002", "sensor-003"]);
  assert!(sim.violations().is_empty());
  assert_eq!(sim.node("sensor-002").unwrap().client_phase(), ClientPhase::Idle);
}

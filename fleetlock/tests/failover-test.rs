use fleetlock::config::NodeConfig;
use fleetlock::core::{ChaosAction, DeviceId, Topics};
use fleetlock::lock::{ClientPhase, MemoryWal, RecoveryPolicy, WalEntry, WalOperation, WriteAheadLog};
use fleetlock::node::NodeCmd;
use fleetlock::testkit::{SimConfig, Simulation};
use fleetlock::time_server::TimeServer;
use std::time::Duration;

fn sensors() -> Vec<NodeConfig> {
  (1..=5)
    .map(|i| {
      let mut config = NodeConfig::new(DeviceId::new(format!("sensor-{:03}", i)), i as u32, i - 1, 5);
      config.topics = Topics::new("fleet");
      config
    })
    .collect()
}

fn wait_for_coordinator(sim: &mut Simulation, id: &str, limit: Duration) {
  let expected = vec![DeviceId::from(id)];
  let reached = sim.run_until_true(limit, |s| s.coordinators() == expected);
  assert!(reached, "expected {} to lead, got {:?}", id, sim.coordinators());
}

/// A fleet whose shared log starts out as `wal`.
fn seeded_with(wal: MemoryWal) -> Simulation {
  let topics = Topics::new("fleet");
  let mut sim = Simulation::new(topics.clone(), SimConfig::default()).with_wal(wal);
  sim.add_time_server(TimeServer::new(topics));
  for config in sensors() {
    sim.add_node(config);
  }
  sim
}

fn operations(wal: &MemoryWal) -> Vec<(WalOperation, String)> {
  wal
    .entries()
    .unwrap()
    .into_iter()
    .map(|e| (e.operation, e.target_id.to_string()))
    .collect()
}

#[test]
fn successor_recovers_the_queue_and_reclaims_a_dead_holders_lock() {
  let mut sim = Simulation::fleet(sensors(), SimConfig::default());
  wait_for_coordinator(&mut sim, "sensor-005", Duration::from_secs(15));

  sim.command("sensor-002", NodeCmd::AcquireLock);
  sim.command_after(Duration::from_millis(20), "sensor-003", NodeCmd::AcquireLock);
  sim.run_for(Duration::from_millis(200));
  assert_eq!(sim.node("sensor-002").unwrap().client_phase(), ClientPhase::Holding);

  // The holder hangs, then the coordinator dies with the lock still out.
  sim.chaos("sensor-002", ChaosAction::Kill);
  sim.run_for(Duration::from_millis(100));
  sim.crash("sensor-005");

  wait_for_coordinator(&mut sim, "sensor-004", Duration::from_secs(15));
  let state = sim.node("sensor-004").unwrap().lock_state().unwrap();
  assert_eq!(state.holder(), Some(&DeviceId::from("sensor-002")));
  assert!(state.is_waiting(&"sensor-003".into()));

  // The watchdog takes the lock back from sensor-002 and the queue moves on.
  let granted = sim.run_until_true(Duration::from_secs(10), |s| {
    s.node("sensor-003").unwrap().client_phase() == ClientPhase::Holding
  });
  assert!(granted);
  let grants: Vec<String> = sim.grants().iter().map(|(_, id)| id.to_string()).collect();
  assert_eq!(grants, vec!["sensor-002", "sensor-003"]);
  assert!(sim.violations().is_empty());

  sim.run_for(Duration::from_secs(5));
  assert_eq!(
    operations(sim.wal()),
    vec![
      (WalOperation::Grant, "sensor-002".to_string()),
      (WalOperation::Queue, "sensor-003".to_string()),
      (WalOperation::Release, "sensor-002".to_string()),
      (WalOperation::Grant, "sensor-003".to_string()),
      (WalOperation::Release, "sensor-003".to_string()),
    ]
  );
}

#[test]
fn restarted_coordinator_takes_back_the_role() {
  let mut sim = Simulation::fleet(sensors(), SimConfig::default());
  wait_for_coordinator(&mut sim, "sensor-005", Duration::from_secs(15));
  sim.command("sensor-001", NodeCmd::AcquireLock);
  sim.run_for(Duration::from_millis(100));

  sim.crash("sensor-005");
  wait_for_coordinator(&mut sim, "sensor-004", Duration::from_secs(15));
  sim.restart("sensor-005");
  wait_for_coordinator(&mut sim, "sensor-005", Duration::from_secs(20));

  // Lock history carried across both handovers.
  let state = sim.node("sensor-005").unwrap().lock_state().unwrap();
  assert!(state.available());
  assert_eq!(sim.grants().len(), 1);
  assert!(sim.violations().is_empty());
}

#[test]
fn torn_tail_is_cut_before_recovery() {
  let mut wal = MemoryWal::new();
  wal.append(&WalEntry::new(1, WalOperation::Grant, "sensor-001".into())).unwrap();
  wal.append(&WalEntry::new(2, WalOperation::Release, "sensor-001".into())).unwrap();
  let mut bytes = wal.bytes();
  // Half of a third frame, as a crash mid-write would leave it.
  bytes.extend_from_slice(&[0, 0, 0, 40, 1, 2]);
  let damaged = MemoryWal::from_bytes(bytes, RecoveryPolicy::TruncateTail);

  let mut sim = seeded_with(damaged.clone());
  wait_for_coordinator(&mut sim, "sensor-005", Duration::from_secs(15));
  assert!(sim.node("sensor-005").unwrap().lock_state().unwrap().available());
  assert_eq!(damaged.entries().unwrap().len(), 2);
  assert_eq!(damaged.bytes().len(), wal.bytes().len());
}

#[test]
fn corrupt_log_keeps_every_node_from_arbitrating() {
  let mut wal = MemoryWal::new();
  wal.append(&WalEntry::new(1, WalOperation::Grant, "sensor-001".into())).unwrap();
  wal.append(&WalEntry::new(2, WalOperation::Queue, "sensor-002".into())).unwrap();
  let mut bytes = wal.bytes();
  // Damage the first record's body. The second frame behind it is intact.
  bytes[10] ^= 0xff;
  let corrupt = MemoryWal::from_bytes(bytes, RecoveryPolicy::TruncateTail);

  let mut sim = seeded_with(corrupt);
  sim.command_after(Duration::from_secs(12), "sensor-003", NodeCmd::AcquireLock);
  sim.run_for(Duration::from_secs(30));
  for id in sim.ids() {
    assert!(sim.node(id.as_str()).unwrap().lock_state().is_none(), "{}", id);
  }
  assert!(sim.grants().is_empty());
}

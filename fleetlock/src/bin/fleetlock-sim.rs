use clap::Parser;
use fleetlock::bus::{LocalBus, LocalBusClient, MessageBus};
use fleetlock::config::{FleetConfig, NodeConfig, ScheduledChaos};
use fleetlock::core::{ChaosCommand, DeviceId, Message, Stamp, Topics};
use fleetlock::lock::{open_wal, MemoryWal, WriteAheadLog};
use fleetlock::logging::{self, LogLevel};
use fleetlock::runtime::{spawn_node, spawn_time_server, NodeHandle, RuntimeClock};
use fleetlock::testkit::{ChaosAttacker, SimConfig, Simulation};
use fleetlock::time_server::TimeServer;
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{interval, sleep};
use tracing::{error, info, warn};

const ATTACK_INTERVAL: Duration = Duration::from_millis(3000);
const REPORT_INTERVAL: Duration = Duration::from_millis(5000);
const DEFAULT_ATTEMPT_INTERVAL: Duration = Duration::from_millis(8000);

/// Boots a fleet on an in-process bus and reports who leads and who holds the lock.
#[derive(Parser, Debug)]
#[command(name = "fleetlock-sim", version)]
struct Args {
  /// Fleet description in TOML. Five default sensors when omitted.
  #[arg(long)]
  config: Option<PathBuf>,
  /// How long to run before shutting down.
  #[arg(long, default_value_t = 60)]
  duration_secs: u64,
  /// Also run the chaos attacker, whatever the config says.
  #[arg(long)]
  attacker: bool,
  /// Overrides the config's log level.
  #[arg(long)]
  log_level: Option<LogLevel>,
  /// Run on virtual time in one thread and print a summary instead of running in real time.
  #[arg(long = "virtual")]
  virtual_time: bool,
  /// Seed for the virtual run.
  #[arg(long, default_value_t = 0)]
  seed: u64,
}

fn node_configs(fleet: &FleetConfig) -> Vec<NodeConfig> {
  fleet
    .node_configs()
    .into_iter()
    .map(|mut c| {
      // Sensors that never ask for the lock make for a dull demo.
      if c.lock.lock_attempt_interval.is_none() {
        c.lock.lock_attempt_interval = Some(DEFAULT_ATTEMPT_INTERVAL);
      }
      c
    })
    .collect()
}

fn chaos_message(chaos: &ScheduledChaos) -> Message {
  Message::Chaos(ChaosCommand {
    target_id: chaos.target.clone(),
    action: chaos.action,
  })
}

fn run_virtual(fleet: &FleetConfig, attacker: bool, duration: Duration, seed: u64) -> Result<(), Box<dyn Error>> {
  let configs = node_configs(fleet);
  let ids: Vec<DeviceId> = configs.iter().map(|c| c.id.clone()).collect();
  let mut sim = Simulation::new(
    fleet.topics.clone(),
    SimConfig {
      seed: seed,
      ..SimConfig::default()
    },
  );
  if fleet.time_server {
    sim.add_time_server(TimeServer::new(fleet.topics.clone()));
  }
  for config in configs {
    sim.add_node(config);
  }
  for chaos in &fleet.chaos {
    let p = chaos_message(chaos).publication(&fleet.topics, &Stamp::none())?;
    sim.inject_after(Duration::from_millis(chaos.at_ms), p);
  }
  if attacker {
    let mut attacker = ChaosAttacker::new(fleet.topics.clone(), ids, seed);
    let mut at = ATTACK_INTERVAL;
    while at < duration {
      sim.inject_after(at, attacker.next_attack().1);
      at += ATTACK_INTERVAL;
    }
  }
  sim.run_for(duration);

  let leaders = sim.coordinators();
  info!(elapsed_ms = sim.elapsed(), ?leaders, grants = sim.grants().len(), "virtual run finished");
  for id in sim.ids() {
    if let Some(snapshot) = sim.snapshot(id.as_str()) {
      info!(node = %id, role = ?snapshot.role, killed = snapshot.killed, offset = snapshot.offset, lamport = snapshot.lamport, "final state");
    }
  }
  if !sim.violations().is_empty() {
    for v in sim.violations() {
      error!(at_ms = v.at_ms, holders = ?v.holders, "mutual exclusion violated");
    }
    // A forged release for the real holder cannot be told apart from a genuine one.
    if !attacker {
      return Err(format!("{} mutual exclusion violations", sim.violations().len()).into());
    }
  }
  Ok(())
}

async fn publish_message(client: &LocalBusClient, topics: &Topics, msg: Message) {
  match msg.publication(topics, &Stamp::none()) {
    Ok(p) => {
      if let Err(e) = client.publish(p).await {
        warn!("operator publish failed: {}", e);
      }
    }
    Err(e) => warn!("cannot encode operator message: {}", e),
  }
}

fn report(nodes: &[NodeHandle]) {
  let snapshots: Vec<_> = nodes.iter().map(|n| n.snapshot()).collect();
  let leaders: Vec<_> = snapshots
    .iter()
    .filter(|s| !s.killed && s.role == fleetlock::election::Role::Coordinator)
    .map(|s| s.id.clone())
    .collect();
  let status = snapshots.iter().find_map(|s| s.lock.clone().or_else(|| s.last_status.clone()));
  match status {
    Some(status) => info!(
      ?leaders,
      holder = ?status.holder,
      queue = ?status.queue,
      "fleet status"
    ),
    None => info!(?leaders, "fleet status, no lock status yet"),
  }
}

async fn run_real(fleet: &FleetConfig, attacker: bool, duration: Duration, seed: u64) -> Result<(), Box<dyn Error>> {
  let bus = LocalBus::new();
  let clock = RuntimeClock::new();
  let shared = MemoryWal::new();
  let configs = node_configs(fleet);
  let ids: Vec<DeviceId> = configs.iter().map(|c| c.id.clone()).collect();

  let time_server = if fleet.time_server {
    Some(spawn_time_server(&bus, TimeServer::new(fleet.topics.clone()), clock).await?)
  } else {
    None
  };
  let mut nodes = Vec::new();
  for config in configs {
    let wal: Box<dyn WriteAheadLog> = match &config.lock.wal_path {
      Some(_) => open_wal(&config.lock)?,
      None => Box::new(shared.clone()),
    };
    nodes.push(spawn_node(&bus, config, wal, clock)?);
  }
  info!(nodes = nodes.len(), "fleet started");

  let (operator, _) = bus.connect("operator", None);
  let mut background = Vec::new();
  for chaos in fleet.chaos.clone() {
    let operator = operator.clone();
    let topics = fleet.topics.clone();
    background.push(tokio::spawn(async move {
      sleep(Duration::from_millis(chaos.at_ms)).await;
      info!(device = %chaos.target, action = ?chaos.action, "scheduled chaos");
      publish_message(&operator, &topics, chaos_message(&chaos)).await;
    }));
  }
  if attacker {
    let (client, _) = bus.connect(ChaosAttacker::CLIENT_ID, None);
    let mut attacker = ChaosAttacker::new(fleet.topics.clone(), ids, seed);
    background.push(tokio::spawn(async move {
      let mut ticks = interval(ATTACK_INTERVAL);
      loop {
        ticks.tick().await;
        let (attack, p) = attacker.next_attack();
        warn!(?attack, "attacker strikes");
        if client.publish(p).await.is_err() {
          break;
        }
      }
    }));
  }

  let mut reports = interval(REPORT_INTERVAL);
  let deadline = sleep(duration);
  tokio::pin!(deadline);
  loop {
    tokio::select! {
      _ = &mut deadline => break,
      _ = tokio::signal::ctrl_c() => {
        info!("interrupted");
        break;
      }
      _ = reports.tick() => report(&nodes),
    }
  }

  report(&nodes);
  for task in background {
    task.abort();
  }
  for node in nodes {
    node.shutdown().await;
  }
  if let Some(task) = time_server {
    task.abort();
  }
  operator.disconnect();
  Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
  let args = Args::parse();
  let fleet = match &args.config {
    Some(path) => FleetConfig::load(path)?,
    None => FleetConfig::default(),
  };
  logging::init(args.log_level.unwrap_or(fleet.log_level));
  let attacker = args.attacker || fleet.attacker;
  let duration = Duration::from_secs(args.duration_secs);
  if args.virtual_time {
    run_virtual(&fleet, attacker, duration, args.seed)
  } else {
    run_real(&fleet, attacker, duration, args.seed).await
  }
}

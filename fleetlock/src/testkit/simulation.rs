//! A whole fleet on one thread, on virtual time.
//!
//! Every node, the broker, and the time source share one event queue ordered by (time, sequence
//! number). The same seed and the same script always produce the same run, which is what the
//! integration tests lean on.

use crate::bus::{Broker, Publication};
use crate::config::NodeConfig;
use crate::core::{ChaosAction, ChaosCommand, DeviceId, Effect, Message, Stamp, TimerKey, Topics};
use crate::lock::{ClientPhase, MemoryWal};
use crate::node::{CoordNode, NodeCmd, NodeEvent, NodeSnapshot};
use crate::testkit::{Fate, FailureConfigMap, FailureMode};
use crate::time_server::TimeServer;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct SimConfig {
  /// Transit time of every delivery before any injected delay.
  ///
  /// default: `5ms`
  pub latency: Duration,
  pub failures: FailureConfigMap,
  pub mode: FailureMode,
  pub seed: u64,
  /// Wall time the run starts at, in epoch milliseconds.
  ///
  /// default: `1_700_000_000_000`
  pub start_ms: u64,
}
impl Default for SimConfig {
  fn default() -> Self {
    SimConfig {
      latency: Duration::from_millis(5),
      failures: FailureConfigMap::default(),
      mode: FailureMode::default(),
      seed: 0,
      start_ms: 1_700_000_000_000,
    }
  }
}

#[derive(Clone, Debug)]
enum SimEvent {
  Start { node: DeviceId, incarnation: u32 },
  Deliver { to: String, publication: Publication },
  Timer { node: DeviceId, incarnation: u32, key: TimerKey, generation: u64 },
  Command { node: DeviceId, cmd: NodeCmd },
  Inject(Publication),
}

struct SimNode {
  node: CoordNode,
  incarnation: u32,
  connected: bool,
}

/// Two nodes believed they held the lock at the same time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExclusionViolation {
  pub at_ms: u64,
  pub holders: Vec<DeviceId>,
}

pub struct Simulation {
  config: SimConfig,
  topics: Topics,
  now: u64,
  seq: u64,
  queue: BinaryHeap<Reverse<(u64, u64)>>,
  events: HashMap<u64, SimEvent>,
  broker: Broker,
  nodes: BTreeMap<DeviceId, SimNode>,
  time_server: Option<TimeServer>,
  wal: MemoryWal,
  rng: SmallRng,
  history: Vec<(u64, Publication)>,
  grants: Vec<(u64, DeviceId)>,
  violations: Vec<ExclusionViolation>,
}
impl Simulation {
  pub fn new(topics: Topics, config: SimConfig) -> Simulation {
    Simulation {
      now: config.start_ms,
      rng: SmallRng::seed_from_u64(config.seed),
      config: config,
      topics: topics,
      seq: 0,
      queue: BinaryHeap::new(),
      events: HashMap::new(),
      broker: Broker::new(),
      nodes: BTreeMap::new(),
      time_server: None,
      wal: MemoryWal::new(),
      history: Vec::new(),
      grants: Vec::new(),
      violations: Vec::new(),
    }
  }

  /// A fleet of `configs`, all started at once, with a time source.
  pub fn fleet(configs: Vec<NodeConfig>, config: SimConfig) -> Simulation {
    let topics = configs.first().map(|c| c.topics.clone()).unwrap_or_default();
    let mut sim = Simulation::new(topics.clone(), config);
    sim.add_time_server(TimeServer::new(topics));
    for node in configs {
      sim.add_node(node);
    }
    sim
  }

  pub fn now(&self) -> u64 {
    self.now
  }

  /// Milliseconds since the run started.
  pub fn elapsed(&self) -> u64 {
    self.now - self.config.start_ms
  }

  pub fn topics(&self) -> &Topics {
    &self.topics
  }

  /// The lock log every coordinator shares.
  pub fn wal(&self) -> &MemoryWal {
    &self.wal
  }

  /// Starts from an existing log. Only nodes added afterwards use it.
  pub fn with_wal(mut self, wal: MemoryWal) -> Simulation {
    self.wal = wal;
    self
  }

  pub fn add_time_server(&mut self, server: TimeServer) {
    self.broker.connect(TimeServer::CLIENT_ID, None);
    if let Err(e) = self.broker.subscribe(TimeServer::CLIENT_ID, &server.request_filter()) {
      warn!("time server cannot subscribe: {}", e);
    }
    self.time_server = Some(server);
  }

  /// Connects a node and schedules its start.
  pub fn add_node(&mut self, config: NodeConfig) {
    let id = config.id.clone();
    let node = CoordNode::new(config, Box::new(self.wal.clone()), self.now);
    self.nodes.insert(
      id.clone(),
      SimNode {
        node: node,
        incarnation: 0,
        connected: false,
      },
    );
    self.connect(&id);
  }

  fn connect(&mut self, id: &DeviceId) {
    let sim_node = match self.nodes.get_mut(id) {
      Some(n) => n,
      None => return,
    };
    let testament = match sim_node.node.testament() {
      Ok(t) => Some(t),
      Err(e) => {
        warn!(node = %id, "cannot encode testament: {}", e);
        None
      }
    };
    sim_node.connected = true;
    let incarnation = sim_node.incarnation;
    self.broker.connect(id.as_str(), testament);
    self.schedule(
      0,
      SimEvent::Start {
        node: id.clone(),
        incarnation: incarnation,
      },
    );
  }

  pub fn node(&self, id: &str) -> Option<&CoordNode> {
    self.nodes.get(&DeviceId::from(id)).map(|n| &n.node)
  }

  pub fn snapshot(&self, id: &str) -> Option<NodeSnapshot> {
    self.node(id).map(|n| n.snapshot())
  }

  pub fn ids(&self) -> Vec<DeviceId> {
    self.nodes.keys().cloned().collect()
  }

  pub fn is_connected(&self, id: &str) -> bool {
    self.nodes.get(&DeviceId::from(id)).map_or(false, |n| n.connected)
  }

  /// Live nodes that currently believe they are coordinator.
  pub fn coordinators(&self) -> Vec<DeviceId> {
    self
      .nodes
      .values()
      .filter(|n| n.connected && !n.node.is_killed() && n.node.is_coordinator())
      .map(|n| n.node.id().clone())
      .collect()
  }

  /// Every publication the broker routed, in order, with the time it was published.
  pub fn history(&self) -> &[(u64, Publication)] {
    &self.history
  }

  /// Decoded publications on one topic.
  pub fn messages_on(&self, topic: &str) -> Vec<(u64, Message)> {
    self
      .history
      .iter()
      .filter(|(_, p)| p.topic == topic)
      .filter_map(|(t, p)| Message::decode(&self.topics, &p.topic, &p.payload).ok().map(|(m, _)| (*t, m)))
      .collect()
  }

  /// Every grant published so far.
  pub fn grants(&self) -> &[(u64, DeviceId)] {
    &self.grants
  }

  pub fn violations(&self) -> &[ExclusionViolation] {
    &self.violations
  }

  pub fn command(&mut self, id: &str, cmd: NodeCmd) {
    self.command_after(Duration::ZERO, id, cmd);
  }

  pub fn command_after(&mut self, after: Duration, id: &str, cmd: NodeCmd) {
    self.schedule(
      after.as_millis() as u64,
      SimEvent::Command {
        node: id.into(),
        cmd: cmd,
      },
    );
  }

  /// Publishes on the bus as an outside client would.
  pub fn inject(&mut self, publication: Publication) {
    self.inject_after(Duration::ZERO, publication);
  }

  pub fn inject_after(&mut self, after: Duration, publication: Publication) {
    self.schedule(after.as_millis() as u64, SimEvent::Inject(publication));
  }

  /// Sends a KILL or REVIVE over the chaos channel.
  pub fn chaos(&mut self, target: &str, action: ChaosAction) {
    let command = Message::Chaos(ChaosCommand {
      target_id: target.into(),
      action: action,
    });
    match command.publication(&self.topics, &Stamp::none()) {
      Ok(p) => self.inject(p),
      Err(e) => warn!("cannot encode chaos command: {}", e),
    }
  }

  /// Drops the node's connection without warning. The broker publishes its testament and every
  /// event still in flight for it is lost.
  pub fn crash(&mut self, id: &str) {
    let id = DeviceId::from(id);
    match self.nodes.get_mut(&id) {
      Some(n) if n.connected => n.connected = false,
      _ => return,
    }
    debug!(node = %id, at = self.elapsed(), "crash");
    if let Some(testament) = self.broker.disconnect(id.as_str(), false) {
      self.route(testament);
    }
  }

  /// Brings a crashed node back as a fresh process on the same config and the same shared log.
  pub fn restart(&mut self, id: &str) {
    let id = DeviceId::from(id);
    let wal = self.wal.clone();
    let now = self.now;
    match self.nodes.get_mut(&id) {
      Some(n) if !n.connected => {
        let config = n.node.config().clone();
        n.node = CoordNode::new(config, Box::new(wal), now);
        n.incarnation += 1;
      }
      _ => return,
    }
    self.connect(&id);
  }

  fn schedule(&mut self, after_ms: u64, event: SimEvent) {
    let seq = self.seq;
    self.seq += 1;
    self.queue.push(Reverse((self.now + after_ms, seq)));
    self.events.insert(seq, event);
  }

  /// Runs the next event. Returns false when nothing is left to do.
  pub fn step(&mut self) -> bool {
    let (at, seq) = match self.queue.pop() {
      Some(Reverse(next)) => next,
      None => return false,
    };
    self.now = self.now.max(at);
    if let Some(event) = self.events.remove(&seq) {
      self.run_event(event);
    }
    true
  }

  /// Runs every event due up to `elapsed_ms` after the start, then parks the clock there.
  pub fn run_until(&mut self, elapsed_ms: u64) {
    let deadline = self.config.start_ms + elapsed_ms;
    while let Some(Reverse((at, _))) = self.queue.peek() {
      if *at > deadline {
        break;
      }
      self.step();
    }
    self.now = self.now.max(deadline);
  }

  pub fn run_for(&mut self, duration: Duration) {
    let target = self.elapsed() + duration.as_millis() as u64;
    self.run_until(target);
  }

  /// Runs until `done` holds, checking after every event. Gives up at `limit` of simulated time.
  pub fn run_until_true<F>(&mut self, limit: Duration, mut done: F) -> bool
  where
    F: FnMut(&Simulation) -> bool,
  {
    let deadline = self.now + limit.as_millis() as u64;
    while !done(self) {
      match self.queue.peek() {
        Some(Reverse((at, _))) if *at <= deadline => {
          self.step();
        }
        _ => {
          self.now = self.now.max(deadline);
          return done(self);
        }
      }
    }
    true
  }

  fn run_event(&mut self, event: SimEvent) {
    match event {
      SimEvent::Start { node, incarnation } => {
        if self.current(&node, incarnation) {
          self.dispatch(&node, NodeEvent::Start);
        }
      }
      SimEvent::Timer {
        node,
        incarnation,
        key,
        generation,
      } => {
        if self.current(&node, incarnation) {
          self.dispatch(
            &node,
            NodeEvent::Timer {
              key: key,
              generation: generation,
            },
          );
        }
      }
      SimEvent::Command { node, cmd } => {
        if self.current(&node, self.incarnation(&node)) {
          self.dispatch(&node, NodeEvent::Command(cmd));
        }
      }
      SimEvent::Deliver { to, publication } => {
        if to == TimeServer::CLIENT_ID {
          let now = self.now;
          let response = self.time_server.as_ref().and_then(|s| s.handle(&publication, now));
          if let Some(response) = response {
            self.route(response);
          }
        } else {
          let id = DeviceId::from(to.as_str());
          if self.current(&id, self.incarnation(&id)) {
            self.dispatch(&id, NodeEvent::Deliver(publication));
          }
        }
      }
      SimEvent::Inject(publication) => self.route(publication),
    }
  }

  fn incarnation(&self, id: &DeviceId) -> u32 {
    self.nodes.get(id).map_or(0, |n| n.incarnation)
  }

  fn current(&self, id: &DeviceId, incarnation: u32) -> bool {
    self
      .nodes
      .get(id)
      .map_or(false, |n| n.connected && n.incarnation == incarnation)
  }

  fn dispatch(&mut self, id: &DeviceId, event: NodeEvent) {
    let now = self.now;
    let (effects, incarnation) = match self.nodes.get_mut(id) {
      Some(n) => (n.node.handle(event, now), n.incarnation),
      None => return,
    };
    for effect in effects {
      match effect {
        Effect::Publish(p) => self.route(p),
        Effect::Subscribe(filter) => match self.broker.subscribe(id.as_str(), &filter) {
          Ok(retained) => {
            for p in retained {
              self.deliver(id.as_str(), p);
            }
          }
          Err(e) => warn!(node = %id, "subscribe failed: {}", e),
        },
        Effect::Unsubscribe(filter) => {
          if let Err(e) = self.broker.unsubscribe(id.as_str(), &filter) {
            warn!(node = %id, "unsubscribe failed: {}", e);
          }
        }
        Effect::ArmTimer {
          key,
          generation,
          after,
        } => self.schedule(
          after.as_millis() as u64,
          SimEvent::Timer {
            node: id.clone(),
            incarnation: incarnation,
            key: key,
            generation: generation,
          },
        ),
      }
    }
    self.check_exclusion();
  }

  fn route(&mut self, publication: Publication) {
    if let Ok((Message::LockGrant(id), _)) =
      Message::decode(&self.topics, &publication.topic, &publication.payload)
    {
      self.grants.push((self.now, id));
    }
    self.history.push((self.now, publication.clone()));
    for client in self.broker.publish(&publication) {
      self.deliver(&client, publication.clone());
    }
  }

  fn deliver(&mut self, to: &str, publication: Publication) {
    let latency = self.config.latency.as_millis() as u64;
    let fate = if self.config.mode.applies_to(publication.delivery) {
      self.config.failures.get(&DeviceId::from(to)).decide(&mut self.rng)
    } else {
      Fate::Deliver {
        delay: Duration::ZERO,
        copies: 1,
      }
    };
    if let Fate::Deliver { delay, copies } = fate {
      for copy in 0..copies as u64 {
        self.schedule(
          latency * (copy + 1) + delay.as_millis() as u64,
          SimEvent::Deliver {
            to: to.to_string(),
            publication: publication.clone(),
          },
        );
      }
    }
  }

  fn check_exclusion(&mut self) {
    let holders: Vec<DeviceId> = self
      .nodes
      .values()
      .filter(|n| n.connected && n.node.client_phase() == ClientPhase::Holding)
      .map(|n| n.node.id().clone())
      .collect();
    if holders.len() > 1 {
      let seen = self.violations.last().map_or(false, |v| v.holders == holders);
      if !seen {
        warn!(at = self.elapsed(), ?holders, "mutual exclusion violated");
        self.violations.push(ExclusionViolation {
          at_ms: self.elapsed(),
          holders: holders,
        });
      }
    }
  }
}

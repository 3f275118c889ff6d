use crate::bus::Publication;
use crate::chaos::ChaosSwitch;
use crate::clock::{ClockSyncAgent, Observation};
use crate::config::NodeConfig;
use crate::core::{
  Announcement, ChaosAction, DeviceId, Effect, ElectionMsg, GossipView, LockStatus, Message, Presence,
  PresenceStatus, Stamp, Telemetry, TimeRequest, TimerKey,
};
use crate::election::{ElectionEngine, Role, Transition};
use crate::lock::{ClientPhase, LockClient, LockCoordinator, LockState, WriteAheadLog};
use crate::node::{NodeContext, NodeSnapshot, PeerView};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Something that happened to a node.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeEvent {
  /// Connects the node to the fleet. Handled once.
  Start,
  Deliver(Publication),
  Timer { key: TimerKey, generation: u64 },
  Command(NodeCmd),
}

/// Local instructions, as opposed to anything arriving over the bus.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeCmd {
  AcquireLock,
  ReleaseLock,
  SetDrift(f64),
  Kill,
  Revive,
}

/// One member of the fleet, with every role it plays.
///
/// `handle` is the only entry point. It runs one event to completion and returns what the node
/// wants done. The node never does I/O itself, so the same code runs under the tokio driver in
/// [`runtime`](crate::runtime) and in the deterministic simulator.
pub struct CoordNode {
  ctx: NodeContext,
  config: NodeConfig,
  election: ElectionEngine,
  coordinator: LockCoordinator,
  client: LockClient,
  chaos: ChaosSwitch,
  peers: PeerView,
  last_status: Option<LockStatus>,
  rng: SmallRng,
  started: bool,
}
impl CoordNode {
  pub fn new(config: NodeConfig, wal: Box<dyn WriteAheadLog>, wall_ms: u64) -> CoordNode {
    let identity = config.identity();
    let clock = ClockSyncAgent::new(
      identity.vector_index,
      identity.total_nodes,
      &config.clock,
      wall_ms,
    );
    let seed = identity
      .id
      .as_str()
      .bytes()
      .fold(identity.vector_index as u64, |h, b| h.wrapping_mul(31).wrapping_add(b as u64));
    CoordNode {
      ctx: NodeContext::new(identity, config.topics.clone(), clock),
      election: ElectionEngine::new(config.election.clone()),
      coordinator: LockCoordinator::new(wal, config.lock.watchdog()),
      client: LockClient::new(config.lock.critical_section, config.lock.lock_attempt_interval),
      chaos: ChaosSwitch::new(),
      peers: PeerView::new(),
      last_status: None,
      rng: SmallRng::seed_from_u64(seed),
      started: false,
      config: config,
    }
  }

  pub fn id(&self) -> &DeviceId {
    &self.ctx.identity.id
  }

  pub fn config(&self) -> &NodeConfig {
    &self.config
  }

  pub fn role(&self) -> Role {
    self.election.role()
  }

  pub fn is_coordinator(&self) -> bool {
    self.election.is_coordinator()
  }

  /// The lock as this node arbitrates it. `None` unless it is an active coordinator.
  pub fn lock_state(&self) -> Option<&LockState> {
    self.coordinator.state()
  }

  pub fn client_phase(&self) -> ClientPhase {
    self.client.phase()
  }

  pub fn clock(&self) -> &ClockSyncAgent {
    &self.ctx.clock
  }

  pub fn is_killed(&self) -> bool {
    self.chaos.is_killed()
  }

  pub fn snapshot(&self) -> NodeSnapshot {
    NodeSnapshot {
      id: self.id().clone(),
      role: self.role(),
      leader: self.election.leader().cloned(),
      killed: self.is_killed(),
      client: self.client_phase(),
      lock: self.lock_state().map(|s| s.status()),
      last_status: self.last_status.clone(),
      offset: self.ctx.clock.offset(),
      lamport: self.ctx.clock.lamport(),
      vector: self.ctx.clock.vector().slots().to_vec(),
      peers: self.peers.known(),
    }
  }

  /// The retained "offline" announcement the broker should publish if this node's connection dies.
  pub fn testament(&self) -> serde_json::Result<Publication> {
    let offline = Message::Presence(Presence {
      device_id: self.id().clone(),
      status: PresenceStatus::Offline,
    });
    offline.publication(&self.ctx.topics, &Stamp::none())
  }

  pub fn handle(&mut self, event: NodeEvent, wall_ms: u64) -> Vec<Effect> {
    self.ctx.begin(wall_ms);
    match event {
      NodeEvent::Start => self.on_start(),
      NodeEvent::Deliver(publication) => self.on_publication(publication),
      NodeEvent::Timer { key, generation } => {
        if self.ctx.timers.fire(key, generation) {
          self.on_timer(key);
        }
      }
      NodeEvent::Command(cmd) => self.on_command(cmd),
    }
    self.ctx.take_effects()
  }

  fn on_start(&mut self) {
    if self.started {
      return;
    }
    self.started = true;
    let id = self.id().clone();
    info!(node = %id, priority = self.ctx.identity.priority, "starting");
    let topics = self.ctx.topics.clone();
    for filter in vec![
      topics.election(),
      topics.coordinator(),
      topics.lease(),
      topics.quorum_check(),
      topics.quorum_ack(),
      topics.lock_grant(&id),
      topics.lock_status(),
      topics.time_response(&id),
      topics.chaos_control(),
      topics.status_filter(),
      topics.telemetry_filter(),
      topics.gossip_filter(),
    ] {
      self.ctx.subscribe(filter);
    }
    self.announce(PresenceStatus::Online);
    self.election.start(&mut self.ctx);
    self.client.start(&mut self.ctx);
    self.sync_time();
    for key in vec![TimerKey::Heartbeat, TimerKey::TimeSync, TimerKey::Telemetry, TimerKey::Gossip] {
      if let Some(period) = self.period(key) {
        self.ctx.arm(key, period);
      }
    }
  }

  /// The re-arm period of periodic timers. `None` for one-shot timers and disabled features.
  fn period(&self, key: TimerKey) -> Option<Duration> {
    match key {
      TimerKey::LeasePoll => Some(self.config.election.lease_poll),
      TimerKey::LeaseRenew if self.election.is_coordinator() => Some(self.config.election.lease_renew),
      TimerKey::Heartbeat => Some(self.config.telemetry.heartbeat_interval),
      TimerKey::TimeSync => Some(self.config.clock.sync_interval),
      TimerKey::Telemetry if self.config.telemetry.enabled => Some(self.config.telemetry.telemetry_interval),
      TimerKey::Gossip => Some(self.config.telemetry.gossip_interval),
      TimerKey::LockAttempt => self.config.lock.lock_attempt_interval,
      _ => None,
    }
  }

  fn on_timer(&mut self, key: TimerKey) {
    if self.chaos.is_killed() {
      // A dead node keeps its rhythm so it resumes on revive, but does nothing on each beat.
      if let Some(period) = self.period(key) {
        self.ctx.arm(key, period);
      }
      return;
    }
    match key {
      TimerKey::LeasePoll => self.election.on_lease_poll(&mut self.ctx),
      TimerKey::ElectionTimeout => self.election.on_election_timeout(&mut self.ctx),
      TimerKey::QuorumWait => {
        let transition = self.election.on_quorum_wait(&mut self.ctx);
        self.apply(transition);
      }
      TimerKey::Watchdog => self.coordinator.on_watchdog(&mut self.ctx),
      TimerKey::LeaseRenew => self.election.on_lease_renew(&mut self.ctx),
      TimerKey::LockAttempt => self.client.on_attempt_timer(&mut self.ctx),
      TimerKey::CriticalSection => self.client.on_critical_section_end(&mut self.ctx),
      TimerKey::Heartbeat => self.announce(PresenceStatus::Online),
      TimerKey::TimeSync => self.sync_time(),
      TimerKey::Telemetry => self.publish_telemetry(),
      TimerKey::Gossip => self.publish_gossip(),
    }
    if let TimerKey::Heartbeat | TimerKey::TimeSync | TimerKey::Telemetry | TimerKey::Gossip = key {
      if let Some(period) = self.period(key) {
        self.ctx.arm(key, period);
      }
    }
  }

  fn on_command(&mut self, cmd: NodeCmd) {
    match cmd {
      NodeCmd::Kill => self.kill(),
      NodeCmd::Revive => self.revive(),
      NodeCmd::SetDrift(rate) => {
        let now = self.ctx.now();
        info!(node = %self.id(), from = self.ctx.clock.drift_rate(), to = rate, "drift changed");
        self.ctx.clock.set_drift(rate, now);
      }
      _ if self.chaos.is_killed() => debug!(node = %self.id(), ?cmd, "dead, ignoring command"),
      NodeCmd::AcquireLock => self.client.acquire(&mut self.ctx),
      NodeCmd::ReleaseLock => self.client.release(&mut self.ctx),
    }
  }

  fn on_publication(&mut self, publication: Publication) {
    let (msg, stamp) = match Message::decode(&self.ctx.topics, &publication.topic, &publication.payload) {
      Ok(decoded) => decoded,
      Err(e) => {
        warn!(node = %self.id(), "discarding inbound message: {}", e);
        return;
      }
    };
    if self.chaos.is_killed() && !matches!(msg, Message::Chaos(_)) {
      trace!(node = %self.id(), topic = %publication.topic, "dead, dropping");
      return;
    }
    if let Observation::Rejected { jump } = self.ctx.clock.observe(&stamp) {
      warn!(node = %self.id(), topic = %publication.topic, jump, "vector clock jump rejected");
      return;
    }
    self.dispatch(msg);
  }

  fn dispatch(&mut self, msg: Message) {
    let me = self.id().clone();
    match msg {
      Message::LockRequest(r) => self.coordinator.on_request(&mut self.ctx, &r.device_id),
      Message::LockRelease(r) => self.coordinator.on_release(&mut self.ctx, &r.device_id),
      Message::LockGrant(id) => {
        if id == me {
          self.client.on_grant(&mut self.ctx);
        }
      }
      Message::LockStatus(status) => {
        trace!(node = %me, ?status, "lock status");
        self.last_status = Some(status);
      }
      Message::Election(ElectionMsg::Election {
        from_priority,
        from_id,
      }) => self.election.on_election(&mut self.ctx, from_priority, &from_id),
      Message::Election(ElectionMsg::Alive {
        from_priority,
        from_id,
        ..
      }) => self.election.on_alive(&mut self.ctx, from_priority, &from_id),
      Message::Coordinator(Announcement::Victory {
        coordinator_id,
        priority,
      }) => {
        let transition = self.election.on_victory(&mut self.ctx, &coordinator_id, priority);
        self.apply(transition);
        if coordinator_id != me {
          self.client.on_new_coordinator(&mut self.ctx);
        }
      }
      Message::Lease(lease) => {
        let transition = self.election.on_lease(&mut self.ctx, &lease);
        self.apply(transition);
      }
      Message::QuorumCheck(check) => self.election.on_quorum_check(&mut self.ctx, &check.candidate_id),
      Message::QuorumAck(ack) => self.election.on_quorum_ack(&mut self.ctx, &ack),
      Message::TimeRequest(_) => {}
      Message::TimeResponse(id, response) => {
        if id == me {
          let now = self.ctx.now();
          self.ctx.clock.on_time_response(&response, now);
        }
      }
      Message::Presence(presence) => self.peers.on_presence(&me, &presence),
      Message::Chaos(command) => {
        if command.target_id == me {
          match command.action {
            ChaosAction::Kill => self.kill(),
            ChaosAction::Revive => self.revive(),
          }
        }
      }
      Message::Telemetry(t) => trace!(node = %me, from = %t.device_id, "telemetry"),
      Message::Gossip(view) => self.peers.on_gossip(&me, &view),
    }
  }

  fn apply(&mut self, transition: Transition) {
    match transition {
      Transition::Unchanged => {}
      Transition::Promoted => self.take_over(),
      Transition::SteppedDown => self.coordinator.deactivate(&mut self.ctx),
    }
  }

  /// Starts arbitrating. A log that cannot be replayed makes this node give up the role.
  fn take_over(&mut self) {
    match self.coordinator.activate(&mut self.ctx) {
      Ok(()) => self.client.on_new_coordinator(&mut self.ctx),
      Err(e) => {
        error!(node = %self.id(), "cannot recover lock state, stepping down: {}", e);
        self.election.step_down(&mut self.ctx);
      }
    }
  }

  fn kill(&mut self) {
    if !self.chaos.kill() {
      return;
    }
    warn!(node = %self.id(), role = ?self.role(), "killed");
    self.announce(PresenceStatus::Offline);
    self.ctx.set_muted(true);
    self.election.abandon(&mut self.ctx);
    self.client.reset(&mut self.ctx);
    for key in vec![TimerKey::ElectionTimeout, TimerKey::QuorumWait, TimerKey::Watchdog] {
      self.ctx.cancel(key);
    }
  }

  fn revive(&mut self) {
    if !self.chaos.revive() {
      return;
    }
    self.ctx.set_muted(false);
    info!(node = %self.id(), role = ?self.role(), "revived");
    self.election.expire_lease();
    if self.election.is_coordinator() {
      self.take_over();
    }
    self.announce(PresenceStatus::Online);
  }

  fn announce(&mut self, status: PresenceStatus) {
    let presence = Presence {
      device_id: self.id().clone(),
      status: status,
    };
    self.ctx.publish(Message::Presence(presence));
  }

  fn sync_time(&mut self) {
    let now = self.ctx.now();
    let t1 = self.ctx.clock.begin_sync(now);
    let request = TimeRequest {
      device_id: self.id().clone(),
      t1: Some(t1),
    };
    self.ctx.publish(Message::TimeRequest(request));
  }

  fn publish_telemetry(&mut self) {
    let reading = Telemetry {
      device_id: self.id().clone(),
      temperatura: (self.rng.gen_range(15.0f64..25.0) * 100.0_f64).round() / 100.0,
      humedad: (self.rng.gen_range(40.0f64..60.0) * 100.0_f64).round() / 100.0,
      timestamp: self.ctx.synced_now(),
    };
    self.ctx.publish(Message::Telemetry(reading));
  }

  fn publish_gossip(&mut self) {
    let view = GossipView {
      sender_id: self.id().clone(),
      known_nodes: self.peers.known(),
    };
    self.ctx.publish(Message::Gossip(view));
  }
}

use crate::config::ElectionConfig;
use crate::core::QuorumCheck as QuorumCheckMsg;
use crate::core::{Announcement, DeviceId, ElectionMsg, Lease, Message, QuorumAck, TimerKey};
use crate::election::{LeaseManager, QuorumGate};
use crate::node::NodeContext;
use tracing::{debug, info, warn};
use Role::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
  Follower,
  Candidate,
  QuorumCheck,
  Coordinator,
}

/// How a handler changed this node's standing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
  Unchanged,
  Promoted,
  SteppedDown,
}

/// Bully-style election with lease renewal and a majority check before self-promotion.
pub struct ElectionEngine {
  config: ElectionConfig,
  role: Role,
  lease: LeaseManager,
  quorum: QuorumGate,
  leader: Option<(DeviceId, u32)>,
  ballot_started: Option<u64>,
}
impl ElectionEngine {
  pub fn new(config: ElectionConfig) -> ElectionEngine {
    ElectionEngine {
      lease: LeaseManager::new(config.lease_duration),
      config: config,
      role: Follower,
      quorum: QuorumGate::new(),
      leader: None,
      ballot_started: None,
    }
  }

  pub fn role(&self) -> Role {
    self.role
  }

  pub fn is_coordinator(&self) -> bool {
    self.role == Coordinator
  }

  pub fn leader(&self) -> Option<&DeviceId> {
    self.leader.as_ref().map(|(id, _)| id)
  }

  pub fn lease(&self) -> &LeaseManager {
    &self.lease
  }

  pub fn quorum_acks(&self) -> usize {
    self.quorum.count()
  }

  fn in_progress(&self) -> bool {
    matches!(self.role, Candidate | QuorumCheck)
  }

  /// Arms the lease poll. A newcomer gives any existing coordinator one lease duration to show up
  /// before it contests.
  pub fn start(&mut self, ctx: &mut NodeContext) {
    self.lease.hold_off(ctx.now());
    ctx.arm(TimerKey::LeasePoll, self.config.lease_poll);
  }

  pub fn on_lease_poll(&mut self, ctx: &mut NodeContext) {
    ctx.arm(TimerKey::LeasePoll, self.config.lease_poll);
    if self.role != Coordinator && !self.lease.is_fresh(ctx.now()) {
      debug!(node = %ctx.identity.id, "no fresh lease");
      self.start_election(ctx);
    }
  }

  pub fn start_election(&mut self, ctx: &mut NodeContext) {
    if self.in_progress() || self.role == Coordinator {
      return;
    }
    info!(node = %ctx.identity.id, priority = ctx.identity.priority, "starting election");
    self.role = Candidate;
    self.ballot_started = Some(ctx.now());
    ctx.publish(Message::Election(ElectionMsg::Election {
      from_priority: ctx.identity.priority,
      from_id: ctx.identity.id.clone(),
    }));
    ctx.arm(TimerKey::ElectionTimeout, self.config.election_timeout);
  }

  pub fn on_election(&mut self, ctx: &mut NodeContext, from_priority: u32, from_id: &DeviceId) {
    if *from_id == ctx.identity.id || !ctx.identity.outranks(from_priority, from_id) {
      return;
    }
    ctx.publish(Message::Election(ElectionMsg::Alive {
      from_priority: ctx.identity.priority,
      from_id: ctx.identity.id.clone(),
      to_priority: Some(from_priority),
    }));
    if self.role == Coordinator {
      self.publish_lease(ctx);
    } else {
      self.start_election(ctx);
    }
  }

  pub fn on_alive(&mut self, ctx: &mut NodeContext, from_priority: u32, from_id: &DeviceId) {
    if self.role != Candidate || !ctx.identity.outranked_by(from_priority, from_id) {
      return;
    }
    info!(node = %ctx.identity.id, by = %from_id, "outranked, abandoning candidacy");
    self.reset_ballot(ctx);
    // Give the higher node time to finish its own election before contesting again.
    self.lease.hold_off(ctx.now());
  }

  pub fn on_election_timeout(&mut self, ctx: &mut NodeContext) {
    if self.role != Candidate {
      return;
    }
    self.role = QuorumCheck;
    self.quorum.begin(&ctx.identity.id);
    debug!(node = %ctx.identity.id, needed = ctx.identity.quorum_size(), "checking quorum");
    ctx.publish(Message::QuorumCheck(QuorumCheckMsg {
      candidate_id: ctx.identity.id.clone(),
    }));
    ctx.arm(TimerKey::QuorumWait, self.config.quorum_wait);
  }

  /// Every node answers a quorum check, whatever its role.
  pub fn on_quorum_check(&mut self, ctx: &mut NodeContext, candidate: &DeviceId) {
    if *candidate == ctx.identity.id {
      return;
    }
    ctx.publish(Message::QuorumAck(QuorumAck {
      from: ctx.identity.id.clone(),
      candidate_id: candidate.clone(),
    }));
  }

  pub fn on_quorum_ack(&mut self, ctx: &mut NodeContext, ack: &QuorumAck) {
    if self.role == QuorumCheck && ack.candidate_id == ctx.identity.id {
      self.quorum.record(&ack.from);
    }
  }

  pub fn on_quorum_wait(&mut self, ctx: &mut NodeContext) -> Transition {
    if self.role != QuorumCheck {
      return Transition::Unchanged;
    }
    let needed = ctx.identity.quorum_size();
    if !self.quorum.reached(needed) {
      warn!(
        node = %ctx.identity.id,
        acks = self.quorum.count(),
        needed,
        "quorum not reached, staying follower"
      );
      self.reset_ballot(ctx);
      return Transition::Unchanged;
    }
    ctx.publish(Message::Coordinator(Announcement::Victory {
      coordinator_id: ctx.identity.id.clone(),
      priority: ctx.identity.priority,
    }));
    self.promote(ctx)
  }

  pub fn on_victory(&mut self, ctx: &mut NodeContext, id: &DeviceId, priority: u32) -> Transition {
    if *id == ctx.identity.id {
      // Only an echo of a ballot still running counts. A stale retained announcement from an
      // earlier life does not make this node coordinator.
      return if self.in_progress() {
        self.promote(ctx)
      } else {
        Transition::Unchanged
      };
    }
    if self.in_progress() {
      self.reset_ballot(ctx);
    }
    self.leader = Some((id.clone(), priority));
    self.lease.hold_off(ctx.now());
    info!(node = %ctx.identity.id, coordinator = %id, priority, "coordinator announced");
    if self.role == Coordinator {
      return self.step_down(ctx);
    }
    Transition::Unchanged
  }

  pub fn on_lease(&mut self, ctx: &mut NodeContext, lease: &Lease) -> Transition {
    if lease.coordinator_id == ctx.identity.id || lease.priority < ctx.identity.priority {
      return Transition::Unchanged;
    }
    self.lease.observe(lease.coordinator_id.clone(), lease.priority, ctx.now());
    self.leader = Some((lease.coordinator_id.clone(), lease.priority));
    if self.role == Coordinator {
      info!(node = %ctx.identity.id, other = %lease.coordinator_id, "another coordinator holds a lease");
      return self.step_down(ctx);
    }
    Transition::Unchanged
  }

  pub fn on_lease_renew(&mut self, ctx: &mut NodeContext) {
    if self.role == Coordinator {
      self.publish_lease(ctx);
      ctx.arm(TimerKey::LeaseRenew, self.config.lease_renew);
    }
  }

  /// Drops a running candidacy without touching coordinatorship.
  pub fn abandon(&mut self, ctx: &mut NodeContext) {
    if self.in_progress() {
      self.reset_ballot(ctx);
    }
  }

  /// Forgets the lease, so the next poll contests unless a coordinator speaks up first.
  pub fn expire_lease(&mut self) {
    self.lease.expire();
  }

  pub fn step_down(&mut self, ctx: &mut NodeContext) -> Transition {
    if self.role != Coordinator {
      return Transition::Unchanged;
    }
    info!(node = %ctx.identity.id, "stepping down");
    self.role = Follower;
    ctx.cancel(TimerKey::LeaseRenew);
    Transition::SteppedDown
  }

  fn promote(&mut self, ctx: &mut NodeContext) -> Transition {
    let elapsed = self.ballot_started.map(|t| ctx.now().saturating_sub(t));
    self.reset_ballot(ctx);
    self.role = Coordinator;
    self.leader = Some((ctx.identity.id.clone(), ctx.identity.priority));
    info!(node = %ctx.identity.id, election_ms = ?elapsed, "became coordinator");
    self.publish_lease(ctx);
    ctx.arm(TimerKey::LeaseRenew, self.config.lease_renew);
    Transition::Promoted
  }

  fn reset_ballot(&mut self, ctx: &mut NodeContext) {
    self.role = Follower;
    self.ballot_started = None;
    self.quorum.reset();
    ctx.cancel(TimerKey::ElectionTimeout);
    ctx.cancel(TimerKey::QuorumWait);
  }

  fn publish_lease(&mut self, ctx: &mut NodeContext) {
    let timestamp = ctx.synced_now();
    ctx.publish(Message::Lease(Lease {
      coordinator_id: ctx.identity.id.clone(),
      priority: ctx.identity.priority,
      timestamp: timestamp,
    }));
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ClockSyncAgent;
  use crate::config::ClockConfig;
  use crate::core::{Effect, NodeIdentity, Topics};

  fn context(id: &str, priority: u32) -> NodeContext {
    let identity = NodeIdentity::new(id.into(), priority, 0, 5);
    let clock = ClockSyncAgent::new(0, 5, &ClockConfig::default(), 0);
    NodeContext::new(identity, Topics::new("fleet"), clock)
  }

  fn published_topics(ctx: &mut NodeContext) -> Vec<String> {
    ctx
      .take_effects()
      .into_iter()
      .filter_map(|e| match e {
        Effect::Publish(p) => Some(p.topic),
        _ => None,
      })
      .collect()
  }

  fn candidate_in_quorum_check(ctx: &mut NodeContext) -> ElectionEngine {
    let mut engine = ElectionEngine::new(ElectionConfig::default());
    engine.start_election(ctx);
    engine.on_election_timeout(ctx);
    assert_eq!(engine.role(), QuorumCheck);
    ctx.take_effects();
    engine
  }

  #[test]
  fn quorum_gate_fails_closed() {
    let mut ctx = context("sensor-005", 5);
    let mut engine = candidate_in_quorum_check(&mut ctx);
    for _ in 0..3 {
      engine.on_quorum_ack(
        &mut ctx,
        &QuorumAck {
          from: "sensor-001".into(),
          candidate_id: "sensor-005".into(),
        },
      );
    }
    engine.on_quorum_ack(
      &mut ctx,
      &QuorumAck {
        from: "sensor-002".into(),
        candidate_id: "sensor-004".into(),
      },
    );
    assert_eq!(engine.quorum_acks(), 2);
    assert_eq!(engine.on_quorum_wait(&mut ctx), Transition::Unchanged);
    assert_eq!(engine.role(), Follower);
    assert!(!published_topics(&mut ctx).contains(&"fleet/election/coordinator".to_string()));
  }

  #[test]
  fn quorum_reached_announces_then_promotes() {
    let mut ctx = context("sensor-005", 5);
    let mut engine = candidate_in_quorum_check(&mut ctx);
    for from in &["sensor-001", "sensor-002"] {
      engine.on_quorum_ack(
        &mut ctx,
        &QuorumAck {
          from: (*from).into(),
          candidate_id: "sensor-005".into(),
        },
      );
    }
    assert_eq!(engine.on_quorum_wait(&mut ctx), Transition::Promoted);
    assert!(engine.is_coordinator());
    assert_eq!(
      published_topics(&mut ctx),
      vec!["fleet/election/coordinator".to_string(), "fleet/election/lease".to_string()]
    );
    assert!(ctx.timers.is_armed(TimerKey::LeaseRenew));
  }

  #[test]
  fn lower_lease_is_ignored_and_higher_lease_deposes() {
    let mut ctx = context("sensor-003", 3);
    let mut engine = candidate_in_quorum_check(&mut ctx);
    engine.on_quorum_ack(
      &mut ctx,
      &QuorumAck {
        from: "sensor-001".into(),
        candidate_id: "sensor-003".into(),
      },
    );
    engine.on_quorum_ack(
      &mut ctx,
      &QuorumAck {
        from: "sensor-002".into(),
        candidate_id: "sensor-003".into(),
      },
    );
    engine.on_quorum_wait(&mut ctx);
    let low = Lease {
      coordinator_id: "sensor-001".into(),
      priority: 1,
      timestamp: 0,
    };
    assert_eq!(engine.on_lease(&mut ctx, &low), Transition::Unchanged);
    assert!(engine.is_coordinator());
    let high = Lease {
      coordinator_id: "sensor-004".into(),
      priority: 4,
      timestamp: 0,
    };
    assert_eq!(engine.on_lease(&mut ctx, &high), Transition::SteppedDown);
    assert_eq!(engine.leader(), Some(&"sensor-004".into()));
    assert!(engine.lease().is_fresh(ctx.now()));
    assert!(!ctx.timers.is_armed(TimerKey::LeaseRenew));
  }

  #[test]
  fn alive_from_higher_rank_abandons_candidacy() {
    let mut ctx = context("sensor-003", 3);
    let mut engine = ElectionEngine::new(ElectionConfig::default());
    engine.start_election(&mut ctx);
    engine.on_alive(&mut ctx, 2, &"sensor-002".into());
    assert_eq!(engine.role(), Candidate);
    engine.on_alive(&mut ctx, 3, &"sensor-009".into());
    assert_eq!(engine.role(), Follower);
    assert!(!ctx.timers.is_armed(TimerKey::ElectionTimeout));
  }

  #[test]
  fn lower_election_gets_alive_and_a_counter_candidacy() {
    let mut ctx = context("sensor-005", 5);
    let mut engine = ElectionEngine::new(ElectionConfig::default());
    engine.on_election(&mut ctx, 3, &"sensor-003".into());
    assert_eq!(engine.role(), Candidate);
    assert_eq!(
      published_topics(&mut ctx),
      vec!["fleet/election/messages".to_string(), "fleet/election/messages".to_string()]
    );
    engine.on_election(&mut ctx, 7, &"sensor-007".into());
    assert!(published_topics(&mut ctx).is_empty());
  }

  #[test]
  fn stale_self_victory_does_not_promote() {
    let mut ctx = context("sensor-005", 5);
    let mut engine = ElectionEngine::new(ElectionConfig::default());
    assert_eq!(engine.on_victory(&mut ctx, &"sensor-005".into(), 5), Transition::Unchanged);
    assert_eq!(engine.role(), Follower);
    engine.start_election(&mut ctx);
    assert_eq!(engine.on_victory(&mut ctx, &"sensor-005".into(), 5), Transition::Promoted);
  }
}

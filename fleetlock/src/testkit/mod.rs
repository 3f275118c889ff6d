//! Tools for exercising a fleet under stress: fault injection for any [`MessageBus`], a hostile
//! client, and a deterministic whole-fleet simulator.
//!
//! [`MessageBus`]: crate::bus::MessageBus

mod attacker;
mod failure_config;
mod simulation;
mod unreliable;

#[rustfmt::skip]
pub use {
  attacker::Attack,
  attacker::ChaosAttacker,
  failure_config::Fate,
  failure_config::FailureConfig,
  failure_config::FailureConfigMap,
  failure_config::FailureMode,
  simulation::ExclusionViolation,
  simulation::SimConfig,
  simulation::Simulation,
  unreliable::UnreliableBus,
};

use crate::bus::{Delivery, Publication};
use crate::core::{DeviceId, Topics};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Attack {
  /// A release for a random fleet member, whether or not it holds the lock.
  MutexPoison,
  /// Telemetry carrying an absurd vector clock and Lamport time.
  ClockSkew,
}

/// Injects hostile traffic into the fleet.
pub struct ChaosAttacker {
  topics: Topics,
  fleet: Vec<DeviceId>,
  rng: SmallRng,
}
impl ChaosAttacker {
  pub const CLIENT_ID: &'static str = "unknown-attacker";

  pub fn new(topics: Topics, fleet: Vec<DeviceId>, seed: u64) -> ChaosAttacker {
    ChaosAttacker {
      topics: topics,
      fleet: fleet,
      rng: SmallRng::seed_from_u64(seed),
    }
  }

  pub fn next_attack(&mut self) -> (Attack, Publication) {
    if self.rng.gen_bool(0.5) && !self.fleet.is_empty() {
      let victim = &self.fleet[self.rng.gen_range(0..self.fleet.len())];
      (Attack::MutexPoison, self.poison(victim))
    } else {
      (Attack::ClockSkew, self.skew())
    }
  }

  pub fn poison(&self, victim: &DeviceId) -> Publication {
    let payload = json!({"deviceId": victim, "force": true});
    Publication::new(
      self.topics.lock_release(),
      payload.to_string().into_bytes(),
      Delivery::FireAndForget,
      false,
    )
  }

  pub fn skew(&self) -> Publication {
    let payload = json!({
      "deviceId": "chaos-node",
      "temperatura": 9999.0,
      "humedad": 0.0,
      "timestamp": 0,
      "vector_clock": [5000, 0, 0],
      "lamport_ts": 99999
    });
    Publication::new(
      self.topics.telemetry(&"chaos-node".into()),
      payload.to_string().into_bytes(),
      Delivery::FireAndForget,
      false,
    )
  }
}

#[test]
fn test_attacks_are_well_formed_messages() {
  use crate::core::Message;
  let topics = Topics::new("fleet");
  let mut attacker = ChaosAttacker::new(topics.clone(), vec!["sensor-001".into()], 3);
  let mut seen = std::collections::HashSet::new();
  for _ in 0..32 {
    let (attack, p) = attacker.next_attack();
    seen.insert(attack);
    let (msg, stamp) = Message::decode(&topics, &p.topic, &p.payload).unwrap();
    match attack {
      Attack::MutexPoison => assert!(matches!(msg, Message::LockRelease(_))),
      Attack::ClockSkew => {
        assert!(matches!(msg, Message::Telemetry(_)));
        assert_eq!(stamp.vector, Some(vec![5000, 0, 0]));
      }
    }
  }
  assert_eq!(seen.len(), 2);
}

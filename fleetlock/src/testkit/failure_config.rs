use crate::bus::Delivery;
use crate::core::DeviceId;
use im::HashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which deliveries fault injection applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureMode {
  /// Only fire-and-forget traffic suffers. Acknowledged traffic is retried by the broker, so at
  /// worst it arrives late.
  FireAndForget,
  /// Everything suffers.
  All,
  None,
}
impl FailureMode {
  pub fn applies_to(&self, delivery: Delivery) -> bool {
    match self {
      FailureMode::FireAndForget => delivery == Delivery::FireAndForget,
      FailureMode::All => true,
      FailureMode::None => false,
    }
  }
}
impl Default for FailureMode {
  fn default() -> Self {
    FailureMode::FireAndForget
  }
}

#[derive(Default, Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct FailureConfig {
  pub drop_prob: f64,
  pub delay: Option<(Duration, Duration)>,
  pub duplicate_prob: f64,
}

/// What fault injection decided for one delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fate {
  Dropped,
  Deliver { delay: Duration, copies: usize },
}

impl FailureConfig {
  pub fn reliable() -> FailureConfig {
    FailureConfig::default()
  }

  pub fn decide<R: Rng>(&self, rng: &mut R) -> Fate {
    if self.drop_prob > 0.0 && rng.gen::<f64>() < self.drop_prob {
      return Fate::Dropped;
    }
    let delay = self.delay.map_or(Duration::ZERO, |(min, max)| {
      let range = min.as_millis() as u64..=max.as_millis().max(min.as_millis()) as u64;
      Duration::from_millis(rng.gen_range(range))
    });
    let copies = if self.duplicate_prob > 0.0 && rng.gen::<f64>() < self.duplicate_prob {
      2
    } else {
      1
    };
    Fate::Deliver {
      delay: delay,
      copies: copies,
    }
  }
}

#[derive(Clone, Default, Serialize, Deserialize, Debug)]
pub struct FailureConfigMap {
  pub fleet_wide: FailureConfig,
  pub node_wide: HashMap<DeviceId, FailureConfig>,
}
impl FailureConfigMap {
  pub fn get(&self, id: &DeviceId) -> &FailureConfig {
    self.node_wide.get(id).unwrap_or(&self.fleet_wide)
  }
}

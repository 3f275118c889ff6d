use crate::bus::{BusError, MessageBus, Publication};
use crate::core::DeviceId;
use crate::testkit::{Fate, FailureConfigMap, FailureMode};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::trace;

/// Wraps a bus connection and degrades what it publishes according to the sender's
/// [`FailureConfig`](crate::testkit::FailureConfig).
#[derive(Clone)]
pub struct UnreliableBus<B> {
  inner: B,
  id: DeviceId,
  failures: FailureConfigMap,
  mode: FailureMode,
  rng: Arc<Mutex<SmallRng>>,
}
impl<B: MessageBus + Clone + 'static> UnreliableBus<B> {
  pub fn new(inner: B, id: DeviceId, failures: FailureConfigMap, mode: FailureMode) -> Self {
    UnreliableBus {
      inner: inner,
      id: id,
      failures: failures,
      mode: mode,
      rng: Arc::new(Mutex::new(SmallRng::from_entropy())),
    }
  }

  pub fn seeded(mut self, seed: u64) -> Self {
    self.rng = Arc::new(Mutex::new(SmallRng::seed_from_u64(seed)));
    self
  }
}
#[async_trait]
impl<B: MessageBus + Clone + 'static> MessageBus for UnreliableBus<B> {
  async fn publish(&self, publication: Publication) -> Result<(), BusError> {
    if !self.mode.applies_to(publication.delivery) {
      return self.inner.publish(publication).await;
    }
    let fate = self.failures.get(&self.id).decide(&mut *self.rng.lock());
    let (delay, copies) = match fate {
      Fate::Dropped => {
        trace!(node = %self.id, topic = %publication.topic, "dropped");
        return Ok(());
      }
      Fate::Deliver { delay, copies } => (delay, copies),
    };
    if delay.is_zero() {
      for _ in 0..copies {
        self.inner.publish(publication.clone()).await?;
      }
      return Ok(());
    }
    let inner = self.inner.clone();
    tokio::spawn(async move {
      sleep(delay).await;
      for _ in 0..copies {
        // Whoever published has long moved on, so a late failure has nobody to report to.
        let _ = inner.publish(publication.clone()).await;
      }
    });
    Ok(())
  }

  async fn subscribe(&self, filter: &str) -> Result<(), BusError> {
    self.inner.subscribe(filter).await
  }

  async fn unsubscribe(&self, filter: &str) -> Result<(), BusError> {
    self.inner.unsubscribe(filter).await
  }
}

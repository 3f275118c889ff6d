use crate::bus::{Broker, BusError, MessageBus, Publication};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

#[derive(Default)]
struct LocalBusInner {
  broker: Broker,
  mailboxes: HashMap<String, UnboundedSender<Publication>>,
}
impl LocalBusInner {
  fn route(&mut self, publication: Publication) {
    for client in self.broker.publish(&publication) {
      if let Some(mailbox) = self.mailboxes.get(&client) {
        // A closed mailbox means the client task ended without disconnecting. It will be
        // cleaned up by `drop_connection` or `disconnect`.
        let _ = mailbox.send(publication.clone());
      }
    }
  }
}

/// An in-process broker. Cloning shares the same broker.
#[derive(Clone, Default)]
pub struct LocalBus {
  inner: Arc<Mutex<LocalBusInner>>,
}
impl LocalBus {
  pub fn new() -> LocalBus {
    LocalBus::default()
  }

  /// Connects a client. Everything routed to it arrives on the returned receiver.
  pub fn connect(
    &self,
    client_id: &str,
    testament: Option<Publication>,
  ) -> (LocalBusClient, UnboundedReceiver<Publication>) {
    let (tx, rx) = unbounded_channel();
    let mut inner = self.inner.lock();
    inner.broker.connect(client_id, testament);
    inner.mailboxes.insert(client_id.to_string(), tx);
    let client = LocalBusClient {
      id: client_id.to_string(),
      bus: self.clone(),
    };
    (client, rx)
  }

  pub fn retained(&self, topic: &str) -> Option<Publication> {
    self.inner.lock().broker.retained(topic).cloned()
  }

  fn disconnect(&self, client_id: &str, graceful: bool) {
    let mut inner = self.inner.lock();
    inner.mailboxes.remove(client_id);
    if let Some(testament) = inner.broker.disconnect(client_id, graceful) {
      inner.route(testament);
    }
  }
}

/// One connection to a [`LocalBus`].
#[derive(Clone)]
pub struct LocalBusClient {
  id: String,
  bus: LocalBus,
}
impl LocalBusClient {
  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn bus(&self) -> &LocalBus {
    &self.bus
  }

  /// Clean disconnect. The testament is discarded.
  pub fn disconnect(self) {
    self.bus.disconnect(&self.id, true);
  }

  /// Simulates the connection dying. The broker publishes the testament.
  pub fn drop_connection(self) {
    self.bus.disconnect(&self.id, false);
  }
}
#[async_trait]
impl MessageBus for LocalBusClient {
  async fn publish(&self, publication: Publication) -> Result<(), BusError> {
    let mut inner = self.bus.inner.lock();
    if !inner.broker.is_connected(&self.id) {
      return Err(BusError::Disconnected(self.id.clone()));
    }
    inner.route(publication);
    Ok(())
  }

  async fn subscribe(&self, filter: &str) -> Result<(), BusError> {
    let mut inner = self.bus.inner.lock();
    let retained = inner.broker.subscribe(&self.id, filter)?;
    if let Some(mailbox) = inner.mailboxes.get(&self.id) {
      for publication in retained {
        let _ = mailbox.send(publication);
      }
    }
    Ok(())
  }

  async fn unsubscribe(&self, filter: &str) -> Result<(), BusError> {
    self.bus.inner.lock().broker.unsubscribe(&self.id, filter)
  }
}

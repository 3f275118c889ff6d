//! Runs nodes on tokio.
//!
//! Each node gets one task that owns it. The task waits on bus deliveries, local commands and
//! timer fires, hands each to [`CoordNode::handle`] and carries out the effects. Timers are
//! spawned sleeps that post back into the task, so a node never blocks on one.

use crate::bus::{BusError, LocalBus, LocalBusClient, MessageBus, Publication};
use crate::config::NodeConfig;
use crate::core::{DeviceId, Effect, TimerKey};
use crate::lock::{WalError, WriteAheadLog};
use crate::node::{CoordNode, NodeCmd, NodeEvent, NodeSnapshot};
use crate::time_server::TimeServer;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SpawnError {
  #[error(transparent)]
  Wal(#[from] WalError),
  #[error("cannot encode testament: {0}")]
  Encode(#[from] serde_json::Error),
  #[error(transparent)]
  Bus(#[from] BusError),
}

/// Milliseconds since the Unix epoch, advancing with tokio's clock so paused-time tests stay
/// deterministic.
#[derive(Clone, Copy, Debug)]
pub struct RuntimeClock {
  base_ms: u64,
  start: Instant,
}
impl RuntimeClock {
  pub fn new() -> RuntimeClock {
    let base_ms = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_millis() as u64)
      .unwrap_or_default();
    RuntimeClock::starting_at(base_ms)
  }

  pub fn starting_at(base_ms: u64) -> RuntimeClock {
    RuntimeClock {
      base_ms: base_ms,
      start: Instant::now(),
    }
  }

  pub fn now(&self) -> u64 {
    self.base_ms + self.start.elapsed().as_millis() as u64
  }
}
impl Default for RuntimeClock {
  fn default() -> Self {
    RuntimeClock::new()
  }
}

async fn execute<B: MessageBus>(
  id: &DeviceId,
  bus: &B,
  effects: Vec<Effect>,
  timers: &UnboundedSender<(TimerKey, u64)>,
) {
  for effect in effects {
    let result = match effect {
      Effect::Publish(p) => bus.publish(p).await,
      Effect::Subscribe(filter) => bus.subscribe(&filter).await,
      Effect::Unsubscribe(filter) => bus.unsubscribe(&filter).await,
      Effect::ArmTimer {
        key,
        generation,
        after,
      } => {
        let tx = timers.clone();
        tokio::spawn(async move {
          sleep(after).await;
          // The node task may be gone by now.
          let _ = tx.send((key, generation));
        });
        Ok(())
      }
    };
    if let Err(e) = result {
      // Treated like any lost message. Elections recover from it.
      warn!(node = %id, "bus operation failed: {}", e);
    }
  }
}

/// Drives `node` until its command channel closes or the bus stops delivering.
pub async fn run_node<B: MessageBus>(
  mut node: CoordNode,
  bus: B,
  mut inbox: UnboundedReceiver<Publication>,
  mut commands: UnboundedReceiver<NodeCmd>,
  snapshots: watch::Sender<NodeSnapshot>,
  clock: RuntimeClock,
) {
  let id = node.id().clone();
  let (timer_tx, mut timer_rx) = unbounded_channel::<(TimerKey, u64)>();
  let effects = node.handle(NodeEvent::Start, clock.now());
  execute(&id, &bus, effects, &timer_tx).await;
  snapshots.send_replace(node.snapshot());
  loop {
    let event = tokio::select! {
      publication = inbox.recv() => match publication {
        Some(p) => NodeEvent::Deliver(p),
        None => break,
      },
      cmd = commands.recv() => match cmd {
        Some(cmd) => NodeEvent::Command(cmd),
        None => break,
      },
      Some((key, generation)) = timer_rx.recv() => NodeEvent::Timer {
        key: key,
        generation: generation,
      },
    };
    let effects = node.handle(event, clock.now());
    execute(&id, &bus, effects, &timer_tx).await;
    snapshots.send_replace(node.snapshot());
  }
  debug!(node = %id, "node task finished");
}

/// A node running on a [`LocalBus`].
pub struct NodeHandle {
  id: DeviceId,
  commands: UnboundedSender<NodeCmd>,
  snapshots: watch::Receiver<NodeSnapshot>,
  client: LocalBusClient,
  task: JoinHandle<()>,
}
impl NodeHandle {
  pub fn id(&self) -> &DeviceId {
    &self.id
  }

  /// Returns false if the node task has already ended.
  pub fn command(&self, cmd: NodeCmd) -> bool {
    self.commands.send(cmd).is_ok()
  }

  pub fn snapshot(&self) -> NodeSnapshot {
    self.snapshots.borrow().clone()
  }

  pub fn watch(&self) -> watch::Receiver<NodeSnapshot> {
    self.snapshots.clone()
  }

  /// Stops the node and disconnects it cleanly. Its testament is discarded.
  pub async fn shutdown(self) {
    drop(self.commands);
    self.task.abort();
    let _ = self.task.await;
    self.client.disconnect();
  }

  /// Kills the task and drops the connection, as a process crash would. The broker publishes the
  /// node's testament.
  pub async fn crash(self) {
    self.task.abort();
    let _ = self.task.await;
    self.client.drop_connection();
  }
}

/// Connects a node to `bus` with its offline testament and starts its task.
pub fn spawn_node(
  bus: &LocalBus,
  config: NodeConfig,
  wal: Box<dyn WriteAheadLog>,
  clock: RuntimeClock,
) -> Result<NodeHandle, SpawnError> {
  let node = CoordNode::new(config, wal, clock.now());
  let id = node.id().clone();
  let (client, inbox) = bus.connect(id.as_str(), Some(node.testament()?));
  let (cmd_tx, cmd_rx) = unbounded_channel();
  let (snap_tx, snap_rx) = watch::channel(node.snapshot());
  let task = tokio::spawn(run_node(node, client.clone(), inbox, cmd_rx, snap_tx, clock));
  Ok(NodeHandle {
    id: id,
    commands: cmd_tx,
    snapshots: snap_rx,
    client: client,
    task: task,
  })
}

/// Serves time requests on `bus` until the task is aborted.
pub async fn spawn_time_server(
  bus: &LocalBus,
  server: TimeServer,
  clock: RuntimeClock,
) -> Result<JoinHandle<()>, SpawnError> {
  let (client, mut inbox) = bus.connect(TimeServer::CLIENT_ID, None);
  client.subscribe(&server.request_filter()).await?;
  Ok(tokio::spawn(async move {
    while let Some(request) = inbox.recv().await {
      if let Some(response) = server.handle(&request, clock.now()) {
        if let Err(e) = client.publish(response).await {
          warn!("time server cannot publish: {}", e);
          break;
        }
      }
    }
  }))
}

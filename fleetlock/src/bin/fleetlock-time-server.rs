use clap::Parser;
use fleetlock::bus::{LocalBus, MessageBus};
use fleetlock::clock::{ClockSyncAgent, SyncOutcome};
use fleetlock::config::ClockConfig;
use fleetlock::core::{DeviceId, Message, Stamp, TimeRequest, Topics};
use fleetlock::logging::{self, LogLevel};
use fleetlock::runtime::{spawn_time_server, RuntimeClock};
use fleetlock::time_server::TimeServer;
use std::error::Error;
use std::time::Duration;
use tokio::time::interval;
use tracing::{info, warn};

/// Runs a time source on an in-process bus with one drifting client syncing against it.
#[derive(Parser, Debug)]
#[command(name = "fleetlock-time-server", version)]
struct Args {
  /// Topic base the server answers under.
  #[arg(long, default_value_t = Topics::default().base)]
  topics: String,
  /// Added to the server's clock, in milliseconds.
  #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
  skew_ms: i64,
  /// How fast the demo client's clock runs relative to real time.
  #[arg(long, default_value_t = 1.05)]
  drift_rate: f64,
  #[arg(long, default_value_t = 2000)]
  sync_interval_ms: u64,
  /// Number of sync rounds before exiting.
  #[arg(long, default_value_t = 10)]
  rounds: u32,
  #[arg(long, default_value = "info")]
  log_level: LogLevel,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
  let args = Args::parse();
  logging::init(args.log_level);
  let topics = Topics::new(args.topics.clone());
  let bus = LocalBus::new();
  let clock = RuntimeClock::new();
  let server = TimeServer::new(topics.clone()).with_skew(args.skew_ms);
  let server_task = spawn_time_server(&bus, server, clock).await?;
  info!(topic = %topics.time_request(), skew_ms = args.skew_ms, "time server up");

  let id = DeviceId::from("demo-client");
  let (client, mut inbox) = bus.connect(id.as_str(), None);
  client.subscribe(&topics.time_response(&id)).await?;
  let config = ClockConfig {
    drift_rate: args.drift_rate,
    ..ClockConfig::default()
  };
  let mut agent = ClockSyncAgent::new(0, 1, &config, clock.now());
  let mut ticks = interval(Duration::from_millis(args.sync_interval_ms));
  for round in 0..args.rounds {
    ticks.tick().await;
    let t1 = agent.begin_sync(clock.now());
    let request = Message::TimeRequest(TimeRequest {
      device_id: id.clone(),
      t1: Some(t1),
    });
    client.publish(request.publication(&topics, &Stamp::none())?).await?;
    let response = match inbox.recv().await {
      Some(p) => p,
      None => break,
    };
    match Message::decode(&topics, &response.topic, &response.payload) {
      Ok((Message::TimeResponse(_, response), _)) => match agent.on_time_response(&response, clock.now()) {
        SyncOutcome::Applied { offset, rtt } => {
          info!(round, offset, rtt_ms = rtt, "synced")
        }
        outcome => warn!(round, ?outcome, "sync not applied"),
      },
      Ok(_) => {}
      Err(e) => warn!("bad response: {}", e),
    }
  }
  server_task.abort();
  client.disconnect();
  Ok(())
}

use crate::bus::Publication;
use crate::core::{Message, Stamp, TimeResponse, Topics};
use tracing::{debug, warn};

/// The fleet's reference clock. Answers every time request with its own reading.
#[derive(Clone, Debug)]
pub struct TimeServer {
  topics: Topics,
  /// Added to the driver's time. Lets tests give the server a clock that disagrees with the nodes'.
  skew_ms: i64,
}
impl TimeServer {
  pub const CLIENT_ID: &'static str = "time_server_01";

  pub fn new(topics: Topics) -> TimeServer {
    TimeServer {
      topics: topics,
      skew_ms: 0,
    }
  }

  pub fn with_skew(mut self, skew_ms: i64) -> TimeServer {
    self.skew_ms = skew_ms;
    self
  }

  pub fn request_filter(&self) -> String {
    self.topics.time_request()
  }

  pub fn now(&self, wall_ms: u64) -> u64 {
    (wall_ms as i64 + self.skew_ms).max(0) as u64
  }

  /// The response to publish, if `publication` is a well-formed time request.
  pub fn handle(&self, publication: &Publication, wall_ms: u64) -> Option<Publication> {
    let request = match Message::decode(&self.topics, &publication.topic, &publication.payload) {
      Ok((Message::TimeRequest(request), _)) => request,
      Ok(_) => return None,
      Err(e) => {
        warn!("malformed time request: {}", e);
        return None;
      }
    };
    let server_time = self.now(wall_ms);
    debug!(device = %request.device_id, server_time, "answering time request");
    let response = Message::TimeResponse(
      request.device_id,
      TimeResponse {
        server_time: server_time,
        t1: request.t1,
      },
    );
    match response.publication(&self.topics, &Stamp::none()) {
      Ok(p) => Some(p),
      Err(e) => {
        warn!("cannot encode time response: {}", e);
        None
      }
    }
  }
}

#[test]
fn test_answers_on_the_device_topic() {
  use crate::bus::Delivery;
  let topics = Topics::new("fleet");
  let server = TimeServer::new(topics.clone()).with_skew(250);
  let request = Publication::new(
    topics.time_request(),
    br#"{"deviceId":"sensor-003","t1":17}"#.to_vec(),
    Delivery::FireAndForget,
    false,
  );
  let response = server.handle(&request, 1_000).unwrap();
  assert_eq!(response.topic, "fleet/time/response/sensor-003");
  let value: serde_json::Value = serde_json::from_slice(&response.payload).unwrap();
  assert_eq!(value, serde_json::json!({"serverTime": 1_250, "t1": 17}));

  let garbage = Publication::new(topics.time_request(), b"{}".to_vec(), Delivery::FireAndForget, false);
  assert!(server.handle(&garbage, 1_000).is_none());
}

use crate::bus::{BusError, Publication};
use std::collections::{BTreeMap, BTreeSet};

/// MQTT filter matching: `+` matches exactly one level, a trailing `#` matches any remainder
/// (including none).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
  let mut f = filter.split('/');
  let mut t = topic.split('/');
  loop {
    match (f.next(), t.next()) {
      (Some("#"), _) => return true,
      (Some("+"), Some(_)) => {}
      (Some(a), Some(b)) if a == b => {}
      (None, None) => return true,
      _ => return false,
    }
  }
}

fn valid_filter(filter: &str) -> bool {
  let levels = filter.split('/').collect::<Vec<_>>();
  !filter.is_empty()
    && levels.iter().enumerate().all(|(i, level)| match *level {
      "#" => i + 1 == levels.len(),
      "+" => true,
      l => !l.contains('#') && !l.contains('+'),
    })
}

/// Routing state of a broker: who listens to what, the retained message per topic, and each
/// client's testament. Pure data; delivery is up to whoever owns it.
#[derive(Default)]
pub struct Broker {
  subscriptions: BTreeMap<String, BTreeSet<String>>,
  retained: BTreeMap<String, Publication>,
  testaments: BTreeMap<String, Publication>,
}
impl Broker {
  pub fn new() -> Broker {
    Broker::default()
  }

  pub fn connect(&mut self, client: &str, testament: Option<Publication>) {
    self.subscriptions.entry(client.to_string()).or_default();
    match testament {
      Some(t) => {
        self.testaments.insert(client.to_string(), t);
      }
      None => {
        self.testaments.remove(client);
      }
    }
  }

  pub fn is_connected(&self, client: &str) -> bool {
    self.subscriptions.contains_key(client)
  }

  /// Registers the filter and returns the retained messages it matches, which the caller must
  /// deliver to the new subscriber.
  pub fn subscribe(&mut self, client: &str, filter: &str) -> Result<Vec<Publication>, BusError> {
    if !valid_filter(filter) {
      return Err(BusError::InvalidFilter(filter.to_string()));
    }
    let filters = self
      .subscriptions
      .get_mut(client)
      .ok_or_else(|| BusError::Disconnected(client.to_string()))?;
    filters.insert(filter.to_string());
    Ok(
      self
        .retained
        .values()
        .filter(|p| topic_matches(filter, &p.topic))
        .cloned()
        .collect(),
    )
  }

  pub fn unsubscribe(&mut self, client: &str, filter: &str) -> Result<(), BusError> {
    self
      .subscriptions
      .get_mut(client)
      .ok_or_else(|| BusError::Disconnected(client.to_string()))?
      .remove(filter);
    Ok(())
  }

  /// Updates the retained slot and returns every client that should receive the publication,
  /// once each, the publisher included if it subscribed.
  pub fn publish(&mut self, publication: &Publication) -> Vec<String> {
    if publication.retain {
      if publication.payload.is_empty() {
        self.retained.remove(&publication.topic);
      } else {
        self.retained.insert(publication.topic.clone(), publication.clone());
      }
    }
    self
      .subscriptions
      .iter()
      .filter(|(_, filters)| filters.iter().any(|f| topic_matches(f, &publication.topic)))
      .map(|(client, _)| client.clone())
      .collect()
  }

  /// Forgets the client. An ungraceful disconnect hands back its testament for publishing.
  pub fn disconnect(&mut self, client: &str, graceful: bool) -> Option<Publication> {
    self.subscriptions.remove(client);
    let testament = self.testaments.remove(client);
    if graceful {
      None
    } else {
      testament
    }
  }

  pub fn retained(&self, topic: &str) -> Option<&Publication> {
    self.retained.get(topic)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bus::Delivery;

  fn publication(topic: &str, payload: &str, retain: bool) -> Publication {
    Publication::new(
      topic.to_string(),
      payload.as_bytes().to_vec(),
      Delivery::Acknowledged,
      retain,
    )
  }

  #[test]
  fn wildcards() {
    assert!(topic_matches("a/+/status", "a/sensor-001/status"));
    assert!(!topic_matches("a/+/status", "a/x/y/status"));
    assert!(topic_matches("a/#", "a/x/y/status"));
    assert!(topic_matches("a/#", "a"));
    assert!(!topic_matches("a/b", "a/b/c"));
    assert!(!topic_matches("a/b/c", "a/b"));
    assert!(topic_matches("#", "anything/at/all"));
  }

  #[test]
  fn filter_validation() {
    let mut b = Broker::new();
    b.connect("c", None);
    assert!(b.subscribe("c", "a/#/b").is_err());
    assert!(b.subscribe("c", "a/b+").is_err());
    assert!(b.subscribe("c", "").is_err());
    assert!(b.subscribe("c", "a/+/b/#").is_ok());
    assert!(b.subscribe("nobody", "a").is_err());
  }

  #[test]
  fn retained_delivered_on_subscribe_and_cleared_by_empty_payload() {
    let mut b = Broker::new();
    b.connect("late", None);
    b.publish(&publication("fleet/mutex/status", "{}", true));
    b.publish(&publication("fleet/other", "x", false));
    let retained = b.subscribe("late", "fleet/#").unwrap();
    assert_eq!(retained.len(), 1);
    assert_eq!(retained[0].topic, "fleet/mutex/status");
    b.publish(&publication("fleet/mutex/status", "", true));
    assert!(b.retained("fleet/mutex/status").is_none());
  }

  #[test]
  fn each_client_receives_once() {
    let mut b = Broker::new();
    b.connect("a", None);
    b.connect("b", None);
    b.subscribe("a", "fleet/#").unwrap();
    b.subscribe("a", "fleet/+/status").unwrap();
    b.subscribe("b", "fleet/x/status").unwrap();
    let to = b.publish(&publication("fleet/y/status", "{}", false));
    assert_eq!(to, vec!["a".to_string()]);
  }

  #[test]
  fn testament_only_on_ungraceful_disconnect() {
    let mut b = Broker::new();
    let will = publication("fleet/n1/status", "offline", true);
    b.connect("n1", Some(will.clone()));
    b.connect("n2", Some(will.clone()));
    assert_eq!(b.disconnect("n1", true), None);
    assert_eq!(b.disconnect("n2", false), Some(will));
    assert!(!b.is_connected("n2"));
  }
}

use crate::core::{DeviceId, LockStatus};
use crate::lock::{WalEntry, WalOperation};
use std::collections::VecDeque;

/// Who holds the lock and who waits for it. The lock is available exactly when nobody holds it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LockState {
  holder: Option<DeviceId>,
  queue: VecDeque<DeviceId>,
}
impl LockState {
  pub fn new() -> LockState {
    LockState::default()
  }

  /// Rebuilds state by applying every entry in order to an empty lock.
  pub fn replay<'a, I: IntoIterator<Item = &'a WalEntry>>(entries: I) -> LockState {
    let mut state = LockState::new();
    for entry in entries {
      state.apply(entry.operation, &entry.target_id);
    }
    state
  }

  pub fn available(&self) -> bool {
    self.holder.is_none()
  }

  pub fn holder(&self) -> Option<&DeviceId> {
    self.holder.as_ref()
  }

  pub fn queue(&self) -> &VecDeque<DeviceId> {
    &self.queue
  }

  pub fn is_waiting(&self, id: &DeviceId) -> bool {
    self.queue.contains(id)
  }

  pub fn is_holder(&self, id: &DeviceId) -> bool {
    self.holder.as_ref() == Some(id)
  }

  pub fn next_in_line(&self) -> Option<&DeviceId> {
    self.queue.front()
  }

  /// Applies one transition. Every rule is idempotent, so replaying a log that recorded a
  /// redundant entry still lands on the same state.
  pub fn apply(&mut self, operation: WalOperation, target: &DeviceId) {
    match operation {
      WalOperation::Queue => {
        if !self.is_holder(target) && !self.is_waiting(target) {
          self.queue.push_back(target.clone());
        }
      }
      WalOperation::Grant => {
        self.queue.retain(|id| id != target);
        self.holder = Some(target.clone());
      }
      WalOperation::Release => {
        if self.is_holder(target) {
          self.holder = None;
        }
      }
    }
  }

  pub fn status(&self) -> LockStatus {
    LockStatus {
      available: self.available(),
      holder: self.holder.clone(),
      queue: self.queue.iter().cloned().collect(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  fn entry(operation: WalOperation, target: &str) -> WalEntry {
    WalEntry::new(0, operation, target.into())
  }

  #[test]
  fn replay_rules() {
    let log = vec![
      entry(WalOperation::Grant, "a"),
      entry(WalOperation::Queue, "b"),
      entry(WalOperation::Queue, "a"),
      entry(WalOperation::Queue, "b"),
      entry(WalOperation::Queue, "c"),
      entry(WalOperation::Release, "c"),
    ];
    let state = LockState::replay(&log);
    assert_eq!(state.holder(), Some(&"a".into()));
    assert_eq!(state.queue().iter().cloned().collect::<Vec<_>>(), vec![DeviceId::from("b"), DeviceId::from("c")]);

    let mut state = state;
    state.apply(WalOperation::Release, &"a".into());
    state.apply(WalOperation::Grant, &"c".into());
    assert_eq!(
      state.status(),
      LockStatus {
        available: false,
        holder: Some("c".into()),
        queue: vec!["b".into()],
      }
    );
  }

  fn operation() -> impl Strategy<Value = WalOperation> {
    prop_oneof![
      Just(WalOperation::Grant),
      Just(WalOperation::Queue),
      Just(WalOperation::Release),
    ]
  }

  fn log() -> impl Strategy<Value = Vec<WalEntry>> {
    prop::collection::vec(
      (operation(), 0..4u8).prop_map(|(op, n)| entry(op, &format!("sensor-00{}", n))),
      0..40,
    )
  }

  proptest! {
    #[test]
    fn replaying_any_prefix_matches_direct_application(log in log()) {
      let mut direct = LockState::new();
      for (i, e) in log.iter().enumerate() {
        direct.apply(e.operation, &e.target_id);
        prop_assert_eq!(&LockState::replay(&log[..=i]), &direct);
        prop_assert_eq!(direct.available(), direct.holder().is_none());
        if let Some(holder) = direct.holder() {
          prop_assert!(!direct.is_waiting(holder));
        }
        let mut seen = std::collections::HashSet::new();
        prop_assert!(direct.queue().iter().all(|id| seen.insert(id.clone())));
      }
    }
  }
}

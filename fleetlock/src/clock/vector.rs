use itertools::{EitherOrBoth, Itertools};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// How two vector timestamps relate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Causality {
  Before,
  After,
  Equal,
  Concurrent,
}

/// One slot per process. Slots never decrease.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
  slots: Vec<u64>,
}
impl VectorClock {
  pub fn new(len: usize) -> VectorClock {
    VectorClock {
      slots: vec![0; len],
    }
  }

  pub fn from_slots(slots: Vec<u64>) -> VectorClock {
    VectorClock { slots: slots }
  }

  pub fn slots(&self) -> &[u64] {
    &self.slots
  }

  pub fn get(&self, index: usize) -> u64 {
    self.slots.get(index).copied().unwrap_or(0)
  }

  /// Advances this process's own slot, growing the vector if the slot is past the end.
  pub fn increment(&mut self, index: usize) {
    if index >= self.slots.len() {
      self.slots.resize(index + 1, 0);
    }
    self.slots[index] = self.slots[index].saturating_add(1);
  }

  /// Element-wise maximum. The shorter vector is treated as zero-padded.
  pub fn merge(&mut self, other: &[u64]) {
    self.slots = self
      .slots
      .iter()
      .zip_longest(other.iter())
      .map(|pair| match pair {
        EitherOrBoth::Both(a, b) => *a.max(b),
        EitherOrBoth::Left(a) => *a,
        EitherOrBoth::Right(b) => *b,
      })
      .collect();
  }

  pub fn compare(&self, other: &[u64]) -> Causality {
    let mut less = false;
    let mut greater = false;
    for pair in self.slots.iter().zip_longest(other.iter()) {
      let (a, b) = match pair {
        EitherOrBoth::Both(a, b) => (*a, *b),
        EitherOrBoth::Left(a) => (*a, 0),
        EitherOrBoth::Right(b) => (0, *b),
      };
      match a.cmp(&b) {
        Ordering::Less => less = true,
        Ordering::Greater => greater = true,
        Ordering::Equal => {}
      }
    }
    match (less, greater) {
      (false, false) => Causality::Equal,
      (true, false) => Causality::Before,
      (false, true) => Causality::After,
      (true, true) => Causality::Concurrent,
    }
  }

  /// The largest amount by which any slot of `other` exceeds ours.
  pub fn max_jump(&self, other: &[u64]) -> u64 {
    other
      .iter()
      .enumerate()
      .map(|(i, b)| b.saturating_sub(self.get(i)))
      .max()
      .unwrap_or(0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  #[test]
  fn compare_cases() {
    let a = VectorClock::from_slots(vec![1, 2, 0]);
    assert_eq!(a.compare(&[1, 2, 0]), Causality::Equal);
    assert_eq!(a.compare(&[1, 2]), Causality::Equal);
    assert_eq!(a.compare(&[1, 3, 0]), Causality::Before);
    assert_eq!(a.compare(&[0, 2]), Causality::After);
    assert_eq!(a.compare(&[2, 1, 0]), Causality::Concurrent);
    assert_eq!(a.compare(&[1, 2, 0, 1]), Causality::Before);
  }

  #[test]
  fn merge_pads_shorter() {
    let mut a = VectorClock::from_slots(vec![3, 0]);
    a.merge(&[1, 4, 2]);
    assert_eq!(a.slots(), &[3, 4, 2]);
    a.increment(5);
    assert_eq!(a.slots(), &[3, 4, 2, 0, 0, 1]);
  }

  #[test]
  fn max_jump() {
    let a = VectorClock::from_slots(vec![3, 4]);
    assert_eq!(a.max_jump(&[3, 4]), 0);
    assert_eq!(a.max_jump(&[0, 1000, 7]), 996);
  }

  fn slots() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(0u64..50, 0..6)
  }

  proptest! {
    #[test]
    fn merge_is_commutative(a in slots(), b in slots()) {
      let mut ab = VectorClock::from_slots(a.clone());
      ab.merge(&b);
      let mut ba = VectorClock::from_slots(b);
      ba.merge(&a);
      prop_assert_eq!(ab, ba);
    }

    #[test]
    fn merge_is_idempotent(a in slots(), b in slots()) {
      let mut once = VectorClock::from_slots(a);
      once.merge(&b);
      let mut twice = once.clone();
      twice.merge(&b);
      prop_assert_eq!(once, twice);
    }

    #[test]
    fn merge_never_decreases(a in slots(), b in slots()) {
      let before = VectorClock::from_slots(a.clone());
      let mut merged = before.clone();
      merged.merge(&b);
      for (i, v) in a.iter().enumerate() {
        prop_assert!(merged.get(i) >= *v);
      }
      prop_assert!(matches!(before.compare(merged.slots()), Causality::Before | Causality::Equal));
    }
  }
}

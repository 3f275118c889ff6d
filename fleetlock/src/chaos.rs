/// Externally driven kill/revive toggle. While killed a node neither publishes nor processes
/// anything but chaos commands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChaosSwitch {
  killed: bool,
  kills: u32,
}
impl ChaosSwitch {
  pub fn new() -> ChaosSwitch {
    ChaosSwitch::default()
  }

  pub fn is_killed(&self) -> bool {
    self.killed
  }

  /// How many times the node has been killed so far.
  pub fn kills(&self) -> u32 {
    self.kills
  }

  /// Returns whether this changed anything. Killing a dead node is a no-op.
  pub fn kill(&mut self) -> bool {
    if self.killed {
      return false;
    }
    self.killed = true;
    self.kills += 1;
    true
  }

  pub fn revive(&mut self) -> bool {
    let was = self.killed;
    self.killed = false;
    was
  }
}

#[test]
fn test_toggle_is_idempotent() {
  let mut switch = ChaosSwitch::new();
  assert!(!switch.revive());
  assert!(switch.kill());
  assert!(!switch.kill());
  assert!(switch.is_killed());
  assert!(switch.revive());
  assert!(!switch.is_killed());
  assert_eq!(switch.kills(), 1);
}

//! The distributed lock: the coordinator's arbitration, the requester's side, and the write-ahead
//! log that lets a new coordinator pick up where the last one stopped.

mod client;
mod coordinator;
mod frame;
mod state;
mod wal;

#[rustfmt::skip]
pub use {
  client::ClientPhase,
  client::LockClient,
  coordinator::LockCoordinator,
  state::LockState,
  wal::FileWal,
  wal::MemoryWal,
  wal::RecoveryPolicy,
  wal::WalEntry,
  wal::WalError,
  wal::WalOperation,
  wal::WriteAheadLog,
};

use crate::config::LockConfig;

/// Opens the log named by the config, or an empty in-memory one if it names none.
pub fn open_wal(config: &LockConfig) -> Result<Box<dyn WriteAheadLog>, WalError> {
  match &config.wal_path {
    Some(path) => Ok(Box::new(FileWal::open(path, config.recovery)?)),
    None => Ok(Box::new(MemoryWal::new())),
  }
}

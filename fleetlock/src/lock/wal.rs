use crate::core::DeviceId;
use crate::lock::frame::{frame, FrameHeader};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WalOperation {
  Grant,
  Queue,
  Release,
}

/// One lock transition, recorded before it takes effect.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalEntry {
  pub timestamp: u64,
  pub operation: WalOperation,
  pub target_id: DeviceId,
}
impl WalEntry {
  pub fn new(timestamp: u64, operation: WalOperation, target_id: DeviceId) -> WalEntry {
    WalEntry {
      timestamp: timestamp,
      operation: operation,
      target_id: target_id,
    }
  }
}

/// What to do when the final frame of a log is incomplete.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPolicy {
  /// Treat it as a write interrupted by a crash and cut it off.
  TruncateTail,
  /// Refuse the log.
  Strict,
}
impl Default for RecoveryPolicy {
  fn default() -> Self {
    RecoveryPolicy::TruncateTail
  }
}

#[derive(Debug, Error)]
pub enum WalError {
  #[error("write-ahead log I/O failed: {0}")]
  Io(#[from] std::io::Error),
  #[error("write-ahead log corrupt at byte {offset}: {reason}")]
  Corrupt { offset: u64, reason: String },
  #[error("cannot encode write-ahead log record: {0}")]
  Codec(#[from] serde_cbor::Error),
}

/// Durable, append-only record of lock transitions.
pub trait WriteAheadLog: Send {
  /// Returns only once the entry is durable.
  fn append(&mut self, entry: &WalEntry) -> Result<(), WalError>;

  /// Every entry ever appended, oldest first.
  fn replay(&mut self) -> Result<Vec<WalEntry>, WalError>;
}

struct Scan {
  entries: Vec<WalEntry>,
  /// Bytes covered by complete, valid frames.
  valid_len: usize,
}

/// No lock record comes close to this. A longer frame was never written by us.
const MAX_RECORD_LEN: u32 = 64 * 1024;

/// The first offset at or after `from` holding a complete frame whose checksum matches.
fn next_frame(bytes: &[u8], from: usize) -> Option<usize> {
  (from..bytes.len().saturating_sub(FrameHeader::SIZE)).find(|&at| {
    let mut raw = [0u8; FrameHeader::SIZE];
    raw.copy_from_slice(&bytes[at..at + FrameHeader::SIZE]);
    let header = FrameHeader::from(&raw);
    let start = at + FrameHeader::SIZE;
    let end = start + header.len as usize;
    header.len > 0 && header.len <= MAX_RECORD_LEN && end <= bytes.len() && header.matches(&bytes[start..end])
  })
}

fn scan(bytes: &[u8]) -> Result<Scan, WalError> {
  let mut entries = Vec::new();
  let mut offset = 0;
  while offset < bytes.len() {
    let rest = &bytes[offset..];
    if rest.len() < FrameHeader::SIZE {
      break;
    }
    let mut raw = [0u8; FrameHeader::SIZE];
    raw.copy_from_slice(&rest[..FrameHeader::SIZE]);
    let header = FrameHeader::from(&raw);
    let end = FrameHeader::SIZE + header.len as usize;
    if end > rest.len() {
      // Only the last write can be torn. A length that overruns the log while intact frames
      // follow it is a damaged header.
      if header.len > MAX_RECORD_LEN || next_frame(bytes, offset + 1).is_some() {
        return Err(WalError::Corrupt {
          offset: offset as u64,
          reason: format!("frame length {} overruns the log", header.len),
        });
      }
      break;
    }
    let body = &rest[FrameHeader::SIZE..end];
    if !header.matches(body) {
      // A bad checksum on the very last frame is a torn write, anywhere else it is damage.
      if end == rest.len() {
        break;
      }
      return Err(WalError::Corrupt {
        offset: offset as u64,
        reason: "checksum mismatch".to_string(),
      });
    }
    let entry = serde_cbor::from_slice::<WalEntry>(body).map_err(|e| WalError::Corrupt {
      offset: offset as u64,
      reason: format!("undecodable record: {}", e),
    })?;
    entries.push(entry);
    offset += end;
  }
  Ok(Scan {
    entries: entries,
    valid_len: offset,
  })
}

fn check_tail(scan: &Scan, total: usize, policy: RecoveryPolicy) -> Result<(), WalError> {
  if scan.valid_len < total && policy == RecoveryPolicy::Strict {
    return Err(WalError::Corrupt {
      offset: scan.valid_len as u64,
      reason: format!("torn final frame ({} trailing bytes)", total - scan.valid_len),
    });
  }
  Ok(())
}

/// A log kept in memory. Clones share the same log, the way nodes on one host share a file.
#[derive(Clone, Default)]
pub struct MemoryWal {
  bytes: Arc<Mutex<Vec<u8>>>,
  policy: RecoveryPolicy,
}
impl MemoryWal {
  pub fn new() -> MemoryWal {
    MemoryWal::default()
  }

  /// A log starting from raw framed bytes, possibly damaged.
  pub fn from_bytes(bytes: Vec<u8>, policy: RecoveryPolicy) -> MemoryWal {
    MemoryWal {
      bytes: Arc::new(Mutex::new(bytes)),
      policy: policy,
    }
  }

  pub fn bytes(&self) -> Vec<u8> {
    self.bytes.lock().clone()
  }

  /// Decodes the current contents without touching them.
  pub fn entries(&self) -> Result<Vec<WalEntry>, WalError> {
    scan(&self.bytes.lock()).map(|s| s.entries)
  }
}
impl WriteAheadLog for MemoryWal {
  fn append(&mut self, entry: &WalEntry) -> Result<(), WalError> {
    let body = serde_cbor::to_vec(entry)?;
    self.bytes.lock().extend_from_slice(&frame(&body));
    Ok(())
  }

  fn replay(&mut self) -> Result<Vec<WalEntry>, WalError> {
    let mut bytes = self.bytes.lock();
    let scan = scan(&bytes)?;
    check_tail(&scan, bytes.len(), self.policy)?;
    if scan.valid_len < bytes.len() {
      warn!(trailing = bytes.len() - scan.valid_len, "truncating torn tail of in-memory log");
      bytes.truncate(scan.valid_len);
    }
    Ok(scan.entries)
  }
}

/// A log on disk. Every append is synced before it returns.
pub struct FileWal {
  path: PathBuf,
  file: File,
  policy: RecoveryPolicy,
}
impl FileWal {
  /// Opens or creates the log and checks it. A torn tail is dealt with according to `policy`;
  /// damage anywhere else is an error.
  pub fn open<P: AsRef<Path>>(path: P, policy: RecoveryPolicy) -> Result<FileWal, WalError> {
    let path = path.as_ref().to_path_buf();
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)?;
      }
    }
    let file = OpenOptions::new()
      .create(true)
      .read(true)
      .append(true)
      .open(&path)?;
    let mut wal = FileWal {
      path: path,
      file: file,
      policy: policy,
    };
    wal.recover()?;
    Ok(wal)
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn recover(&mut self) -> Result<Vec<WalEntry>, WalError> {
    let mut bytes = Vec::new();
    File::open(&self.path)?.read_to_end(&mut bytes)?;
    let scan = scan(&bytes)?;
    check_tail(&scan, bytes.len(), self.policy)?;
    if scan.valid_len < bytes.len() {
      warn!(
        path = %self.path.display(),
        trailing = bytes.len() - scan.valid_len,
        "truncating torn tail of write-ahead log"
      );
      self.file.set_len(scan.valid_len as u64)?;
      self.file.sync_all()?;
    }
    Ok(scan.entries)
  }
}
impl WriteAheadLog for FileWal {
  fn append(&mut self, entry: &WalEntry) -> Result<(), WalError> {
    let body = serde_cbor::to_vec(entry)?;
    self.file.write_all(&frame(&body))?;
    self.file.sync_data()?;
    Ok(())
  }

  fn replay(&mut self) -> Result<Vec<WalEntry>, WalError> {
    self.recover()
  }
}

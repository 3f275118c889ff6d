use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
  Trace,
  Debug,
  Info,
  Warn,
  Error,
  /// Same as `Error`: the engine never logs anything it would not survive.
  Fatal,
  Off,
}
impl LogLevel {
  pub const MIN: LogLevel = LogLevel::Trace;

  pub fn filter(self) -> LevelFilter {
    match self {
      LogLevel::Trace => LevelFilter::TRACE,
      LogLevel::Debug => LevelFilter::DEBUG,
      LogLevel::Info => LevelFilter::INFO,
      LogLevel::Warn => LevelFilter::WARN,
      LogLevel::Error | LogLevel::Fatal => LevelFilter::ERROR,
      LogLevel::Off => LevelFilter::OFF,
    }
  }
}
impl Default for LogLevel {
  fn default() -> Self {
    LogLevel::Info
  }
}

impl FromStr for LogLevel {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    serde_json::from_value(serde_json::Value::String(s.to_ascii_lowercase()))
      .map_err(|_| format!("unknown log level {:?}", s))
  }
}

/// Installs a global fmt subscriber. `RUST_LOG` wins over `level` when set. Calling it twice is
/// harmless; the second call is ignored.
pub fn init(level: LogLevel) {
  let filter = EnvFilter::builder()
    .with_default_directive(level.filter().into())
    .from_env_lossy();
  let _ = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(false)
    .try_init();
}

#[test]
fn test_level_mapping() {
  assert_eq!(LogLevel::Fatal.filter(), LevelFilter::ERROR);
  assert_eq!(LogLevel::default().filter(), LevelFilter::INFO);
  assert!(LogLevel::MIN < LogLevel::Off);
  let parsed: LogLevel = toml::from_str::<std::collections::HashMap<String, LogLevel>>("l = \"warn\"")
    .unwrap()
    .remove("l")
    .unwrap();
  assert_eq!(parsed, LogLevel::Warn);
  assert_eq!("DEBUG".parse::<LogLevel>(), Ok(LogLevel::Debug));
  assert!("loud".parse::<LogLevel>().is_err());
}

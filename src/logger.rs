use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::Utc;
use log::{LevelFilter, Log, Metadata, Record};

/// Appends one line per record to the client log file.
pub struct Logger {
  file: Mutex<std::fs::File>,
  level: LevelFilter,
}

impl Logger {
  pub fn new(path: &Path, level: LevelFilter) -> anyhow::Result<Self> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Self {
      file: Mutex::new(file),
      level,
    })
  }

  /// Installs the logger behind the `log` macros. Unknown level names fall back to `info`.
  pub fn init(path: &Path, level: &str) -> anyhow::Result<()> {
    let level = LevelFilter::from_str(level).unwrap_or(LevelFilter::Info);
    let logger = Self::new(path, level)?;
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(level);
    Ok(())
  }

  fn format(record: &Record) -> String {
    let ts = Utc::now().to_rfc3339();
    format!("[{ts}] {} {}: {}\n", record.level(), record.target(), record.args())
  }
}

impl Log for Logger {
  fn enabled(&self, metadata: &Metadata) -> bool {
    metadata.level() <= self.level
  }

  fn log(&self, record: &Record) {
    if !self.enabled(record.metadata()) {
      return;
    }
    let line = Self::format(record);
    if let Ok(mut file) = self.file.lock() {
      let _ = file.write_all(line.as_bytes());
    }
  }

  fn flush(&self) {
    if let Ok(mut file) = self.file.lock() {
      let _ = file.flush();
    }
  }
}

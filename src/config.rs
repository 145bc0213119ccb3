use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::ClientResult;

pub const APP_DIR: &str = "metamind";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
  pub backend_url: String,
  pub poll_interval_ms: u64,
  pub log_level: String,
}

impl Default for ClientConfig {
  fn default() -> Self {
    Self {
      backend_url: "http://127.0.0.1:4317".to_string(),
      poll_interval_ms: 1000,
      log_level: "info".to_string(),
    }
  }
}

impl ClientConfig {
  pub fn poll_interval(&self) -> std::time::Duration {
    std::time::Duration::from_millis(self.poll_interval_ms.max(1))
  }

  pub fn apply_env(&mut self) {
    if let Ok(url) = std::env::var("METAMIND_BACKEND_URL") {
      if !url.trim().is_empty() {
        self.backend_url = url.trim().to_string();
      }
    }
  }
}

pub fn data_dir() -> Option<PathBuf> {
  if let Ok(dir) = std::env::var("METAMIND_DATA_DIR") {
    if !dir.trim().is_empty() {
      return Some(PathBuf::from(dir));
    }
  }
  dirs::data_dir().map(|d| d.join(APP_DIR))
}

pub fn load_or_init(path: &Path) -> anyhow::Result<ClientConfig> {
  if path.exists() {
    let data = std::fs::read_to_string(path)?;
    let config: ClientConfig = serde_json::from_str(&data)?;
    Ok(config)
  } else {
    let config = ClientConfig::default();
    save_config(path, &config)?;
    Ok(config)
  }
}

pub fn save_config(path: &Path, config: &ClientConfig) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(config)?;
  std::fs::write(path, json)?;
  Ok(())
}

/// String key-value storage persisted as one JSON object on disk.
pub struct LocalStorage {
  path: Option<PathBuf>,
  items: Mutex<BTreeMap<String, String>>,
}

impl LocalStorage {
  /// Opens the file at `path`. An unreadable or corrupt file starts empty.
  pub fn open(path: &Path) -> Self {
    let items = std::fs::read_to_string(path)
      .ok()
      .and_then(|data| match serde_json::from_str(&data) {
        Ok(items) => Some(items),
        Err(err) => {
          log::warn!("ignoring corrupt local storage {}: {err}", path.display());
          None
        }
      })
      .unwrap_or_default();
    Self {
      path: Some(path.to_path_buf()),
      items: Mutex::new(items),
    }
  }

  pub fn in_memory() -> Self {
    Self {
      path: None,
      items: Mutex::new(BTreeMap::new()),
    }
  }

  pub fn get_item(&self, key: &str) -> Option<String> {
    self.items.lock().ok()?.get(key).cloned()
  }

  pub fn set_item(&self, key: &str, value: String) -> ClientResult<()> {
    let snapshot = {
      let mut items = self.items.lock().unwrap_or_else(|p| p.into_inner());
      items.insert(key.to_string(), value);
      items.clone()
    };
    if let Some(path) = &self.path {
      std::fs::write(path, serde_json::to_string_pretty(&snapshot)?)?;
    }
    Ok(())
  }

  pub fn remove_item(&self, key: &str) -> ClientResult<()> {
    let snapshot = {
      let mut items = self.items.lock().unwrap_or_else(|p| p.into_inner());
      items.remove(key);
      items.clone()
    };
    if let Some(path) = &self.path {
      std::fs::write(path, serde_json::to_string_pretty(&snapshot)?)?;
    }
    Ok(())
  }
}

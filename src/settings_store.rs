use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::LocalStorage;
use crate::error::ClientError;
use crate::models::{Settings, SettingsPatch};

pub const SETTINGS_STORAGE_KEY: &str = "metamind-settings";

#[derive(Serialize, Deserialize)]
struct PersistedState {
  settings: Settings,
}

#[derive(Serialize, Deserialize)]
struct PersistedRecord {
  state: PersistedState,
  version: u32,
}

/// Committed settings, mirrored to local storage on every change.
#[derive(Clone)]
pub struct SettingsStore {
  state: Arc<watch::Sender<Settings>>,
  storage: Arc<LocalStorage>,
}

impl SettingsStore {
  /// Bootstraps from the stored record, falling back to defaults when the
  /// record is missing or has a shape this build cannot read.
  pub fn load(storage: Arc<LocalStorage>) -> Self {
    let settings = storage
      .get_item(SETTINGS_STORAGE_KEY)
      .and_then(|raw| match serde_json::from_str::<PersistedRecord>(&raw) {
        Ok(record) => Some(record.state.settings),
        Err(err) => {
          log::warn!("stored settings unreadable, using defaults: {err}");
          None
        }
      })
      .unwrap_or_default();

    Self {
      state: Arc::new(watch::channel(settings).0),
      storage,
    }
  }

  pub fn settings(&self) -> Settings {
    self.state.borrow().clone()
  }

  pub fn set_settings(&self, patch: SettingsPatch) {
    self.state.send_modify(|s| s.merge(patch));
    self.persist();
  }

  pub fn reset_settings(&self) {
    self.state.send_replace(Settings::default());
    self.persist();
  }

  fn persist(&self) {
    let record = PersistedRecord {
      state: PersistedState {
        settings: self.settings(),
      },
      version: 0,
    };
    let result = serde_json::to_string(&record)
      .map_err(ClientError::from)
      .and_then(|raw| self.storage.set_item(SETTINGS_STORAGE_KEY, raw));
    if let Err(err) = result {
      log::warn!("failed to persist settings: {err}");
    }
  }
}

/// In-memory edit copy held by a settings form. The store stays untouched
/// until the form saves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SettingsDraft {
  committed: Settings,
  draft: Settings,
}

impl SettingsDraft {
  pub fn new(committed: Settings) -> Self {
    Self {
      draft: committed.clone(),
      committed,
    }
  }

  pub fn draft(&self) -> &Settings {
    &self.draft
  }

  pub fn committed(&self) -> &Settings {
    &self.committed
  }

  pub fn edit(&mut self, patch: SettingsPatch) {
    self.draft.merge(patch);
  }

  pub fn has_unsaved_changes(&self) -> bool {
    self.draft != self.committed
  }

  pub fn discard(&mut self) {
    self.draft = self.committed.clone();
  }

  /// Picks up a new committed copy. Edits in progress are kept.
  pub fn rebase(&mut self, committed: Settings) {
    if !self.has_unsaved_changes() {
      self.draft = committed.clone();
    }
    self.committed = committed;
  }
}

use std::sync::Arc;

use tokio::sync::watch;

use crate::models::{SyncProgress, SyncStatus, SyncStatusPatch};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncSource {
  Vault,
  Wiki,
}

impl SyncSource {
  pub fn label(self) -> &'static str {
    match self {
      SyncSource::Vault => "vault sync",
      SyncSource::Wiki => "wiki sync",
    }
  }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncState {
  pub status: SyncStatus,
  /// File or document currently being indexed. Display only, never persisted.
  pub current_item: Option<String>,
}

#[derive(Clone)]
pub struct SyncStore {
  source: SyncSource,
  state: Arc<watch::Sender<SyncState>>,
}

impl SyncStore {
  pub fn new(source: SyncSource) -> Self {
    Self {
      source,
      state: Arc::new(watch::channel(SyncState::default()).0),
    }
  }

  pub fn source(&self) -> SyncSource {
    self.source
  }

  pub fn snapshot(&self) -> SyncState {
    self.state.borrow().clone()
  }

  pub fn status(&self) -> SyncStatus {
    self.state.borrow().status.clone()
  }

  pub fn watch(&self) -> watch::Receiver<SyncState> {
    self.state.subscribe()
  }

  pub fn is_running(&self) -> bool {
    self.state.borrow().status.is_running
  }

  pub fn set_status(&self, patch: SyncStatusPatch) {
    self.state.send_modify(|s| s.status.merge(patch));
  }

  pub fn reset_status(&self) {
    self.state.send_replace(SyncState::default());
  }

  /// Marks a run as started ahead of the first progress event. Returns false
  /// when a run is already in progress; the check and the transition happen
  /// in one update.
  pub fn try_start(&self) -> bool {
    let started = self.state.send_if_modified(|s| {
      if s.status.is_running {
        return false;
      }
      s.status.merge(SyncStatusPatch::started());
      s.current_item = None;
      true
    });
    if started {
      log::info!("{} started", self.source.label());
    }
    started
  }

  /// Merges a progress event. Ignored once the run is terminal, since a late
  /// progress event must not reopen a finished run.
  pub fn apply_progress(&self, progress: SyncProgress) {
    let source = self.source;
    self.state.send_if_modified(|s| {
      if !s.status.is_running {
        log::debug!("{} progress after terminal state ignored", source.label());
        return false;
      }
      let total = progress.total;
      s.status.merge(SyncStatusPatch {
        total_files: Some(total),
        processed_files: Some(progress.processed.min(total)),
        ..SyncStatusPatch::default()
      });
      s.current_item = Some(progress.current_file).filter(|c| !c.is_empty());
      true
    });
  }

  pub fn complete(&self, status: SyncStatus) {
    log::info!(
      "{} finished: {}/{} processed, error={:?}",
      self.source.label(),
      status.processed_files,
      status.total_files,
      status.error
    );
    self.state.send_replace(SyncState {
      status,
      current_item: None,
    });
  }

  pub fn fail(&self, message: impl Into<String>) {
    let message = message.into();
    log::warn!("{} failed: {message}", self.source.label());
    self.state.send_modify(|s| {
      s.status.merge(SyncStatusPatch::failed(message));
      s.current_item = None;
    });
  }

  /// Applies a terminal status obtained outside the event channel (command
  /// result or poll). Only takes effect while this store still shows a run in
  /// progress and the status is a finished run newer than the last known one.
  pub fn reconcile_terminal(&self, status: &SyncStatus) -> bool {
    let current = self.status();
    let newer = match (status.last_sync_at, current.last_sync_at) {
      (Some(polled), Some(known)) => polled > known,
      (Some(_), None) => true,
      (None, _) => false,
    };
    if !current.is_running || status.is_running || !newer {
      return false;
    }
    log::info!("{} completion recovered without event", self.source.label());
    self.complete(status.clone());
    true
  }
}

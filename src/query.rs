use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{ClientError, ClientResult};
use crate::gateway::CommandGateway;
use crate::models::{Artifact, ChatMessage, Settings, SyncStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueryKey {
  Settings,
  ChatHistory,
  SyncStatus,
  Artifacts,
}

impl QueryKey {
  pub const ALL: [QueryKey; 4] = [
    QueryKey::Settings,
    QueryKey::ChatHistory,
    QueryKey::SyncStatus,
    QueryKey::Artifacts,
  ];

  pub const SYNC: [QueryKey; 1] = [QueryKey::SyncStatus];

  pub fn name(self) -> &'static str {
    match self {
      QueryKey::Settings => "settings",
      QueryKey::ChatHistory => "chatHistory",
      QueryKey::SyncStatus => "syncStatus",
      QueryKey::Artifacts => "artifacts",
    }
  }
}

#[derive(Clone, Debug, PartialEq)]
pub enum QueryData {
  Settings(Settings),
  ChatHistory(Vec<ChatMessage>),
  SyncStatus(SyncStatus),
  Artifacts(Vec<Artifact>),
}

struct Slot {
  data: Option<QueryData>,
  stale: bool,
  // Bumped by every invalidation; a fetch that started under an older
  // generation stores its result as already stale.
  generation: u64,
  revision: watch::Sender<u64>,
  fetch_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Slot {
  fn new() -> Self {
    Self {
      data: None,
      stale: true,
      generation: 0,
      revision: watch::channel(0).0,
      fetch_lock: Arc::new(tokio::sync::Mutex::new(())),
    }
  }

  fn fresh(&self) -> Option<QueryData> {
    if self.stale {
      None
    } else {
      self.data.clone()
    }
  }
}

/// Read-through cache over the command gateway with invalidating mutations.
#[derive(Clone)]
pub struct QueryClient {
  gateway: CommandGateway,
  slots: Arc<Mutex<HashMap<QueryKey, Slot>>>,
  poll_interval: Duration,
}

impl QueryClient {
  pub fn new(gateway: CommandGateway, poll_interval: Duration) -> Self {
    let slots = QueryKey::ALL.into_iter().map(|k| (k, Slot::new())).collect();
    Self {
      gateway,
      slots: Arc::new(Mutex::new(slots)),
      poll_interval,
    }
  }

  pub fn gateway(&self) -> &CommandGateway {
    &self.gateway
  }

  fn slots(&self) -> MutexGuard<'_, HashMap<QueryKey, Slot>> {
    self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn with_slot<R>(&self, key: QueryKey, f: impl FnOnce(&mut Slot) -> R) -> R {
    let mut slots = self.slots();
    let slot = slots.entry(key).or_insert_with(Slot::new);
    f(slot)
  }

  /// Cached data regardless of staleness.
  pub fn peek(&self, key: QueryKey) -> Option<QueryData> {
    self.with_slot(key, |slot| slot.data.clone())
  }

  pub fn is_stale(&self, key: QueryKey) -> bool {
    self.with_slot(key, |slot| slot.stale)
  }

  /// Revision counter, bumped each time fetched data lands in the cache.
  pub fn watch(&self, key: QueryKey) -> watch::Receiver<u64> {
    self.with_slot(key, |slot| slot.revision.subscribe())
  }

  /// Serves fresh cached data, otherwise loads from the backend. Concurrent
  /// callers for one key share a single backend request.
  pub async fn fetch(&self, key: QueryKey) -> ClientResult<QueryData> {
    let lock = self.with_slot(key, |slot| slot.fetch_lock.clone());
    if let Some(data) = self.with_slot(key, |slot| slot.fresh()) {
      return Ok(data);
    }

    let _guard = lock.lock().await;
    if let Some(data) = self.with_slot(key, |slot| slot.fresh()) {
      return Ok(data);
    }

    let generation = self.with_slot(key, |slot| slot.generation);
    let data = self.load(key).await?;
    self.with_slot(key, |slot| {
      slot.data = Some(data.clone());
      slot.stale = slot.generation != generation;
      slot.revision.send_modify(|r| *r += 1);
    });
    Ok(data)
  }

  /// Forces a backend round trip for `key` without touching other readers' view
  /// until the result lands.
  pub async fn refetch(&self, key: QueryKey) -> ClientResult<QueryData> {
    self.mark_stale(key);
    self.fetch(key).await
  }

  async fn load(&self, key: QueryKey) -> ClientResult<QueryData> {
    log::debug!("fetching {}", key.name());
    Ok(match key {
      QueryKey::Settings => QueryData::Settings(self.gateway.get_settings().await?),
      QueryKey::ChatHistory => QueryData::ChatHistory(self.gateway.get_chat_history().await?),
      QueryKey::SyncStatus => QueryData::SyncStatus(self.gateway.get_sync_status().await?),
      QueryKey::Artifacts => QueryData::Artifacts(self.gateway.get_artifacts().await?),
    })
  }

  fn mark_stale(&self, key: QueryKey) -> bool {
    self.with_slot(key, |slot| {
      slot.stale = true;
      slot.generation += 1;
      slot.data.is_some()
    })
  }

  /// Marks `key` stale. Keys that have been read before refetch in the
  /// background so watchers see fresh data without asking.
  pub fn invalidate(&self, key: QueryKey) {
    let active = self.mark_stale(key);
    log::debug!("invalidated {}", key.name());
    if !active {
      return;
    }
    let client = self.clone();
    tokio::spawn(async move {
      if let Err(err) = client.fetch(key).await {
        log::warn!("refetch of {} failed: {err}", key.name());
      }
    });
  }

  pub fn invalidate_sync(&self) {
    for key in QueryKey::SYNC {
      self.invalidate(key);
    }
  }

  pub async fn settings(&self) -> ClientResult<Settings> {
    match self.fetch(QueryKey::Settings).await? {
      QueryData::Settings(v) => Ok(v),
      other => Err(mismatch(QueryKey::Settings, &other)),
    }
  }

  pub async fn chat_history(&self) -> ClientResult<Vec<ChatMessage>> {
    match self.fetch(QueryKey::ChatHistory).await? {
      QueryData::ChatHistory(v) => Ok(v),
      other => Err(mismatch(QueryKey::ChatHistory, &other)),
    }
  }

  /// Chat history from a request issued after this call, never an earlier one.
  pub async fn reload_chat_history(&self) -> ClientResult<Vec<ChatMessage>> {
    self.mark_stale(QueryKey::ChatHistory);
    self.chat_history().await
  }

  pub async fn sync_status(&self) -> ClientResult<SyncStatus> {
    match self.fetch(QueryKey::SyncStatus).await? {
      QueryData::SyncStatus(v) => Ok(v),
      other => Err(mismatch(QueryKey::SyncStatus, &other)),
    }
  }

  pub async fn artifacts(&self) -> ClientResult<Vec<Artifact>> {
    match self.fetch(QueryKey::Artifacts).await? {
      QueryData::Artifacts(v) => Ok(v),
      other => Err(mismatch(QueryKey::Artifacts, &other)),
    }
  }

  pub async fn save_settings(&self, settings: &Settings) -> ClientResult<()> {
    self.gateway.save_settings(settings).await?;
    self.invalidate(QueryKey::Settings);
    Ok(())
  }

  pub async fn send_message(&self, query: &str) -> ClientResult<()> {
    self.gateway.send_message(query).await?;
    self.invalidate(QueryKey::ChatHistory);
    Ok(())
  }

  pub async fn clear_chat(&self) -> ClientResult<()> {
    self.gateway.clear_chat().await?;
    self.invalidate(QueryKey::ChatHistory);
    Ok(())
  }

  pub async fn sync_vault(&self, vault_path: &str) -> ClientResult<SyncStatus> {
    let status = self.gateway.sync_vault(vault_path).await?;
    self.invalidate_sync();
    Ok(status)
  }

  pub async fn sync_outline(&self) -> ClientResult<Option<SyncStatus>> {
    let status = self.gateway.sync_outline().await?;
    self.invalidate_sync();
    Ok(status)
  }

  pub async fn delete_artifact(&self, id: &str) -> ClientResult<()> {
    self.gateway.delete_artifact(id).await?;
    self.invalidate(QueryKey::Artifacts);
    Ok(())
  }

  /// Polls the sync status every poll interval. `on_status` sees every
  /// successful poll and returns whether polling should go on; a failed poll
  /// is retried on the next tick.
  pub fn poll_sync_status<F>(&self, on_status: F) -> PollHandle
  where
    F: Fn(&SyncStatus) -> bool + Send + 'static,
  {
    let client = self.clone();
    let interval = self.poll_interval;
    let task = tokio::spawn(async move {
      log::debug!("sync status polling started");
      loop {
        tokio::time::sleep(interval).await;
        match client.refetch(QueryKey::SyncStatus).await {
          Ok(QueryData::SyncStatus(status)) => {
            if !on_status(&status) {
              break;
            }
          }
          Ok(_) => {}
          Err(err) => log::debug!("sync status poll failed: {err}"),
        }
      }
      log::debug!("sync status polling stopped");
    });
    PollHandle { task }
  }
}

fn mismatch(key: QueryKey, data: &QueryData) -> ClientError {
  ClientError::command(key.name(), format!("cache held {data:?}"))
}

/// Running poll loop. Dropping the handle cancels it.
pub struct PollHandle {
  task: JoinHandle<()>,
}

impl PollHandle {
  pub fn is_finished(&self) -> bool {
    self.task.is_finished()
  }
}

impl Drop for PollHandle {
  fn drop(&mut self) {
    self.task.abort();
  }
}

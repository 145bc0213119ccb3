use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::chat_store::ChatStore;
use crate::config::LocalStorage;
use crate::error::{ClientError, ClientResult};
use crate::events::{BackendEvent, EventChannelManager, EventKind, EventSource, SubscriptionScope};
use crate::gateway::{CommandGateway, FolderPicker, Transport};
use crate::models::{Artifact, ChatMessage, SettingsPatch, Settings, StreamChunk};
use crate::query::{PollHandle, QueryClient, QueryData, QueryKey};
use crate::settings_store::{SettingsDraft, SettingsStore};
use crate::sync_store::{SyncSource, SyncStore};

/// Everything the client shares across components. Cloning hands out another
/// handle to the same stores.
#[derive(Clone)]
pub struct AppContext {
  pub queries: QueryClient,
  pub events: EventChannelManager,
  pub chat: ChatStore,
  pub vault: SyncStore,
  pub wiki: SyncStore,
  pub settings: SettingsStore,
  settings_refreshed: Arc<AtomicBool>,
}

impl AppContext {
  pub fn new(
    transport: Arc<dyn Transport>,
    source: Arc<dyn EventSource>,
    picker: Option<Arc<dyn FolderPicker>>,
    storage: Arc<LocalStorage>,
    poll_interval: Duration,
  ) -> Self {
    let mut gateway = CommandGateway::new(transport);
    if let Some(picker) = picker {
      gateway = gateway.with_folder_picker(picker);
    }
    Self {
      queries: QueryClient::new(gateway, poll_interval),
      events: EventChannelManager::new(source),
      chat: ChatStore::new(),
      vault: SyncStore::new(SyncSource::Vault),
      wiki: SyncStore::new(SyncSource::Wiki),
      settings: SettingsStore::load(storage),
      settings_refreshed: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn gateway(&self) -> &CommandGateway {
    self.queries.gateway()
  }

  pub fn sync_store(&self, source: SyncSource) -> &SyncStore {
    match source {
      SyncSource::Vault => &self.vault,
      SyncSource::Wiki => &self.wiki,
    }
  }
}

/// Closes the scope if a mount step fails after some channels attached.
async fn attach_or_release<F>(scope: &SubscriptionScope, attach: F) -> ClientResult<()>
where
  F: std::future::Future<Output = ClientResult<()>>,
{
  if let Err(err) = attach.await {
    scope.close();
    return Err(err);
  }
  Ok(())
}

pub struct ChatSession {
  ctx: AppContext,
  scope: SubscriptionScope,
  history_sync: JoinHandle<()>,
}

impl ChatSession {
  /// Attaches the stream channel, then loads the stored conversation.
  pub async fn mount(ctx: &AppContext) -> ClientResult<Self> {
    let scope = SubscriptionScope::new();
    let chat = ctx.chat.clone();
    let queries = ctx.queries.clone();
    attach_or_release(
      &scope,
      scope.subscribe(&ctx.events, EventKind::StreamChunk, move |event| {
        let chat = chat.clone();
        let queries = queries.clone();
        async move {
          if let BackendEvent::StreamChunk(chunk) = event {
            on_stream_chunk(&chat, &queries, chunk).await;
          }
        }
      }),
    )
    .await?;

    // A stream already in flight reconciles on its own completion.
    match ctx.queries.chat_history().await {
      Ok(history) => {
        ctx.chat.replace_if_idle(history);
      }
      Err(err) => log::warn!("could not load chat history: {err}"),
    }
    Ok(Self {
      ctx: ctx.clone(),
      scope,
      history_sync: spawn_history_sync(ctx.chat.clone(), ctx.queries.clone()),
    })
  }

  pub fn store(&self) -> &ChatStore {
    &self.ctx.chat
  }

  /// Echoes the user's message, marks the session streaming and hands the
  /// query to the backend. The answer arrives through `stream-chunk`.
  pub async fn send(&self, query: &str) -> ClientResult<()> {
    let query = query.trim();
    if query.is_empty() {
      return Ok(());
    }
    if !self.ctx.chat.begin_send(ChatMessage::provisional_user(query)) {
      return Err(ClientError::Busy("chat response"));
    }

    if let Err(err) = self.ctx.queries.send_message(query).await {
      // The echoed message stays; it is what the user typed.
      self.ctx.chat.end_stream();
      return Err(err);
    }
    Ok(())
  }

  pub async fn clear(&self) -> ClientResult<()> {
    self.ctx.queries.clear_chat().await?;
    self.ctx.chat.clear_messages();
    Ok(())
  }

  pub fn unmount(self) {
    self.scope.close();
    self.history_sync.abort();
  }
}

impl Drop for ChatSession {
  fn drop(&mut self) {
    self.scope.close();
    self.history_sync.abort();
  }
}

async fn on_stream_chunk(chat: &ChatStore, queries: &QueryClient, chunk: StreamChunk) {
  if !chunk.done {
    chat.append_streaming_content(&chunk.content);
    return;
  }

  match queries.reload_chat_history().await {
    Ok(history) => {
      log::debug!("stream finished, {} messages reconciled", history.len());
      chat.complete_stream(history);
    }
    Err(err) => {
      log::warn!("stream finished but history reload failed: {err}");
      chat.end_stream();
    }
  }
}

/// Applies chat history the query cache loads after mount, once no response
/// is streaming. The backend may store the answer only after its final chunk,
/// so the refetch that follows a send can land after the stream completed.
fn spawn_history_sync(chat: ChatStore, queries: QueryClient) -> JoinHandle<()> {
  let mut revisions = queries.watch(QueryKey::ChatHistory);
  let mut state = chat.watch();
  tokio::spawn(async move {
    while revisions.changed().await.is_ok() {
      loop {
        let idle = state.wait_for(|s| !s.is_streaming).await.map(|_| ());
        if idle.is_err() {
          return;
        }
        let Some(QueryData::ChatHistory(history)) = queries.peek(QueryKey::ChatHistory) else {
          break;
        };
        if chat.replace_if_idle(history) {
          log::debug!("chat log refreshed from backend history");
          break;
        }
        if !chat.is_streaming() {
          break;
        }
      }
    }
  })
}

/// Progress view and trigger for one sync source.
pub struct SyncPanel {
  ctx: AppContext,
  source: SyncSource,
  scope: SubscriptionScope,
  poller: Arc<Mutex<Option<PollHandle>>>,
}

impl SyncPanel {
  pub async fn mount(ctx: &AppContext, source: SyncSource) -> ClientResult<Self> {
    let (progress, complete, failed) = match source {
      SyncSource::Vault => (EventKind::SyncProgress, EventKind::SyncComplete, EventKind::SyncError),
      SyncSource::Wiki => (
        EventKind::OutlineSyncProgress,
        EventKind::OutlineSyncComplete,
        EventKind::OutlineSyncError,
      ),
    };
    let scope = SubscriptionScope::new();
    let poller: Arc<Mutex<Option<PollHandle>>> = Arc::new(Mutex::new(None));
    let store = ctx.sync_store(source).clone();

    attach_or_release(&scope, async {
      let s = store.clone();
      scope
        .subscribe(&ctx.events, progress, move |event| {
          let s = s.clone();
          async move {
            if let BackendEvent::SyncProgress(p) | BackendEvent::OutlineSyncProgress(p) = event {
              s.apply_progress(p);
            }
          }
        })
        .await?;

      let s = store.clone();
      let queries = ctx.queries.clone();
      let poll = poller.clone();
      scope
        .subscribe(&ctx.events, complete, move |event| {
          let s = s.clone();
          let queries = queries.clone();
          let poll = poll.clone();
          async move {
            if let BackendEvent::SyncComplete(status) | BackendEvent::OutlineSyncComplete(status) = event {
              stop_polling(&poll);
              s.complete(status);
              queries.invalidate(QueryKey::Artifacts);
            }
          }
        })
        .await?;

      let s = store.clone();
      let poll = poller.clone();
      scope
        .subscribe(&ctx.events, failed, move |event| {
          let s = s.clone();
          let poll = poll.clone();
          async move {
            if let BackendEvent::SyncError(e) | BackendEvent::OutlineSyncError(e) = event {
              stop_polling(&poll);
              s.fail(e.error);
            }
          }
        })
        .await
    })
    .await?;

    Ok(Self {
      ctx: ctx.clone(),
      source,
      scope,
      poller,
    })
  }

  pub fn store(&self) -> &SyncStore {
    self.ctx.sync_store(self.source)
  }

  /// Starts a run of this source. Returns once the backend finished or
  /// rejected the run; progress arrives through events meanwhile.
  pub async fn trigger(&self) -> ClientResult<()> {
    let store = self.store().clone();
    if !store.try_start() {
      return Err(ClientError::Busy(self.source.label()));
    }

    let vault_path = match self.source {
      SyncSource::Vault => {
        let path = self.ctx.settings.settings().vault_path;
        if path.trim().is_empty() {
          let err = ClientError::command("sync_vault", "No vault folder configured");
          store.fail(err.user_message());
          return Err(err);
        }
        Some(path)
      }
      SyncSource::Wiki => None,
    };

    let result = match vault_path {
      Some(path) => {
        self.start_polling();
        self.ctx.queries.sync_vault(&path).await.map(Some)
      }
      None => self.ctx.queries.sync_outline().await,
    };

    match result {
      Ok(Some(status)) => {
        if store.reconcile_terminal(&status) {
          stop_polling(&self.poller);
          self.ctx.queries.invalidate(QueryKey::Artifacts);
        }
        Ok(())
      }
      Ok(None) => Ok(()),
      Err(err) => {
        stop_polling(&self.poller);
        store.fail(err.user_message());
        Err(err)
      }
    }
  }

  fn start_polling(&self) {
    let store = self.store().clone();
    let queries = self.ctx.queries.clone();
    // Runs until this source leaves the running state, whichever path ends it.
    let handle = self.ctx.queries.poll_sync_status(move |status| {
      if store.reconcile_terminal(status) {
        queries.invalidate(QueryKey::Artifacts);
      }
      store.is_running()
    });
    if let Ok(mut slot) = self.poller.lock() {
      *slot = Some(handle);
    }
  }

  pub fn is_polling(&self) -> bool {
    self
      .poller
      .lock()
      .map(|slot| slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false))
      .unwrap_or(false)
  }

  pub fn unmount(self) {
    self.scope.close();
    stop_polling(&self.poller);
  }
}

impl Drop for SyncPanel {
  fn drop(&mut self) {
    self.scope.close();
    stop_polling(&self.poller);
  }
}

fn stop_polling(poller: &Mutex<Option<PollHandle>>) {
  if let Ok(mut slot) = poller.lock() {
    if slot.take().is_some() {
      log::debug!("sync status polling cancelled");
    }
  }
}

/// Read-through view of the indexed documents.
pub struct ArtifactList {
  queries: QueryClient,
}

impl ArtifactList {
  pub fn new(ctx: &AppContext) -> Self {
    Self {
      queries: ctx.queries.clone(),
    }
  }

  pub async fn artifacts(&self) -> ClientResult<Vec<Artifact>> {
    self.queries.artifacts().await
  }

  pub async fn delete(&self, id: &str) -> ClientResult<()> {
    self.queries.delete_artifact(id).await.map_err(|err| {
      log::warn!("delete of artifact {id} failed: {err}");
      err
    })
  }
}

/// Draft editing over the committed settings.
pub struct SettingsForm {
  ctx: AppContext,
  draft: SettingsDraft,
}

impl SettingsForm {
  /// The first form mounted in a process pulls the backend's settings, which
  /// win over the locally stored copy.
  pub async fn mount(ctx: &AppContext) -> Self {
    if !ctx.settings_refreshed.swap(true, Ordering::SeqCst) {
      match ctx.queries.settings().await {
        Ok(remote) => ctx.settings.set_settings(remote.into()),
        Err(err) => {
          log::warn!("keeping locally stored settings: {err}");
          ctx.settings_refreshed.store(false, Ordering::SeqCst);
        }
      }
    }
    Self {
      draft: SettingsDraft::new(ctx.settings.settings()),
      ctx: ctx.clone(),
    }
  }

  pub fn draft(&self) -> &Settings {
    self.draft.draft()
  }

  pub fn edit(&mut self, patch: SettingsPatch) {
    self.draft.edit(patch);
  }

  pub fn has_unsaved_changes(&self) -> bool {
    self.draft.has_unsaved_changes()
  }

  pub fn discard(&mut self) {
    self.draft.discard();
  }

  pub async fn choose_vault_folder(&mut self) -> Option<PathBuf> {
    let folder = self.ctx.gateway().select_folder().await?;
    self.draft.edit(SettingsPatch {
      vault_path: Some(folder.display().to_string()),
      ..SettingsPatch::default()
    });
    Some(folder)
  }

  /// Writes the draft to the backend and, only if that succeeds, commits it
  /// locally. A failed save leaves the draft pending.
  pub async fn save(&mut self) -> ClientResult<()> {
    let next = self.draft.draft().clone();
    self.ctx.queries.save_settings(&next).await?;
    self.ctx.settings.set_settings(next.clone().into());
    self.draft.rebase(next);
    log::info!("settings saved");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use async_trait::async_trait;
  use serde_json::json;

  use super::*;
  use crate::chat_store::Origin;
  use crate::models::{Role, SyncStatus};
  use crate::test_support::{settle, FakeBackend};

  fn context(backend: &Arc<FakeBackend>) -> AppContext {
    AppContext::new(
      backend.clone(),
      backend.clone(),
      None,
      Arc::new(LocalStorage::in_memory()),
      Duration::from_millis(10),
    )
  }

  fn chunk(content: &str, done: bool) -> serde_json::Value {
    json!({ "content": content, "done": done })
  }

  struct FixedPicker(PathBuf);

  #[async_trait]
  impl FolderPicker for FixedPicker {
    async fn pick_folder(&self) -> Option<PathBuf> {
      Some(self.0.clone())
    }
  }

  #[tokio::test]
  async fn streamed_answer_is_reconciled_with_backend_history() {
    let backend = FakeBackend::new();
    let ctx = context(&backend);
    let session = ChatSession::mount(&ctx).await.expect("mount");

    let question = "What is in my notes about X?";
    session.send(question).await.expect("send");
    let state = ctx.chat.snapshot();
    assert!(state.is_streaming);
    assert_eq!(state.messages.len(), 1);
    assert_eq!(state.messages[0].message.content, question);
    assert_eq!(state.messages[0].origin, Origin::Provisional);

    for piece in ["Sure, ", "here's ", "what I found."] {
      backend.emit("stream-chunk", chunk(piece, false));
    }
    settle().await;
    assert_eq!(ctx.chat.snapshot().streaming_content, "Sure, here's what I found.");

    let history = json!([
      { "id": 1, "role": "user", "content": question, "timestamp": 1_700_000_000 },
      { "id": 2, "role": "assistant", "content": "Sure, here's what I found.", "timestamp": 1_700_000_001 }
    ]);
    backend.respond("get_chat_history", history.clone());
    backend.emit("stream-chunk", chunk("", true));
    settle().await;

    let state = ctx.chat.snapshot();
    assert!(!state.is_streaming);
    assert_eq!(state.streaming_content, "");
    let expected: Vec<ChatMessage> = serde_json::from_value(history).expect("history");
    let messages: Vec<ChatMessage> = state.messages.iter().map(|e| e.message.clone()).collect();
    assert_eq!(messages, expected);
    assert!(!state.has_provisional());
    assert_eq!(state.messages[1].message.role, Role::Assistant);
  }

  #[tokio::test]
  async fn second_send_while_streaming_is_refused() {
    let backend = FakeBackend::new();
    let ctx = context(&backend);
    let session = ChatSession::mount(&ctx).await.expect("mount");

    session.send("first").await.expect("send");
    let err = session.send("second").await.expect_err("busy");
    assert!(matches!(err, ClientError::Busy(_)));
    assert_eq!(backend.call_count("send_message"), 1);
    assert_eq!(ctx.chat.snapshot().messages.len(), 1);
  }

  #[tokio::test]
  async fn rejected_send_keeps_echo_and_goes_idle() {
    let backend = FakeBackend::new();
    backend.fail("send_message", "backend unreachable");
    let ctx = context(&backend);
    let session = ChatSession::mount(&ctx).await.expect("mount");

    let err = session.send("hello").await.expect_err("send should fail");
    assert_eq!(err.user_message(), "backend unreachable");
    let state = ctx.chat.snapshot();
    assert!(!state.is_streaming);
    assert_eq!(state.messages.len(), 1);
    assert_eq!(state.messages[0].message.content, "hello");
  }

  #[tokio::test]
  async fn clear_only_resets_log_when_backend_agrees() {
    let backend = FakeBackend::new();
    let ctx = context(&backend);
    let session = ChatSession::mount(&ctx).await.expect("mount");
    ctx.chat.add_message(ChatMessage::provisional_user("keep me"));

    backend.fail("clear_chat", "locked");
    assert!(session.clear().await.is_err());
    assert_eq!(ctx.chat.snapshot().messages.len(), 1);

    backend.respond("clear_chat", json!(null));
    session.clear().await.expect("clear");
    assert!(ctx.chat.snapshot().messages.is_empty());
  }

  #[tokio::test]
  async fn mount_loads_stored_conversation() {
    let backend = FakeBackend::new();
    backend.respond(
      "get_chat_history",
      json!([{ "id": 5, "role": "user", "content": "earlier", "timestamp": 1 }]),
    );
    let ctx = context(&backend);
    let _session = ChatSession::mount(&ctx).await.expect("mount");
    let state = ctx.chat.snapshot();
    assert_eq!(state.messages.len(), 1);
    assert_eq!(state.messages[0].origin, Origin::Backend);
  }

  #[tokio::test]
  async fn dropping_session_detaches_stream_channel() {
    let backend = FakeBackend::new();
    let ctx = context(&backend);
    let session = ChatSession::mount(&ctx).await.expect("mount");
    assert_eq!(backend.listener_count("stream-chunk"), 1);

    drop(session);
    settle().await;
    assert_eq!(backend.listener_count("stream-chunk"), 0);
    assert_eq!(backend.emit("stream-chunk", chunk("late", false)), 0);
    assert_eq!(ctx.chat.snapshot().streaming_content, "");
  }

  #[tokio::test]
  async fn unmount_detaches_every_channel() {
    let backend = FakeBackend::new();
    let ctx = context(&backend);
    let session = ChatSession::mount(&ctx).await.expect("mount");
    let panel = SyncPanel::mount(&ctx, SyncSource::Wiki).await.expect("mount");
    assert_eq!(backend.listener_count("outline-sync-progress"), 1);

    session.unmount();
    panel.unmount();
    settle().await;
    for event in ["stream-chunk", "outline-sync-progress", "outline-sync-complete", "outline-sync-error"] {
      assert_eq!(backend.listener_count(event), 0, "{event} still attached");
    }
  }

  #[tokio::test]
  async fn answer_stored_after_final_chunk_still_reaches_the_log() {
    let backend = FakeBackend::new();
    let ctx = context(&backend);
    let session = ChatSession::mount(&ctx).await.expect("mount");

    let question = "What is in my notes about X?";
    let user_row = json!({ "id": 1, "role": "user", "content": question, "timestamp": 1_700_000_000 });
    backend.respond("get_chat_history", json!([user_row.clone()]));
    session.send(question).await.expect("send");
    backend.emit("stream-chunk", chunk("It mentions Y.", false));
    backend.emit("stream-chunk", chunk("", true));
    settle().await;

    // The backend had not stored the answer when the final chunk went out.
    let state = ctx.chat.snapshot();
    assert!(!state.is_streaming);
    assert_eq!(state.messages.len(), 1);

    backend.respond(
      "get_chat_history",
      json!([user_row, { "id": 2, "role": "assistant", "content": "It mentions Y.", "timestamp": 1_700_000_001 }]),
    );
    ctx.queries.invalidate(QueryKey::ChatHistory);
    settle().await;

    let state = ctx.chat.snapshot();
    assert_eq!(state.messages.len(), 2);
    assert_eq!(state.messages[1].message.content, "It mentions Y.");
    assert!(!state.has_provisional());
  }

  #[tokio::test]
  async fn history_refresh_waits_for_running_stream() {
    let backend = FakeBackend::new();
    let ctx = context(&backend);
    let session = ChatSession::mount(&ctx).await.expect("mount");

    session.send("hello").await.expect("send");
    backend.emit("stream-chunk", chunk("Hi", false));
    backend.respond(
      "get_chat_history",
      json!([{ "id": 9, "role": "user", "content": "older", "timestamp": 1 }]),
    );
    ctx.queries.invalidate(QueryKey::ChatHistory);
    settle().await;

    let state = ctx.chat.snapshot();
    assert!(state.is_streaming);
    assert_eq!(state.streaming_content, "Hi");
    assert_eq!(state.messages[0].message.content, "hello");
    assert!(state.has_provisional());
  }

  #[tokio::test]
  async fn failed_reload_after_final_chunk_goes_idle_cleanly() {
    let backend = FakeBackend::new();
    let ctx = context(&backend);
    let session = ChatSession::mount(&ctx).await.expect("mount");

    backend.respond(
      "get_chat_history",
      json!([{ "id": 1, "role": "user", "content": "hello", "timestamp": 1 }]),
    );
    session.send("hello").await.expect("send");
    backend.emit("stream-chunk", chunk("partial answer", false));
    settle().await;
    backend.fail("get_chat_history", "database locked");
    backend.emit("stream-chunk", chunk("", true));
    settle().await;

    let state = ctx.chat.snapshot();
    assert!(!state.is_streaming);
    assert_eq!(state.streaming_content, "");
    assert_eq!(state.messages.len(), 1);
    assert_eq!(state.messages[0].message.content, "hello");
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn concurrent_sends_accept_exactly_one() {
    let backend = FakeBackend::new();
    let ctx = context(&backend);
    let session = Arc::new(ChatSession::mount(&ctx).await.expect("mount"));
    backend.pause_invokes();

    let sends: Vec<_> = (0..8)
      .map(|i| {
        let session = session.clone();
        tokio::spawn(async move { session.send(&format!("question {i}")).await })
      })
      .collect();
    settle().await;
    backend.resume_invokes();

    let mut accepted = 0;
    for send in sends {
      match send.await.expect("join") {
        Ok(()) => accepted += 1,
        Err(err) => assert!(matches!(err, ClientError::Busy(_))),
      }
    }
    assert_eq!(accepted, 1);
    assert_eq!(backend.call_count("send_message"), 1);
    assert_eq!(ctx.chat.snapshot().messages.len(), 1);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn concurrent_triggers_start_one_run() {
    let backend = FakeBackend::new();
    backend.pause_invokes();
    let ctx = context(&backend);
    let panel = Arc::new(SyncPanel::mount(&ctx, SyncSource::Wiki).await.expect("mount"));

    let triggers: Vec<_> = (0..8)
      .map(|_| {
        let panel = panel.clone();
        tokio::spawn(async move { panel.trigger().await })
      })
      .collect();
    settle().await;
    backend.resume_invokes();

    let mut busy = 0;
    for trigger in triggers {
      if let Err(err) = trigger.await.expect("join") {
        assert!(matches!(err, ClientError::Busy(_)));
        busy += 1;
      }
    }
    assert_eq!(busy, 7);
    assert_eq!(backend.call_count("sync_outline"), 1);
  }

  #[tokio::test]
  async fn stale_idle_poll_keeps_polling_until_run_ends() {
    let backend = FakeBackend::new();
    let ctx = context(&backend);
    ctx.settings.set_settings(SettingsPatch {
      vault_path: Some("/notes".to_string()),
      ..SettingsPatch::default()
    });
    let previous = SyncStatus {
      last_sync_at: Some(1_700_000_000),
      ..SyncStatus::default()
    };
    ctx.vault.complete(previous.clone());
    backend.respond("get_sync_status", json!(previous));
    let panel = SyncPanel::mount(&ctx, SyncSource::Vault).await.expect("mount");

    // Neither the command result nor the polls describe a newer run yet.
    panel.trigger().await.expect("trigger");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(backend.call_count("get_sync_status") >= 2);
    assert!(ctx.vault.is_running());
    assert!(panel.is_polling());

    let done = SyncStatus {
      last_sync_at: Some(1_700_000_600),
      total_files: 2,
      processed_files: 2,
      ..SyncStatus::default()
    };
    backend.respond("get_sync_status", json!(done));
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(ctx.vault.status(), done);
    assert!(!panel.is_polling());
  }

  #[tokio::test]
  async fn vault_sync_runs_through_progress_to_completion() {
    let backend = FakeBackend::new();
    backend.pause_invokes();
    backend.respond("get_artifacts", json!([]));
    let ctx = context(&backend);
    ctx.settings.set_settings(SettingsPatch {
      vault_path: Some("/notes".to_string()),
      ..SettingsPatch::default()
    });
    let panel = Arc::new(SyncPanel::mount(&ctx, SyncSource::Vault).await.expect("mount"));
    backend.resume_invokes();
    ArtifactList::new(&ctx).artifacts().await.expect("artifacts");
    backend.pause_invokes();

    let run = tokio::spawn({
      let panel = panel.clone();
      async move { panel.trigger().await }
    });
    settle().await;
    let status = ctx.vault.status();
    assert!(status.is_running);
    assert_eq!(status.error, None);

    backend.emit("sync-progress", json!({ "processed": 5, "total": 20, "currentFile": "a.md" }));
    settle().await;
    assert_eq!(ctx.vault.status().processed_files, 5);
    backend.emit("sync-progress", json!({ "processed": 20, "total": 20, "currentFile": "b.md" }));
    settle().await;
    assert_eq!(ctx.vault.status().processed_files, 20);

    let done = SyncStatus {
      is_running: false,
      total_files: 20,
      processed_files: 20,
      last_sync_at: Some(1_700_000_000),
      error: None,
    };
    backend.respond("sync_vault", json!(done));
    backend.emit("sync-complete", json!(done));
    backend.resume_invokes();
    run.await.expect("join").expect("sync");
    settle().await;

    assert_eq!(ctx.vault.status(), done);
    assert!(!panel.is_polling());
    assert!(backend.call_count("get_artifacts") >= 2);
    let args = backend
      .calls()
      .into_iter()
      .find(|c| c.0 == "sync_vault")
      .map(|c| c.1);
    assert_eq!(args, Some(json!({ "vaultPath": "/notes" })));
  }

  #[tokio::test]
  async fn sync_error_event_overwrites_running_state() {
    let backend = FakeBackend::new();
    backend.pause_invokes();
    let ctx = context(&backend);
    let panel = Arc::new(SyncPanel::mount(&ctx, SyncSource::Wiki).await.expect("mount"));

    let run = tokio::spawn({
      let panel = panel.clone();
      async move { panel.trigger().await }
    });
    settle().await;
    assert!(ctx.wiki.is_running());

    backend.emit("outline-sync-error", json!({ "error": "invalid API key" }));
    settle().await;
    let status = ctx.wiki.status();
    assert!(!status.is_running);
    assert_eq!(status.error.as_deref(), Some("invalid API key"));

    backend.respond("sync_outline", json!(null));
    backend.resume_invokes();
    run.await.expect("join").expect("trigger resolves");
    assert_eq!(ctx.wiki.status().error.as_deref(), Some("invalid API key"));
  }

  #[tokio::test]
  async fn rejected_trigger_marks_source_failed() {
    let backend = FakeBackend::new();
    backend.fail("sync_outline", "Missing API key");
    let ctx = context(&backend);
    let panel = SyncPanel::mount(&ctx, SyncSource::Wiki).await.expect("mount");

    let err = panel.trigger().await.expect_err("trigger should fail");
    assert_eq!(err.user_message(), "Missing API key");
    let status = ctx.wiki.status();
    assert!(!status.is_running);
    assert_eq!(status.error.as_deref(), Some("Missing API key"));
    assert!(!ctx.vault.is_running());
  }

  #[tokio::test]
  async fn vault_trigger_without_folder_skips_backend() {
    let backend = FakeBackend::new();
    let ctx = context(&backend);
    let panel = SyncPanel::mount(&ctx, SyncSource::Vault).await.expect("mount");

    assert!(panel.trigger().await.is_err());
    assert_eq!(backend.call_count("sync_vault"), 0);
    assert!(ctx.vault.status().error.is_some());
  }

  #[tokio::test]
  async fn same_source_trigger_while_running_is_refused() {
    let backend = FakeBackend::new();
    backend.pause_invokes();
    let ctx = context(&backend);
    let panel = Arc::new(SyncPanel::mount(&ctx, SyncSource::Wiki).await.expect("mount"));

    let first = tokio::spawn({
      let panel = panel.clone();
      async move { panel.trigger().await }
    });
    settle().await;
    let err = panel.trigger().await.expect_err("busy");
    assert!(matches!(err, ClientError::Busy(_)));
    assert_eq!(backend.call_count("sync_outline"), 1);

    backend.resume_invokes();
    first.await.expect("join").expect("first run");
  }

  #[tokio::test]
  async fn missed_completion_is_recovered_by_polling() {
    let backend = FakeBackend::new();
    backend.pause_invokes();
    let ctx = context(&backend);
    ctx.settings.set_settings(SettingsPatch {
      vault_path: Some("/notes".to_string()),
      ..SettingsPatch::default()
    });
    let panel = Arc::new(SyncPanel::mount(&ctx, SyncSource::Vault).await.expect("mount"));

    let run = tokio::spawn({
      let panel = panel.clone();
      async move { panel.trigger().await }
    });
    settle().await;
    assert!(panel.is_polling());

    // The backend finished but its sync-complete event never arrived.
    let done = SyncStatus {
      last_sync_at: Some(1_700_000_500),
      total_files: 3,
      processed_files: 3,
      ..SyncStatus::default()
    };
    backend.respond("get_sync_status", json!(done));
    backend.resume_invokes();
    tokio::time::sleep(Duration::from_millis(40)).await;

    assert_eq!(ctx.vault.status(), done);
    run.abort();
  }

  #[tokio::test]
  async fn settings_save_commits_only_after_backend_accepts() {
    let backend = FakeBackend::new();
    let ctx = context(&backend);
    let mut form = SettingsForm::mount(&ctx).await;

    form.edit(SettingsPatch {
      ollama_model: Some("mistral".to_string()),
      ..SettingsPatch::default()
    });
    assert!(form.has_unsaved_changes());

    backend.fail("save_settings", "disk full");
    assert!(form.save().await.is_err());
    assert!(form.has_unsaved_changes());
    assert_eq!(ctx.settings.settings().ollama_model, "llama3.2");

    backend.respond("save_settings", json!(null));
    form.save().await.expect("save");
    assert!(!form.has_unsaved_changes());
    assert_eq!(ctx.settings.settings().ollama_model, "mistral");
  }

  #[tokio::test]
  async fn backend_settings_win_on_first_mount_only() {
    let backend = FakeBackend::new();
    let mut remote = Settings::default();
    remote.vault_path = "/remote".to_string();
    backend.respond("get_settings", json!(remote));
    let ctx = context(&backend);
    ctx.settings.set_settings(SettingsPatch {
      vault_path: Some("/local".to_string()),
      ..SettingsPatch::default()
    });

    let form = SettingsForm::mount(&ctx).await;
    assert_eq!(form.draft().vault_path, "/remote");
    assert_eq!(ctx.settings.settings().vault_path, "/remote");

    let _again = SettingsForm::mount(&ctx).await;
    assert_eq!(backend.call_count("get_settings"), 1);
  }

  #[tokio::test]
  async fn folder_choice_lands_in_draft() {
    let backend = FakeBackend::new();
    let ctx = AppContext::new(
      backend.clone(),
      backend.clone(),
      Some(Arc::new(FixedPicker(PathBuf::from("/picked")))),
      Arc::new(LocalStorage::in_memory()),
      Duration::from_millis(10),
    );
    let mut form = SettingsForm::mount(&ctx).await;

    let folder = form.choose_vault_folder().await;
    assert_eq!(folder, Some(PathBuf::from("/picked")));
    assert_eq!(form.draft().vault_path, "/picked");
    assert!(form.has_unsaved_changes());
    assert_eq!(ctx.settings.settings().vault_path, "");
  }

  #[tokio::test]
  async fn failed_artifact_delete_leaves_list_alone() {
    let backend = FakeBackend::new();
    backend.respond(
      "get_artifacts",
      json!([{ "id": "a1", "path": "/notes/a.md", "last_modified": 1, "content_hash": "h", "indexed_at": 2 }]),
    );
    backend.fail("delete_artifact", "not permitted");
    let ctx = context(&backend);
    let list = ArtifactList::new(&ctx);
    list.artifacts().await.expect("list");

    assert!(list.delete("a1").await.is_err());
    settle().await;
    let artifacts = list.artifacts().await.expect("list");
    assert_eq!(artifacts[0].id, "a1");
    assert_eq!(backend.call_count("get_artifacts"), 1);
  }
}

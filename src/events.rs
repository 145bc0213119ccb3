use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{ClientError, ClientResult};
use crate::models::{StreamChunk, SyncError, SyncProgress, SyncStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
  StreamChunk,
  SyncProgress,
  SyncComplete,
  SyncError,
  OutlineSyncProgress,
  OutlineSyncComplete,
  OutlineSyncError,
}

impl EventKind {
  pub const ALL: [EventKind; 7] = [
    EventKind::StreamChunk,
    EventKind::SyncProgress,
    EventKind::SyncComplete,
    EventKind::SyncError,
    EventKind::OutlineSyncProgress,
    EventKind::OutlineSyncComplete,
    EventKind::OutlineSyncError,
  ];

  pub fn name(self) -> &'static str {
    match self {
      EventKind::StreamChunk => "stream-chunk",
      EventKind::SyncProgress => "sync-progress",
      EventKind::SyncComplete => "sync-complete",
      EventKind::SyncError => "sync-error",
      EventKind::OutlineSyncProgress => "outline-sync-progress",
      EventKind::OutlineSyncComplete => "outline-sync-complete",
      EventKind::OutlineSyncError => "outline-sync-error",
    }
  }

  pub fn from_name(name: &str) -> Option<Self> {
    Self::ALL.into_iter().find(|k| k.name() == name)
  }
}

#[derive(Clone, Debug, PartialEq)]
pub enum BackendEvent {
  StreamChunk(StreamChunk),
  SyncProgress(SyncProgress),
  SyncComplete(SyncStatus),
  SyncError(SyncError),
  OutlineSyncProgress(SyncProgress),
  OutlineSyncComplete(SyncStatus),
  OutlineSyncError(SyncError),
}

impl BackendEvent {
  pub fn decode(kind: EventKind, payload: Value) -> ClientResult<Self> {
    Ok(match kind {
      EventKind::StreamChunk => Self::StreamChunk(serde_json::from_value(payload)?),
      EventKind::SyncProgress => Self::SyncProgress(serde_json::from_value(payload)?),
      EventKind::SyncComplete => Self::SyncComplete(serde_json::from_value(payload)?),
      EventKind::SyncError => Self::SyncError(serde_json::from_value(payload)?),
      EventKind::OutlineSyncProgress => Self::OutlineSyncProgress(serde_json::from_value(payload)?),
      EventKind::OutlineSyncComplete => Self::OutlineSyncComplete(serde_json::from_value(payload)?),
      EventKind::OutlineSyncError => Self::OutlineSyncError(serde_json::from_value(payload)?),
    })
  }
}

/// Backend-pushed event channel. Payloads for one event name arrive on the
/// receiver in emission order; dropping the receiver detaches the listener.
#[async_trait]
pub trait EventSource: Send + Sync {
  async fn listen(&self, event: &str) -> ClientResult<mpsc::UnboundedReceiver<Value>>;
}

#[derive(Clone)]
pub struct EventChannelManager {
  source: Arc<dyn EventSource>,
}

impl EventChannelManager {
  pub fn new(source: Arc<dyn EventSource>) -> Self {
    Self { source }
  }

  /// Resolves once the listener is attached. The handler runs on a dedicated
  /// task and is awaited per event, so one kind is never handled out of order.
  pub async fn subscribe<F, Fut>(&self, kind: EventKind, handler: F) -> ClientResult<Subscription>
  where
    F: Fn(BackendEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let mut rx = self.source.listen(kind.name()).await?;
    log::debug!("attached {}", kind.name());

    let task = tokio::spawn(async move {
      while let Some(payload) = rx.recv().await {
        match BackendEvent::decode(kind, payload) {
          Ok(event) => handler(event).await,
          Err(err) => log::warn!("dropping malformed {} event: {err}", kind.name()),
        }
      }
      log::debug!("{} channel closed by backend", kind.name());
    });

    Ok(Subscription {
      kind,
      task: Some(task),
    })
  }
}

/// Detaches on `unsubscribe` or drop, whichever comes first.
pub struct Subscription {
  kind: EventKind,
  task: Option<JoinHandle<()>>,
}

impl Subscription {
  pub fn kind(&self) -> EventKind {
    self.kind
  }

  pub fn unsubscribe(mut self) {
    self.detach();
  }

  fn detach(&mut self) {
    if let Some(task) = self.task.take() {
      task.abort();
      log::debug!("detached {}", self.kind.name());
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.detach();
  }
}

#[derive(Default)]
struct ScopeState {
  closed: bool,
  subscriptions: Vec<Subscription>,
}

/// The subscriptions owned by one mounted component.
///
/// `close` detaches everything attached so far. A subscribe that is still
/// attaching when the scope closes is detached as soon as it resolves and
/// reports [`ClientError::ScopeClosed`].
#[derive(Clone, Default)]
pub struct SubscriptionScope {
  inner: Arc<Mutex<ScopeState>>,
}

impl SubscriptionScope {
  pub fn new() -> Self {
    Self::default()
  }

  fn state(&self) -> MutexGuard<'_, ScopeState> {
    self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub async fn subscribe<F, Fut>(
    &self,
    manager: &EventChannelManager,
    kind: EventKind,
    handler: F,
  ) -> ClientResult<()>
  where
    F: Fn(BackendEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    if self.is_closed() {
      return Err(ClientError::ScopeClosed(kind.name().to_string()));
    }

    let subscription = manager.subscribe(kind, handler).await?;

    let mut state = self.state();
    if state.closed {
      drop(state);
      subscription.unsubscribe();
      log::debug!("{} attached after teardown, released", kind.name());
      return Err(ClientError::ScopeClosed(kind.name().to_string()));
    }
    if state.subscriptions.iter().any(|s| s.kind() == kind) {
      log::warn!("{} subscribed twice in one scope", kind.name());
    }
    state.subscriptions.push(subscription);
    Ok(())
  }

  pub fn close(&self) {
    let subscriptions = {
      let mut state = self.state();
      state.closed = true;
      std::mem::take(&mut state.subscriptions)
    };
    for subscription in subscriptions {
      subscription.unsubscribe();
    }
  }

  pub fn is_closed(&self) -> bool {
    self.state().closed
  }

  pub fn active_kinds(&self) -> Vec<EventKind> {
    self.state().subscriptions.iter().map(|s| s.kind()).collect()
  }
}

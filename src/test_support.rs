use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};

use crate::error::{ClientError, ClientResult};
use crate::events::EventSource;
use crate::gateway::Transport;
use crate::models::{Settings, SyncStatus};

/// Scripted in-process backend: canned command results plus manual event emission.
pub struct FakeBackend {
  responses: Mutex<HashMap<String, Result<Value, String>>>,
  calls: Mutex<Vec<(String, Value)>>,
  listeners: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Value>>>>,
  listens_paused: watch::Sender<bool>,
  invokes_paused: watch::Sender<bool>,
}

impl FakeBackend {
  pub fn new() -> Arc<Self> {
    let mut responses = HashMap::new();
    responses.insert("get_settings".to_string(), Ok(json!(Settings::default())));
    responses.insert("get_chat_history".to_string(), Ok(json!([])));
    responses.insert("get_sync_status".to_string(), Ok(json!(SyncStatus::default())));
    responses.insert("get_artifacts".to_string(), Ok(json!([])));
    responses.insert("sync_vault".to_string(), Ok(json!(SyncStatus::default())));
    responses.insert("sync_outline".to_string(), Ok(json!(SyncStatus::default())));

    Arc::new(Self {
      responses: Mutex::new(responses),
      calls: Mutex::new(Vec::new()),
      listeners: Mutex::new(HashMap::new()),
      listens_paused: watch::channel(false).0,
      invokes_paused: watch::channel(false).0,
    })
  }

  pub fn respond(&self, command: &str, value: Value) {
    self.responses.lock().unwrap().insert(command.to_string(), Ok(value));
  }

  pub fn fail(&self, command: &str, message: &str) {
    self
      .responses
      .lock()
      .unwrap()
      .insert(command.to_string(), Err(message.to_string()));
  }

  pub fn calls(&self) -> Vec<(String, Value)> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self, command: &str) -> usize {
    self.calls.lock().unwrap().iter().filter(|c| c.0 == command).count()
  }

  /// Delivers to every live listener of `event`; returns how many received it.
  pub fn emit(&self, event: &str, payload: Value) -> usize {
    let mut listeners = self.listeners.lock().unwrap();
    let Some(senders) = listeners.get_mut(event) else {
      return 0;
    };
    senders.retain(|tx| tx.send(payload.clone()).is_ok());
    senders.len()
  }

  pub fn listener_count(&self, event: &str) -> usize {
    self
      .listeners
      .lock()
      .unwrap()
      .get(event)
      .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
      .unwrap_or(0)
  }

  pub fn pause_listens(&self) {
    self.listens_paused.send_replace(true);
  }

  pub fn resume_listens(&self) {
    self.listens_paused.send_replace(false);
  }

  pub fn pause_invokes(&self) {
    self.invokes_paused.send_replace(true);
  }

  pub fn resume_invokes(&self) {
    self.invokes_paused.send_replace(false);
  }
}

#[async_trait]
impl Transport for FakeBackend {
  async fn invoke(&self, command: &str, args: Value) -> ClientResult<Value> {
    self.calls.lock().unwrap().push((command.to_string(), args));
    let mut paused = self.invokes_paused.subscribe();
    let _ = paused.wait_for(|p| !*p).await;

    let response = self.responses.lock().unwrap().get(command).cloned();
    match response {
      Some(Ok(value)) => Ok(value),
      Some(Err(message)) => Err(ClientError::command(command, message)),
      None => Ok(Value::Null),
    }
  }
}

#[async_trait]
impl EventSource for FakeBackend {
  async fn listen(&self, event: &str) -> ClientResult<mpsc::UnboundedReceiver<Value>> {
    let mut paused = self.listens_paused.subscribe();
    let _ = paused.wait_for(|p| !*p).await;

    let (tx, rx) = mpsc::unbounded_channel();
    self
      .listeners
      .lock()
      .unwrap()
      .entry(event.to_string())
      .or_default()
      .push(tx);
    Ok(rx)
  }
}

/// Lets spawned handler and detach work run before asserting.
pub async fn settle() {
  tokio::time::sleep(Duration::from_millis(20)).await;
}

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::error::{ClientError, ClientResult};
use crate::models::{Artifact, ChatMessage, Settings, SyncStatus};

/// Request/response channel to the backend process. A rejected command comes
/// back as [`ClientError::Command`].
#[async_trait]
pub trait Transport: Send + Sync {
  async fn invoke(&self, command: &str, args: Value) -> ClientResult<Value>;
}

/// Host-level directory chooser. `None` means the user cancelled.
#[async_trait]
pub trait FolderPicker: Send + Sync {
  async fn pick_folder(&self) -> Option<PathBuf>;
}

#[derive(Clone)]
pub struct CommandGateway {
  transport: Arc<dyn Transport>,
  picker: Option<Arc<dyn FolderPicker>>,
}

impl CommandGateway {
  pub fn new(transport: Arc<dyn Transport>) -> Self {
    Self {
      transport,
      picker: None,
    }
  }

  pub fn with_folder_picker(mut self, picker: Arc<dyn FolderPicker>) -> Self {
    self.picker = Some(picker);
    self
  }

  async fn call<T: DeserializeOwned>(&self, command: &str, args: Value) -> ClientResult<T> {
    let value = match self.transport.invoke(command, args).await {
      Ok(v) => v,
      Err(err) => {
        log::warn!("command {command} failed: {err}");
        return Err(err);
      }
    };
    serde_json::from_value(value).map_err(|err| {
      log::warn!("command {command} returned an unexpected shape: {err}");
      ClientError::Decode(err)
    })
  }

  pub async fn get_settings(&self) -> ClientResult<Settings> {
    self.call("get_settings", json!({})).await
  }

  pub async fn save_settings(&self, settings: &Settings) -> ClientResult<()> {
    self.call("save_settings", json!({ "settings": settings })).await
  }

  /// Resolves once the backend accepted the query; the answer arrives as `stream-chunk` events.
  pub async fn send_message(&self, query: &str) -> ClientResult<()> {
    self.call("send_message", json!({ "query": query })).await
  }

  pub async fn get_chat_history(&self) -> ClientResult<Vec<ChatMessage>> {
    self.call("get_chat_history", json!({})).await
  }

  pub async fn clear_chat(&self) -> ClientResult<()> {
    self.call("clear_chat", json!({})).await
  }

  pub async fn sync_vault(&self, vault_path: &str) -> ClientResult<SyncStatus> {
    self.call("sync_vault", json!({ "vaultPath": vault_path })).await
  }

  pub async fn get_sync_status(&self) -> ClientResult<SyncStatus> {
    self.call("get_sync_status", json!({})).await
  }

  pub async fn get_artifacts(&self) -> ClientResult<Vec<Artifact>> {
    self.call("get_artifacts", json!({})).await
  }

  pub async fn delete_artifact(&self, id: &str) -> ClientResult<()> {
    self.call("delete_artifact", json!({ "id": id })).await
  }

  /// The wiki sync result is not a fixed contract; a terminal status is
  /// returned when the backend sends one.
  pub async fn sync_outline(&self) -> ClientResult<Option<SyncStatus>> {
    let value: Value = self.call("sync_outline", json!({})).await?;
    Ok(serde_json::from_value(value).ok())
  }

  pub async fn select_folder(&self) -> Option<PathBuf> {
    match &self.picker {
      Some(picker) => picker.pick_folder().await,
      None => {
        log::debug!("no folder picker installed");
        None
      }
    }
  }
}

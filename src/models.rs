use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  User,
  Assistant,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SourceCitation {
  pub path: String,
  pub title: String,
  pub chunk: String,
  pub similarity: f32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
  pub id: i64,
  pub role: Role,
  pub content: String,
  pub timestamp: i64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sources: Option<Vec<SourceCitation>>,
}

impl ChatMessage {
  /// A user message that has not been confirmed by the backend yet. The id is
  /// taken from the wall clock so it never collides with the previous provisional one.
  pub fn provisional_user(content: &str) -> Self {
    let now = chrono::Utc::now();
    Self {
      id: now.timestamp_millis(),
      role: Role::User,
      content: content.to_string(),
      timestamp: now.timestamp(),
      sources: None,
    }
  }
}

// Field names follow the backend's database rows.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Artifact {
  pub id: String,
  pub path: String,
  pub last_modified: i64,
  pub content_hash: String,
  pub indexed_at: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
  pub vault_path: String,
  pub ollama_endpoint: String,
  pub ollama_model: String,
  pub embedding_model: String,
  #[serde(default)]
  pub outline_api_key: String,
  #[serde(default)]
  pub outline_base_url: String,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      vault_path: String::new(),
      ollama_endpoint: "http://localhost:11434".to_string(),
      ollama_model: "llama3.2".to_string(),
      embedding_model: "nomic-embed-text".to_string(),
      outline_api_key: String::new(),
      outline_base_url: String::new(),
    }
  }
}

/// Partial settings update. `None` leaves the field untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SettingsPatch {
  pub vault_path: Option<String>,
  pub ollama_endpoint: Option<String>,
  pub ollama_model: Option<String>,
  pub embedding_model: Option<String>,
  pub outline_api_key: Option<String>,
  pub outline_base_url: Option<String>,
}

impl Settings {
  pub fn merge(&mut self, patch: SettingsPatch) {
    if let Some(v) = patch.vault_path {
      self.vault_path = v;
    }
    if let Some(v) = patch.ollama_endpoint {
      self.ollama_endpoint = v;
    }
    if let Some(v) = patch.ollama_model {
      self.ollama_model = v;
    }
    if let Some(v) = patch.embedding_model {
      self.embedding_model = v;
    }
    if let Some(v) = patch.outline_api_key {
      self.outline_api_key = v;
    }
    if let Some(v) = patch.outline_base_url {
      self.outline_base_url = v;
    }
  }
}

impl From<Settings> for SettingsPatch {
  fn from(s: Settings) -> Self {
    Self {
      vault_path: Some(s.vault_path),
      ollama_endpoint: Some(s.ollama_endpoint),
      ollama_model: Some(s.ollama_model),
      embedding_model: Some(s.embedding_model),
      outline_api_key: Some(s.outline_api_key),
      outline_base_url: Some(s.outline_base_url),
    }
  }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
  pub is_running: bool,
  pub total_files: u64,
  pub processed_files: u64,
  pub last_sync_at: Option<i64>,
  pub error: Option<String>,
}

/// Shallow update for [`SyncStatus`]. Nullable fields take `Some(None)` to clear.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncStatusPatch {
  pub is_running: Option<bool>,
  pub total_files: Option<u64>,
  pub processed_files: Option<u64>,
  pub last_sync_at: Option<Option<i64>>,
  pub error: Option<Option<String>>,
}

impl SyncStatusPatch {
  pub fn started() -> Self {
    Self {
      is_running: Some(true),
      error: Some(None),
      ..Self::default()
    }
  }

  pub fn failed(message: impl Into<String>) -> Self {
    Self {
      is_running: Some(false),
      error: Some(Some(message.into())),
      ..Self::default()
    }
  }
}

impl SyncStatus {
  pub fn merge(&mut self, patch: SyncStatusPatch) {
    if let Some(v) = patch.is_running {
      self.is_running = v;
    }
    if let Some(v) = patch.total_files {
      self.total_files = v;
    }
    if let Some(v) = patch.processed_files {
      self.processed_files = v;
    }
    if let Some(v) = patch.last_sync_at {
      self.last_sync_at = v;
    }
    if let Some(v) = patch.error {
      self.error = v;
    }
  }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StreamChunk {
  pub content: String,
  pub done: bool,
}

/// Progress for either source. The vault reports `currentFile`, the wiki `currentDocument`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
  pub processed: u64,
  pub total: u64,
  #[serde(default, alias = "currentDocument")]
  pub current_file: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SyncError {
  pub error: String,
}

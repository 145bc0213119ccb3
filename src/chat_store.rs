use std::sync::Arc;

use tokio::sync::watch;

use crate::models::ChatMessage;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
  /// Echoed locally before the backend confirmed it.
  Provisional,
  Backend,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChatEntry {
  pub message: ChatMessage,
  pub origin: Origin,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatState {
  pub messages: Vec<ChatEntry>,
  pub is_streaming: bool,
  pub streaming_content: String,
}

impl ChatState {
  pub fn has_provisional(&self) -> bool {
    self.messages.iter().any(|e| e.origin == Origin::Provisional)
  }
}

/// Ordered message log plus the in-flight streaming buffer.
#[derive(Clone)]
pub struct ChatStore {
  state: Arc<watch::Sender<ChatState>>,
}

impl Default for ChatStore {
  fn default() -> Self {
    Self::new()
  }
}

impl ChatStore {
  pub fn new() -> Self {
    Self {
      state: Arc::new(watch::channel(ChatState::default()).0),
    }
  }

  pub fn snapshot(&self) -> ChatState {
    self.state.borrow().clone()
  }

  pub fn watch(&self) -> watch::Receiver<ChatState> {
    self.state.subscribe()
  }

  pub fn is_streaming(&self) -> bool {
    self.state.borrow().is_streaming
  }

  pub fn add_message(&self, message: ChatMessage) {
    self.state.send_modify(|s| {
      s.messages.push(ChatEntry {
        message,
        origin: Origin::Provisional,
      })
    });
  }

  pub fn set_streaming(&self, streaming: bool) {
    self.state.send_modify(|s| s.is_streaming = streaming);
  }

  /// Enters the streaming phase with an empty accumulator.
  pub fn begin_streaming(&self) {
    self.state.send_modify(|s| {
      s.is_streaming = true;
      s.streaming_content.clear();
    });
  }

  /// Echoes `message` and enters the streaming phase in one step. Returns
  /// false, leaving the state untouched, when a response is already streaming.
  pub fn begin_send(&self, message: ChatMessage) -> bool {
    self.state.send_if_modified(|s| {
      if s.is_streaming {
        return false;
      }
      s.messages.push(ChatEntry {
        message,
        origin: Origin::Provisional,
      });
      s.is_streaming = true;
      s.streaming_content.clear();
      true
    })
  }

  /// Leaves the streaming phase without new history. The log is kept as is.
  pub fn end_stream(&self) {
    self.state.send_modify(|s| {
      s.is_streaming = false;
      s.streaming_content.clear();
    });
  }

  pub fn append_streaming_content(&self, delta: &str) {
    self.state.send_modify(|s| s.streaming_content.push_str(delta));
  }

  /// Installs the backend's history as the whole log and drops the
  /// accumulator. Provisional entries never survive this step.
  pub fn replace_messages(&self, history: Vec<ChatMessage>) {
    self.state.send_modify(|s| {
      s.messages = backend_entries(history);
      s.streaming_content.clear();
    });
  }

  /// Leaves the streaming phase with the backend's history in place, in a
  /// single update so no reader sees an idle session with a half-built log.
  pub fn complete_stream(&self, history: Vec<ChatMessage>) {
    self.state.send_modify(|s| {
      s.messages = backend_entries(history);
      s.streaming_content.clear();
      s.is_streaming = false;
    });
  }

  /// Installs the backend's history unless a response is streaming; the
  /// stream's own completion reconciles in that case.
  pub fn replace_if_idle(&self, history: Vec<ChatMessage>) -> bool {
    self.state.send_if_modified(|s| {
      if s.is_streaming {
        return false;
      }
      let entries = backend_entries(history);
      if s.messages == entries {
        return false;
      }
      s.messages = entries;
      true
    })
  }

  pub fn clear_messages(&self) {
    self.state.send_modify(|s| {
      s.messages.clear();
      s.streaming_content.clear();
    });
  }
}

fn backend_entries(history: Vec<ChatMessage>) -> Vec<ChatEntry> {
  history
    .into_iter()
    .map(|message| ChatEntry {
      message,
      origin: Origin::Backend,
    })
    .collect()
}

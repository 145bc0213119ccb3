use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
  /// The backend received the command and rejected it.
  #[error("{command} failed: {message}")]
  Command { command: String, message: String },
  #[error("backend unreachable: {0}")]
  Transport(#[from] reqwest::Error),
  #[error("unexpected payload: {0}")]
  Decode(#[from] serde_json::Error),
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  #[error("{0} is already in progress")]
  Busy(&'static str),
  #[error("subscription scope closed before {0} attached")]
  ScopeClosed(String),
}

impl ClientError {
  pub fn command(command: &str, message: impl Into<String>) -> Self {
    Self::Command {
      command: command.to_string(),
      message: message.into(),
    }
  }

  /// Text suitable for a transient notification or a store `error` field.
  pub fn user_message(&self) -> String {
    match self {
      Self::Command { message, .. } => message.clone(),
      other => other.to_string(),
    }
  }
}

pub type ClientResult<T> = Result<T, ClientError>;

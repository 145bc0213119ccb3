use async_stream::stream;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};

use crate::error::{ClientError, ClientResult};
use crate::events::EventSource;
use crate::gateway::Transport;

/// Talks to the backend process over its loopback HTTP port: commands are
/// `POST /invoke/<command>` with JSON arguments, events are one SSE stream per
/// event name at `GET /events/<name>`.
#[derive(Clone)]
pub struct HttpBridge {
  client: reqwest::Client,
  base_url: String,
}

impl HttpBridge {
  pub fn new(base_url: &str) -> Self {
    Self {
      client: reqwest::Client::new(),
      base_url: base_url.trim_end_matches('/').to_string(),
    }
  }

  pub async fn health(&self) -> ClientResult<Value> {
    let resp = self
      .client
      .get(format!("{}/health", self.base_url))
      .send()
      .await?
      .error_for_status()?;
    Ok(resp.json::<Value>().await?)
  }
}

#[async_trait]
impl Transport for HttpBridge {
  async fn invoke(&self, command: &str, args: Value) -> ClientResult<Value> {
    let resp = self
      .client
      .post(format!("{}/invoke/{}", self.base_url, command))
      .json(&args)
      .send()
      .await?;

    let status = resp.status();
    let text = resp.text().await?;
    if !status.is_success() {
      let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| v["error"].as_str().map(str::to_string))
        .unwrap_or_else(|| format!("backend returned {status}"));
      return Err(ClientError::command(command, message));
    }
    if text.trim().is_empty() {
      return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text)?)
  }
}

#[async_trait]
impl EventSource for HttpBridge {
  async fn listen(&self, event: &str) -> ClientResult<mpsc::UnboundedReceiver<Value>> {
    let resp = self
      .client
      .get(format!("{}/events/{}", self.base_url, event))
      .header("Accept", "text/event-stream")
      .send()
      .await?
      .error_for_status()?;

    let (tx, rx) = mpsc::unbounded_channel();
    let name = event.to_string();
    tokio::spawn(async move {
      let payloads = sse_payloads(resp.bytes_stream());
      tokio::pin!(payloads);
      loop {
        tokio::select! {
          _ = tx.closed() => break,
          next = payloads.next() => match next {
            Some(value) => {
              if tx.send(value).is_err() {
                break;
              }
            }
            None => {
              log::info!("event stream {name} ended");
              break;
            }
          },
        }
      }
    });
    Ok(rx)
  }
}

/// Decodes the `data:` payload of every SSE block. Blocks that are not JSON
/// (keep-alive comments, for one) are skipped.
fn sse_payloads<S, B, E>(bytes: S) -> impl Stream<Item = Value>
where
  S: Stream<Item = Result<B, E>>,
  B: AsRef<[u8]>,
  E: std::fmt::Display,
{
  stream! {
    let mut bytes = Box::pin(bytes);
    let mut buffer: Vec<u8> = Vec::new();
    while let Some(chunk) = bytes.next().await {
      let chunk = match chunk {
        Ok(c) => c,
        Err(err) => {
          log::warn!("event stream interrupted: {err}");
          return;
        }
      };

      // Split on raw bytes so a multi-byte character cut across chunks survives.
      buffer.extend(chunk.as_ref().iter().filter(|b| **b != b'\r'));
      while let Some(boundary) = buffer.windows(2).position(|w| w == b"\n\n") {
        let block: Vec<u8> = buffer.drain(..boundary + 2).collect();
        if let Some(data) = block_data(&String::from_utf8_lossy(&block[..boundary])) {
          match serde_json::from_str::<Value>(&data) {
            Ok(value) => yield value,
            Err(err) => log::debug!("skipping non-json event data: {err}"),
          }
        }
      }
    }
  }
}

fn block_data(block: &str) -> Option<String> {
  let lines: Vec<&str> = block
    .lines()
    .filter_map(|line| line.strip_prefix("data:"))
    .map(|data| data.strip_prefix(' ').unwrap_or(data))
    .collect();
  if lines.is_empty() {
    None
  } else {
    Some(lines.join("\n"))
  }
}

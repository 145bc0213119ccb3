use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};

use metamind_client::bridge::HttpBridge;
use metamind_client::config::{data_dir, load_or_init, LocalStorage};
use metamind_client::logger::Logger;
use metamind_client::models::{Settings, SettingsPatch};
use metamind_client::sync_store::{SyncSource, SyncStore};
use metamind_client::{AppContext, ArtifactList, ChatSession, SettingsForm, SyncPanel};

const HELP: &str = "commands: /sync /wiki /clear /docs /rm <id> /set <field> <value> /save /settings /status /quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let data_dir = data_dir().context("missing app data dir")?;
  std::fs::create_dir_all(&data_dir)?;

  let mut config = load_or_init(&data_dir.join("client.json"))?;
  config.apply_env();

  let log_path = data_dir.join("metamind-client.log");
  Logger::init(&log_path, &config.log_level)?;
  log::info!("Metamind client starting up against {}", config.backend_url);

  let storage = Arc::new(LocalStorage::open(&data_dir.join("local-storage.json")));
  let bridge = Arc::new(HttpBridge::new(&config.backend_url));
  if let Err(err) = bridge.health().await {
    eprintln!("backend at {} is not answering: {err}", config.backend_url);
  }

  let ctx = AppContext::new(
    bridge.clone(),
    bridge,
    None,
    storage,
    config.poll_interval(),
  );

  let chat = Arc::new(ChatSession::mount(&ctx).await?);
  let vault = Arc::new(SyncPanel::mount(&ctx, SyncSource::Vault).await?);
  let wiki = Arc::new(SyncPanel::mount(&ctx, SyncSource::Wiki).await?);
  let artifacts = ArtifactList::new(&ctx);
  let mut form = SettingsForm::mount(&ctx).await;

  tokio::spawn(print_stream(ctx.chat.watch()));
  for message in chat.store().snapshot().messages {
    println!("{:?}> {}", message.message.role, message.message.content);
  }
  println!("{HELP}");

  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  while let Some(line) = lines.next_line().await? {
    let line = line.trim();
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
      "" => {}
      "/quit" => break,
      "/sync" => spawn_sync(vault.clone()),
      "/wiki" => spawn_sync(wiki.clone()),
      "/clear" => match chat.clear().await {
        Ok(()) => println!("conversation cleared"),
        Err(err) => eprintln!("{}", err.user_message()),
      },
      "/docs" => match artifacts.artifacts().await {
        Ok(list) if list.is_empty() => println!("no indexed documents"),
        Ok(list) => {
          for artifact in list {
            println!("{}  {}", artifact.id, artifact.path);
          }
        }
        Err(err) => eprintln!("{}", err.user_message()),
      },
      "/rm" => match artifacts.delete(rest.trim()).await {
        Ok(()) => println!("removed {}", rest.trim()),
        Err(err) => eprintln!("{}", err.user_message()),
      },
      "/set" => match settings_patch(rest) {
        Some(patch) => form.edit(patch),
        None => eprintln!("unknown settings field"),
      },
      "/save" => match form.save().await {
        Ok(()) => println!("settings saved"),
        Err(err) => eprintln!("{}", err.user_message()),
      },
      "/settings" => {
        print_settings(form.draft());
        if form.has_unsaved_changes() {
          println!("(unsaved changes, /save to apply)");
        }
      }
      "/status" => {
        print_status(&ctx.vault);
        print_status(&ctx.wiki);
      }
      _ if command.starts_with('/') => println!("{HELP}"),
      _ => {
        let chat = chat.clone();
        let query = line.to_string();
        tokio::spawn(async move {
          if let Err(err) = chat.send(&query).await {
            eprintln!("{}", err.user_message());
          }
        });
      }
    }
  }

  log::info!("Metamind client shutting down");
  Ok(())
}

fn spawn_sync(panel: Arc<SyncPanel>) {
  tokio::spawn(async move {
    if let Err(err) = panel.trigger().await {
      eprintln!("{}", err.user_message());
    }
  });
}

/// Prints assistant text as it streams in.
async fn print_stream(mut rx: tokio::sync::watch::Receiver<metamind_client::chat_store::ChatState>) {
  let mut printed = 0;
  while rx.changed().await.is_ok() {
    let state = rx.borrow_and_update().clone();
    let content = &state.streaming_content;
    if content.len() > printed && content.is_char_boundary(printed) {
      print!("{}", &content[printed..]);
      let _ = std::io::stdout().flush();
      printed = content.len();
    } else if content.len() < printed {
      printed = content.len();
    }
    if !state.is_streaming && printed > 0 {
      println!();
      printed = 0;
    }
  }
}

fn settings_patch(args: &str) -> Option<SettingsPatch> {
  let (field, value) = args.trim().split_once(' ')?;
  let value = Some(value.trim().to_string());
  let mut patch = SettingsPatch::default();
  match field {
    "vaultPath" => patch.vault_path = value,
    "ollamaEndpoint" => patch.ollama_endpoint = value,
    "ollamaModel" => patch.ollama_model = value,
    "embeddingModel" => patch.embedding_model = value,
    "outlineApiKey" => patch.outline_api_key = value,
    "outlineBaseUrl" => patch.outline_base_url = value,
    _ => return None,
  }
  Some(patch)
}

fn print_settings(settings: &Settings) {
  println!("vaultPath      {}", settings.vault_path);
  println!("ollamaEndpoint {}", settings.ollama_endpoint);
  println!("ollamaModel    {}", settings.ollama_model);
  println!("embeddingModel {}", settings.embedding_model);
  println!("outlineBaseUrl {}", settings.outline_base_url);
  let key = if settings.outline_api_key.is_empty() { "(unset)" } else { "(set)" };
  println!("outlineApiKey  {key}");
}

fn print_status(store: &SyncStore) {
  let state = store.snapshot();
  let status = &state.status;
  let phase = if status.is_running { "running" } else { "idle" };
  print!(
    "{}: {phase} {}/{}",
    store.source().label(),
    status.processed_files,
    status.total_files
  );
  if let Some(item) = &state.current_item {
    print!(" ({item})");
  }
  if let Some(at) = status.last_sync_at {
    print!(" last={at}");
  }
  if let Some(err) = &status.error {
    print!(" error={err}");
  }
  println!();
}

//! Client-side state layer for the Metamind desktop assistant.
//!
//! The backend process owns indexing, retrieval and generation. This crate
//! issues its commands, listens to its pushed events, and keeps the chat log,
//! both sync sources, and the settings consistent with it.

pub mod bridge;
pub mod chat_store;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod logger;
pub mod models;
pub mod query;
pub mod session;
pub mod settings_store;
pub mod sync_store;

#[cfg(test)]
mod test_support;

pub use error::{ClientError, ClientResult};
pub use session::{AppContext, ArtifactList, ChatSession, SettingsForm, SyncPanel};

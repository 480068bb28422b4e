//! Lifecycle orchestration for a locally hosted llama.cpp inference server.
//!
//! The [`lifecycle::Orchestrator`] takes a model variant from "not even
//! downloaded" to a server accepting connections: it verifies or downloads
//! the weights, builds the engine when the server binary is missing, spawns
//! the server, and watches it until shutdown or crash. Progress, process
//! output and every state change flow through an [`events::EventSink`]
//! supplied by the embedding application.

pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod models;
pub mod process;

pub use config::{EngineSettings, ServerConfig};
pub use error::Error;
pub use events::{DownloadProgress, EventSink, LogEventSink};
pub use lifecycle::{LifecycleState, Orchestrator};
pub use models::{ModelDescriptor, ModelFamily, ModelStore};

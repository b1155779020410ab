#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

//! podcloud library — the building blocks of the replacement pod cloud.
//!
//! - `spark` — device handshake, encrypted CoAP channel, sessions, commands
//! - `logs` — bulk log-upload ingestion
//! - `registry` — device-id → session map behind a single-writer task
//! - `routes` — REST API handlers
//! - `config` / `keys` / `error` — configuration, key loading, error types

pub mod config;
pub mod error;
pub mod keys;
pub mod logs;
pub mod registry;
pub mod routes;
pub mod spark;

use std::sync::Arc;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::{PodError, Result};
pub use registry::RegistryHandle;

/// Shared application state passed to every HTTP handler via Axum's `State`
/// extractor.
#[derive(Clone)]
pub struct AppState {
    /// Handle to the registry of live device sessions.
    pub registry: RegistryHandle,
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
}

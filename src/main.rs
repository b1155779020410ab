#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # podcloud
//!
//! Replacement cloud for "pod" smart-mattress devices. Pods dial out to
//! this server; nothing here dials the pod.
//!
//! ## Listeners
//!
//! | Port | Protocol | Description                                        |
//! |------|----------|----------------------------------------------------|
//! | 5683 | TCP      | Device channel: RSA handshake, then AES-CBC CoAP   |
//! | 1337 | TCP      | Bulk log uploads (CBOR byte-string stream)         |
//! | 1115 | HTTP     | JSON status API (`/ping`, `/devices`, `/device/…`) |
//!
//! Plus a dial-*out* unix control socket per session (`SOCKET_PATH`).
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, listeners, HTTP router, graceful shutdown
//! config.rs        — TOML + env-var configuration
//! keys.rs          — PKCS#8 PEM private key loading
//! error.rs         — crate error enum
//! registry.rs      — device-id → session map (single-writer task)
//! spark/
//!   handshake.rs   — RSA/AES/HMAC session establishment
//!   channel.rs     — length-prefixed AES-CBC framing, rolling IVs
//!   coap.rs        — CoAP packet helpers
//!   session.rs     — per-pod reader/writer state machine
//!   request.rs     — queued outbound device request
//!   commands.rs    — typed operations (status, temperature, alarms, …)
//!   socket.rs      — unix control-socket command loop
//! logs/
//!   mod.rs         — log-upload listener and per-connection state machine
//!   ring.rs        — ring buffer + CBOR byte-string scanner
//!   records.rs     — debug decoding of structured log records
//! routes/
//!   ping.rs        — GET /ping
//!   devices.rs     — GET /devices, GET /device/{id}/status/
//! ```

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use podcloud::{keys, logs, registry, routes, spark, AppState, Config};

/// Replacement cloud server for pod smart-mattress devices.
#[derive(Parser)]
#[command(name = "podcloud", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Arc::new(Config::load(cli.config.as_deref()));

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("podcloud v{} starting", env!("CARGO_PKG_VERSION"));

    let server_key = Arc::new(
        keys::load_private_key(&config.keys.key_path)
            .unwrap_or_else(|e| panic!("Failed to load private key {}: {e}", config.keys.key_path)),
    );

    if config.logs.save_files {
        if let Err(e) = std::fs::create_dir_all(&config.logs.path) {
            warn!(path = %config.logs.path, error = %e, "cannot create log directory");
        }
    }

    let registry = registry::spawn();

    // Device channel listener
    let spark_listener = TcpListener::bind(("0.0.0.0", config.spark.port))
        .await
        .expect("Failed to bind device port");
    info!("Device listener on port {}", config.spark.port);
    let spark_task = tokio::spawn(spark::serve(
        spark_listener,
        Arc::clone(&server_key),
        registry.clone(),
        Arc::clone(&config),
    ));

    // Log upload listener
    let log_listener = TcpListener::bind(("0.0.0.0", config.logs.port))
        .await
        .expect("Failed to bind log port");
    info!("Log listener on port {}", config.logs.port);
    let log_task = tokio::spawn(logs::serve(log_listener, config.logs.clone()));

    // HTTP API
    let state = AppState {
        registry,
        config: Arc::clone(&config),
    };
    let app = Router::new()
        .route("/ping", get(routes::ping::ping))
        .route("/devices", get(routes::devices::list))
        .route("/device/{id}/status/", get(routes::devices::status))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let api_listener = TcpListener::bind(&config.api.listen)
        .await
        .expect("Failed to bind API address");
    info!("API listening on {}", config.api.listen);

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(api_listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Shutting down...");
    spark_task.abort();
    log_task.abort();
    info!("Goodbye");
}

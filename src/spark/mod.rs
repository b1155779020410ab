//! The device-facing ("spark") side of the server: handshake, encrypted
//! CoAP channel, per-pod sessions, typed commands, and the operator
//! control socket.

pub mod channel;
pub mod coap;
pub mod commands;
pub mod handshake;
pub mod request;
pub mod session;
pub mod socket;

#[cfg(test)]
pub mod testutil;

use std::sync::Arc;

use rsa::RsaPrivateKey;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::Config;
use crate::registry::RegistryHandle;

/// Accept pod connections forever, one session task per connection.
pub async fn serve(
    listener: TcpListener,
    server_key: Arc<RsaPrivateKey>,
    registry: RegistryHandle,
    config: Arc<Config>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!(%addr, "pod connected");
                tokio::spawn(session::run(
                    stream,
                    Arc::clone(&server_key),
                    registry.clone(),
                    Arc::clone(&config),
                ));
            }
            Err(e) => {
                error!(error = %e, "device accept failed");
                return;
            }
        }
    }
}

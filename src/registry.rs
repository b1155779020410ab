//! Device registry — the single authority on which pods are connected.
//!
//! A dedicated task owns the `device_id → Session` map outright; nothing else
//! ever touches it. Session tasks report lifecycle changes and readers (HTTP
//! handlers) resolve lookups by sending typed messages with oneshot reply
//! channels, so the map needs no lock at all and every mutation is totally
//! ordered.
//!
//! A pod that reconnects simply replaces its registry entry. When the *old*
//! session's teardown later reports a disconnect, the entry is only removed
//! if it still points at that session — otherwise the fresh connection would
//! be dropped from the registry by its predecessor's death.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::spark::session::Session;

/// Messages understood by the registry task.
enum RegistryMessage {
    /// A session completed its handshake and is live.
    Connected {
        device_id: String,
        session: Arc<Session>,
    },
    /// A session ended. Carries the session handle so a superseded entry
    /// is not clobbered by its predecessor's teardown.
    Disconnected {
        device_id: String,
        session: Arc<Session>,
    },
    /// List the ids of all connected devices.
    ListAll {
        reply: oneshot::Sender<Vec<String>>,
    },
    /// Resolve a device id to its live session, if any.
    Lookup {
        device_id: String,
        reply: oneshot::Sender<Option<Arc<Session>>>,
    },
}

/// Cheap cloneable handle for talking to the registry task.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryMessage>,
}

/// Spawn the registry task and return a handle to it.
pub fn spawn() -> RegistryHandle {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(registry_loop(rx));
    RegistryHandle { tx }
}

async fn registry_loop(mut rx: mpsc::Receiver<RegistryMessage>) {
    let mut sessions: HashMap<String, Arc<Session>> = HashMap::new();

    while let Some(msg) = rx.recv().await {
        match msg {
            RegistryMessage::Connected { device_id, session } => {
                if sessions.insert(device_id.clone(), session).is_some() {
                    info!(device_id = %device_id, "device reconnected, replaced session");
                } else {
                    info!(device_id = %device_id, "device connected");
                }
            }
            RegistryMessage::Disconnected { device_id, session } => {
                let current = sessions
                    .get(&device_id)
                    .is_some_and(|s| Arc::ptr_eq(s, &session));
                if current {
                    sessions.remove(&device_id);
                    info!(device_id = %device_id, "device disconnected");
                } else {
                    debug!(device_id = %device_id, "ignoring disconnect of superseded session");
                }
            }
            RegistryMessage::ListAll { reply } => {
                let _ = reply.send(sessions.keys().cloned().collect());
            }
            RegistryMessage::Lookup { device_id, reply } => {
                let _ = reply.send(sessions.get(&device_id).cloned());
            }
        }
    }
}

impl RegistryHandle {
    /// Report a session as live. Called once per successful handshake.
    pub async fn connected(&self, device_id: &str, session: Arc<Session>) {
        let msg = RegistryMessage::Connected {
            device_id: device_id.to_string(),
            session,
        };
        if self.tx.send(msg).await.is_err() {
            warn!("registry task is gone, dropping connect notification");
        }
    }

    /// Report a session as ended.
    pub async fn disconnected(&self, device_id: &str, session: &Arc<Session>) {
        let msg = RegistryMessage::Disconnected {
            device_id: device_id.to_string(),
            session: Arc::clone(session),
        };
        if self.tx.send(msg).await.is_err() {
            warn!("registry task is gone, dropping disconnect notification");
        }
    }

    /// Ids of all currently connected devices. Empty if the registry is gone.
    pub async fn list_devices(&self) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(RegistryMessage::ListAll { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Resolve a device id to its live session.
    pub async fn lookup(&self, device_id: &str) -> Option<Arc<Session>> {
        let (reply, rx) = oneshot::channel();
        let msg = RegistryMessage::Lookup {
            device_id: device_id.to_string(),
            reply,
        };
        if self.tx.send(msg).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }
}

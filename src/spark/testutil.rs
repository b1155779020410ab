//! In-process pod simulator used by session and command tests.
//!
//! Drives a real [`session::run`] over a `tokio::io::duplex` pair: performs
//! the device side of the handshake, then speaks the framed AES channel with
//! its own rolling IVs, exactly like firmware would.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use coap_lite::Packet;
use rand::rngs::OsRng;
use rsa::pkcs8::EncodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::config::Config;
use crate::registry::{self, RegistryHandle};
use crate::spark::channel::{Inbound, Outbound};
use crate::spark::handshake::NONCE_LEN;
use crate::spark::session::{self, Session};

pub const TEST_DEVICE_ID: &[u8; 12] = b"podtest00001";

/// RSA key generation dominates test time; share one pair per process.
fn test_keys() -> &'static (RsaPrivateKey, RsaPrivateKey) {
    static KEYS: OnceLock<(RsaPrivateKey, RsaPrivateKey)> = OnceLock::new();
    KEYS.get_or_init(|| {
        let server = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let device = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        (server, device)
    })
}

pub struct TestPod {
    stream: Option<DuplexStream>,
    inbound: Inbound,
    outbound: Outbound,
    decoded: VecDeque<Packet>,
    pub registry: RegistryHandle,
    pub device_id: String,
}

impl TestPod {
    /// Spawn a server session over a duplex pipe and complete the device
    /// side of the handshake against it.
    pub async fn connect(config: Config) -> Self {
        let (server_key, device_key) = test_keys();
        let registry = registry::spawn();

        let (server_end, mut device_end) = tokio::io::duplex(16 * 1024);
        tokio::spawn(session::run(
            server_end,
            Arc::new(server_key.clone()),
            registry.clone(),
            Arc::new(config),
        ));

        let mut nonce = [0u8; NONCE_LEN];
        device_end.read_exact(&mut nonce).await.unwrap();

        let der = device_key.to_public_key().to_public_key_der().unwrap();
        let mut hello = Vec::new();
        hello.extend_from_slice(&nonce);
        hello.extend_from_slice(TEST_DEVICE_ID);
        hello.extend_from_slice(der.as_bytes());
        let ciphertext = server_key
            .to_public_key()
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, &hello)
            .unwrap();
        device_end.write_all(&ciphertext).await.unwrap();

        let mut blob = vec![0u8; device_key.size() + server_key.size()];
        device_end.read_exact(&mut blob).await.unwrap();
        let keymat = device_key
            .decrypt(Pkcs1v15Encrypt, &blob[..device_key.size()])
            .unwrap();

        let mut key = [0u8; 16];
        key.copy_from_slice(&keymat[..16]);
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&keymat[16..32]);

        Self {
            stream: Some(device_end),
            inbound: Inbound::new(&key, iv),
            outbound: Outbound::new(&key, iv),
            decoded: VecDeque::new(),
            registry,
            device_id: hex::encode(TEST_DEVICE_ID),
        }
    }

    /// Encrypt and send one CoAP packet to the server.
    pub async fn send(&mut self, packet: &Packet) {
        let frame = self.outbound.seal(&packet.to_bytes().unwrap());
        self.stream
            .as_mut()
            .expect("pod already closed")
            .write_all(&frame)
            .await
            .unwrap();
    }

    /// Wait until the server session has registered, then return it.
    pub async fn session(&self) -> Arc<Session> {
        for _ in 0..100 {
            if let Some(session) = self.registry.lookup(&self.device_id).await {
                return session;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session never appeared in the registry");
    }

    /// Hang up the device side of the connection.
    pub fn close(&mut self) {
        self.stream = None;
    }
}

/// Read, decrypt, and decode the next CoAP message from the server,
/// preserving any extra messages that arrived in the same read.
pub async fn read_message(pod: &mut TestPod) -> Packet {
    loop {
        if let Some(packet) = pod.decoded.pop_front() {
            return packet;
        }
        let mut buf = [0u8; 4096];
        let n = pod
            .stream
            .as_mut()
            .expect("pod already closed")
            .read(&mut buf)
            .await
            .unwrap();
        assert!(n > 0, "server closed the connection");
        for plaintext in pod.inbound.ingest(&buf[..n]).unwrap() {
            pod.decoded
                .push_back(Packet::from_bytes(&plaintext).unwrap());
        }
    }
}

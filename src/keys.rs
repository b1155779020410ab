//! Server RSA private key loading.
//!
//! The pod firmware expects the cloud's well-known RSA key. The replacement
//! key is a PKCS#8 PEM file whose path comes from `KEY_PATH` (or the
//! `[keys]` config section); it must match the public key flashed onto the
//! devices being pointed at this server.

use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;

use crate::error::Result;

/// Read and parse the server's PKCS#8 PEM private key.
pub fn load_private_key(path: &str) -> Result<RsaPrivateKey> {
    let pem = std::fs::read_to_string(path)?;
    Ok(RsaPrivateKey::from_pkcs8_pem(&pem)?)
}

//! The two-round handshake that turns a raw pod TCP connection into an
//! authenticated AES session.
//!
//! Round 1: the server sends 40 random bytes. The pod answers with a single
//! RSA-PKCS#1 v1.5 ciphertext (sized to the server key) whose plaintext is
//! `nonce(40) || device_id(12) || SubjectPublicKeyInfo DER` — the nonce must
//! round-trip byte-for-byte.
//!
//! Round 2: the server generates 40 bytes of fresh key material, encrypts it
//! to the pod's public key, and appends a signature: HMAC-SHA1 keyed by the
//! key material over that ciphertext, then *raw* PKCS#1 v1.5 signed with the
//! server key. The firmware verifies the bare 20-byte digest with no
//! DigestInfo wrapper, so a stdlib signer cannot produce it; the padding and
//! modular exponentiation are done by hand below.
//!
//! The AES-128 key is bytes 0..16 of the key material and both directions
//! start from the IV at bytes 16..32. Bytes 32..40 exist only so the RSA
//! plaintext matches what the firmware expects.
//!
//! Any I/O, size, decryption, nonce, or DER failure aborts the connection;
//! there is no retry.

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{PodError, Result};

/// Size of the server nonce and of the round-2 key material.
pub const NONCE_LEN: usize = 40;
/// Size of the pod's identifier inside the round-1 response.
pub const DEVICE_ID_LEN: usize = 12;

/// Everything a session needs once the ceremony has completed.
pub struct SessionKeys {
    pub device_id: [u8; DEVICE_ID_LEN],
    pub aes_key: [u8; 16],
    /// Initial IV, shared by both directions until each starts rolling.
    pub iv: [u8; 16],
}

/// Parsed round-1 response from the pod.
struct DeviceHello {
    nonce: [u8; NONCE_LEN],
    device_id: [u8; DEVICE_ID_LEN],
    public_key: RsaPublicKey,
}

/// Run the full handshake over `stream`.
pub async fn perform<S>(stream: &mut S, server_key: &RsaPrivateKey) -> Result<SessionKeys>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    stream.write_all(&nonce).await?;
    stream.flush().await?;

    let mut response = vec![0u8; server_key.size()];
    stream.read_exact(&mut response).await?;

    let plaintext = server_key.decrypt(Pkcs1v15Encrypt, &response)?;
    let hello = parse_device_hello(&plaintext)?;
    if hello.nonce != nonce {
        return Err(PodError::Handshake("nonce mismatch"));
    }

    // Bytes 32..40 are never used, but the firmware expects a 40-byte
    // plaintext, so the full buffer goes over the wire.
    let mut keymat = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut keymat);

    let ciphertext = hello
        .public_key
        .encrypt(&mut OsRng, Pkcs1v15Encrypt, &keymat)?;
    let digest = hmac_sha1(&keymat, &ciphertext);
    let signature = sign_raw_pkcs1(server_key, &digest)?;

    let mut blob = ciphertext;
    blob.extend_from_slice(&signature);
    stream.write_all(&blob).await?;
    stream.flush().await?;

    let mut aes_key = [0u8; 16];
    aes_key.copy_from_slice(&keymat[..16]);
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&keymat[16..32]);

    Ok(SessionKeys {
        device_id: hello.device_id,
        aes_key,
        iv,
    })
}

fn parse_device_hello(data: &[u8]) -> Result<DeviceHello> {
    if data.len() <= NONCE_LEN + DEVICE_ID_LEN {
        return Err(PodError::Handshake("hello payload too short"));
    }
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&data[..NONCE_LEN]);
    let mut device_id = [0u8; DEVICE_ID_LEN];
    device_id.copy_from_slice(&data[NONCE_LEN..NONCE_LEN + DEVICE_ID_LEN]);
    let public_key = RsaPublicKey::from_public_key_der(&data[NONCE_LEN + DEVICE_ID_LEN..])?;
    Ok(DeviceHello {
        nonce,
        device_id,
        public_key,
    })
}

/// HMAC-SHA1 of `data` under `key`.
fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; 20] {
    let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Sign `digest` with the textbook PKCS#1 v1.5 private-key operation:
/// pad to `00 01 FF…FF 00 || digest`, then `m^d mod n`, left-padded to the
/// key size. No DigestInfo prefix — the firmware checks the bare digest.
fn sign_raw_pkcs1(key: &RsaPrivateKey, digest: &[u8]) -> Result<Vec<u8>> {
    let size = key.size();
    let padded = pkcs1_pad_raw(digest, size)?;

    let m = BigUint::from_bytes_be(&padded);
    let s = m.modpow(key.d(), key.n());

    let mut signature = s.to_bytes_be();
    if signature.len() < size {
        let mut full = vec![0u8; size];
        full[size - signature.len()..].copy_from_slice(&signature);
        signature = full;
    }
    Ok(signature)
}

fn pkcs1_pad_raw(data: &[u8], size: usize) -> Result<Vec<u8>> {
    let pad_len = match size.checked_sub(data.len() + 3) {
        Some(n) if n >= 8 => n,
        _ => return Err(PodError::Handshake("digest too long for key size")),
    };
    let mut padded = vec![0xFF; size];
    padded[0] = 0x00;
    padded[1] = 0x01;
    padded[2 + pad_len] = 0x00;
    padded[3 + pad_len..].copy_from_slice(data);
    Ok(padded)
}

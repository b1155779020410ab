//! Framed AES-CBC transport used after the handshake.
//!
//! Every message on the wire is `[u16 big-endian length][ciphertext]`, with
//! the ciphertext a whole number of AES blocks carrying PKCS#7-padded
//! plaintext. The IV *rolls*: after each message, a direction's IV becomes
//! the first block of the ciphertext just produced or consumed, chaining CBC
//! across messages. That makes the IVs part of the channel state — [`Inbound`]
//! is owned by the session's reader task, [`Outbound`] lives under the
//! session's send lock so concurrent senders cannot interleave the chain.
//!
//! A TCP read can deliver several frames, half a frame, or both, so
//! [`Inbound`] accumulates bytes across reads and only decrypts whole frames.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;

use crate::error::{PodError, Result};

/// AES block size; frame lengths are always a multiple of this.
pub const BLOCK_SIZE: usize = 16;

/// Decrypting side of the channel: frame reassembly plus the incoming IV.
pub struct Inbound {
    cipher: Aes128,
    iv: [u8; BLOCK_SIZE],
    pending: Vec<u8>,
}

impl Inbound {
    pub fn new(key: &[u8; 16], iv: [u8; 16]) -> Self {
        Self {
            cipher: Aes128::new(key.into()),
            iv,
            pending: Vec::new(),
        }
    }

    /// Feed raw TCP bytes in; get zero or more decrypted messages out.
    ///
    /// Partial frames stay buffered until the rest arrives. Any decryption
    /// failure poisons the connection and must tear the session down.
    pub fn ingest(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.pending.extend_from_slice(data);

        let mut messages = Vec::new();
        loop {
            if self.pending.len() < 2 {
                break;
            }
            let frame_len = usize::from(u16::from_be_bytes([self.pending[0], self.pending[1]]));
            if self.pending.len() < 2 + frame_len {
                break;
            }
            let ciphertext: Vec<u8> = self.pending.drain(..2 + frame_len).skip(2).collect();
            messages.push(self.open(&ciphertext)?);
        }
        Ok(messages)
    }

    /// Decrypt one frame body and advance the rolling IV.
    fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(PodError::Protocol(format!(
                "frame length {} is not a positive multiple of {BLOCK_SIZE}",
                ciphertext.len()
            )));
        }

        let mut plaintext = ciphertext.to_vec();
        let mut prev = self.iv;
        for (block, ct_block) in plaintext
            .chunks_mut(BLOCK_SIZE)
            .zip(ciphertext.chunks(BLOCK_SIZE))
        {
            self.cipher.decrypt_block(block.into());
            for (b, p) in block.iter_mut().zip(prev.iter()) {
                *b ^= p;
            }
            prev.copy_from_slice(ct_block);
        }
        // Next message chains from this ciphertext.
        self.iv.copy_from_slice(&ciphertext[..BLOCK_SIZE]);

        let pad = usize::from(plaintext[plaintext.len() - 1]);
        if pad == 0 || pad > BLOCK_SIZE {
            return Err(PodError::InvalidPadding);
        }
        plaintext.truncate(plaintext.len() - pad);
        Ok(plaintext)
    }

    /// Current incoming IV. Exposed for invariant checks.
    #[cfg(test)]
    pub fn iv(&self) -> [u8; BLOCK_SIZE] {
        self.iv
    }
}

/// Encrypting side of the channel: pads, encrypts, frames, rolls the IV.
pub struct Outbound {
    cipher: Aes128,
    iv: [u8; BLOCK_SIZE],
}

impl Outbound {
    pub fn new(key: &[u8; 16], iv: [u8; 16]) -> Self {
        Self {
            cipher: Aes128::new(key.into()),
            iv,
        }
    }

    /// Encrypt one message and return the complete length-prefixed frame.
    pub fn seal(&mut self, plaintext: &[u8]) -> Vec<u8> {
        // PKCS#7: always pad, a full extra block when already aligned.
        let pad = BLOCK_SIZE - plaintext.len() % BLOCK_SIZE;
        let mut body = plaintext.to_vec();
        body.resize(plaintext.len() + pad, pad as u8);

        let mut prev = self.iv;
        for block in body.chunks_mut(BLOCK_SIZE) {
            for (b, p) in block.iter_mut().zip(prev.iter()) {
                *b ^= p;
            }
            self.cipher.encrypt_block(block.into());
            prev.copy_from_slice(block);
        }
        self.iv.copy_from_slice(&body[..BLOCK_SIZE]);

        let mut frame = Vec::with_capacity(2 + body.len());
        frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
        frame.extend_from_slice(&body);
        frame
    }

    /// Current outgoing IV. Exposed for invariant checks.
    #[cfg(test)]
    pub fn iv(&self) -> [u8; BLOCK_SIZE] {
        self.iv
    }
}

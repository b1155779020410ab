use std::io;
use thiserror::Error;

/// The primary error type for the `podcloud` server.
#[derive(Error, Debug)]
pub enum PodError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("RSA error: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("private key error: {0}")]
    PrivateKey(#[from] rsa::pkcs8::Error),

    #[error("public key error: {0}")]
    PublicKey(#[from] rsa::pkcs8::spki::Error),

    #[error("handshake failed: {0}")]
    Handshake(&'static str),

    #[error("invalid message padding")]
    InvalidPadding,

    #[error("CoAP message error: {0}")]
    Coap(#[from] coap_lite::error::MessageError),

    #[error("CBOR decode error: {0}")]
    CborDecode(String),

    #[error("CBOR encode error: {0}")]
    CborEncode(String),

    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("device session closed")]
    SessionClosed,

    #[error("device request timed out")]
    RequestTimeout,

    #[error("log buffer overflow")]
    BufferOverflow,
}

pub type Result<T> = std::result::Result<T, PodError>;

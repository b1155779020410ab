//! Bulk log-upload ingestion.
//!
//! Pods push diagnostics over a second TCP connection, completely separate
//! from the command channel and unencrypted. Each connection walks a small
//! state machine:
//!
//! 1. **ClientHello** — a CBOR map `{proto, version, part, dev}`; answered
//!    with `{proto:"raw", part:"session"}`.
//! 2. **WaitingForStreamStart** — a 38-byte batch-start frame, recognized by
//!    a magic ASCII run rather than decoded (the frame uses indefinite CBOR
//!    the firmware never finishes properly); the big-endian batch id sits at
//!    bytes `0x1a..0x1e`. Malformed frames are logged and skipped.
//! 3. **ReceivingStream** — raw bytes fed through the ring buffer, CBOR
//!    byte-string payloads appended to `<LOG_PATH>/<id:08X>.RAW` (when
//!    saving). A bare `0xFF` ends the batch: the file is closed and a CBOR
//!    ack `{proto:"raw", part:"batch", id}` goes back, returning to state 2.
//!
//! A disconnect mid-stream flushes and closes any open file without acking.

pub mod records;
pub mod ring;

use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::config::LogConfig;
use crate::error::{PodError, Result};
use self::ring::RingBuffer;

/// Exact size of a batch-start frame.
const BATCH_START_LEN: usize = 38;
/// ASCII run present in every batch-start frame (the CBOR text keys
/// `proto`, `raw`, `part`, `batch`, `id` back to back).
const BATCH_MAGIC: &[u8] = b"eprotocrawdpartebatchbid";
/// Offsets of the big-endian batch id inside the frame.
const BATCH_ID_RANGE: std::ops::Range<usize> = 0x1a..0x1e;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogState {
    ClientHello,
    WaitingForStreamStart,
    ReceivingStream,
}

/// Handshake sent by the pod when the connection opens.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LogHello {
    proto: String,
    version: String,
    part: String,
    dev: String,
}

#[derive(Serialize)]
struct SessionReply {
    proto: &'static str,
    part: &'static str,
}

#[derive(Serialize)]
struct BatchAck {
    proto: &'static str,
    part: &'static str,
    id: u32,
}

/// Accept log-upload connections forever, one task per connection.
pub async fn serve(listener: TcpListener, config: LogConfig) {
    loop {
        match listener.accept().await {
            Ok((mut stream, addr)) => {
                info!(%addr, "log client connected");
                let config = config.clone();
                tokio::spawn(async move {
                    let mut session = LogSession::new(&config);
                    if let Err(e) = session.drive(&mut stream).await {
                        warn!(%addr, error = %e, "log connection failed");
                    }
                    session.finish().await;
                    info!(%addr, "log client disconnected");
                });
            }
            Err(e) => {
                error!(error = %e, "log accept failed");
                return;
            }
        }
    }
}

/// State for one log-upload connection.
pub struct LogSession {
    state: LogState,
    batch_id: u32,
    file: Option<BufWriter<File>>,
    received: u64,
    ring: RingBuffer,
    log_path: String,
    save_files: bool,
}

impl LogSession {
    pub fn new(config: &LogConfig) -> Self {
        Self {
            state: LogState::ClientHello,
            batch_id: 0,
            file: None,
            received: 0,
            ring: RingBuffer::new(),
            log_path: config.path.clone(),
            save_files: config.save_files,
        }
    }

    /// Read from `stream` until EOF, feeding each read through the state
    /// machine (replies go back on the same stream).
    async fn drive<S>(&mut self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            self.on_data(&buf[..n], stream).await?;
        }
    }

    /// Advance the state machine with one read's worth of bytes.
    pub async fn on_data<W>(&mut self, data: &[u8], out: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match self.state {
            LogState::ClientHello => self.on_hello(data, out).await,
            LogState::WaitingForStreamStart => self.on_stream_start(data).await,
            LogState::ReceivingStream => self.on_stream_data(data, out).await,
        }
    }

    async fn on_hello<W>(&mut self, data: &[u8], out: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let hello: LogHello = match ciborium::from_reader(data) {
            Ok(hello) => hello,
            Err(e) => {
                warn!(error = %e, "malformed log hello frame");
                return Ok(());
            }
        };

        let reply = SessionReply {
            proto: "raw",
            part: "session",
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&reply, &mut bytes)
            .map_err(|e| PodError::CborEncode(e.to_string()))?;
        out.write_all(&bytes).await?;

        info!(
            device_id = %hello.dev,
            proto = %hello.proto,
            version = %hello.version,
            part = %hello.part,
            "log session established"
        );
        self.state = LogState::WaitingForStreamStart;
        Ok(())
    }

    async fn on_stream_start(&mut self, data: &[u8]) -> Result<()> {
        let magic = data
            .windows(BATCH_MAGIC.len())
            .any(|window| window == BATCH_MAGIC);
        if data.len() != BATCH_START_LEN || !magic {
            warn!(len = data.len(), "invalid batch start frame");
            return Ok(());
        }

        let mut id = [0u8; 4];
        id.copy_from_slice(&data[BATCH_ID_RANGE]);
        self.batch_id = u32::from_be_bytes(id);

        let file_name = format!("{}/{:08X}.RAW", self.log_path, self.batch_id);
        if self.save_files {
            let file = File::create(&file_name).await?;
            self.file = Some(BufWriter::new(file));
            info!(file = %file_name, "receiving log batch");
        } else {
            info!(file = %file_name, "receiving log batch (not saving)");
        }

        self.state = LogState::ReceivingStream;
        Ok(())
    }

    async fn on_stream_data<W>(&mut self, data: &[u8], out: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        // A full buffer means the device is sending something the scanner
        // cannot frame; losing bytes silently would corrupt the batch, so
        // give up on the connection instead.
        self.ring.write(data)?;

        let result = ring::extract_byte_strings(&mut self.ring);
        for chunk in &result.chunks {
            self.received += chunk.len() as u64;
            records::trace_records(chunk);
            if let Some(file) = self.file.as_mut() {
                file.write_all(chunk).await?;
                file.flush().await?;
            }
        }

        if result.reset_found {
            if let Some(mut file) = self.file.take() {
                file.flush().await?;
                debug!("closed batch file");
            }

            let ack = BatchAck {
                proto: "raw",
                part: "batch",
                id: self.batch_id,
            };
            let mut bytes = Vec::new();
            ciborium::into_writer(&ack, &mut bytes)
                .map_err(|e| PodError::CborEncode(e.to_string()))?;
            out.write_all(&bytes).await?;

            info!(
                batch_id = format!("{:08X}", self.batch_id),
                bytes = self.received,
                "log batch complete"
            );
            self.received = 0;
            self.state = LogState::WaitingForStreamStart;
        }
        Ok(())
    }

    /// Flush and drop any open batch file. No ack is sent — the pod will
    /// resend the batch on its next connection.
    pub async fn finish(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush().await {
                warn!(error = %e, "failed to flush batch file on disconnect");
            } else {
                debug!("closed open batch file on disconnect");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn hello_bytes() -> Vec<u8> {
        #[derive(Serialize)]
        struct Hello<'a> {
            proto: &'a str,
            version: &'a str,
            part: &'a str,
            dev: &'a str,
        }
        let mut out = Vec::new();
        ciborium::into_writer(
            &Hello {
                proto: "raw",
                version: "1",
                part: "session",
                dev: "podtest00001",
            },
            &mut out,
        )
        .unwrap();
        out
    }

    /// 38 bytes: the magic run up front, the batch id at 0x1a..0x1e.
    fn batch_start_bytes(batch_id: u32) -> Vec<u8> {
        let mut frame = vec![0u8; BATCH_START_LEN];
        frame[..BATCH_MAGIC.len()].copy_from_slice(BATCH_MAGIC);
        frame[BATCH_ID_RANGE].copy_from_slice(&batch_id.to_be_bytes());
        frame
    }

    fn test_config(save_files: bool) -> (LogConfig, String) {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let dir = std::env::temp_dir().join(format!(
            "podcloud-log-test-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.to_str().unwrap().to_string();
        (
            LogConfig {
                port: 0,
                path: path.clone(),
                save_files,
            },
            path,
        )
    }

    #[derive(Deserialize, Debug)]
    struct AckShape {
        proto: String,
        part: String,
        #[serde(default)]
        id: u32,
    }

    #[tokio::test]
    async fn test_hello_is_answered_with_session_reply() {
        let (config, _) = test_config(false);
        let mut session = LogSession::new(&config);
        let mut out = Vec::new();

        session.on_data(&hello_bytes(), &mut out).await.unwrap();

        let reply: AckShape = ciborium::from_reader(out.as_slice()).unwrap();
        assert_eq!(reply.proto, "raw");
        assert_eq!(reply.part, "session");
        assert_eq!(session.state, LogState::WaitingForStreamStart);
    }

    #[tokio::test]
    async fn test_malformed_hello_keeps_waiting() {
        let (config, _) = test_config(false);
        let mut session = LogSession::new(&config);
        let mut out = Vec::new();

        session.on_data(b"\xFF\xFF\xFF", &mut out).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(session.state, LogState::ClientHello);

        session.on_data(&hello_bytes(), &mut out).await.unwrap();
        assert_eq!(session.state, LogState::WaitingForStreamStart);
    }

    #[tokio::test]
    async fn test_invalid_batch_start_is_skipped() {
        let (config, _) = test_config(false);
        let mut session = LogSession::new(&config);
        let mut out = Vec::new();
        session.on_data(&hello_bytes(), &mut out).await.unwrap();

        // Right length, no magic.
        session
            .on_data(&[0u8; BATCH_START_LEN], &mut out)
            .await
            .unwrap();
        assert_eq!(session.state, LogState::WaitingForStreamStart);

        // Magic but wrong length.
        let mut frame = batch_start_bytes(1);
        frame.push(0);
        session.on_data(&frame, &mut out).await.unwrap();
        assert_eq!(session.state, LogState::WaitingForStreamStart);

        session
            .on_data(&batch_start_bytes(1), &mut out)
            .await
            .unwrap();
        assert_eq!(session.state, LogState::ReceivingStream);
    }

    #[tokio::test]
    async fn test_batch_ingest_writes_file_and_acks() {
        let (config, dir) = test_config(true);
        let mut session = LogSession::new(&config);
        let mut out = Vec::new();

        session.on_data(&hello_bytes(), &mut out).await.unwrap();
        out.clear();
        session
            .on_data(&batch_start_bytes(0xDEAD_BEEF), &mut out)
            .await
            .unwrap();

        // The spec stream, split across reads mid-header and mid-payload.
        let stream = [
            0x44u8, 0x01, 0x02, 0x03, 0x04, 0x43, 0x05, 0x06, 0x07, 0x42, 0x08, 0x09, 0xFF,
        ];
        session.on_data(&stream[..3], &mut out).await.unwrap();
        assert!(out.is_empty());
        session.on_data(&stream[3..10], &mut out).await.unwrap();
        session.on_data(&stream[10..], &mut out).await.unwrap();

        // Back to waiting, ack sent with the batch id.
        assert_eq!(session.state, LogState::WaitingForStreamStart);
        let ack: AckShape = ciborium::from_reader(out.as_slice()).unwrap();
        assert_eq!(ack.proto, "raw");
        assert_eq!(ack.part, "batch");
        assert_eq!(ack.id, 0xDEAD_BEEF);

        // The file holds the concatenated payloads, headers stripped.
        let contents = std::fs::read(format!("{dir}/DEADBEEF.RAW")).unwrap();
        assert_eq!(
            contents,
            vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09]
        );
    }

    #[tokio::test]
    async fn test_second_batch_reuses_connection() {
        let (config, dir) = test_config(true);
        let mut session = LogSession::new(&config);
        let mut out = Vec::new();

        session.on_data(&hello_bytes(), &mut out).await.unwrap();
        session
            .on_data(&batch_start_bytes(0x11), &mut out)
            .await
            .unwrap();
        session
            .on_data(&[0x42, 0xAA, 0xBB, 0xFF], &mut out)
            .await
            .unwrap();
        assert_eq!(session.state, LogState::WaitingForStreamStart);

        session
            .on_data(&batch_start_bytes(0x22), &mut out)
            .await
            .unwrap();
        assert_eq!(session.state, LogState::ReceivingStream);
        session
            .on_data(&[0x41, 0xCC, 0xFF], &mut out)
            .await
            .unwrap();

        assert_eq!(std::fs::read(format!("{dir}/00000011.RAW")).unwrap(), vec![0xAA, 0xBB]);
        assert_eq!(std::fs::read(format!("{dir}/00000022.RAW")).unwrap(), vec![0xCC]);
    }

    #[tokio::test]
    async fn test_disconnect_mid_stream_flushes_file() {
        let (config, dir) = test_config(true);
        let mut session = LogSession::new(&config);
        let mut out = Vec::new();

        session.on_data(&hello_bytes(), &mut out).await.unwrap();
        session
            .on_data(&batch_start_bytes(0x33), &mut out)
            .await
            .unwrap();
        out.clear();
        session
            .on_data(&[0x42, 0x01, 0x02], &mut out)
            .await
            .unwrap();
        session.finish().await;

        // The chunk made it to disk, but no ack was sent.
        assert!(out.is_empty());
        assert_eq!(std::fs::read(format!("{dir}/00000033.RAW")).unwrap(), vec![0x01, 0x02]);
    }

    #[tokio::test]
    async fn test_oversized_stream_write_is_fatal() {
        let (config, _) = test_config(false);
        let mut session = LogSession::new(&config);
        let mut out = Vec::new();

        session.on_data(&hello_bytes(), &mut out).await.unwrap();
        session
            .on_data(&batch_start_bytes(0x44), &mut out)
            .await
            .unwrap();

        // An unframeable flood (not byte strings) fills the ring; the write
        // that no longer fits must error out.
        let garbage = vec![0x00u8; 4096];
        session.on_data(&garbage, &mut out).await.unwrap();
        session.on_data(&garbage, &mut out).await.unwrap();
        let result = session.on_data(&garbage, &mut out).await;
        assert!(matches!(result, Err(PodError::BufferOverflow)));
    }
}

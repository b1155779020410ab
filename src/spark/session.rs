//! Per-pod session: the reader/writer pair behind one device connection.
//!
//! After the handshake, every connection runs:
//!
//! - a **reader** (this task): decrypts frames, answers keep-alives and the
//!   small set of device-initiated paths, and matches acknowledgements
//!   against the one in-flight outbound request;
//! - a **writer pump**: drains the session's bounded request queue one
//!   request at a time — the next request is not sent until the current one
//!   resolves, times out, or the session dies;
//! - a **control task** (after the first `/h`): dials the operator unix
//!   socket and relays commands.
//!
//! Outgoing frames share one lock which also owns the outgoing IV and the
//! message-id counter, so the CBC chain and id sequence cannot interleave.
//! The in-flight slot is written by the pump and consumed by the reader; the
//! pump parks on a [`Notify`] until the slot empties.
//!
//! Any crypto or protocol error is fatal to the session: the registry hears
//! a disconnect, the in-flight request fails, and aborting the pump drops
//! the queue, failing everything still waiting in it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use coap_lite::{MessageType, Packet};
use rsa::RsaPrivateKey;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{PodError, Result};
use crate::registry::RegistryHandle;
use crate::spark::channel::{Inbound, Outbound};
use crate::spark::handshake;
use crate::spark::request::DeviceRequest;
use crate::spark::{coap, socket};

/// Outbound requests a session will queue before submitters start blocking.
const REQUEST_QUEUE_CAPACITY: usize = 100;

/// Handle to a live device session, shared by the registry and everything
/// that wants to talk to the pod. The session's own tasks are the only
/// mutators of its channel state.
pub struct Session {
    device_id: String,
    request_tx: mpsc::Sender<DeviceRequest>,
    sender: Mutex<FrameSender>,
    inflight: Mutex<Option<InFlight>>,
    inflight_done: Notify,
    control_started: AtomicBool,
}

/// The serialized outgoing side: writer, rolling IV, message-id counter.
struct FrameSender {
    outbound: Outbound,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    message_id: u8,
}

/// The single outstanding outbound request awaiting its acknowledgement.
struct InFlight {
    message_id: u16,
    reply: oneshot::Sender<Result<Vec<u8>>>,
}

impl FrameSender {
    /// Current counter value; the counter then wraps 0..=255.
    fn next_message_id(&mut self) -> u8 {
        let id = self.message_id;
        self.message_id = self.message_id.wrapping_add(1);
        id
    }

    async fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        let plaintext = packet.to_bytes()?;
        let frame = self.outbound.seal(&plaintext);
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

impl Session {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Queue an outbound request and wait for the pod's acknowledgement body.
    ///
    /// Requests are answered strictly one at a time in submission order.
    /// Fails with [`PodError::SessionClosed`] if the session dies first or
    /// [`PodError::RequestTimeout`] if the pod never acknowledges.
    pub async fn submit(&self, packet: Packet) -> Result<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.request_tx
            .send(DeviceRequest { packet, reply })
            .await
            .map_err(|_| PodError::SessionClosed)?;
        rx.await.map_err(|_| PodError::SessionClosed)?
    }

    /// Encrypt and send one packet. Non-acknowledgement packets get the next
    /// message id, with a one-byte token equal to that id.
    async fn send(&self, mut packet: Packet) -> Result<()> {
        let mut sender = self.sender.lock().await;
        if packet.header.get_type() != MessageType::Acknowledgement {
            let id = sender.next_message_id();
            packet.header.message_id = u16::from(id);
            packet.set_token(vec![id]);
        }
        sender.send_packet(&packet).await
    }

    async fn take_inflight(&self) -> Option<InFlight> {
        self.inflight.lock().await.take()
    }
}

#[cfg(test)]
impl Session {
    /// A session with no live connection behind it, for registry tests.
    pub(crate) fn stub(device_id: &str) -> Arc<Self> {
        let (request_tx, _) = mpsc::channel(1);
        Arc::new(Self {
            device_id: device_id.to_string(),
            request_tx,
            sender: Mutex::new(FrameSender {
                outbound: Outbound::new(&[0u8; 16], [0u8; 16]),
                writer: Box::new(tokio::io::sink()),
                message_id: 0,
            }),
            inflight: Mutex::new(None),
            inflight_done: Notify::new(),
            control_started: AtomicBool::new(false),
        })
    }
}

/// Drive one pod connection to completion: handshake, then read until the
/// device goes away or the channel turns poisonous.
pub async fn run<S>(
    stream: S,
    server_key: Arc<RsaPrivateKey>,
    registry: RegistryHandle,
    config: Arc<Config>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut stream = stream;
    let keys = match handshake::perform(&mut stream, &server_key).await {
        Ok(keys) => keys,
        Err(e) => {
            warn!(error = %e, "handshake failed, dropping connection");
            return;
        }
    };
    let device_id = hex::encode(keys.device_id);
    info!(device_id = %device_id, "handshake complete");

    let (read_half, write_half) = tokio::io::split(stream);
    let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);

    let session = Arc::new(Session {
        device_id: device_id.clone(),
        request_tx,
        sender: Mutex::new(FrameSender {
            outbound: Outbound::new(&keys.aes_key, keys.iv),
            writer: Box::new(write_half),
            message_id: 0,
        }),
        inflight: Mutex::new(None),
        inflight_done: Notify::new(),
        control_started: AtomicBool::new(false),
    });

    registry.connected(&device_id, Arc::clone(&session)).await;

    let pump = tokio::spawn(request_pump(
        Arc::clone(&session),
        request_rx,
        Duration::from_secs(config.spark.request_timeout_secs),
    ));

    let mut inbound = Inbound::new(&keys.aes_key, keys.iv);
    let mut control_task = None;
    match read_loop(&session, read_half, &mut inbound, &mut control_task, &config).await {
        Ok(()) => info!(device_id = %device_id, "pod disconnected"),
        Err(e) => warn!(device_id = %device_id, error = %e, "session failed"),
    }

    registry.disconnected(&device_id, &session).await;
    if let Some(inflight) = session.take_inflight().await {
        let _ = inflight.reply.send(Err(PodError::SessionClosed));
        session.inflight_done.notify_one();
    }
    // Killing the pump drops the queue receiver; every queued request's
    // reply channel closes, failing its submitter.
    pump.abort();
    if let Some(task) = control_task {
        task.abort();
    }
}

async fn read_loop<S>(
    session: &Arc<Session>,
    mut read_half: ReadHalf<S>,
    inbound: &mut Inbound,
    control_task: &mut Option<JoinHandle<()>>,
    config: &Arc<Config>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut buf = [0u8; 2048];
    loop {
        let n = read_half.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        for plaintext in inbound.ingest(&buf[..n])? {
            let packet = Packet::from_bytes(&plaintext)?;
            handle_message(session, &packet, control_task, config).await?;
        }
    }
}

async fn handle_message(
    session: &Arc<Session>,
    packet: &Packet,
    control_task: &mut Option<JoinHandle<()>>,
    config: &Arc<Config>,
) -> Result<()> {
    let path = coap::path_of(packet);

    if path == "/" && packet.header.get_type() == MessageType::Confirmable {
        debug!(device_id = %session.device_id, "keep-alive");
        return session.send(coap::empty_ack(packet)).await;
    }

    if packet.header.get_type() == MessageType::Acknowledgement {
        let mut slot = session.inflight.lock().await;
        let matches = slot
            .as_ref()
            .is_some_and(|r| r.message_id == packet.header.message_id);
        if matches {
            let inflight = slot.take();
            drop(slot);
            if let Some(inflight) = inflight {
                let _ = inflight.reply.send(Ok(packet.payload.clone()));
            }
            session.inflight_done.notify_one();
        } else {
            debug!(
                message_id = packet.header.message_id,
                "acknowledgement for unknown request, ignoring"
            );
        }
        return Ok(());
    }

    match path.as_str() {
        "/h" => {
            debug!(device_id = %session.device_id, "pod hello");
            session.send(coap::hello_reply()).await?;
            if !session.control_started.swap(true, Ordering::SeqCst) {
                *control_task = Some(tokio::spawn(socket::run(
                    Arc::clone(session),
                    config.control.socket_path.clone(),
                )));
            }
        }
        // Spark platform chatter the pod expects nobody to answer.
        "/E/spark/device/claim/code"
        | "/E/spark/hardware/max_binary"
        | "/E/spark/hardware/ota_chunk_size"
        | "/E/tracing/rat" => {}
        "/e/spark" => {
            session.send(coap::empty_ack(packet)).await?;
        }
        "/t" => {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_secs());
            let payload = (now as u32).to_be_bytes().to_vec();
            session.send(coap::content_ack(packet, payload)).await?;
        }
        other => {
            debug!(device_id = %session.device_id, path = %other, "unhandled message");
        }
    }
    Ok(())
}

/// Writer pump: one request on the wire at a time, in queue order.
async fn request_pump(
    session: Arc<Session>,
    mut rx: mpsc::Receiver<DeviceRequest>,
    timeout: Duration,
) {
    while let Some(DeviceRequest { mut packet, reply }) = rx.recv().await {
        {
            // Id assignment, slot install, and the write happen under the
            // send lock so the acknowledgement cannot outrun the install.
            let mut sender = session.sender.lock().await;
            let id = sender.next_message_id();
            packet.header.message_id = u16::from(id);
            packet.set_token(vec![id]);
            *session.inflight.lock().await = Some(InFlight {
                message_id: u16::from(id),
                reply,
            });
            if let Err(e) = sender.send_packet(&packet).await {
                warn!(device_id = %session.device_id, error = %e, "failed to send device request");
                if let Some(inflight) = session.take_inflight().await {
                    let _ = inflight.reply.send(Err(e));
                }
                continue;
            }
        }

        let expiry = tokio::time::sleep(timeout);
        tokio::pin!(expiry);
        loop {
            tokio::select! {
                () = session.inflight_done.notified() => {
                    if session.inflight.lock().await.is_none() {
                        break;
                    }
                }
                () = &mut expiry => {
                    if let Some(inflight) = session.take_inflight().await {
                        warn!(device_id = %session.device_id, "device request timed out");
                        let _ = inflight.reply.send(Err(PodError::RequestTimeout));
                    }
                    break;
                }
            }
        }
    }
}

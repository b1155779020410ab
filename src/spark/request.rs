//! An outbound request queued for delivery to a pod.

use coap_lite::Packet;
use tokio::sync::oneshot;

use crate::error::Result;

/// A CoAP request bound for the device, paired with the single-shot channel
/// that will carry the acknowledgement body (or failure) back to whoever
/// submitted it. Ownership passes to the session's writer task until the
/// matching ACK arrives, a timeout fires, or the session dies.
pub struct DeviceRequest {
    pub packet: Packet,
    pub reply: oneshot::Sender<Result<Vec<u8>>>,
}

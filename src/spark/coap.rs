//! Small helpers around `coap_lite` packets.
//!
//! The pod speaks plain CoAP once the crypto channel is stripped away; this
//! module centralizes the handful of packet shapes the session needs so the
//! dispatch code stays readable.

use coap_lite::{CoapOption, MessageClass, MessageType, Packet, RequestType, ResponseType};

/// The URI path of a packet, `"/"`-prefixed, or `"/"` when it has none.
pub fn path_of(packet: &Packet) -> String {
    match packet.get_option(CoapOption::UriPath) {
        Some(segments) if !segments.is_empty() => {
            let mut path = String::new();
            for segment in segments {
                path.push('/');
                path.push_str(&String::from_utf8_lossy(segment));
            }
            path
        }
        _ => "/".to_string(),
    }
}

/// Empty acknowledgement echoing the incoming message id and token.
pub fn empty_ack(incoming: &Packet) -> Packet {
    let mut ack = Packet::new();
    ack.header.set_type(MessageType::Acknowledgement);
    ack.header.code = MessageClass::Empty;
    ack.header.message_id = incoming.header.message_id;
    ack.set_token(incoming.get_token().to_vec());
    ack
}

/// Content acknowledgement with a payload, echoing message id and token.
pub fn content_ack(incoming: &Packet, payload: Vec<u8>) -> Packet {
    let mut ack = empty_ack(incoming);
    ack.header.code = MessageClass::Response(ResponseType::Content);
    ack.payload = payload;
    ack
}

/// The non-confirmable `POST /h` the server answers a pod hello with.
pub fn hello_reply() -> Packet {
    let mut packet = Packet::new();
    packet.header.set_type(MessageType::NonConfirmable);
    packet.header.code = MessageClass::Request(RequestType::Post);
    packet.add_option(CoapOption::UriPath, b"h".to_vec());
    packet
}

/// Confirmable request to `/<segment>/<segment>/…` with an optional query.
/// Message id and token are filled in at send time.
pub fn request(code: RequestType, segments: &[&str], query: Option<&str>) -> Packet {
    let mut packet = Packet::new();
    packet.header.set_type(MessageType::Confirmable);
    packet.header.code = MessageClass::Request(code);
    for segment in segments {
        packet.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
    }
    if let Some(query) = query {
        packet.add_option(CoapOption::UriQuery, query.as_bytes().to_vec());
    }
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_of_joins_segments() {
        let packet = request(RequestType::Get, &["v", "heatLevelL"], None);
        assert_eq!(path_of(&packet), "/v/heatLevelL");
    }

    #[test]
    fn test_path_of_defaults_to_root() {
        assert_eq!(path_of(&Packet::new()), "/");
    }

    #[test]
    fn test_empty_ack_echoes_id_and_token() {
        let mut incoming = Packet::new();
        incoming.header.set_type(MessageType::Confirmable);
        incoming.header.message_id = 0x1234;
        incoming.set_token(vec![0xAB]);

        let ack = empty_ack(&incoming);
        assert_eq!(ack.header.get_type(), MessageType::Acknowledgement);
        assert_eq!(ack.header.code, MessageClass::Empty);
        assert_eq!(ack.header.message_id, 0x1234);
        assert_eq!(ack.get_token().to_vec(), vec![0xAB]);
    }

    #[test]
    fn test_request_carries_query() {
        let packet = request(RequestType::Post, &["f", "leftHeat"], Some("3600"));
        assert_eq!(path_of(&packet), "/f/leftHeat");
        let query = packet.get_option(CoapOption::UriQuery).unwrap();
        assert_eq!(query.front().unwrap(), b"3600");
    }
}

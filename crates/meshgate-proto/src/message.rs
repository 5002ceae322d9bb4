//! Peer-to-peer protocol messages
//!
//! Payload layout: `[action:u8][errorLen:u8][channelId:u32][body]`. When
//! `errorLen` is non-zero the body is a JSON error object of that length and
//! replaces the action-specific body.

use crate::codec::CodecError;
use crate::fingerprint::ChannelFingerprint;
use crate::routing::RouteAdvertisement;
use crate::{ChannelId, MAX_STREAM_CHUNK};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;
use std::fmt;

/// Largest encoded error body; its length travels in one byte
const MAX_ERROR_BODY: usize = u8::MAX as usize;

/// Action identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Action {
    Hello = 0,
    Open = 1,
    Stream = 2,
    Close = 3,
    AdvRoutes = 4,
}

impl TryFrom<u8> for Action {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Action::Hello),
            1 => Ok(Action::Open),
            2 => Ok(Action::Stream),
            3 => Ok(Action::Close),
            4 => Ok(Action::AdvRoutes),
            _ => Err(CodecError::UnknownAction(value)),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Hello => "hello",
            Action::Open => "open",
            Action::Stream => "stream",
            Action::Close => "close",
            Action::AdvRoutes => "advRoutes",
        };
        f.write_str(name)
    }
}

/// Decoded protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Handshake carrying the sender's role and authentication blob
    Hello { is_gate: bool, auth: Bytes },
    /// Open request (gateway to provider) or its confirmation (provider to gateway)
    Open {
        channel_id: ChannelId,
        gate_port: u16,
        fingerprint: Option<ChannelFingerprint>,
    },
    Stream { channel_id: ChannelId, data: Bytes },
    /// `channel_id == CLOSE_ALL` closes every channel of the sending peer
    Close { channel_id: ChannelId },
    AdvRoutes(RouteAdvertisement),
    /// Error reply standing in for any action's body
    Error {
        action: Action,
        channel_id: ChannelId,
        error: Value,
    },
}

impl Message {
    /// Header size: action (1) + error length (1) + channel id (4)
    pub const HEADER_SIZE: usize = 6;

    /// Build an error reply
    ///
    /// The message is cut until its JSON encoding, escapes included, fits
    /// the one-byte length.
    pub fn error(action: Action, channel_id: ChannelId, message: impl fmt::Display) -> Self {
        let text = message.to_string();
        let mut end = floor_char_boundary(&text, MAX_ERROR_BODY);
        let error = loop {
            let body = serde_json::json!({ "message": &text[..end] });
            let fits = serde_json::to_vec(&body).is_ok_and(|b| b.len() <= MAX_ERROR_BODY);
            if fits || end == 0 {
                break body;
            }
            end = text[..end].char_indices().last().map_or(0, |(i, _)| i);
        };
        Message::Error {
            action,
            channel_id,
            error,
        }
    }

    pub fn action(&self) -> Action {
        match self {
            Message::Hello { .. } => Action::Hello,
            Message::Open { .. } => Action::Open,
            Message::Stream { .. } => Action::Stream,
            Message::Close { .. } => Action::Close,
            Message::AdvRoutes(_) => Action::AdvRoutes,
            Message::Error { action, .. } => *action,
        }
    }

    /// Channel id this message refers to (0 when not applicable)
    pub fn channel_id(&self) -> ChannelId {
        match self {
            Message::Open { channel_id, .. }
            | Message::Stream { channel_id, .. }
            | Message::Close { channel_id }
            | Message::Error { channel_id, .. } => *channel_id,
            Message::Hello { .. } | Message::AdvRoutes(_) => 0,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Message::Error { .. })
    }

    /// Split a payload into stream messages of at most `MAX_STREAM_CHUNK` bytes
    pub fn stream_fragments(channel_id: ChannelId, mut data: Bytes) -> Vec<Message> {
        let mut fragments = Vec::with_capacity(data.len() / MAX_STREAM_CHUNK + 1);
        loop {
            let take = data.len().min(MAX_STREAM_CHUNK);
            let chunk = data.split_to(take);
            fragments.push(Message::Stream {
                channel_id,
                data: chunk,
            });
            if data.is_empty() {
                break;
            }
        }
        fragments
    }

    /// Encode to a frame payload (without the length prefix)
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + 64);

        if let Message::Error {
            action,
            channel_id,
            error,
        } = self
        {
            let body = serde_json::to_vec(error)?;
            if body.is_empty() || body.len() > MAX_ERROR_BODY {
                return Err(CodecError::ErrorBodyTooLarge(body.len()));
            }
            buf.put_u8(*action as u8);
            buf.put_u8(body.len() as u8);
            buf.put_u32(*channel_id);
            buf.put_slice(&body);
            return Ok(buf.freeze());
        }

        buf.put_u8(self.action() as u8);
        buf.put_u8(0);

        match self {
            Message::Hello { is_gate, auth } => {
                buf.put_u32(u32::from(*is_gate));
                buf.put_slice(auth);
            }
            Message::Open {
                channel_id,
                gate_port,
                fingerprint,
            } => {
                buf.put_u32(*channel_id);
                buf.put_u32(u32::from(*gate_port));
                if let Some(fingerprint) = fingerprint {
                    let json = serde_json::to_vec(fingerprint)?;
                    buf.put_u32(json.len() as u32);
                    buf.put_slice(&json);
                }
            }
            Message::Stream { channel_id, data } => {
                buf.reserve(data.len());
                buf.put_u32(*channel_id);
                buf.put_slice(data);
            }
            Message::Close { channel_id } => {
                buf.put_u32(*channel_id);
            }
            Message::AdvRoutes(advertisement) => {
                buf.put_u32(0);
                buf.put_slice(&serde_json::to_vec(advertisement)?);
            }
            Message::Error { .. } => unreachable!("error messages are encoded above"),
        }

        Ok(buf.freeze())
    }

    /// Decode a frame payload
    pub fn decode(mut payload: Bytes) -> Result<Self, CodecError> {
        if payload.len() < Self::HEADER_SIZE {
            return Err(CodecError::Truncated {
                needed: Self::HEADER_SIZE,
                available: payload.len(),
            });
        }

        let action = Action::try_from(payload.get_u8())?;
        let error_len = payload.get_u8() as usize;
        let channel_id = payload.get_u32();

        if error_len > 0 {
            if payload.len() < error_len {
                return Err(CodecError::Truncated {
                    needed: error_len,
                    available: payload.len(),
                });
            }
            let error = serde_json::from_slice(&payload[..error_len])?;
            return Ok(Message::Error {
                action,
                channel_id,
                error,
            });
        }

        let message = match action {
            Action::Hello => Message::Hello {
                is_gate: match channel_id {
                    0 => false,
                    1 => true,
                    other => return Err(CodecError::InvalidRole(other)),
                },
                auth: payload,
            },
            Action::Open => {
                if payload.len() < 4 {
                    return Err(CodecError::Truncated {
                        needed: 4,
                        available: payload.len(),
                    });
                }
                let raw_port = payload.get_u32();
                let gate_port =
                    u16::try_from(raw_port).map_err(|_| CodecError::InvalidPort(raw_port))?;

                // Fingerprint is optional for older senders
                let mut fingerprint = None;
                if payload.len() >= 4 {
                    let len = payload.get_u32() as usize;
                    if len > 0 {
                        if payload.len() < len {
                            return Err(CodecError::Truncated {
                                needed: len,
                                available: payload.len(),
                            });
                        }
                        fingerprint = Some(serde_json::from_slice(&payload[..len])?);
                    }
                }

                Message::Open {
                    channel_id,
                    gate_port,
                    fingerprint,
                }
            }
            Action::Stream => Message::Stream {
                channel_id,
                data: payload,
            },
            Action::Close => Message::Close { channel_id },
            Action::AdvRoutes => Message::AdvRoutes(serde_json::from_slice(&payload)?),
        };

        Ok(message)
    }
}

fn floor_char_boundary(text: &str, max: usize) -> usize {
    if text.len() <= max {
        return text.len();
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{AdvertisedService, Protocol, Service};
    use crate::IngressPolicy;

    fn roundtrip(msg: &Message) -> Message {
        Message::decode(msg.encode().unwrap()).unwrap()
    }

    #[test]
    fn test_hello_reuses_channel_slot_for_role() {
        let msg = Message::Hello {
            is_gate: true,
            auth: Bytes::from_static(&[21, 1, 2, 3]),
        };
        let encoded = msg.encode().unwrap();
        assert_eq!(&encoded[..6], &[0, 0, 0, 0, 0, 1]);
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_open_with_and_without_fingerprint() {
        let bare = Message::Open {
            channel_id: 7,
            gate_port: 9000,
            fingerprint: None,
        };
        assert_eq!(bare.encode().unwrap().len(), Message::HEADER_SIZE + 4);
        assert_eq!(roundtrip(&bare), bare);

        let fingerprint = ChannelFingerprint::new(
            Protocol::Tcp,
            9000,
            7,
            "10.0.0.2:5555".parse().unwrap(),
            "10.0.0.1:9000".parse().unwrap(),
        );
        let full = Message::Open {
            channel_id: 7,
            gate_port: 9000,
            fingerprint: Some(fingerprint),
        };
        assert_eq!(roundtrip(&full), full);
    }

    #[test]
    fn test_open_rejects_out_of_range_port() {
        let mut buf = BytesMut::new();
        buf.put_u8(Action::Open as u8);
        buf.put_u8(0);
        buf.put_u32(1);
        buf.put_u32(70_000);
        assert!(matches!(
            Message::decode(buf.freeze()),
            Err(CodecError::InvalidPort(70_000))
        ));
    }

    #[test]
    fn test_adv_routes_roundtrip() {
        let adv = RouteAdvertisement::new(vec![AdvertisedService {
            service: Service::new(9000, "127.0.0.1", 8080).with_tags("web"),
            ingress_policy: IngressPolicy::new(),
        }]);
        let msg = Message::AdvRoutes(adv);
        assert_eq!(roundtrip(&msg), msg);
        assert_eq!(msg.channel_id(), 0);
    }

    #[test]
    fn test_error_replaces_body() {
        let msg = Message::error(Action::Open, 42, "Service not found");
        let decoded = roundtrip(&msg);
        assert_eq!(decoded.action(), Action::Open);
        assert_eq!(decoded.channel_id(), 42);
        match decoded {
            Message::Error { error, .. } => assert_eq!(error["message"], "Service not found"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_error_text_is_truncated_to_fit() {
        let msg = Message::error(Action::Stream, 1, "é".repeat(400));
        let encoded = msg.encode().unwrap();
        assert!(encoded[1] as usize <= u8::MAX as usize);
        assert!(Message::decode(encoded).unwrap().is_error());
    }

    #[test]
    fn test_escaped_error_text_still_fits() {
        for text in ["\"".repeat(300), "\u{1}".repeat(100), "a\\b\n".repeat(80)] {
            let encoded = Message::error(Action::Open, 9, &text).encode().unwrap();
            assert_eq!(encoded.len(), Message::HEADER_SIZE + encoded[1] as usize);

            match Message::decode(encoded).unwrap() {
                Message::Error { error, .. } => {
                    let kept = error["message"].as_str().unwrap();
                    assert!(!kept.is_empty());
                    assert!(text.starts_with(kept));
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_adv_routes_keep_readable_rules() {
        let body = serde_json::json!({"routes": [{
            "gatePort": 9000,
            "serviceHost": "127.0.0.1",
            "servicePort": 8080,
            "ingressPolicy": {"ips": {
                "10.0.0.1": {"allow": true},
                "10.0.0.2": {"allow": true, "bandwidthLimit": "fast"}
            }}
        }]});
        let mut payload = BytesMut::new();
        payload.put_u8(Action::AdvRoutes as u8);
        payload.put_u8(0);
        payload.put_u32(0);
        payload.put_slice(&serde_json::to_vec(&body).unwrap());

        match Message::decode(payload.freeze()).unwrap() {
            Message::AdvRoutes(adv) => {
                assert_eq!(adv.routes.len(), 1);
                let rules = adv.routes[0].ingress_policy.ip_rules();
                assert_eq!(rules.len(), 1);
                assert_eq!(rules[0].0, "10.0.0.1");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_stream_fragments_split_at_chunk_size() {
        let data = Bytes::from(vec![7u8; MAX_STREAM_CHUNK * 2 + 10]);
        let fragments = Message::stream_fragments(3, data.clone());
        assert_eq!(fragments.len(), 3);

        let mut joined = BytesMut::new();
        for fragment in &fragments {
            match fragment {
                Message::Stream { channel_id, data } => {
                    assert_eq!(*channel_id, 3);
                    assert!(data.len() <= MAX_STREAM_CHUNK);
                    joined.extend_from_slice(data);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(joined.freeze(), data);
    }

    #[test]
    fn test_unknown_action_and_short_header() {
        assert!(matches!(
            Message::decode(Bytes::from_static(&[9, 0, 0, 0, 0, 0])),
            Err(CodecError::UnknownAction(9))
        ));
        assert!(matches!(
            Message::decode(Bytes::from_static(&[1, 0])),
            Err(CodecError::Truncated { .. })
        ));
    }
}

//! Wire formats.
//! Envelopes: one JSON object per message with a `type` discriminator.
//! Control frames: length-prefix (4 bytes LE) + bincode payload.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::protocol::{Envelope, EnvelopeKind, Message, UnknownEnvelope};

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB
const TYPE_KEY: &str = "type";

/// Encode an envelope as a JSON object carrying its `type`.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
    let mut map = match envelope {
        Envelope::Profile(p) => to_map(p)?,
        Envelope::Badge(b) => to_map(b)?,
        Envelope::Photo(p) => to_map(p)?,
        Envelope::Unknown(u) => u.fields.clone(),
    };
    let tag = match envelope {
        Envelope::Unknown(u) => u.kind.clone(),
        other => other.kind().tag().unwrap_or_default().to_string(),
    };
    map.insert(TYPE_KEY.to_string(), Value::String(tag));
    Ok(serde_json::to_vec(&Value::Object(map))?)
}

fn to_map<T: Serialize>(payload: &T) -> Result<Map<String, Value>, EncodeError> {
    match serde_json::to_value(payload)? {
        Value::Object(map) => Ok(map),
        _ => Err(EncodeError::NotAnObject),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload did not serialize to an object")]
    NotAnObject,
}

/// Decode one envelope. Unrecognized `type` values come back as `Envelope::Unknown`.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let mut map = match serde_json::from_slice::<Value>(bytes)? {
        Value::Object(map) => map,
        _ => return Err(DecodeError::NotAnObject),
    };
    let kind = match map.get(TYPE_KEY) {
        Some(Value::String(s)) => s.clone(),
        _ => return Err(DecodeError::MissingType),
    };
    let envelope = match EnvelopeKind::from_tag(&kind) {
        EnvelopeKind::Profile => Envelope::Profile(serde_json::from_value(Value::Object(map))?),
        EnvelopeKind::Badge => Envelope::Badge(serde_json::from_value(Value::Object(map))?),
        EnvelopeKind::Photo => Envelope::Photo(serde_json::from_value(Value::Object(map))?),
        EnvelopeKind::Unknown => {
            map.remove(TYPE_KEY);
            Envelope::Unknown(UnknownEnvelope { kind, fields: map })
        }
    };
    Ok(envelope)
}

/// Every variant means the message is malformed; drop it and keep the session.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("malformed envelope: not a JSON object")]
    NotAnObject,
    #[error("malformed envelope: missing type discriminator")]
    MissingType,
}

/// Encode a control message into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg).map_err(FrameEncodeError::Encode)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes yet.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let len = match frame_len(bytes)? {
        Some(len) => len,
        None => return Err(FrameDecodeError::NeedMore),
    };
    let msg: Message =
        bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len]).map_err(FrameDecodeError::Decode)?;
    Ok((msg, LEN_SIZE + len))
}

/// Payload length of the frame at the front of `bytes`, once all of it has arrived.
pub fn frame_len(bytes: &[u8]) -> Result<Option<usize>, FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Ok(None);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Ok(None);
    }
    Ok(Some(len))
}

/// Largest payload a single frame may carry.
pub const fn max_frame_len() -> usize {
    MAX_FRAME_LEN as usize
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::protocol::{Badge, BadgePayload, PhotoPayload, ProfilePayload, PROTOCOL_VERSION};

    fn profile() -> Envelope {
        Envelope::Profile(ProfilePayload {
            uuid: "A-1".into(),
            to: String::new(),
            nickname: "ann".into(),
            profile_url: Some("https://example.com/ann".into()),
            badges: vec!["GentleMan".into(), "Explorer".into()],
        })
    }

    fn badge() -> Envelope {
        Envelope::Badge(BadgePayload {
            from: "A-1".into(),
            to: "B-1".into(),
            badge: Badge {
                id: "0f4c2a5e-1111-2222-3333-444455556666".into(),
                name: "GentleMan".into(),
                description: "polite and courteous".into(),
                image_ref: "GentleManBadge".into(),
            },
        })
    }

    fn photo() -> Envelope {
        Envelope::Photo(PhotoPayload {
            from: "A-1".into(),
            to: "B-1".into(),
            front_image: vec![0xff, 0xd8, 0x00, 0x01, 0x7f],
            back_image: (0u8..=255).collect(),
            message: "hi".into(),
        })
    }

    #[test]
    fn every_variant_roundtrips() {
        let mut fields = Map::new();
        fields.insert("from".into(), Value::from("A-1"));
        fields.insert("sticker".into(), serde_json::json!({"id": 7, "tags": ["x"]}));
        let unknown = Envelope::Unknown(UnknownEnvelope {
            kind: "sticker".into(),
            fields,
        });
        for env in [profile(), badge(), photo(), unknown] {
            let bytes = encode(&env).unwrap();
            assert_eq!(decode(&bytes).unwrap(), env);
        }
    }

    #[test]
    fn profile_without_url_or_badges() {
        let env = Envelope::Profile(ProfilePayload {
            uuid: "A-1".into(),
            to: String::new(),
            nickname: "ann".into(),
            profile_url: None,
            badges: vec![],
        });
        let bytes = encode(&env).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value.get("profileURL").is_none());
        assert!(value.get("to").is_none());
        assert_eq!(decode(&bytes).unwrap(), env);
    }

    #[test]
    fn rewritten_tag_decodes_as_unknown() {
        for env in [profile(), badge(), photo()] {
            let bytes = encode(&env).unwrap();
            let mut value: Value = serde_json::from_slice(&bytes).unwrap();
            let original = value.as_object().unwrap().clone();
            value["type"] = Value::from("hologram");
            let rewritten = serde_json::to_vec(&value).unwrap();
            match decode(&rewritten).unwrap() {
                Envelope::Unknown(u) => {
                    assert_eq!(u.kind, "hologram");
                    for (k, v) in original.iter().filter(|(k, _)| k.as_str() != "type") {
                        assert_eq!(u.fields.get(k), Some(v));
                    }
                    assert!(!u.fields.contains_key("type"));
                }
                other => panic!("expected Unknown, got {:?}", other),
            }
        }
    }

    #[test]
    fn photo_wire_shape_matches_app() {
        let json = br#"{"type":"photo","from":"A-1","to":"B-1","frontImage":"AQID","backImage":"BAU=","message":"hi"}"#;
        match decode(json).unwrap() {
            Envelope::Photo(p) => {
                assert_eq!(p.front_image, vec![1, 2, 3]);
                assert_eq!(p.back_image, vec![4, 5]);
                assert_eq!(p.message, "hi");
            }
            other => panic!("expected Photo, got {:?}", other),
        }
    }

    #[test]
    fn malformed_inputs() {
        assert!(matches!(decode(b"{not json"), Err(DecodeError::Malformed(_))));
        assert!(matches!(decode(b"[1,2]"), Err(DecodeError::NotAnObject)));
        assert!(matches!(decode(br#"{"uuid":"A"}"#), Err(DecodeError::MissingType)));
        assert!(matches!(decode(br#"{"type":7}"#), Err(DecodeError::MissingType)));
        // Known type, missing required field.
        assert!(matches!(
            decode(br#"{"type":"profile","nickname":"x"}"#),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            decode(br#"{"type":"photo","from":"A","frontImage":"!!","backImage":""}"#),
            Err(DecodeError::Malformed(_))
        ));
    }

    fn sample_beacon() -> Message {
        let kp = Keypair::generate();
        Message::Beacon {
            protocol_version: PROTOCOL_VERSION,
            service: "shkshare".into(),
            handle: kp.handle(),
            display_name: "pixel".into(),
            public_key: kp.public_key().clone(),
            listen_port: 45679,
        }
    }

    #[test]
    fn roundtrip_beacon() {
        let msg = sample_beacon();
        let frame = encode_frame(&msg).unwrap();
        let (decoded, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        match (&msg, &decoded) {
            (
                Message::Beacon {
                    handle: h1,
                    service: s1,
                    ..
                },
                Message::Beacon {
                    handle: h2,
                    service: s2,
                    ..
                },
            ) => {
                assert_eq!(h1, h2);
                assert_eq!(s1, s2);
            }
            _ => panic!("expected Beacon"),
        }
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_beacon()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..super::LEN_SIZE]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(frame_len(&frame[..frame.len() - 1]), Ok(None)));
    }

    #[test]
    fn oversized_length_rejected() {
        let mut bytes = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 8]);
        assert!(matches!(decode_frame(&bytes), Err(FrameDecodeError::TooLarge)));
    }

    #[test]
    fn multiple_frames() {
        let a = sample_beacon();
        let b = Message::Leave {
            handle: Keypair::generate().handle(),
        };
        let fa = encode_frame(&a).unwrap();
        let fb = encode_frame(&b).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, fa.len());
        let (m2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert!(matches!(m1, Message::Beacon { .. }));
        assert!(matches!(m2, Message::Leave { .. }));
    }
}

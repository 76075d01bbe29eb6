//! ShakeShare protocol types: application envelopes and link control messages.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::identity::{PeerHandle, PublicKey};

/// Current link protocol version. Used in beacons and the channel hello.
pub const PROTOCOL_VERSION: u8 = 1;

/// Service token peers advertise under unless configured otherwise.
pub const DEFAULT_SERVICE_TYPE: &str = "shkshare";

/// A badge one user awards another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Badge {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub image_ref: String,
}

impl Badge {
    /// Badge for a name seen only in a profile summary. The id is stable per name.
    pub fn from_name(name: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, name.as_bytes()).to_string(),
            name: name.to_string(),
            description: String::new(),
            image_ref: String::new(),
        }
    }
}

/// Sent automatically by both sides as soon as a session comes up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilePayload {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to: String,
    pub nickname: String,
    #[serde(default, rename = "profileURL", skip_serializing_if = "Option::is_none")]
    pub profile_url: Option<String>,
    /// Badge names only; full badges travel in `badge` envelopes.
    #[serde(default)]
    pub badges: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadgePayload {
    pub from: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to: String,
    pub badge: Badge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoPayload {
    pub from: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to: String,
    #[serde(with = "base64_bytes")]
    pub front_image: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub back_image: Vec<u8>,
    #[serde(default)]
    pub message: String,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(v))
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s: String = Deserialize::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// An envelope whose `type` this build does not know. Kept whole so nothing is lost.
#[derive(Debug, Clone, PartialEq)]
pub struct UnknownEnvelope {
    pub kind: String,
    /// Every field except `type`.
    pub fields: Map<String, Value>,
}

impl UnknownEnvelope {
    fn str_field(&self, key: &str) -> &str {
        self.fields.get(key).and_then(Value::as_str).unwrap_or("")
    }
}

/// One application message exchanged over a session.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Profile(ProfilePayload),
    Badge(BadgePayload),
    Photo(PhotoPayload),
    Unknown(UnknownEnvelope),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Profile,
    Badge,
    Photo,
    Unknown,
}

impl EnvelopeKind {
    /// Wire discriminator; `None` for `Unknown`, which keeps the sender's tag.
    pub fn tag(self) -> Option<&'static str> {
        match self {
            EnvelopeKind::Profile => Some("profile"),
            EnvelopeKind::Badge => Some("badge"),
            EnvelopeKind::Photo => Some("photo"),
            EnvelopeKind::Unknown => None,
        }
    }

    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "profile" => EnvelopeKind::Profile,
            "badge" => EnvelopeKind::Badge,
            "photo" => EnvelopeKind::Photo,
            _ => EnvelopeKind::Unknown,
        }
    }
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Profile(_) => EnvelopeKind::Profile,
            Envelope::Badge(_) => EnvelopeKind::Badge,
            Envelope::Photo(_) => EnvelopeKind::Photo,
            Envelope::Unknown(_) => EnvelopeKind::Unknown,
        }
    }

    /// Sender application UUID.
    pub fn sender(&self) -> &str {
        match self {
            Envelope::Profile(p) => &p.uuid,
            Envelope::Badge(b) => &b.from,
            Envelope::Photo(p) => &p.from,
            Envelope::Unknown(u) => match u.fields.get("from").and_then(Value::as_str) {
                Some(from) => from,
                None => u.str_field("uuid"),
            },
        }
    }

    /// Recipient application UUID; empty means everyone in the session.
    pub fn recipient(&self) -> &str {
        match self {
            Envelope::Profile(p) => &p.to,
            Envelope::Badge(b) => &b.to,
            Envelope::Photo(p) => &p.to,
            Envelope::Unknown(u) => u.str_field("to"),
        }
    }
}

/// Link control messages: discovery beacons and the channel handshake.
/// Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Advertise presence under a service token.
    Beacon {
        protocol_version: u8,
        service: String,
        handle: PeerHandle,
        display_name: String,
        public_key: PublicKey,
        listen_port: u16,
    },
    /// Graceful stop of advertising; browsers may drop us at once.
    Leave { handle: PeerHandle },
    /// Invitation: first frame on a new channel, sent by the inviter.
    Hello {
        protocol_version: u8,
        service: String,
        handle: PeerHandle,
        display_name: String,
        public_key: PublicKey,
    },
    /// Answer to `Hello`. When `accepted` is false the channel is closed right after.
    Welcome {
        accepted: bool,
        handle: PeerHandle,
        display_name: String,
        public_key: PublicKey,
    },
}

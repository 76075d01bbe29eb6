//! ShakeShare peer session core.
//! Discovery, one session per peer, the profile/badge/photo exchange, all driven
//! through a single serialized session manager. Platforms plug in through `Link`.

pub mod config;
pub mod directory;
pub mod discovery;
pub mod identity;
pub mod link;
pub mod manager;
pub mod protocol;
pub mod router;
pub mod session;
pub mod store;
pub mod wire;

#[cfg(test)]
mod sim;

pub use config::{Config, ConfigError};
pub use directory::{ConnectionState, PeerDirectory, PeerRecord};
pub use identity::{Keypair, PeerHandle, PeerIdentity, PublicKey};
pub use link::{ChannelFault, Link, LinkEvent, LinkState};
pub use manager::{Delivery, LinkSink, ManagerError, ManagerHandle, SessionManager, Stores};
pub use protocol::{Badge, Envelope, EnvelopeKind, Message, PROTOCOL_VERSION};
pub use router::{AppEvent, LocalProfile, RegistrationError};
pub use session::{ConnectError, SendError, SessionHandle, SessionId, SessionInfo};
pub use store::{AlbumPhoto, AlbumStore, Friend, FriendStore, PersistedIdentity, StoreError};
pub use wire::{decode, decode_frame, encode, encode_frame, DecodeError, FrameDecodeError, FrameEncodeError};

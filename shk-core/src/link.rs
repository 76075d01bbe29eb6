//! The platform seam: a reliable, encrypted point-to-point channel plus radio discovery.
//! Hosts implement `Link` and post `LinkEvent`s back through the manager handle.

use std::time::Duration;

use crate::identity::PeerIdentity;

/// Calls into the platform. None of them may block; outcomes arrive later as `LinkEvent`s.
pub trait Link: Send + Sync {
    fn start_advertising(&self, service: &str);
    fn stop_advertising(&self);
    fn start_browsing(&self, service: &str);
    fn stop_browsing(&self);
    /// Ask `peer` to open a channel. The platform gives up after `timeout`.
    fn invite(&self, peer: &PeerIdentity, timeout: Duration);
    fn respond_to_invitation(&self, peer: &PeerIdentity, accept: bool);
    /// Queue `bytes` on the channel to `peer`. Delivery is in order per peer.
    fn send(&self, peer: &PeerIdentity, bytes: Vec<u8>) -> Result<(), ChannelFault>;
    fn disconnect(&self, peer: &PeerIdentity);
}

/// Channel-level condition of one peer as the platform reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    NotConnected,
}

/// Callbacks from the platform. All of them are serialized through the manager.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    PeerFound { peer: PeerIdentity, service: String },
    PeerLost { peer: PeerIdentity },
    InvitationReceived { peer: PeerIdentity },
    StateChanged { peer: PeerIdentity, state: LinkState },
    Received { peer: PeerIdentity, bytes: Vec<u8> },
}

impl LinkEvent {
    pub fn peer(&self) -> &PeerIdentity {
        match self {
            LinkEvent::PeerFound { peer, .. }
            | LinkEvent::PeerLost { peer }
            | LinkEvent::InvitationReceived { peer }
            | LinkEvent::StateChanged { peer, .. }
            | LinkEvent::Received { peer, .. } => peer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelFault {
    #[error("channel to peer is not connected")]
    NotConnected,
    #[error("channel writer has shut down")]
    WriterClosed,
    #[error("channel io: {0}")]
    Io(String),
}

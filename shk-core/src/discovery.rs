//! Discovery service: advertise, browse, and decide what to do with found peers
//! and invitations. Radio toggles go straight to the link; timing lives in the manager.

use std::sync::Arc;

use crate::directory::{ConnectionState, PeerDirectory};
use crate::identity::{PeerHandle, PeerIdentity};
use crate::link::Link;
use crate::session::SessionTransport;

/// Identifies one discovery burst; only the latest burst may stop the radios.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstTicket(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoundAction {
    Invite,
    Ignore(IgnoreReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    NotBrowsing,
    ForeignService,
    OwnAdvert,
    /// Record exists and is not disconnected, or a session is in flight.
    AlreadyKnown(Option<ConnectionState>),
}

pub struct DiscoveryService {
    link: Arc<dyn Link>,
    service_type: String,
    local: PeerHandle,
    advertising: bool,
    browsing: bool,
    burst: u64,
}

impl DiscoveryService {
    pub fn new(link: Arc<dyn Link>, service_type: impl Into<String>, local: PeerHandle) -> Self {
        Self {
            link,
            service_type: service_type.into(),
            local,
            advertising: false,
            browsing: false,
            burst: 0,
        }
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising
    }

    pub fn is_browsing(&self) -> bool {
        self.browsing
    }

    pub fn start_advertising(&mut self) {
        if !self.advertising {
            self.link.start_advertising(&self.service_type);
            self.advertising = true;
            tracing::debug!(service = %self.service_type, "advertising started");
        }
    }

    pub fn stop_advertising(&mut self) {
        if self.advertising {
            self.link.stop_advertising();
            self.advertising = false;
            tracing::debug!("advertising stopped");
        }
    }

    pub fn start_browsing(&mut self) {
        if !self.browsing {
            self.link.start_browsing(&self.service_type);
            self.browsing = true;
            tracing::debug!(service = %self.service_type, "browsing started");
        }
    }

    pub fn stop_browsing(&mut self) {
        if self.browsing {
            self.link.stop_browsing();
            self.browsing = false;
            tracing::debug!("browsing stopped");
        }
    }

    /// Start both radios. The caller stops them with `end_burst` once the burst elapses.
    pub fn begin_burst(&mut self) -> BurstTicket {
        self.start_advertising();
        self.start_browsing();
        self.burst += 1;
        BurstTicket(self.burst)
    }

    /// Stop both radios if `ticket` is still the latest burst.
    pub fn end_burst(&mut self, ticket: BurstTicket) -> bool {
        if ticket.0 != self.burst {
            return false;
        }
        self.stop_advertising();
        self.stop_browsing();
        true
    }

    pub fn stop_all(&mut self) {
        self.burst += 1;
        self.stop_advertising();
        self.stop_browsing();
    }

    /// Auto-invite peers we have no live relationship with.
    pub fn on_peer_found(
        &self,
        peer: &PeerIdentity,
        service: &str,
        directory: &PeerDirectory,
        sessions: &SessionTransport,
    ) -> FoundAction {
        if !self.browsing {
            return FoundAction::Ignore(IgnoreReason::NotBrowsing);
        }
        if service != self.service_type {
            return FoundAction::Ignore(IgnoreReason::ForeignService);
        }
        if peer.handle == self.local {
            return FoundAction::Ignore(IgnoreReason::OwnAdvert);
        }
        let state = directory.state(peer);
        let free = matches!(state, None | Some(ConnectionState::Disconnected));
        if !free || sessions.has_session(peer) {
            return FoundAction::Ignore(IgnoreReason::AlreadyKnown(state));
        }
        FoundAction::Invite
    }

    /// Open acceptance: every invitation is accepted.
    pub fn on_invitation(&self, _peer: &PeerIdentity) -> bool {
        true
    }

    /// A lost peer is forgotten only if it never got connected.
    pub fn should_forget(&self, peer: &PeerIdentity, directory: &PeerDirectory) -> bool {
        matches!(
            directory.state(peer),
            Some(ConnectionState::Discovered | ConnectionState::Invited)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkState;
    use crate::sim::{LinkCall, RecordingLink};

    fn setup() -> (Arc<RecordingLink>, DiscoveryService, SessionTransport) {
        let link = Arc::new(RecordingLink::default());
        let disc = DiscoveryService::new(link.clone(), "shkshare", PeerHandle::random());
        let sessions = SessionTransport::new(link.clone());
        (link, disc, sessions)
    }

    #[test]
    fn radio_toggles_are_idempotent() {
        let (link, mut d, _) = setup();
        d.start_advertising();
        d.start_advertising();
        d.stop_advertising();
        d.stop_advertising();
        assert_eq!(
            link.calls(),
            vec![
                LinkCall::StartAdvertising("shkshare".into()),
                LinkCall::StopAdvertising
            ]
        );
    }

    #[test]
    fn newer_burst_supersedes_older() {
        let (_link, mut d, _) = setup();
        let first = d.begin_burst();
        let second = d.begin_burst();
        assert!(!d.end_burst(first));
        assert!(d.is_browsing() && d.is_advertising());
        assert!(d.end_burst(second));
        assert!(!d.is_browsing() && !d.is_advertising());
    }

    #[test]
    fn found_peer_rules() {
        let (_link, mut d, mut sessions) = setup();
        let mut dir = PeerDirectory::new();
        let p = PeerIdentity::new("p", PeerHandle::random());

        assert_eq!(
            d.on_peer_found(&p, "shkshare", &dir, &sessions),
            FoundAction::Ignore(IgnoreReason::NotBrowsing)
        );
        d.start_browsing();
        assert_eq!(
            d.on_peer_found(&p, "othersvc", &dir, &sessions),
            FoundAction::Ignore(IgnoreReason::ForeignService)
        );
        assert_eq!(
            d.on_peer_found(&p, "shkshare", &dir, &sessions),
            FoundAction::Invite
        );

        dir.upsert(&p, ConnectionState::Connected);
        sessions.on_state(&p, LinkState::Connected);
        assert!(matches!(
            d.on_peer_found(&p, "shkshare", &dir, &sessions),
            FoundAction::Ignore(IgnoreReason::AlreadyKnown(Some(ConnectionState::Connected)))
        ));

        dir.upsert(&p, ConnectionState::Disconnected);
        sessions.on_state(&p, LinkState::NotConnected);
        assert_eq!(
            d.on_peer_found(&p, "shkshare", &dir, &sessions),
            FoundAction::Invite
        );
    }

    #[test]
    fn own_advert_ignored() {
        let link = Arc::new(RecordingLink::default());
        let me = PeerHandle::random();
        let mut d = DiscoveryService::new(link.clone(), "shkshare", me);
        d.start_browsing();
        let sessions = SessionTransport::new(link);
        let dir = PeerDirectory::new();
        assert_eq!(
            d.on_peer_found(&PeerIdentity::new("me", me), "shkshare", &dir, &sessions),
            FoundAction::Ignore(IgnoreReason::OwnAdvert)
        );
    }

    #[test]
    fn lost_only_forgets_unconnected() {
        let (_link, d, _) = setup();
        let mut dir = PeerDirectory::new();
        let p = PeerIdentity::new("p", PeerHandle::random());
        dir.upsert(&p, ConnectionState::Invited);
        assert!(d.should_forget(&p, &dir));
        dir.upsert(&p, ConnectionState::Connected);
        assert!(!d.should_forget(&p, &dir));
        dir.upsert(&p, ConnectionState::Disconnected);
        assert!(!d.should_forget(&p, &dir));
    }
}

//! Message router: classifies incoming envelopes, runs the profile/badge/photo
//! exchange against the app's stores, then hands envelopes to registered handlers.
//!
//! Relationship per remote app uuid:
//!
//! ```text
//! Unknown --profile--> Known (already a friend: merge badges, update URL)
//! Unknown --profile--> PendingRegistration (stage badges, ask for a nickname)
//! PendingRegistration --confirm_registration--> Known
//! Known --badge/photo--> Known (merge badge by id, append photos)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::broadcast;

use crate::directory::{ConnectionState, PeerDirectory};
use crate::identity::PeerIdentity;
use crate::protocol::{Badge, BadgePayload, Envelope, EnvelopeKind, PhotoPayload, ProfilePayload};
use crate::session::ConnectError;
use crate::store::{AlbumPhoto, AlbumStore, Friend, FriendStore, StoreError};

/// Custom envelope handler, run after the built-in exchange logic.
pub type Handler = Box<dyn FnMut(&PeerIdentity, &Envelope) + Send>;

/// Everything the application layer observes.
#[derive(Debug, Clone)]
pub enum AppEvent {
    PeerStateChanged {
        peer: PeerIdentity,
        state: ConnectionState,
    },
    /// An automatic invitation (from discovery) did not lead to a session.
    ConnectFailed {
        peer: PeerIdentity,
        error: ConnectError,
    },
    ProfileExchanged {
        peer_uuid: String,
        nickname: String,
        profile_url: Option<String>,
        badges: Vec<String>,
        /// Already a friend; badges and URL were merged.
        known: bool,
    },
    /// Ask the user for a nickname, then call `confirm_registration`.
    RegistrationRequested {
        peer_uuid: String,
        suggested_nickname: String,
    },
    FriendRegistered {
        friend: Friend,
    },
    BadgeReceived {
        peer_uuid: String,
        badge: Badge,
    },
    PhotoReceived {
        peer_uuid: String,
        front: Vec<u8>,
        back: Vec<u8>,
        caption: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relationship {
    PendingRegistration,
    Known,
}

/// What this device tells every peer during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalProfile {
    pub user_uuid: String,
    pub nickname: String,
    pub profile_url: Option<String>,
    pub badges: Vec<Badge>,
}

impl LocalProfile {
    pub fn envelope(&self) -> Envelope {
        Envelope::Profile(ProfilePayload {
            uuid: self.user_uuid.clone(),
            to: String::new(),
            nickname: self.nickname.clone(),
            profile_url: self.profile_url.clone(),
            badges: self.badges.iter().map(|b| b.name.clone()).collect(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Handled,
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NotInitialized,
    MissingSender,
    Loopback,
    NotForUs,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("no registration pending for {0}")]
    NotPending(String),
    #[error("nickname {0:?} already in use")]
    NicknameTaken(String),
    #[error("friend store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Default)]
struct Staged {
    nickname: String,
    profile_url: Option<String>,
    badges: Vec<Badge>,
}

impl Staged {
    fn stage_badge(&mut self, badge: Badge) -> bool {
        if self.badges.iter().any(|b| b.id == badge.id) {
            return false;
        }
        self.badges.push(badge);
        true
    }
}

pub struct MessageRouter {
    local_uuid: String,
    friends: Arc<dyn FriendStore>,
    album: Arc<dyn AlbumStore>,
    events: broadcast::Sender<AppEvent>,
    handlers: HashMap<EnvelopeKind, Vec<Handler>>,
    relationships: HashMap<String, Relationship>,
    staged: HashMap<String, Staged>,
}

impl MessageRouter {
    pub fn new(
        local_uuid: impl Into<String>,
        friends: Arc<dyn FriendStore>,
        album: Arc<dyn AlbumStore>,
        events: broadcast::Sender<AppEvent>,
    ) -> Self {
        Self {
            local_uuid: local_uuid.into(),
            friends,
            album,
            events,
            handlers: HashMap::new(),
            relationships: HashMap::new(),
            staged: HashMap::new(),
        }
    }

    pub fn set_local_uuid(&mut self, uuid: impl Into<String>) {
        self.local_uuid = uuid.into();
    }

    pub fn register_handler(&mut self, kind: EnvelopeKind, handler: Handler) {
        self.handlers.entry(kind).or_default().push(handler);
    }

    pub fn emit(&self, event: AppEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn relationship(&self, uuid: &str) -> Option<Relationship> {
        if let Some(r) = self.relationships.get(uuid) {
            return Some(*r);
        }
        self.friends.has_friend(uuid).then_some(Relationship::Known)
    }

    /// Badges staged for a peer that is not a friend yet.
    pub fn staged_badges(&self, uuid: &str) -> Vec<Badge> {
        self.staged
            .get(uuid)
            .map(|s| s.badges.clone())
            .unwrap_or_default()
    }

    pub fn dispatch(
        &mut self,
        from: &PeerIdentity,
        envelope: Envelope,
        directory: &mut PeerDirectory,
    ) -> Dispatched {
        if self.local_uuid.is_empty() {
            debug_assert!(false, "envelope dispatched before local identity was set");
            tracing::error!(peer = %from, "dispatch before local identity is set; dropping");
            return Dispatched::Dropped(DropReason::NotInitialized);
        }
        let sender = envelope.sender().to_string();
        if sender.is_empty() {
            tracing::warn!(peer = %from, kind = ?envelope.kind(), "envelope without sender uuid");
            return Dispatched::Dropped(DropReason::MissingSender);
        }
        if sender == self.local_uuid {
            tracing::debug!(peer = %from, "dropping envelope carrying our own uuid");
            return Dispatched::Dropped(DropReason::Loopback);
        }
        let to = envelope.recipient();
        if !to.is_empty() && to != self.local_uuid {
            tracing::debug!(peer = %from, to, "envelope addressed to someone else");
            return Dispatched::Dropped(DropReason::NotForUs);
        }

        match &envelope {
            Envelope::Profile(p) => self.on_profile(from, p, directory),
            Envelope::Badge(b) => self.on_badge(b),
            Envelope::Photo(p) => self.on_photo(p),
            Envelope::Unknown(u) => {
                if !self.handlers.contains_key(&EnvelopeKind::Unknown) {
                    tracing::info!(peer = %from, kind = %u.kind, "unhandled envelope type");
                }
            }
        }

        if let Some(handlers) = self.handlers.get_mut(&envelope.kind()) {
            for handler in handlers.iter_mut() {
                handler(from, &envelope);
            }
        }
        Dispatched::Handled
    }

    fn on_profile(&mut self, from: &PeerIdentity, p: &ProfilePayload, directory: &mut PeerDirectory) {
        let merged = directory.record_profile(from, &p.uuid, &p.nickname, p.profile_url.as_deref());
        if !merged.is_empty() {
            tracing::debug!(peer = %from, uuid = %p.uuid, merged = merged.len(), "peer reconnected under new handle");
        }
        let badges: Vec<Badge> = p.badges.iter().map(|n| Badge::from_name(n)).collect();

        match self.relationship(&p.uuid) {
            Some(Relationship::Known) => {
                self.relationships.insert(p.uuid.clone(), Relationship::Known);
                if let Err(e) = self.friends.append_badges(&p.uuid, &badges) {
                    tracing::warn!(uuid = %p.uuid, error = %e, "merging profile badges failed");
                }
                if let Some(url) = p.profile_url.as_deref() {
                    if let Err(e) = self.friends.update_profile_url(&p.uuid, Some(url)) {
                        tracing::warn!(uuid = %p.uuid, error = %e, "updating profile url failed");
                    }
                }
                tracing::info!(uuid = %p.uuid, nickname = %p.nickname, "friend info updated");
                self.emit_profile(p, true);
            }
            pending => {
                let staged = self.staged.entry(p.uuid.clone()).or_default();
                staged.nickname = p.nickname.clone();
                staged.profile_url = p.profile_url.clone();
                for badge in badges {
                    staged.stage_badge(badge);
                }
                self.relationships
                    .insert(p.uuid.clone(), Relationship::PendingRegistration);
                tracing::info!(uuid = %p.uuid, nickname = %p.nickname, "profile from new peer");
                self.emit_profile(p, false);
                if pending.is_none() {
                    self.emit(AppEvent::RegistrationRequested {
                        peer_uuid: p.uuid.clone(),
                        suggested_nickname: p.nickname.clone(),
                    });
                }
            }
        }
    }

    fn emit_profile(&self, p: &ProfilePayload, known: bool) {
        self.emit(AppEvent::ProfileExchanged {
            peer_uuid: p.uuid.clone(),
            nickname: p.nickname.clone(),
            profile_url: p.profile_url.clone(),
            badges: p.badges.clone(),
            known,
        });
    }

    fn on_badge(&mut self, b: &BadgePayload) {
        let added = match self.relationship(&b.from) {
            Some(Relationship::Known) => {
                match self.friends.append_badges(&b.from, std::slice::from_ref(&b.badge)) {
                    Ok(n) => n > 0,
                    Err(e) => {
                        tracing::warn!(uuid = %b.from, error = %e, "storing badge failed");
                        false
                    }
                }
            }
            _ => self
                .staged
                .entry(b.from.clone())
                .or_default()
                .stage_badge(b.badge.clone()),
        };
        if !added {
            tracing::debug!(uuid = %b.from, badge = %b.badge.id, "badge already held");
            return;
        }
        tracing::info!(uuid = %b.from, badge = %b.badge.name, "badge received");
        self.emit(AppEvent::BadgeReceived {
            peer_uuid: b.from.clone(),
            badge: b.badge.clone(),
        });
    }

    fn on_photo(&mut self, p: &PhotoPayload) {
        let received_at = SystemTime::now();
        for image in [&p.front_image, &p.back_image] {
            let photo = AlbumPhoto {
                sender_uuid: p.from.clone(),
                image: image.clone(),
                message: p.message.clone(),
                received_at,
            };
            if let Err(e) = self.album.add_photo(photo) {
                tracing::warn!(uuid = %p.from, error = %e, "storing photo failed");
            }
        }
        tracing::info!(uuid = %p.from, bytes = p.front_image.len() + p.back_image.len(), "photo received");
        self.emit(AppEvent::PhotoReceived {
            peer_uuid: p.from.clone(),
            front: p.front_image.clone(),
            back: p.back_image.clone(),
            caption: p.message.clone(),
        });
    }

    /// Finish a pending registration with the nickname the user chose.
    pub fn confirm_registration(&mut self, uuid: &str, nickname: &str) -> Result<Friend, RegistrationError> {
        if self.relationships.get(uuid) != Some(&Relationship::PendingRegistration) {
            return Err(RegistrationError::NotPending(uuid.to_string()));
        }
        if self.friends.nickname_taken(nickname) {
            return Err(RegistrationError::NicknameTaken(nickname.to_string()));
        }
        let staged = self.staged.remove(uuid).unwrap_or_default();
        let friend = Friend {
            uuid: uuid.to_string(),
            nickname: nickname.to_string(),
            profile_url: staged.profile_url.clone(),
            badges: staged.badges.clone(),
        };
        if let Err(e) = self.friends.register(friend.clone()) {
            self.staged.insert(uuid.to_string(), staged);
            return Err(match e {
                StoreError::DuplicateNickname(n) => RegistrationError::NicknameTaken(n),
                other => RegistrationError::Store(other),
            });
        }
        self.relationships
            .insert(uuid.to_string(), Relationship::Known);
        tracing::info!(uuid, nickname, "friend registered");
        self.emit(AppEvent::FriendRegistered {
            friend: friend.clone(),
        });
        Ok(friend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerHandle;
    use crate::protocol::UnknownEnvelope;
    use crate::store::{MemoryAlbumStore, MemoryFriendStore};
    use std::sync::Mutex;

    struct Fixture {
        router: MessageRouter,
        dir: PeerDirectory,
        friends: MemoryFriendStore,
        album: MemoryAlbumStore,
        events: broadcast::Receiver<AppEvent>,
        peer: PeerIdentity,
    }

    fn fixture() -> Fixture {
        let friends = MemoryFriendStore::new();
        let album = MemoryAlbumStore::new();
        let (tx, events) = broadcast::channel(64);
        let router = MessageRouter::new("B-1", Arc::new(friends.clone()), Arc::new(album.clone()), tx);
        let peer = PeerIdentity::new("alice-phone", PeerHandle::random());
        let mut dir = PeerDirectory::new();
        dir.upsert(&peer, ConnectionState::Connected);
        Fixture {
            router,
            dir,
            friends,
            album,
            events,
            peer,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<AppEvent>) -> Vec<AppEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn profile(uuid: &str, nickname: &str, badges: &[&str]) -> Envelope {
        Envelope::Profile(ProfilePayload {
            uuid: uuid.into(),
            to: String::new(),
            nickname: nickname.into(),
            profile_url: Some(format!("https://example.com/{}", nickname)),
            badges: badges.iter().map(|s| s.to_string()).collect(),
        })
    }

    fn badge_env(from: &str, badge: Badge) -> Envelope {
        Envelope::Badge(BadgePayload {
            from: from.into(),
            to: "B-1".into(),
            badge,
        })
    }

    #[test]
    fn new_peer_profile_requests_registration() {
        let mut f = fixture();
        let d = f.router.dispatch(&f.peer, profile("A-1", "ann", &["GentleMan"]), &mut f.dir);
        assert_eq!(d, Dispatched::Handled);
        assert_eq!(f.router.relationship("A-1"), Some(Relationship::PendingRegistration));
        let events = drain(&mut f.events);
        assert!(matches!(&events[0], AppEvent::ProfileExchanged { known: false, nickname, .. } if nickname == "ann"));
        assert!(matches!(&events[1], AppEvent::RegistrationRequested { peer_uuid, .. } if peer_uuid == "A-1"));
        assert_eq!(f.dir.get(&f.peer).unwrap().app_uuid.as_deref(), Some("A-1"));
    }

    #[test]
    fn registration_attaches_staged_badges() {
        let mut f = fixture();
        f.router.dispatch(&f.peer, profile("A-1", "ann", &["GentleMan"]), &mut f.dir);
        let extra = Badge::from_name("Explorer");
        f.router.dispatch(&f.peer, badge_env("A-1", extra.clone()), &mut f.dir);
        let friend = f.router.confirm_registration("A-1", "Annie").unwrap();
        assert_eq!(friend.badges, vec![Badge::from_name("GentleMan"), extra]);
        assert_eq!(friend.profile_url.as_deref(), Some("https://example.com/ann"));
        assert_eq!(f.router.relationship("A-1"), Some(Relationship::Known));
        assert!(f.friends.has_friend("A-1"));
        assert!(f.router.staged_badges("A-1").is_empty());
    }

    #[test]
    fn registration_errors() {
        let mut f = fixture();
        assert!(matches!(
            f.router.confirm_registration("A-1", "x"),
            Err(RegistrationError::NotPending(_))
        ));
        f.friends
            .register(Friend {
                uuid: "C-1".into(),
                nickname: "taken".into(),
                profile_url: None,
                badges: vec![],
            })
            .unwrap();
        f.router.dispatch(&f.peer, profile("A-1", "ann", &[]), &mut f.dir);
        assert!(matches!(
            f.router.confirm_registration("A-1", "taken"),
            Err(RegistrationError::NicknameTaken(_))
        ));
        // Still pending after a failed attempt.
        assert!(f.router.confirm_registration("A-1", "ann").is_ok());
    }

    #[test]
    fn known_friend_profile_merges() {
        let mut f = fixture();
        f.friends
            .register(Friend {
                uuid: "A-1".into(),
                nickname: "ann".into(),
                profile_url: None,
                badges: vec![Badge::from_name("GentleMan")],
            })
            .unwrap();
        f.router.dispatch(&f.peer, profile("A-1", "ann2", &["GentleMan", "Explorer"]), &mut f.dir);
        let friend = f.friends.friend("A-1").unwrap();
        assert_eq!(friend.badges.len(), 2);
        assert_eq!(friend.profile_url.as_deref(), Some("https://example.com/ann2"));
        let events = drain(&mut f.events);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], AppEvent::ProfileExchanged { known: true, .. }));
    }

    #[test]
    fn second_profile_nickname_wins() {
        let mut f = fixture();
        f.router.dispatch(&f.peer, profile("A-1", "ann", &[]), &mut f.dir);
        f.router.dispatch(&f.peer, profile("A-1", "annie", &[]), &mut f.dir);
        let records = f.dir.find_by_app_uuid("A-1");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].nickname.as_deref(), Some("annie"));
        // Prompt only once.
        let prompts = drain(&mut f.events)
            .into_iter()
            .filter(|e| matches!(e, AppEvent::RegistrationRequested { .. }))
            .count();
        assert_eq!(prompts, 1);
        let friend = f.router.confirm_registration("A-1", "A").unwrap();
        assert_eq!(friend.profile_url.as_deref(), Some("https://example.com/annie"));
    }

    #[test]
    fn duplicate_badge_does_not_grow_list() {
        let mut f = fixture();
        f.friends
            .register(Friend {
                uuid: "A-1".into(),
                nickname: "ann".into(),
                profile_url: None,
                badges: vec![],
            })
            .unwrap();
        let badge = Badge::from_name("GentleMan");
        f.router.dispatch(&f.peer, badge_env("A-1", badge.clone()), &mut f.dir);
        f.router.dispatch(&f.peer, badge_env("A-1", badge), &mut f.dir);
        assert_eq!(f.friends.friend("A-1").unwrap().badges.len(), 1);
        let received = drain(&mut f.events)
            .into_iter()
            .filter(|e| matches!(e, AppEvent::BadgeReceived { .. }))
            .count();
        assert_eq!(received, 1);
    }

    #[test]
    fn photo_is_stored_and_emitted_once() {
        let mut f = fixture();
        let env = Envelope::Photo(PhotoPayload {
            from: "A-1".into(),
            to: "B-1".into(),
            front_image: vec![1, 2, 3],
            back_image: vec![4, 5, 6],
            message: "hi".into(),
        });
        f.router.dispatch(&f.peer, env.clone(), &mut f.dir);
        let photos: Vec<AppEvent> = drain(&mut f.events)
            .into_iter()
            .filter(|e| matches!(e, AppEvent::PhotoReceived { .. }))
            .collect();
        assert_eq!(photos.len(), 1);
        match &photos[0] {
            AppEvent::PhotoReceived { peer_uuid, front, back, caption } => {
                assert_eq!(peer_uuid, "A-1");
                assert_eq!(front, &vec![1, 2, 3]);
                assert_eq!(back, &vec![4, 5, 6]);
                assert_eq!(caption, "hi");
            }
            _ => unreachable!(),
        }
        // Photos are never de-duplicated.
        f.router.dispatch(&f.peer, env, &mut f.dir);
        assert_eq!(f.album.photos_from("A-1").len(), 4);
    }

    #[test]
    fn drops_foreign_and_loopback() {
        let mut f = fixture();
        let foreign = Envelope::Badge(BadgePayload {
            from: "A-1".into(),
            to: "Z-9".into(),
            badge: Badge::from_name("x"),
        });
        assert_eq!(
            f.router.dispatch(&f.peer, foreign, &mut f.dir),
            Dispatched::Dropped(DropReason::NotForUs)
        );
        assert_eq!(
            f.router.dispatch(&f.peer, profile("B-1", "me", &[]), &mut f.dir),
            Dispatched::Dropped(DropReason::Loopback)
        );
        assert_eq!(
            f.router.dispatch(&f.peer, profile("", "anon", &[]), &mut f.dir),
            Dispatched::Dropped(DropReason::MissingSender)
        );
        assert!(drain(&mut f.events).is_empty());
    }

    #[test]
    fn handlers_see_their_kind() {
        let mut f = fixture();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        f.router.register_handler(
            EnvelopeKind::Unknown,
            Box::new(move |_, env| {
                if let Envelope::Unknown(u) = env {
                    sink.lock().unwrap().push(u.kind.clone());
                }
            }),
        );
        let mut fields = serde_json::Map::new();
        fields.insert("from".into(), "A-1".into());
        let unknown = Envelope::Unknown(UnknownEnvelope {
            kind: "sticker".into(),
            fields,
        });
        f.router.dispatch(&f.peer, unknown, &mut f.dir);
        f.router.dispatch(&f.peer, profile("A-1", "ann", &[]), &mut f.dir);
        assert_eq!(*seen.lock().unwrap(), vec!["sticker".to_string()]);
    }
}

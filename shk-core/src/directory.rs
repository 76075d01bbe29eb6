//! Peer directory: every remote endpoint we know of and where it stands.
//! Only the session manager's serialized context mutates it.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::identity::PeerIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Discovered,
    Invited,
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Discovered => "discovered",
            ConnectionState::Invited => "invited",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub identity: PeerIdentity,
    pub state: ConnectionState,
    /// Set once a profile arrives; the latest profile wins.
    pub app_uuid: Option<String>,
    pub nickname: Option<String>,
    pub profile_url: Option<String>,
    pub discovered_at: Instant,
    pub state_changed_at: Instant,
}

#[derive(Debug, Default)]
pub struct PeerDirectory {
    records: HashMap<PeerIdentity, PeerRecord>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or move a peer to `state`. Returns the previous state, if any.
    pub fn upsert(
        &mut self,
        identity: &PeerIdentity,
        state: ConnectionState,
    ) -> Option<ConnectionState> {
        let now = Instant::now();
        match self.records.get_mut(identity) {
            Some(record) => {
                let prev = record.state;
                if prev != state {
                    record.state = state;
                    record.state_changed_at = now;
                }
                Some(prev)
            }
            None => {
                self.records.insert(
                    identity.clone(),
                    PeerRecord {
                        identity: identity.clone(),
                        state,
                        app_uuid: None,
                        nickname: None,
                        profile_url: None,
                        discovered_at: now,
                        state_changed_at: now,
                    },
                );
                None
            }
        }
    }

    pub fn get(&self, identity: &PeerIdentity) -> Option<&PeerRecord> {
        self.records.get(identity)
    }

    pub fn state(&self, identity: &PeerIdentity) -> Option<ConnectionState> {
        self.records.get(identity).map(|r| r.state)
    }

    /// Idempotent; later calls overwrite earlier ones. False if the peer is unknown.
    pub fn set_app_uuid(&mut self, identity: &PeerIdentity, uuid: &str) -> bool {
        match self.records.get_mut(identity) {
            Some(record) => {
                record.app_uuid = Some(uuid.to_string());
                true
            }
            None => false,
        }
    }

    /// Apply a received profile (last write wins). A disconnected record that
    /// carried the same app uuid under an older handle is merged away.
    /// Returns the identities that were merged.
    pub fn record_profile(
        &mut self,
        identity: &PeerIdentity,
        uuid: &str,
        nickname: &str,
        profile_url: Option<&str>,
    ) -> Vec<PeerIdentity> {
        if !self.set_app_uuid(identity, uuid) {
            return Vec::new();
        }
        if let Some(record) = self.records.get_mut(identity) {
            record.nickname = Some(nickname.to_string());
            record.profile_url = profile_url.map(str::to_string);
        }
        let stale: Vec<PeerIdentity> = self
            .records
            .values()
            .filter(|r| {
                r.identity != *identity
                    && r.app_uuid.as_deref() == Some(uuid)
                    && r.state == ConnectionState::Disconnected
            })
            .map(|r| r.identity.clone())
            .collect();
        for id in &stale {
            self.records.remove(id);
        }
        stale
    }

    pub fn find_by_app_uuid(&self, uuid: &str) -> Vec<&PeerRecord> {
        self.records
            .values()
            .filter(|r| r.app_uuid.as_deref() == Some(uuid))
            .collect()
    }

    pub fn remove(&mut self, identity: &PeerIdentity) -> Option<PeerRecord> {
        self.records.remove(identity)
    }

    /// Snapshot of every record.
    pub fn all(&self) -> Vec<PeerRecord> {
        self.records.values().cloned().collect()
    }

    pub fn connected(&self) -> impl Iterator<Item = &PeerRecord> {
        self.records
            .values()
            .filter(|r| r.state == ConnectionState::Connected)
    }

    /// Drop records that have sat in `Disconnected` for at least `older_than`.
    pub fn evict_disconnected(&mut self, older_than: Duration, now: Instant) -> Vec<PeerIdentity> {
        let expired: Vec<PeerIdentity> = self
            .records
            .values()
            .filter(|r| {
                r.state == ConnectionState::Disconnected
                    && now.saturating_duration_since(r.state_changed_at) >= older_than
            })
            .map(|r| r.identity.clone())
            .collect();
        for id in &expired {
            self.records.remove(id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

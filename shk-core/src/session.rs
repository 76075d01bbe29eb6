//! Session transport: at most one session per peer over the platform link.
//! Connect attempts hand out shared handles, so racing connects and mutual
//! invitations collapse onto a single session.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::identity::PeerIdentity;
use crate::link::{ChannelFault, Link, LinkState};
use crate::wire;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("invitation rejected")]
    Rejected,
    #[error("invitation timed out")]
    Timeout,
    #[error("connect cancelled by local disconnect")]
    Cancelled,
    #[error("session manager closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("no active session")]
    NoActiveSession,
    /// Larger than one frame may carry; the session is unaffected.
    #[error("message of {0} bytes exceeds the frame limit")]
    TooLarge(usize),
    #[error("channel fault: {0}")]
    ChannelFault(#[from] ChannelFault),
}

type Outcome = Option<Result<(), ConnectError>>;

/// Shared view of one session attempt. Every caller connecting to the same
/// peer while the attempt is alive gets a handle with the same id.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    peer: PeerIdentity,
    outcome: watch::Receiver<Outcome>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    /// Current outcome without waiting; `None` while still pending.
    pub fn outcome(&self) -> Outcome {
        self.outcome.borrow().clone()
    }

    /// Wait until the session is up or the attempt failed.
    pub async fn established(mut self) -> Result<(), ConnectError> {
        loop {
            let current = self.outcome.borrow().clone();
            if let Some(result) = current {
                return result;
            }
            if self.outcome.changed().await.is_err() {
                let last = self.outcome.borrow().clone();
                return last.unwrap_or(Err(ConnectError::Closed));
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Pending,
    Live,
}

/// Snapshot of a session for callers outside the serialized context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub peer: PeerIdentity,
    pub phase: SessionPhase,
    pub outbound: bool,
    pub opened_at: Instant,
}

struct SessionEntry {
    id: SessionId,
    phase: SessionPhase,
    outbound: bool,
    opened_at: Instant,
    outcome: watch::Sender<Outcome>,
}

impl SessionEntry {
    fn handle(&self, peer: &PeerIdentity) -> SessionHandle {
        SessionHandle {
            id: self.id,
            peer: peer.clone(),
            outcome: self.outcome.subscribe(),
        }
    }

    fn resolve(&self, result: Result<(), ConnectError>) {
        self.outcome.send_replace(Some(result));
    }

    fn info(&self, peer: &PeerIdentity) -> SessionInfo {
        SessionInfo {
            id: self.id,
            peer: peer.clone(),
            phase: self.phase,
            outbound: self.outbound,
            opened_at: self.opened_at,
        }
    }
}

/// What a connect request did.
pub enum ConnectStart {
    /// A fresh invitation went out; the caller owns the timeout.
    Invited(SessionHandle),
    /// An attempt or live session already existed.
    Existing(SessionHandle),
}

impl ConnectStart {
    pub fn handle(&self) -> &SessionHandle {
        match self {
            ConnectStart::Invited(h) | ConnectStart::Existing(h) => h,
        }
    }

    pub fn into_handle(self) -> SessionHandle {
        match self {
            ConnectStart::Invited(h) | ConnectStart::Existing(h) => h,
        }
    }
}

/// Result of applying a platform state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Connecting(SessionId),
    Established(SessionId),
    /// Connected reported again for a session that is already live.
    AlreadyLive(SessionId),
    /// A pending attempt ended without connecting.
    Failed(SessionId),
    TornDown(SessionId),
    Ignored,
}

pub struct SessionTransport {
    link: Arc<dyn Link>,
    sessions: HashMap<PeerIdentity, SessionEntry>,
    next_id: u64,
}

impl SessionTransport {
    pub fn new(link: Arc<dyn Link>) -> Self {
        Self {
            link,
            sessions: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn link(&self) -> &Arc<dyn Link> {
        &self.link
    }

    fn open(&mut self, peer: &PeerIdentity, phase: SessionPhase, outbound: bool) -> &SessionEntry {
        let id = SessionId(self.next_id);
        self.next_id += 1;
        let (outcome, _) = watch::channel(match phase {
            SessionPhase::Live => Some(Ok(())),
            SessionPhase::Pending => None,
        });
        self.sessions.entry(peer.clone()).or_insert(SessionEntry {
            id,
            phase,
            outbound,
            opened_at: Instant::now(),
            outcome,
        })
    }

    /// Invite `peer` unless an attempt or session already exists.
    pub fn connect(&mut self, peer: &PeerIdentity, timeout: Duration) -> ConnectStart {
        if let Some(existing) = self.sessions.get(peer) {
            return ConnectStart::Existing(existing.handle(peer));
        }
        let handle = self.open(peer, SessionPhase::Pending, true).handle(peer);
        self.link.invite(peer, timeout);
        ConnectStart::Invited(handle)
    }

    /// Record an inbound invitation. Joins an in-flight attempt if there is one.
    pub fn accept_inbound(&mut self, peer: &PeerIdentity) -> ConnectStart {
        if let Some(existing) = self.sessions.get(peer) {
            return ConnectStart::Existing(existing.handle(peer));
        }
        let handle = self.open(peer, SessionPhase::Pending, false).handle(peer);
        ConnectStart::Invited(handle)
    }

    pub fn on_state(&mut self, peer: &PeerIdentity, state: LinkState) -> Transition {
        match state {
            LinkState::Connecting => match self.sessions.get(peer) {
                Some(entry) => Transition::Connecting(entry.id),
                None => Transition::Connecting(self.open(peer, SessionPhase::Pending, false).id),
            },
            LinkState::Connected => match self.sessions.get_mut(peer) {
                Some(entry) if entry.phase == SessionPhase::Live => {
                    Transition::AlreadyLive(entry.id)
                }
                Some(entry) => {
                    entry.phase = SessionPhase::Live;
                    entry.resolve(Ok(()));
                    Transition::Established(entry.id)
                }
                None => Transition::Established(self.open(peer, SessionPhase::Live, false).id),
            },
            LinkState::NotConnected => match self.sessions.remove(peer) {
                Some(entry) if entry.phase == SessionPhase::Pending => {
                    entry.resolve(Err(ConnectError::Rejected));
                    Transition::Failed(entry.id)
                }
                Some(entry) => Transition::TornDown(entry.id),
                None => Transition::Ignored,
            },
        }
    }

    /// Expire a pending attempt. Stale timers (other id, already live) do nothing.
    pub fn on_timeout(&mut self, peer: &PeerIdentity, id: SessionId) -> bool {
        let expired = matches!(
            self.sessions.get(peer),
            Some(entry) if entry.id == id && entry.phase == SessionPhase::Pending
        );
        if !expired {
            return false;
        }
        if let Some(entry) = self.sessions.remove(peer) {
            entry.resolve(Err(ConnectError::Timeout));
        }
        self.link.disconnect(peer);
        true
    }

    /// Whether bytes from `peer` should be delivered.
    pub fn accepts_from(&self, peer: &PeerIdentity) -> bool {
        self.is_live(peer)
    }

    pub fn send(&self, peer: &PeerIdentity, bytes: Vec<u8>) -> Result<(), SendError> {
        if !self.is_live(peer) {
            return Err(SendError::NoActiveSession);
        }
        if bytes.len() > wire::max_frame_len() {
            return Err(SendError::TooLarge(bytes.len()));
        }
        self.link.send(peer, bytes).map_err(SendError::ChannelFault)
    }

    /// Send to every live session. `NoActiveSession` when there are none.
    pub fn send_to_all(
        &self,
        bytes: &[u8],
    ) -> Result<Vec<(PeerIdentity, Result<(), SendError>)>, SendError> {
        let live = self.live_peers();
        if live.is_empty() {
            return Err(SendError::NoActiveSession);
        }
        Ok(live
            .into_iter()
            .map(|peer| {
                let result = self.send(&peer, bytes.to_vec());
                (peer, result)
            })
            .collect())
    }

    /// Tear down the session or attempt for `peer`.
    pub fn disconnect(&mut self, peer: &PeerIdentity) -> Option<SessionId> {
        let entry = self.sessions.remove(peer)?;
        if entry.phase == SessionPhase::Pending {
            entry.resolve(Err(ConnectError::Cancelled));
        }
        self.link.disconnect(peer);
        Some(entry.id)
    }

    /// Close everything; pending attempts fail with `Closed`. Returns peers that were live.
    pub fn close_all(&mut self) -> Vec<PeerIdentity> {
        let mut live = Vec::new();
        for (peer, entry) in self.sessions.drain() {
            match entry.phase {
                SessionPhase::Live => live.push(peer.clone()),
                SessionPhase::Pending => entry.resolve(Err(ConnectError::Closed)),
            }
            self.link.disconnect(&peer);
        }
        live
    }

    pub fn is_live(&self, peer: &PeerIdentity) -> bool {
        matches!(self.sessions.get(peer), Some(e) if e.phase == SessionPhase::Live)
    }

    pub fn has_session(&self, peer: &PeerIdentity) -> bool {
        self.sessions.contains_key(peer)
    }

    pub fn session(&self, peer: &PeerIdentity) -> Option<SessionInfo> {
        self.sessions.get(peer).map(|e| e.info(peer))
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|(p, e)| e.info(p)).collect()
    }

    pub fn live_peers(&self) -> Vec<PeerIdentity> {
        self.sessions
            .iter()
            .filter(|(_, e)| e.phase == SessionPhase::Live)
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

//! Session manager: one tokio task owns the directory, session table, discovery
//! state and router. Application calls, platform events and timer expiries are all
//! commands on one channel, handled in arrival order.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::{Config, ConfigError};
use crate::directory::{ConnectionState, PeerDirectory, PeerRecord};
use crate::discovery::{BurstTicket, DiscoveryService, FoundAction};
use crate::identity::PeerIdentity;
use crate::link::{ChannelFault, Link, LinkEvent, LinkState};
use crate::protocol::{Envelope, EnvelopeKind};
use crate::router::{AppEvent, Handler, LocalProfile, MessageRouter, RegistrationError};
use crate::session::{
    ConnectError, ConnectStart, SendError, SessionHandle, SessionId, SessionInfo,
    SessionTransport, Transition,
};
use crate::store::{AlbumStore, Friend, FriendStore};
use crate::wire::{self, EncodeError};

const EVENT_CAPACITY: usize = 1024;

/// Per-peer outcome of a fan-out send.
pub type Delivery = Vec<(PeerIdentity, Result<(), SendError>)>;

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("session manager is closed")]
    Closed,
    #[error("local user uuid is empty")]
    MissingLocalUuid,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

/// Stores the router writes to.
#[derive(Clone)]
pub struct Stores {
    pub friends: Arc<dyn FriendStore>,
    pub album: Arc<dyn AlbumStore>,
}

enum Radio {
    StartAdvertising,
    StopAdvertising,
    StartBrowsing,
    StopBrowsing,
}

enum Command {
    Link(LinkEvent),
    Connect {
        peer: PeerIdentity,
        reply: oneshot::Sender<SessionHandle>,
    },
    ConnectTimedOut {
        peer: PeerIdentity,
        id: SessionId,
    },
    Disconnect {
        peer: PeerIdentity,
        reply: oneshot::Sender<bool>,
    },
    DisconnectAll {
        reply: oneshot::Sender<usize>,
    },
    Send {
        peer: PeerIdentity,
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<(), ManagerError>>,
    },
    SendEnvelope {
        peer: PeerIdentity,
        envelope: Envelope,
        reply: oneshot::Sender<Result<(), ManagerError>>,
    },
    SendToAll {
        envelope: Envelope,
        reply: oneshot::Sender<Result<Delivery, ManagerError>>,
    },
    Radio {
        op: Radio,
        reply: oneshot::Sender<()>,
    },
    Burst {
        duration: Option<Duration>,
        reply: oneshot::Sender<()>,
    },
    BurstElapsed(BurstTicket),
    ConfirmRegistration {
        uuid: String,
        nickname: String,
        reply: oneshot::Sender<Result<Friend, RegistrationError>>,
    },
    UpdateProfile {
        profile: LocalProfile,
        reply: oneshot::Sender<()>,
    },
    RegisterHandler {
        kind: EnvelopeKind,
        handler: Handler,
        reply: oneshot::Sender<()>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerRecord>>,
    },
    Sessions {
        reply: oneshot::Sender<Vec<SessionInfo>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Where platform code posts `LinkEvent`s.
#[derive(Clone)]
pub struct LinkSink {
    tx: mpsc::UnboundedSender<Command>,
}

impl LinkSink {
    /// False once the manager has stopped.
    pub fn post(&self, event: LinkEvent) -> bool {
        self.tx.send(Command::Link(event)).is_ok()
    }
}

/// Cloneable entry point into a running session manager.
#[derive(Clone)]
pub struct ManagerHandle {
    tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<AppEvent>,
}

impl ManagerHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| ManagerError::Closed)?;
        rx.await.map_err(|_| ManagerError::Closed)
    }

    /// Events from now on. The stream buffers a fixed number of events per receiver; a
    /// receiver that falls further behind gets `RecvError::Lagged(n)` and the oldest `n`
    /// events, photos and registration requests included, are gone for it. Keep up, or
    /// read the stores for anything missed.
    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.events.subscribe()
    }

    pub fn link_sink(&self) -> LinkSink {
        LinkSink {
            tx: self.tx.clone(),
        }
    }

    /// Start (or join) a session attempt without waiting for it.
    pub async fn connect_handle(&self, peer: &PeerIdentity) -> Result<SessionHandle, ManagerError> {
        let peer = peer.clone();
        self.request(|reply| Command::Connect { peer, reply }).await
    }

    /// Connect and wait until the session is up, rejected or timed out.
    pub async fn connect(&self, peer: &PeerIdentity) -> Result<(), ManagerError> {
        let handle = self.connect_handle(peer).await?;
        handle.established().await?;
        Ok(())
    }

    /// True if there was a session or attempt to tear down.
    pub async fn disconnect(&self, peer: &PeerIdentity) -> Result<bool, ManagerError> {
        let peer = peer.clone();
        self.request(|reply| Command::Disconnect { peer, reply }).await
    }

    pub async fn disconnect_all(&self) -> Result<usize, ManagerError> {
        self.request(|reply| Command::DisconnectAll { reply }).await
    }

    pub async fn send(&self, peer: &PeerIdentity, bytes: Vec<u8>) -> Result<(), ManagerError> {
        let peer = peer.clone();
        self.request(|reply| Command::Send { peer, bytes, reply })
            .await?
    }

    pub async fn send_envelope(&self, peer: &PeerIdentity, envelope: Envelope) -> Result<(), ManagerError> {
        let peer = peer.clone();
        self.request(|reply| Command::SendEnvelope {
            peer,
            envelope,
            reply,
        })
        .await?
    }

    pub async fn send_to_all(&self, envelope: Envelope) -> Result<Delivery, ManagerError> {
        self.request(|reply| Command::SendToAll { envelope, reply })
            .await?
    }

    async fn radio(&self, op: Radio) -> Result<(), ManagerError> {
        self.request(|reply| Command::Radio { op, reply }).await
    }

    pub async fn start_advertising(&self) -> Result<(), ManagerError> {
        self.radio(Radio::StartAdvertising).await
    }

    pub async fn stop_advertising(&self) -> Result<(), ManagerError> {
        self.radio(Radio::StopAdvertising).await
    }

    pub async fn start_browsing(&self) -> Result<(), ManagerError> {
        self.radio(Radio::StartBrowsing).await
    }

    pub async fn stop_browsing(&self) -> Result<(), ManagerError> {
        self.radio(Radio::StopBrowsing).await
    }

    /// Advertise and browse for `duration` (configured burst length if `None`).
    pub async fn run_discovery_burst(&self, duration: Option<Duration>) -> Result<(), ManagerError> {
        self.request(|reply| Command::Burst { duration, reply }).await
    }

    pub async fn confirm_registration(&self, uuid: &str, nickname: &str) -> Result<Friend, ManagerError> {
        let (uuid, nickname) = (uuid.to_string(), nickname.to_string());
        Ok(self
            .request(|reply| Command::ConfirmRegistration {
                uuid,
                nickname,
                reply,
            })
            .await??)
    }

    /// Replace what future sessions are told about us.
    pub async fn update_local_profile(&self, profile: LocalProfile) -> Result<(), ManagerError> {
        if profile.user_uuid.is_empty() {
            return Err(ManagerError::MissingLocalUuid);
        }
        self.request(|reply| Command::UpdateProfile { profile, reply })
            .await
    }

    pub async fn register_handler<F>(&self, kind: EnvelopeKind, handler: F) -> Result<(), ManagerError>
    where
        F: FnMut(&PeerIdentity, &Envelope) + Send + 'static,
    {
        let handler: Handler = Box::new(handler);
        self.request(|reply| Command::RegisterHandler {
            kind,
            handler,
            reply,
        })
        .await
    }

    pub async fn peers(&self) -> Result<Vec<PeerRecord>, ManagerError> {
        self.request(|reply| Command::Peers { reply }).await
    }

    pub async fn sessions(&self) -> Result<Vec<SessionInfo>, ManagerError> {
        self.request(|reply| Command::Sessions { reply }).await
    }

    /// Close every session, stop the radios, then stop the task.
    pub async fn shutdown(&self) -> Result<(), ManagerError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

pub struct SessionManager {
    config: Config,
    profile: LocalProfile,
    directory: PeerDirectory,
    sessions: SessionTransport,
    discovery: DiscoveryService,
    router: MessageRouter,
    events: broadcast::Sender<AppEvent>,
    timers: mpsc::WeakUnboundedSender<Command>,
}

impl SessionManager {
    /// Spawn the manager task. `make_link` receives the sink the platform posts events to.
    pub fn spawn<F>(
        config: Config,
        local: PeerIdentity,
        profile: LocalProfile,
        stores: Stores,
        make_link: F,
    ) -> Result<ManagerHandle, ManagerError>
    where
        F: FnOnce(LinkSink) -> Arc<dyn Link>,
    {
        config.validate()?;
        if profile.user_uuid.is_empty() {
            return Err(ManagerError::MissingLocalUuid);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let link = make_link(LinkSink { tx: tx.clone() });

        let manager = SessionManager {
            discovery: DiscoveryService::new(link.clone(), config.service_type.clone(), local.handle),
            sessions: SessionTransport::new(link),
            router: MessageRouter::new(
                profile.user_uuid.clone(),
                stores.friends,
                stores.album,
                events.clone(),
            ),
            directory: PeerDirectory::new(),
            profile,
            config,
            events: events.clone(),
            timers: tx.downgrade(),
        };
        tracing::info!(local = %local, service = %manager.config.service_type, "session manager starting");
        tokio::spawn(manager.run(rx));
        Ok(ManagerHandle { tx, events })
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut housekeeping = tokio::time::interval(self.config.housekeeping_interval);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    if let Command::Shutdown { reply } = cmd {
                        self.teardown();
                        let _ = reply.send(());
                        break;
                    }
                    self.handle(cmd);
                    self.check_consistency();
                }
                _ = housekeeping.tick() => self.housekeeping(),
            }
        }
        self.teardown();
        tracing::info!("session manager stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Link(event) => self.on_link_event(event),
            Command::Connect { peer, reply } => {
                let handle = self.connect(&peer);
                let _ = reply.send(handle);
            }
            Command::ConnectTimedOut { peer, id } => {
                if self.sessions.on_timeout(&peer, id) {
                    tracing::info!(peer = %peer, session = %id, "invitation timed out");
                    self.set_state(&peer, ConnectionState::Disconnected);
                    self.emit(AppEvent::ConnectFailed {
                        peer,
                        error: ConnectError::Timeout,
                    });
                }
            }
            Command::Disconnect { peer, reply } => {
                let closed = self.sessions.disconnect(&peer);
                if let Some(id) = closed {
                    tracing::info!(peer = %peer, session = %id, "disconnected by request");
                    self.set_state(&peer, ConnectionState::Disconnected);
                }
                let _ = reply.send(closed.is_some());
            }
            Command::DisconnectAll { reply } => {
                let _ = reply.send(self.disconnect_all());
            }
            Command::Send { peer, bytes, reply } => {
                let _ = reply.send(self.send(&peer, bytes).map_err(ManagerError::from));
            }
            Command::SendEnvelope {
                peer,
                envelope,
                reply,
            } => {
                let result = wire::encode(&envelope)
                    .map_err(ManagerError::from)
                    .and_then(|bytes| self.send(&peer, bytes).map_err(ManagerError::from));
                let _ = reply.send(result);
            }
            Command::SendToAll { envelope, reply } => {
                let _ = reply.send(self.send_to_all(&envelope));
            }
            Command::Radio { op, reply } => {
                match op {
                    Radio::StartAdvertising => self.discovery.start_advertising(),
                    Radio::StopAdvertising => self.discovery.stop_advertising(),
                    Radio::StartBrowsing => self.discovery.start_browsing(),
                    Radio::StopBrowsing => self.discovery.stop_browsing(),
                }
                let _ = reply.send(());
            }
            Command::Burst { duration, reply } => {
                let duration = duration.unwrap_or(self.config.burst_duration);
                let ticket = self.discovery.begin_burst();
                tracing::info!(?duration, "discovery burst");
                self.after(duration, Command::BurstElapsed(ticket));
                let _ = reply.send(());
            }
            Command::BurstElapsed(ticket) => {
                if self.discovery.end_burst(ticket) {
                    tracing::debug!("discovery burst over");
                }
            }
            Command::ConfirmRegistration {
                uuid,
                nickname,
                reply,
            } => {
                let _ = reply.send(self.router.confirm_registration(&uuid, &nickname));
            }
            Command::UpdateProfile { profile, reply } => {
                self.router.set_local_uuid(profile.user_uuid.clone());
                self.profile = profile;
                let _ = reply.send(());
            }
            Command::RegisterHandler {
                kind,
                handler,
                reply,
            } => {
                self.router.register_handler(kind, handler);
                let _ = reply.send(());
            }
            Command::Peers { reply } => {
                let _ = reply.send(self.directory.all());
            }
            Command::Sessions { reply } => {
                let _ = reply.send(self.sessions.sessions());
            }
            Command::Shutdown { reply } => {
                self.teardown();
                let _ = reply.send(());
            }
        }
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::PeerFound { peer, service } => {
                match self
                    .discovery
                    .on_peer_found(&peer, &service, &self.directory, &self.sessions)
                {
                    FoundAction::Invite => {
                        tracing::info!(peer = %peer, "peer found, inviting");
                        self.set_state(&peer, ConnectionState::Discovered);
                        self.connect(&peer);
                    }
                    FoundAction::Ignore(reason) => {
                        tracing::debug!(peer = %peer, ?reason, "found peer ignored");
                    }
                }
            }
            LinkEvent::PeerLost { peer } => {
                if !self.discovery.should_forget(&peer, &self.directory) {
                    return;
                }
                if let Some(id) = self.sessions.disconnect(&peer) {
                    tracing::debug!(peer = %peer, session = %id, "pending attempt cancelled");
                }
                self.directory.remove(&peer);
                tracing::info!(peer = %peer, "peer lost before connecting");
            }
            LinkEvent::InvitationReceived { peer } => {
                let accept = self.discovery.on_invitation(&peer);
                if accept {
                    if let ConnectStart::Invited(handle) = self.sessions.accept_inbound(&peer) {
                        self.arm_timeout(&peer, handle.id());
                        if self.directory.state(&peer) != Some(ConnectionState::Connected) {
                            self.set_state(&peer, ConnectionState::Connecting);
                        }
                    }
                    tracing::info!(peer = %peer, "invitation accepted");
                }
                self.sessions.link().respond_to_invitation(&peer, accept);
            }
            LinkEvent::StateChanged { peer, state } => self.on_state(peer, state),
            LinkEvent::Received { peer, bytes } => self.on_received(peer, bytes),
        }
    }

    fn on_state(&mut self, peer: PeerIdentity, state: LinkState) {
        match self.sessions.on_state(&peer, state) {
            Transition::Connecting(_) => {
                if self.directory.state(&peer) != Some(ConnectionState::Connected) {
                    self.set_state(&peer, ConnectionState::Connecting);
                }
            }
            Transition::Established(id) => {
                tracing::info!(peer = %peer, session = %id, "session established");
                self.set_state(&peer, ConnectionState::Connected);
                self.send_profile(&peer);
            }
            Transition::AlreadyLive(_) | Transition::Ignored => {}
            Transition::Failed(id) => {
                tracing::info!(peer = %peer, session = %id, "invitation rejected");
                self.set_state(&peer, ConnectionState::Disconnected);
                self.emit(AppEvent::ConnectFailed {
                    peer,
                    error: ConnectError::Rejected,
                });
            }
            Transition::TornDown(id) => {
                tracing::info!(peer = %peer, session = %id, "session closed");
                self.set_state(&peer, ConnectionState::Disconnected);
            }
        }
    }

    fn on_received(&mut self, peer: PeerIdentity, bytes: Vec<u8>) {
        if !self.sessions.accepts_from(&peer) {
            tracing::debug!(peer = %peer, len = bytes.len(), "bytes outside a live session dropped");
            return;
        }
        match wire::decode(&bytes) {
            Ok(envelope) => {
                tracing::debug!(peer = %peer, kind = ?envelope.kind(), "envelope received");
                self.router.dispatch(&peer, envelope, &mut self.directory);
            }
            Err(e) => tracing::warn!(peer = %peer, error = %e, "dropping malformed message"),
        }
    }

    fn connect(&mut self, peer: &PeerIdentity) -> SessionHandle {
        match self.sessions.connect(peer, self.config.invite_timeout) {
            ConnectStart::Invited(handle) => {
                tracing::debug!(peer = %peer, session = %handle.id(), "invitation sent");
                self.set_state(peer, ConnectionState::Invited);
                self.arm_timeout(peer, handle.id());
                handle
            }
            ConnectStart::Existing(handle) => handle,
        }
    }

    /// The profile goes out in the same step that marks the session live, so it
    /// precedes anything the application sends.
    fn send_profile(&mut self, peer: &PeerIdentity) {
        let bytes = match wire::encode(&self.profile.envelope()) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "encoding local profile failed");
                return;
            }
        };
        if let Err(e) = self.send(peer, bytes) {
            tracing::warn!(peer = %peer, error = %e, "profile send failed");
        }
    }

    fn send(&mut self, peer: &PeerIdentity, bytes: Vec<u8>) -> Result<(), SendError> {
        let result = self.sessions.send(peer, bytes);
        if let Err(SendError::ChannelFault(fault)) = &result {
            self.on_fault(peer, fault);
        }
        result
    }

    fn send_to_all(&mut self, envelope: &Envelope) -> Result<Delivery, ManagerError> {
        let bytes = wire::encode(envelope)?;
        let delivery = self.sessions.send_to_all(&bytes)?;
        for (peer, result) in &delivery {
            if let Err(SendError::ChannelFault(fault)) = result {
                self.on_fault(peer, fault);
            }
        }
        Ok(delivery)
    }

    fn on_fault(&mut self, peer: &PeerIdentity, fault: &ChannelFault) {
        tracing::warn!(peer = %peer, error = %fault, "channel fault, dropping session");
        self.sessions.disconnect(peer);
        self.set_state(peer, ConnectionState::Disconnected);
    }

    fn disconnect_all(&mut self) -> usize {
        let open: Vec<PeerIdentity> = self.sessions.sessions().into_iter().map(|s| s.peer).collect();
        let live = self.sessions.close_all();
        for peer in &open {
            self.set_state(peer, ConnectionState::Disconnected);
        }
        live.len()
    }

    /// Sessions first, then the radios.
    fn teardown(&mut self) {
        let closed = self.disconnect_all();
        self.discovery.stop_all();
        if closed > 0 {
            tracing::info!(closed, "sessions closed");
        }
    }

    fn housekeeping(&mut self) {
        let evicted = self
            .directory
            .evict_disconnected(self.config.disconnect_timeout, Instant::now());
        for peer in evicted {
            tracing::debug!(peer = %peer, "evicted stale record");
        }
    }

    fn set_state(&mut self, peer: &PeerIdentity, state: ConnectionState) {
        if self.directory.upsert(peer, state) != Some(state) {
            self.emit(AppEvent::PeerStateChanged {
                peer: peer.clone(),
                state,
            });
        }
    }

    fn emit(&self, event: AppEvent) {
        let _ = self.events.send(event);
    }

    fn arm_timeout(&self, peer: &PeerIdentity, id: SessionId) {
        let peer = peer.clone();
        self.after(self.config.invite_timeout, Command::ConnectTimedOut { peer, id });
    }

    fn after(&self, delay: Duration, cmd: Command) {
        let timers = self.timers.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = timers.upgrade() {
                let _ = tx.send(cmd);
            }
        });
    }

    fn check_consistency(&self) {
        debug_assert!(
            self.directory
                .connected()
                .all(|r| self.sessions.is_live(&r.identity)),
            "directory shows a connected peer without a live session"
        );
    }
}

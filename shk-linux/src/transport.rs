//! Channels to peers: TCP with a Hello/Welcome handshake, then ChaCha20-Poly1305 sealed,
//! length-prefixed frames. Each open channel has a writer task fed by an unbounded queue.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use shk_core::identity::{decrypt_wire, derive_session_key, encrypt_wire};
use shk_core::wire::{self, decode_frame, encode_frame};
use shk_core::{
    ChannelFault, Keypair, LinkEvent, LinkSink, LinkState, Message, PeerHandle, PeerIdentity,
    PROTOCOL_VERSION,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;

const LEN_SIZE: usize = 4;
const TAG_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// Both directions share one key, so each side uses its own half of the nonce space.
    fn nonce(self, counter: u64) -> u64 {
        counter * 2
            + match self {
                Role::Initiator => 0,
                Role::Responder => 1,
            }
    }

    fn peer(self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

async fn read_message<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Message> {
    let mut buf = vec![0u8; LEN_SIZE];
    r.read_exact(&mut buf).await?;
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > wire::max_frame_len() {
        return Err(invalid("control frame too large"));
    }
    buf.resize(LEN_SIZE + len, 0);
    r.read_exact(&mut buf[LEN_SIZE..]).await?;
    let (msg, _) = decode_frame(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(msg)
}

async fn write_message<W: AsyncWrite + Unpin>(w: &mut W, msg: &Message) -> io::Result<()> {
    let frame = encode_frame(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    w.write_all(&frame).await?;
    w.flush().await
}

/// `Ok(None)` on a clean end of stream.
async fn read_sealed<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; LEN_SIZE];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > wire::max_frame_len() + TAG_SIZE {
        return Err(invalid("sealed frame too large"));
    }
    let mut sealed = vec![0u8; len];
    r.read_exact(&mut sealed).await?;
    Ok(Some(sealed))
}

async fn write_sealed<W: AsyncWrite + Unpin>(w: &mut W, sealed: &[u8]) -> io::Result<()> {
    let len = sealed.len() as u32;
    w.write_all(&len.to_le_bytes()).await?;
    w.write_all(sealed).await?;
    w.flush().await
}

struct OpenChannel {
    id: u64,
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    /// Dropping this stops the reader.
    _close: oneshot::Sender<()>,
}

struct Dial {
    id: u64,
    abort: AbortHandle,
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct Table {
    next_id: u64,
    open: HashMap<PeerHandle, OpenChannel>,
    invitations: HashMap<PeerHandle, oneshot::Sender<bool>>,
    dials: HashMap<PeerHandle, Dial>,
}

struct Registered {
    id: u64,
    outbox: mpsc::UnboundedReceiver<Vec<u8>>,
    close: oneshot::Receiver<()>,
}

/// Open channels, pending inbound invitations and outbound dials, keyed by peer handle.
#[derive(Default)]
struct Channels {
    table: Mutex<Table>,
}

impl Channels {
    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// None if the peer already has an open channel; the caller drops the new one.
    fn register(&self, peer: PeerHandle) -> Option<Registered> {
        let mut t = self.lock();
        if t.open.contains_key(&peer) {
            return None;
        }
        t.next_id += 1;
        let id = t.next_id;
        let (outbox_tx, outbox) = mpsc::unbounded_channel();
        let (close_tx, close) = oneshot::channel();
        t.open.insert(
            peer,
            OpenChannel {
                id,
                outbox: outbox_tx,
                _close: close_tx,
            },
        );
        Some(Registered { id, outbox, close })
    }

    /// True if channel `id` was still the open one.
    fn unregister(&self, peer: PeerHandle, id: u64) -> bool {
        let mut t = self.lock();
        match t.open.get(&peer) {
            Some(ch) if ch.id == id => {
                t.open.remove(&peer);
                true
            }
            _ => false,
        }
    }

    fn send(&self, peer: PeerHandle, bytes: Vec<u8>) -> Result<(), ChannelFault> {
        let t = self.lock();
        let ch = t.open.get(&peer).ok_or(ChannelFault::NotConnected)?;
        ch.outbox.send(bytes).map_err(|_| ChannelFault::WriterClosed)
    }

    fn is_open(&self, peer: PeerHandle) -> bool {
        self.lock().open.contains_key(&peer)
    }

    fn has_inbound(&self, peer: PeerHandle) -> bool {
        let t = self.lock();
        t.open.contains_key(&peer) || t.invitations.contains_key(&peer)
    }

    fn await_invitation(&self, peer: PeerHandle) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.lock().invitations.insert(peer, tx);
        rx
    }

    fn respond(&self, peer: PeerHandle, accept: bool) -> bool {
        match self.lock().invitations.remove(&peer) {
            Some(tx) => tx.send(accept).is_ok(),
            None => false,
        }
    }

    fn drop_invitation(&self, peer: PeerHandle) {
        self.lock().invitations.remove(&peer);
    }

    /// Spawn one dial per peer; a second request while one runs is ignored.
    fn spawn_dial<F, Fut>(&self, peer: PeerHandle, task: F)
    where
        F: FnOnce(u64, watch::Sender<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut t = self.lock();
        if t.dials.contains_key(&peer) {
            return;
        }
        t.next_id += 1;
        let id = t.next_id;
        let (done_tx, done) = watch::channel(false);
        let handle = tokio::spawn(task(id, done_tx));
        t.dials.insert(
            peer,
            Dial {
                id,
                abort: handle.abort_handle(),
                done,
            },
        );
    }

    fn finish_dial(&self, peer: PeerHandle, id: u64) {
        let mut t = self.lock();
        if matches!(t.dials.get(&peer), Some(d) if d.id == id) {
            t.dials.remove(&peer);
        }
    }

    fn dial_in_progress(&self, peer: PeerHandle) -> Option<watch::Receiver<bool>> {
        self.lock().dials.get(&peer).map(|d| d.done.clone())
    }

    fn cancel_dial(&self, peer: PeerHandle) -> bool {
        match self.lock().dials.remove(&peer) {
            Some(dial) => {
                dial.abort.abort();
                true
            }
            None => false,
        }
    }

    fn close(&self, peer: PeerHandle) {
        let mut t = self.lock();
        t.open.remove(&peer);
        t.invitations.remove(&peer);
        if let Some(dial) = t.dials.remove(&peer) {
            dial.abort.abort();
        }
    }
}

pub struct Transport {
    keypair: Arc<Keypair>,
    local: PeerIdentity,
    service: String,
    sink: LinkSink,
    accept_timeout: Duration,
    channels: Channels,
}

impl Transport {
    /// Serve inbound channels on `listener`.
    pub fn start(
        listener: TcpListener,
        keypair: Arc<Keypair>,
        local: PeerIdentity,
        service: String,
        sink: LinkSink,
        accept_timeout: Duration,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            keypair,
            local,
            service,
            sink,
            accept_timeout,
            channels: Channels::default(),
        });
        tokio::spawn(this.clone().accept_loop(listener));
        this
    }

    fn hello(&self) -> Message {
        Message::Hello {
            protocol_version: PROTOCOL_VERSION,
            service: self.service.clone(),
            handle: self.local.handle,
            display_name: self.local.display_name.clone(),
            public_key: self.keypair.public_key().clone(),
        }
    }

    fn welcome(&self, accepted: bool) -> Message {
        Message::Welcome {
            accepted,
            handle: self.local.handle,
            display_name: self.local.display_name.clone(),
            public_key: self.keypair.public_key().clone(),
        }
    }

    fn post_state(&self, peer: &PeerIdentity, state: LinkState) {
        self.sink.post(LinkEvent::StateChanged {
            peer: peer.clone(),
            state,
        });
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, from)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.inbound(stream).await {
                            tracing::debug!(%from, error = %e, "inbound channel failed");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn inbound(self: Arc<Self>, mut stream: TcpStream) -> io::Result<()> {
        let Message::Hello {
            protocol_version,
            service,
            handle,
            display_name,
            public_key,
        } = tokio::time::timeout(self.accept_timeout, read_message(&mut stream))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no hello"))??
        else {
            return Err(invalid("expected hello"));
        };
        if protocol_version != PROTOCOL_VERSION || service != self.service {
            write_message(&mut stream, &self.welcome(false)).await?;
            return Err(invalid("foreign protocol or service"));
        }
        if handle != PeerHandle::from_public_key(public_key.as_bytes()) {
            return Err(invalid("handle does not match key"));
        }
        let peer = PeerIdentity::new(display_name, handle);

        // Crossing dials: the channel opened by the lower handle wins.
        if let Some(mut done) = self.channels.dial_in_progress(handle) {
            if self.local.handle < handle {
                while !*done.borrow() {
                    if done.changed().await.is_err() {
                        break;
                    }
                }
                if self.channels.is_open(handle) {
                    tracing::debug!(peer = %peer, "crossing channel dropped");
                    return Ok(());
                }
            } else if self.channels.cancel_dial(handle) {
                tracing::debug!(peer = %peer, "own dial yields to crossing channel");
            }
        }

        let decision = self.channels.await_invitation(handle);
        if !self.sink.post(LinkEvent::InvitationReceived { peer: peer.clone() }) {
            return Ok(());
        }
        let accepted = matches!(
            tokio::time::timeout(self.accept_timeout, decision).await,
            Ok(Ok(true))
        );
        self.channels.drop_invitation(handle);
        // An accepted Welcome always has a registered channel behind it.
        let reg = if accepted {
            let reg = self.channels.register(handle);
            if reg.is_none() {
                tracing::debug!(peer = %peer, "duplicate inbound channel refused");
            }
            reg
        } else {
            None
        };
        if let Err(e) = write_message(&mut stream, &self.welcome(reg.is_some())).await {
            if let Some(reg) = &reg {
                self.channels.unregister(handle, reg.id);
            }
            return Err(e);
        }
        let Some(reg) = reg else {
            return Ok(());
        };
        let key = derive_session_key(&self.keypair.shared_secret(&public_key));
        self.pump(stream, peer, key, Role::Responder, reg).await;
        Ok(())
    }

    /// Open a channel to `peer`. The outcome arrives as a state change.
    pub fn dial(self: &Arc<Self>, peer: PeerIdentity, addr: Option<SocketAddr>, timeout: Duration) {
        let Some(addr) = addr else {
            tracing::warn!(peer = %peer, "no address for peer");
            self.post_state(&peer, LinkState::NotConnected);
            return;
        };
        let this = self.clone();
        self.channels.spawn_dial(peer.handle, move |id, done| async move {
            this.dial_task(id, done, peer, addr, timeout).await
        });
    }

    async fn dial_task(
        self: Arc<Self>,
        id: u64,
        done: watch::Sender<bool>,
        peer: PeerIdentity,
        addr: SocketAddr,
        timeout: Duration,
    ) {
        let outcome = match tokio::time::timeout(timeout, self.outbound(&peer, addr)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "no answer to hello")),
        };
        let channel = match outcome {
            Ok(Some((stream, key))) => self.channels.register(peer.handle).map(|reg| (stream, key, reg)),
            Ok(None) => {
                tracing::info!(peer = %peer, "invitation declined");
                None
            }
            Err(e) => {
                tracing::debug!(peer = %peer, %addr, error = %e, "dial failed");
                None
            }
        };
        self.channels.finish_dial(peer.handle, id);
        let _ = done.send(true);
        match channel {
            Some((stream, key, reg)) => self.pump(stream, peer, key, Role::Initiator, reg).await,
            None if self.channels.has_inbound(peer.handle) => {}
            None => self.post_state(&peer, LinkState::NotConnected),
        }
    }

    /// `Ok(None)` when the peer declined.
    async fn outbound(&self, peer: &PeerIdentity, addr: SocketAddr) -> io::Result<Option<(TcpStream, [u8; 32])>> {
        let mut stream = TcpStream::connect(addr).await?;
        self.post_state(peer, LinkState::Connecting);
        write_message(&mut stream, &self.hello()).await?;
        match read_message(&mut stream).await? {
            Message::Welcome { accepted: false, .. } => Ok(None),
            Message::Welcome {
                accepted: true,
                handle,
                public_key,
                ..
            } => {
                if handle != peer.handle || handle != PeerHandle::from_public_key(public_key.as_bytes()) {
                    return Err(invalid("welcome from unexpected peer"));
                }
                let key = derive_session_key(&self.keypair.shared_secret(&public_key));
                Ok(Some((stream, key)))
            }
            _ => Err(invalid("expected welcome")),
        }
    }

    async fn pump(&self, stream: TcpStream, peer: PeerIdentity, key: [u8; 32], role: Role, reg: Registered) {
        let Registered {
            id,
            outbox,
            mut close,
        } = reg;
        tracing::info!(peer = %peer, ?role, "channel open");
        self.post_state(&peer, LinkState::Connected);

        let (mut reader, writer) = stream.into_split();
        tokio::spawn(write_loop(writer, outbox, key, role));
        let mut counter = 0u64;
        loop {
            let sealed = tokio::select! {
                _ = &mut close => break,
                sealed = read_sealed(&mut reader) => sealed,
            };
            let sealed = match sealed {
                Ok(Some(bytes)) => bytes,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(peer = %peer, error = %e, "channel read failed");
                    break;
                }
            };
            match decrypt_wire(&key, role.peer().nonce(counter), &sealed) {
                Ok(bytes) => {
                    counter += 1;
                    if !self.sink.post(LinkEvent::Received {
                        peer: peer.clone(),
                        bytes,
                    }) {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "unreadable frame, closing channel");
                    break;
                }
            }
        }
        if self.channels.unregister(peer.handle, id) {
            self.post_state(&peer, LinkState::NotConnected);
        }
        tracing::info!(peer = %peer, "channel closed");
    }

    pub fn respond(&self, peer: &PeerIdentity, accept: bool) {
        if !self.channels.respond(peer.handle, accept) {
            tracing::debug!(peer = %peer, "no invitation waiting for an answer");
        }
    }

    pub fn send(&self, peer: &PeerIdentity, bytes: Vec<u8>) -> Result<(), ChannelFault> {
        self.channels.send(peer.handle, bytes)
    }

    pub fn close(&self, peer: &PeerIdentity) {
        self.channels.close(peer.handle);
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbox: mpsc::UnboundedReceiver<Vec<u8>>,
    key: [u8; 32],
    role: Role,
) {
    let mut counter = 0u64;
    while let Some(plain) = outbox.recv().await {
        let sealed = match encrypt_wire(&key, role.nonce(counter), &plain) {
            Ok(sealed) => sealed,
            Err(e) => {
                tracing::error!(error = %e, "sealing frame failed");
                break;
            }
        };
        counter += 1;
        if let Err(e) = write_sealed(&mut writer, &sealed).await {
            tracing::debug!(error = %e, "channel write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

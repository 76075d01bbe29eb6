//! LAN discovery: UDP multicast beacons while advertising; while browsing, beacons
//! from others become `PeerFound`, and a `Leave` or 8 s of silence becomes `PeerLost`.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use shk_core::wire::{decode_frame, encode_frame};
use shk_core::{LinkEvent, LinkSink, Message, PeerHandle, PeerIdentity, PublicKey, PROTOCOL_VERSION};
use tokio::net::UdpSocket;
use tokio::sync::watch;

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const BEACON_INTERVAL: Duration = Duration::from_secs(1);
const PEER_TIMEOUT: Duration = Duration::from_secs(8);
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// What our beacons carry.
#[derive(Debug, Clone)]
pub struct Advert {
    pub identity: PeerIdentity,
    pub public_key: PublicKey,
    pub listen_port: u16,
}

impl Advert {
    fn beacon(&self, service: &str) -> Message {
        Message::Beacon {
            protocol_version: PROTOCOL_VERSION,
            service: service.to_string(),
            handle: self.identity.handle,
            display_name: self.identity.display_name.clone(),
            public_key: self.public_key.clone(),
            listen_port: self.listen_port,
        }
    }
}

struct BookEntry {
    identity: PeerIdentity,
    addr: SocketAddr,
    service: String,
    last_seen: Instant,
    /// Reported as found since browsing last started.
    reported: bool,
}

/// Peers heard from recently, keyed by handle.
#[derive(Default)]
pub struct PeerBook {
    entries: Mutex<HashMap<PeerHandle, BookEntry>>,
}

impl PeerBook {
    fn lock(&self) -> MutexGuard<'_, HashMap<PeerHandle, BookEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Channel address a peer's beacon announced.
    pub fn addr_of(&self, handle: &PeerHandle) -> Option<SocketAddr> {
        self.lock().get(handle).map(|e| e.addr)
    }

    /// Record a beacon. Returns the peer and its service when it should be reported as found.
    fn observe(
        &self,
        identity: PeerIdentity,
        service: String,
        addr: SocketAddr,
        now: Instant,
        browsing: bool,
    ) -> Option<(PeerIdentity, String)> {
        let mut entries = self.lock();
        let entry = entries.entry(identity.handle).or_insert_with(|| BookEntry {
            identity: identity.clone(),
            addr,
            service: service.clone(),
            last_seen: now,
            reported: false,
        });
        entry.identity = identity;
        entry.addr = addr;
        entry.service = service;
        entry.last_seen = now;
        if browsing && !entry.reported {
            entry.reported = true;
            return Some((entry.identity.clone(), entry.service.clone()));
        }
        None
    }

    /// Drop a peer. Returns it if browsers were told about it.
    fn forget(&self, handle: &PeerHandle) -> Option<PeerIdentity> {
        self.lock()
            .remove(handle)
            .filter(|e| e.reported)
            .map(|e| e.identity)
    }

    /// Drop peers silent for `timeout`. Returns the ones that had been reported.
    fn expire(&self, now: Instant, timeout: Duration) -> Vec<PeerIdentity> {
        let mut entries = self.lock();
        let stale: Vec<PeerHandle> = entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_seen) >= timeout)
            .map(|(h, _)| *h)
            .collect();
        stale
            .iter()
            .filter_map(|h| entries.remove(h))
            .filter(|e| e.reported)
            .map(|e| e.identity)
            .collect()
    }

    fn unreport_all(&self) {
        for entry in self.lock().values_mut() {
            entry.reported = false;
        }
    }
}

/// Turn one datagram into the event to post, if any.
fn on_datagram(
    book: &PeerBook,
    me: PeerHandle,
    bytes: &[u8],
    from: SocketAddr,
    browsing: bool,
    now: Instant,
) -> Option<LinkEvent> {
    let (msg, _) = decode_frame(bytes).ok()?;
    match msg {
        Message::Beacon {
            protocol_version,
            service,
            handle,
            display_name,
            listen_port,
            ..
        } => {
            if protocol_version != PROTOCOL_VERSION || handle == me {
                return None;
            }
            let addr = SocketAddr::new(from.ip(), listen_port);
            book.observe(PeerIdentity::new(display_name, handle), service, addr, now, browsing)
                .map(|(peer, service)| LinkEvent::PeerFound { peer, service })
        }
        Message::Leave { handle } if handle != me => {
            book.forget(&handle).map(|peer| LinkEvent::PeerLost { peer })
        }
        _ => None,
    }
}

pub struct Discovery {
    advertising: watch::Sender<Option<String>>,
    browsing: watch::Sender<Option<String>>,
    book: Arc<PeerBook>,
}

impl Discovery {
    pub fn bind(port: u16) -> io::Result<UdpSocket> {
        let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
        std_sock.set_multicast_ttl_v4(1)?;
        std_sock.set_nonblocking(true)?;
        UdpSocket::from_std(std_sock)
    }

    /// Spawn the beacon, receive and sweep tasks. They stop once the manager does.
    pub fn start(socket: UdpSocket, port: u16, advert: Advert, sink: LinkSink) -> Self {
        let socket = Arc::new(socket);
        let book = Arc::new(PeerBook::default());
        let (advertising, advertising_rx) = watch::channel(None);
        let (browsing, browsing_rx) = watch::channel(None);
        let dest = SocketAddr::new(MULTICAST_GROUP.into(), port);
        let me = advert.identity.handle;

        tokio::spawn(beacon_loop(socket.clone(), advertising_rx, advert, dest));
        tokio::spawn(recv_loop(socket, book.clone(), browsing_rx, me, sink.clone()));
        tokio::spawn(sweep_loop(book.clone(), sink));
        Self {
            advertising,
            browsing,
            book,
        }
    }

    pub fn advertise(&self, service: Option<&str>) {
        self.advertising.send_replace(service.map(str::to_string));
    }

    pub fn browse(&self, service: Option<&str>) {
        if service.is_none() {
            self.book.unreport_all();
        }
        self.browsing.send_replace(service.map(str::to_string));
    }

    pub fn book(&self) -> &PeerBook {
        &self.book
    }
}

async fn send_message(socket: &UdpSocket, msg: &Message, dest: SocketAddr) {
    match encode_frame(msg) {
        Ok(frame) => {
            if let Err(e) = socket.send_to(&frame, dest).await {
                tracing::debug!(error = %e, "beacon send failed");
            }
        }
        Err(e) => tracing::error!(error = %e, "beacon encode failed"),
    }
}

async fn beacon_loop(
    socket: Arc<UdpSocket>,
    mut advertising: watch::Receiver<Option<String>>,
    advert: Advert,
    dest: SocketAddr,
) {
    let mut tick = tokio::time::interval(BEACON_INTERVAL);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let service = advertising.borrow().clone();
                if let Some(service) = service {
                    send_message(&socket, &advert.beacon(&service), dest).await;
                }
            }
            changed = advertising.changed() => {
                if changed.is_err() {
                    break;
                }
                let service = advertising.borrow_and_update().clone();
                match service {
                    Some(service) => send_message(&socket, &advert.beacon(&service), dest).await,
                    None => {
                        let leave = Message::Leave { handle: advert.identity.handle };
                        send_message(&socket, &leave, dest).await;
                    }
                }
            }
        }
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    book: Arc<PeerBook>,
    browsing: watch::Receiver<Option<String>>,
    me: PeerHandle,
    sink: LinkSink,
) {
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "discovery socket receive failed");
                tokio::time::sleep(SWEEP_INTERVAL).await;
                continue;
            }
        };
        let is_browsing = browsing.borrow().is_some();
        if let Some(event) = on_datagram(&book, me, &buf[..n], from, is_browsing, Instant::now()) {
            tracing::debug!(peer = %event.peer(), %from, "discovery event");
            if !sink.post(event) {
                break;
            }
        }
    }
}

async fn sweep_loop(book: Arc<PeerBook>, sink: LinkSink) {
    loop {
        tokio::time::sleep(SWEEP_INTERVAL).await;
        for peer in book.expire(Instant::now(), PEER_TIMEOUT) {
            tracing::debug!(peer = %peer, "peer went silent");
            if !sink.post(LinkEvent::PeerLost { peer }) {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shk_core::Keypair;

    fn advert(name: &str) -> Advert {
        let kp = Keypair::generate();
        Advert {
            identity: kp.identity(name),
            public_key: kp.public_key().clone(),
            listen_port: 45681,
        }
    }

    fn from() -> SocketAddr {
        "192.168.1.20:45680".parse().unwrap()
    }

    #[test]
    fn beacon_reported_once_while_browsing() {
        let book = PeerBook::default();
        let me = advert("me").identity.handle;
        let other = advert("other");
        let frame = encode_frame(&other.beacon("shkshare")).unwrap();
        let now = Instant::now();

        assert!(on_datagram(&book, me, &frame, from(), false, now).is_none());
        match on_datagram(&book, me, &frame, from(), true, now) {
            Some(LinkEvent::PeerFound { peer, service }) => {
                assert_eq!(peer, other.identity);
                assert_eq!(service, "shkshare");
            }
            other => panic!("expected PeerFound, got {other:?}"),
        }
        assert!(on_datagram(&book, me, &frame, from(), true, now).is_none());
        assert_eq!(
            book.addr_of(&other.identity.handle),
            Some("192.168.1.20:45681".parse().unwrap())
        );

        book.unreport_all();
        assert!(on_datagram(&book, me, &frame, from(), true, now).is_some());
    }

    #[test]
    fn own_and_foreign_version_beacons_ignored() {
        let book = PeerBook::default();
        let me = advert("me");
        let frame = encode_frame(&me.beacon("shkshare")).unwrap();
        assert!(on_datagram(&book, me.identity.handle, &frame, from(), true, Instant::now()).is_none());

        let other = advert("other");
        let old = Message::Beacon {
            protocol_version: PROTOCOL_VERSION + 1,
            service: "shkshare".into(),
            handle: other.identity.handle,
            display_name: "other".into(),
            public_key: other.public_key.clone(),
            listen_port: 1,
        };
        let frame = encode_frame(&old).unwrap();
        assert!(on_datagram(&book, me.identity.handle, &frame, from(), true, Instant::now()).is_none());
        assert!(on_datagram(&book, me.identity.handle, b"garbage", from(), true, Instant::now()).is_none());
    }

    #[test]
    fn leave_and_silence_report_lost() {
        let book = PeerBook::default();
        let me = advert("me").identity.handle;
        let a = advert("a");
        let b = advert("b");
        let t0 = Instant::now();
        for p in [&a, &b] {
            let frame = encode_frame(&p.beacon("shkshare")).unwrap();
            on_datagram(&book, me, &frame, from(), true, t0);
        }

        let leave = encode_frame(&Message::Leave { handle: a.identity.handle }).unwrap();
        match on_datagram(&book, me, &leave, from(), true, t0) {
            Some(LinkEvent::PeerLost { peer }) => assert_eq!(peer, a.identity),
            other => panic!("expected PeerLost, got {other:?}"),
        }
        assert!(book.addr_of(&a.identity.handle).is_none());

        assert!(book.expire(t0 + Duration::from_secs(7), PEER_TIMEOUT).is_empty());
        assert_eq!(book.expire(t0 + PEER_TIMEOUT, PEER_TIMEOUT), vec![b.identity]);
    }

    #[test]
    fn unreported_peers_expire_silently() {
        let book = PeerBook::default();
        let me = advert("me").identity.handle;
        let a = advert("a");
        let t0 = Instant::now();
        let frame = encode_frame(&a.beacon("shkshare")).unwrap();
        on_datagram(&book, me, &frame, from(), false, t0);
        assert!(book.addr_of(&a.identity.handle).is_some());
        assert!(book.expire(t0 + PEER_TIMEOUT, PEER_TIMEOUT).is_empty());
        assert!(book.addr_of(&a.identity.handle).is_none());
    }
}

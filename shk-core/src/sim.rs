//! In-memory links for tests: a call recorder and a tiny multi-node network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::identity::{PeerHandle, PeerIdentity};
use crate::link::{ChannelFault, Link, LinkEvent, LinkState};
use crate::manager::LinkSink;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCall {
    StartAdvertising(String),
    StopAdvertising,
    StartBrowsing(String),
    StopBrowsing,
    Invite(PeerIdentity),
    Respond(PeerIdentity, bool),
    Send(PeerIdentity, Vec<u8>),
    Disconnect(PeerIdentity),
}

/// Records every call; never produces events by itself.
#[derive(Debug, Default)]
pub struct RecordingLink {
    calls: Mutex<Vec<LinkCall>>,
    fail_sends: AtomicBool,
    failing_peers: Mutex<Vec<PeerIdentity>>,
}

impl RecordingLink {
    pub fn calls(&self) -> Vec<LinkCall> {
        lock(&self.calls).clone()
    }

    pub fn invites(&self) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, LinkCall::Invite(_)))
            .count()
    }

    pub fn sent_to(&self, peer: &PeerIdentity) -> Vec<Vec<u8>> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                LinkCall::Send(p, bytes) if p == peer => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Sends to `peer` fault from now on; other peers are unaffected.
    pub fn fail_sends_to(&self, peer: &PeerIdentity) {
        lock(&self.failing_peers).push(peer.clone());
    }

    fn record(&self, call: LinkCall) {
        lock(&self.calls).push(call);
    }
}

impl Link for RecordingLink {
    fn start_advertising(&self, service: &str) {
        self.record(LinkCall::StartAdvertising(service.to_string()));
    }
    fn stop_advertising(&self) {
        self.record(LinkCall::StopAdvertising);
    }
    fn start_browsing(&self, service: &str) {
        self.record(LinkCall::StartBrowsing(service.to_string()));
    }
    fn stop_browsing(&self) {
        self.record(LinkCall::StopBrowsing);
    }
    fn invite(&self, peer: &PeerIdentity, _timeout: Duration) {
        self.record(LinkCall::Invite(peer.clone()));
    }
    fn respond_to_invitation(&self, peer: &PeerIdentity, accept: bool) {
        self.record(LinkCall::Respond(peer.clone(), accept));
    }
    fn send(&self, peer: &PeerIdentity, bytes: Vec<u8>) -> Result<(), ChannelFault> {
        if self.fail_sends.load(Ordering::SeqCst) || lock(&self.failing_peers).contains(peer) {
            return Err(ChannelFault::Io("radio off".into()));
        }
        self.record(LinkCall::Send(peer.clone(), bytes));
        Ok(())
    }
    fn disconnect(&self, peer: &PeerIdentity) {
        self.record(LinkCall::Disconnect(peer.clone()));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Inviting { from: PeerHandle },
    Connected,
}

#[derive(Default)]
struct SimState {
    sinks: HashMap<PeerHandle, LinkSink>,
    advertising: HashMap<PeerHandle, String>,
    browsing: HashMap<PeerHandle, String>,
    channels: HashMap<(PeerHandle, PeerHandle), Channel>,
    delivered: Vec<(PeerHandle, PeerHandle, Vec<u8>)>,
}

impl SimState {
    fn post(&self, to: PeerHandle, event: LinkEvent) {
        if let Some(sink) = self.sinks.get(&to) {
            sink.post(event);
        }
    }
}

fn pair(a: PeerHandle, b: PeerHandle) -> (PeerHandle, PeerHandle) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// A shared medium; each node gets a `SimLink` bound to its identity.
#[derive(Default)]
pub struct SimNetwork {
    state: Mutex<SimState>,
}

impl SimNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn node(self: &Arc<Self>, identity: &PeerIdentity) -> Arc<SimLink> {
        Arc::new(SimLink {
            net: self.clone(),
            me: identity.clone(),
        })
    }

    pub fn attach(&self, identity: &PeerIdentity, sink: LinkSink) {
        lock(&self.state).sinks.insert(identity.handle, sink);
    }

    /// Let `a` and `b` see each other, where browsing and advertising allow it.
    pub fn discover(&self, a: &PeerIdentity, b: &PeerIdentity) {
        let state = lock(&self.state);
        for (seer, seen) in [(a, b), (b, a)] {
            let browsing = state.browsing.get(&seer.handle);
            let advertising = state.advertising.get(&seen.handle);
            if let (Some(_), Some(advert)) = (browsing, advertising) {
                state.post(
                    seer.handle,
                    LinkEvent::PeerFound {
                        peer: seen.clone(),
                        service: advert.clone(),
                    },
                );
            }
        }
    }

    /// Radio loss between two nodes.
    pub fn sever(&self, a: &PeerIdentity, b: &PeerIdentity) {
        let mut state = lock(&self.state);
        if state.channels.remove(&pair(a.handle, b.handle)).is_some() {
            for (to, other) in [(a, b), (b, a)] {
                state.post(
                    to.handle,
                    LinkEvent::StateChanged {
                        peer: other.clone(),
                        state: LinkState::NotConnected,
                    },
                );
            }
        }
    }

    pub fn connected_pairs(&self) -> usize {
        lock(&self.state)
            .channels
            .values()
            .filter(|c| **c == Channel::Connected)
            .count()
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.state).channels.len()
    }

    /// Payloads `from` handed to the medium for `to`, in order.
    pub fn delivered(&self, from: &PeerIdentity, to: &PeerIdentity) -> Vec<Vec<u8>> {
        lock(&self.state)
            .delivered
            .iter()
            .filter(|(f, t, _)| *f == from.handle && *t == to.handle)
            .map(|(_, _, b)| b.clone())
            .collect()
    }

    pub fn is_advertising(&self, who: &PeerIdentity) -> bool {
        lock(&self.state).advertising.contains_key(&who.handle)
    }

    pub fn is_browsing(&self, who: &PeerIdentity) -> bool {
        lock(&self.state).browsing.contains_key(&who.handle)
    }
}

pub struct SimLink {
    net: Arc<SimNetwork>,
    me: PeerIdentity,
}

impl Link for SimLink {
    fn start_advertising(&self, service: &str) {
        lock(&self.net.state)
            .advertising
            .insert(self.me.handle, service.to_string());
    }

    fn stop_advertising(&self) {
        lock(&self.net.state).advertising.remove(&self.me.handle);
    }

    fn start_browsing(&self, service: &str) {
        lock(&self.net.state)
            .browsing
            .insert(self.me.handle, service.to_string());
    }

    fn stop_browsing(&self) {
        lock(&self.net.state).browsing.remove(&self.me.handle);
    }

    fn invite(&self, peer: &PeerIdentity, _timeout: Duration) {
        let mut state = lock(&self.net.state);
        let key = pair(self.me.handle, peer.handle);
        if state.channels.contains_key(&key) {
            return;
        }
        state.channels.insert(
            key,
            Channel::Inviting {
                from: self.me.handle,
            },
        );
        state.post(
            peer.handle,
            LinkEvent::InvitationReceived {
                peer: self.me.clone(),
            },
        );
    }

    fn respond_to_invitation(&self, peer: &PeerIdentity, accept: bool) {
        let mut state = lock(&self.net.state);
        let key = pair(self.me.handle, peer.handle);
        if state.channels.get(&key) != Some(&Channel::Inviting { from: peer.handle }) {
            return;
        }
        if accept {
            state.channels.insert(key, Channel::Connected);
            for (to, other) in [(&self.me, peer), (peer, &self.me)] {
                state.post(
                    to.handle,
                    LinkEvent::StateChanged {
                        peer: other.clone(),
                        state: LinkState::Connected,
                    },
                );
            }
        } else {
            state.channels.remove(&key);
            state.post(
                peer.handle,
                LinkEvent::StateChanged {
                    peer: self.me.clone(),
                    state: LinkState::NotConnected,
                },
            );
        }
    }

    fn send(&self, peer: &PeerIdentity, bytes: Vec<u8>) -> Result<(), ChannelFault> {
        let mut state = lock(&self.net.state);
        let key = pair(self.me.handle, peer.handle);
        if state.channels.get(&key) != Some(&Channel::Connected) {
            return Err(ChannelFault::NotConnected);
        }
        state
            .delivered
            .push((self.me.handle, peer.handle, bytes.clone()));
        state.post(
            peer.handle,
            LinkEvent::Received {
                peer: self.me.clone(),
                bytes,
            },
        );
        Ok(())
    }

    fn disconnect(&self, peer: &PeerIdentity) {
        let mut state = lock(&self.net.state);
        if state
            .channels
            .remove(&pair(self.me.handle, peer.handle))
            .is_some()
        {
            state.post(
                peer.handle,
                LinkEvent::StateChanged {
                    peer: self.me.clone(),
                    state: LinkState::NotConnected,
                },
            );
        }
    }
}

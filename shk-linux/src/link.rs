//! `Link` for Linux: multicast discovery plus the TCP transport.

use std::sync::Arc;
use std::time::Duration;

use shk_core::{ChannelFault, Link, PeerIdentity};

use crate::discovery::Discovery;
use crate::transport::Transport;

pub struct LinuxLink {
    discovery: Discovery,
    transport: Arc<Transport>,
}

impl LinuxLink {
    pub fn new(discovery: Discovery, transport: Arc<Transport>) -> Self {
        Self {
            discovery,
            transport,
        }
    }
}

impl Link for LinuxLink {
    fn start_advertising(&self, service: &str) {
        tracing::debug!(service, "advertising");
        self.discovery.advertise(Some(service));
    }

    fn stop_advertising(&self) {
        tracing::debug!("advertising stopped");
        self.discovery.advertise(None);
    }

    fn start_browsing(&self, service: &str) {
        tracing::debug!(service, "browsing");
        self.discovery.browse(Some(service));
    }

    fn stop_browsing(&self) {
        tracing::debug!("browsing stopped");
        self.discovery.browse(None);
    }

    fn invite(&self, peer: &PeerIdentity, timeout: Duration) {
        let addr = self.discovery.book().addr_of(&peer.handle);
        self.transport.dial(peer.clone(), addr, timeout);
    }

    fn respond_to_invitation(&self, peer: &PeerIdentity, accept: bool) {
        self.transport.respond(peer, accept);
    }

    fn send(&self, peer: &PeerIdentity, bytes: Vec<u8>) -> Result<(), ChannelFault> {
        self.transport.send(peer, bytes)
    }

    fn disconnect(&self, peer: &PeerIdentity) {
        self.transport.close(peer);
    }
}

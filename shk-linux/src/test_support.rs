//! A session manager over a link that does nothing, for tests that only need a sink.

use std::sync::Arc;
use std::time::Duration;

use shk_core::router::LocalProfile;
use shk_core::store::{MemoryAlbumStore, MemoryFriendStore};
use shk_core::{
    ChannelFault, Config, Link, ManagerHandle, PeerHandle, PeerIdentity, SessionManager, Stores,
};

pub struct Idle;

impl Link for Idle {
    fn start_advertising(&self, _: &str) {}
    fn stop_advertising(&self) {}
    fn start_browsing(&self, _: &str) {}
    fn stop_browsing(&self) {}
    fn invite(&self, _: &PeerIdentity, _: Duration) {}
    fn respond_to_invitation(&self, _: &PeerIdentity, _: bool) {}
    fn send(&self, _: &PeerIdentity, _: Vec<u8>) -> Result<(), ChannelFault> {
        Err(ChannelFault::NotConnected)
    }
    fn disconnect(&self, _: &PeerIdentity) {}
}

pub fn idle_manager() -> ManagerHandle {
    SessionManager::spawn(
        Config::default(),
        PeerIdentity::new("me", PeerHandle::random()),
        LocalProfile {
            user_uuid: "ME".into(),
            nickname: "me".into(),
            profile_url: None,
            badges: Vec::new(),
        },
        Stores {
            friends: Arc::new(MemoryFriendStore::default()),
            album: Arc::new(MemoryAlbumStore::default()),
        },
        |_| {
            let link: Arc<dyn Link> = Arc::new(Idle);
            link
        },
    )
    .unwrap()
}

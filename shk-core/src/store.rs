//! Collaborator seams: friend records, the photo album and the persisted local identity.
//! The app supplies real persistence; the in-memory versions back tests and the daemon.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::protocol::Badge;

/// A registered friend as the application stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Friend {
    pub uuid: String,
    pub nickname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_url: Option<String>,
    #[serde(default)]
    pub badges: Vec<Badge>,
}

/// One image in the album. A received photo pair becomes two entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumPhoto {
    pub sender_uuid: String,
    pub image: Vec<u8>,
    pub message: String,
    pub received_at: SystemTime,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no friend with uuid {0}")]
    NotFound(String),
    #[error("friend {0} already registered")]
    AlreadyRegistered(String),
    #[error("nickname {0:?} already in use")]
    DuplicateNickname(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub trait FriendStore: Send + Sync {
    fn has_friend(&self, uuid: &str) -> bool;
    fn nickname_taken(&self, nickname: &str) -> bool;
    fn register(&self, friend: Friend) -> Result<(), StoreError>;
    /// Append badges not already present (by id). Returns how many were added.
    fn append_badges(&self, uuid: &str, badges: &[Badge]) -> Result<usize, StoreError>;
    fn update_profile_url(&self, uuid: &str, url: Option<&str>) -> Result<(), StoreError>;
    fn friend(&self, uuid: &str) -> Option<Friend>;
}

pub trait AlbumStore: Send + Sync {
    fn add_photo(&self, photo: AlbumPhoto) -> Result<(), StoreError>;
}

/// Per-install storage for the local `userUUID`.
pub trait PersistedIdentity: Send + Sync {
    fn get(&self) -> Result<Option<String>, StoreError>;
    fn set(&self, uuid: &str) -> Result<(), StoreError>;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Friend list held in memory. Clones share the same list.
#[derive(Debug, Clone, Default)]
pub struct MemoryFriendStore {
    friends: Arc<Mutex<Vec<Friend>>>,
}

impl MemoryFriendStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_friends(friends: Vec<Friend>) -> Self {
        Self {
            friends: Arc::new(Mutex::new(friends)),
        }
    }

    pub fn all(&self) -> Vec<Friend> {
        lock(&self.friends).clone()
    }

    pub fn replace_all(&self, friends: Vec<Friend>) {
        *lock(&self.friends) = friends;
    }
}

impl FriendStore for MemoryFriendStore {
    fn has_friend(&self, uuid: &str) -> bool {
        lock(&self.friends).iter().any(|f| f.uuid == uuid)
    }

    fn nickname_taken(&self, nickname: &str) -> bool {
        lock(&self.friends).iter().any(|f| f.nickname == nickname)
    }

    fn register(&self, friend: Friend) -> Result<(), StoreError> {
        let mut friends = lock(&self.friends);
        if friends.iter().any(|f| f.uuid == friend.uuid) {
            return Err(StoreError::AlreadyRegistered(friend.uuid));
        }
        if friends.iter().any(|f| f.nickname == friend.nickname) {
            return Err(StoreError::DuplicateNickname(friend.nickname));
        }
        friends.push(friend);
        Ok(())
    }

    fn append_badges(&self, uuid: &str, badges: &[Badge]) -> Result<usize, StoreError> {
        let mut friends = lock(&self.friends);
        let friend = friends
            .iter_mut()
            .find(|f| f.uuid == uuid)
            .ok_or_else(|| StoreError::NotFound(uuid.to_string()))?;
        let mut added = 0;
        for badge in badges {
            if !friend.badges.iter().any(|b| b.id == badge.id) {
                friend.badges.push(badge.clone());
                added += 1;
            }
        }
        Ok(added)
    }

    fn update_profile_url(&self, uuid: &str, url: Option<&str>) -> Result<(), StoreError> {
        let mut friends = lock(&self.friends);
        let friend = friends
            .iter_mut()
            .find(|f| f.uuid == uuid)
            .ok_or_else(|| StoreError::NotFound(uuid.to_string()))?;
        friend.profile_url = url.map(str::to_string);
        Ok(())
    }

    fn friend(&self, uuid: &str) -> Option<Friend> {
        lock(&self.friends).iter().find(|f| f.uuid == uuid).cloned()
    }
}

/// Album held in memory, grouped by sender.
#[derive(Debug, Clone, Default)]
pub struct MemoryAlbumStore {
    photos: Arc<Mutex<HashMap<String, Vec<AlbumPhoto>>>>,
}

impl MemoryAlbumStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn photos_from(&self, sender_uuid: &str) -> Vec<AlbumPhoto> {
        lock(&self.photos)
            .get(sender_uuid)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        lock(&self.photos).values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AlbumStore for MemoryAlbumStore {
    fn add_photo(&self, photo: AlbumPhoto) -> Result<(), StoreError> {
        lock(&self.photos)
            .entry(photo.sender_uuid.clone())
            .or_default()
            .push(photo);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryIdentity {
    value: Mutex<Option<String>>,
}

impl MemoryIdentity {
    pub fn with_value(uuid: &str) -> Self {
        Self {
            value: Mutex::new(Some(uuid.to_string())),
        }
    }
}

impl PersistedIdentity for MemoryIdentity {
    fn get(&self) -> Result<Option<String>, StoreError> {
        Ok(lock(&self.value).clone())
    }

    fn set(&self, uuid: &str) -> Result<(), StoreError> {
        *lock(&self.value) = Some(uuid.to_string());
        Ok(())
    }
}

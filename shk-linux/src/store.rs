//! On-disk stores under the data dir: `user_uuid`, `friends.toml`, `album/<sender>/`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use shk_core::store::MemoryFriendStore;
use shk_core::{AlbumPhoto, AlbumStore, Badge, Friend, FriendStore, PersistedIdentity, StoreError};

/// The local `userUUID`, one line in a file.
pub struct FileIdentity {
    path: PathBuf,
}

impl FileIdentity {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join("user_uuid"),
        }
    }
}

impl PersistedIdentity for FileIdentity {
    fn get(&self) -> Result<Option<String>, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, uuid: &str) -> Result<(), StoreError> {
        write_atomic(&self.path, format!("{uuid}\n").as_bytes())?;
        Ok(())
    }
}

#[derive(Default, Serialize, Deserialize)]
struct FriendsFile {
    #[serde(default)]
    friends: Vec<Friend>,
}

/// Friend list kept in memory and rewritten to `friends.toml` after each change.
pub struct FileFriendStore {
    path: PathBuf,
    inner: MemoryFriendStore,
}

impl FileFriendStore {
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let path = data_dir.join("friends.toml");
        let file = match std::fs::read_to_string(&path) {
            Ok(s) => toml::from_str::<FriendsFile>(&s)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => FriendsFile::default(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), friends = file.friends.len(), "friend list loaded");
        Ok(Self {
            path,
            inner: MemoryFriendStore::with_friends(file.friends),
        })
    }

    /// A detached copy to apply a change to before it is written out.
    fn staged(&self) -> MemoryFriendStore {
        MemoryFriendStore::with_friends(self.inner.all())
    }

    /// Write `staged` to disk; memory only follows once the file is in place.
    fn commit(&self, staged: MemoryFriendStore) -> Result<(), StoreError> {
        let file = FriendsFile {
            friends: staged.all(),
        };
        let s = toml::to_string(&file).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_atomic(&self.path, s.as_bytes())?;
        self.inner.replace_all(file.friends);
        Ok(())
    }
}

impl FriendStore for FileFriendStore {
    fn has_friend(&self, uuid: &str) -> bool {
        self.inner.has_friend(uuid)
    }

    fn nickname_taken(&self, nickname: &str) -> bool {
        self.inner.nickname_taken(nickname)
    }

    fn register(&self, friend: Friend) -> Result<(), StoreError> {
        let staged = self.staged();
        staged.register(friend)?;
        self.commit(staged)
    }

    fn append_badges(&self, uuid: &str, badges: &[Badge]) -> Result<usize, StoreError> {
        let staged = self.staged();
        let added = staged.append_badges(uuid, badges)?;
        if added > 0 {
            self.commit(staged)?;
        }
        Ok(added)
    }

    fn update_profile_url(&self, uuid: &str, url: Option<&str>) -> Result<(), StoreError> {
        let staged = self.staged();
        staged.update_profile_url(uuid, url)?;
        self.commit(staged)
    }

    fn friend(&self, uuid: &str) -> Option<Friend> {
        self.inner.friend(uuid)
    }
}

/// Received images as files: `album/<sender>/<millis>-<n>.jpg`, caption in a `.txt` beside it.
pub struct AlbumDir {
    dir: PathBuf,
    seq: AtomicU64,
}

impl AlbumDir {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join("album"),
            seq: AtomicU64::new(0),
        }
    }
}

impl AlbumStore for AlbumDir {
    fn add_photo(&self, photo: AlbumPhoto) -> Result<(), StoreError> {
        // Sender uuids come off the wire.
        let sender: String = photo
            .sender_uuid
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect();
        let sender = if sender.is_empty() { "unknown".to_string() } else { sender };
        let dir = self.dir.join(sender);
        std::fs::create_dir_all(&dir)?;
        let millis = photo
            .received_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        let stem = format!("{millis}-{n}");
        std::fs::write(dir.join(format!("{stem}.jpg")), &photo.image)?;
        if !photo.message.is_empty() {
            std::fs::write(dir.join(format!("{stem}.txt")), &photo.message)?;
        }
        tracing::debug!(dir = %dir.display(), file = %stem, bytes = photo.image.len(), "photo saved");
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

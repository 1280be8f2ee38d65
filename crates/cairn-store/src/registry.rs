//! Bucket hash registry: user id -> hashes of the latest snapshots.
//!
//! The registry is the only mutable pointer in the system. Snapshots
//! themselves are immutable; every mutation writes a new one and moves the
//! pointer here afterwards.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use cairn_shared::constants::APP_NAME;
use cairn_shared::UserId;

use crate::error::Result;

const REGISTRY_FILE_NAME: &str = "user_buckets.json";

/// Which of a user's three documents a pointer refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketKind {
    Main,
    SentRequests,
    ReceivedRequests,
}

impl BucketKind {
    pub const ALL: [BucketKind; 3] = [
        BucketKind::Main,
        BucketKind::SentRequests,
        BucketKind::ReceivedRequests,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BucketKind::Main => "main",
            BucketKind::SentRequests => "sent_requests",
            BucketKind::ReceivedRequests => "received_requests",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketPointer {
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

impl BucketPointer {
    pub fn now(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            created_at: Utc::now(),
        }
    }
}

/// All pointers held for one user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<BucketPointer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_requests: Option<BucketPointer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_requests: Option<BucketPointer>,
}

impl RegistryEntry {
    pub fn pointer(&self, kind: BucketKind) -> Option<&BucketPointer> {
        match kind {
            BucketKind::Main => self.main.as_ref(),
            BucketKind::SentRequests => self.sent_requests.as_ref(),
            BucketKind::ReceivedRequests => self.received_requests.as_ref(),
        }
    }

    pub fn hash(&self, kind: BucketKind) -> Option<&str> {
        self.pointer(kind).map(|p| p.hash.as_str())
    }

    pub fn set(&mut self, kind: BucketKind, pointer: BucketPointer) {
        let slot = match kind {
            BucketKind::Main => &mut self.main,
            BucketKind::SentRequests => &mut self.sent_requests,
            BucketKind::ReceivedRequests => &mut self.received_requests,
        };
        *slot = Some(pointer);
    }
}

/// Durable key-value contract consumed by the bucket store.
pub trait HashRegistry: Send + Sync {
    fn get(&self, user: &UserId) -> Result<Option<RegistryEntry>>;

    /// Point `kind` for `user` at `hash`. Must be durable when it returns.
    fn set(&self, user: &UserId, kind: BucketKind, hash: &str) -> Result<()>;

    fn hash(&self, user: &UserId, kind: BucketKind) -> Result<Option<String>> {
        Ok(self
            .get(user)?
            .and_then(|entry| entry.hash(kind).map(str::to_string)))
    }

    fn has_bucket(&self, user: &UserId) -> Result<bool> {
        Ok(self.get(user)?.map_or(false, |entry| entry.main.is_some()))
    }

    fn created_at(&self, user: &UserId, kind: BucketKind) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .get(user)?
            .and_then(|entry| entry.pointer(kind).map(|p| p.created_at)))
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryRegistry {
    entries: Mutex<HashMap<UserId, RegistryEntry>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HashRegistry for MemoryRegistry {
    fn get(&self, user: &UserId) -> Result<Option<RegistryEntry>> {
        Ok(self.entries.lock().get(user).cloned())
    }

    fn set(&self, user: &UserId, kind: BucketKind, hash: &str) -> Result<()> {
        self.entries
            .lock()
            .entry(user.clone())
            .or_default()
            .set(kind, BucketPointer::now(hash));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JSON file
// ---------------------------------------------------------------------------

/// Registry persisted as one pretty-printed JSON document keyed by the
/// stringified user id.
#[derive(Debug)]
pub struct JsonFileRegistry {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, RegistryEntry>>,
}

impl JsonFileRegistry {
    /// Open (or create) the registry document at `path`.
    ///
    /// An unreadable document is logged and replaced by an empty registry on
    /// the next write.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let entries = match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Registry document unreadable, starting empty");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        info!(path = %path.display(), users = entries.len(), "Opened bucket registry");

        Ok(Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, entries: &BTreeMap<String, RegistryEntry>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl HashRegistry for JsonFileRegistry {
    fn get(&self, user: &UserId) -> Result<Option<RegistryEntry>> {
        Ok(self.entries.lock().get(user.as_str()).cloned())
    }

    fn set(&self, user: &UserId, kind: BucketKind, hash: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        let mut next = entries.clone();
        next.entry(user.to_string())
            .or_default()
            .set(kind, BucketPointer::now(hash));

        // Only adopt the new map once it is on disk.
        self.write(&next)?;
        *entries = next;

        debug!(user = %user, kind = kind.as_str(), hash = %hash, "Registry pointer updated");
        Ok(())
    }
}

/// `<data dir>/user_buckets.json` for the current platform, if one exists.
///
/// Linux: `~/.local/share/cairn/user_buckets.json`
pub fn default_registry_path() -> Option<PathBuf> {
    ProjectDirs::from("org", APP_NAME, APP_NAME)
        .map(|dirs| dirs.data_dir().join(REGISTRY_FILE_NAME))
}

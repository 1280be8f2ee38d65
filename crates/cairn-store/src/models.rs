//! Documents persisted (sealed) in the content store.
//!
//! Every struct derives `Serialize` and `Deserialize`; the JSON form is what
//! gets encrypted and hashed.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use cairn_shared::constants::MAX_CHAT_HISTORY;
use cairn_shared::crypto::digest_id;
use cairn_shared::UserId;

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// A single chat message.
///
/// Inside a snapshot `content` is an envelope token; values returned by
/// [`BucketStore::chat_history`](crate::BucketStore::chat_history) carry the
/// decrypted text instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    /// Merge key. Two messages with the same id are the same message.
    pub id: String,
    pub sender_id: UserId,
    pub username: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// Stamp a new message; the id is derived from sender and send time.
    pub fn new(sender_id: UserId, username: impl Into<String>, content: impl Into<String>) -> Self {
        let timestamp = Utc::now();
        let id = digest_id(&[
            sender_id.as_str(),
            &timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
        ]);
        Self {
            id,
            sender_id,
            username: username.into(),
            content: content.into(),
            timestamp,
        }
    }

    /// Required fields are present. Used to vet messages from peers.
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty() && !self.sender_id.as_str().is_empty() && !self.username.is_empty()
    }
}

/// Union of two histories keyed by message id.
///
/// On a duplicate id the `peer` copy wins. The result is ordered by
/// `(timestamp, id)` and capped to the most recent [`MAX_CHAT_HISTORY`].
pub fn merge_chat_histories(local: &[ChatMessage], peer: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut by_id: HashMap<&str, &ChatMessage> = HashMap::with_capacity(local.len() + peer.len());
    for msg in local.iter().chain(peer.iter()) {
        by_id.insert(msg.id.as_str(), msg);
    }

    let mut merged: Vec<ChatMessage> = by_id.into_values().cloned().collect();
    merged.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    cap_history(&mut merged);
    merged
}

/// Drop the oldest entries beyond [`MAX_CHAT_HISTORY`].
pub fn cap_history(history: &mut Vec<ChatMessage>) {
    if history.len() > MAX_CHAT_HISTORY {
        let excess = history.len() - MAX_CHAT_HISTORY;
        history.drain(..excess);
    }
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

/// Metadata for a file whose encrypted bytes live in the content store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRecord {
    pub id: String,
    pub name: String,
    /// Content store hash of the encrypted bytes.
    pub content_hash: String,
    pub timestamp: DateTime<Utc>,
    /// Plaintext size in bytes.
    pub size: u64,
}

// ---------------------------------------------------------------------------
// Bucket
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BucketMetadata {
    pub owner_id: UserId,
    pub owner_username: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// One user's chat history and file index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BucketSnapshot {
    pub metadata: BucketMetadata,
    #[serde(default)]
    pub chat_history: Vec<ChatMessage>,
    #[serde(default)]
    pub files: BTreeMap<String, FileRecord>,
}

impl BucketSnapshot {
    pub fn empty(owner_id: UserId, owner_username: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            metadata: BucketMetadata {
                owner_id,
                owner_username: owner_username.into(),
                created_at: now,
                last_updated: now,
            },
            chat_history: Vec::new(),
            files: BTreeMap::new(),
        }
    }

    pub fn contains_message(&self, id: &str) -> bool {
        self.chat_history.iter().any(|m| m.id == id)
    }

    /// Append and evict beyond the cap.
    pub fn push_message(&mut self, message: ChatMessage) {
        self.chat_history.push(message);
        cap_history(&mut self.chat_history);
    }

    pub fn touch(&mut self) {
        self.metadata.last_updated = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Friend,
    FileTransfer,
}

/// A friend or file-transfer request mirrored into both parties' buckets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestRecord {
    pub id: String,
    pub requester_id: UserId,
    pub recipient_id: UserId,
    pub kind: RequestKind,
    /// File id for transfer requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RequestRecord {
    pub fn new(requester_id: UserId, recipient_id: UserId, kind: RequestKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            requester_id,
            recipient_id,
            kind,
            subject: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

/// Sent or received request list, stored as its own document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestList {
    #[serde(default)]
    pub requests: Vec<RequestRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

//! The per-user bucket: load, mutate, persist, merge.
//!
//! Reads degrade and writes fail loudly. A missing or undecryptable snapshot
//! on `load` yields an empty bucket with a warning, while every mutating
//! call propagates content store and registry errors to the caller.
//!
//! Each mutation works on a copy of the in-memory state. The copy is sealed
//! and written to the content store, the registry pointer is moved, and only
//! then does the copy replace the in-memory state. A failed write therefore
//! leaves both the registry and the in-memory view where they were.

use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use cairn_shared::crypto::digest_id;
use cairn_shared::{CryptoEnvelope, EnvelopeKind, UserId};

use crate::content::ContentStore;
use crate::error::{Result, StoreError};
use crate::models::{
    merge_chat_histories, BucketSnapshot, ChatMessage, FileRecord, RequestList, RequestRecord,
};
use crate::registry::{BucketKind, HashRegistry, RegistryEntry};

/// Which request list to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestView {
    /// Requests this user made
    Sent,
    /// Requests addressed to this user
    Received,
    All,
}

#[derive(Debug, Clone)]
struct BucketState {
    snapshot: BucketSnapshot,
    main_hash: Option<String>,
    /// Registered main hash that `load` could not read.
    unread_main: Option<String>,
    sent: RequestList,
    received: RequestList,
}

impl BucketState {
    fn empty(owner: &UserId, username: &str) -> Self {
        Self {
            snapshot: BucketSnapshot::empty(owner.clone(), username),
            main_hash: None,
            unread_main: None,
            sent: RequestList::default(),
            received: RequestList::default(),
        }
    }
}

/// Single-writer store for one user's bucket.
///
/// The state mutex doubles as the per-user mutation lock: it is held across
/// the whole read-modify-write, including the content store round trips.
pub struct BucketStore {
    owner: UserId,
    username: String,
    content: Arc<dyn ContentStore>,
    registry: Arc<dyn HashRegistry>,
    crypto: CryptoEnvelope,
    state: Mutex<BucketState>,
}

impl BucketStore {
    /// Build the store and load whatever the registry points at.
    pub async fn open(
        owner: UserId,
        username: impl Into<String>,
        content: Arc<dyn ContentStore>,
        registry: Arc<dyn HashRegistry>,
        crypto: CryptoEnvelope,
    ) -> Self {
        let username = username.into();
        let store = Self {
            state: Mutex::new(BucketState::empty(&owner, &username)),
            owner,
            username,
            content,
            registry,
            crypto,
        };
        store.load().await;
        store
    }

    pub fn owner(&self) -> &UserId {
        &self.owner
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn crypto(&self) -> &CryptoEnvelope {
        &self.crypto
    }

    // -----------------------------------------------------------------------
    // Load
    // -----------------------------------------------------------------------

    /// Replace the in-memory state with the latest registered snapshots.
    ///
    /// Never fails: each document that cannot be fetched or decrypted is
    /// replaced by its empty form and logged.
    pub async fn load(&self) {
        let mut state = self.state.lock().await;

        let entry = match self.registry_get().await {
            Ok(entry) => entry.unwrap_or_default(),
            Err(e) => {
                warn!(user = %self.owner, error = %e, "Registry lookup failed, starting empty");
                RegistryEntry::default()
            }
        };

        let mut next = BucketState::empty(&self.owner, &self.username);

        if let Some(hash) = entry.hash(BucketKind::Main) {
            match self.fetch_document::<BucketSnapshot>(hash).await {
                Ok(snapshot) => {
                    info!(
                        user = %self.owner,
                        hash = %hash,
                        messages = snapshot.chat_history.len(),
                        files = snapshot.files.len(),
                        "Loaded bucket"
                    );
                    next.snapshot = snapshot;
                    next.main_hash = Some(hash.to_string());
                }
                Err(e) => {
                    warn!(user = %self.owner, hash = %hash, error = %e, "Could not load bucket, starting empty");
                    next.unread_main = Some(hash.to_string());
                }
            }
        } else {
            debug!(user = %self.owner, "No bucket registered yet");
        }

        next.sent = self.load_requests(&entry, BucketKind::SentRequests).await;
        next.received = self.load_requests(&entry, BucketKind::ReceivedRequests).await;

        *state = next;
    }

    async fn load_requests(&self, entry: &RegistryEntry, kind: BucketKind) -> RequestList {
        let Some(hash) = entry.hash(kind) else {
            return RequestList::default();
        };
        match self.fetch_document::<RequestList>(hash).await {
            Ok(list) => list,
            Err(e) => {
                warn!(user = %self.owner, kind = kind.as_str(), hash = %hash, error = %e, "Could not load request list");
                RequestList::default()
            }
        }
    }

    // -----------------------------------------------------------------------
    // Chat
    // -----------------------------------------------------------------------

    /// Compose a message from this bucket's owner and append it.
    pub async fn post_message(&self, content: &str) -> Result<(ChatMessage, String)> {
        let message = ChatMessage::new(self.owner.clone(), self.username.clone(), content);
        let hash = self.append_message(message.clone()).await?;
        Ok((message, hash))
    }

    /// Append `message` (plaintext `content`) and persist a new snapshot.
    ///
    /// Only `content` is encrypted. A message whose id is already present is
    /// not appended again; the current hash is returned.
    pub async fn append_message(&self, message: ChatMessage) -> Result<String> {
        let mut state = self.state.lock().await;

        if state.snapshot.contains_message(&message.id) {
            if let Some(hash) = &state.main_hash {
                debug!(id = %message.id, "Message already in bucket");
                return Ok(hash.clone());
            }
        }

        let mut stored = message;
        stored.content = self
            .crypto
            .encrypt_message(&stored.content, EnvelopeKind::Chat)?;

        let mut snapshot = state.snapshot.clone();
        if !snapshot.contains_message(&stored.id) {
            snapshot.push_message(stored);
        }
        self.commit_snapshot(&mut state, snapshot).await
    }

    /// Accept a message relayed by a peer.
    pub async fn receive_message(&self, message: ChatMessage) -> Result<String> {
        if !message.is_valid() {
            return Err(StoreError::InvalidMessage(format!(
                "message {:?} is missing required fields",
                message.id
            )));
        }
        self.append_message(message).await
    }

    /// Chat history with contents decrypted, oldest first.
    ///
    /// Entries that no longer decrypt are skipped with a warning.
    pub async fn chat_history(&self) -> Vec<ChatMessage> {
        let state = self.state.lock().await;
        state
            .snapshot
            .chat_history
            .iter()
            .filter_map(|msg| match self.crypto.decrypt_message(&msg.content) {
                Ok(envelope) => Some(ChatMessage {
                    content: envelope.content,
                    ..msg.clone()
                }),
                Err(e) => {
                    warn!(id = %msg.id, error = %e, "Skipping undecryptable message");
                    None
                }
            })
            .collect()
    }

    /// Drop every message. Persists even when the history is already empty
    /// so the returned hash is always current.
    pub async fn clear_history(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        let mut snapshot = state.snapshot.clone();
        snapshot.chat_history.clear();
        self.commit_snapshot(&mut state, snapshot).await
    }

    /// Merge the peer snapshot at `peer_hash` into ours and persist.
    pub async fn sync(&self, peer_hash: &str) -> Result<String> {
        let mut state = self.state.lock().await;

        let peer: BucketSnapshot = self.fetch_document(peer_hash).await?;

        let mut snapshot = state.snapshot.clone();
        let before = snapshot.chat_history.len();
        snapshot.chat_history = merge_chat_histories(&snapshot.chat_history, &peer.chat_history);

        info!(
            user = %self.owner,
            peer = %peer.metadata.owner_id,
            before,
            after = snapshot.chat_history.len(),
            "Merged peer chat history"
        );

        self.commit_snapshot(&mut state, snapshot).await
    }

    // -----------------------------------------------------------------------
    // Files
    // -----------------------------------------------------------------------

    /// Encrypt `bytes`, store them, and index them under `name`.
    pub async fn add_file(&self, bytes: &[u8], name: &str) -> Result<FileRecord> {
        // Capacity is checked here, before anything touches the network.
        let sealed = self.crypto.encrypt_file(bytes)?;

        let mut state = self.state.lock().await;

        let content_hash = self.content.put(&sealed).await?;
        let now = Utc::now();
        let record = FileRecord {
            id: digest_id(&[
                self.owner.as_str(),
                &now.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
            ]),
            name: name.to_string(),
            content_hash,
            timestamp: now,
            size: bytes.len() as u64,
        };

        let mut snapshot = state.snapshot.clone();
        snapshot.files.insert(record.id.clone(), record.clone());
        let bucket_hash = self.commit_snapshot(&mut state, snapshot).await?;

        info!(
            file_id = %record.id,
            name = %record.name,
            size = record.size,
            bucket = %bucket_hash,
            "Added file to bucket"
        );
        Ok(record)
    }

    /// Remove a file from the index. `false` when it was not there.
    pub async fn delete_file(&self, file_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;

        let Some(record) = state.snapshot.files.get(file_id).cloned() else {
            return Ok(false);
        };

        let mut snapshot = state.snapshot.clone();
        snapshot.files.remove(file_id);
        self.commit_snapshot(&mut state, snapshot).await?;

        if let Err(e) = self.content.unpin(&record.content_hash).await {
            warn!(file_id, hash = %record.content_hash, error = %e, "Could not unpin deleted file");
        }
        Ok(true)
    }

    /// Files, newest first.
    pub async fn files(&self) -> Vec<FileRecord> {
        let state = self.state.lock().await;
        let mut files: Vec<FileRecord> = state.snapshot.files.values().cloned().collect();
        files.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        files
    }

    /// Files whose name equals or contains `query`, ignoring case.
    pub async fn search_files(&self, query: &str) -> Vec<FileRecord> {
        let needle = query.to_lowercase();
        self.files()
            .await
            .into_iter()
            .filter(|f| f.name.to_lowercase().contains(&needle))
            .collect()
    }

    /// Newest file stored under exactly `name`.
    pub async fn file_by_name(&self, name: &str) -> Option<FileRecord> {
        self.files().await.into_iter().find(|f| f.name == name)
    }

    pub async fn file(&self, file_id: &str) -> Option<FileRecord> {
        self.state.lock().await.snapshot.files.get(file_id).cloned()
    }

    /// Encrypted bytes of a file exactly as stored. `None` when the record
    /// or its content is unavailable.
    pub async fn get_file_ciphertext(&self, file_id: &str) -> Option<Vec<u8>> {
        let record = self.file(file_id).await?;
        match self.content.get(&record.content_hash).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(file_id, hash = %record.content_hash, error = %e, "Could not fetch file content");
                None
            }
        }
    }

    /// Decrypted bytes of a file. `None` when missing or undecryptable.
    pub async fn get_file_content(&self, file_id: &str) -> Option<Vec<u8>> {
        let sealed = self.get_file_ciphertext(file_id).await?;
        match self.crypto.decrypt_file(&sealed) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(file_id, error = %e, "Could not decrypt file content");
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    /// Store a request in the sent list when this user made it, otherwise
    /// in the received list. Only that list is rewritten.
    pub async fn record_request(&self, request: RequestRecord) -> Result<String> {
        let mut state = self.state.lock().await;
        let kind = self.request_kind(&request);

        let mut list = self.request_list(&state, kind).clone();
        list.requests.retain(|r| r.id != request.id);
        list.requests.push(request);
        self.commit_requests(&mut state, kind, list).await
    }

    /// Drop a request from whichever list holds it. `false` when absent.
    pub async fn remove_request(&self, request_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;

        for kind in [BucketKind::SentRequests, BucketKind::ReceivedRequests] {
            let list = self.request_list(&state, kind);
            if list.requests.iter().any(|r| r.id == request_id) {
                let mut list = list.clone();
                list.requests.retain(|r| r.id != request_id);
                self.commit_requests(&mut state, kind, list).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Requests filtered by comparing `requester_id` with the owner.
    pub async fn requests(&self, view: RequestView) -> Vec<RequestRecord> {
        let state = self.state.lock().await;
        state
            .sent
            .requests
            .iter()
            .chain(state.received.requests.iter())
            .filter(|r| match view {
                RequestView::Sent => r.requester_id == self.owner,
                RequestView::Received => r.requester_id != self.owner,
                RequestView::All => true,
            })
            .cloned()
            .collect()
    }

    fn request_kind(&self, request: &RequestRecord) -> BucketKind {
        if request.requester_id == self.owner {
            BucketKind::SentRequests
        } else {
            BucketKind::ReceivedRequests
        }
    }

    fn request_list<'a>(&self, state: &'a BucketState, kind: BucketKind) -> &'a RequestList {
        match kind {
            BucketKind::SentRequests => &state.sent,
            _ => &state.received,
        }
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Hash of the last persisted main snapshot.
    pub async fn current_hash(&self) -> Option<String> {
        self.state.lock().await.main_hash.clone()
    }

    /// Registered snapshot hash that the last `load` failed to read. The
    /// next write replaces it; calling `load` again retries it.
    pub async fn unread_hash(&self) -> Option<String> {
        self.state.lock().await.unread_main.clone()
    }

    /// The sealed-form snapshot currently held in memory.
    pub async fn snapshot(&self) -> BucketSnapshot {
        self.state.lock().await.snapshot.clone()
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    async fn commit_snapshot(
        &self,
        state: &mut BucketState,
        mut snapshot: BucketSnapshot,
    ) -> Result<String> {
        snapshot.touch();
        let hash = self.persist_document(&snapshot).await?;
        self.registry_set(BucketKind::Main, &hash).await?;

        if let Some(unread) = state.unread_main.take() {
            warn!(
                user = %self.owner,
                replaced = %unread,
                hash = %hash,
                "Replacing a registered snapshot that was never loaded"
            );
        }
        state.snapshot = snapshot;
        state.main_hash = Some(hash.clone());
        debug!(user = %self.owner, hash = %hash, "Persisted bucket snapshot");
        Ok(hash)
    }

    async fn commit_requests(
        &self,
        state: &mut BucketState,
        kind: BucketKind,
        mut list: RequestList,
    ) -> Result<String> {
        list.last_updated = Some(Utc::now());
        let hash = self.persist_document(&list).await?;
        self.registry_set(kind, &hash).await?;

        match kind {
            BucketKind::SentRequests => state.sent = list,
            _ => state.received = list,
        }
        debug!(user = %self.owner, kind = kind.as_str(), hash = %hash, "Persisted request list");
        Ok(hash)
    }

    // Registry calls block on file or database I/O and run on the blocking pool.

    async fn registry_get(&self) -> Result<Option<RegistryEntry>> {
        let registry = self.registry.clone();
        let owner = self.owner.clone();
        tokio::task::spawn_blocking(move || registry.get(&owner))
            .await
            .map_err(|e| StoreError::Registry(format!("registry task failed: {e}")))?
    }

    async fn registry_set(&self, kind: BucketKind, hash: &str) -> Result<()> {
        let registry = self.registry.clone();
        let owner = self.owner.clone();
        let hash = hash.to_string();
        tokio::task::spawn_blocking(move || registry.set(&owner, kind, &hash))
            .await
            .map_err(|e| StoreError::Registry(format!("registry task failed: {e}")))?
    }

    async fn persist_document<T: Serialize>(&self, document: &T) -> Result<String> {
        let plaintext = serde_json::to_vec(document)?;
        let sealed = self.crypto.encrypt(&plaintext)?;
        self.content.put(&sealed).await
    }

    async fn fetch_document<T: DeserializeOwned>(&self, hash: &str) -> Result<T> {
        let sealed = self.content.get(hash).await?;
        let plaintext = self.crypto.decrypt(&sealed)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

impl std::fmt::Debug for BucketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketStore")
            .field("owner", &self.owner)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

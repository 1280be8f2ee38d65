//! TTL-bounded flood search over direct TCP connections.
//!
//! Each node runs an accept loop that spawns one task per inbound
//! connection. A connection that opens with `hello` becomes a peering link
//! and is tracked in the [`PeerTable`]; one that opens with `file_request` is
//! served and closed; anything else is processed as a one-off delivery (a
//! search response dialled straight back to its origin).
//!
//! Searches are de-duplicated by message id before anything else happens,
//! answered from the local [`FileIndex`], and forwarded with `ttl - 1` to
//! every peer except the one they arrived on while `ttl > 0`. The origin
//! spends a hop too, so a search started with ttl `n` travels `n` hops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cairn_shared::constants::{
    DEFAULT_FLOOD_TTL, DEFAULT_MAX_FILE_SIZE, DEFAULT_PORT, DEFAULT_SEEN_CAPACITY,
    DEFAULT_SEEN_WINDOW_SECS,
};
use cairn_shared::{FloodMessage, PeerAddr};

use crate::error::NetError;
use crate::peers::{Direction, PeerTable};
use crate::seen::SeenCache;
use crate::transfer::{fetch_file, serve_file};
use crate::wire::{read_message, write_message};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A local file that matched a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedFile {
    pub file_id: String,
    pub name: String,
    pub size: u64,
}

/// What the overlay needs from local storage.
#[async_trait]
pub trait FileIndex: Send + Sync {
    /// Files whose name matches `query`.
    async fn search(&self, query: &str) -> Vec<IndexedFile>;

    /// Bytes to stream for a `file_request`, or `None` if not held.
    async fn read(&self, filename: &str, file_id: Option<&str>) -> Option<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Address to bind and to advertise to peers.
    pub host: String,
    /// `0` picks an ephemeral port.
    pub port: u16,
    pub username: String,
    pub default_ttl: u8,
    pub seen_capacity: usize,
    pub seen_window: Duration,
    pub connect_timeout: Duration,
    pub max_transfer_size: usize,
    /// Outbound messages buffered per peer before new ones are dropped.
    pub queue_depth: usize,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            username: String::new(),
            default_ttl: DEFAULT_FLOOD_TTL,
            seen_capacity: DEFAULT_SEEN_CAPACITY,
            seen_window: Duration::from_secs(DEFAULT_SEEN_WINDOW_SECS),
            connect_timeout: Duration::from_secs(10),
            max_transfer_size: DEFAULT_MAX_FILE_SIZE,
            queue_depth: 256,
        }
    }
}

/// A peer that answered the current search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSource {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub file_id: String,
    pub filename: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub enum OverlayEvent {
    SearchHit { search_id: String, source: FileSource },
    PeerConnected(PeerAddr),
    PeerDisconnected(PeerAddr),
}

/// Results of the most recent search only.
#[derive(Debug, Default)]
struct SearchState {
    search_id: Option<String>,
    by_name: HashMap<String, Vec<FileSource>>,
}

struct Inner {
    local: PeerAddr,
    config: OverlayConfig,
    index: Arc<dyn FileIndex>,
    peers: Mutex<PeerTable>,
    seen: Mutex<SeenCache>,
    search: Mutex<SearchState>,
    events: broadcast::Sender<OverlayEvent>,
    next_id: AtomicU64,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running overlay node. Cheap to clone.
#[derive(Clone)]
pub struct FloodNode {
    inner: Arc<Inner>,
}

impl FloodNode {
    /// Bind the listener and start accepting connections.
    pub async fn bind(config: OverlayConfig, index: Arc<dyn FileIndex>) -> Result<Self, NetError> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let port = listener.local_addr()?.port();
        let local = PeerAddr::new(config.host.clone(), port, config.username.clone());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let inner = Arc::new(Inner {
            local: local.clone(),
            seen: Mutex::new(SeenCache::new(config.seen_capacity, config.seen_window)),
            config,
            index,
            peers: Mutex::new(PeerTable::new()),
            search: Mutex::new(SearchState::default()),
            events,
            next_id: AtomicU64::new(1),
            accept_task: Mutex::new(None),
        });

        let task = tokio::spawn(accept_loop(Arc::downgrade(&inner), listener));
        *inner.accept_task.lock() = Some(task);

        info!(addr = %local.endpoint(), username = %local.username, "Flood overlay listening");
        Ok(Self { inner })
    }

    /// The advertised address, with the port actually bound.
    pub fn local_addr(&self) -> &PeerAddr {
        &self.inner.local
    }

    /// Open a peering link to `host:port`. A no-op if already connected.
    pub async fn connect_to_peer(&self, host: &str, port: u16) -> Result<PeerAddr, NetError> {
        let endpoint = format!("{host}:{port}");
        if endpoint == self.inner.local.endpoint() {
            return Err(NetError::Handshake("refusing to dial self".to_string()));
        }
        let existing = self.inner.peers.lock().get(&endpoint).map(|i| i.addr.clone());
        if let Some(existing) = existing {
            return Ok(existing);
        }

        let timeout = self.inner.config.connect_timeout;
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&endpoint))
            .await
            .map_err(|_| NetError::Timeout(format!("connect to {endpoint}")))??;

        let (read, mut write) = stream.into_split();
        write_message(
            &mut write,
            &FloodMessage::Hello {
                origin: self.inner.local.clone(),
            },
        )
        .await?;

        let mut reader = BufReader::new(read);
        let reply = tokio::time::timeout(timeout, read_message(&mut reader))
            .await
            .map_err(|_| NetError::Timeout(format!("hello from {endpoint}")))??;
        let username = match reply {
            Some(FloodMessage::Hello { origin }) => origin.username,
            Some(other) => {
                return Err(NetError::Handshake(format!(
                    "expected hello, got {}",
                    other.kind()
                )))
            }
            None => return Err(NetError::ConnectionClosed),
        };

        let remote = PeerAddr::new(host, port, username);
        let conn_id = self.inner.register(remote.clone(), Direction::Outbound, write);
        tokio::spawn(self.inner.clone().read_loop(remote.endpoint(), conn_id, reader));

        info!(peer = %endpoint, username = %remote.username, "Connected to peer");
        Ok(remote)
    }

    /// Drop the link to `host:port`, if any.
    pub fn disconnect_peer(&self, host: &str, port: u16) -> bool {
        self.inner.remove_peer(&format!("{host}:{port}"))
    }

    pub fn peers(&self) -> Vec<PeerAddr> {
        self.inner.peers.lock().connected_peers()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.lock().peer_count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OverlayEvent> {
        self.inner.events.subscribe()
    }

    /// Start a search with the configured default ttl.
    pub fn search(&self, filename: &str) -> String {
        self.flood_search(filename, self.inner.config.default_ttl)
    }

    /// Flood a search for `filename` to every peer and return its id.
    ///
    /// `ttl` is the number of hops the search may travel: neighbours are one
    /// hop away, so a `ttl` of zero reaches nobody.
    ///
    /// Clears the results of any previous search: only one search is tracked
    /// at a time, and late responses to an older one are discarded.
    pub fn flood_search(&self, filename: &str, ttl: u8) -> String {
        let inner = &self.inner;
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let seq = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let id = format!("search_{nanos}_{seq}_{}", inner.local.username);

        {
            let mut search = inner.search.lock();
            search.search_id = Some(id.clone());
            search.by_name.clear();
        }
        inner.seen.lock().insert(&id);

        // Every send spends one hop, the first one included.
        let Some(remaining) = ttl.checked_sub(1) else {
            debug!(search_id = %id, filename = %filename, "Search ttl is zero, nothing sent");
            return id;
        };

        let message = FloodMessage::Search {
            id: id.clone(),
            filename: filename.to_string(),
            origin: inner.local.clone(),
            ttl: remaining,
        };
        let sent = inner.forward(message, None);

        info!(search_id = %id, filename = %filename, ttl, peers = sent, "Search flooded");
        id
    }

    /// Flood a search and gather hits until `wait` elapses.
    pub async fn search_and_collect(&self, filename: &str, ttl: u8, wait: Duration) -> Vec<FileSource> {
        let mut events = self.subscribe();
        let id = self.flood_search(filename, ttl);
        let deadline = tokio::time::Instant::now() + wait;

        let mut hits = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(OverlayEvent::SearchHit { search_id, source })) if search_id == id => {
                    hits.push(source)
                }
                Ok(Ok(_)) => {}
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!(skipped, "Search event receiver lagged");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => break,
            }
        }
        hits
    }

    /// Sources recorded for `filename` by the current search.
    pub fn sources(&self, filename: &str) -> Vec<FileSource> {
        self.inner
            .search
            .lock()
            .by_name
            .get(filename)
            .cloned()
            .unwrap_or_default()
    }

    pub fn all_sources(&self) -> HashMap<String, Vec<FileSource>> {
        self.inner.search.lock().by_name.clone()
    }

    /// Download a file from a source found by search. Bytes are returned as
    /// the peer stores them.
    pub async fn request_file(&self, source: &FileSource) -> Result<Vec<u8>, NetError> {
        fetch_file(
            &source.host,
            source.port,
            &source.filename,
            Some(&source.file_id),
            self.inner.config.max_transfer_size,
            self.inner.config.connect_timeout,
        )
        .await
    }

    /// Stop accepting and drop every peer link.
    pub fn shutdown(&self) {
        if let Some(task) = self.inner.accept_task.lock().take() {
            task.abort();
        }
        let endpoints: Vec<String> = self
            .inner
            .peers
            .lock()
            .connected_peers()
            .iter()
            .map(PeerAddr::endpoint)
            .collect();
        for endpoint in endpoints {
            self.inner.remove_peer(&endpoint);
        }
        info!(addr = %self.inner.local.endpoint(), "Flood overlay stopped");
    }
}

impl std::fmt::Debug for FloodNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FloodNode")
            .field("local", &self.inner.local)
            .field("peers", &self.peer_count())
            .finish()
    }
}

async fn accept_loop(inner: Weak<Inner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let Some(inner) = inner.upgrade() else { break };
                tokio::spawn(async move {
                    if let Err(e) = inner.handle_inbound(stream).await {
                        warn!(remote = %remote, error = %e, "Inbound connection failed");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

impl Inner {
    async fn handle_inbound(self: Arc<Self>, stream: TcpStream) -> Result<(), NetError> {
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        let Some(first) = read_message(&mut reader).await? else {
            return Ok(());
        };

        match first {
            FloodMessage::Hello { origin } => {
                let endpoint = origin.endpoint();
                // Registered before the reply hello is queued.
                let conn_id = self.register(origin, Direction::Inbound, write);
                let link = self.peers.lock().sender(&endpoint);
                if let Some(tx) = link {
                    let hello = FloodMessage::Hello {
                        origin: self.local.clone(),
                    };
                    self.enqueue(&endpoint, &tx, hello);
                }
                self.read_loop(endpoint, conn_id, reader).await;
                Ok(())
            }
            FloodMessage::FileRequest { filename, file_id } => {
                let data = self.index.read(&filename, file_id.as_deref()).await;
                serve_file(&mut write, &filename, data).await
            }
            other => {
                self.handle_message(other, None).await;
                while let Some(message) = read_message(&mut reader).await? {
                    self.handle_message(message, None).await;
                }
                Ok(())
            }
        }
    }

    /// Track a handshaken peer and start its writer task.
    fn register(self: &Arc<Self>, addr: PeerAddr, direction: Direction, write: OwnedWriteHalf) -> u64 {
        let (tx, rx) = mpsc::channel(self.config.queue_depth.max(1));
        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let endpoint = addr.endpoint();

        self.peers
            .lock()
            .on_connected(addr.clone(), direction, conn_id, tx);
        tokio::spawn(self.clone().write_loop(endpoint, conn_id, rx, write));

        let _ = self.events.send(OverlayEvent::PeerConnected(addr));
        conn_id
    }

    async fn write_loop(
        self: Arc<Self>,
        endpoint: String,
        conn_id: u64,
        mut rx: mpsc::Receiver<FloodMessage>,
        mut write: OwnedWriteHalf,
    ) {
        while let Some(message) = rx.recv().await {
            if let Err(e) = write_message(&mut write, &message).await {
                warn!(peer = %endpoint, error = %e, "Write to peer failed");
                break;
            }
        }
        let _ = write.shutdown().await;
        self.drop_peer(&endpoint, conn_id);
    }

    async fn read_loop(self: Arc<Self>, endpoint: String, conn_id: u64, mut reader: BufReader<OwnedReadHalf>) {
        loop {
            match read_message(&mut reader).await {
                Ok(Some(message)) => self.handle_message(message, Some(&endpoint)).await,
                Ok(None) => {
                    debug!(peer = %endpoint, "Peer closed connection");
                    break;
                }
                Err(e) => {
                    warn!(peer = %endpoint, error = %e, "Peer connection error");
                    break;
                }
            }
        }
        self.drop_peer(&endpoint, conn_id);
    }

    fn drop_peer(&self, endpoint: &str, conn_id: u64) {
        let removed = self.peers.lock().on_disconnected(endpoint, conn_id);
        if let Some(addr) = removed {
            info!(peer = %endpoint, "Peer disconnected");
            let _ = self.events.send(OverlayEvent::PeerDisconnected(addr));
        }
    }

    fn remove_peer(&self, endpoint: &str) -> bool {
        let removed = self.peers.lock().remove(endpoint);
        match removed {
            Some(addr) => {
                info!(peer = %endpoint, "Peer removed");
                let _ = self.events.send(OverlayEvent::PeerDisconnected(addr));
                true
            }
            None => false,
        }
    }

    async fn handle_message(self: &Arc<Self>, message: FloodMessage, from: Option<&str>) {
        if let Some(id) = message.id() {
            let fresh = self.seen.lock().insert(id);
            if !fresh {
                debug!(id = %id, kind = message.kind(), "Dropping duplicate");
                return;
            }
        }

        match message {
            FloodMessage::Search {
                id,
                filename,
                origin,
                ttl,
            } => {
                let hits = self.index.search(&filename).await;
                if !hits.is_empty() {
                    debug!(search_id = %id, filename = %filename, hits = hits.len(), "Answering search");
                }
                for hit in hits {
                    let response = FloodMessage::SearchResponse {
                        id: format!("{id}:{}", hit.file_id),
                        filename: hit.name,
                        size: hit.size,
                        origin: self.local.clone(),
                        file_id: hit.file_id,
                    };
                    self.reply_to(&origin, response);
                }

                if ttl > 0 {
                    let forwarded = self.forward(
                        FloodMessage::Search {
                            id: id.clone(),
                            filename,
                            origin,
                            ttl: ttl - 1,
                        },
                        from,
                    );
                    debug!(search_id = %id, ttl = ttl - 1, peers = forwarded, "Search forwarded");
                } else {
                    debug!(search_id = %id, "Search ttl exhausted");
                }
            }
            FloodMessage::SearchResponse {
                id,
                filename,
                size,
                origin,
                file_id,
            } => {
                let source = FileSource {
                    host: origin.host,
                    port: origin.port,
                    username: origin.username,
                    file_id,
                    filename,
                    size,
                };
                self.record_source(&id, source);
            }
            other => {
                debug!(kind = other.kind(), from = ?from, "Ignoring unexpected message");
            }
        }
    }

    fn record_source(&self, response_id: &str, source: FileSource) {
        let search_id = {
            let mut search = self.search.lock();
            let current = match &search.search_id {
                Some(current)
                    if response_id
                        .strip_prefix(current.as_str())
                        .is_some_and(|rest| rest.starts_with(':')) =>
                {
                    current.clone()
                }
                _ => {
                    debug!(id = %response_id, "Discarding response to a stale search");
                    return;
                }
            };
            search
                .by_name
                .entry(source.filename.clone())
                .or_default()
                .push(source.clone());
            current
        };

        info!(
            search_id = %search_id,
            filename = %source.filename,
            peer = %format!("{}:{}", source.host, source.port),
            "Search hit"
        );
        let _ = self.events.send(OverlayEvent::SearchHit { search_id, source });
    }

    /// Queue `message` for every peer except `exclude`. Returns how many
    /// peers it was queued for.
    fn forward(&self, message: FloodMessage, exclude: Option<&str>) -> usize {
        let targets = self.peers.lock().senders_except(exclude);
        let mut sent = 0;
        for (endpoint, tx) in targets {
            if self.enqueue(&endpoint, &tx, message.clone()) {
                sent += 1;
            }
        }
        sent
    }

    fn enqueue(&self, endpoint: &str, tx: &mpsc::Sender<FloodMessage>, message: FloodMessage) -> bool {
        match tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!(peer = %endpoint, kind = message.kind(), "Peer queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.remove_peer(endpoint);
                false
            }
        }
    }

    /// Send a response to `origin`: over its peering link if there is one,
    /// otherwise on a fresh connection.
    fn reply_to(&self, origin: &PeerAddr, message: FloodMessage) {
        let endpoint = origin.endpoint();
        if endpoint == self.local.endpoint() {
            return;
        }

        let link = self.peers.lock().sender(&endpoint);
        if let Some(tx) = link {
            self.enqueue(&endpoint, &tx, message);
            return;
        }

        let timeout = self.config.connect_timeout;
        tokio::spawn(async move {
            if let Err(e) = deliver_direct(&endpoint, &message, timeout).await {
                warn!(peer = %endpoint, error = %e, "Direct response delivery failed");
            }
        });
    }
}

async fn deliver_direct(endpoint: &str, message: &FloodMessage, timeout: Duration) -> Result<(), NetError> {
    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint))
        .await
        .map_err(|_| NetError::Timeout(format!("connect to {endpoint}")))??;
    write_message(&mut stream, message).await?;
    stream.shutdown().await?;
    Ok(())
}

//! The process-wide set of services a node runs with.
//!
//! Built once at startup and handed to whatever needs it behind an `Arc`.
//! Nothing here is global: two contexts in one process are two independent
//! nodes.

use std::sync::Arc;

use tracing::{info, warn};

use cairn_net::{load_bootstrap_peers, FileSource, FloodNode, HashRing};
use cairn_shared::{CryptoEnvelope, NodeIdentity};
use cairn_store::registry::default_registry_path;
use cairn_store::{
    BucketStore, ContentStore, HashRegistry, HttpContentStore, JsonFileRegistry, SqliteRegistry,
};

use crate::config::{NodeConfig, RegistryBackend};
use crate::error::NodeError;
use crate::index::BucketFileIndex;

pub struct NodeContext {
    pub config: NodeConfig,
    pub identity: NodeIdentity,
    pub crypto: CryptoEnvelope,
    pub content: Arc<dyn ContentStore>,
    pub registry: Arc<dyn HashRegistry>,
    pub bucket: Arc<BucketStore>,
    pub overlay: FloodNode,
    pub ring: Arc<HashRing>,
}

impl NodeContext {
    /// Start a node with the HTTP content store and the configured registry.
    pub async fn start(config: NodeConfig) -> Result<Arc<Self>, NodeError> {
        let content: Arc<dyn ContentStore> =
            Arc::new(HttpContentStore::new(config.content_store.clone())?);
        let registry = open_registry(&config)?;
        Self::with_services(config, content, registry, Arc::new(HashRing::new())).await
    }

    /// Start a node over the given collaborators: load the bucket, bind the
    /// overlay and join the ring.
    pub async fn with_services(
        config: NodeConfig,
        content: Arc<dyn ContentStore>,
        registry: Arc<dyn HashRegistry>,
        ring: Arc<HashRing>,
    ) -> Result<Arc<Self>, NodeError> {
        let crypto = config.envelope();
        let bucket = Arc::new(
            BucketStore::open(
                config.user_id.clone(),
                config.username.clone(),
                content.clone(),
                registry.clone(),
                crypto.clone(),
            )
            .await,
        );

        let index = Arc::new(BucketFileIndex::new(bucket.clone()));
        let overlay = FloodNode::bind(config.overlay_config(), index).await?;
        let identity = config.identity(overlay.local_addr().port);

        if let Err(e) = ring.join(identity.clone()) {
            overlay.shutdown();
            return Err(e.into());
        }

        info!(
            node = %identity,
            position = %identity.ring_position(),
            "Node started"
        );

        Ok(Arc::new(Self {
            config,
            identity,
            crypto,
            content,
            registry,
            bucket,
            overlay,
            ring,
        }))
    }

    /// Dial every configured bootstrap peer. Returns how many links are up.
    pub async fn connect_bootstrap(&self) -> usize {
        let mut peers = self.config.bootstrap_peers.clone();
        if let Some(path) = &self.config.bootstrap_file {
            peers.extend(load_bootstrap_peers(path));
        }

        let mut connected = 0;
        for peer in peers {
            match self.overlay.connect_to_peer(&peer.host, peer.port).await {
                Ok(_) => connected += 1,
                Err(e) => warn!(peer = %peer.endpoint(), error = %e, "Bootstrap peer unreachable"),
            }
        }
        connected
    }

    /// Download a file located by search and decrypt it with this node's
    /// envelope.
    pub async fn fetch_file(
        &self,
        host: &str,
        port: u16,
        filename: &str,
        file_id: Option<&str>,
    ) -> Result<Vec<u8>, NodeError> {
        let sealed = cairn_net::fetch_file(
            host,
            port,
            filename,
            file_id,
            self.crypto.max_file_size(),
            self.overlay_timeout(),
        )
        .await?;
        Ok(self.crypto.decrypt_file(&sealed)?)
    }

    pub async fn download(&self, source: &FileSource) -> Result<Vec<u8>, NodeError> {
        self.fetch_file(
            &source.host,
            source.port,
            &source.filename,
            Some(&source.file_id),
        )
        .await
    }

    /// Record this user's current bucket hash on the ring node responsible
    /// for the user id. Returns that node, or `None` before the first write.
    pub async fn publish_bucket_pointer(&self) -> Result<Option<NodeIdentity>, NodeError> {
        let Some(hash) = self.bucket.current_hash().await else {
            return Ok(None);
        };
        let key = format!("bucket_{}", self.identity.user_id);
        let owner = self.ring.store(
            &key,
            serde_json::json!({ "hash": hash, "username": self.config.username }),
        )?;
        info!(key = %key, owner = %owner, "Published bucket pointer");
        Ok(Some(owner))
    }

    /// Stop the overlay and leave the ring.
    pub fn shutdown(&self) {
        self.overlay.shutdown();
        if let Err(e) = self.ring.leave(&self.identity) {
            warn!(error = %e, "Leaving ring failed");
        }
    }

    fn overlay_timeout(&self) -> std::time::Duration {
        self.config.overlay_config().connect_timeout
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("identity", &self.identity)
            .field("overlay", &self.overlay)
            .field("ring_members", &self.ring.len())
            .finish_non_exhaustive()
    }
}

fn open_registry(config: &NodeConfig) -> Result<Arc<dyn HashRegistry>, NodeError> {
    let path = match &config.registry_path {
        Some(path) => path.clone(),
        None => default_registry_path()
            .ok_or_else(|| NodeError::Config("no application data directory".to_string()))?,
    };

    let registry: Arc<dyn HashRegistry> = match config.registry_backend {
        RegistryBackend::Json => Arc::new(JsonFileRegistry::open_at(&path)?),
        RegistryBackend::Sqlite => Arc::new(SqliteRegistry::open_at(&path.with_extension("db"))?),
    };
    Ok(registry)
}

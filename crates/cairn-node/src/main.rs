//! # cairn-node
//!
//! A cairn peer. Runs:
//! - the **flood overlay** listener that answers file searches from the
//!   local bucket and serves file bytes on request
//! - the **bucket store** over the configured content store and registry
//! - membership of the in-process **hash ring**

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use cairn_net::OverlayEvent;
use cairn_node::{NodeConfig, NodeContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,cairn_node=debug")),
        )
        .init();

    info!("Starting cairn node v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = NodeConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Start services and join the network
    // -----------------------------------------------------------------------
    let node = NodeContext::start(config).await?;

    let connected = node.connect_bootstrap().await;
    let files = node.bucket.files().await.len();
    let messages = node.bucket.chat_history().await.len();
    info!(connected, files, messages, "Node ready");

    if let Some(owner) = node.publish_bucket_pointer().await? {
        debug!(owner = %owner, "Bucket pointer placed on ring");
    }

    // -----------------------------------------------------------------------
    // 4. Log overlay activity in the background
    // -----------------------------------------------------------------------
    let mut events = node.overlay.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(event),
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "Event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run until Ctrl+C
    // -----------------------------------------------------------------------
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");
    node.shutdown();

    Ok(())
}

fn log_event(event: OverlayEvent) {
    match event {
        OverlayEvent::SearchHit { search_id, source } => info!(
            search_id = %search_id,
            filename = %source.filename,
            peer = %format!("{}:{}", source.host, source.port),
            "File source found"
        ),
        OverlayEvent::PeerConnected(peer) => {
            info!(peer = %peer.endpoint(), username = %peer.username, "Peer up")
        }
        OverlayEvent::PeerDisconnected(peer) => info!(peer = %peer.endpoint(), "Peer down"),
    }
}

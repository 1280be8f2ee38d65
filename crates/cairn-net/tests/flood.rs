//! Flood overlay behaviour over real loopback sockets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use cairn_net::{FileIndex, FloodNode, IndexedFile, NetError, OverlayConfig, OverlayEvent};

#[derive(Default)]
struct StaticIndex {
    files: Vec<(IndexedFile, Vec<u8>)>,
    searches: AtomicUsize,
}

impl StaticIndex {
    fn with_file(file_id: &str, name: &str, data: &[u8]) -> Self {
        Self {
            files: vec![(
                IndexedFile {
                    file_id: file_id.to_string(),
                    name: name.to_string(),
                    size: data.len() as u64,
                },
                data.to_vec(),
            )],
            searches: AtomicUsize::new(0),
        }
    }

    fn searches(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileIndex for StaticIndex {
    async fn search(&self, query: &str) -> Vec<IndexedFile> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        let query = query.to_lowercase();
        self.files
            .iter()
            .filter(|(f, _)| f.name.to_lowercase().contains(&query))
            .map(|(f, _)| f.clone())
            .collect()
    }

    async fn read(&self, filename: &str, file_id: Option<&str>) -> Option<Vec<u8>> {
        self.files
            .iter()
            .find(|(f, _)| f.name == filename && file_id.map_or(true, |id| id == f.file_id))
            .map(|(_, data)| data.clone())
    }
}

async fn spawn_node(name: &str, index: Arc<StaticIndex>) -> FloodNode {
    let config = OverlayConfig {
        port: 0,
        username: name.to_string(),
        connect_timeout: Duration::from_secs(2),
        ..OverlayConfig::default()
    };
    FloodNode::bind(config, index).await.unwrap()
}

async fn link(from: &FloodNode, to: &FloodNode) {
    let addr = to.local_addr().clone();
    from.connect_to_peer(&addr.host, addr.port).await.unwrap();
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

const SETTLE: Duration = Duration::from_millis(300);

#[tokio::test]
async fn test_neighbour_hit_and_transfer() {
    let a_index = Arc::new(StaticIndex::with_file("f-1", "report.pdf", b"0123456789"));
    let a = spawn_node("alice", a_index).await;
    let b = spawn_node("bob", Arc::new(StaticIndex::default())).await;

    let peer = b.connect_to_peer("127.0.0.1", a.local_addr().port).await.unwrap();
    assert_eq!(peer.username, "alice");
    assert_eq!(a.peer_count(), 1);
    assert_eq!(b.peer_count(), 1);

    let hits = b.search_and_collect("REPORT", 2, SETTLE).await;
    assert_eq!(hits.len(), 1);
    let hit = &hits[0];
    assert_eq!(hit.port, a.local_addr().port);
    assert_eq!(hit.username, "alice");
    assert_eq!(hit.file_id, "f-1");
    assert_eq!(hit.size, 10);
    assert_eq!(b.sources("report.pdf"), hits);

    let bytes = b.request_file(hit).await.unwrap();
    assert_eq!(bytes, b"0123456789");
}

#[tokio::test]
async fn test_missing_file_request_fails() {
    let a = spawn_node("alice", Arc::new(StaticIndex::default())).await;
    let b = spawn_node("bob", Arc::new(StaticIndex::default())).await;

    let source = cairn_net::FileSource {
        host: "127.0.0.1".to_string(),
        port: a.local_addr().port,
        username: "alice".to_string(),
        file_id: "nope".to_string(),
        filename: "ghost.txt".to_string(),
        size: 0,
    };
    let err = b.request_file(&source).await.unwrap_err();
    assert!(matches!(err, NetError::FileNotFound(_)));
}

#[tokio::test]
async fn test_ttl_bounds_propagation_along_a_chain() {
    // a - b - c - d - e, file held by d only.
    let b_index = Arc::new(StaticIndex::default());
    let c_index = Arc::new(StaticIndex::default());
    let d_index = Arc::new(StaticIndex::with_file("f-d", "notes.txt", b"far away"));
    let e_index = Arc::new(StaticIndex::default());

    let a = spawn_node("a", Arc::new(StaticIndex::default())).await;
    let b = spawn_node("b", b_index.clone()).await;
    let c = spawn_node("c", c_index.clone()).await;
    let d = spawn_node("d", d_index.clone()).await;
    let e = spawn_node("e", e_index.clone()).await;
    link(&b, &a).await;
    link(&c, &b).await;
    link(&d, &c).await;
    link(&e, &d).await;

    // ttl 0: nothing leaves the origin.
    let hits = a.search_and_collect("notes", 0, SETTLE).await;
    assert!(hits.is_empty());
    assert_eq!(b_index.searches(), 0);

    // ttl 1: only the direct neighbour looks.
    let hits = a.search_and_collect("notes", 1, SETTLE).await;
    assert!(hits.is_empty());
    assert_eq!(b_index.searches(), 1);
    assert_eq!(c_index.searches(), 0);

    // ttl 2 reaches c but not d.
    let hits = a.search_and_collect("notes", 2, SETTLE).await;
    assert!(hits.is_empty());
    assert_eq!(c_index.searches(), 1);
    assert_eq!(d_index.searches(), 0);

    // ttl 3 reaches d, three hops out, and stops there. d answers a
    // directly although they never peered.
    let hits = a.search_and_collect("notes", 3, SETTLE).await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].port, d.local_addr().port);
    assert_eq!(d_index.searches(), 1);
    assert_eq!(e_index.searches(), 0);
    assert_eq!(a.peer_count(), 1);

    let bytes = a.request_file(&hits[0]).await.unwrap();
    assert_eq!(bytes, b"far away");
}

#[tokio::test]
async fn test_cycle_processes_each_search_once() {
    let indexes: Vec<Arc<StaticIndex>> = (0..3)
        .map(|i| Arc::new(StaticIndex::with_file(&format!("f{i}"), "song.mp3", b"la")))
        .collect();
    let mut nodes = Vec::new();
    for (i, index) in indexes.iter().enumerate() {
        nodes.push(spawn_node(&format!("n{i}"), index.clone()).await);
    }
    let origin = spawn_node("origin", Arc::new(StaticIndex::default())).await;

    // Fully connected triangle, origin attached to all three.
    link(&nodes[1], &nodes[0]).await;
    link(&nodes[2], &nodes[1]).await;
    link(&nodes[0], &nodes[2]).await;
    for node in &nodes {
        link(&origin, node).await;
    }

    let hits = origin.search_and_collect("song", 7, SETTLE).await;
    assert_eq!(hits.len(), 3);
    for index in &indexes {
        assert_eq!(index.searches(), 1);
    }
    assert_eq!(origin.sources("song.mp3").len(), 3);
}

#[tokio::test]
async fn test_new_search_clears_previous_sources() {
    let a = spawn_node(
        "alice",
        Arc::new(StaticIndex::with_file("f-1", "report.pdf", b"x")),
    )
    .await;
    let b = spawn_node("bob", Arc::new(StaticIndex::default())).await;
    link(&b, &a).await;

    b.search_and_collect("report", 1, SETTLE).await;
    assert_eq!(b.sources("report.pdf").len(), 1);

    let hits = b.search_and_collect("nothing-matches", 1, SETTLE).await;
    assert!(hits.is_empty());
    assert!(b.sources("report.pdf").is_empty());
    assert!(b.all_sources().is_empty());
}

#[tokio::test]
async fn test_disconnect_removes_peer_on_both_sides() {
    let a = spawn_node("alice", Arc::new(StaticIndex::default())).await;
    let b = spawn_node("bob", Arc::new(StaticIndex::default())).await;
    let mut events = a.subscribe();

    link(&b, &a).await;
    assert!(matches!(
        events.recv().await.unwrap(),
        OverlayEvent::PeerConnected(peer) if peer.username == "bob"
    ));

    assert!(b.disconnect_peer("127.0.0.1", a.local_addr().port));
    assert_eq!(b.peer_count(), 0);
    wait_until(|| a.peer_count() == 0).await;
    assert!(matches!(
        events.recv().await.unwrap(),
        OverlayEvent::PeerDisconnected(peer) if peer.username == "bob"
    ));

    // Connecting twice to the same endpoint is a no-op.
    link(&b, &a).await;
    link(&b, &a).await;
    assert_eq!(b.peer_count(), 1);
    wait_until(|| a.peer_count() == 1).await;
}

#[tokio::test]
async fn test_garbage_does_not_kill_listener() {
    use tokio::io::AsyncWriteExt;

    let a = spawn_node(
        "alice",
        Arc::new(StaticIndex::with_file("f-1", "report.pdf", b"x")),
    )
    .await;
    let mut raw = tokio::net::TcpStream::connect(("127.0.0.1", a.local_addr().port))
        .await
        .unwrap();
    raw.write_all(b"this is not json\n").await.unwrap();
    drop(raw);

    let b = spawn_node("bob", Arc::new(StaticIndex::default())).await;
    link(&b, &a).await;
    let hits = b.search_and_collect("report", 1, SETTLE).await;
    assert_eq!(hits.len(), 1);
}

#[tokio::test]
async fn test_self_dial_rejected() {
    let a = spawn_node("alice", Arc::new(StaticIndex::default())).await;
    let port = a.local_addr().port;
    assert!(matches!(
        a.connect_to_peer("127.0.0.1", port).await,
        Err(NetError::Handshake(_))
    ));
}

//! Bootstrap peer loading.
//!
//! Peers are given as `host:port` endpoints, either in a file (one per line)
//! or as a runtime list. The node dials each of them on startup.

use std::fs;
use std::path::Path;

use tracing::{debug, info, warn};

use cairn_shared::PeerAddr;

/// Load bootstrap endpoints from a file.
///
/// Empty lines and lines starting with `#` are ignored. Malformed lines are
/// logged and skipped; a missing file yields an empty list.
///
/// # Example file
///
/// ```text
/// # cairn bootstrap nodes
/// 10.0.0.7:5000
/// peer.example.org:5001
/// ```
pub fn load_bootstrap_peers(path: &Path) -> Vec<PeerAddr> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "Failed to read bootstrap peers file"
            );
            return Vec::new();
        }
    };

    let lines: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect();
    let peers = parse_endpoints(&lines);

    info!(
        count = peers.len(),
        path = %path.display(),
        "Loaded bootstrap peers"
    );

    peers
}

/// Parse `host:port` strings. Invalid entries are logged and dropped.
pub fn parse_endpoints(raw: &[String]) -> Vec<PeerAddr> {
    raw.iter()
        .filter_map(|s| match parse_endpoint(s) {
            Some(peer) => {
                debug!(peer = %peer.endpoint(), "Parsed bootstrap peer");
                Some(peer)
            }
            None => {
                warn!(endpoint = %s, "Skipping invalid endpoint");
                None
            }
        })
        .collect()
}

fn parse_endpoint(raw: &str) -> Option<PeerAddr> {
    let (host, port) = raw.trim().rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port = port.parse::<u16>().ok().filter(|p| *p != 0)?;
    Some(PeerAddr::new(host, port, ""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_nonexistent_file() {
        let peers = load_bootstrap_peers(Path::new("/nonexistent/bootstrap.txt"));
        assert!(peers.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("peers.txt");

        let mut f = fs::File::create(&file_path).unwrap();
        writeln!(f, "# bootstrap nodes").unwrap();
        writeln!(f, "127.0.0.1:5000").unwrap();
        writeln!(f).unwrap();
        writeln!(f, "no-port-here").unwrap();
        writeln!(f, "peer.example.org:5001").unwrap();
        drop(f);

        let peers = load_bootstrap_peers(&file_path);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[1].host, "peer.example.org");
        assert_eq!(peers[1].port, 5001);
    }

    #[test]
    fn test_parse_endpoints() {
        let raw = vec![
            "127.0.0.1:5000".to_string(),
            ":5000".to_string(),
            "10.0.0.1:0".to_string(),
            "10.0.0.1:99999".to_string(),
            " 10.0.0.2:5002 ".to_string(),
        ];
        let peers = parse_endpoints(&raw);
        let endpoints: Vec<String> = peers.iter().map(PeerAddr::endpoint).collect();
        assert_eq!(endpoints, ["127.0.0.1:5000", "10.0.0.2:5002"]);
    }
}

use serde::{Deserialize, Serialize};

/// Where a peer can be reached, as advertised by the peer itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: String,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Messages exchanged over overlay connections, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FloodMessage {
    /// First line on a peering connection; names the dialler's listen address
    Hello { origin: PeerAddr },

    /// Flooded file search
    Search {
        id: String,
        filename: String,
        origin: PeerAddr,
        ttl: u8,
    },

    /// A match, sent straight back to the search origin
    SearchResponse {
        id: String,
        filename: String,
        size: u64,
        origin: PeerAddr,
        file_id: String,
    },

    /// Opens a direct transfer connection
    FileRequest {
        filename: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_id: Option<String>,
    },

    /// Followed on the wire by exactly `size` raw bytes
    FileHeader { filename: String, size: u64 },

    FileNotFound { filename: String },
}

impl FloodMessage {
    /// De-duplication key, for the kinds that are flooded or routed.
    pub fn id(&self) -> Option<&str> {
        match self {
            FloodMessage::Search { id, .. } | FloodMessage::SearchResponse { id, .. } => Some(id),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FloodMessage::Hello { .. } => "hello",
            FloodMessage::Search { .. } => "search",
            FloodMessage::SearchResponse { .. } => "search_response",
            FloodMessage::FileRequest { .. } => "file_request",
            FloodMessage::FileHeader { .. } => "file_header",
            FloodMessage::FileNotFound { .. } => "file_not_found",
        }
    }

    /// Serialize to a single newline-terminated JSON line.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_wire_shape() {
        let msg = FloodMessage::Search {
            id: "search_1".to_string(),
            filename: "report.pdf".to_string(),
            origin: PeerAddr::new("127.0.0.1", 5000, "bob"),
            ttl: 7,
        };

        let line = msg.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "search");
        assert_eq!(value["ttl"], 7);
        assert_eq!(value["origin"]["port"], 5000);

        assert_eq!(FloodMessage::from_line(&line).unwrap(), msg);
    }

    #[test]
    fn test_file_request_without_id() {
        let msg = FloodMessage::from_line(r#"{"type":"file_request","filename":"a.txt"}"#).unwrap();
        assert_eq!(
            msg,
            FloodMessage::FileRequest {
                filename: "a.txt".to_string(),
                file_id: None
            }
        );
        assert!(msg.id().is_none());
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(FloodMessage::from_line(r#"{"type":"gossip","x":1}"#).is_err());
    }
}

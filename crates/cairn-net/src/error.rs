use thiserror::Error;

use cairn_shared::{NodeIdentity, RingPosition};

#[derive(Error, Debug)]
pub enum RingError {
    #[error("Ring position {position} already taken by {existing}")]
    PositionCollision {
        position: RingPosition,
        existing: NodeIdentity,
    },

    #[error("Node {0} is not a ring member")]
    UnknownNode(NodeIdentity),

    #[error("Ring has no members")]
    EmptyRing,
}

#[derive(Error, Debug)]
pub enum NetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed wire message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Wire line exceeds {max} bytes")]
    LineTooLong { max: usize },

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Peer does not have {0}")]
    FileNotFound(String),

    #[error("Transfer too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: usize },

    #[error("Timed out: {0}")]
    Timeout(String),
}

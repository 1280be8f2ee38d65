use serde::{Deserialize, Serialize};

use crate::constants::RING_SIZE;

// User identity as handed to us by the application layer (stringified id)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map(|(i, _)| i).unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A location on the 10-bit hash ring.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct RingPosition(pub u16);

impl RingPosition {
    /// Hash arbitrary bytes onto the ring.
    ///
    /// The BLAKE3 digest is read as one big-endian integer and reduced mod
    /// `RING_SIZE`; since the ring size is a power of two only the trailing
    /// bytes matter.
    pub fn of(data: &[u8]) -> Self {
        let digest = blake3::hash(data);
        let bytes = digest.as_bytes();
        let tail = u16::from_be_bytes([bytes[30], bytes[31]]);
        Self(tail % RING_SIZE)
    }

    pub fn of_key(key: &str) -> Self {
        Self::of(key.as_bytes())
    }

    /// Position reached by moving `step` slots clockwise.
    pub fn offset(self, step: u16) -> Self {
        Self(((self.0 as u32 + step as u32) % RING_SIZE as u32) as u16)
    }

    pub fn value(self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for RingPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A node's network identity. Fixed for the lifetime of the process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NodeIdentity {
    pub address: String,
    pub port: u16,
    pub user_id: UserId,
}

impl NodeIdentity {
    pub fn new(address: impl Into<String>, port: u16, user_id: UserId) -> Self {
        Self {
            address: address.into(),
            port,
            user_id,
        }
    }

    /// `address:port`, the string hashed onto the ring.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn ring_position(&self) -> RingPosition {
        RingPosition::of_key(&self.endpoint())
    }
}

impl std::fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.user_id, self.endpoint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_position_deterministic_and_bounded() {
        for port in [1u16, 80, 4001, 5000, 65535] {
            for host in ["127.0.0.1", "10.0.0.7", "example.org"] {
                let a = NodeIdentity::new(host, port, UserId::from("u1"));
                let b = NodeIdentity::new(host, port, UserId::from("someone-else"));
                assert_eq!(a.ring_position(), b.ring_position());
                assert!(a.ring_position().value() < RING_SIZE);
            }
        }
    }

    #[test]
    fn test_offset_wraps() {
        assert_eq!(RingPosition(1020).offset(8), RingPosition(4));
        assert_eq!(RingPosition(0).offset(512), RingPosition(512));
    }

    #[test]
    fn test_user_id_short() {
        assert_eq!(UserId::from("abcdefghijkl").short(), "abcdefgh");
        assert_eq!(UserId::from("42").short(), "42");
    }
}

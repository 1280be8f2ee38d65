/// Application name
pub const APP_NAME: &str = "cairn";

/// Number of bits in a ring position
pub const RING_BITS: u32 = 10;

/// Size of the circular position space (2^RING_BITS)
pub const RING_SIZE: u16 = 1 << RING_BITS;

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Maximum encrypted file size in bytes (250 MiB)
pub const DEFAULT_MAX_FILE_SIZE: usize = 250 * 1024 * 1024;

/// Number of chat messages a bucket keeps (oldest evicted first)
pub const MAX_CHAT_HISTORY: usize = 100;

/// Hop budget stamped on a fresh search
pub const DEFAULT_FLOOD_TTL: u8 = 7;

/// De-duplication cache bounds
pub const DEFAULT_SEEN_CAPACITY: usize = 4096;
pub const DEFAULT_SEEN_WINDOW_SECS: u64 = 600;

/// Longest JSON line accepted from a peer (64 KiB)
pub const MAX_WIRE_LINE: usize = 64 * 1024;

/// Default overlay listen port
pub const DEFAULT_PORT: u16 = 5000;

/// Content store client defaults
pub const DEFAULT_STORE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_STORE_MAX_RETRIES: u32 = 3;
pub const DEFAULT_STORE_BACKOFF_MS: u64 = 500;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_ENVELOPE_KEY: &str = "cairn-envelope-key-v1";

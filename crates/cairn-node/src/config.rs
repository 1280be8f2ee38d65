//! Node configuration loaded from environment variables.
//!
//! All settings have defaults so a node can start with zero configuration
//! for local development. Malformed values are logged and ignored.

use std::path::PathBuf;
use std::time::Duration;

use cairn_net::{parse_endpoints, OverlayConfig};
use cairn_shared::constants::{
    DEFAULT_FLOOD_TTL, DEFAULT_MAX_FILE_SIZE, DEFAULT_PORT, DEFAULT_SEEN_CAPACITY,
    DEFAULT_SEEN_WINDOW_SECS,
};
use cairn_shared::crypto::{generate_symmetric_key, key_from_hex};
use cairn_shared::{CryptoEnvelope, NodeIdentity, PeerAddr, SymmetricKey, UserId};
use cairn_store::ContentStoreConfig;

/// Where the envelope key comes from.
#[derive(Clone)]
pub enum KeyMaterial {
    /// Raw 32-byte key. Env: `CAIRN_KEY` (64 hex chars)
    Key(SymmetricKey),
    /// Derived with BLAKE3. Env: `CAIRN_PASSPHRASE`
    Passphrase(String),
    /// Random per process; nothing written with it survives a restart.
    Ephemeral,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyMaterial::Key(_) => f.write_str("Key(<redacted>)"),
            KeyMaterial::Passphrase(_) => f.write_str("Passphrase(<redacted>)"),
            KeyMaterial::Ephemeral => f.write_str("Ephemeral"),
        }
    }
}

/// Durable store behind the bucket hash registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryBackend {
    Json,
    Sqlite,
}

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address to bind and advertise.
    /// Env: `CAIRN_HOST`
    /// Default: `127.0.0.1`
    pub host: String,

    /// Overlay listen port; `0` picks one.
    /// Env: `CAIRN_PORT`
    /// Default: `5000`
    pub port: u16,

    /// Env: `CAIRN_USER_ID`
    pub user_id: UserId,

    /// Env: `CAIRN_USERNAME`
    pub username: String,

    pub key: KeyMaterial,

    /// Env: `CONTENT_STORE_URL`, `CONTENT_STORE_TIMEOUT_SECS`,
    /// `CONTENT_STORE_MAX_RETRIES`
    pub content_store: ContentStoreConfig,

    /// Registry document or database. `None` uses the platform data dir.
    /// Env: `REGISTRY_PATH`
    pub registry_path: Option<PathBuf>,

    /// Env: `REGISTRY_BACKEND` (`json` | `sqlite`)
    /// Default: `json`
    pub registry_backend: RegistryBackend,

    /// Largest sealed file accepted or served (250 MiB).
    /// Env: `MAX_FILE_SIZE`
    pub max_file_size: usize,

    /// Env: `FLOOD_TTL`
    /// Default: `7`
    pub flood_ttl: u8,

    /// Env: `SEEN_CACHE_CAPACITY`, `SEEN_CACHE_WINDOW_SECS`
    pub seen_capacity: usize,
    pub seen_window: Duration,

    /// Peers dialled on startup.
    /// Env: `BOOTSTRAP_PEERS` (comma-separated `host:port`)
    pub bootstrap_peers: Vec<PeerAddr>,

    /// Extra peers, one `host:port` per line.
    /// Env: `BOOTSTRAP_PEERS_FILE`
    pub bootstrap_file: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            user_id: UserId::from("local"),
            username: "anonymous".to_string(),
            key: KeyMaterial::Ephemeral,
            content_store: ContentStoreConfig::default(),
            registry_path: None,
            registry_backend: RegistryBackend::Json,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            flood_ttl: DEFAULT_FLOOD_TTL,
            seen_capacity: DEFAULT_SEEN_CAPACITY,
            seen_window: Duration::from_secs(DEFAULT_SEEN_WINDOW_SECS),
            bootstrap_peers: Vec::new(),
            bootstrap_file: None,
        }
    }
}

impl NodeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(host) = var("CAIRN_HOST") {
            config.host = host;
        }
        parse_into(&var, "CAIRN_PORT", &mut config.port);

        if let Some(id) = var("CAIRN_USER_ID").filter(|v| !v.is_empty()) {
            config.user_id = UserId::new(id);
        }
        if let Some(name) = var("CAIRN_USERNAME").filter(|v| !v.is_empty()) {
            config.username = name;
        }

        if let Some(hex_key) = var("CAIRN_KEY") {
            match key_from_hex(hex_key.trim()) {
                Ok(key) => config.key = KeyMaterial::Key(key),
                Err(e) => tracing::warn!(error = %e, "Invalid CAIRN_KEY, ignoring"),
            }
        }
        if matches!(config.key, KeyMaterial::Ephemeral) {
            if let Some(passphrase) = var("CAIRN_PASSPHRASE").filter(|v| !v.is_empty()) {
                config.key = KeyMaterial::Passphrase(passphrase);
            }
        }

        if let Some(url) = var("CONTENT_STORE_URL") {
            config.content_store.base_url = url;
        }
        let mut timeout_secs = config.content_store.timeout.as_secs();
        parse_into(&var, "CONTENT_STORE_TIMEOUT_SECS", &mut timeout_secs);
        config.content_store.timeout = Duration::from_secs(timeout_secs);
        parse_into(&var, "CONTENT_STORE_MAX_RETRIES", &mut config.content_store.max_retries);
        config.content_store.max_retries = config.content_store.max_retries.max(1);

        if let Some(path) = var("REGISTRY_PATH").filter(|v| !v.is_empty()) {
            config.registry_path = Some(PathBuf::from(path));
        }
        if let Some(backend) = var("REGISTRY_BACKEND") {
            match backend.to_ascii_lowercase().as_str() {
                "json" => config.registry_backend = RegistryBackend::Json,
                "sqlite" => config.registry_backend = RegistryBackend::Sqlite,
                _ => tracing::warn!(value = %backend, "Invalid REGISTRY_BACKEND, using default"),
            }
        }

        parse_into(&var, "MAX_FILE_SIZE", &mut config.max_file_size);
        parse_into(&var, "FLOOD_TTL", &mut config.flood_ttl);
        parse_into(&var, "SEEN_CACHE_CAPACITY", &mut config.seen_capacity);
        let mut window_secs = config.seen_window.as_secs();
        parse_into(&var, "SEEN_CACHE_WINDOW_SECS", &mut window_secs);
        config.seen_window = Duration::from_secs(window_secs);

        if let Some(raw) = var("BOOTSTRAP_PEERS") {
            let entries: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            config.bootstrap_peers = parse_endpoints(&entries);
        }
        if let Some(path) = var("BOOTSTRAP_PEERS_FILE").filter(|v| !v.is_empty()) {
            config.bootstrap_file = Some(PathBuf::from(path));
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    /// The envelope built from the configured key material.
    pub fn envelope(&self) -> CryptoEnvelope {
        let envelope = match &self.key {
            KeyMaterial::Key(key) => CryptoEnvelope::new(*key),
            KeyMaterial::Passphrase(passphrase) => CryptoEnvelope::from_passphrase(passphrase),
            KeyMaterial::Ephemeral => {
                tracing::warn!("No CAIRN_KEY or CAIRN_PASSPHRASE set, using a throwaway key");
                CryptoEnvelope::new(generate_symmetric_key())
            }
        };
        envelope.with_max_file_size(self.max_file_size)
    }

    pub fn overlay_config(&self) -> OverlayConfig {
        OverlayConfig {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            default_ttl: self.flood_ttl,
            seen_capacity: self.seen_capacity,
            seen_window: self.seen_window,
            max_transfer_size: self.max_file_size,
            ..OverlayConfig::default()
        }
    }

    /// Identity for a node bound to `port` (which may differ from the
    /// configured one when that was `0`).
    pub fn identity(&self, port: u16) -> NodeIdentity {
        NodeIdentity::new(self.host.clone(), port, self.user_id.clone())
    }
}

fn parse_into<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    slot: &mut T,
) {
    if let Some(raw) = var(name) {
        match raw.trim().parse::<T>() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!(variable = name, value = %raw, "Invalid value, using default"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = NodeConfig::from_lookup(lookup(&[]));
        assert_eq!(config.port, 5000);
        assert_eq!(config.flood_ttl, 7);
        assert_eq!(config.registry_backend, RegistryBackend::Json);
        assert_eq!(config.content_store.max_retries, 3);
        assert!(matches!(config.key, KeyMaterial::Ephemeral));
        assert!(config.bootstrap_peers.is_empty());
    }

    #[test]
    fn test_overrides() {
        let config = NodeConfig::from_lookup(lookup(&[
            ("CAIRN_HOST", "10.0.0.7"),
            ("CAIRN_PORT", "6001"),
            ("CAIRN_USER_ID", "17"),
            ("CAIRN_USERNAME", "alice"),
            ("CAIRN_PASSPHRASE", "correct horse"),
            ("REGISTRY_BACKEND", "SQLite"),
            ("FLOOD_TTL", "3"),
            ("CONTENT_STORE_TIMEOUT_SECS", "5"),
            ("BOOTSTRAP_PEERS", "10.0.0.8:6001, bad, 10.0.0.9:6002"),
        ]));

        assert_eq!(config.host, "10.0.0.7");
        assert_eq!(config.port, 6001);
        assert_eq!(config.user_id, UserId::from("17"));
        assert_eq!(config.username, "alice");
        assert!(matches!(config.key, KeyMaterial::Passphrase(_)));
        assert_eq!(config.registry_backend, RegistryBackend::Sqlite);
        assert_eq!(config.flood_ttl, 3);
        assert_eq!(config.content_store.timeout, Duration::from_secs(5));
        assert_eq!(config.bootstrap_peers.len(), 2);
        assert_eq!(config.overlay_config().default_ttl, 3);
        assert_eq!(config.identity(6001).endpoint(), "10.0.0.7:6001");
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = NodeConfig::from_lookup(lookup(&[
            ("CAIRN_PORT", "not-a-port"),
            ("FLOOD_TTL", "300"),
            ("CAIRN_KEY", "abcd"),
            ("REGISTRY_BACKEND", "postgres"),
            ("CONTENT_STORE_MAX_RETRIES", "0"),
        ]));
        assert_eq!(config.port, 5000);
        assert_eq!(config.flood_ttl, 7);
        assert!(matches!(config.key, KeyMaterial::Ephemeral));
        assert_eq!(config.registry_backend, RegistryBackend::Json);
        assert_eq!(config.content_store.max_retries, 1);
    }

    #[test]
    fn test_hex_key_wins_over_passphrase() {
        let hex_key = "ab".repeat(32);
        let config = NodeConfig::from_lookup(lookup(&[
            ("CAIRN_KEY", hex_key.as_str()),
            ("CAIRN_PASSPHRASE", "ignored"),
        ]));
        assert!(matches!(config.key, KeyMaterial::Key(k) if k == [0xab; 32]));
        assert!(!format!("{config:?}").contains("abab"));

        let sealed = config.envelope().encrypt(b"x").unwrap();
        assert_eq!(config.envelope().decrypt(&sealed).unwrap(), b"x");
    }

    #[test]
    fn test_passphrase_envelopes_agree() {
        let a = NodeConfig::from_lookup(lookup(&[("CAIRN_PASSPHRASE", "shared")]));
        let b = NodeConfig::from_lookup(lookup(&[("CAIRN_PASSPHRASE", "shared")]));
        let token = a.envelope().encrypt_file(b"payload").unwrap();
        assert_eq!(b.envelope().decrypt_file(&token).unwrap(), b"payload");
    }
}

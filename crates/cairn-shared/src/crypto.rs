use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_MAX_FILE_SIZE, KDF_CONTEXT_ENVELOPE_KEY, NONCE_SIZE, SYMMETRIC_KEY_SIZE, TAG_SIZE,
};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

// Returns nonce || ciphertext (24 bytes nonce prepended)
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Size of the token `encrypt` produces for a plaintext of `len` bytes.
pub const fn sealed_len(len: usize) -> usize {
    NONCE_SIZE + len + TAG_SIZE
}

// BLAKE3 KDF with domain separation
pub fn derive_key_from_passphrase(passphrase: &[u8], context: &str) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(passphrase);
    let hash = hasher.finalize();
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    key.copy_from_slice(&hash.as_bytes()[..SYMMETRIC_KEY_SIZE]);
    key
}

/// Parse a 64-character hex string into a symmetric key.
pub fn key_from_hex(hex_key: &str) -> Result<SymmetricKey, CryptoError> {
    let bytes = hex::decode(hex_key.trim()).map_err(|_| CryptoError::InvalidKeyLength)?;
    SymmetricKey::try_from(bytes.as_slice()).map_err(|_| CryptoError::InvalidKeyLength)
}

/// Hex BLAKE3 digest of `parts` joined with `:`, used for message and
/// file identifiers.
pub fn digest_id(parts: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b":");
        }
        hasher.update(part.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// What an envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Chat,
    Request,
    Text,
}

/// Structured plaintext wrapped around every encrypted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub content: String,
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub timestamp: DateTime<Utc>,
}

/// Authenticated encryption bound to the node's single shared key.
///
/// Every holder of the key can read every token: the trust model is flat,
/// not per-peer.
#[derive(Clone)]
pub struct CryptoEnvelope {
    key: SymmetricKey,
    max_file_size: usize,
}

impl std::fmt::Debug for CryptoEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoEnvelope")
            .field("max_file_size", &self.max_file_size)
            .finish_non_exhaustive()
    }
}

impl CryptoEnvelope {
    pub fn new(key: SymmetricKey) -> Self {
        Self {
            key,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }

    pub fn with_max_file_size(mut self, max_file_size: usize) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    pub fn from_passphrase(passphrase: &str) -> Self {
        Self::new(derive_key_from_passphrase(
            passphrase.as_bytes(),
            KDF_CONTEXT_ENVELOPE_KEY,
        ))
    }

    pub fn max_file_size(&self) -> usize {
        self.max_file_size
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        encrypt(&self.key, plaintext)
    }

    pub fn decrypt(&self, token: &[u8]) -> Result<Vec<u8>, CryptoError> {
        decrypt(&self.key, token)
    }

    /// Wrap `content` in an [`Envelope`] and encrypt it. The token is base64
    /// so it can sit inside JSON documents.
    pub fn encrypt_message(&self, content: &str, kind: EnvelopeKind) -> Result<String, CryptoError> {
        let envelope = Envelope {
            content: content.to_string(),
            kind,
            timestamp: Utc::now(),
        };
        let plaintext =
            serde_json::to_vec(&envelope).map_err(|e| CryptoError::Envelope(e.to_string()))?;
        let sealed = self.encrypt(&plaintext)?;
        Ok(BASE64.encode(sealed))
    }

    pub fn decrypt_message(&self, token: &str) -> Result<Envelope, CryptoError> {
        let sealed = BASE64
            .decode(token.trim())
            .map_err(|_| CryptoError::DecryptionFailed)?;
        let plaintext = self.decrypt(&sealed)?;
        serde_json::from_slice(&plaintext).map_err(|e| CryptoError::Envelope(e.to_string()))
    }

    /// Encrypt a whole file. Rejected up front when the token would exceed
    /// the configured maximum.
    pub fn encrypt_file(&self, bytes: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let size = sealed_len(bytes.len());
        if size > self.max_file_size {
            return Err(CryptoError::Capacity {
                size,
                max: self.max_file_size,
            });
        }
        self.encrypt(bytes)
    }

    pub fn decrypt_file(&self, token: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if token.len() > self.max_file_size {
            return Err(CryptoError::Capacity {
                size: token.len(),
                max: self.max_file_size,
            });
        }
        self.decrypt(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> CryptoEnvelope {
        CryptoEnvelope::new(generate_symmetric_key())
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = generate_symmetric_key();
        let plaintext = b"meet at the third cairn";

        let encrypted = encrypt(&key, plaintext).unwrap();
        let decrypted = decrypt(&key, &encrypted).unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = generate_symmetric_key();
        let key2 = generate_symmetric_key();

        let encrypted = encrypt(&key1, b"Secret message").unwrap();
        assert!(matches!(
            decrypt(&key2, &encrypted),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = generate_symmetric_key();

        let mut encrypted = encrypt(&key, b"Important data").unwrap();
        let len = encrypted.len();
        encrypted[len - 1] ^= 0xFF;

        assert!(matches!(
            decrypt(&key, &encrypted),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_truncated_token_fails() {
        let key = generate_symmetric_key();
        let encrypted = encrypt(&key, b"abc").unwrap();
        assert!(decrypt(&key, &encrypted[..NONCE_SIZE + 4]).is_err());
        assert!(decrypt(&key, &[]).is_err());
    }

    #[test]
    fn test_sealed_len_matches() {
        let key = generate_symmetric_key();
        let encrypted = encrypt(&key, b"test").unwrap();
        assert_eq!(encrypted.len(), sealed_len(4));
    }

    #[test]
    fn test_message_envelope_roundtrip() {
        let env = envelope();
        let token = env.encrypt_message("hello there", EnvelopeKind::Chat).unwrap();

        let opened = env.decrypt_message(&token).unwrap();
        assert_eq!(opened.content, "hello there");
        assert_eq!(opened.kind, EnvelopeKind::Chat);
    }

    #[test]
    fn test_message_envelope_tampered() {
        let env = envelope();
        let token = env.encrypt_message("hello", EnvelopeKind::Chat).unwrap();
        let mut raw = BASE64.decode(&token).unwrap();
        raw[NONCE_SIZE] ^= 0x01;
        let tampered = BASE64.encode(raw);

        assert!(matches!(
            env.decrypt_message(&tampered),
            Err(CryptoError::DecryptionFailed)
        ));
        assert!(matches!(
            env.decrypt_message("not base64 at all!"),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_non_envelope_plaintext_is_envelope_error() {
        let env = envelope();
        let raw = env.encrypt(b"just bytes").unwrap();
        let token = BASE64.encode(raw);
        assert!(matches!(
            env.decrypt_message(&token),
            Err(CryptoError::Envelope(_))
        ));
    }

    #[test]
    fn test_file_capacity_enforced() {
        let env = envelope().with_max_file_size(64);

        // 24 + 24 + 16 == 64 fits exactly
        assert!(env.encrypt_file(&[7u8; 24]).is_ok());

        match env.encrypt_file(&[7u8; 25]) {
            Err(CryptoError::Capacity { size, max }) => {
                assert_eq!(size, 65);
                assert_eq!(max, 64);
            }
            other => panic!("expected capacity error, got {other:?}"),
        }

        assert!(matches!(
            env.decrypt_file(&[0u8; 65]),
            Err(CryptoError::Capacity { .. })
        ));
    }

    #[test]
    fn test_file_roundtrip() {
        let env = envelope();
        let data = vec![0xA5u8; 4096];
        let token = env.encrypt_file(&data).unwrap();
        assert_eq!(env.decrypt_file(&token).unwrap(), data);
    }

    #[test]
    fn test_passphrase_key_deterministic() {
        let a = derive_key_from_passphrase(b"pass", KDF_CONTEXT_ENVELOPE_KEY);
        let b = derive_key_from_passphrase(b"pass", KDF_CONTEXT_ENVELOPE_KEY);
        let c = derive_key_from_passphrase(b"other", KDF_CONTEXT_ENVELOPE_KEY);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let token = CryptoEnvelope::from_passphrase("pass").encrypt(b"x").unwrap();
        assert_eq!(CryptoEnvelope::new(a).decrypt(&token).unwrap(), b"x");
    }

    #[test]
    fn test_key_from_hex() {
        let key = key_from_hex(&"ab".repeat(32)).unwrap();
        assert_eq!(key, [0xab; 32]);
        assert!(key_from_hex("abcd").is_err());
        assert!(key_from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_digest_id_separates_parts() {
        assert_ne!(digest_id(&["ab", "c"]), digest_id(&["a", "bc"]));
        assert_eq!(digest_id(&["a", "b"]).len(), 64);
    }
}

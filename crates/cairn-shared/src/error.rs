use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Payload too large: {size} bytes (max {max})")]
    Capacity { size: usize, max: usize },

    #[error("Malformed envelope: {0}")]
    Envelope(String),
}

use thiserror::Error;

use cairn_net::{NetError, RingError};
use cairn_shared::CryptoError;
use cairn_store::StoreError;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Network error: {0}")]
    Net(#[from] NetError),

    #[error("Ring error: {0}")]
    Ring(#[from] RingError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Configuration error: {0}")]
    Config(String),
}

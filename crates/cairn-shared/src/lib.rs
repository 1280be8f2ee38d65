// Types, crypto and wire protocol shared by every cairn crate.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod types;

pub use crypto::{CryptoEnvelope, Envelope, EnvelopeKind, SymmetricKey};
pub use error::CryptoError;
pub use protocol::{FloodMessage, PeerAddr};
pub use types::{NodeIdentity, RingPosition, UserId};

// Hash ring placement and the TTL-bounded flood overlay.

pub mod discovery;
pub mod error;
pub mod overlay;
pub mod peers;
pub mod ring;
pub mod seen;
pub mod transfer;
pub mod wire;

pub use discovery::{load_bootstrap_peers, parse_endpoints};
pub use error::{NetError, RingError};
pub use overlay::{FileIndex, FileSource, FloodNode, IndexedFile, OverlayConfig, OverlayEvent};
pub use peers::{ConnectionInfo, Direction, PeerTable};
pub use ring::{HashRing, StoredEntry};
pub use seen::SeenCache;
pub use transfer::fetch_file;

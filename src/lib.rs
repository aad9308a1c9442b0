//! OpenClipboard node runtime: local-first clipboard sync across trusted
//! LAN peers.
//!
//! Platform clients embed one [`Node`]: it owns the device identity and
//! trust store, listens for and dials mutually-authenticated encrypted
//! sessions, discovers peers over mDNS, polls the local clipboard through
//! an injected [`ClipboardCapability`] and fans changes out to every
//! connected trusted peer, while a bounded echo suppressor keeps remote
//! writes from reflecting back.

pub mod discovery;
pub mod echo;
pub mod error;
pub mod events;
pub mod frame;
pub mod history;
pub mod identity;
mod mesh;
mod net;
pub mod node;
pub mod pairing;
mod session;
pub mod trust;

pub use discovery::SERVICE_TYPE;
pub use echo::EchoSuppressor;
pub use error::{NodeError, Result};
pub use events::{ClipboardCapability, DiscoverySink, EventSink};
pub use history::{HistoryEntry, HistoryStore};
pub use identity::Identity;
pub use mesh::DEFAULT_POLL_INTERVAL;
pub use net::DEFAULT_PORT;
pub use node::{NearbyPeer, Node};
pub use pairing::PairingPayload;
pub use trust::{TrustRecord, TrustStore};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

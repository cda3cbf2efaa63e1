// Manages many torrent sessions at once: resolves where torrents come from,
// keeps one session per info hash and charges every peer connection of every
// session to a shared download and upload budget.

mod config;
mod de;
mod manager;
mod metainfo;
mod session;
mod source;
pub mod stats;

#[cfg(test)]
mod test_util;

// Re-exports
pub use config::{generate_peer_id, AddOptions, Config, PeerId, SessionOptions};
pub use manager::{BatchReport, Manager, ManagerError, Result};
pub use metainfo::{InfoHash, MetaInfoError, TorrentMeta};
pub use session::{
    ConnectionHook, PeerConnection, PeerIo, PeerStream, Session, SessionError, SessionFactory,
    SessionParams,
};
pub use source::{Resolved, Source, SourceError, SourceResolver};
pub use throttle::{Throttle, ThrottleError, Throttled};

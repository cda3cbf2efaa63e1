// What the manager needs from a torrent session. The session itself (wire
// protocol, discovery, storage) is supplied by the embedder through a
// `SessionFactory`.
use std::{fmt, net::SocketAddr, sync::Arc};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use crate::{config::SessionOptions, metainfo::{InfoHash, TorrentMeta}};

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("session has been destroyed")]
    Destroyed,

    #[error("{0}")]
    Failed(String),

}

// Byte stream to a peer.
pub trait PeerIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerIo for T {}

pub type PeerStream = Box<dyn PeerIo>;

// An established connection, passed through the manager's hook before the
// session starts talking over it.
pub struct PeerConnection {

    pub address: SocketAddr,

    pub stream: PeerStream,

}

impl PeerConnection {

    pub fn new(address: SocketAddr, stream: impl PeerIo + 'static) -> Self {
        Self {
            address,
            stream: Box::new(stream),
        }
    }

    // Replaces the stream with a wrapper around it.
    pub fn map_stream<F, S>(self, f: F) -> Self
    where
        F: FnOnce(PeerStream) -> S,
        S: PeerIo + 'static,
    {
        Self {
            address: self.address,
            stream: Box::new(f(self.stream)),
        }
    }

}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

// Called by a session for every peer connection it establishes, inbound or outbound.
pub type ConnectionHook = Arc<dyn Fn(PeerConnection) -> PeerConnection + Send + Sync>;

// Everything a factory gets to build a session from.
pub struct SessionParams {

    pub meta: TorrentMeta,

    // Merged options. `autostart` is always false, the manager starts the session.
    pub options: SessionOptions,

    pub on_connection: ConnectionHook,

}

impl fmt::Debug for SessionParams {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionParams")
            .field("meta", &self.meta)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Session: Send + Sync {

    fn info_hash(&self) -> InfoHash;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    // Stops the session and releases everything it holds, connections included.
    async fn destroy(&self) -> Result<()>;

    // Verifies data already on disk.
    async fn check(&self) -> Result<()>;

    fn peers(&self) -> Vec<SocketAddr>;

    // Fraction of the content downloaded, 0.0 to 1.0.
    fn progress(&self) -> f64;

    // Uploaded over downloaded bytes.
    fn ratio(&self) -> f64;

}

impl fmt::Debug for dyn Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Session")
            .field("info_hash", &self.info_hash())
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self, params: SessionParams) -> Result<Arc<dyn Session>>;
}

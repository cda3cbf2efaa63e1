use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use futures::StreamExt;
use throttle::{Throttle, ThrottleError, Throttled};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::Instrument;
use crate::{
    config::{AddOptions, Config},
    metainfo::{InfoHash, MetaInfoError, TorrentMeta},
    session::{ConnectionHook, PeerConnection, Session, SessionError, SessionFactory, SessionParams},
    source::{Source, SourceError, SourceResolver},
    stats::{SwarmStats, ThrottleStats},
};


pub type Result<T> = std::result::Result<T, ManagerError>;

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    MetaInfo(#[from] MetaInfoError),

    #[error("torrent {0} has already been added")]
    DuplicateTorrent(InfoHash),

    #[error("torrent {0} not found")]
    TorrentNotFound(InfoHash),

    #[error("invalid rate {0}, must be greater than zero")]
    InvalidRate(u64),

    #[error("session built for {expected} reports info hash {found}")]
    IdentityMismatch {
        expected: InfoHash,
        found: InfoHash,
    },

    #[error("torrent {id}: {source}")]
    Session {
        id: InfoHash,
        source: SessionError,
    },

}

impl From<ThrottleError> for ManagerError {
    fn from(e: ThrottleError) -> Self {
        match e {
            ThrottleError::InvalidRate(rate) => ManagerError::InvalidRate(rate),
        }
    }
}

// Outcome of an operation applied to every session.
#[derive(Debug, Default)]
pub struct BatchReport {

    // One entry per session, in the order the sessions were added.
    pub outcomes: Vec<(InfoHash, std::result::Result<(), SessionError>)>,

}

impl BatchReport {

    pub fn succeeded(&self) -> impl Iterator<Item = InfoHash> + '_ {
        self.outcomes
            .iter()
            .filter(|(_, result)| result.is_ok())
            .map(|(id, _)| *id)
    }

    pub fn failed(&self) -> impl Iterator<Item = (InfoHash, &SessionError)> + '_ {
        self.outcomes
            .iter()
            .filter_map(|(id, result)| result.as_ref().err().map(|e| (*id, e)))
    }

    pub fn len(&self) -> usize { self.outcomes.len() }

    pub fn is_empty(&self) -> bool { self.outcomes.is_empty() }

    pub fn is_success(&self) -> bool { self.failed().next().is_none() }

}

#[derive(Debug, Clone, Copy)]
enum Lifecycle {
    Start,
    Stop,
    Destroy,
}

impl Lifecycle {
    async fn apply(self, session: &dyn Session) -> std::result::Result<(), SessionError> {
        match self {
            Lifecycle::Start => session.start().await,
            Lifecycle::Stop => session.stop().await,
            Lifecycle::Destroy => session.destroy().await,
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Lifecycle::Start => write!(f, "start"),
            Lifecycle::Stop => write!(f, "stop"),
            Lifecycle::Destroy => write!(f, "destroy"),
        }
    }
}

// Owns many torrent sessions and the two bandwidth budgets shared by all of
// their peer connections.
pub struct Manager {

    config: Config,

    factory: Arc<dyn SessionFactory>,

    resolver: SourceResolver,

    // Registered sessions in insertion order. Never held across an await.
    torrents: RwLock<Vec<Arc<dyn Session>>>,

    // Gates serialising concurrent adds of the same torrent.
    inflight: Mutex<HashMap<InfoHash, Inflight>>,

    // Charged for bytes read from peers.
    download: Throttle,

    // Charged for bytes written to peers.
    upload: Throttle,

}

impl Manager {

    pub fn new(mut config: Config, factory: Arc<dyn SessionFactory>) -> Result<Self> {
        let throttle = |rate: Option<u64>| match rate {
            Some(rate) => Throttle::new(rate),
            None => Ok(Throttle::unlimited()),
        };
        let download = throttle(config.download_rate)?;
        let upload = throttle(config.upload_rate)?;
        config.max_concurrent_ops = config.max_concurrent_ops.max(1);

        Ok(Self {
            resolver: SourceResolver::new(&config)?,
            config,
            factory,
            torrents: RwLock::new(Vec::new()),
            inflight: Mutex::new(HashMap::new()),
            download,
            upload,
        })
    }

    // Resolves `source`, builds a session for it and starts it unless autostart
    // is off. Adding a torrent that is already managed fails, or returns the
    // existing session when duplicates are allowed.
    #[tracing::instrument(skip_all, fields(info_hash = tracing::field::Empty))]
    pub async fn add(&self, source: impl Into<Source>, options: AddOptions) -> Result<Arc<dyn Session>> {
        let resolved = self.resolver.resolve(source.into()).await?;
        let meta = TorrentMeta::from_resolved(resolved)?;
        let id = meta.info_hash;
        tracing::Span::current().record("info_hash", tracing::field::display(id));

        let _gate = self.gate(id).await;
        if let Some(existing) = self.get(id) {
            if options.duplicates_allowed(self.config.allow_duplicate) {
                tracing::debug!("torrent already added, returning existing session");
                return Ok(existing);
            }
            return Err(ManagerError::DuplicateTorrent(id));
        }

        let mut session_options = options.resolve(&self.config.session);
        let autostart = session_options.autostart;
        session_options.autostart = false;

        let pending = self
            .factory
            .create(SessionParams {
                meta,
                options: session_options,
                on_connection: self.connection_hook(),
            })
            .await
            .map(PendingSession::new)
            .map_err(|source| ManagerError::Session { id, source })?;

        let found = pending.session.info_hash();
        if found != id {
            pending.discard().await;
            return Err(ManagerError::IdentityMismatch { expected: id, found });
        }

        if autostart {
            if let Err(source) = pending.session.start().await {
                pending.discard().await;
                return Err(ManagerError::Session { id, source });
            }
        }

        let session = pending.register();
        self.torrents_mut().push(session.clone());
        tracing::info!("torrent added");
        Ok(session)
    }

    // Tears the session down and forgets it. Unknown torrents are ignored.
    #[tracing::instrument(skip_all, fields(info_hash = %id))]
    pub async fn remove(&self, id: InfoHash) -> Result<()> {
        let Some(session) = self.get(id) else {
            tracing::debug!("torrent not managed, nothing to remove");
            return Ok(());
        };

        session
            .destroy()
            .await
            .map_err(|source| ManagerError::Session { id, source })?;
        self.torrents_mut().retain(|s| !Arc::ptr_eq(s, &session));
        tracing::info!("torrent removed");
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(info_hash = %id))]
    pub async fn start(&self, id: InfoHash) -> Result<()> {
        self.find(id)?
            .start()
            .await
            .map_err(|source| ManagerError::Session { id, source })
    }

    #[tracing::instrument(skip_all, fields(info_hash = %id))]
    pub async fn stop(&self, id: InfoHash) -> Result<()> {
        self.find(id)?
            .stop()
            .await
            .map_err(|source| ManagerError::Session { id, source })
    }

    #[tracing::instrument(skip_all, fields(info_hash = %id))]
    pub async fn check(&self, id: InfoHash) -> Result<()> {
        self.find(id)?
            .check()
            .await
            .map_err(|source| ManagerError::Session { id, source })
    }

    pub async fn start_all(&self) -> BatchReport {
        self.for_each(Lifecycle::Start).await
    }

    pub async fn stop_all(&self) -> BatchReport {
        self.for_each(Lifecycle::Stop).await
    }

    // Checks every session in the background, failures are only logged.
    // Must be called from within a tokio runtime.
    pub fn check_all(&self) {
        for session in self.torrents() {
            let id = session.info_hash();
            tokio::spawn(
                async move {
                    match session.check().await {
                        Ok(()) => tracing::debug!("check complete"),
                        Err(e) => tracing::warn!("check failed: {}", e),
                    }
                }
                .instrument(tracing::info_span!("check", info_hash = %id)),
            );
        }
    }

    // Tears every session down. Sessions that fail to tear down stay registered.
    pub async fn destroy(&self) -> BatchReport {
        let report = self.for_each(Lifecycle::Destroy).await;
        let destroyed: HashSet<InfoHash> = report.succeeded().collect();
        self.torrents_mut().retain(|s| !destroyed.contains(&s.info_hash()));
        tracing::info!("destroyed {} of {} torrents", destroyed.len(), report.len());
        report
    }

    pub fn get(&self, id: InfoHash) -> Option<Arc<dyn Session>> {
        self.torrents_ref().iter().find(|s| s.info_hash() == id).cloned()
    }

    // Snapshot of the registered sessions.
    pub fn torrents(&self) -> Vec<Arc<dyn Session>> {
        self.torrents_ref().clone()
    }

    pub fn len(&self) -> usize {
        self.torrents_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.torrents_ref().is_empty()
    }

    pub fn set_download_rate(&self, rate: u64) -> Result<()> {
        self.download.set_rate(rate)?;
        tracing::info!("download rate set to {} B/s", rate);
        Ok(())
    }

    pub fn set_upload_rate(&self, rate: u64) -> Result<()> {
        self.upload.set_rate(rate)?;
        tracing::info!("upload rate set to {} B/s", rate);
        Ok(())
    }

    pub fn download_rate(&self) -> u64 {
        self.download.rate()
    }

    pub fn upload_rate(&self) -> u64 {
        self.upload.rate()
    }

    pub fn download_throttle(&self) -> &Throttle {
        &self.download
    }

    pub fn upload_throttle(&self) -> &Throttle {
        &self.upload
    }

    pub fn num_peers(&self) -> usize {
        self.torrents().iter().map(|s| s.peers().len()).sum()
    }

    // Mean progress of all sessions.
    pub fn progress(&self) -> Option<f64> {
        mean(self.torrents().iter().map(|s| s.progress()))
    }

    // Mean share ratio of all sessions.
    pub fn ratio(&self) -> Option<f64> {
        mean(self.torrents().iter().map(|s| s.ratio()))
    }

    pub fn stats(&self) -> SwarmStats {
        let torrents = self.torrents();
        SwarmStats {
            num_torrents: torrents.len(),
            num_peers: torrents.iter().map(|s| s.peers().len()).sum(),
            progress: mean(torrents.iter().map(|s| s.progress())),
            ratio: mean(torrents.iter().map(|s| s.ratio())),
            download: ThrottleStats::from(&self.download),
            upload: ThrottleStats::from(&self.upload),
        }
    }

    // Hook handed to every session, charges each connection's reads to the
    // download throttle and its writes to the upload throttle.
    fn connection_hook(&self) -> ConnectionHook {
        let download = self.download.clone();
        let upload = self.upload.clone();
        Arc::new(move |connection: PeerConnection| {
            tracing::trace!("throttling connection to {}", connection.address);
            connection.map_stream(|stream| {
                Throttled::new(stream)
                    .limit_reads(&download)
                    .limit_writes(&upload)
            })
        })
    }

    async fn for_each(&self, op: Lifecycle) -> BatchReport {
        let outcomes = futures::stream::iter(self.torrents())
            .map(|session| async move {
                let id = session.info_hash();
                let result = op.apply(session.as_ref()).await;
                if let Err(e) = &result {
                    tracing::warn!("{} of {} failed: {}", op, id, e);
                }
                (id, result)
            })
            .buffered(self.config.max_concurrent_ops)
            .collect::<Vec<_>>()
            .await;
        BatchReport { outcomes }
    }

    fn find(&self, id: InfoHash) -> Result<Arc<dyn Session>> {
        self.get(id).ok_or(ManagerError::TorrentNotFound(id))
    }

    async fn gate(&self, id: InfoHash) -> Gate<'_> {
        let lock = {
            let mut inflight = self.inflight();
            let entry = inflight.entry(id).or_default();
            entry.users += 1;
            entry.lock.clone()
        };
        // Counted from here on, so an add cancelled while waiting still releases its entry.
        let mut gate = Gate {
            manager: self,
            id,
            permit: None,
        };
        gate.permit = Some(lock.lock_owned().await);
        gate
    }

    fn inflight(&self) -> MutexGuard<'_, HashMap<InfoHash, Inflight>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn torrents_ref(&self) -> RwLockReadGuard<'_, Vec<Arc<dyn Session>>> {
        self.torrents.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn torrents_mut(&self) -> RwLockWriteGuard<'_, Vec<Arc<dyn Session>>> {
        self.torrents.write().unwrap_or_else(PoisonError::into_inner)
    }

}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Manager")
            .field("config", &self.config)
            .field("torrents", &self.len())
            .field("download", &self.download)
            .field("upload", &self.upload)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Inflight {

    lock: Arc<AsyncMutex<()>>,

    // Adds holding or waiting for the lock.
    users: usize,

}

// Held while adding one torrent, from before it waits for the lock until the
// add finishes or is dropped. The map entry goes away with the last user.
struct Gate<'a> {

    manager: &'a Manager,

    id: InfoHash,

    permit: Option<OwnedMutexGuard<()>>,

}

impl Drop for Gate<'_> {
    fn drop(&mut self) {
        self.permit.take();
        let mut inflight = self.manager.inflight();
        if let Some(entry) = inflight.get_mut(&self.id) {
            entry.users -= 1;
            if entry.users == 0 {
                inflight.remove(&self.id);
            }
        }
    }
}

// A session built by `add` that is not registered yet. Torn down if the add
// fails or is dropped before registering it.
struct PendingSession {

    session: Arc<dyn Session>,

    armed: bool,

}

impl PendingSession {

    fn new(session: Arc<dyn Session>) -> Self {
        Self {
            session,
            armed: true,
        }
    }

    fn register(mut self) -> Arc<dyn Session> {
        self.armed = false;
        self.session.clone()
    }

    async fn discard(mut self) {
        self.armed = false;
        if let Err(e) = self.session.destroy().await {
            tracing::warn!("failed to tear down unregistered session: {}", e);
        }
    }

}

impl Drop for PendingSession {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let session = self.session.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = session.destroy().await {
                        tracing::warn!("failed to tear down abandoned session: {}", e);
                    }
                });
            },
            Err(_) => tracing::warn!("abandoned session {} not torn down, no runtime", session.info_hash()),
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

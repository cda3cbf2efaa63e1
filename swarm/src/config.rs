use std::{path::PathBuf, time::Duration};
use rand::Rng;

// 20 byte id sent to peers and trackers.
pub type PeerId = [u8; 20];

#[derive(Debug, Clone)]
pub struct Config {

    // Defaults handed to every session, overridable per torrent with `AddOptions`.
    pub session: SessionOptions,

    // Adding a torrent that is already managed returns the existing session
    // instead of failing with a duplicate error.
    pub allow_duplicate: bool,

    // Aggregate bytes per second over all peer connections, `None` for no limit.
    pub download_rate: Option<u64>,

    pub upload_rate: Option<u64>,

    // Extra attempts when fetching a torrent over http fails.
    pub retry_limit: u32,

    // Timeout of a single http request.
    pub request_timeout: Duration,

    // Sessions operated on at once by the bulk operations.
    pub max_concurrent_ops: usize,

}

impl Default for Config {
    fn default() -> Self {
        Self {
            session: SessionOptions::default(),
            allow_duplicate: false,
            download_rate: None,
            upload_rate: None,
            retry_limit: 0,
            request_timeout: Duration::from_secs(5),
            max_concurrent_ops: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {

    pub peer_id: PeerId,

    pub user_agent: String,

    // Directory downloads are written to.
    pub path: PathBuf,

    pub port: u16,

    pub dht: bool,

    // Start the session as soon as it has been added.
    pub autostart: bool,

}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            peer_id: generate_peer_id(),
            user_agent: format!("Swarm/{}", env!("CARGO_PKG_VERSION")),
            path: PathBuf::from("downloads"),
            port: 6881,
            dht: true,
            autostart: true,
        }
    }
}

impl SessionOptions {

    // Uses `id` as the peer id if it is exactly 20 bytes, otherwise keeps a generated one.
    pub fn with_peer_id(mut self, id: impl AsRef<[u8]>) -> Self {
        match PeerId::try_from(id.as_ref()) {
            Ok(id) => self.peer_id = id,
            Err(_) => {
                tracing::warn!("peer id must be 20 bytes, got {}, using a generated one", id.as_ref().len());
                self.peer_id = generate_peer_id();
            },
        }
        self
    }

}

// Azureus style id, `-SW0001-` followed by 12 random hex characters.
pub fn generate_peer_id() -> PeerId {
    let random: [u8; 6] = rand::thread_rng().gen();
    let id = format!("-SW{}-{}", version_tag(env!("CARGO_PKG_VERSION")), hex::encode(random));

    let mut peer_id = [0u8; 20];
    peer_id.copy_from_slice(&id.as_bytes()[..20]);
    peer_id
}

// Each version component mod 100 as two digits, first four digits kept.
fn version_tag(version: &str) -> String {
    let digits: String = version
        .split('.')
        .map(|part| {
            let n = part
                .chars()
                .take_while(char::is_ascii_digit)
                .collect::<String>()
                .parse::<u64>()
                .unwrap_or(0);
            format!("{:02}", n % 100)
        })
        .collect();
    format!("{:0<4.4}", digits)
}

// Per torrent overrides, unset fields fall back to the manager's defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddOptions {

    pub peer_id: Option<PeerId>,

    pub user_agent: Option<String>,

    pub path: Option<PathBuf>,

    pub port: Option<u16>,

    pub dht: Option<bool>,

    pub autostart: Option<bool>,

    pub allow_duplicate: Option<bool>,

}

impl AddOptions {

    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn dht(mut self, dht: bool) -> Self {
        self.dht = Some(dht);
        self
    }

    pub fn autostart(mut self, autostart: bool) -> Self {
        self.autostart = Some(autostart);
        self
    }

    pub fn allow_duplicate(mut self, allow: bool) -> Self {
        self.allow_duplicate = Some(allow);
        self
    }

    pub fn peer_id(mut self, peer_id: PeerId) -> Self {
        self.peer_id = Some(peer_id);
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    // Fills unset fields from `defaults`.
    pub fn resolve(&self, defaults: &SessionOptions) -> SessionOptions {
        SessionOptions {
            peer_id: self.peer_id.unwrap_or(defaults.peer_id),
            user_agent: self.user_agent.clone().unwrap_or_else(|| defaults.user_agent.clone()),
            path: self.path.clone().unwrap_or_else(|| defaults.path.clone()),
            port: self.port.unwrap_or(defaults.port),
            dht: self.dht.unwrap_or(defaults.dht),
            autostart: self.autostart.unwrap_or(defaults.autostart),
        }
    }

    pub fn duplicates_allowed(&self, default: bool) -> bool {
        self.allow_duplicate.unwrap_or(default)
    }

}

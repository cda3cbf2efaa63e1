use throttle::Throttle;

// Snapshot of everything the manager oversees.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SwarmStats {

    pub num_torrents: usize,

    pub num_peers: usize,

    // Mean over all sessions, `None` with no sessions.
    pub progress: Option<f64>,

    pub ratio: Option<f64>,

    pub download: ThrottleStats,

    pub upload: ThrottleStats,

}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThrottleStats {

    // Bytes per second, `None` when unlimited.
    pub rate: Option<u64>,

    // Streams currently charged to the throttle.
    pub attached: usize,

    pub transferred: u64,

}

impl From<&Throttle> for ThrottleStats {
    fn from(throttle: &Throttle) -> Self {
        Self {
            rate: (!throttle.is_unlimited()).then(|| throttle.rate()),
            attached: throttle.attached(),
            transferred: throttle.transferred(),
        }
    }
}

// Shared bandwidth limits for any number of byte streams.
//
// A `Throttle` is one aggregate budget in bytes per second. Every stream attached
// to it draws from the same token bucket, so ten streams attached to a 1 MiB/s
// throttle transfer 1 MiB/s between them, not 10 MiB/s.
use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::time::Instant;

mod bucket;
mod stream;

use bucket::{Bucket, Ticket};
pub use stream::Throttled;

pub type Result<T> = std::result::Result<T, ThrottleError>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ThrottleError {

    #[error("invalid rate {0}, must be greater than zero")]
    InvalidRate(u64),

}

// Handle to a shared rate limit, cheap to clone.
#[derive(Debug, Clone)]
pub struct Throttle {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {

    bucket: Mutex<Bucket>,

    // Streams currently holding an attachment.
    attached: AtomicUsize,

    // Total bytes transferred through the throttle.
    transferred: AtomicU64,

}

impl Throttle {

    pub fn new(rate: u64) -> Result<Self> {
        if rate == 0 {
            return Err(ThrottleError::InvalidRate(rate));
        }
        Ok(Self::with_rate(rate))
    }

    // A throttle that never delays, but still counts attachments and bytes.
    pub fn unlimited() -> Self {
        Self::with_rate(u64::MAX)
    }

    fn with_rate(rate: u64) -> Self {
        Self {
            shared: Arc::new(Shared {
                bucket: Mutex::new(Bucket::new(rate, Instant::now())),
                attached: AtomicUsize::new(0),
                transferred: AtomicU64::new(0),
            }),
        }
    }

    pub fn rate(&self) -> u64 {
        self.bucket().rate()
    }

    pub fn is_unlimited(&self) -> bool {
        self.bucket().is_unlimited()
    }

    // Changes the aggregate rate. Attached streams, including ones waiting on a
    // reservation, pick the new rate up within one tick. A zero rate is rejected
    // and the current rate kept.
    pub fn set_rate(&self, rate: u64) -> Result<()> {
        if rate == 0 {
            tracing::warn!("rejected throttle rate of 0");
            return Err(ThrottleError::InvalidRate(rate));
        }
        let mut bucket = self.bucket();
        tracing::debug!("throttle rate {} -> {}", bucket.rate(), rate);
        bucket.set_rate(rate, Instant::now());
        Ok(())
    }

    pub fn attached(&self) -> usize {
        self.shared.attached.load(Ordering::Acquire)
    }

    pub fn transferred(&self) -> u64 {
        self.shared.transferred.load(Ordering::Relaxed)
    }

    // Limit the reads of `stream`, i.e. data flowing in.
    pub fn attach_reads<S>(&self, stream: S) -> Throttled<S> {
        Throttled::new(stream).limit_reads(self)
    }

    // Limit the writes of `stream`, i.e. data flowing out.
    pub fn attach_writes<S>(&self, stream: S) -> Throttled<S> {
        Throttled::new(stream).limit_writes(self)
    }

    fn bucket(&self) -> MutexGuard<'_, Bucket> {
        // Bucket state is plain numbers, always usable after a panic elsewhere.
        self.shared.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn attach(&self) {
        self.shared.attached.fetch_add(1, Ordering::AcqRel);
    }

    fn detach(&self) {
        self.shared.attached.fetch_sub(1, Ordering::AcqRel);
    }

    fn reserve(&self, want: usize) -> (usize, Ticket) {
        let attached = self.attached();
        self.bucket().reserve(want, attached, Instant::now())
    }

    // Time left until `ticket` may be used, at the current rate.
    fn wait(&self, ticket: Ticket) -> Duration {
        self.bucket().wait(ticket, Instant::now())
    }

    // Settle a reservation of `reserved` bytes of which `used` were transferred.
    fn settle(&self, reserved: usize, used: usize) {
        if reserved > used {
            self.bucket().refund(reserved - used);
        }
        if used > 0 {
            self.shared.transferred.fetch_add(used as u64, Ordering::Relaxed);
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_rate_rejected() {
        assert_eq!(Throttle::new(0).unwrap_err(), ThrottleError::InvalidRate(0));

        let throttle = Throttle::new(5000).unwrap();
        assert_eq!(throttle.set_rate(0), Err(ThrottleError::InvalidRate(0)));
        assert_eq!(throttle.rate(), 5000);
    }

    #[test]
    fn test_rate_shared_between_clones() {
        let throttle = Throttle::unlimited();
        assert!(throttle.is_unlimited());
        let clone = throttle.clone();
        clone.set_rate(1024).unwrap();
        assert_eq!(throttle.rate(), 1024);
        assert!(!throttle.is_unlimited());
    }

    #[test]
    fn test_settle_counts_used_bytes() {
        let throttle = Throttle::new(10_000).unwrap();
        let (n, ticket) = throttle.reserve(1000);
        assert_eq!(throttle.wait(ticket), Duration::ZERO);
        throttle.settle(n, 400);
        assert_eq!(throttle.transferred(), 400);
    }
}

use std::time::Duration;
use tokio::time::Instant;

// Number of scheduling rounds per second the budget is divided into.
const TICKS_PER_SEC: u64 = 10;

// Longest a waiting stream sleeps before checking the bucket again.
pub(crate) const TICK: Duration = Duration::from_millis(1000 / TICKS_PER_SEC);

// Smallest reservation handed out, however many streams share the bucket.
const MIN_SHARE: usize = 512;

// Position of a reservation in the bucket's queue. It may be used once the
// bucket has credited at least this many bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Ticket(f64);

// Token bucket shared by every stream attached to one throttle.
// Streams reserve tokens before transferring, so the bucket can go into debt.
// Reservations are repaid in the order they were made, which serves
// concurrent streams in the order they asked.
#[derive(Debug)]
pub(crate) struct Bucket {

    // Bytes per second, also the capacity of the bucket.
    rate: u64,

    // Bytes made available so far, the initial burst included.
    credited: f64,

    // Bytes reserved so far.
    debited: f64,

    last_refill: Instant,

}

impl Bucket {

    pub fn new(rate: u64, now: Instant) -> Self {
        Self {
            rate,
            credited: rate as f64,
            debited: 0.0,
            last_refill: now,
        }
    }

    pub fn rate(&self) -> u64 { self.rate }

    pub fn is_unlimited(&self) -> bool { self.rate == u64::MAX }

    // Available bytes, negative while reservations are outstanding.
    pub fn tokens(&self) -> f64 { self.credited - self.debited }

    fn capacity(&self) -> f64 { self.debited + self.rate as f64 }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.credited = (self.credited + elapsed.as_secs_f64() * self.rate as f64).min(self.capacity());
        self.last_refill = now;
    }

    // Largest reservation a single stream may make in one round.
    pub fn fair_share(&self, attached: usize) -> usize {
        let per_stream = self.rate / TICKS_PER_SEC / attached.max(1) as u64;
        usize::try_from(per_stream)
            .unwrap_or(usize::MAX)
            .max(MIN_SHARE)
    }

    // Reserves up to `want` bytes, returning the reserved amount and its ticket.
    pub fn reserve(&mut self, want: usize, attached: usize, now: Instant) -> (usize, Ticket) {
        if self.is_unlimited() {
            return (want, Ticket(self.debited));
        }

        self.refill(now);
        let n = want.min(self.fair_share(attached));
        self.debited += n as f64;
        (n, Ticket(self.debited))
    }

    // How long until `ticket` is repaid at the current rate.
    pub fn wait(&mut self, ticket: Ticket, now: Instant) -> Duration {
        if self.is_unlimited() {
            return Duration::ZERO;
        }

        self.refill(now);
        let owed = ticket.0 - self.credited;
        if owed <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(owed / self.rate as f64)
        }
    }

    // Returns reserved tokens that were not used.
    pub fn refund(&mut self, n: usize) {
        if n == 0 || self.is_unlimited() {
            return;
        }
        self.credited = (self.credited + n as f64).min(self.capacity());
    }

    // Bring tokens up to date at the old rate before switching, so bytes already
    // accounted for stay accounted for.
    pub fn set_rate(&mut self, rate: u64, now: Instant) {
        if self.is_unlimited() {
            self.credited = self.debited + rate as f64;
        } else {
            self.refill(now);
        }
        self.rate = rate;
        self.credited = self.credited.min(self.capacity());
        self.last_refill = now;
    }

}

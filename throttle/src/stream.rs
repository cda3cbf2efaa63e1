use std::{
    future::Future,
    io,
    pin::Pin,
    task::{ready, Context, Poll},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::{sleep, Instant, Sleep},
};
use crate::{
    bucket::{Ticket, TICK},
    Throttle,
};

// A stream whose reads and/or writes draw from shared throttles.
// Dropping it releases its attachments.
#[derive(Debug)]
pub struct Throttled<S> {

    inner: S,

    reads: Option<Slot>,

    writes: Option<Slot>,

}

impl<S> Throttled<S> {

    pub fn new(inner: S) -> Self {
        Self {
            inner,
            reads: None,
            writes: None,
        }
    }

    pub fn limit_reads(mut self, throttle: &Throttle) -> Self {
        self.reads = Some(Slot::new(throttle));
        self
    }

    pub fn limit_writes(mut self, throttle: &Throttle) -> Self {
        self.writes = Some(Slot::new(throttle));
        self
    }

}

// One direction of a stream attached to a throttle.
#[derive(Debug)]
struct Slot {

    throttle: Throttle,

    state: SlotState,

}

#[derive(Debug)]
enum SlotState {

    // Nothing reserved.
    Idle,

    // Tokens reserved, waiting for the bucket's debt to be repaid. Sleeps at most
    // one tick at a time so rate changes are noticed.
    Waiting { reserved: usize, ticket: Ticket, sleep: Pin<Box<Sleep>> },

    // Tokens reserved and usable. Kept across polls while the inner stream is pending.
    Ready(usize),

}

impl Slot {

    fn new(throttle: &Throttle) -> Self {
        throttle.attach();
        Self {
            throttle: throttle.clone(),
            state: SlotState::Idle,
        }
    }

    // Resolves with the number of bytes that may be transferred now.
    fn poll_reserve(&mut self, cx: &mut Context<'_>, want: usize) -> Poll<usize> {
        loop {
            match &mut self.state {

                SlotState::Ready(reserved) => return Poll::Ready((*reserved).min(want)),

                SlotState::Waiting { reserved, ticket, sleep } => {
                    ready!(sleep.as_mut().poll(cx));
                    let wait = self.throttle.wait(*ticket);
                    if wait.is_zero() {
                        let reserved = *reserved;
                        self.state = SlotState::Ready(reserved);
                    } else {
                        sleep.as_mut().reset(Instant::now() + wait.min(TICK));
                    }
                },

                SlotState::Idle => {
                    let (reserved, ticket) = self.throttle.reserve(want);
                    let wait = self.throttle.wait(ticket);
                    self.state = if wait.is_zero() {
                        SlotState::Ready(reserved)
                    } else {
                        SlotState::Waiting { reserved, ticket, sleep: Box::pin(sleep(wait.min(TICK))) }
                    };
                },

            }
        }
    }

    fn complete(&mut self, used: usize) {
        match std::mem::replace(&mut self.state, SlotState::Idle) {
            SlotState::Ready(reserved) | SlotState::Waiting { reserved, .. } => {
                self.throttle.settle(reserved, used)
            },
            SlotState::Idle => {},
        }
    }

}

impl Drop for Slot {
    fn drop(&mut self) {
        // Hand back anything reserved but never used.
        self.complete(0);
        self.throttle.detach();
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Throttled<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let slot = match this.reads.as_mut() {
            Some(slot) if buf.remaining() > 0 => slot,
            _ => return Pin::new(&mut this.inner).poll_read(cx, buf),
        };

        let allowed = ready!(slot.poll_reserve(cx, buf.remaining()));
        let mut limited = ReadBuf::new(buf.initialize_unfilled_to(allowed));
        match Pin::new(&mut this.inner).poll_read(cx, &mut limited) {
            Poll::Ready(Ok(())) => {
                let n = limited.filled().len();
                buf.advance(n);
                slot.complete(n);
                Poll::Ready(Ok(()))
            },
            Poll::Ready(Err(e)) => {
                slot.complete(0);
                Poll::Ready(Err(e))
            },
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Throttled<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let slot = match this.writes.as_mut() {
            Some(slot) if !buf.is_empty() => slot,
            _ => return Pin::new(&mut this.inner).poll_write(cx, buf),
        };

        let allowed = ready!(slot.poll_reserve(cx, buf.len()));
        match Pin::new(&mut this.inner).poll_write(cx, &buf[..allowed]) {
            Poll::Ready(Ok(n)) => {
                slot.complete(n);
                Poll::Ready(Ok(n))
            },
            Poll::Ready(Err(e)) => {
                slot.complete(0);
                Poll::Ready(Err(e))
            },
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;

pub type ActivityNotifier = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct ActivityState {
    received: u64,
    sent: u64,
    armed: bool,
    notifier: Option<ActivityNotifier>,
}

/// Byte counters shared by all sockets of an engine context.
///
/// A single notifier fires once when the counters leave zero. It is
/// re-armed by [ActivityLogger::extract_amounts].
#[derive(Default)]
pub struct ActivityLogger {
    state: Mutex<ActivityState>,
}

impl ActivityLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_notifier(&self, notifier: Option<ActivityNotifier>) {
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        let mut state = self.state.lock().unwrap();
        state.armed = notifier.is_some() && state.received == 0 && state.sent == 0;
        state.notifier = notifier;
    }

    pub fn record_received(&self, amount: u64) {
        self.record(amount, 0)
    }

    pub fn record_sent(&self, amount: u64) {
        self.record(0, amount)
    }

    fn record(&self, received: u64, sent: u64) {
        if received == 0 && sent == 0 {
            return;
        }
        let fire = {
            #[allow(clippy::unwrap_used, reason = "panic on poison")]
            let mut state = self.state.lock().unwrap();
            state.received += received;
            state.sent += sent;
            if state.armed {
                state.armed = false;
                state.notifier.clone()
            } else {
                None
            }
        };
        if let Some(notifier) = fire {
            notifier();
        }
    }

    /// Returns `(received, sent)` since the last call and resets them.
    pub fn extract_amounts(&self) -> (u64, u64) {
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        let mut state = self.state.lock().unwrap();
        let amounts = (state.received, state.sent);
        state.received = 0;
        state.sent = 0;
        state.armed = state.notifier.is_some();
        amounts
    }
}

/// Time of the last byte moved on a control connection and everything it
/// opened.
#[derive(Clone, Debug)]
pub struct ActivityClock {
    last: Arc<Mutex<Instant>>,
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }
}

impl ActivityClock {
    pub fn touch(&self) {
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        let mut last = self.last.lock().unwrap();
        *last = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        let last = *self.last.lock().unwrap();
        last.elapsed()
    }
}

/// Pass-through layer feeding an [ActivityLogger] and an [ActivityClock].
pub struct ActivityStream<T> {
    inner: T,
    logger: Arc<ActivityLogger>,
    clock: ActivityClock,
}

impl<T> ActivityStream<T> {
    pub fn new(inner: T, logger: Arc<ActivityLogger>, clock: ActivityClock) -> Self {
        Self {
            inner,
            logger,
            clock,
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for ActivityStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let ret = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = ret {
            let n = buf.filled().len() - before;
            if n > 0 {
                this.clock.touch();
                this.logger.record_received(n as u64);
            }
        }
        ret
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for ActivityStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let ret = Pin::new(&mut this.inner).poll_write(cx, data);
        if let Poll::Ready(Ok(n)) = ret {
            if n > 0 {
                this.clock.touch();
                this.logger.record_sent(n as u64);
            }
        }
        ret
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn notifier_fires_once_per_transition() {
        let logger = ActivityLogger::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        logger.set_notifier(Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        logger.record_received(10);
        logger.record_sent(5);
        logger.record_received(1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        assert_eq!(logger.extract_amounts(), (11, 5));
        assert_eq!(logger.extract_amounts(), (0, 0));

        logger.record_sent(3);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(logger.extract_amounts(), (0, 3));
    }

    #[test]
    fn notifier_may_call_back_into_logger() {
        let logger = Arc::new(ActivityLogger::new());
        let inner = Arc::downgrade(&logger);
        logger.set_notifier(Some(Arc::new(move || {
            if let Some(logger) = inner.upgrade() {
                let _ = logger.extract_amounts();
            }
        })));
        logger.record_received(1);
    }

    #[tokio::test]
    async fn stream_counts_both_directions() {
        let logger = Arc::new(ActivityLogger::new());
        let clock = ActivityClock::default();
        let (a, mut b) = tokio::io::duplex(64);
        let mut stream = ActivityStream::new(a, logger.clone(), clock.clone());

        stream.write_all(b"abcd").await.unwrap();
        b.write_all(b"xy").await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();

        assert_eq!(logger.extract_amounts(), (2, 4));
        assert!(clock.idle_for() < Duration::from_secs(1));
    }
}

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

use super::{RateLimiterDirection, SharedFerryRateLimiter};

enum PendingWait {
    Empty,
    Waiting(Pin<Box<Sleep>>),
    /// Tokens for this many bytes have been taken from the bucket
    Ready(usize),
}

/// Defers reads and writes while the shared bucket is exhausted.
pub struct RateLimitedStream<T> {
    inner: T,
    limiter: SharedFerryRateLimiter,
    read_wait: PendingWait,
    write_wait: PendingWait,
}

impl<T> RateLimitedStream<T> {
    pub fn new(inner: T, limiter: SharedFerryRateLimiter) -> Self {
        Self {
            inner,
            limiter,
            read_wait: PendingWait::Empty,
            write_wait: PendingWait::Empty,
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

fn poll_grant(
    wait: &mut PendingWait,
    limiter: &SharedFerryRateLimiter,
    direction: RateLimiterDirection,
    wanted: usize,
    cx: &mut Context<'_>,
) -> Poll<io::Result<usize>> {
    loop {
        match wait {
            PendingWait::Ready(granted) => return Poll::Ready(Ok(*granted)),
            PendingWait::Waiting(sleep) => {
                ready!(sleep.as_mut().poll(cx));
                *wait = PendingWait::Empty;
            }
            PendingWait::Empty => {
                let (wanted, delay) = {
                    let limiter = limiter.lock();
                    let wanted = limiter
                        .max_chunk(direction)
                        .map_or(wanted, |max| wanted.min(max));
                    let delay = limiter
                        .bytes_ready_at(direction, wanted)
                        .map_err(io::Error::other)?;
                    (wanted, delay)
                };
                *wait = match delay {
                    None => PendingWait::Ready(wanted),
                    Some(delay) => PendingWait::Waiting(Box::pin(tokio::time::sleep(delay))),
                };
            }
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for RateLimitedStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<(), io::Error>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            // ready check
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }

        let granted = ready!(poll_grant(
            &mut this.read_wait,
            &this.limiter,
            RateLimiterDirection::Read,
            buf.remaining(),
            cx,
        ))?;

        let mut limited = ReadBuf::new(buf.initialize_unfilled_to(granted));
        let ret = Pin::new(&mut this.inner).poll_read(cx, &mut limited);
        if let Poll::Ready(Ok(())) = ret {
            let n = limited.filled().len();
            buf.advance(n);
        }
        if ret.is_ready() {
            this.read_wait = PendingWait::Empty;
        }
        ret
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for RateLimitedStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let this = self.get_mut();
        if data.is_empty() {
            // ready check
            return Pin::new(&mut this.inner).poll_write(cx, data);
        }

        let granted = ready!(poll_grant(
            &mut this.write_wait,
            &this.limiter,
            RateLimiterDirection::Write,
            data.len(),
            cx,
        ))?;

        let ret = Pin::new(&mut this.inner).poll_write(cx, &data[..granted.min(data.len())]);
        if ret.is_ready() {
            this.write_wait = PendingWait::Empty;
        }
        ret
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ferry_common::BurstTolerance;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::rate_limiting::FerryRateLimiter;

    #[tokio::test]
    async fn passes_data_through_unlimited() {
        let (a, mut b) = tokio::io::duplex(1024);
        let mut stream = RateLimitedStream::new(a, FerryRateLimiter::unlimited());
        stream.write_all(b"hello").await.unwrap();
        let mut out = [0u8; 5];
        b.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hello");
    }

    #[tokio::test]
    async fn writes_are_split_and_delayed() {
        let limiter = FerryRateLimiter::new(None, Some(1000), BurstTolerance::Normal).unwrap();
        let (a, mut b) = tokio::io::duplex(4096);
        let mut stream = RateLimitedStream::new(a, limiter);

        let started = std::time::Instant::now();
        let reader = tokio::spawn(async move {
            let mut out = vec![0u8; 1500];
            b.read_exact(&mut out).await.unwrap();
            out
        });
        stream.write_all(&[7u8; 1500]).await.unwrap();
        let out = reader.await.unwrap();
        assert_eq!(out, vec![7u8; 1500]);
        assert!(started.elapsed() >= Duration::from_millis(400));
    }
}

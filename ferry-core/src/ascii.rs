use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Newline conversion for ASCII mode transfers: `\r\n` on the wire, `\n`
/// locally. A lone `\r` is passed through unchanged.
pub struct AsciiStream<T> {
    inner: T,
    scratch: Vec<u8>,
    decoded: BytesMut,
    cr_pending: bool,
    eof: bool,
    encoded: BytesMut,
    last_was_cr: bool,
}

impl<T> AsciiStream<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            scratch: Vec::new(),
            decoded: BytesMut::new(),
            cr_pending: false,
            eof: false,
            encoded: BytesMut::new(),
            last_was_cr: false,
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }
}

/// Strips the `\r` of every `\r\n`. A trailing `\r` is held back in
/// `cr_pending` until the next chunk shows what follows it.
pub fn decode_crlf(input: &[u8], cr_pending: &mut bool, out: &mut BytesMut) {
    for &byte in input {
        if *cr_pending {
            *cr_pending = false;
            if byte != b'\n' {
                out.extend_from_slice(b"\r");
            }
        }
        if byte == b'\r' {
            *cr_pending = true;
        } else {
            out.extend_from_slice(&[byte]);
        }
    }
}

/// Expands every `\n` not already preceded by `\r` to `\r\n`.
pub fn encode_crlf(input: &[u8], last_was_cr: &mut bool, out: &mut BytesMut) {
    for &byte in input {
        if byte == b'\n' && !*last_was_cr {
            out.extend_from_slice(b"\r");
        }
        out.extend_from_slice(&[byte]);
        *last_was_cr = byte == b'\r';
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for AsciiStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while this.decoded.is_empty() && !this.eof {
            this.scratch.resize(buf.remaining().max(1), 0);
            let mut raw = ReadBuf::new(&mut this.scratch);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut raw))?;
            let n = raw.filled().len();
            if n == 0 {
                this.eof = true;
                if this.cr_pending {
                    this.cr_pending = false;
                    this.decoded.extend_from_slice(b"\r");
                }
            } else {
                decode_crlf(&this.scratch[..n], &mut this.cr_pending, &mut this.decoded);
            }
        }
        let n = this.decoded.len().min(buf.remaining());
        buf.put_slice(&this.decoded[..n]);
        this.decoded.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncWrite + Unpin> AsciiStream<T> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.encoded.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.encoded))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.encoded.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for AsciiStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        encode_crlf(data, &mut this.last_was_cr, &mut this.encoded);
        // the data is accepted, a pending drain resumes on the next call
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn decode_handles_split_pairs() {
        let mut out = BytesMut::new();
        let mut cr = false;
        decode_crlf(b"a\r", &mut cr, &mut out);
        assert!(cr);
        decode_crlf(b"\nb\rc", &mut cr, &mut out);
        assert_eq!(&out[..], b"a\nb\rc");
    }

    #[test]
    fn encode_keeps_existing_pairs() {
        let mut out = BytesMut::new();
        let mut last = false;
        encode_crlf(b"a\nb\r", &mut last, &mut out);
        encode_crlf(b"\nc\n", &mut last, &mut out);
        assert_eq!(&out[..], b"a\r\nb\r\nc\r\n");
    }

    #[tokio::test]
    async fn stream_converts_both_ways() {
        let (a, b) = tokio::io::duplex(16);
        let mut local = AsciiStream::new(a);
        let mut remote = b;

        let writer = tokio::spawn(async move {
            remote.write_all(b"one\r\ntwo\r").await.unwrap();
            remote.write_all(b"\nthree\r").await.unwrap();
            remote.shutdown().await.unwrap();
            let mut received = Vec::new();
            remote.read_to_end(&mut received).await.unwrap();
            received
        });

        let mut text = Vec::new();
        local.read_to_end(&mut text).await.unwrap();
        assert_eq!(text, b"one\ntwo\nthree\r");

        local.write_all(b"x\ny\n").await.unwrap();
        local.shutdown().await.unwrap();
        drop(local);
        assert_eq!(writer.await.unwrap(), b"x\r\ny\r\n");
    }
}

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::client::TlsStream;

use crate::{TlsClient, TlsError, TlsSessionInfo};

trait Io: AsyncRead + AsyncWrite + Unpin {}
impl<T: AsyncRead + AsyncWrite + Unpin> Io for T {}

/// A control connection that starts in plain text and may switch to TLS
/// in place, e.g. after `AUTH TLS`.
pub enum MaybeTlsStream<S> {
    Raw(S),
    Tls(Box<TlsStream<S>>),
    /// Only seen while a handshake is running; any I/O then fails.
    Upgrading,
}

impl<S> MaybeTlsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self::Raw(stream)
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// Parameters of the negotiated session, once encrypted.
    pub fn session_info(&self) -> Option<TlsSessionInfo> {
        match self {
            Self::Tls(tls) => Some(TlsSessionInfo::from_connection(tls.get_ref().1)),
            _ => None,
        }
    }

    /// Runs the client handshake for `host` over the plain stream.
    pub async fn start_tls(self, client: &TlsClient, host: &str) -> Result<Self, TlsError> {
        let Self::Raw(stream) = self else {
            return Err(TlsError::AlreadyEncrypted);
        };
        let (name, config) = client.upgrade_config(host)?;
        let tls = tokio_rustls::TlsConnector::from(config)
            .connect(name, stream)
            .await
            .map_err(TlsError::Handshake)?;
        Ok(Self::Tls(Box::new(tls)))
    }

    fn io(&mut self) -> std::io::Result<&mut dyn Io> {
        match self {
            Self::Raw(stream) => Ok(stream),
            Self::Tls(tls) => Ok(&mut **tls),
            Self::Upgrading => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "TLS handshake in progress",
            )),
        }
    }
}

impl<S> AsyncRead for MaybeTlsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut().io() {
            Ok(io) => Pin::new(io).poll_read(cx, buf),
            Err(error) => Poll::Ready(Err(error)),
        }
    }
}

impl<S> AsyncWrite for MaybeTlsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut().io() {
            Ok(io) => Pin::new(io).poll_write(cx, buf),
            Err(error) => Poll::Ready(Err(error)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut().io() {
            Ok(io) => Pin::new(io).poll_flush(cx),
            Err(error) => Poll::Ready(Err(error)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut().io() {
            Ok(io) => Pin::new(io).poll_shutdown(cx),
            Err(error) => Poll::Ready(Err(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::TrustedCertificates;

    #[tokio::test]
    async fn plain_stream_passes_bytes_through() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = MaybeTlsStream::new(client);
        assert!(!stream.is_tls());
        assert!(stream.session_info().is_none());

        stream.write_all(b"AUTH TLS\r\n").await.unwrap();
        let mut line = [0; 10];
        server.read_exact(&mut line).await.unwrap();
        assert_eq!(&line, b"AUTH TLS\r\n");
    }

    #[tokio::test]
    async fn io_fails_while_upgrading() {
        let mut stream = MaybeTlsStream::<tokio::io::DuplexStream>::Upgrading;
        let error = stream.write_all(b"x").await.unwrap_err();
        assert_eq!(error.kind(), std::io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn bad_server_names_fail_before_the_handshake() {
        let (client, _server) = tokio::io::duplex(64);
        let tls = TlsClient::new(&[], TrustedCertificates::default()).unwrap();
        let result = MaybeTlsStream::new(client).start_tls(&tls, "not a host").await;
        assert!(matches!(result, Err(TlsError::ServerName(_))));
    }
}

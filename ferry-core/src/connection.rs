use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ferry_tls::{MaybeTlsStream, TlsClient, TlsSessionInfo, VerificationRecord};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::activity::{ActivityClock, ActivityLogger, ActivityStream};
use crate::control_socket::ControlEvent;
use crate::proxy::ProxySettings;
use crate::rate_limiting::{RateLimitedStream, SharedFerryRateLimiter};

pub type NetStream = RateLimitedStream<ActivityStream<TcpStream>>;
pub type SecureStream = MaybeTlsStream<NetStream>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Instrumentation every socket of an engine context is wrapped in.
#[derive(Clone)]
pub struct StreamLayers {
    pub activity: Arc<ActivityLogger>,
    pub clock: ActivityClock,
    pub limiter: SharedFerryRateLimiter,
}

impl StreamLayers {
    pub fn wrap(&self, stream: TcpStream) -> NetStream {
        RateLimitedStream::new(
            ActivityStream::new(stream, self.activity.clone(), self.clock.clone()),
            self.limiter.clone(),
        )
    }
}

#[derive(Debug)]
pub struct TlsEstablished {
    pub info: TlsSessionInfo,
    pub verification: Option<VerificationRecord>,
}

#[derive(Debug)]
pub enum SocketEvent {
    Connected { local: SocketAddr, peer: SocketAddr },
    Data(Bytes),
    TlsEstablished(Box<TlsEstablished>),
    TlsFailed(String),
    /// `None` for an orderly close by the peer
    Closed(Option<String>),
}

#[derive(Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub proxy: Option<ProxySettings>,
    pub keepalive: Option<Duration>,
    pub timeout: Option<Duration>,
    /// Handshake right after connecting (implicit FTPS, HTTPS)
    pub tls: Option<TlsClient>,
}

impl ConnectParams {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            proxy: None,
            keepalive: None,
            timeout: None,
            tls: None,
        }
    }
}

pub fn set_keepalive(stream: &TcpStream, interval: Option<Duration>) {
    let Some(interval) = interval else {
        return;
    };
    let keepalive = TcpKeepalive::new()
        .with_time(interval)
        .with_interval(interval);
    if let Err(error) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        warn!(%error, "Could not enable TCP keepalive");
    }
}

/// Opens a TCP connection, through the proxy if one is configured, and
/// wraps it in the instrumentation layers.
pub async fn open_stream(
    params: &ConnectParams,
    layers: &StreamLayers,
) -> std::io::Result<(NetStream, SocketAddr, SocketAddr)> {
    let (host, port) = match &params.proxy {
        Some(proxy) => (proxy.host.as_str(), proxy.port),
        None => (params.host.as_str(), params.port),
    };
    let connect = TcpStream::connect((host.trim_matches(|c| c == '[' || c == ']'), port));
    let tcp = match params.timeout {
        Some(timeout) => tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??,
        None => connect.await?,
    };
    tcp.set_nodelay(true)?;
    set_keepalive(&tcp, params.keepalive);
    let local = tcp.local_addr()?;
    let peer = tcp.peer_addr()?;

    let mut stream = layers.wrap(tcp);
    if let Some(proxy) = &params.proxy {
        proxy
            .handshake(&mut stream, &params.host, params.port)
            .await
            .map_err(std::io::Error::other)?;
    }
    Ok((stream, local, peer))
}

async fn start_tls(
    stream: SecureStream,
    client: &TlsClient,
    host: &str,
) -> Result<(SecureStream, TlsEstablished), String> {
    let stream = stream
        .start_tls(client, host)
        .await
        .map_err(|e| e.to_string())?;
    let info = stream
        .session_info()
        .ok_or_else(|| "TLS upgrade did not happen".to_owned())?;
    Ok((
        stream,
        TlsEstablished {
            info,
            verification: client.take_verification(),
        },
    ))
}

enum ConnectionCommand {
    Write(Bytes),
    StartTls { client: TlsClient, host: String },
    Shutdown,
}

/// Handle to a control connection task. Every byte read and every state
/// change arrives at the owning socket as [ControlEvent::Socket].
pub struct ControlConnection {
    id: u64,
    tx: mpsc::UnboundedSender<ConnectionCommand>,
    _alive: oneshot::Sender<()>,
}

impl ControlConnection {
    pub fn connect(
        params: ConnectParams,
        layers: StreamLayers,
        events: mpsc::UnboundedSender<ControlEvent>,
    ) -> Self {
        let id = next_connection_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let (alive, alive_rx) = oneshot::channel();
        tokio::spawn(run(id, params, layers, events, rx, alive_rx));
        Self {
            id,
            tx,
            _alive: alive,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn send(&self, data: impl Into<Bytes>) -> bool {
        self.tx.send(ConnectionCommand::Write(data.into())).is_ok()
    }

    pub fn start_tls(&self, client: TlsClient, host: &str) -> bool {
        self.tx
            .send(ConnectionCommand::StartTls {
                client,
                host: host.to_owned(),
            })
            .is_ok()
    }

    /// Closes the write side after all queued data went out.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ConnectionCommand::Shutdown);
    }
}

async fn run(
    id: u64,
    params: ConnectParams,
    layers: StreamLayers,
    events: mpsc::UnboundedSender<ControlEvent>,
    mut rx: mpsc::UnboundedReceiver<ConnectionCommand>,
    alive: oneshot::Receiver<()>,
) {
    let emit = |event: SocketEvent| {
        let _ = events.send(ControlEvent::Socket { conn: id, event });
    };

    let connected = tokio::select! {
        result = open_stream(&params, &layers) => result,
        _ = alive => {
            debug!(conn = id, "Connection abandoned while connecting");
            return;
        }
    };
    let (stream, local, peer) = match connected {
        Ok(x) => x,
        Err(error) => {
            emit(SocketEvent::Closed(Some(error.to_string())));
            return;
        }
    };
    emit(SocketEvent::Connected { local, peer });

    let mut stream = SecureStream::new(stream);
    if let Some(client) = &params.tls {
        match start_tls(stream, client, &params.host).await {
            Ok((s, established)) => {
                stream = s;
                emit(SocketEvent::TlsEstablished(Box::new(established)));
            }
            Err(error) => {
                emit(SocketEvent::TlsFailed(error));
                return;
            }
        }
    }

    let mut buf = vec![0u8; 16 * 1024];
    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(ConnectionCommand::Write(data)) => {
                    let result = async {
                        stream.write_all(&data).await?;
                        stream.flush().await
                    }.await;
                    if let Err(error) = result {
                        emit(SocketEvent::Closed(Some(error.to_string())));
                        return;
                    }
                }
                Some(ConnectionCommand::StartTls { client, host }) => {
                    match start_tls(stream, &client, &host).await {
                        Ok((s, established)) => {
                            stream = s;
                            emit(SocketEvent::TlsEstablished(Box::new(established)));
                        }
                        Err(error) => {
                            emit(SocketEvent::TlsFailed(error));
                            return;
                        }
                    }
                }
                Some(ConnectionCommand::Shutdown) | None => {
                    let _ = stream.shutdown().await;
                    debug!(conn = id, "Connection closed locally");
                    return;
                }
            },
            result = stream.read(&mut buf) => match result {
                Ok(0) => {
                    emit(SocketEvent::Closed(None));
                    return;
                }
                Ok(n) => emit(SocketEvent::Data(Bytes::copy_from_slice(&buf[..n]))),
                Err(error) => {
                    emit(SocketEvent::Closed(Some(error.to_string())));
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::rate_limiting::FerryRateLimiter;

    fn layers() -> StreamLayers {
        StreamLayers {
            activity: Arc::new(ActivityLogger::new()),
            clock: ActivityClock::default(),
            limiter: FerryRateLimiter::unlimited(),
        }
    }

    #[tokio::test]
    async fn exchanges_data_and_reports_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"220 hello\r\n").await.unwrap();
            let mut buf = [0u8; 6];
            socket.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"QUIT\r\n");
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let layers = layers();
        let conn = ControlConnection::connect(
            ConnectParams::new("127.0.0.1", port),
            layers.clone(),
            tx,
        );

        let mut data = Vec::new();
        let mut closed = false;
        while let Some(ControlEvent::Socket { conn: id, event }) = rx.recv().await {
            assert_eq!(id, conn.id());
            match event {
                SocketEvent::Connected { peer, .. } => assert_eq!(peer.port(), port),
                SocketEvent::Data(bytes) => {
                    data.extend_from_slice(&bytes);
                    if data.ends_with(b"\r\n") {
                        conn.send(&b"QUIT\r\n"[..]);
                    }
                }
                SocketEvent::Closed(None) => {
                    closed = true;
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        server.await.unwrap();
        assert!(closed);
        assert_eq!(data, b"220 hello\r\n");
        assert_eq!(layers.activity.extract_amounts(), (11, 6));
    }

    #[tokio::test]
    async fn refused_connection_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _conn = ControlConnection::connect(ConnectParams::new("127.0.0.1", port), layers(), tx);
        assert!(matches!(
            rx.recv().await,
            Some(ControlEvent::Socket {
                event: SocketEvent::Closed(Some(_)),
                ..
            })
        ));
    }
}

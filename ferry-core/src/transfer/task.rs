use std::io;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use ferry_common::TransferStatusManager;
use ferry_tls::{TlsError, TlsSessionInfo};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{
    resumption_verdict, DataEndpoint, ResumptionVerdict, TransferEndReason, TransferEvent,
    TransferKind, TransferParams, MAX_ITERATIONS_PER_YIELD,
};
use crate::aio::AsyncWaiter;
use crate::ascii::AsciiStream;
use crate::connection::set_keepalive;
use crate::control_socket::ControlEvent;

/// A resume test only needs to know whether more than one byte arrives.
const RESUME_TEST_LIMIT: usize = 4096;

trait DataStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DataStream for T {}

/// Delivers the one and only `Ended` event of a transfer, even if the task
/// is aborted before or while running.
pub(super) struct EndGuard {
    id: u64,
    events: mpsc::UnboundedSender<ControlEvent>,
    transferred: u64,
    sent: bool,
}

impl EndGuard {
    pub(super) fn new(id: u64, events: mpsc::UnboundedSender<ControlEvent>) -> Self {
        Self {
            id,
            events,
            transferred: 0,
            sent: false,
        }
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(ControlEvent::Transfer {
            id: self.id,
            event,
        });
    }

    fn end(&mut self, reason: TransferEndReason, data: Option<Bytes>) {
        if self.sent {
            return;
        }
        self.sent = true;
        debug!(transfer = self.id, ?reason, transferred = self.transferred, "Transfer ended");
        self.emit(TransferEvent::Ended {
            reason,
            transferred: self.transferred,
            data,
        });
    }
}

impl Drop for EndGuard {
    fn drop(&mut self) {
        self.end(TransferEndReason::TransferFailure, None);
    }
}

fn network_failure(error: io::Error) -> TransferEndReason {
    if error.kind() == io::ErrorKind::TimedOut {
        TransferEndReason::Timeout
    } else {
        TransferEndReason::TransferFailure
    }
}

pub(super) async fn run(
    mut guard: EndGuard,
    params: TransferParams,
    confirm: oneshot::Receiver<bool>,
) {
    match transfer(params, &mut guard, confirm).await {
        Ok(data) => guard.end(TransferEndReason::Successful, data),
        Err(reason) => guard.end(reason, None),
    }
}

async fn with_timeout<T>(
    timeout: Option<std::time::Duration>,
    fut: impl std::future::Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))?,
        None => fut.await,
    }
}

async fn open(params: &mut TransferParams) -> io::Result<TcpStream> {
    let endpoint = std::mem::replace(
        &mut params.endpoint,
        DataEndpoint::Passive {
            host: String::new(),
            port: 0,
        },
    );
    let stream = match endpoint {
        DataEndpoint::Passive { host, port } => {
            let (host, port) = match &params.proxy {
                Some(proxy) => (proxy.host.clone(), proxy.port),
                None => (host, port),
            };
            let target = tokio::net::lookup_host((host.as_str(), port))
                .await?
                .next()
                .ok_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable))?;
            let socket = if target.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            if let Some(source) = params
                .source_address
                .filter(|s| s.is_ipv4() == target.is_ipv4())
            {
                socket.bind(SocketAddr::new(source, 0))?;
            }
            with_timeout(params.timeout, socket.connect(target)).await?
        }
        DataEndpoint::Active(listener) => {
            listener.set_nonblocking(true)?;
            let listener = tokio::net::TcpListener::from_std(listener)?;
            let (stream, peer) = with_timeout(params.timeout, listener.accept()).await?;
            debug!(%peer, "Accepted data connection");
            stream
        }
    };
    set_keepalive(&stream, params.keepalive);
    Ok(stream)
}

async fn transfer(
    mut params: TransferParams,
    guard: &mut EndGuard,
    confirm: oneshot::Receiver<bool>,
) -> Result<Option<Bytes>, TransferEndReason> {
    let proxy_target = match &params.endpoint {
        DataEndpoint::Passive { host, port } => Some((host.clone(), *port)),
        DataEndpoint::Active(_) => None,
    };
    let tcp = open(&mut params).await.map_err(|error| {
        warn!(%error, "Could not establish data connection");
        network_failure(error)
    })?;
    let mut net = params.layers.wrap(tcp);
    if let (Some(proxy), Some((host, port))) = (&params.proxy, proxy_target) {
        proxy.handshake(&mut net, &host, port).await.map_err(|error| {
            warn!(%error, "Proxy refused data connection");
            TransferEndReason::TransferFailure
        })?;
    }

    let mut tls_resumed = None;
    let mut stream: Box<dyn DataStream> = match &params.tls {
        None => Box::new(net),
        Some(tls) => {
            let (name, config) = tls.client.upgrade_config(&tls.host).map_err(|error| {
                warn!(%error, "Invalid TLS server name");
                TransferEndReason::TransferFailure
            })?;
            let connector = tokio_rustls::TlsConnector::from(config);
            let stream = with_timeout(params.timeout, connector.connect(name, net))
                .await
                .map_err(|error| {
                    warn!(%error, "TLS handshake on data connection failed");
                    network_failure(error)
                })?;
            // the control connection already reported the certificate
            let _ = tls.client.take_verification();
            let resumed = TlsSessionInfo::from_connection(stream.get_ref().1).resumed;
            tls_resumed = Some(resumed);
            match resumption_verdict(tls.alpn_required, tls.known, resumed) {
                ResumptionVerdict::Proceed => {}
                ResumptionVerdict::ProceedAndRemember => guard.emit(TransferEvent::ResumptionSeen),
                ResumptionVerdict::Fail => {
                    warn!(error = %TlsError::ResumptionRequired, "Refusing data connection");
                    return Err(TransferEndReason::FailedTlsResumption);
                }
                ResumptionVerdict::AskUser => {
                    guard.emit(TransferEvent::ResumptionUnknown);
                    if !matches!(confirm.await, Ok(true)) {
                        return Err(TransferEndReason::FailedTlsResumption);
                    }
                }
            }
            Box::new(stream)
        }
    };
    if params.ascii {
        stream = Box::new(AsciiStream::new(stream));
    }
    guard.emit(TransferEvent::Started { tls_resumed });

    match params.kind {
        TransferKind::List | TransferKind::ResumeTest => {
            let limit = (params.kind == TransferKind::ResumeTest).then_some(RESUME_TEST_LIMIT);
            collect(&mut stream, params.status.as_ref(), guard, limit)
                .await
                .map(Some)
        }
        TransferKind::Download => download(&mut stream, &mut params, guard)
            .await
            .map(|()| None),
        TransferKind::Upload => upload(&mut stream, &mut params, guard).await.map(|()| None),
    }
}

async fn read_data(stream: &mut Box<dyn DataStream>, buf: &mut [u8]) -> io::Result<usize> {
    match stream.read(buf).await {
        Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => {
            warn!("Data connection closed without TLS close_notify");
            Ok(0)
        }
        other => other,
    }
}

fn progress(status: Option<&TransferStatusManager>, guard: &mut EndGuard, amount: usize) {
    guard.transferred += amount as u64;
    if let Some(status) = status {
        status.set_made_progress();
        status.update(amount as i64);
    }
}

async fn collect(
    stream: &mut Box<dyn DataStream>,
    status: Option<&TransferStatusManager>,
    guard: &mut EndGuard,
    limit: Option<usize>,
) -> Result<Bytes, TransferEndReason> {
    let mut data = BytesMut::new();
    let mut buf = vec![0u8; 16 * 1024];
    let mut iterations = 0;
    loop {
        let n = read_data(stream, &mut buf)
            .await
            .map_err(network_failure)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        progress(status, guard, n);
        if limit.is_some_and(|limit| data.len() > limit) {
            break;
        }
        iterations += 1;
        if iterations >= MAX_ITERATIONS_PER_YIELD {
            iterations = 0;
            tokio::task::yield_now().await;
        }
    }
    Ok(data.freeze())
}

async fn download(
    stream: &mut Box<dyn DataStream>,
    params: &mut TransferParams,
    guard: &mut EndGuard,
) -> Result<(), TransferEndReason> {
    let Some(mut writer) = params.writer.take() else {
        return Err(TransferEndReason::TransferFailureCritical);
    };
    let status = params.status.clone();
    let waiter = AsyncWaiter::default();
    let local_failure = |error: ferry_common::FerryError| {
        warn!(%error, "Local write failed");
        TransferEndReason::TransferFailureCritical
    };
    let mut iterations = 0;
    loop {
        let mut buffer = waiter
            .get_buffer(writer.as_mut())
            .await
            .map_err(local_failure)?;
        let capacity = buffer.capacity();
        buffer.resize(capacity, 0);
        let n = read_data(stream, &mut buffer[..])
            .await
            .map_err(network_failure)?;
        if n == 0 {
            break;
        }
        buffer.truncate(n);
        progress(status.as_ref(), guard, n);
        waiter
            .add_buffer(writer.as_mut(), buffer)
            .await
            .map_err(local_failure)?;

        iterations += 1;
        if iterations >= MAX_ITERATIONS_PER_YIELD {
            iterations = 0;
            tokio::task::yield_now().await;
        }
    }
    waiter
        .finalize(writer.as_mut())
        .await
        .map_err(local_failure)
}

async fn upload(
    stream: &mut Box<dyn DataStream>,
    params: &mut TransferParams,
    guard: &mut EndGuard,
) -> Result<(), TransferEndReason> {
    let Some(mut reader) = params.reader.take() else {
        return Err(TransferEndReason::TransferFailureCritical);
    };
    let status = params.status.clone();
    let waiter = AsyncWaiter::default();
    let mut iterations = 0;
    loop {
        let buffer = waiter.read(reader.as_mut()).await.map_err(|error| {
            warn!(%error, "Local read failed");
            TransferEndReason::TransferFailureCritical
        })?;
        let Some(buffer) = buffer else {
            break;
        };
        stream.write_all(&buffer).await.map_err(network_failure)?;
        progress(status.as_ref(), guard, buffer.len());
        drop(buffer);

        iterations += 1;
        if iterations >= MAX_ITERATIONS_PER_YIELD {
            iterations = 0;
            tokio::task::yield_now().await;
        }
    }
    // orderly half-close so the server sees the end of the file
    stream.shutdown().await.map_err(network_failure)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ferry_common::MemoryFile;
    use tokio::net::TcpListener;

    use super::*;
    use crate::activity::{ActivityClock, ActivityLogger};
    use crate::aio::{MemoryReader, MemoryWriter};
    use crate::buffer_pool::BufferPool;
    use crate::connection::StreamLayers;
    use crate::rate_limiting::FerryRateLimiter;
    use crate::transfer::TransferSocket;

    fn params(kind: TransferKind, endpoint: DataEndpoint) -> TransferParams {
        TransferParams {
            kind,
            endpoint,
            source_address: None,
            proxy: None,
            tls: None,
            ascii: false,
            reader: None,
            writer: None,
            layers: StreamLayers {
                activity: Arc::new(ActivityLogger::new()),
                clock: ActivityClock::default(),
                limiter: FerryRateLimiter::unlimited(),
            },
            status: None,
            timeout: Some(std::time::Duration::from_secs(5)),
            keepalive: None,
        }
    }

    async fn ended(rx: &mut mpsc::UnboundedReceiver<ControlEvent>) -> (TransferEndReason, u64, Option<Bytes>) {
        while let Some(event) = rx.recv().await {
            if let ControlEvent::Transfer {
                event: TransferEvent::Ended {
                    reason,
                    transferred,
                    data,
                },
                ..
            } = event
            {
                return (reason, transferred, data);
            }
        }
        panic!("no end event");
    }

    #[tokio::test]
    async fn passive_download_into_memory() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&[1u8; 10_000]).await.unwrap();
        });

        let pool = BufferPool::new(2, 1024);
        let target = MemoryFile::new();
        let mut p = params(
            TransferKind::Download,
            DataEndpoint::Passive {
                host: "127.0.0.1".into(),
                port,
            },
        );
        p.writer = Some(Box::new(MemoryWriter::new(target.clone(), 0, pool.clone())));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _socket = TransferSocket::spawn(p, tx);
        let (reason, transferred, _) = ended(&mut rx).await;
        assert_eq!(reason, TransferEndReason::Successful);
        assert_eq!(transferred, 10_000);
        assert_eq!(target.len(), 10_000);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn active_upload_in_ascii_mode() {
        let listener = crate::transfer::bind_active([127, 0, 0, 1].into(), None).unwrap();
        let port = listener.local_addr().unwrap().port();
        let pool = BufferPool::new(2, 4);
        let mut p = params(TransferKind::Upload, DataEndpoint::Active(listener),
        );
        p.ascii = true;
        p.reader = Some(Box::new(MemoryReader::new(
            MemoryFile::from_bytes(b"a\nb\n"),
            0,
            pool.clone(),
        )));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _socket = TransferSocket::spawn(p, tx);
        let mut server = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"a\r\nb\r\n");
        assert_eq!(ended(&mut rx).await.0, TransferEndReason::Successful);
    }

    #[tokio::test]
    async fn dropped_socket_still_ends_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let pool = BufferPool::new(1, 16);
        let p = params(
            TransferKind::List,
            DataEndpoint::Passive {
                host: "127.0.0.1".into(),
                port,
            },
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let socket = TransferSocket::spawn(p, tx);
        let (_held, _) = listener.accept().await.unwrap();
        drop(socket);

        assert_eq!(ended(&mut rx).await.0, TransferEndReason::TransferFailure);
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn resume_test_collects_data() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"xy").await.unwrap();
        });
        let pool = BufferPool::new(1, 16);
        let p = params(
            TransferKind::ResumeTest,
            DataEndpoint::Passive {
                host: "127.0.0.1".into(),
                port,
            },
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _socket = TransferSocket::spawn(p, tx);
        let (reason, transferred, data) = ended(&mut rx).await;
        assert_eq!(reason, TransferEndReason::Successful);
        assert_eq!(transferred, 2);
        assert_eq!(data.as_deref(), Some(&b"xy"[..]));
    }
}

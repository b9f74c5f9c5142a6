use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use ferry_common::{Command, OptionId, Protocol, Reply};
use ferry_core::buffer_pool::BufferWaiter;
use ferry_core::connection::{ConnectParams, ControlConnection, SocketEvent, TlsEstablished};
use ferry_core::control_socket::{ControlEvent, ProtocolSession, SessionAction};
use ferry_core::operation::{OpContext, Operation};
use ferry_core::proxy::ProxySettings;
use ferry_tls::{TlsClient, TlsError};
use tracing::debug;

use crate::ops;
use crate::request::Target;

pub type HttpContext = OpContext<HttpSession>;
pub type HttpOp = Box<dyn Operation<HttpSession>>;

const ALPN_HTTP11: &[u8] = b"http/1.1";

/// What the current operation is suspended on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waiting {
    Nothing,
    Connect,
    Response,
    /// A buffer for the local writer
    WriteBuffer,
    /// Data from the local reader
    ReadBuffer,
}

struct Connection {
    conn: ControlConnection,
    target: Target,
    ready: bool,
    reusable: bool,
}

/// HTTP has no session beyond the connection of the last request, which
/// is kept while both sides agree to reuse it.
pub struct HttpSession {
    pub protocol: Protocol,
    /// Set by the connect operation; HTTP connects lazily per request
    pub connected: bool,
    conn: Option<Connection>,
    incoming: BytesMut,
    /// The peer closed the connection in an orderly way
    pub eof: bool,
    waiting: Waiting,
    pub tls_established: Option<Box<TlsEstablished>>,
    waiter: Option<BufferWaiter>,
}

impl HttpSession {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            connected: false,
            conn: None,
            incoming: BytesMut::new(),
            eof: false,
            waiting: Waiting::Nothing,
            tls_established: None,
            waiter: None,
        }
    }

    pub fn expect(&mut self, waiting: Waiting) {
        self.waiting = waiting;
    }

    /// Wakes the socket with [ControlEvent::BufferAvailable].
    pub fn waiter(&mut self, cx: &HttpContext) -> BufferWaiter {
        self.waiter
            .get_or_insert_with(|| {
                let events = cx.events.clone();
                Arc::new(move || {
                    let _ = events.send(ControlEvent::BufferAvailable);
                })
            })
            .clone()
    }

    /// An idle connection to `target` that may carry another request.
    pub fn can_reuse(&self, target: &Target) -> bool {
        self.conn
            .as_ref()
            .is_some_and(|c| c.ready && c.reusable && &c.target == target)
            && self.incoming.is_empty()
            && !self.eof
    }

    pub fn is_ready(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| c.ready)
    }

    pub fn open(&mut self, target: Target, cx: &HttpContext) -> Result<(), TlsError> {
        self.drop_connection();
        let options = cx.options();
        let mut params = ConnectParams::new(target.host.clone(), target.port);
        let timeout = options.get_int(OptionId::Timeout);
        params.timeout = (timeout > 0).then(|| Duration::from_secs(timeout as u64));
        let keepalive = options.get_int(OptionId::TcpKeepaliveInterval);
        params.keepalive = (keepalive > 0).then(|| Duration::from_secs(keepalive as u64 * 60));
        let bypass = cx.server.as_ref().is_some_and(|s| s.bypass_proxy);
        if !bypass {
            params.proxy = ProxySettings::from_options(options);
        }
        if target.tls {
            params.tls = Some(TlsClient::new(
                &[ALPN_HTTP11],
                cx.engine.trusted_certificates.clone(),
            )?);
        }
        cx.log.status(format!("Connecting to {}:{}...", target.host, target.port));
        let conn = ControlConnection::connect(params, cx.layers.clone(), cx.events.clone());
        self.conn = Some(Connection {
            conn,
            target,
            ready: false,
            reusable: true,
        });
        Ok(())
    }

    pub fn send(&self, cx: &HttpContext, data: impl Into<Bytes>) -> bool {
        let Some(conn) = &self.conn else {
            return false;
        };
        cx.layers.clock.touch();
        conn.conn.send(data)
    }

    pub fn take_incoming(&mut self) -> BytesMut {
        self.incoming.split()
    }

    /// The exchange on the current connection is over. The connection is
    /// kept only if both sides agreed to reuse it.
    pub fn finish_exchange(&mut self, reusable: bool) {
        self.waiting = Waiting::Nothing;
        match &mut self.conn {
            Some(conn) if reusable && !self.eof => conn.reusable = true,
            _ => self.drop_connection(),
        }
    }

    pub fn drop_connection(&mut self) {
        if let Some(conn) = self.conn.take() {
            debug!(host = %conn.target.host, "Closing HTTP connection");
            conn.conn.shutdown();
        }
        self.incoming.clear();
        self.eof = false;
        self.tls_established = None;
        self.waiting = Waiting::Nothing;
    }

    fn on_socket_event(&mut self, event: SocketEvent, cx: &mut HttpContext) -> Option<SessionAction> {
        let conn = self.conn.as_mut()?;
        match event {
            SocketEvent::Connected { peer, .. } => {
                cx.log.status(format!("Connection established with {peer}"));
                if conn.target.tls {
                    return None;
                }
                conn.ready = true;
                (self.waiting == Waiting::Connect).then_some(SessionAction::Resume)
            }
            SocketEvent::TlsEstablished(established) => {
                conn.ready = true;
                self.tls_established = Some(established);
                (self.waiting == Waiting::Connect).then_some(SessionAction::Resume)
            }
            SocketEvent::TlsFailed(error) => {
                cx.log.error(format!("TLS handshake failed: {error}"));
                self.drop_connection();
                Some(SessionAction::Disconnected(Reply::CRITICAL_ERROR))
            }
            SocketEvent::Data(data) => {
                self.incoming.extend_from_slice(&data);
                (self.waiting == Waiting::Response).then_some(SessionAction::ParseResponse)
            }
            SocketEvent::Closed(error) => {
                conn.reusable = false;
                match (error, self.waiting) {
                    (None, Waiting::Response) => {
                        self.eof = true;
                        Some(SessionAction::ParseResponse)
                    }
                    (None, Waiting::WriteBuffer) => {
                        self.eof = true;
                        None
                    }
                    (None, Waiting::Nothing) => {
                        debug!("Idle HTTP connection closed by server");
                        self.drop_connection();
                        None
                    }
                    (error, _) => {
                        match error {
                            Some(error) => cx.log.error(format!("Connection failed: {error}")),
                            None => cx.log.error("Connection closed by server"),
                        }
                        self.drop_connection();
                        Some(SessionAction::Disconnected(Reply::ERROR))
                    }
                }
            }
        }
    }
}

impl ProtocolSession for HttpSession {
    fn create_operation(&mut self, command: Command, _cx: &mut HttpContext) -> Result<HttpOp, Reply> {
        ops::create(command)
    }

    fn handle_event(&mut self, event: ControlEvent, cx: &mut HttpContext) -> Option<SessionAction> {
        match event {
            ControlEvent::Socket { conn, event } => {
                if self.conn.as_ref().map(|c| c.conn.id()) != Some(conn) {
                    return None;
                }
                self.on_socket_event(event, cx)
            }
            ControlEvent::BufferAvailable => match self.waiting {
                Waiting::WriteBuffer => Some(SessionAction::ParseResponse),
                Waiting::ReadBuffer => Some(SessionAction::Resume),
                _ => None,
            },
            _ => None,
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn close(&mut self, _cx: &mut HttpContext) {
        self.drop_connection();
        self.connected = false;
    }
}

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use ferry_common::{Command, MessageType, Protocol, Reply, ServerPath};
use ferry_core::capabilities::{Capability, CapabilityState};
use ferry_core::connection::{ControlConnection, SocketEvent, TlsEstablished};
use ferry_core::control_socket::{ControlEvent, ProtocolSession, SessionAction};
use ferry_core::operation::{OpContext, Operation};
use ferry_core::transfer::{TransferEvent, TransferSocket};
use ferry_tls::TlsClient;
use rand::Rng;
use tracing::debug;

use crate::ops;
use crate::reply::{FtpReply, ReplyReader};

pub type FtpContext = OpContext<FtpSession>;
pub type FtpOp = Box<dyn Operation<FtpSession>>;

/// Idle time after which a keepalive command goes out, when enabled.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// State of one FTP control connection shared by all its operations.
pub struct FtpSession {
    /// What the caller asked for. Becomes [Protocol::InsecureFtp] after a
    /// confirmed fallback to plain FTP.
    pub protocol: Protocol,
    conn: Option<ControlConnection>,
    reader: ReplyReader,
    replies: VecDeque<FtpReply>,
    reply: Option<FtpReply>,
    /// Commands sent whose final reply is outstanding
    outstanding: usize,
    /// Final replies to drop because their operation is gone
    skip: usize,
    keepalive_pending: usize,
    /// Deliver `1xx` replies to the current operation
    pub expect_preliminary: bool,
    pub connected: bool,
    pub addresses: Option<(SocketAddr, SocketAddr)>,
    /// Handshake outcome not yet picked up by the logon
    pub tls_established: Option<Box<TlsEstablished>>,
    pub tls: Option<TlsClient>,
    /// Data connections use `PROT P`
    pub protected: bool,
    /// The server announced the resumption ALPN
    pub tls_resumption_required: bool,
    pub current_path: ServerPath,
    pub transfer_type: Option<char>,
    pub transfer: Option<TransferSocket>,
}

impl FtpSession {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            conn: None,
            reader: ReplyReader::new(),
            replies: VecDeque::new(),
            reply: None,
            outstanding: 0,
            skip: 0,
            keepalive_pending: 0,
            expect_preliminary: false,
            connected: false,
            addresses: None,
            tls_established: None,
            tls: None,
            protected: false,
            tls_resumption_required: false,
            current_path: ServerPath::default(),
            transfer_type: None,
            transfer: None,
        }
    }

    pub fn set_connection(&mut self, conn: ControlConnection) {
        self.reader.clear();
        self.replies.clear();
        self.outstanding = 1; // the welcome message
        self.skip = 0;
        self.keepalive_pending = 0;
        self.conn = Some(conn);
    }

    pub fn connection(&self) -> Option<&ControlConnection> {
        self.conn.as_ref()
    }

    /// Writes a command line. `false` if the connection is gone.
    pub fn send_command(&mut self, cx: &FtpContext, level: MessageType, command: &str) -> bool {
        let Some(conn) = &self.conn else {
            return false;
        };
        cx.log.log(level, loggable_command(command));
        cx.layers.clock.touch();
        if !conn.send(format!("{command}\r\n")) {
            return false;
        }
        self.outstanding += 1;
        true
    }

    /// The reply the current call of `parse_response` is about.
    pub fn take_reply(&mut self) -> FtpReply {
        self.reply.take().unwrap_or_default()
    }

    /// Abandons the replies of commands that are still in flight. Called
    /// when an operation ends before it saw them.
    pub fn abandon_replies(&mut self) {
        self.skip = self.outstanding;
        self.keepalive_pending = 0;
        self.expect_preliminary = false;
    }

    pub fn capability(&self, cx: &FtpContext, capability: Capability) -> CapabilityState {
        cx.server_key()
            .map(|key| cx.engine.capabilities.get(&key, capability))
            .unwrap_or_default()
    }

    pub fn set_capability(&self, cx: &FtpContext, capability: Capability, state: CapabilityState) {
        if let Some(key) = cx.server_key() {
            cx.engine.capabilities.set(&key, capability, state);
        }
    }

    fn on_socket_event(
        &mut self,
        event: SocketEvent,
        cx: &mut FtpContext,
    ) -> Option<SessionAction> {
        match event {
            SocketEvent::Connected { local, peer } => {
                self.addresses = Some((local, peer));
                cx.log.status(format!(
                    "Connection established with {peer}, waiting for welcome message..."
                ));
                None
            }
            SocketEvent::Data(data) => {
                self.reader.feed(&data);
                self.next_action(cx)
            }
            SocketEvent::TlsEstablished(established) => {
                self.tls_established = Some(established);
                Some(SessionAction::Resume)
            }
            SocketEvent::TlsFailed(error) => {
                cx.log.error(format!("TLS handshake failed: {error}"));
                Some(SessionAction::Disconnected(Reply::CRITICAL_ERROR))
            }
            SocketEvent::Closed(error) => {
                match error {
                    Some(error) => cx.log.error(format!("Connection failed: {error}")),
                    None => cx.log.error("Connection closed by server"),
                }
                self.conn = None;
                self.connected = false;
                Some(SessionAction::Disconnected(Reply::ERROR))
            }
        }
    }

    fn send_keepalive(&mut self, cx: &mut FtpContext) {
        let command = match rand::thread_rng().gen_range(0..3) {
            0 => "NOOP".to_owned(),
            1 => "PWD".to_owned(),
            _ => format!("TYPE {}", self.transfer_type.unwrap_or('I')),
        };
        debug!(%command, "Keepalive");
        if self.send_command(cx, MessageType::DebugVerbose, &command) {
            self.keepalive_pending += 1;
        }
    }
}

fn loggable_command(command: &str) -> String {
    match command.split_once(' ') {
        Some((verb, arg)) if verb.eq_ignore_ascii_case("PASS") || verb.eq_ignore_ascii_case("ACCT") => {
            format!("{verb} {}", "*".repeat(arg.chars().count().min(8)))
        }
        _ => command.to_owned(),
    }
}

impl ProtocolSession for FtpSession {
    fn create_operation(
        &mut self,
        command: Command,
        _cx: &mut FtpContext,
    ) -> Result<FtpOp, Reply> {
        ops::create(command)
    }

    fn handle_event(
        &mut self,
        event: ControlEvent,
        cx: &mut FtpContext,
    ) -> Option<SessionAction> {
        match event {
            ControlEvent::Socket { conn, event } => {
                if self.conn.as_ref().map(|c| c.id()) != Some(conn) {
                    return None;
                }
                self.on_socket_event(event, cx)
            }
            ControlEvent::Transfer { id, event } => {
                if self.transfer.as_ref().map(|t| t.id()) != Some(id) {
                    return None;
                }
                if let TransferEvent::Started { .. } = event {
                    cx.status.set_start_time();
                }
                Some(SessionAction::Transfer(event))
            }
            _ => None,
        }
    }

    fn next_action(&mut self, cx: &mut FtpContext) -> Option<SessionAction> {
        loop {
            let reply = match self.replies.pop_front() {
                Some(reply) => reply,
                None => match self.reader.next_reply() {
                    Ok(Some(reply)) => reply,
                    Ok(None) => return None,
                    Err(error) => {
                        cx.log.error(format!("Invalid reply from server: {error}"));
                        return Some(SessionAction::Disconnected(Reply::ERROR));
                    }
                },
            };
            for line in &reply.lines {
                cx.log.log(MessageType::Response, line.clone());
            }
            if reply.is_preliminary() {
                if self.expect_preliminary && self.skip == 0 && self.keepalive_pending == 0 {
                    self.reply = Some(reply);
                    return Some(SessionAction::ParseResponse);
                }
                continue;
            }
            self.outstanding = self.outstanding.saturating_sub(1);
            if reply.code == 421 {
                self.connected = false;
                return Some(SessionAction::Disconnected(Reply::ERROR));
            }
            if self.skip > 0 {
                self.skip -= 1;
                continue;
            }
            if self.keepalive_pending > 0 {
                self.keepalive_pending -= 1;
                continue;
            }
            self.reply = Some(reply);
            return Some(SessionAction::ParseResponse);
        }
    }

    fn on_timer(&mut self, idle: bool, cx: &mut FtpContext) {
        if !idle || !self.connected || self.keepalive_pending > 0 {
            return;
        }
        if !cx.options().get_bool(ferry_common::OptionId::FtpSendKeepalive) {
            return;
        }
        if cx.layers.clock.idle_for() >= KEEPALIVE_INTERVAL {
            self.send_keepalive(cx);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn close(&mut self, cx: &mut FtpContext) {
        self.transfer = None;
        if let Some(conn) = self.conn.take() {
            if self.connected {
                cx.log.log(MessageType::Command, "QUIT");
                conn.send(&b"QUIT\r\n"[..]);
            }
            conn.shutdown();
        }
        self.connected = false;
        self.reader.clear();
        self.replies.clear();
        self.reply = None;
        self.outstanding = 0;
        self.skip = 0;
        self.keepalive_pending = 0;
        self.expect_preliminary = false;
        self.tls_established = None;
        self.protected = false;
        self.current_path = ServerPath::default();
        self.transfer_type = None;
    }
}

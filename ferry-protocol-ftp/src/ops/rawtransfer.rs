use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use ferry_common::{
    AsyncReply, AsyncRequest, AsyncRequestKind, CommandId, InsecureConnectionRequest,
    InsecureReason, MessageType, OptionId, PasvMode, Reply, ReplyFlags,
};
use ferry_core::aio::{Reader, Writer};
use ferry_core::capabilities::{Capability, CapabilityState};
use ferry_core::operation::{OpMeta, Operation};
use ferry_core::proxy::ProxySettings;
use ferry_core::transfer::{
    bind_active, DataEndpoint, DataTls, TransferEndReason, TransferEvent, TransferKind,
    TransferParams, TransferSocket,
};
use ferry_tls::TlsError;

use super::{log_unexpected, op_meta, send_command};
use crate::pasv::{format_port_command, parse_epsv, parse_pasv, should_use_control_host};
use crate::session::{FtpContext, FtpSession};

/// What a data connection should carry.
pub struct RawTransferRequest {
    pub kind: TransferKind,
    /// e.g. `RETR name` or `MLSD`
    pub command: String,
    /// Sent as `REST` unless zero
    pub offset: u64,
    pub ascii: bool,
    pub reader: Option<Box<dyn Reader>>,
    pub writer: Option<Box<dyn Writer>>,
    /// Expected size for progress reporting, `-1` if unknown
    pub total: i64,
}

impl RawTransferRequest {
    pub fn list(command: impl Into<String>) -> Self {
        Self {
            kind: TransferKind::List,
            command: command.into(),
            offset: 0,
            ascii: true,
            reader: None,
            writer: None,
            total: -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Type,
    WaitType,
    Mode,
    WaitPasv,
    WaitPort,
    Rest,
    WaitRest,
    Command,
    WaitTransfer,
}

/// Runs one data connection together with the control commands around it:
/// `TYPE`, `EPSV`/`PASV` or `PORT`/`EPRT`, `REST` and the transfer command
/// itself. Finishes once both the final reply and the end of the data
/// connection are in.
pub struct RawTransferOp {
    meta: OpMeta,
    state: State,
    request: RawTransferRequest,
    passive: bool,
    epsv: bool,
    endpoint: Option<DataEndpoint>,
    preliminary_seen: bool,
    final_code: Option<u16>,
    end_reason: Option<TransferEndReason>,
    transferred: u64,
    data: Option<Bytes>,
}

impl RawTransferOp {
    pub fn new(request: RawTransferRequest) -> Self {
        Self {
            meta: OpMeta::new("rawtransfer", CommandId::Private2),
            state: State::Type,
            request,
            passive: true,
            epsv: false,
            endpoint: None,
            preliminary_seen: false,
            final_code: None,
            end_reason: None,
            transferred: 0,
            data: None,
        }
    }

    pub fn end_reason(&self) -> Option<TransferEndReason> {
        self.end_reason
    }

    pub fn final_code(&self) -> Option<u16> {
        self.final_code
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Received bytes of a listing or resume test.
    pub fn data(&self) -> Option<&Bytes> {
        self.data.as_ref()
    }

    fn use_passive(cx: &FtpContext) -> bool {
        match cx.server.as_ref().map(|s| s.pasv_mode) {
            Some(PasvMode::Passive) => true,
            Some(PasvMode::Active) => false,
            _ => cx.options().get_bool(OptionId::UsePassive),
        }
    }

    fn proxy(cx: &FtpContext) -> Option<ProxySettings> {
        if cx.server.as_ref().is_some_and(|s| s.bypass_proxy) {
            return None;
        }
        ProxySettings::from_options(cx.options())
    }

    fn send_mode(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
        let Some((local, peer)) = session.addresses else {
            return Reply::ERROR | ReplyFlags::INTERNALERROR;
        };
        if self.passive {
            self.epsv = peer.is_ipv6()
                || session.capability(cx, Capability::Epsv) == CapabilityState::Yes;
            self.state = State::WaitPasv;
            let command = if self.epsv { "EPSV" } else { "PASV" };
            return send_command(session, cx, &self.meta, command);
        }

        if Self::proxy(cx).is_some() {
            cx.log.error("Active mode is not possible through a proxy");
            return Reply::ERROR;
        }
        let options = cx.options();
        let range = options.get_bool(OptionId::LimitPorts).then(|| {
            (
                options.get_int(OptionId::LimitPortsLow) as u16,
                options.get_int(OptionId::LimitPortsHigh) as u16,
            )
        });
        let listener = match bind_active(local.ip(), range) {
            Ok(listener) => listener,
            Err(error) => {
                cx.log
                    .error(format!("Could not listen for the data connection: {error}"));
                return Reply::ERROR;
            }
        };
        let port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(error) => {
                cx.log.error(format!("Could not listen for the data connection: {error}"));
                return Reply::ERROR;
            }
        };
        let announced = options
            .get_string(OptionId::ExternalIp)
            .parse::<IpAddr>()
            .unwrap_or(local.ip());
        self.endpoint = Some(DataEndpoint::Active(listener));
        self.state = State::WaitPort;
        let command = format_port_command(SocketAddr::new(announced, port));
        send_command(session, cx, &self.meta, &command)
    }

    /// Host to connect to for a passive data connection.
    fn passive_host(&self, session: &FtpSession, cx: &FtpContext, text: &str) -> Option<String> {
        let (_, peer) = session.addresses?;
        let control_host = || {
            if Self::proxy(cx).is_some() {
                cx.server.as_ref().map(|s| s.host.clone())
            } else {
                Some(peer.ip().to_string())
            }
        };
        if self.epsv {
            return control_host();
        }
        let (ip, _) = parse_pasv(text)?;
        if Self::proxy(cx).is_some()
            || (cx.options().get_bool(OptionId::PasvReplyFallback)
                && should_use_control_host(ip, peer.ip()))
        {
            return control_host();
        }
        Some(ip.to_string())
    }

    fn start_transfer(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
        let Some(endpoint) = self.endpoint.take() else {
            return Reply::ERROR | ReplyFlags::INTERNALERROR;
        };
        let source_address = match (&endpoint, session.addresses) {
            (DataEndpoint::Passive { host, .. }, Some((local, peer)))
                if host.parse::<IpAddr>().ok() == Some(peer.ip()) =>
            {
                Some(local.ip())
            }
            _ => None,
        };
        let tls = match (&session.tls, session.protected) {
            (Some(client), true) => Some(DataTls {
                client: client.clone(),
                host: cx.server.as_ref().map(|s| s.host.clone()).unwrap_or_default(),
                alpn_required: session.tls_resumption_required,
                known: session.capability(cx, Capability::TlsResumption),
            }),
            _ => None,
        };
        let options = cx.options();
        let timeout = options.get_int(OptionId::Timeout);
        let keepalive = options.get_int(OptionId::TcpKeepaliveInterval);
        let kind = self.request.kind;
        let status = match kind {
            TransferKind::ResumeTest => None,
            _ => {
                cx.status.init(
                    self.request.total,
                    self.request.offset as i64,
                    kind == TransferKind::List,
                );
                Some(cx.status.clone())
            }
        };
        let params = TransferParams {
            kind,
            endpoint,
            source_address,
            proxy: Self::proxy(cx),
            tls,
            ascii: self.request.ascii && kind != TransferKind::List,
            reader: self.request.reader.take(),
            writer: self.request.writer.take(),
            layers: cx.layers.clone(),
            status,
            timeout: (timeout > 0).then(|| Duration::from_secs(timeout as u64)),
            keepalive: (keepalive > 0).then(|| Duration::from_secs(keepalive as u64 * 60)),
        };
        session.transfer = Some(TransferSocket::spawn(params, cx.events.clone()));
        session.expect_preliminary = true;
        self.state = State::WaitTransfer;
        let command = self.request.command.clone();
        send_command(session, cx, &self.meta, &command)
    }

    fn check_done(&self) -> Reply {
        let (Some(code), Some(reason)) = (self.final_code, self.end_reason) else {
            return Reply::WOULDBLOCK;
        };
        if code / 100 == 2 && reason == TransferEndReason::Successful {
            Reply::OK
        } else if reason == TransferEndReason::TransferFailureCritical {
            Reply::CRITICAL_ERROR | ReplyFlags::WRITEFAILED
        } else {
            Reply::ERROR
        }
    }
}

impl Operation<FtpSession> for RawTransferOp {
    op_meta!();

    fn send(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
        match self.state {
            State::Type => {
                let wanted = if self.request.ascii { 'A' } else { 'I' };
                self.passive = Self::use_passive(cx);
                if session.transfer_type == Some(wanted) {
                    self.state = State::Mode;
                    return Reply::CONTINUE;
                }
                self.state = State::WaitType;
                send_command(session, cx, &self.meta, &format!("TYPE {wanted}"))
            }
            State::Mode => self.send_mode(session, cx),
            State::Rest => {
                if self.request.offset == 0 && self.request.kind != TransferKind::ResumeTest {
                    self.state = State::Command;
                    return Reply::CONTINUE;
                }
                self.state = State::WaitRest;
                let command = format!("REST {}", self.request.offset);
                send_command(session, cx, &self.meta, &command)
            }
            State::Command => self.start_transfer(session, cx),
            State::WaitType
            | State::WaitPasv
            | State::WaitPort
            | State::WaitRest
            | State::WaitTransfer => Reply::WOULDBLOCK,
        }
    }

    fn parse_response(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
        let reply = session.take_reply();
        match self.state {
            State::WaitType => {
                if !reply.is_success() {
                    return Reply::ERROR;
                }
                session.transfer_type = Some(if self.request.ascii { 'A' } else { 'I' });
                self.state = State::Mode;
                Reply::CONTINUE
            }
            State::WaitPasv => {
                let port = if self.epsv && reply.code == 229 {
                    parse_epsv(reply.text())
                } else if !self.epsv && reply.code == 227 {
                    parse_pasv(reply.text()).map(|(_, port)| port)
                } else {
                    None
                };
                let host = port.and_then(|_| self.passive_host(session, cx, reply.text()));
                match (host, port) {
                    (Some(host), Some(port)) => {
                        self.endpoint = Some(DataEndpoint::Passive { host, port });
                        self.state = State::Rest;
                        Reply::CONTINUE
                    }
                    _ if self.epsv => {
                        // Fall back to PASV for the rest of the session
                        session.set_capability(cx, Capability::Epsv, CapabilityState::No);
                        self.epsv = false;
                        self.state = State::WaitPasv;
                        send_command(session, cx, &self.meta, "PASV")
                    }
                    _ => {
                        cx.log.error("Failed to parse the passive mode reply");
                        Reply::ERROR
                    }
                }
            }
            State::WaitPort => {
                if !reply.is_success() {
                    self.endpoint = None;
                    return Reply::ERROR;
                }
                self.state = State::Rest;
                Reply::CONTINUE
            }
            State::WaitRest => {
                if reply.is_intermediate() || reply.is_success() {
                    self.state = State::Command;
                    Reply::CONTINUE
                } else {
                    self.end_reason = Some(TransferEndReason::PreTransferCommandFailure);
                    Reply::ERROR
                }
            }
            State::WaitTransfer => {
                if reply.is_preliminary() {
                    self.preliminary_seen = true;
                    return Reply::WOULDBLOCK;
                }
                session.expect_preliminary = false;
                self.final_code = Some(reply.code);
                if !reply.is_success() && !self.preliminary_seen {
                    // The data connection is useless without the command
                    session.transfer = None;
                    self.end_reason = Some(TransferEndReason::TransferCommandFailureImmediate);
                    return Reply::ERROR;
                }
                self.check_done()
            }
            State::Type | State::Mode | State::Rest | State::Command => {
                log_unexpected(cx, self.state);
                Reply::ERROR
            }
        }
    }

    fn on_transfer_event(
        &mut self,
        event: TransferEvent,
        session: &mut FtpSession,
        cx: &mut FtpContext,
    ) -> Reply {
        match event {
            TransferEvent::Started { .. } => Reply::WOULDBLOCK,
            TransferEvent::ResumptionSeen => {
                session.set_capability(cx, Capability::TlsResumption, CapabilityState::Yes);
                Reply::WOULDBLOCK
            }
            TransferEvent::ResumptionUnknown => {
                let Some(server) = cx.server.clone() else {
                    return Reply::ERROR | ReplyFlags::INTERNALERROR;
                };
                cx.request(
                    &mut self.meta,
                    AsyncRequestKind::InsecureConnection(InsecureConnectionRequest {
                        server,
                        reason: InsecureReason::NoDataChannelResumption,
                    }),
                )
            }
            TransferEvent::Ended {
                reason,
                transferred,
                data,
            } => {
                session.transfer = None;
                self.transferred = transferred;
                self.data = data;
                self.end_reason = Some(reason);
                if reason == TransferEndReason::FailedTlsResumption {
                    cx.log.error(format!("Transfer refused: {}", TlsError::ResumptionRequired));
                } else if reason != TransferEndReason::Successful {
                    cx.log.log(
                        MessageType::DebugInfo,
                        format!("Data connection ended: {reason:?}"),
                    );
                }
                self.check_done()
            }
        }
    }

    fn on_async_reply(
        &mut self,
        request: AsyncRequest,
        session: &mut FtpSession,
        cx: &mut FtpContext,
    ) -> Reply {
        let Some(AsyncReply::InsecureConnection { allow }) = request.reply else {
            return Reply::ERROR | ReplyFlags::INTERNALERROR;
        };
        if allow {
            session.set_capability(cx, Capability::TlsResumption, CapabilityState::No);
        }
        if let Some(transfer) = session.transfer.as_mut() {
            transfer.confirm_insecure(allow);
        }
        Reply::WOULDBLOCK
    }

    fn reset(&mut self, result: Reply, session: &mut FtpSession, _cx: &mut FtpContext) -> Reply {
        session.expect_preliminary = false;
        session.transfer = None;
        if !result.is_ok() {
            session.abandon_replies();
        }
        result
    }
}

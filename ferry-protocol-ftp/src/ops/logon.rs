use std::collections::VecDeque;
use std::time::Duration;

use ferry_common::{
    AsyncReply, AsyncRequest, AsyncRequestKind, CertificateRequest, CommandId,
    InsecureConnectionRequest, InsecureReason, InteractiveLoginRequest, LogonType, MessageType,
    Notification, OptionId, Protocol, Reply, ReplyFlags, Secret, Site,
};
use ferry_core::capabilities::{Capability, CapabilityState};
use ferry_core::connection::{ConnectParams, ControlConnection, TlsEstablished};
use ferry_core::operation::{OpMeta, Operation};
use ferry_core::proxy::ProxySettings;
use ferry_tls::{certificate_info, TlsClient, FTP_RESUMPTION_ALPN};

use super::{log_unexpected, op_meta, send_command};
use crate::reply::FtpReply;
use crate::session::{FtpContext, FtpSession};

const ANONYMOUS_PASSWORD: &str = "anonymous@example.com";

/// `FEAT` lines and the capability each one announces.
const FEATURES: [(&str, Capability); 8] = [
    ("UTF8", Capability::Utf8),
    ("MLST", Capability::Mlsd),
    ("SIZE", Capability::Size),
    ("MDTM", Capability::Mdtm),
    ("MFMT", Capability::Mfmt),
    ("REST STREAM", Capability::RestStream),
    ("EPSV", Capability::Epsv),
    ("CLNT", Capability::Clnt),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connect,
    Welcome,
    WaitAuthTls,
    WaitTls,
    WaitCertificate,
    WaitInsecure,
    Pbsz,
    WaitPbsz,
    WaitProt,
    User,
    WaitPasswordPrompt,
    WaitUser,
    WaitChallenge,
    WaitPass,
    WaitAcct,
    WaitFeat,
    Queued,
    WaitQueued,
}

/// Connects and logs in: welcome message, TLS, credentials and feature
/// negotiation.
pub struct LogonOp {
    meta: OpMeta,
    state: State,
    site: Site,
    welcome_seen: bool,
    tls_done: bool,
    /// Password typed in answer to a prompt
    password: Option<Secret<String>>,
    /// Commands sent after login whose outcome does not matter
    queued: VecDeque<String>,
}

impl LogonOp {
    pub fn new(site: Site) -> Self {
        Self {
            meta: OpMeta::new("logon", CommandId::Connect),
            state: State::Connect,
            site,
            welcome_seen: false,
            tls_done: false,
            password: None,
            queued: VecDeque::new(),
        }
    }

    fn connect(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
        let server = &self.site.server;
        cx.log.status(format!("Connecting to {}...", server.authority()));
        let options = cx.options();
        let mut params = ConnectParams::new(server.host.clone(), server.port);
        let timeout = options.get_int(OptionId::Timeout);
        params.timeout = (timeout > 0).then(|| Duration::from_secs(timeout as u64));
        let keepalive = options.get_int(OptionId::TcpKeepaliveInterval);
        params.keepalive = (keepalive > 0).then(|| Duration::from_secs(keepalive as u64 * 60));
        if !server.bypass_proxy {
            params.proxy = ProxySettings::from_options(options);
        }

        if session.protocol != Protocol::InsecureFtp {
            let client = match TlsClient::new(
                &[FTP_RESUMPTION_ALPN],
                cx.engine.trusted_certificates.clone(),
            ) {
                Ok(client) => client,
                Err(error) => {
                    cx.log.error(format!("Could not set up TLS: {error}"));
                    return Reply::CRITICAL_ERROR;
                }
            };
            if session.protocol == Protocol::Ftps {
                params.tls = Some(client.clone());
            }
            session.tls = Some(client);
        }

        let conn = ControlConnection::connect(params, cx.layers.clone(), cx.events.clone());
        session.set_connection(conn);
        self.state = State::Welcome;
        Reply::WOULDBLOCK
    }

    fn on_tls(
        &mut self,
        established: Box<TlsEstablished>,
        session: &mut FtpSession,
        cx: &mut FtpContext,
    ) -> Reply {
        let TlsEstablished { info, verification } = *established;
        cx.log.status(format!(
            "TLS connection established ({}, {})",
            info.protocol_version, info.cipher
        ));
        cx.post(Notification::Encryption(
            info.encryption_details(verification.as_ref()),
        ));
        session.tls_resumption_required = info.alpn_is(FTP_RESUMPTION_ALPN);

        if let Some(record) = verification.filter(|r| r.needs_confirmation()) {
            let chain = record
                .chain
                .iter()
                .filter_map(|der| certificate_info(der).ok())
                .collect();
            self.state = State::WaitCertificate;
            let request = CertificateRequest {
                host: self.site.server.host.clone(),
                port: self.site.server.port,
                chain,
                verification_error: record.error.clone(),
                protocol_version: info.protocol_version,
                cipher: info.cipher,
            };
            return cx.request(&mut self.meta, AsyncRequestKind::Certificate(request));
        }
        self.after_tls()
    }

    fn after_tls(&mut self) -> Reply {
        self.tls_done = true;
        if self.welcome_seen {
            self.state = State::Pbsz;
            Reply::CONTINUE
        } else {
            self.state = State::Welcome;
            Reply::WOULDBLOCK
        }
    }

    fn user(&self) -> String {
        match (self.site.credentials.logon_type, self.site.server.user.as_str()) {
            (LogonType::Anonymous, _) | (_, "") => "anonymous".to_owned(),
            (_, user) => user.to_owned(),
        }
    }

    fn password(&self) -> String {
        if let Some(password) = &self.password {
            return password.expose_secret().clone();
        }
        let password = self.site.credentials.password.expose_secret();
        if password.is_empty() && self.site.credentials.logon_type == LogonType::Anonymous {
            ANONYMOUS_PASSWORD.to_owned()
        } else {
            password.clone()
        }
    }

    fn send_user(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
        let needs_prompt = self.site.credentials.logon_type == LogonType::Ask
            && self.site.credentials.password.expose_secret().is_empty()
            && self.password.is_none();
        if needs_prompt {
            self.state = State::WaitPasswordPrompt;
            let challenge = format!("Password for {}@{}", self.user(), self.site.server.host);
            return cx.request(
                &mut self.meta,
                AsyncRequestKind::InteractiveLogin(InteractiveLoginRequest {
                    challenge,
                    is_password_prompt: true,
                }),
            );
        }
        self.state = State::WaitUser;
        let command = format!("USER {}", self.user());
        send_command(session, cx, &self.meta, &command)
    }

    /// Answers a `331`.
    fn send_pass(&mut self, reply: &FtpReply, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
        if self.site.credentials.logon_type == LogonType::Interactive && self.password.is_none() {
            self.state = State::WaitChallenge;
            let challenge = reply
                .lines
                .iter()
                .map(|l| l.get(4..).unwrap_or_default())
                .collect::<Vec<_>>()
                .join("\n");
            return cx.request(
                &mut self.meta,
                AsyncRequestKind::InteractiveLogin(InteractiveLoginRequest {
                    challenge,
                    is_password_prompt: false,
                }),
            );
        }
        self.state = State::WaitPass;
        let command = format!("PASS {}", self.password());
        send_command(session, cx, &self.meta, &command)
    }

    fn send_acct(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
        if self.site.credentials.account.is_empty() {
            cx.log.error("Server requires an account, but none is set");
            return Reply::CRITICAL_ERROR | ReplyFlags::PASSWORDFAILED;
        }
        self.state = State::WaitAcct;
        let command = format!("ACCT {}", self.site.credentials.account);
        send_command(session, cx, &self.meta, &command)
    }

    fn logged_in(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
        cx.log.status("Logged in");
        self.state = State::WaitFeat;
        send_command(session, cx, &self.meta, "FEAT")
    }

    fn apply_features(&mut self, reply: &FtpReply, session: &mut FtpSession, cx: &mut FtpContext) {
        let listed = if reply.is_success() {
            parse_features(&reply.lines)
        } else {
            vec![]
        };
        for (_, capability) in FEATURES {
            let state = if listed.contains(&capability) {
                CapabilityState::Yes
            } else {
                CapabilityState::No
            };
            session.set_capability(cx, capability, state);
        }
        if listed.contains(&Capability::Clnt) {
            self.queued.push_back(format!("CLNT ferry {}", env!("CARGO_PKG_VERSION")));
        }
        if listed.contains(&Capability::Utf8) {
            self.queued.push_back("OPTS UTF8 ON".to_owned());
        }
        self.queued
            .extend(self.site.server.post_login_commands.iter().cloned());
    }
}

/// Features listed in a `FEAT` reply, ignoring the first and last line.
pub fn parse_features(lines: &[String]) -> Vec<Capability> {
    let inner = match lines.len() {
        0..=2 => &[][..],
        n => &lines[1..n - 1],
    };
    let mut found = vec![];
    for line in inner {
        let feature = line.trim().to_ascii_uppercase();
        for (name, capability) in FEATURES {
            let matches = feature == name
                || feature
                    .strip_prefix(name)
                    .is_some_and(|rest| rest.starts_with(' '));
            if matches && !found.contains(&capability) {
                found.push(capability);
            }
        }
    }
    found
}

impl Operation<FtpSession> for LogonOp {
    op_meta!();

    fn send(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
        if let Some(established) = session.tls_established.take() {
            return self.on_tls(established, session, cx);
        }
        match self.state {
            State::Connect => self.connect(session, cx),
            State::Pbsz => {
                self.state = State::WaitPbsz;
                send_command(session, cx, &self.meta, "PBSZ 0")
            }
            State::User => self.send_user(session, cx),
            State::Queued => match self.queued.pop_front() {
                Some(command) => {
                    self.state = State::WaitQueued;
                    send_command(session, cx, &self.meta, &command)
                }
                None => {
                    session.connected = true;
                    Reply::OK
                }
            },
            State::Welcome
            | State::WaitAuthTls
            | State::WaitTls
            | State::WaitCertificate
            | State::WaitInsecure
            | State::WaitPbsz
            | State::WaitProt
            | State::WaitPasswordPrompt
            | State::WaitUser
            | State::WaitChallenge
            | State::WaitPass
            | State::WaitAcct
            | State::WaitFeat
            | State::WaitQueued => Reply::WOULDBLOCK,
        }
    }

    fn parse_response(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
        let reply = session.take_reply();
        match self.state {
            State::Welcome | State::WaitCertificate if !self.welcome_seen => {
                if !reply.is_success() {
                    return Reply::CRITICAL_ERROR;
                }
                self.welcome_seen = true;
                if session.protocol == Protocol::Ftps {
                    // Implicit TLS finished before the welcome arrived
                    if !self.tls_done {
                        return Reply::WOULDBLOCK;
                    }
                    self.state = State::Pbsz;
                    return Reply::CONTINUE;
                }
                if session.protocol == Protocol::InsecureFtp {
                    self.state = State::User;
                    return Reply::CONTINUE;
                }
                self.state = State::WaitAuthTls;
                send_command(session, cx, &self.meta, "AUTH TLS")
            }
            State::WaitAuthTls => {
                if reply.is_success() {
                    let (Some(conn), Some(client)) = (session.connection(), session.tls.clone())
                    else {
                        return Reply::ERROR | ReplyFlags::INTERNALERROR;
                    };
                    if !conn.start_tls(client, &self.site.server.host) {
                        return Reply::ERROR | ReplyFlags::DISCONNECTED;
                    }
                    self.state = State::WaitTls;
                    return Reply::WOULDBLOCK;
                }
                session.tls = None;
                if session.protocol == Protocol::Ftpes {
                    cx.log.error("Server does not support FTP over TLS");
                    return Reply::CRITICAL_ERROR;
                }
                self.state = State::WaitInsecure;
                let mut server = self.site.server.clone();
                server.protocol = Protocol::InsecureFtp;
                cx.request(
                    &mut self.meta,
                    AsyncRequestKind::InsecureConnection(InsecureConnectionRequest {
                        server,
                        reason: InsecureReason::PlainFtp,
                    }),
                )
            }
            State::WaitPbsz => {
                self.state = State::WaitProt;
                send_command(session, cx, &self.meta, "PROT P")
            }
            State::WaitProt => {
                session.protected = reply.is_success();
                if !session.protected {
                    cx.log.log(
                        MessageType::DebugWarning,
                        "Server refused PROT P, data connections stay unencrypted",
                    );
                }
                self.state = State::User;
                Reply::CONTINUE
            }
            State::WaitUser | State::WaitPass | State::WaitAcct => match reply.code {
                230 | 202 => self.logged_in(session, cx),
                331 if self.state == State::WaitUser => self.send_pass(&reply, session, cx),
                332 if self.state != State::WaitAcct => self.send_acct(session, cx),
                _ if reply.is_success() && self.state == State::WaitAcct => {
                    self.logged_in(session, cx)
                }
                _ => {
                    cx.log.error("Authentication failed");
                    Reply::CRITICAL_ERROR | ReplyFlags::PASSWORDFAILED
                }
            },
            State::WaitFeat => {
                self.apply_features(&reply, session, cx);
                self.state = State::Queued;
                Reply::CONTINUE
            }
            State::WaitQueued => {
                if !reply.is_success() {
                    cx.log.log(
                        MessageType::DebugInfo,
                        format!("Ignoring failed post-login command: {}", reply.code),
                    );
                }
                self.state = State::Queued;
                Reply::CONTINUE
            }
            state => {
                log_unexpected(cx, state);
                Reply::ERROR
            }
        }
    }

    fn on_async_reply(
        &mut self,
        request: AsyncRequest,
        session: &mut FtpSession,
        cx: &mut FtpContext,
    ) -> Reply {
        match (self.state, request.reply) {
            (State::WaitCertificate, Some(AsyncReply::Certificate { trust, always })) => {
                let AsyncRequestKind::Certificate(certificate) = &request.kind else {
                    return Reply::ERROR | ReplyFlags::INTERNALERROR;
                };
                if let Err(error) = cx
                    .engine
                    .trusted_certificates
                    .apply_answer(certificate, trust, always)
                {
                    cx.log.error(format!("Connection refused: {error}"));
                    return Reply::CRITICAL_ERROR;
                }
                self.after_tls()
            }
            (State::WaitInsecure, Some(AsyncReply::InsecureConnection { allow })) => {
                if !allow {
                    return Reply::CRITICAL_ERROR;
                }
                session.protocol = Protocol::InsecureFtp;
                self.site.server.protocol = Protocol::InsecureFtp;
                cx.server = Some(self.site.server.clone());
                cx.post(Notification::ServerChanged(self.site.server.clone()));
                self.state = State::User;
                Reply::CONTINUE
            }
            (
                State::WaitPasswordPrompt | State::WaitChallenge,
                Some(AsyncReply::InteractiveLogin(answer)),
            ) => {
                let Some(password) = answer else {
                    return Reply::CRITICAL_ERROR | ReplyFlags::PASSWORDFAILED;
                };
                self.password = Some(password);
                if self.state == State::WaitPasswordPrompt {
                    self.state = State::User;
                    return Reply::CONTINUE;
                }
                self.state = State::WaitPass;
                let command = format!("PASS {}", self.password());
                send_command(session, cx, &self.meta, &command)
            }
            _ => Reply::ERROR | ReplyFlags::INTERNALERROR,
        }
    }

    fn reset(&mut self, result: Reply, session: &mut FtpSession, _cx: &mut FtpContext) -> Reply {
        if result.is_ok() {
            return result;
        }
        session.abandon_replies();
        result | ReplyFlags::DISCONNECTED
    }
}

use ferry_common::{
    AsyncReply, AsyncRequest, AsyncRequestKind, CommandId, HostKeyRequest,
    InteractiveLoginRequest, LogonType, MessageType, Notification, OptionId, ProxyKind, Reply,
    ReplyFlags, ServerPath, Site,
};
use ferry_core::operation::{OpMeta, Operation};
use ferry_core::proxy::ProxySettings;
use ferry_core::HostKeyStatus;

use super::{
    continue_if_ok, drain, log_unexpected, op_meta, result_of, send_command, ChangeDirOp,
};
use crate::event::{quote, SftpEvent};
use crate::session::{SftpContext, SftpSession};

/// First line the helper prints, announcing the protocol it speaks.
const PROTOCOL_VERSION: &str = "protocol_version=1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Spawn,
    Greeting,
    Proxy,
    WaitProxy,
    KeyFile,
    WaitKeyFile,
    Open,
    WaitOpen,
    WaitHostKey,
    WaitPassword,
    WaitCwd,
}

struct OfferedKey {
    host: String,
    port: u16,
    fingerprint: String,
}

/// Starts the helper and has it log in. Host keys the engine has not seen
/// and passwords it does not know become async requests.
pub struct ConnectOp {
    meta: OpMeta,
    state: State,
    site: Site,
    offered_key: Option<OfferedKey>,
    password_sent: bool,
}

impl ConnectOp {
    pub fn new(site: Site) -> Self {
        Self {
            meta: OpMeta::new("ConnectOp", CommandId::Connect),
            state: State::Spawn,
            site,
            offered_key: None,
            password_sent: false,
        }
    }

    fn spawn(&mut self, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        let program = cx.options().get_string(OptionId::SftpHelper);
        cx.log.status(format!("Connecting to {}...", self.site.server));
        if let Err(error) = session.start(&program, cx) {
            cx.log.error(format!("Cannot start the SFTP helper: {error}"));
            return Reply::CRITICAL_ERROR;
        }
        self.state = State::Greeting;
        Reply::WOULDBLOCK
    }

    fn proxy(&mut self, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        let proxy = ProxySettings::from_options(cx.options())
            .filter(|_| !self.site.server.bypass_proxy);
        let Some(proxy) = proxy else {
            self.state = State::KeyFile;
            return Reply::CONTINUE;
        };
        let kind = match proxy.kind {
            ProxyKind::Http => "http",
            ProxyKind::Socks5 => "socks5",
        };
        let base = format!("proxy {kind} {} {} {}", quote(&proxy.host), proxy.port, quote(&proxy.user));
        let line = format!("{base} {}", quote(proxy.password.expose_secret()));
        self.state = State::WaitProxy;
        if session.send_command_shown_as(cx, self.meta.send_log_level, &line, &format!("{base} ****")) {
            Reply::WOULDBLOCK
        } else {
            Reply::ERROR | ReplyFlags::DISCONNECTED
        }
    }

    fn key_file(&mut self, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        let key_file = match (&cx.credentials.logon_type, &cx.credentials.key_file) {
            (LogonType::Key, Some(path)) => path.to_string_lossy().into_owned(),
            _ => {
                self.state = State::Open;
                return Reply::CONTINUE;
            }
        };
        self.state = State::WaitKeyFile;
        send_command(session, cx, &self.meta, &format!("keyfile {}", quote(&key_file)))
    }

    fn open(&mut self, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        let server = &self.site.server;
        let command = format!(
            "open {} {} {}",
            quote(&server.host),
            server.port,
            quote(&server.user)
        );
        self.state = State::WaitOpen;
        send_command(session, cx, &self.meta, &command)
    }

    fn on_host_key(
        &mut self,
        host: String,
        port: u16,
        fingerprint: String,
        changed: bool,
        session: &mut SftpSession,
        cx: &mut SftpContext,
    ) -> Reply {
        let status = cx.engine.host_keys.check(&host, port, &fingerprint);
        if status == HostKeyStatus::Trusted && !changed {
            session.send_answer(cx, "y");
            return Reply::WOULDBLOCK;
        }
        let request = HostKeyRequest {
            host: host.clone(),
            port,
            fingerprint: fingerprint.clone(),
            changed: changed || status == HostKeyStatus::Changed,
        };
        self.offered_key = Some(OfferedKey {
            host,
            port,
            fingerprint,
        });
        self.state = State::WaitHostKey;
        cx.request(&mut self.meta, AsyncRequestKind::HostKey(request))
    }

    fn on_password(&mut self, challenge: String, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        let credentials = &cx.credentials;
        let known = !credentials.password.expose_secret().is_empty()
            || credentials.logon_type == LogonType::Normal;
        let interactive = credentials.logon_type == LogonType::Interactive;
        if known && !interactive && !self.password_sent {
            self.password_sent = true;
            session.send_secret(cx, credentials.password.expose_secret());
            return Reply::WOULDBLOCK;
        }
        let challenge = match session.prompt.take() {
            Some(prompt) => format!("{prompt}\n{challenge}"),
            None => challenge,
        };
        let is_password_prompt = challenge.to_ascii_lowercase().contains("password");
        self.state = State::WaitPassword;
        cx.request(
            &mut self.meta,
            AsyncRequestKind::InteractiveLogin(InteractiveLoginRequest {
                challenge,
                is_password_prompt,
            }),
        )
    }

    fn on_event(&mut self, event: SftpEvent, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        match (self.state, event) {
            (State::Greeting, SftpEvent::Reply(text)) => {
                if !text.contains(PROTOCOL_VERSION) {
                    cx.log.error(format!("The SFTP helper speaks an unknown protocol: {text}"));
                    return Reply::CRITICAL_ERROR;
                }
                self.state = State::Proxy;
                Reply::CONTINUE
            }
            (State::WaitProxy, SftpEvent::Done(outcome)) => {
                self.state = State::KeyFile;
                continue_if_ok(result_of(outcome))
            }
            (State::WaitKeyFile, SftpEvent::Done(outcome)) => {
                self.state = State::Open;
                continue_if_ok(result_of(outcome))
            }
            (
                State::WaitOpen,
                SftpEvent::AskHostKey {
                    host,
                    port,
                    fingerprint,
                    changed,
                },
            ) => self.on_host_key(host, port, fingerprint, changed, session, cx),
            (State::WaitOpen, SftpEvent::AskPassword(challenge)) => {
                self.on_password(challenge, session, cx)
            }
            (State::WaitOpen, SftpEvent::Reply(text)) => {
                cx.log.log(MessageType::Response, text);
                Reply::WOULDBLOCK
            }
            (State::WaitOpen, SftpEvent::Done(outcome)) => {
                let result = result_of(outcome);
                if !result.is_ok() {
                    if self.password_sent {
                        return result | ReplyFlags::PASSWORDFAILED;
                    }
                    return result;
                }
                session.connected = true;
                cx.log.status(format!("Connected to {}", self.site.server));
                cx.post(Notification::Encryption(session.encryption.clone()));
                self.state = State::WaitCwd;
                cx.push(Box::new(ChangeDirOp::new(ServerPath::default(), "")));
                Reply::CONTINUE
            }
            (_, event) => {
                log_unexpected(cx, &event);
                Reply::WOULDBLOCK
            }
        }
    }
}

impl Operation<SftpSession> for ConnectOp {
    op_meta!();

    fn send(&mut self, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        match self.state {
            State::Spawn => self.spawn(session, cx),
            State::Proxy => self.proxy(session, cx),
            State::KeyFile => self.key_file(session, cx),
            State::Open => self.open(session, cx),
            State::Greeting
            | State::WaitProxy
            | State::WaitKeyFile
            | State::WaitOpen
            | State::WaitHostKey
            | State::WaitPassword
            | State::WaitCwd => Reply::WOULDBLOCK,
        }
    }

    fn parse_response(&mut self, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        drain(session, cx, |event, session, cx| self.on_event(event, session, cx))
    }

    fn subcommand_result(
        &mut self,
        result: Reply,
        _child: &dyn Operation<SftpSession>,
        _session: &mut SftpSession,
        cx: &mut SftpContext,
    ) -> Reply {
        if result.has(ReplyFlags::DISCONNECTED) {
            return result;
        }
        if !result.is_ok() {
            cx.log.log(
                MessageType::DebugWarning,
                "Could not determine the working directory",
            );
        }
        Reply::OK
    }

    fn on_async_reply(
        &mut self,
        request: AsyncRequest,
        session: &mut SftpSession,
        cx: &mut SftpContext,
    ) -> Reply {
        match (self.state, request.reply) {
            (State::WaitHostKey, Some(AsyncReply::HostKey { trust, always })) => {
                let Some(key) = self.offered_key.take() else {
                    return Reply::ERROR | ReplyFlags::INTERNALERROR;
                };
                if !trust {
                    cx.log.error("Host key rejected");
                    return Reply::CRITICAL_ERROR;
                }
                if always {
                    cx.engine
                        .host_keys
                        .trust(&key.host, key.port, &key.fingerprint);
                }
                self.state = State::WaitOpen;
                session.send_answer(cx, "y");
                Reply::WOULDBLOCK
            }
            (State::WaitPassword, Some(AsyncReply::InteractiveLogin(answer))) => {
                let Some(answer) = answer else {
                    return Reply::CRITICAL_ERROR | ReplyFlags::PASSWORDFAILED;
                };
                self.state = State::WaitOpen;
                self.password_sent = true;
                session.send_secret(cx, answer.expose_secret());
                Reply::WOULDBLOCK
            }
            _ => Reply::ERROR | ReplyFlags::INTERNALERROR,
        }
    }

    fn reset(&mut self, result: Reply, session: &mut SftpSession, _cx: &mut SftpContext) -> Reply {
        if result.is_ok() {
            return result;
        }
        session.stop();
        result | ReplyFlags::DISCONNECTED
    }
}

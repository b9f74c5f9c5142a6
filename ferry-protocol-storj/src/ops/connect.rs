use std::collections::VecDeque;

use ferry_common::{CommandId, OptionId, Reply, ReplyFlags, Site};
use ferry_core::operation::{OpMeta, Operation};

use super::{drain, log_unexpected, op_meta, result_of};
use crate::event::{quote, StorjEvent};
use crate::session::{StorjContext, StorjSession};

const PROTOCOL_VERSION: &str = "protocol_version=1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Spawn,
    Greeting,
    Setup,
    WaitSetup,
}

/// Starts the helper and hands it the satellite, the API key and the
/// encryption passphrase. `validate` checks them against the satellite.
pub struct ConnectOp {
    meta: OpMeta,
    state: State,
    site: Site,
    /// Lines still to send with what the log shows for them
    setup: VecDeque<(String, String)>,
}

impl ConnectOp {
    pub fn new(site: Site) -> Self {
        Self {
            meta: OpMeta::new("ConnectOp", CommandId::Connect),
            state: State::Spawn,
            site,
            setup: VecDeque::new(),
        }
    }

    fn setup_lines(&self, cx: &StorjContext) -> VecDeque<(String, String)> {
        let server = &self.site.server;
        let host = format!("host {}", quote(&server.authority()));
        let key = format!("key {}", quote(&server.user));
        let pass = format!("pass {}", quote(cx.credentials.password.expose_secret()));
        VecDeque::from([
            (host.clone(), host),
            (key, "key ****".to_owned()),
            (pass, "pass ****".to_owned()),
            ("validate".to_owned(), "validate".to_owned()),
        ])
    }

    fn on_event(&mut self, event: StorjEvent, session: &mut StorjSession, cx: &mut StorjContext) -> Reply {
        match (self.state, event) {
            (State::Greeting, StorjEvent::Reply(text)) => {
                if !text.contains(PROTOCOL_VERSION) {
                    cx.log
                        .error(format!("The Storj helper speaks an unknown protocol: {text}"));
                    return Reply::CRITICAL_ERROR;
                }
                self.setup = self.setup_lines(cx);
                self.state = State::Setup;
                Reply::CONTINUE
            }
            (State::WaitSetup, StorjEvent::Done(outcome)) => {
                let result = result_of(outcome);
                if !result.is_ok() && self.setup.is_empty() {
                    cx.log.error("The satellite rejected the API key or passphrase");
                    return Reply::CRITICAL_ERROR | ReplyFlags::PASSWORDFAILED;
                }
                if !result.is_ok() {
                    return Reply::CRITICAL_ERROR;
                }
                if !self.setup.is_empty() {
                    self.state = State::Setup;
                    return Reply::CONTINUE;
                }
                session.connected = true;
                cx.log.status(format!("Connected to {}", self.site.server));
                Reply::OK
            }
            (_, event) => {
                log_unexpected(cx, &event);
                Reply::WOULDBLOCK
            }
        }
    }
}

impl Operation<StorjSession> for ConnectOp {
    op_meta!();

    fn send(&mut self, session: &mut StorjSession, cx: &mut StorjContext) -> Reply {
        match self.state {
            State::Spawn => {
                let program = cx.options().get_string(OptionId::StorjHelper);
                cx.log.status(format!("Connecting to {}...", self.site.server));
                if let Err(error) = session.start(&program, cx) {
                    cx.log.error(format!("Cannot start the Storj helper: {error}"));
                    return Reply::CRITICAL_ERROR;
                }
                self.state = State::Greeting;
                Reply::WOULDBLOCK
            }
            State::Setup => {
                let Some((line, shown)) = self.setup.pop_front() else {
                    return Reply::ERROR | ReplyFlags::INTERNALERROR;
                };
                self.state = State::WaitSetup;
                if session.send_command(cx, self.meta.send_log_level, &line, &shown) {
                    Reply::WOULDBLOCK
                } else {
                    Reply::ERROR | ReplyFlags::DISCONNECTED
                }
            }
            State::Greeting | State::WaitSetup => Reply::WOULDBLOCK,
        }
    }

    fn parse_response(&mut self, session: &mut StorjSession, cx: &mut StorjContext) -> Reply {
        drain(session, cx, |event, session, cx| self.on_event(event, session, cx))
    }

    fn reset(&mut self, result: Reply, session: &mut StorjSession, _cx: &mut StorjContext) -> Reply {
        if result.is_ok() {
            return result;
        }
        session.stop();
        result | ReplyFlags::DISCONNECTED
    }
}

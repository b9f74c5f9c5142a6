use ferry_common::{CommandId, Reply, ServerPath};
use ferry_core::operation::{OpMeta, Operation};

use super::{drain, log_unexpected, op_meta, result_of, reset_on_error, send_command};
use crate::event::{quote, SftpEvent};
use crate::session::{SftpContext, SftpSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Cd,
    Pwd,
    WaitPwd,
}

/// `cd` followed by `pwd`, keeping [SftpSession::current_path] in sync
/// with the helper. An empty `path` only learns the current directory.
pub struct ChangeDirOp {
    meta: OpMeta,
    state: State,
    path: ServerPath,
    subdir: String,
    reported: Option<ServerPath>,
}

impl ChangeDirOp {
    pub fn new(path: ServerPath, subdir: impl Into<String>) -> Self {
        Self {
            meta: OpMeta::new("cwd", CommandId::Private1),
            state: State::Init,
            path,
            subdir: subdir.into(),
            reported: None,
        }
    }

    fn on_event(&mut self, event: SftpEvent, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        match (self.state, event) {
            (State::Cd, SftpEvent::Done(outcome)) => {
                let result = result_of(outcome);
                if !result.is_ok() {
                    session.current_path = ServerPath::default();
                    return result;
                }
                self.state = State::Pwd;
                Reply::CONTINUE
            }
            (State::WaitPwd, SftpEvent::Reply(text)) => {
                self.reported = parse_pwd(&text);
                Reply::WOULDBLOCK
            }
            (State::WaitPwd, SftpEvent::Done(outcome)) => {
                let result = result_of(outcome);
                if !result.is_ok() {
                    return result;
                }
                match self.reported.take() {
                    Some(path) => {
                        session.current_path = path;
                        Reply::OK
                    }
                    None => {
                        cx.log.error("Helper did not report the working directory");
                        Reply::ERROR
                    }
                }
            }
            (_, event) => {
                log_unexpected(cx, &event);
                Reply::WOULDBLOCK
            }
        }
    }
}

impl Operation<SftpSession> for ChangeDirOp {
    op_meta!();

    fn send(&mut self, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        match self.state {
            State::Init => {
                if self.path.is_empty() {
                    if !session.current_path.is_empty() {
                        return Reply::OK;
                    }
                    self.state = State::WaitPwd;
                    return send_command(session, cx, &self.meta, "pwd");
                }
                let target = if self.subdir.is_empty() {
                    Some(self.path.clone())
                } else {
                    self.path.change_path(&self.subdir)
                };
                let Some(target) = target else {
                    return Reply::ERROR;
                };
                if target == session.current_path {
                    return Reply::OK;
                }
                self.state = State::Cd;
                send_command(session, cx, &self.meta, &format!("cd {}", quote(&target.to_string())))
            }
            State::Pwd => {
                self.state = State::WaitPwd;
                send_command(session, cx, &self.meta, "pwd")
            }
            State::Cd | State::WaitPwd => Reply::WOULDBLOCK,
        }
    }

    fn parse_response(&mut self, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        drain(session, cx, |event, session, cx| self.on_event(event, session, cx))
    }

    fn reset(&mut self, result: Reply, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        reset_on_error(result, session, cx)
    }
}

/// The helper answers `pwd` with the quoted path.
fn parse_pwd(text: &str) -> Option<ServerPath> {
    let text = text.trim();
    let Some(inner) = text.strip_prefix('"').and_then(|t| t.strip_suffix('"')) else {
        return ServerPath::parse(text);
    };
    ServerPath::parse(&inner.replace("\"\"", "\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pwd_answers() {
        assert_eq!(parse_pwd("\"/home/u\""), ServerPath::parse("/home/u"));
        assert_eq!(parse_pwd("\"/a \"\"b\"\"\""), ServerPath::parse("/a \"b\""));
        assert_eq!(parse_pwd("/plain"), ServerPath::parse("/plain"));
        assert_eq!(parse_pwd("relative"), None);
    }
}

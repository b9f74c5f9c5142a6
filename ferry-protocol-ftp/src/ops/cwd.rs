use ferry_common::{CommandId, Reply, ServerPath};
use ferry_core::operation::{OpMeta, Operation};

use super::{log_unexpected, op_meta, send_command};
use crate::session::{FtpContext, FtpSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Cwd,
    Pwd,
    WaitPwd,
}

/// Makes `path`/`subdir` the server's working directory and keeps
/// [FtpSession::current_path] in sync. An empty `path` only learns the
/// current directory.
pub struct ChangeDirOp {
    meta: OpMeta,
    state: State,
    path: ServerPath,
    subdir: String,
    target: Option<ServerPath>,
}

impl ChangeDirOp {
    pub fn new(path: ServerPath, subdir: impl Into<String>) -> Self {
        Self {
            meta: OpMeta::new("cwd", CommandId::Private1),
            state: State::Init,
            path,
            subdir: subdir.into(),
            target: None,
        }
    }

    /// Where the operation wanted to go.
    pub fn target(&self) -> Option<&ServerPath> {
        self.target.as_ref()
    }
}

impl Operation<FtpSession> for ChangeDirOp {
    op_meta!();

    fn send(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
        match self.state {
            State::Init => {
                if self.path.is_empty() {
                    if !session.current_path.is_empty() {
                        return Reply::OK;
                    }
                    self.state = State::WaitPwd;
                    return send_command(session, cx, &self.meta, "PWD");
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
                self.state = State::Cwd;
                let command = format!("CWD {target}");
                self.target = Some(target);
                send_command(session, cx, &self.meta, &command)
            }
            State::Pwd => {
                self.state = State::WaitPwd;
                send_command(session, cx, &self.meta, "PWD")
            }
            State::Cwd | State::WaitPwd => Reply::WOULDBLOCK,
        }
    }

    fn parse_response(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
        let reply = session.take_reply();
        match self.state {
            State::Cwd => {
                if !reply.is_success() {
                    session.current_path = ServerPath::default();
                    return Reply::ERROR;
                }
                session.current_path = self.target.clone().unwrap_or_default();
                self.state = State::Pwd;
                Reply::CONTINUE
            }
            State::WaitPwd => {
                if reply.code == 257 {
                    if let Some(path) = parse_pwd_reply(reply.text()) {
                        session.current_path = path;
                        return Reply::OK;
                    }
                }
                // Keep the path we changed to when the server's answer is
                // unusable
                if session.current_path.is_empty() {
                    Reply::ERROR
                } else {
                    Reply::OK
                }
            }
            State::Init | State::Pwd => {
                log_unexpected(cx, self.state);
                Reply::ERROR
            }
        }
    }
}

/// Path of a `257` reply: the text between the first quote and its
/// closing quote, with doubled quotes collapsed.
pub fn parse_pwd_reply(text: &str) -> Option<ServerPath> {
    let Some(start) = text.find('"') else {
        return text.split_whitespace().next().and_then(ServerPath::parse);
    };
    let mut path = String::new();
    let mut chars = text[start + 1..].chars().peekable();
    while let Some(c) = chars.next() {
        if c != '"' {
            path.push(c);
        } else if chars.peek() == Some(&'"') {
            chars.next();
            path.push('"');
        } else {
            return ServerPath::parse(&path);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pwd_replies() {
        assert_eq!(
            parse_pwd_reply("\"/home/alice\" is the current directory"),
            ServerPath::parse("/home/alice")
        );
        assert_eq!(
            parse_pwd_reply("\"/say \"\"hi\"\"\" created"),
            ServerPath::parse("/say \"hi\"")
        );
        assert_eq!(parse_pwd_reply("/pub is current"), ServerPath::parse("/pub"));
        assert_eq!(parse_pwd_reply("\"unterminated"), None);
        assert_eq!(parse_pwd_reply("\"relative\""), None);
    }
}

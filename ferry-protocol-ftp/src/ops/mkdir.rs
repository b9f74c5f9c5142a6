use ferry_common::{CommandId, DirEntry, Reply, ReplyFlags, ServerPath};
use ferry_core::lock_manager::LockReason;
use ferry_core::operation::{OpMeta, Operation};

use super::{log_unexpected, op_meta, send_command, ChangeDirOp};
use crate::session::{FtpContext, FtpSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    FindExisting,
    WaitFindExisting,
    Make,
    WaitMkd,
    WaitEnter,
}

/// Creates a directory and any missing parents. Walks up from the target
/// with `CWD` until a directory exists, then alternates `MKD` and `CWD`
/// downwards.
pub struct MkdirOp {
    meta: OpMeta,
    state: State,
    path: ServerPath,
    /// Deepest directory known to exist
    existing: ServerPath,
    candidate: ServerPath,
}

impl MkdirOp {
    pub fn new(path: ServerPath) -> Self {
        Self {
            meta: OpMeta::new("mkdir", CommandId::Mkdir),
            state: State::Init,
            existing: ServerPath::default(),
            candidate: path.clone(),
            path,
        }
    }

    /// The directory `MKD` should create next.
    fn next_dir(&self) -> Option<ServerPath> {
        let depth = self.existing.segments().len();
        self.path
            .segments()
            .get(depth)
            .map(|segment| self.existing.add_segment(segment))
    }
}

impl Operation<FtpSession> for MkdirOp {
    op_meta!();

    fn send(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
        match self.state {
            State::Init => {
                let path = self.path.clone();
                if !cx.try_lock(&mut self.meta, LockReason::Mkdir, &path, false) {
                    return Reply::WOULDBLOCK;
                }
                self.state = State::FindExisting;
                Reply::CONTINUE
            }
            State::FindExisting => {
                self.state = State::WaitFindExisting;
                cx.push(Box::new(ChangeDirOp::new(self.candidate.clone(), "")));
                Reply::CONTINUE
            }
            State::Make => {
                let Some(dir) = self.next_dir() else {
                    cx.log.status(format!("Created directory {}", self.path));
                    return Reply::OK;
                };
                self.state = State::WaitMkd;
                let command = format!("MKD {dir}");
                send_command(session, cx, &self.meta, &command)
            }
            State::WaitFindExisting | State::WaitMkd | State::WaitEnter => Reply::WOULDBLOCK,
        }
    }

    fn parse_response(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
        let reply = session.take_reply();
        if self.state != State::WaitMkd {
            log_unexpected(cx, self.state);
            return Reply::ERROR;
        }
        // The directory may exist already; entering it decides
        let Some(dir) = self.next_dir() else {
            return Reply::ERROR | ReplyFlags::INTERNALERROR;
        };
        if reply.is_success() {
            if let (Some(key), Some(parent), Some(name)) =
                (cx.server_key(), dir.parent(), dir.last_segment())
            {
                cx.engine
                    .directory_cache
                    .update_file(&key, &parent, DirEntry::dir(name));
            }
        }
        self.state = State::WaitEnter;
        cx.push(Box::new(ChangeDirOp::new(dir, "")));
        Reply::CONTINUE
    }

    fn subcommand_result(
        &mut self,
        result: Reply,
        _child: &dyn Operation<FtpSession>,
        _session: &mut FtpSession,
        _cx: &mut FtpContext,
    ) -> Reply {
        if result.has(ReplyFlags::DISCONNECTED) {
            return result;
        }
        match self.state {
            State::WaitFindExisting => {
                if result.is_ok() {
                    self.existing = self.candidate.clone();
                    self.state = State::Make;
                    return Reply::CONTINUE;
                }
                match self.candidate.parent() {
                    Some(parent) => {
                        self.candidate = parent;
                        self.state = State::FindExisting;
                        Reply::CONTINUE
                    }
                    None => Reply::ERROR,
                }
            }
            State::WaitEnter => {
                if !result.is_ok() {
                    return Reply::ERROR;
                }
                if let Some(dir) = self.next_dir() {
                    self.existing = dir;
                }
                self.state = State::Make;
                Reply::CONTINUE
            }
            _ => Reply::ERROR | ReplyFlags::INTERNALERROR,
        }
    }

    fn reset(&mut self, result: Reply, session: &mut FtpSession, _cx: &mut FtpContext) -> Reply {
        if !result.is_ok() {
            session.abandon_replies();
        }
        result
    }
}

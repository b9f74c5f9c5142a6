use ferry_common::{
    CommandId, DirectoryListing, ListCommand, ListFlags, MessageType, OptionId, Reply, ReplyFlags,
    ServerPath,
};
use ferry_core::capabilities::{Capability, CapabilityState};
use ferry_core::lock_manager::LockReason;
use ferry_core::operation::{OpMeta, Operation};

use super::{op_meta, ChangeDirOp, RawTransferOp, RawTransferRequest};
use crate::listing::{parse_listing, ListingFormat};
use crate::session::{FtpContext, FtpSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    WaitCwd,
    Lock,
    WaitTransfer,
}

/// Fetches a directory listing, from the cache when allowed, and announces
/// it with a `DirectoryListing` notification.
pub struct ListOp {
    meta: OpMeta,
    state: State,
    command: ListCommand,
    /// Directory actually listed
    path: ServerPath,
    mlsd: bool,
    fell_back: bool,
}

impl ListOp {
    pub fn new(command: ListCommand) -> Self {
        Self {
            meta: OpMeta::new("list", CommandId::List),
            state: State::Init,
            command,
            path: ServerPath::default(),
            mlsd: false,
            fell_back: false,
        }
    }

    fn requested_path(&self) -> Option<ServerPath> {
        if self.command.path.is_empty() {
            return None;
        }
        if self.command.subdir.is_empty() {
            Some(self.command.path.clone())
        } else {
            self.command.path.change_path(&self.command.subdir)
        }
    }

    /// Answers from the cache when the flags allow it.
    fn from_cache(&self, cx: &FtpContext) -> bool {
        let flags = self.command.flags;
        if flags.contains(ListFlags::REFRESH) || flags.contains(ListFlags::CLEAR_CACHE) {
            return false;
        }
        let Some(key) = cx.server_key() else {
            return false;
        };
        match cx.engine.directory_cache.lookup(&key, &self.path) {
            Some(listing) if !listing.unsure || flags.contains(ListFlags::AVOID) => {
                cx.log.log(
                    MessageType::DebugInfo,
                    format!("Using cached listing of {}", self.path),
                );
                true
            }
            _ => false,
        }
    }

    fn start_transfer(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
        self.mlsd = session.capability(cx, Capability::Mlsd) == CapabilityState::Yes;
        let command = if self.mlsd {
            "MLSD"
        } else if session.capability(cx, Capability::ListHiddenFiles) == CapabilityState::Yes {
            "LIST -a"
        } else {
            "LIST"
        };
        self.state = State::WaitTransfer;
        cx.push(Box::new(RawTransferOp::new(RawTransferRequest::list(command))));
        Reply::CONTINUE
    }

    fn store(&self, data: &[u8], cx: &FtpContext) {
        if cx.options().get_bool(OptionId::LoggingRawListing) {
            for line in String::from_utf8_lossy(data).lines() {
                cx.log.log(MessageType::RawList, line);
            }
        }
        let timezone = cx
            .server
            .as_ref()
            .map(|s| s.timezone_offset_minutes)
            .unwrap_or_default();
        let (entries, rejected) = parse_listing(data, &ListingFormat::new(self.mlsd, timezone));
        for line in rejected {
            cx.log
                .log(MessageType::DebugInfo, format!("Unparsable listing line: {line}"));
        }
        if let Some(key) = cx.server_key() {
            cx.engine
                .directory_cache
                .store(&key, DirectoryListing::new(self.path.clone(), entries));
        }
    }

    fn fail(&self, cx: &FtpContext, reply: Reply) -> Reply {
        let path = self.requested_path().unwrap_or_else(|| self.path.clone());
        cx.notify_listing(path, true, true);
        reply
    }
}

impl Operation<FtpSession> for ListOp {
    op_meta!();

    fn send(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
        match self.state {
            State::Init => {
                if let Some(path) = self.requested_path() {
                    if !cx.try_lock(&mut self.meta, LockReason::List, &path, false) {
                        return Reply::WOULDBLOCK;
                    }
                }
                if self.command.flags.contains(ListFlags::CLEAR_CACHE) {
                    if let Some(key) = cx.server_key() {
                        cx.engine.directory_cache.invalidate_server(&key);
                    }
                }
                self.state = State::WaitCwd;
                cx.push(Box::new(ChangeDirOp::new(
                    self.command.path.clone(),
                    self.command.subdir.clone(),
                )));
                Reply::CONTINUE
            }
            State::Lock => {
                self.path = session.current_path.clone();
                if !cx.try_lock(&mut self.meta, LockReason::List, &self.path, false) {
                    return Reply::WOULDBLOCK;
                }
                if self.from_cache(cx) {
                    cx.notify_listing(self.path.clone(), true, false);
                    return Reply::OK;
                }
                self.start_transfer(session, cx)
            }
            State::WaitCwd | State::WaitTransfer => Reply::WOULDBLOCK,
        }
    }

    fn subcommand_result(
        &mut self,
        result: Reply,
        child: &dyn Operation<FtpSession>,
        session: &mut FtpSession,
        cx: &mut FtpContext,
    ) -> Reply {
        match self.state {
            State::WaitCwd => {
                if result.is_ok() {
                    self.state = State::Lock;
                    return Reply::CONTINUE;
                }
                if result.has(ReplyFlags::DISCONNECTED) {
                    return self.fail(cx, result);
                }
                if self.command.flags.contains(ListFlags::LINK) {
                    return self.fail(cx, Reply::ERROR | ReplyFlags::LINKNOTDIR);
                }
                if self.command.flags.contains(ListFlags::FALLBACK_CURRENT) && !self.fell_back {
                    self.fell_back = true;
                    cx.push(Box::new(ChangeDirOp::new(ServerPath::default(), "")));
                    return Reply::CONTINUE;
                }
                self.fail(cx, result)
            }
            State::WaitTransfer => {
                let Some(transfer) = child.downcast_ref::<RawTransferOp>() else {
                    return Reply::ERROR | ReplyFlags::INTERNALERROR;
                };
                if result.is_ok() {
                    self.store(transfer.data().map(|d| &d[..]).unwrap_or_default(), cx);
                    cx.log.status(format!(
                        "Directory listing of \"{}\" successful",
                        self.path
                    ));
                    cx.notify_listing(self.path.clone(), true, false);
                    return Reply::OK;
                }
                let unknown_command = matches!(transfer.final_code(), Some(500 | 502));
                if self.mlsd && unknown_command && !result.has(ReplyFlags::DISCONNECTED) {
                    session.set_capability(cx, Capability::Mlsd, CapabilityState::No);
                    return self.start_transfer(session, cx);
                }
                self.fail(cx, result)
            }
            State::Init | State::Lock => Reply::ERROR | ReplyFlags::INTERNALERROR,
        }
    }
}

use chrono::{DateTime, Utc};
use ferry_common::{
    CommandId, DirEntry, DirectoryListing, ListCommand, ListFlags, MessageType, OptionId, Reply,
    ReplyFlags, ServerPath,
};
use ferry_core::lock_manager::LockReason;
use ferry_core::operation::{OpMeta, Operation};

use super::{
    drain, log_unexpected, op_meta, reset_on_error, result_of, send_command, ChangeDirOp,
};
use crate::event::SftpEvent;
use crate::session::{SftpContext, SftpSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    WaitCwd,
    Lock,
    WaitList,
}

/// Lists a directory through `cd` and `ls`, from the cache when allowed.
pub struct ListOp {
    meta: OpMeta,
    state: State,
    command: ListCommand,
    path: ServerPath,
    entries: Vec<DirEntry>,
    fell_back: bool,
}

impl ListOp {
    pub fn new(command: ListCommand) -> Self {
        Self {
            meta: OpMeta::new("list", CommandId::List),
            state: State::Init,
            command,
            path: ServerPath::default(),
            entries: vec![],
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

    fn from_cache(&self, cx: &SftpContext) -> bool {
        let flags = self.command.flags;
        if flags.intersects(ListFlags::REFRESH | ListFlags::CLEAR_CACHE) {
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

    fn fail(&self, cx: &SftpContext, reply: Reply) -> Reply {
        let path = self.requested_path().unwrap_or_else(|| self.path.clone());
        cx.notify_listing(path, true, true);
        reply
    }

    fn on_event(&mut self, event: SftpEvent, cx: &mut SftpContext) -> Reply {
        match event {
            SftpEvent::ListEntry { line, time, name } if self.state == State::WaitList => {
                if cx.options().get_bool(OptionId::LoggingRawListing) {
                    cx.log.log(MessageType::RawList, line.as_str());
                }
                match parse_entry(&line, time, name) {
                    Some(entry) => self.entries.push(entry),
                    None => cx
                        .log
                        .log(MessageType::DebugInfo, format!("Unparsable listing line: {line}")),
                }
                Reply::WOULDBLOCK
            }
            SftpEvent::Done(outcome) if self.state == State::WaitList => {
                let result = result_of(outcome);
                if !result.is_ok() {
                    return self.fail(cx, result);
                }
                if let Some(key) = cx.server_key() {
                    let entries = std::mem::take(&mut self.entries);
                    cx.engine
                        .directory_cache
                        .store(&key, DirectoryListing::new(self.path.clone(), entries));
                }
                cx.log
                    .status(format!("Directory listing of \"{}\" successful", self.path));
                cx.notify_listing(self.path.clone(), true, false);
                Reply::OK
            }
            event => {
                log_unexpected(cx, &event);
                Reply::WOULDBLOCK
            }
        }
    }
}

impl Operation<SftpSession> for ListOp {
    op_meta!();

    fn send(&mut self, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
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
                self.state = State::WaitList;
                self.entries.clear();
                send_command(session, cx, &self.meta, "ls")
            }
            State::WaitCwd | State::WaitList => Reply::WOULDBLOCK,
        }
    }

    fn parse_response(&mut self, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        drain(session, cx, |event, _, cx| self.on_event(event, cx))
    }

    fn subcommand_result(
        &mut self,
        result: Reply,
        _child: &dyn Operation<SftpSession>,
        _session: &mut SftpSession,
        cx: &mut SftpContext,
    ) -> Reply {
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

    fn reset(&mut self, result: Reply, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        reset_on_error(result, session, cx)
    }
}

/// Builds an entry from the `ls -l` style line the helper sends next to
/// the bare name: permissions, link count, owner, group, size, date.
fn parse_entry(line: &str, time: Option<DateTime<Utc>>, name: String) -> Option<DirEntry> {
    let fields: Vec<&str> = line.split_whitespace().take(5).collect();
    let [permissions, _, owner, group, size] = fields[..] else {
        return None;
    };
    let kind = permissions.chars().next()?;
    let size = size.parse::<i64>().ok()?;
    let link_target = (kind == 'l')
        .then(|| line.split_once(" -> ").map(|(_, target)| target.to_owned()))
        .flatten();
    Some(DirEntry {
        name,
        size,
        is_dir: kind == 'd',
        is_link: kind == 'l',
        link_target,
        time,
        permissions: permissions.to_owned(),
        owner_group: format!("{owner} {group}"),
        unsure: false,
    })
}

use chrono::{DateTime, Utc};
use ferry_common::{
    CommandId, DirEntry, DirectoryListing, ListCommand, ListFlags, MessageType, Reply, ServerPath,
};
use ferry_core::lock_manager::LockReason;
use ferry_core::operation::{OpMeta, Operation};

use super::{
    bucket_and_prefix, drain, log_unexpected, op_meta, reset_on_error, result_of, send_command,
};
use crate::event::{quote, StorjEvent};
use crate::session::{StorjContext, StorjSession};

/// Lists the buckets at the root and the objects and prefixes below a
/// prefix elsewhere. There is no working directory; an unknown path means
/// the root.
pub struct ListOp {
    meta: OpMeta,
    command: ListCommand,
    path: ServerPath,
    entries: Vec<DirEntry>,
    sent: bool,
}

impl ListOp {
    pub fn new(command: ListCommand) -> Self {
        Self {
            meta: OpMeta::new("list", CommandId::List),
            command,
            path: ServerPath::root(),
            entries: vec![],
            sent: false,
        }
    }

    fn resolve(&self) -> Option<ServerPath> {
        let base = if self.command.path.is_empty() {
            ServerPath::root()
        } else {
            self.command.path.clone()
        };
        if self.command.subdir.is_empty() {
            Some(base)
        } else {
            base.change_path(&self.command.subdir)
        }
    }

    fn cached(&self, cx: &StorjContext) -> bool {
        let flags = self.command.flags;
        if flags.intersects(ListFlags::REFRESH | ListFlags::CLEAR_CACHE) {
            return false;
        }
        let Some(key) = cx.server_key() else {
            return false;
        };
        cx.engine
            .directory_cache
            .lookup(&key, &self.path)
            .is_some_and(|listing| !listing.unsure || flags.contains(ListFlags::AVOID))
    }

    fn on_event(&mut self, event: StorjEvent, cx: &mut StorjContext) -> Reply {
        match event {
            StorjEvent::ListEntry { name, size, time } => {
                self.entries.push(entry(name, size, time));
                Reply::WOULDBLOCK
            }
            StorjEvent::Done(outcome) => {
                let result = result_of(outcome);
                if !result.is_ok() {
                    cx.notify_listing(self.path.clone(), true, true);
                    return result;
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

impl Operation<StorjSession> for ListOp {
    op_meta!();

    fn send(&mut self, session: &mut StorjSession, cx: &mut StorjContext) -> Reply {
        if self.sent {
            return Reply::WOULDBLOCK;
        }
        let Some(path) = self.resolve() else {
            cx.log.error(format!("Invalid path {}", self.command.subdir));
            return Reply::ERROR;
        };
        self.path = path;
        let path = self.path.clone();
        if !cx.try_lock(&mut self.meta, LockReason::List, &path, false) {
            return Reply::WOULDBLOCK;
        }
        if self.command.flags.contains(ListFlags::CLEAR_CACHE) {
            if let Some(key) = cx.server_key() {
                cx.engine.directory_cache.invalidate_server(&key);
            }
        }
        if self.cached(cx) {
            cx.log.log(
                MessageType::DebugInfo,
                format!("Using cached listing of {}", self.path),
            );
            cx.notify_listing(self.path.clone(), true, false);
            return Reply::OK;
        }
        let Some((bucket, prefix)) = bucket_and_prefix(&self.path) else {
            return Reply::ERROR;
        };
        self.sent = true;
        cx.log.status(format!("Retrieving directory listing of \"{}\"...", self.path));
        send_command(
            session,
            cx,
            &self.meta,
            &format!("list {} {}", quote(&bucket), quote(&prefix)),
        )
    }

    fn parse_response(&mut self, session: &mut StorjSession, cx: &mut StorjContext) -> Reply {
        drain(session, cx, |event, _, cx| self.on_event(event, cx))
    }

    fn reset(&mut self, result: Reply, session: &mut StorjSession, cx: &mut StorjContext) -> Reply {
        reset_on_error(result, session, cx)
    }
}

/// Names ending in `/` are prefixes, shown as directories.
fn entry(name: String, size: Option<u64>, time: Option<DateTime<Utc>>) -> DirEntry {
    match name.strip_suffix('/') {
        Some(dir) => DirEntry {
            time,
            ..DirEntry::dir(dir)
        },
        None => DirEntry {
            time,
            ..DirEntry::file(name, size.map(|s| s as i64).unwrap_or(-1))
        },
    }
}

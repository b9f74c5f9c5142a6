//! Operations made of single helper commands on full paths.

use ferry_common::{CommandId, DirEntry, MessageType, Reply, ServerPath};
use ferry_core::lock_manager::LockReason;
use ferry_core::operation::{OpMeta, Operation};

use super::{drain, log_unexpected, op_meta, reset_on_error, result_of, send_command};
use crate::event::{quote, Outcome, SftpEvent};
use crate::session::{SftpContext, SftpSession};

/// Waits for the `Done` of the one command in flight.
fn take_done(session: &mut SftpSession, cx: &mut SftpContext) -> Option<Outcome> {
    let mut done = None;
    drain(session, cx, |event, _, cx| match event {
        SftpEvent::Done(outcome) => {
            done = Some(outcome);
            Reply::OK
        }
        SftpEvent::Reply(text) => {
            cx.log.log(MessageType::Response, text);
            Reply::WOULDBLOCK
        }
        event => {
            log_unexpected(cx, &event);
            Reply::WOULDBLOCK
        }
    });
    done
}

/// Creates a directory. If that fails, every ancestor is created from the
/// top down; only the result of the last one counts.
pub struct MkdirOp {
    meta: OpMeta,
    path: ServerPath,
    /// Directories still to create, shallowest first
    queue: Vec<ServerPath>,
    walked: bool,
    pending: bool,
}

impl MkdirOp {
    pub fn new(path: ServerPath) -> Self {
        Self {
            meta: OpMeta::new("mkdir", CommandId::Mkdir),
            queue: vec![path.clone()],
            path,
            walked: false,
            pending: false,
        }
    }

    fn ancestors(&self) -> Vec<ServerPath> {
        let mut chain = vec![];
        let mut dir = Some(self.path.clone());
        while let Some(path) = dir.filter(|p| p.has_parent()) {
            dir = path.parent();
            chain.push(path);
        }
        chain.reverse();
        chain
    }

    fn created(&self, dir: &ServerPath, cx: &SftpContext) {
        let (Some(key), Some(parent), Some(name)) = (cx.server_key(), dir.parent(), dir.last_segment())
        else {
            return;
        };
        cx.engine
            .directory_cache
            .update_file(&key, &parent, DirEntry::dir(name));
    }
}

impl Operation<SftpSession> for MkdirOp {
    op_meta!();

    fn send(&mut self, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        if self.pending {
            return Reply::WOULDBLOCK;
        }
        let path = self.path.clone();
        if !cx.try_lock(&mut self.meta, LockReason::Mkdir, &path, false) {
            return Reply::WOULDBLOCK;
        }
        let Some(next) = self.queue.first() else {
            return Reply::ERROR | ferry_common::ReplyFlags::INTERNALERROR;
        };
        let command = format!("mkdir {}", quote(&next.to_string()));
        self.pending = true;
        send_command(session, cx, &self.meta, &command)
    }

    fn parse_response(&mut self, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        let Some(outcome) = take_done(session, cx) else {
            return Reply::WOULDBLOCK;
        };
        self.pending = false;
        let dir = self.queue.remove(0);
        let result = result_of(outcome);
        if result.is_ok() {
            self.created(&dir, cx);
        }
        if !self.queue.is_empty() {
            return Reply::CONTINUE;
        }
        if result.is_ok() || self.walked || result.is_critical() {
            return result;
        }
        self.walked = true;
        self.queue = self.ancestors();
        cx.log.log(
            MessageType::DebugInfo,
            format!("Creating the parents of {} first", self.path),
        );
        Reply::CONTINUE
    }

    fn reset(&mut self, result: Reply, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        reset_on_error(result, session, cx)
    }
}

pub struct RemoveDirOp {
    meta: OpMeta,
    path: ServerPath,
    subdir: String,
    sent: bool,
}

impl RemoveDirOp {
    pub fn new(path: ServerPath, subdir: String) -> Self {
        Self {
            meta: OpMeta::new("rmdir", CommandId::RemoveDir),
            path,
            subdir,
            sent: false,
        }
    }
}

impl Operation<SftpSession> for RemoveDirOp {
    op_meta!();

    fn send(&mut self, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        if self.sent {
            return Reply::WOULDBLOCK;
        }
        let Some(full) = self.path.change_path(&self.subdir) else {
            return Reply::ERROR;
        };
        if !cx.try_lock(&mut self.meta, LockReason::RemoveDir, &full, true) {
            return Reply::WOULDBLOCK;
        }
        self.sent = true;
        send_command(session, cx, &self.meta, &format!("rmdir {}", quote(&full.to_string())))
    }

    fn parse_response(&mut self, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        let Some(outcome) = take_done(session, cx) else {
            return Reply::WOULDBLOCK;
        };
        let result = result_of(outcome);
        if !result.is_ok() {
            return result;
        }
        if let Some(key) = cx.server_key() {
            cx.engine
                .directory_cache
                .remove_dir(&key, &self.path, &self.subdir);
        }
        let removed = self.path.add_segment(&self.subdir);
        if session.current_path == removed || session.current_path.is_subdir_of(&removed) {
            session.current_path = ServerPath::default();
        }
        Reply::OK
    }

    fn reset(&mut self, result: Reply, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        reset_on_error(result, session, cx)
    }
}

/// `rm` for each file of one directory, carrying on past failures.
pub struct DeleteOp {
    meta: OpMeta,
    path: ServerPath,
    files: Vec<String>,
    next: usize,
    failed: usize,
    pending: bool,
}

impl DeleteOp {
    pub fn new(path: ServerPath, files: Vec<String>) -> Self {
        Self {
            meta: OpMeta::new("delete", CommandId::Delete),
            path,
            files,
            next: 0,
            failed: 0,
            pending: false,
        }
    }
}

impl Operation<SftpSession> for DeleteOp {
    op_meta!();

    fn send(&mut self, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        if self.pending {
            return Reply::WOULDBLOCK;
        }
        let path = self.path.clone();
        if !cx.try_lock(&mut self.meta, LockReason::Delete, &path, false) {
            return Reply::WOULDBLOCK;
        }
        let Some(file) = self.files.get(self.next) else {
            return if self.failed == 0 {
                Reply::OK
            } else {
                Reply::ERROR
            };
        };
        let command = format!("rm {}", quote(&self.path.format_filename(file)));
        self.pending = true;
        send_command(session, cx, &self.meta, &command)
    }

    fn parse_response(&mut self, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        let Some(outcome) = take_done(session, cx) else {
            return Reply::WOULDBLOCK;
        };
        self.pending = false;
        let Some(file) = self.files.get(self.next) else {
            return Reply::ERROR;
        };
        match outcome {
            Outcome::Ok => {
                if let Some(key) = cx.server_key() {
                    cx.engine.directory_cache.remove_file(&key, &self.path, file);
                }
            }
            Outcome::Error => self.failed += 1,
            Outcome::Critical => return Reply::CRITICAL_ERROR,
        }
        self.next += 1;
        Reply::CONTINUE
    }

    fn reset(&mut self, result: Reply, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        reset_on_error(result, session, cx)
    }
}

pub struct RenameOp {
    meta: OpMeta,
    from_path: ServerPath,
    from_file: String,
    to_path: ServerPath,
    to_file: String,
    sent: bool,
}

impl RenameOp {
    pub fn new(from_path: ServerPath, from_file: String, to_path: ServerPath, to_file: String) -> Self {
        Self {
            meta: OpMeta::new("rename", CommandId::Rename),
            from_path,
            from_file,
            to_path,
            to_file,
            sent: false,
        }
    }

    fn update_cache(&self, session: &mut SftpSession, cx: &SftpContext) {
        let Some(key) = cx.server_key() else {
            return;
        };
        let cache = &cx.engine.directory_cache;
        match cache.lookup_file(&key, &self.from_path, &self.from_file).entry {
            Some(mut entry) => {
                if entry.is_dir {
                    cache.remove_dir(&key, &self.from_path, &self.from_file);
                    let old = self.from_path.add_segment(&self.from_file);
                    if session.current_path == old || session.current_path.is_subdir_of(&old) {
                        session.current_path = ServerPath::default();
                    }
                } else {
                    cache.remove_file(&key, &self.from_path, &self.from_file);
                }
                entry.name = self.to_file.clone();
                cache.update_file(&key, &self.to_path, entry);
            }
            None => cache.invalidate_file(&key, &self.to_path, &self.to_file),
        }
    }
}

impl Operation<SftpSession> for RenameOp {
    op_meta!();

    fn send(&mut self, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        if self.sent {
            return Reply::WOULDBLOCK;
        }
        let path = self.from_path.clone();
        if !cx.try_lock(&mut self.meta, LockReason::Rename, &path, false) {
            return Reply::WOULDBLOCK;
        }
        self.sent = true;
        let command = format!(
            "mv {} {}",
            quote(&self.from_path.format_filename(&self.from_file)),
            quote(&self.to_path.format_filename(&self.to_file))
        );
        send_command(session, cx, &self.meta, &command)
    }

    fn parse_response(&mut self, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        let Some(outcome) = take_done(session, cx) else {
            return Reply::WOULDBLOCK;
        };
        let result = result_of(outcome);
        if result.is_ok() {
            self.update_cache(session, cx);
        }
        result
    }

    fn reset(&mut self, result: Reply, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        reset_on_error(result, session, cx)
    }
}

pub struct ChmodOp {
    meta: OpMeta,
    path: ServerPath,
    file: String,
    permission: String,
    sent: bool,
}

impl ChmodOp {
    pub fn new(path: ServerPath, file: String, permission: String) -> Self {
        Self {
            meta: OpMeta::new("chmod", CommandId::Chmod),
            path,
            file,
            permission,
            sent: false,
        }
    }
}

impl Operation<SftpSession> for ChmodOp {
    op_meta!();

    fn send(&mut self, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        if self.sent {
            return Reply::WOULDBLOCK;
        }
        let path = self.path.clone();
        if !cx.try_lock(&mut self.meta, LockReason::Chmod, &path, false) {
            return Reply::WOULDBLOCK;
        }
        self.sent = true;
        let command = format!(
            "chmod {} {}",
            self.permission,
            quote(&self.path.format_filename(&self.file))
        );
        send_command(session, cx, &self.meta, &command)
    }

    fn parse_response(&mut self, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        let Some(outcome) = take_done(session, cx) else {
            return Reply::WOULDBLOCK;
        };
        let result = result_of(outcome);
        if result.is_ok() {
            if let Some(key) = cx.server_key() {
                cx.engine
                    .directory_cache
                    .invalidate_file(&key, &self.path, &self.file);
            }
        }
        result
    }

    fn reset(&mut self, result: Reply, session: &mut SftpSession, cx: &mut SftpContext) -> Reply {
        reset_on_error(result, session, cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mkdir_walks_from_the_top() {
        let op = MkdirOp::new(ServerPath::parse("/a/b/c").unwrap());
        let chain: Vec<String> = op.ancestors().iter().map(|p| p.to_string()).collect();
        assert_eq!(chain, vec!["/a", "/a/b", "/a/b/c"]);
    }
}

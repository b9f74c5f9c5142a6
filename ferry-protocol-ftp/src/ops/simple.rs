//! Operations made of one or two commands on full paths.

use ferry_common::{CommandId, MessageType, Reply, ServerPath};
use ferry_core::lock_manager::LockReason;
use ferry_core::operation::{OpMeta, Operation};

use super::{op_meta, result_of, send_command};
use crate::session::{FtpContext, FtpSession};

/// Drops unanswered replies of an operation that ends early.
fn reset_on_error(result: Reply, session: &mut FtpSession) -> Reply {
    if !result.is_ok() {
        session.abandon_replies();
    }
    result
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

impl Operation<FtpSession> for RemoveDirOp {
    op_meta!();

    fn send(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
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
        send_command(session, cx, &self.meta, &format!("RMD {full}"))
    }

    fn parse_response(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
        let reply = session.take_reply();
        if !reply.is_success() {
            return Reply::ERROR;
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

    fn reset(&mut self, result: Reply, session: &mut FtpSession, _cx: &mut FtpContext) -> Reply {
        reset_on_error(result, session)
    }
}

/// `DELE` for each file of one directory. Keeps going after a failure and
/// reports an error at the end.
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

impl Operation<FtpSession> for DeleteOp {
    op_meta!();

    fn send(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
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
        let command = format!("DELE {}", self.path.format_filename(file));
        self.pending = true;
        send_command(session, cx, &self.meta, &command)
    }

    fn parse_response(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
        let reply = session.take_reply();
        self.pending = false;
        let Some(file) = self.files.get(self.next) else {
            return Reply::ERROR;
        };
        if reply.is_success() {
            if let Some(key) = cx.server_key() {
                cx.engine
                    .directory_cache
                    .remove_file(&key, &self.path, file);
            }
        } else {
            self.failed += 1;
        }
        self.next += 1;
        Reply::CONTINUE
    }

    fn reset(&mut self, result: Reply, session: &mut FtpSession, _cx: &mut FtpContext) -> Reply {
        reset_on_error(result, session)
    }
}

pub struct RenameOp {
    meta: OpMeta,
    from_path: ServerPath,
    from_file: String,
    to_path: ServerPath,
    to_file: String,
    step: u8,
    pending: bool,
}

impl RenameOp {
    pub fn new(from_path: ServerPath, from_file: String, to_path: ServerPath, to_file: String) -> Self {
        Self {
            meta: OpMeta::new("rename", CommandId::Rename),
            from_path,
            from_file,
            to_path,
            to_file,
            step: 0,
            pending: false,
        }
    }

    fn update_cache(&self, session: &mut FtpSession, cx: &FtpContext) {
        let Some(key) = cx.server_key() else {
            return;
        };
        let cache = &cx.engine.directory_cache;
        let moved = cache
            .lookup_file(&key, &self.from_path, &self.from_file)
            .entry;
        match moved {
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

impl Operation<FtpSession> for RenameOp {
    op_meta!();

    fn send(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
        if self.pending {
            return Reply::WOULDBLOCK;
        }
        let path = self.from_path.clone();
        if !cx.try_lock(&mut self.meta, LockReason::Rename, &path, false) {
            return Reply::WOULDBLOCK;
        }
        let command = match self.step {
            0 => format!("RNFR {}", self.from_path.format_filename(&self.from_file)),
            1 => format!("RNTO {}", self.to_path.format_filename(&self.to_file)),
            _ => return Reply::WOULDBLOCK,
        };
        self.step += 1;
        self.pending = true;
        send_command(session, cx, &self.meta, &command)
    }

    fn parse_response(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
        let reply = session.take_reply();
        self.pending = false;
        match self.step {
            1 if reply.is_intermediate() => Reply::CONTINUE,
            2 if reply.is_success() => {
                self.update_cache(session, cx);
                Reply::OK
            }
            _ => Reply::ERROR,
        }
    }

    fn reset(&mut self, result: Reply, session: &mut FtpSession, _cx: &mut FtpContext) -> Reply {
        reset_on_error(result, session)
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

impl Operation<FtpSession> for ChmodOp {
    op_meta!();

    fn send(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
        if self.sent {
            return Reply::WOULDBLOCK;
        }
        let path = self.path.clone();
        if !cx.try_lock(&mut self.meta, LockReason::Chmod, &path, false) {
            return Reply::WOULDBLOCK;
        }
        self.sent = true;
        let command = format!(
            "SITE CHMOD {} {}",
            self.permission,
            self.path.format_filename(&self.file)
        );
        send_command(session, cx, &self.meta, &command)
    }

    fn parse_response(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
        let reply = session.take_reply();
        if !reply.is_success() {
            return Reply::ERROR;
        }
        if let Some(key) = cx.server_key() {
            cx.engine
                .directory_cache
                .invalidate_file(&key, &self.path, &self.file);
        }
        Reply::OK
    }

    fn reset(&mut self, result: Reply, session: &mut FtpSession, _cx: &mut FtpContext) -> Reply {
        reset_on_error(result, session)
    }
}

/// Sends a user-supplied command verbatim. Afterwards nothing is assumed
/// about the working directory or transfer type.
pub struct RawOp {
    meta: OpMeta,
    command: String,
    sent: bool,
}

impl RawOp {
    pub fn new(command: String) -> Self {
        Self {
            meta: OpMeta::new("raw", CommandId::RawCommand),
            command,
            sent: false,
        }
    }
}

impl Operation<FtpSession> for RawOp {
    op_meta!();

    fn send(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
        if self.sent {
            return Reply::WOULDBLOCK;
        }
        self.sent = true;
        session.current_path = ServerPath::default();
        session.transfer_type = None;
        let command = self.command.trim().to_owned();
        send_command(session, cx, &self.meta, &command)
    }

    fn parse_response(&mut self, session: &mut FtpSession, cx: &mut FtpContext) -> Reply {
        let reply = session.take_reply();
        cx.log.log(
            MessageType::DebugVerbose,
            format!("Raw command finished with {}", reply.code),
        );
        result_of(reply.code)
    }

    fn reset(&mut self, result: Reply, session: &mut FtpSession, _cx: &mut FtpContext) -> Reply {
        reset_on_error(result, session)
    }
}

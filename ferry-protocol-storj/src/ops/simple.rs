use ferry_common::{CommandId, DirEntry, Reply, ServerPath};
use ferry_core::lock_manager::LockReason;
use ferry_core::operation::{OpMeta, Operation};

use super::{
    bucket_and_key, bucket_and_prefix, op_meta, reset_on_error, send_command, take_done,
};
use crate::event::quote;
use crate::session::{StorjContext, StorjSession};

/// `mkbucket` or `mkd` depending on where the directory is.
fn dir_command(verb: &str, dir: &ServerPath) -> Option<String> {
    let (bucket, prefix) = bucket_and_prefix(dir)?;
    match (bucket.is_empty(), prefix.is_empty()) {
        (true, _) => None,
        (false, true) => Some(format!("{verb}bucket {}", quote(&bucket))),
        (false, false) => Some(format!("{verb}d {} {}", quote(&bucket), quote(&prefix))),
    }
}

/// Creates a bucket, or a prefix inside one. Prefixes below a missing one
/// need no parents.
pub struct MkdirOp {
    meta: OpMeta,
    path: ServerPath,
    sent: bool,
}

impl MkdirOp {
    pub fn new(path: ServerPath) -> Self {
        Self {
            meta: OpMeta::new("mkdir", CommandId::Mkdir),
            path,
            sent: false,
        }
    }
}

impl Operation<StorjSession> for MkdirOp {
    op_meta!();

    fn send(&mut self, session: &mut StorjSession, cx: &mut StorjContext) -> Reply {
        if self.sent {
            return Reply::WOULDBLOCK;
        }
        let path = self.path.clone();
        if !cx.try_lock(&mut self.meta, LockReason::Mkdir, &path, false) {
            return Reply::WOULDBLOCK;
        }
        let Some(command) = dir_command("mk", &self.path) else {
            cx.log.error("Cannot create the root directory");
            return Reply::ERROR;
        };
        self.sent = true;
        send_command(session, cx, &self.meta, &command)
    }

    fn parse_response(&mut self, session: &mut StorjSession, cx: &mut StorjContext) -> Reply {
        let Some(result) = take_done(session, cx) else {
            return Reply::WOULDBLOCK;
        };
        if result.is_ok() {
            if let (Some(key), Some(parent), Some(name)) =
                (cx.server_key(), self.path.parent(), self.path.last_segment())
            {
                cx.engine
                    .directory_cache
                    .update_file(&key, &parent, DirEntry::dir(name));
            }
        }
        result
    }

    fn reset(&mut self, result: Reply, session: &mut StorjSession, cx: &mut StorjContext) -> Reply {
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

impl Operation<StorjSession> for RemoveDirOp {
    op_meta!();

    fn send(&mut self, session: &mut StorjSession, cx: &mut StorjContext) -> Reply {
        if self.sent {
            return Reply::WOULDBLOCK;
        }
        let Some(full) = self.path.change_path(&self.subdir) else {
            return Reply::ERROR;
        };
        if !cx.try_lock(&mut self.meta, LockReason::RemoveDir, &full, true) {
            return Reply::WOULDBLOCK;
        }
        let Some(command) = dir_command("rm", &full) else {
            cx.log.error("Cannot remove the root directory");
            return Reply::ERROR;
        };
        self.sent = true;
        send_command(session, cx, &self.meta, &command)
    }

    fn parse_response(&mut self, session: &mut StorjSession, cx: &mut StorjContext) -> Reply {
        let Some(result) = take_done(session, cx) else {
            return Reply::WOULDBLOCK;
        };
        if result.is_ok() {
            if let Some(key) = cx.server_key() {
                cx.engine
                    .directory_cache
                    .remove_dir(&key, &self.path, &self.subdir);
            }
        }
        result
    }

    fn reset(&mut self, result: Reply, session: &mut StorjSession, cx: &mut StorjContext) -> Reply {
        reset_on_error(result, session, cx)
    }
}

/// Deletes objects of one directory one by one, carrying on past failures.
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

impl Operation<StorjSession> for DeleteOp {
    op_meta!();

    fn send(&mut self, session: &mut StorjSession, cx: &mut StorjContext) -> Reply {
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
        let Some((bucket, key)) = bucket_and_key(&self.path, file) else {
            cx.log.error(format!("{file} is not inside a bucket"));
            self.failed += 1;
            self.next += 1;
            return Reply::CONTINUE;
        };
        self.pending = true;
        let command = format!("rm {} {}", quote(&bucket), quote(&key));
        send_command(session, cx, &self.meta, &command)
    }

    fn parse_response(&mut self, session: &mut StorjSession, cx: &mut StorjContext) -> Reply {
        let Some(result) = take_done(session, cx) else {
            return Reply::WOULDBLOCK;
        };
        self.pending = false;
        if result.is_critical() {
            return result;
        }
        if result.is_ok() {
            if let (Some(key), Some(file)) = (cx.server_key(), self.files.get(self.next)) {
                cx.engine.directory_cache.remove_file(&key, &self.path, file);
            }
        } else {
            self.failed += 1;
        }
        self.next += 1;
        Reply::CONTINUE
    }

    fn reset(&mut self, result: Reply, session: &mut StorjSession, cx: &mut StorjContext) -> Reply {
        reset_on_error(result, session, cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_and_prefixes_use_different_commands() {
        let bucket = ServerPath::parse("/photos").unwrap();
        let prefix = ServerPath::parse("/photos/2024").unwrap();
        assert_eq!(dir_command("mk", &bucket).as_deref(), Some("mkbucket \"photos\""));
        assert_eq!(
            dir_command("rm", &prefix).as_deref(),
            Some("rmd \"photos\" \"2024/\"")
        );
        assert_eq!(dir_command("mk", &ServerPath::root()), None);
    }
}

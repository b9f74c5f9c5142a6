use ferry_common::{Command, MessageType, Reply, ReplyFlags, ServerPath};
use ferry_core::operation::OpMeta;

use crate::event::{Outcome, StorjEvent};
use crate::session::{StorjContext, StorjOp, StorjSession};

mod connect;
mod list;
mod simple;
mod transfer;

pub use connect::ConnectOp;
pub use list::ListOp;
pub use simple::{DeleteOp, MkdirOp, RemoveDirOp};
pub use transfer::FileTransferOp;

macro_rules! op_meta {
    () => {
        fn meta(&self) -> &ferry_core::operation::OpMeta {
            &self.meta
        }

        fn meta_mut(&mut self) -> &mut ferry_core::operation::OpMeta {
            &mut self.meta
        }
    };
}
pub(crate) use op_meta;

pub fn create(command: Command) -> Result<StorjOp, Reply> {
    Ok(match command {
        Command::Connect { site, .. } => Box::new(ConnectOp::new(site)),
        Command::List(command) => Box::new(ListOp::new(command)),
        Command::FileTransfer(command) => Box::new(FileTransferOp::new(command)),
        Command::Mkdir { path } => Box::new(MkdirOp::new(path)),
        Command::RemoveDir { path, subdir } => Box::new(RemoveDirOp::new(path, subdir)),
        Command::Delete { path, files } => Box::new(DeleteOp::new(path, files)),
        // Objects are immutable and carry no permissions
        Command::Rename { .. } | Command::Chmod { .. } | Command::RawCommand(_) => {
            return Err(Reply::error(ReplyFlags::NOTSUPPORTED))
        }
        Command::Disconnect => return Err(Reply::error(ReplyFlags::INTERNALERROR)),
    })
}

/// Where a directory lives: the bucket and the key prefix below it, which
/// ends in `/` unless empty. The root is the list of buckets.
pub(crate) fn bucket_and_prefix(dir: &ServerPath) -> Option<(String, String)> {
    if dir.is_empty() {
        return None;
    }
    let Some((bucket, rest)) = dir.segments().split_first() else {
        return Some((String::new(), String::new()));
    };
    let prefix = rest.iter().map(|s| format!("{s}/")).collect();
    Some((bucket.clone(), prefix))
}

/// Bucket and object key of `name` in `dir`. Objects cannot live outside
/// a bucket.
pub(crate) fn bucket_and_key(dir: &ServerPath, name: &str) -> Option<(String, String)> {
    let (bucket, prefix) = bucket_and_prefix(dir)?;
    if bucket.is_empty() || name.is_empty() {
        return None;
    }
    Some((bucket, format!("{prefix}{name}")))
}

pub(crate) fn send_command(
    session: &mut StorjSession,
    cx: &StorjContext,
    meta: &OpMeta,
    command: &str,
) -> Reply {
    if session.send_command(cx, meta.send_log_level, command, command) {
        Reply::WOULDBLOCK
    } else {
        Reply::ERROR | ReplyFlags::DISCONNECTED
    }
}

/// Feeds queued helper events to `f` until it decides. Nothing is taken
/// while a buffer request waits for the local side.
pub(crate) fn drain<F>(session: &mut StorjSession, cx: &mut StorjContext, mut f: F) -> Reply
where
    F: FnMut(StorjEvent, &mut StorjSession, &mut StorjContext) -> Reply,
{
    while !session.io_waiting() {
        let Some(event) = session.next_event() else {
            break;
        };
        let reply = f(event, session, cx);
        if !reply.would_block() {
            return reply;
        }
    }
    Reply::WOULDBLOCK
}

/// Waits for the `Done` of a single command.
pub(crate) fn take_done(session: &mut StorjSession, cx: &mut StorjContext) -> Option<Reply> {
    let mut done = None;
    drain(session, cx, |event, _, cx| match event {
        StorjEvent::Done(outcome) => {
            done = Some(result_of(outcome));
            Reply::OK
        }
        StorjEvent::Reply(text) => {
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

pub(crate) fn result_of(outcome: Outcome) -> Reply {
    match outcome {
        Outcome::Ok => Reply::OK,
        Outcome::Error => Reply::ERROR,
        Outcome::Critical => Reply::CRITICAL_ERROR,
    }
}

/// A helper abandoned in the middle of a command is stopped.
pub(crate) fn reset_on_error(result: Reply, session: &mut StorjSession, cx: &StorjContext) -> Reply {
    if session.busy() && !result.is_ok() {
        cx.log.status("Stopping the helper in the middle of a command");
        session.stop();
        return result | ReplyFlags::DISCONNECTED;
    }
    result
}

pub(crate) fn log_unexpected(cx: &StorjContext, event: &StorjEvent) {
    cx.log.log(
        MessageType::DebugWarning,
        format!("Unexpected helper event {event:?}"),
    );
}

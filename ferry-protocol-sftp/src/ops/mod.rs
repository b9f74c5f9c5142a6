use ferry_common::{Command, Reply, ReplyFlags};
use ferry_core::operation::OpMeta;

use crate::event::{Outcome, SftpEvent};
use crate::session::{SftpContext, SftpOp, SftpSession};

mod connect;
mod cwd;
mod list;
mod simple;
mod transfer;

pub use connect::ConnectOp;
pub use cwd::ChangeDirOp;
pub use list::ListOp;
pub use simple::{ChmodOp, DeleteOp, MkdirOp, RemoveDirOp, RenameOp};
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

pub fn create(command: Command) -> Result<SftpOp, Reply> {
    Ok(match command {
        Command::Connect { site, .. } => Box::new(ConnectOp::new(site)),
        Command::List(command) => Box::new(ListOp::new(command)),
        Command::FileTransfer(command) => Box::new(FileTransferOp::new(command)),
        Command::Mkdir { path } => Box::new(MkdirOp::new(path)),
        Command::RemoveDir { path, subdir } => Box::new(RemoveDirOp::new(path, subdir)),
        Command::Delete { path, files } => Box::new(DeleteOp::new(path, files)),
        Command::Rename {
            from_path,
            from_file,
            to_path,
            to_file,
        } => Box::new(RenameOp::new(from_path, from_file, to_path, to_file)),
        Command::Chmod {
            path,
            file,
            permission,
        } => Box::new(ChmodOp::new(path, file, permission)),
        Command::Disconnect => return Err(Reply::error(ReplyFlags::INTERNALERROR)),
        Command::RawCommand(_) => return Err(Reply::error(ReplyFlags::NOTSUPPORTED)),
    })
}

/// Sends `command` for the operation owning `meta` and suspends it until
/// the helper reports back.
pub(crate) fn send_command(
    session: &mut SftpSession,
    cx: &SftpContext,
    meta: &OpMeta,
    command: &str,
) -> Reply {
    if session.send_command(cx, meta.send_log_level, command) {
        Reply::WOULDBLOCK
    } else {
        Reply::ERROR | ReplyFlags::DISCONNECTED
    }
}

/// Feeds queued helper events to `f` until it decides or the queue runs
/// dry. Nothing is taken while a buffer request waits for the local side.
pub(crate) fn drain<F>(session: &mut SftpSession, cx: &mut SftpContext, mut f: F) -> Reply
where
    F: FnMut(SftpEvent, &mut SftpSession, &mut SftpContext) -> Reply,
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

pub(crate) fn result_of(outcome: Outcome) -> Reply {
    match outcome {
        Outcome::Ok => Reply::OK,
        Outcome::Error => Reply::ERROR,
        Outcome::Critical => Reply::CRITICAL_ERROR,
    }
}

/// `CONTINUE` for a success, the reply itself otherwise.
pub(crate) fn continue_if_ok(reply: Reply) -> Reply {
    if reply.is_ok() {
        Reply::CONTINUE
    } else {
        reply
    }
}

/// An operation that ends while the helper still works on its command
/// leaves the helper in an unknown state; it is stopped.
pub(crate) fn reset_on_error(result: Reply, session: &mut SftpSession, cx: &SftpContext) -> Reply {
    if session.busy() && !result.is_ok() {
        cx.log.status("Stopping the helper in the middle of a command");
        session.stop();
        return result | ReplyFlags::DISCONNECTED;
    }
    result
}

pub(crate) fn log_unexpected(cx: &SftpContext, event: &SftpEvent) {
    cx.log.log(
        ferry_common::MessageType::DebugWarning,
        format!("Unexpected helper event {event:?}"),
    );
}

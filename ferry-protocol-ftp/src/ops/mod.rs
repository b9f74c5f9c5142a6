use ferry_common::{Command, MessageType, Reply, ReplyFlags};
use ferry_core::operation::OpMeta;

use crate::session::{FtpContext, FtpOp, FtpSession};

mod cwd;
mod list;
mod logon;
mod mkdir;
mod rawtransfer;
mod simple;
mod transfer;

pub use cwd::ChangeDirOp;
pub use list::ListOp;
pub use logon::LogonOp;
pub use mkdir::MkdirOp;
pub use rawtransfer::{RawTransferOp, RawTransferRequest};
pub use simple::{ChmodOp, DeleteOp, RawOp, RemoveDirOp, RenameOp};
pub use transfer::FileTransferOp;

/// Implements the `meta`/`meta_mut` pair for an operation with a `meta`
/// field.
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

pub fn create(command: Command) -> Result<FtpOp, Reply> {
    Ok(match command {
        Command::Connect { site, .. } => Box::new(LogonOp::new(site)),
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
        Command::RawCommand(command) => Box::new(RawOp::new(command)),
        Command::Disconnect => return Err(Reply::error(ReplyFlags::INTERNALERROR)),
    })
}

/// Sends `command` for the operation owning `meta` and suspends it until
/// the reply arrives.
pub(crate) fn send_command(
    session: &mut FtpSession,
    cx: &FtpContext,
    meta: &OpMeta,
    command: &str,
) -> Reply {
    if session.send_command(cx, meta.send_log_level, command) {
        Reply::WOULDBLOCK
    } else {
        Reply::ERROR | ReplyFlags::DISCONNECTED
    }
}

/// Reply code of a finished simple command.
pub(crate) fn result_of(code: u16) -> Reply {
    match code / 100 {
        2 | 3 => Reply::OK,
        _ => Reply::ERROR,
    }
}

pub(crate) fn log_unexpected(cx: &FtpContext, state: impl std::fmt::Debug) {
    cx.log.log(
        MessageType::DebugWarning,
        format!("Unexpected reply in state {state:?}"),
    );
}

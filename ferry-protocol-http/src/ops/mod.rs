use ferry_common::{Command, Reply, ReplyFlags};

use crate::session::HttpOp;

mod connect;
mod request;
mod transfer;

pub use connect::ConnectOp;
pub use request::{BodyTarget, RequestOp};
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

pub fn create(command: Command) -> Result<HttpOp, Reply> {
    Ok(match command {
        Command::Connect { site, .. } => Box::new(ConnectOp::new(site)),
        Command::FileTransfer(command) => Box::new(FileTransferOp::new(command)),
        Command::Disconnect => return Err(Reply::error(ReplyFlags::INTERNALERROR)),
        Command::List(_)
        | Command::Mkdir { .. }
        | Command::RemoveDir { .. }
        | Command::Delete { .. }
        | Command::Rename { .. }
        | Command::Chmod { .. }
        | Command::RawCommand(_) => return Err(Reply::error(ReplyFlags::NOTSUPPORTED)),
    })
}

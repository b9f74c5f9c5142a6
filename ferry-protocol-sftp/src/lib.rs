//! SFTP through a helper process.
//!
//! The helper reads one command per line on stdin (`open`, `cd`, `pwd`,
//! `ls`, `get`, `put`, `mkdir`, `rmdir`, `rm`, `mv`, `chmod`, `mtime`,
//! `proxy`, `keyfile`) with string arguments in double quotes. It answers
//! with records on stdout: a line holding one character, the record type
//! counted from `'0'`, followed by as many lines as [event::line_count]
//! says. File contents never go through the pipes. The helper inherits the
//! buffer pool's memory as a file descriptor (`FERRY_SHM_FD`, sized
//! `FERRY_SHM_SIZE`) and the engine lends it slots by answering buffer
//! requests with `-<offset> <length>`.

pub mod event;
mod ops;
mod session;

use ferry_common::Protocol;
use ferry_core::control_socket::{
    ControlSocket, ControlSocketDriver, ControlSocketFactory, SocketSetup,
};
pub use session::{SftpContext, SftpSession};

#[derive(Debug, Default, Clone, Copy)]
pub struct SftpFactory;

impl ControlSocketFactory for SftpFactory {
    fn supports(&self, protocol: Protocol) -> bool {
        session::supports(protocol)
    }

    fn create(&self, _protocol: Protocol, setup: SocketSetup) -> Box<dyn ControlSocketDriver> {
        Box::new(ControlSocket::new(SftpSession::new(), setup))
    }
}

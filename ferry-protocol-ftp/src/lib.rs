pub mod listing;
mod ops;
pub mod pasv;
pub mod reply;
mod session;

use ferry_common::Protocol;
use ferry_core::control_socket::{
    ControlSocket, ControlSocketDriver, ControlSocketFactory, SocketSetup,
};
pub use session::{FtpContext, FtpSession};

/// Control sockets for FTP, implicit FTPS and explicit FTPES.
#[derive(Debug, Default, Clone, Copy)]
pub struct FtpFactory;

impl ControlSocketFactory for FtpFactory {
    fn supports(&self, protocol: Protocol) -> bool {
        protocol.is_ftp()
    }

    fn create(&self, protocol: Protocol, setup: SocketSetup) -> Box<dyn ControlSocketDriver> {
        Box::new(ControlSocket::new(FtpSession::new(protocol), setup))
    }
}

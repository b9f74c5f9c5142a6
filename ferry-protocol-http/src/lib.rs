//! HTTP/1.1 downloads and uploads on top of the ferry control socket.

mod ops;
pub mod request;
pub mod response;
mod session;

use ferry_common::Protocol;
use ferry_core::control_socket::{
    ControlSocket, ControlSocketDriver, ControlSocketFactory, SocketSetup,
};
pub use session::{HttpContext, HttpSession};

#[derive(Debug, Default, Clone, Copy)]
pub struct HttpFactory;

impl ControlSocketFactory for HttpFactory {
    fn supports(&self, protocol: Protocol) -> bool {
        matches!(protocol, Protocol::Http | Protocol::Https)
    }

    fn create(&self, protocol: Protocol, setup: SocketSetup) -> Box<dyn ControlSocketDriver> {
        Box::new(ControlSocket::new(HttpSession::new(protocol), setup))
    }
}

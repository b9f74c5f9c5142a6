//! Storj decentralized storage through a helper process.
//!
//! The helper speaks the same framing as the SFTP one: commands on stdin
//! with quoted arguments, typed records on stdout and file contents in
//! the shared buffer region. Buckets are the directories at the root;
//! below them, key prefixes ending in `/` are shown as directories.

pub mod event;
mod ops;
mod session;

use ferry_common::Protocol;
use ferry_core::control_socket::{
    ControlSocket, ControlSocketDriver, ControlSocketFactory, SocketSetup,
};
pub use session::{StorjContext, StorjSession};

#[derive(Debug, Default, Clone, Copy)]
pub struct StorjFactory;

impl ControlSocketFactory for StorjFactory {
    fn supports(&self, protocol: Protocol) -> bool {
        session::supports(protocol)
    }

    fn create(&self, _protocol: Protocol, setup: SocketSetup) -> Box<dyn ControlSocketDriver> {
        Box::new(ControlSocket::new(StorjSession::new(), setup))
    }
}

use ferry_common::Protocol;
use ferry_core::control_socket::{ControlSocketDriver, ControlSocketFactory, SocketSetup};
use ferry_protocol_ftp::FtpFactory;
use ferry_protocol_http::HttpFactory;
use ferry_protocol_sftp::SftpFactory;
use ferry_protocol_storj::StorjFactory;

/// Every protocol binding behind one factory.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllProtocols;

impl AllProtocols {
    fn factory(protocol: Protocol) -> &'static dyn ControlSocketFactory {
        match protocol {
            Protocol::Ftp | Protocol::Ftps | Protocol::Ftpes | Protocol::InsecureFtp => {
                &FtpFactory
            }
            Protocol::Sftp => &SftpFactory,
            Protocol::Http | Protocol::Https => &HttpFactory,
            Protocol::Storj => &StorjFactory,
        }
    }
}

impl ControlSocketFactory for AllProtocols {
    fn supports(&self, protocol: Protocol) -> bool {
        Self::factory(protocol).supports(protocol)
    }

    fn create(&self, protocol: Protocol, setup: SocketSetup) -> Box<dyn ControlSocketDriver> {
        Self::factory(protocol).create(protocol, setup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_protocol_has_a_binding() {
        for protocol in [
            Protocol::Ftp,
            Protocol::Ftps,
            Protocol::Ftpes,
            Protocol::InsecureFtp,
            Protocol::Sftp,
            Protocol::Http,
            Protocol::Https,
            Protocol::Storj,
        ] {
            assert!(AllProtocols.supports(protocol), "{protocol}");
        }
    }
}

use ferry_common::EncryptionDetails;
use rustls::{ClientConnection, HandshakeKind};
use tracing::warn;

use crate::{certificate_info, VerificationRecord};

/// Negotiated parameters of an established TLS session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSessionInfo {
    pub protocol_version: String,
    pub cipher: String,
    pub alpn: Option<Vec<u8>>,
    pub resumed: bool,
}

impl TlsSessionInfo {
    pub fn from_connection(conn: &ClientConnection) -> Self {
        Self {
            protocol_version: conn
                .protocol_version()
                .map(|v| format!("{v:?}"))
                .unwrap_or_default(),
            cipher: conn
                .negotiated_cipher_suite()
                .map(|s| format!("{:?}", s.suite()))
                .unwrap_or_default(),
            alpn: conn.alpn_protocol().map(|p| p.to_vec()),
            resumed: conn.handshake_kind() == Some(HandshakeKind::Resumed),
        }
    }

    pub fn alpn_is(&self, protocol: &[u8]) -> bool {
        self.alpn.as_deref() == Some(protocol)
    }

    pub fn encryption_details(&self, record: Option<&VerificationRecord>) -> EncryptionDetails {
        let certificates = record
            .map(|r| {
                r.chain
                    .iter()
                    .filter_map(|der| match certificate_info(der) {
                        Ok(info) => Some(info),
                        Err(error) => {
                            warn!(%error, "Could not parse a server certificate");
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        EncryptionDetails {
            protocol: self.protocol_version.clone(),
            cipher: self.cipher.clone(),
            certificates,
            session_resumed: self.resumed,
            ..Default::default()
        }
    }
}

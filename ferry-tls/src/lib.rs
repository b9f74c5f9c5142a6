mod cert_info;
mod config;
mod error;
mod maybe_tls_stream;
mod rustls_root_certs;
mod session;
mod verifier;

pub use cert_info::{certificate_info, fingerprint_sha256};
pub use config::{TlsClient, FTP_RESUMPTION_ALPN};
pub use error::*;
pub use maybe_tls_stream::MaybeTlsStream;
pub use rustls_root_certs::ROOT_CERT_STORE;
pub use session::TlsSessionInfo;
pub use verifier::{CapturingVerifier, TrustedCertificates, VerificationRecord};

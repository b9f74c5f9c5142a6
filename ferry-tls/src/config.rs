use std::sync::Arc;

use rustls::client::Resumption;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;

use crate::{CapturingVerifier, TlsError, TrustedCertificates, VerificationRecord};

/// ALPN id a server announces when it insists on TLS session resumption
/// for every data connection.
pub const FTP_RESUMPTION_ALPN: &[u8] = b"x-filezilla-ftp";

/// Client configuration of one control connection. Data connections reuse
/// it so that they can resume the control connection's TLS session.
#[derive(Clone)]
pub struct TlsClient {
    config: Arc<ClientConfig>,
    verifier: Arc<CapturingVerifier>,
}

impl TlsClient {
    pub fn new(alpn: &[&[u8]], trusted: TrustedCertificates) -> Result<Self, TlsError> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let verifier = Arc::new(CapturingVerifier::new(provider.clone(), trusted)?);

        let mut config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(verifier.clone())
            .with_no_client_auth();
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        config.resumption = Resumption::in_memory_sessions(32);

        Ok(Self {
            config: Arc::new(config),
            verifier,
        })
    }

    pub fn upgrade_config(
        &self,
        host: &str,
    ) -> Result<(ServerName<'static>, Arc<ClientConfig>), TlsError> {
        let name = ServerName::try_from(host.trim_matches(|c| c == '[' || c == ']').to_owned())?;
        Ok((name, self.config.clone()))
    }

    /// Certificate verdict of the most recent handshake.
    pub fn take_verification(&self) -> Option<VerificationRecord> {
        self.verifier.take_record()
    }
}

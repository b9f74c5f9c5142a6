use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, Error as RustlsError, SignatureScheme};

use ferry_common::CertificateRequest;

use crate::{fingerprint_sha256, TlsError, ROOT_CERT_STORE};

/// Certificate fingerprints the user chose to trust, shared by all
/// connections of one engine context.
#[derive(Debug, Clone, Default)]
pub struct TrustedCertificates {
    inner: Arc<RwLock<HashSet<String>>>,
}

impl TrustedCertificates {
    pub fn trust(&self, fingerprint: &str) {
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        self.inner.write().unwrap().insert(fingerprint.to_owned());
    }

    pub fn is_trusted(&self, fingerprint: &str) -> bool {
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        self.inner.read().unwrap().contains(fingerprint)
    }

    /// Applies the user's answer to a certificate question. With `always`
    /// the end-entity certificate is trusted for the rest of the context.
    pub fn apply_answer(
        &self,
        request: &CertificateRequest,
        trust: bool,
        always: bool,
    ) -> Result<(), TlsError> {
        if !trust {
            return Err(TlsError::CertificateRejected {
                host: request.host.clone(),
            });
        }
        if always {
            if let Some(first) = request.chain.first() {
                self.trust(&first.fingerprint_sha256);
            }
        }
        Ok(())
    }
}

/// Outcome of the last certificate check.
#[derive(Debug, Clone)]
pub struct VerificationRecord {
    pub chain: Vec<CertificateDer<'static>>,
    pub error: Option<String>,
    pub trusted_by_user: bool,
}

impl VerificationRecord {
    pub fn needs_confirmation(&self) -> bool {
        self.error.is_some() && !self.trusted_by_user
    }

    pub fn end_entity_fingerprint(&self) -> Option<String> {
        self.chain.first().map(|c| fingerprint_sha256(c.as_ref()))
    }
}

/// Checks server certificates against the system roots but never fails
/// the handshake over trust. The verdict is recorded so that the caller
/// can be asked about an untrusted chain once the handshake is done.
#[derive(Debug)]
pub struct CapturingVerifier {
    inner: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<CryptoProvider>,
    trusted: TrustedCertificates,
    last: Mutex<Option<VerificationRecord>>,
}

impl CapturingVerifier {
    pub fn new(
        provider: Arc<CryptoProvider>,
        trusted: TrustedCertificates,
    ) -> Result<Self, TlsError> {
        let inner = if ROOT_CERT_STORE.is_empty() {
            None
        } else {
            Some(
                WebPkiServerVerifier::builder_with_provider(
                    Arc::new(ROOT_CERT_STORE.clone()),
                    provider.clone(),
                )
                .build()?,
            )
        };
        Ok(Self {
            inner,
            provider,
            trusted,
            last: Mutex::new(None),
        })
    }

    pub fn take_record(&self) -> Option<VerificationRecord> {
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        self.last.lock().unwrap().take()
    }

    fn record(&self, record: VerificationRecord) {
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        let mut last = self.last.lock().unwrap();
        *last = Some(record);
    }
}

impl ServerCertVerifier for CapturingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        let error = match &self.inner {
            Some(inner) => inner
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
                .err()
                .map(|e| e.to_string()),
            None => Some("no trusted root certificates available".to_owned()),
        };
        let trusted_by_user = self
            .trusted
            .is_trusted(&fingerprint_sha256(end_entity.as_ref()));

        let mut chain = vec![end_entity.clone().into_owned()];
        chain.extend(intermediates.iter().map(|c| c.clone().into_owned()));
        self.record(VerificationRecord {
            chain,
            error,
            trusted_by_user,
        });
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

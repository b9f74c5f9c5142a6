use rustls::server::VerifierBuilderError;

/// Ways setting up or keeping a TLS session can fail.
#[derive(thiserror::Error, Debug)]
pub enum TlsError {
    #[error("TLS setup: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("certificate verifier setup: {0}")]
    Verifier(#[from] VerifierBuilderError),
    #[error("invalid TLS server name: {0}")]
    ServerName(#[from] rustls_pki_types::InvalidDnsNameError),
    #[error("malformed certificate")]
    MalformedCertificate,
    #[error("TLS handshake failed: {0}")]
    Handshake(std::io::Error),
    #[error("the connection is already encrypted")]
    AlreadyEncrypted,
    /// The data connection did not resume the control connection's
    /// session although the server requires or previously did so.
    #[error("the TLS session of the data connection was not resumed")]
    ResumptionRequired,
    #[error("the certificate of {host} was not trusted")]
    CertificateRejected { host: String },
}

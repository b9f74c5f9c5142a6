use once_cell::sync::Lazy;
use rustls::RootCertStore;
use tracing::warn;

pub static ROOT_CERT_STORE: Lazy<RootCertStore> = Lazy::new(|| {
    let mut roots = RootCertStore::empty();
    let result = rustls_native_certs::load_native_certs();
    for error in result.errors {
        warn!(%error, "Could not load a system root certificate");
    }
    let (_, ignored) = roots.add_parsable_certificates(result.certs);
    if ignored > 0 {
        warn!(ignored, "Skipped unparsable system root certificates");
    }
    roots
});

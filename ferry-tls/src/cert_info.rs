use chrono::{DateTime, Utc};
use data_encoding::HEXLOWER;
use ferry_common::CertificateInfo;
use rustls_pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::TlsError;

/// Colon separated lowercase hex SHA-256 of a DER certificate.
pub fn fingerprint_sha256(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    HEXLOWER
        .encode(&digest)
        .as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

pub fn certificate_info(der: &CertificateDer<'_>) -> Result<CertificateInfo, TlsError> {
    let (_, cert) = X509Certificate::from_der(der.as_ref())
        .map_err(|_| TlsError::MalformedCertificate)?;

    let alt_names = cert
        .subject_alternative_name()
        .map_err(|_| TlsError::MalformedCertificate)?
        .map(|ext| {
            ext.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some((*dns).to_owned()),
                    GeneralName::IPAddress(ip) => format_ip(ip),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    let subject = cert.subject().to_string();
    let issuer = cert.issuer().to_string();
    Ok(CertificateInfo {
        self_signed: subject == issuer,
        subject,
        issuer,
        serial: cert.raw_serial_as_string(),
        not_before: to_utc(cert.validity().not_before.timestamp()),
        not_after: to_utc(cert.validity().not_after.timestamp()),
        alt_names,
        fingerprint_sha256: fingerprint_sha256(der.as_ref()),
    })
}

fn to_utc(timestamp: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(timestamp, 0)
}

fn format_ip(bytes: &[u8]) -> Option<String> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(std::net::Ipv4Addr::from(octets).to_string())
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(std::net::Ipv6Addr::from(octets).to_string())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_format() {
        let fp = fingerprint_sha256(b"");
        assert_eq!(fp.len(), 32 * 3 - 1);
        assert!(fp.starts_with("e3:b0:c4:42"));
    }

    #[test]
    fn garbage_is_rejected() {
        let der = CertificateDer::from(vec![1u8, 2, 3]);
        assert!(matches!(
            certificate_info(&der),
            Err(TlsError::MalformedCertificate)
        ));
    }
}

//! Certificate trust policy.
//!
//! The transport verifies server certificates with a layered policy:
//! accept-all (testing only), pinned certificate fingerprints, pinned
//! public-key (SPKI) fingerprints, and finally the platform trust anchors.
//! Fingerprints are SHA-256, normalised by stripping `:` separators and
//! uppercasing.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio_rustls::rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    client::WebPkiServerVerifier,
    crypto::CryptoProvider,
    pki_types::{CertificateDer, ServerName, UnixTime},
    CertificateError, DigitallySignedStruct, Error as TlsError, SignatureScheme,
};

use crate::options::ClientOptions;

/// The configured trust decisions, extracted from [`ClientOptions`].
#[derive(Clone, Debug, Default)]
pub struct TrustPolicy {
    /// Accept any presented certificate.
    pub accept_all: bool,
    /// Normalised SHA-256 fingerprints of trusted certificates.
    pub certificate_fingerprints: Vec<String>,
    /// Normalised SHA-256 fingerprints of trusted SubjectPublicKeyInfo.
    pub public_key_fingerprints: Vec<String>,
    /// Check revocation status during verification.
    pub check_revocation: bool,
}

impl TrustPolicy {
    /// Build the policy from client options, normalising fingerprints.
    pub fn from_options(options: &ClientOptions) -> Self {
        Self {
            accept_all: options.accept_all_certificates,
            certificate_fingerprints: options
                .trusted_certificate_fingerprints
                .iter()
                .map(|f| normalize_fingerprint(f))
                .collect(),
            public_key_fingerprints: options
                .trusted_public_key_fingerprints
                .iter()
                .map(|f| normalize_fingerprint(f))
                .collect(),
            check_revocation: options.effective_check_revocation(),
        }
    }
}

/// Strip `:` separators and uppercase a fingerprint.
pub fn normalize_fingerprint(fingerprint: &str) -> String {
    fingerprint
        .chars()
        .filter(|c| *c != ':')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Uppercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for b in digest {
        let _ = write!(out, "{:02X}", b);
    }
    out
}

/// Raw SHA-256 of `bytes`.
pub fn sha256(bytes: &[u8]) -> Vec<u8> {
    Sha256::digest(bytes).to_vec()
}

fn der_element(input: &[u8]) -> Option<(u8, usize, &[u8])> {
    let (&tag, rest) = input.split_first()?;
    let (&len0, rest) = rest.split_first()?;
    let (len, header) = if len0 & 0x80 == 0 {
        (len0 as usize, 2)
    } else {
        let n = (len0 & 0x7f) as usize;
        if n == 0 || n > 4 || rest.len() < n {
            return None;
        }
        let mut len = 0usize;
        for &b in &rest[..n] {
            len = (len << 8) | b as usize;
        }
        (len, 2 + n)
    };
    if input.len() < header + len {
        return None;
    }
    Some((tag, header + len, &input[header..header + len]))
}

fn der_skip(input: &[u8]) -> Option<&[u8]> {
    let (_, total, _) = der_element(input)?;
    Some(&input[total..])
}

/// Extract the SubjectPublicKeyInfo element (header included) from a DER
/// certificate without a full X.509 parser: walk the tbsCertificate fields
/// up to the SPKI.
pub(crate) fn spki_der(cert: &[u8]) -> Option<&[u8]> {
    let (tag, _, cert_body) = der_element(cert)?;
    if tag != 0x30 {
        return None;
    }
    let (tag, _, mut field) = der_element(cert_body)?;
    if tag != 0x30 {
        return None;
    }
    // Optional [0] explicit version.
    if field.first() == Some(&0xA0) {
        field = der_skip(field)?;
    }
    // serialNumber, signature, issuer, validity, subject.
    for _ in 0..5 {
        field = der_skip(field)?;
    }
    let (tag, total, _) = der_element(field)?;
    if tag != 0x30 {
        return None;
    }
    Some(&field[..total])
}

/// rustls certificate verifier applying the layered trust policy.
///
/// `webpki` is absent when no platform trust anchors could be loaded; in
/// that case only the accept-all and fingerprint layers can succeed.
#[derive(Debug)]
pub(crate) struct FingerprintVerifier {
    policy: TrustPolicy,
    webpki: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<CryptoProvider>,
}

impl FingerprintVerifier {
    pub(crate) fn new(
        policy: TrustPolicy,
        webpki: Option<Arc<WebPkiServerVerifier>>,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        Self {
            policy,
            webpki,
            provider,
        }
    }
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        if self.policy.accept_all {
            return Ok(ServerCertVerified::assertion());
        }

        if !self.policy.certificate_fingerprints.is_empty() {
            let fingerprint = sha256_hex(end_entity.as_ref());
            return if self
                .policy
                .certificate_fingerprints
                .iter()
                .any(|f| *f == fingerprint)
            {
                // Pinned certificate: CA errors are irrelevant.
                Ok(ServerCertVerified::assertion())
            } else {
                Err(TlsError::InvalidCertificate(
                    CertificateError::ApplicationVerificationFailure,
                ))
            };
        }

        if !self.policy.public_key_fingerprints.is_empty() {
            let spki = spki_der(end_entity.as_ref()).ok_or(TlsError::InvalidCertificate(
                CertificateError::BadEncoding,
            ))?;
            let fingerprint = sha256_hex(spki);
            return if self
                .policy
                .public_key_fingerprints
                .iter()
                .any(|f| *f == fingerprint)
            {
                Ok(ServerCertVerified::assertion())
            } else {
                Err(TlsError::InvalidCertificate(
                    CertificateError::ApplicationVerificationFailure,
                ))
            };
        }

        match &self.webpki {
            Some(webpki) => {
                webpki.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            }
            None => Err(TlsError::InvalidCertificate(CertificateError::UnknownIssuer)),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        tokio_rustls::rustls::crypto::verify_tls12_signature(
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
    ) -> Result<HandshakeSignatureValid, TlsError> {
        tokio_rustls::rustls::crypto::verify_tls13_signature(
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

    fn requires_raw_public_keys(&self) -> bool {
        false
    }
}

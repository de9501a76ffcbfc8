//! TLS configuration for the STARTTLS upgrade.
//!
//! The responder presents a certificate chain loaded from PEM files;
//! the initiator verifies against a configured CA bundle unless
//! verification has been explicitly disabled. TLS 1.2 is the floor.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{Error, Result};

/// Map a configured minimum version to the protocol set offered.
fn protocol_versions(min_version: &str) -> Result<&'static [&'static SupportedProtocolVersion]> {
    static TLS12_AND_13: [&SupportedProtocolVersion; 2] =
        [&rustls::version::TLS13, &rustls::version::TLS12];
    static TLS13_ONLY: [&SupportedProtocolVersion; 1] = [&rustls::version::TLS13];

    match min_version {
        "1.2" | "" => Ok(&TLS12_AND_13),
        "1.3" => Ok(&TLS13_ONLY),
        other => Err(Error::config(format!(
            "unsupported tls.min_version: {other}"
        ))),
    }
}

/// Build the responder's TLS acceptor from PEM cert/key files.
pub fn acceptor_from_pem(
    cert_path: &Path,
    key_path: &Path,
    min_version: &str,
) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = ServerConfig::builder_with_protocol_versions(protocol_versions(min_version)?)
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::tls(format!("invalid certificate/key: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build the initiator's TLS connector.
///
/// With `skip_verify` the peer certificate is accepted unconditionally;
/// otherwise `ca_cert` must name a PEM bundle of trust anchors.
pub fn connector(ca_cert: Option<&Path>, skip_verify: bool) -> Result<TlsConnector> {
    let versions = protocol_versions("1.2")?;

    let config = if skip_verify {
        ClientConfig::builder_with_protocol_versions(versions)
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureServerCertVerifier))
            .with_no_client_auth()
    } else {
        let ca_path = ca_cert.ok_or_else(|| {
            Error::config("ca_cert is required unless insecure_skip_verify is set")
        })?;
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_path)? {
            roots
                .add(cert)
                .map_err(|e| Error::tls(format!("invalid CA certificate: {e}")))?;
        }
        if roots.is_empty() {
            return Err(Error::config(format!(
                "no certificates found in {}",
                ca_path.display()
            )));
        }
        ClientConfig::builder_with_protocol_versions(versions)
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::config(format!("cannot open {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);

    let mut certs = Vec::new();
    for cert in rustls_pemfile::certs(&mut reader) {
        certs.push(cert.map_err(|e| Error::tls(format!("bad certificate PEM: {e}")))?);
    }
    if certs.is_empty() {
        return Err(Error::config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load a private key, trying PKCS#8, then RSA, then SEC1 encodings.
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let open = || -> Result<BufReader<File>> {
        let file = File::open(path)
            .map_err(|e| Error::config(format!("cannot open {}: {e}", path.display())))?;
        Ok(BufReader::new(file))
    };

    let mut reader = open()?;
    if let Some(key) = rustls_pemfile::pkcs8_private_keys(&mut reader).next() {
        let key = key.map_err(|e| Error::tls(format!("bad PKCS#8 key: {e}")))?;
        return Ok(PrivateKeyDer::from(key));
    }

    let mut reader = open()?;
    if let Some(key) = rustls_pemfile::rsa_private_keys(&mut reader).next() {
        let key = key.map_err(|e| Error::tls(format!("bad RSA key: {e}")))?;
        return Ok(PrivateKeyDer::from(key));
    }

    let mut reader = open()?;
    if let Some(key) = rustls_pemfile::ec_private_keys(&mut reader).next() {
        let key = key.map_err(|e| Error::tls(format!("bad EC key: {e}")))?;
        return Ok(PrivateKeyDer::from(key));
    }

    Err(Error::config(format!(
        "no private key found in {}",
        path.display()
    )))
}

/// Certificate verifier that accepts anything. Selected only by the
/// explicit `insecure_skip_verify` toggle.
#[derive(Debug)]
struct InsecureServerCertVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

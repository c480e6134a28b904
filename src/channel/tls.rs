// SPDX-License-Identifier: MIT OR Apache-2.0

//! Build a rustls client configuration from a [`TlsPolicy`].

use crate::config::TlsPolicy;
use crate::error::{Error, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::path::Path;
use std::sync::Arc;

/// Build the rustls `ClientConfig` for a policy. gRPC requires ALPN `h2`,
/// which is set here.
pub fn client_config(policy: &TlsPolicy) -> Result<rustls::ClientConfig> {
    // Install ring as the default crypto provider; a no-op if another
    // provider won the race.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let root_store = build_root_store(policy)?;

    let builder = rustls::ClientConfig::builder().with_root_certificates(root_store.clone());

    let mut config = if policy.is_mutual() {
        let cert_path = policy.client_cert.as_deref().ok_or_else(|| {
            Error::InvalidConfig("mTLS requires dynamic-grpc.tls.client-cert".into())
        })?;
        let key_path = policy.client_key.as_deref().ok_or_else(|| {
            Error::InvalidConfig("mTLS requires dynamic-grpc.tls.client-key".into())
        })?;
        let client_certs = load_pem_certs(cert_path)?;
        let client_key = load_pem_key(key_path)?;
        builder
            .with_client_auth_cert(client_certs, client_key)
            .map_err(|e| Error::InvalidConfig(format!("Failed to configure client auth: {e}")))?
    } else {
        builder.with_no_client_auth()
    };

    if policy.trust_all {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerifier));
    } else if !policy.verify_hostname {
        let inner = WebPkiServerVerifier::builder(Arc::new(root_store))
            .build()
            .map_err(|e| Error::InvalidConfig(format!("Failed to build verifier: {e}")))?;
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoHostnameVerifier { inner }));
    }

    config.alpn_protocols = vec![b"h2".to_vec()];
    Ok(config)
}

fn build_root_store(policy: &TlsPolicy) -> Result<rustls::RootCertStore> {
    let mut root_store = rustls::RootCertStore::empty();
    if policy.trust_certs.is_empty() {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    } else {
        for path in &policy.trust_certs {
            for cert in load_pem_certs(path)? {
                root_store.add(cert).map_err(|e| {
                    Error::InvalidConfig(format!(
                        "Failed to add trust cert {}: {e}",
                        path.display()
                    ))
                })?;
            }
        }
    }
    Ok(root_store)
}

fn load_pem_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .map_err(|e| Error::InvalidConfig(format!("Failed to read {}: {e}", path.display())))?;
    let mut reader = std::io::BufReader::new(pem.as_slice());
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            Error::InvalidConfig(format!("Failed to parse PEM in {}: {e}", path.display()))
        })?;
    if certs.is_empty() {
        return Err(Error::InvalidConfig(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_pem_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)
        .map_err(|e| Error::InvalidConfig(format!("Failed to read {}: {e}", path.display())))?;
    let mut reader = std::io::BufReader::new(pem.as_slice());

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Ok(PrivateKeyDer::Pkcs1(key)),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Ok(PrivateKeyDer::Pkcs8(key)),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Ok(PrivateKeyDer::Sec1(key)),
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(e) => {
                return Err(Error::InvalidConfig(format!(
                    "Failed to parse PEM key in {}: {e}",
                    path.display()
                )));
            }
        }
    }

    Err(Error::InvalidConfig(format!(
        "No private key found in {}",
        path.display()
    )))
}

/// Accepts any certificate. Only reachable when `trust-all` is explicitly
/// enabled, which config validation forbids in the production profile.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA1,
            rustls::SignatureScheme::ECDSA_SHA1_Legacy,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::ED448,
        ]
    }
}

/// Validates the chain against the trust store but tolerates a name
/// mismatch.
#[derive(Debug)]
struct NoHostnameVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for NoHostnameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &rustls::pki_types::ServerName<'_>,
        ocsp_response: &[u8],
        now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::NotValidForName,
            )) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn trust_all_builds_without_certs() {
        let policy = TlsPolicy {
            enabled: true,
            trust_all: true,
            ..Default::default()
        };
        let config = client_config(&policy).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);
    }

    #[test]
    fn default_policy_uses_system_roots() {
        let policy = TlsPolicy {
            enabled: true,
            ..Default::default()
        };
        assert!(client_config(&policy).is_ok());
    }

    #[test]
    fn missing_trust_cert_file_is_invalid_config() {
        let policy = TlsPolicy {
            enabled: true,
            trust_certs: vec!["/does/not/exist.pem".into()],
            ..Default::default()
        };
        assert!(matches!(
            client_config(&policy),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn garbage_pem_is_invalid_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not a pem at all").unwrap();

        let policy = TlsPolicy {
            enabled: true,
            trust_certs: vec![file.path().to_path_buf()],
            ..Default::default()
        };
        assert!(matches!(
            client_config(&policy),
            Err(Error::InvalidConfig(_))
        ));
    }
}

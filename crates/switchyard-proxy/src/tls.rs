//! rustls configuration for both sides of the proxy.
//!
//! The client side is used towards backends and route services: it
//! trusts the Mozilla roots plus `ca_certs`, optionally presents the
//! configured backend client certificate, and skips verification only
//! when `skip_ssl_validation` is set. The server side terminates client
//! TLS on `ssl_port` with the configured certificate, cipher-suite
//! allow-list and client-certificate mode.

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tracing::{debug, warn};

use switchyard_core::RouterConfig;
use switchyard_core::config::ClientCertValidation;

use crate::error::TlsError;

/// Parse every certificate in a PEM bundle.
pub fn load_certs(pem: &str, source: &'static str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Pem(format!("{source}: {e}")))?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate(source));
    }
    Ok(certs)
}

/// Parse the first private key in a PEM bundle.
pub fn load_key(pem: &str, source: &'static str) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| TlsError::Pem(format!("{source}: {e}")))?
        .ok_or(TlsError::NoPrivateKey(source))
}

/// The ring provider restricted to `allowed` cipher suites (by name,
/// case-insensitive). An empty list keeps the provider defaults.
pub fn provider(allowed: &[String]) -> Result<Arc<CryptoProvider>, TlsError> {
    let mut provider = rustls::crypto::ring::default_provider();
    if !allowed.is_empty() {
        provider.cipher_suites.retain(|suite| {
            let name = format!("{:?}", suite.suite());
            allowed.iter().any(|a| a.eq_ignore_ascii_case(&name))
        });
        if provider.cipher_suites.is_empty() {
            return Err(TlsError::NoCipherSuites(allowed.to_vec()));
        }
    }
    Ok(Arc::new(provider))
}

fn extra_roots(pem: &str) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    if !pem.trim().is_empty() {
        for cert in load_certs(pem, "ca_certs")? {
            roots.add(cert)?;
        }
    }
    Ok(roots)
}

/// Client config for backend and route-service connections.
pub fn client_config(config: &RouterConfig) -> Result<Arc<ClientConfig>, TlsError> {
    let builder = ClientConfig::builder_with_provider(provider(&config.cipher_suites)?)
        .with_safe_default_protocol_versions()?;

    let builder = if config.skip_ssl_validation {
        warn!("backend certificate verification disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerifier))
    } else {
        let mut roots = extra_roots(&config.ca_certs)?;
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots)
    };

    let mut client = match config.backends.client_cert() {
        Some(pem) => {
            debug!("presenting client certificate to TLS backends");
            builder.with_client_auth_cert(
                load_certs(&pem.cert_chain, "backends.cert_chain")?,
                load_key(&pem.private_key, "backends.private_key")?,
            )?
        }
        None => builder.with_no_client_auth(),
    };
    client.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(client))
}

/// Server config for the TLS listener.
pub fn server_config(config: &RouterConfig) -> Result<Arc<ServerConfig>, TlsError> {
    let provider = provider(&config.cipher_suites)?;
    let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let builder = match config.client_cert_validation {
        ClientCertValidation::None => builder.with_no_client_auth(),
        mode => {
            let roots = Arc::new(extra_roots(&config.ca_certs)?);
            let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider);
            let verifier = if mode == ClientCertValidation::Request {
                verifier.allow_unauthenticated()
            } else {
                verifier
            };
            let verifier = verifier
                .build()
                .map_err(|e| TlsError::Verifier(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        }
    };

    let mut server = builder.with_single_cert(
        load_certs(&config.tls_pem.cert_chain, "tls_pem.cert_chain")?,
        load_key(&config.tls_pem.private_key, "tls_pem.private_key")?,
    )?;
    server.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(server))
}

// ── Verification bypass for skip_ssl_validation ─────────────────────

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    #[derive(Debug)]
    pub struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

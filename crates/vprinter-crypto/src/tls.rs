//! rustls configurations.
//!
//! Two independent configurations exist: the server side presents the leaf
//! chain to slicers, the client side dials real printers in relay mode.
//! Real printers carry vendor-signed certificates we cannot validate, so the
//! client accepts any certificate while still checking handshake signatures.

use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, ring};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use tracing::debug;

use crate::certs::CertPaths;
use crate::error::CertError;

/// Install ring as the process-wide default provider.
///
/// Safe to call repeatedly; the `Err` case only means one is already set.
pub fn install_crypto_provider() {
    let _ = ring::default_provider().install_default();
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Server configuration presenting the chain at `paths`.
pub fn server_config(paths: &CertPaths) -> Result<Arc<ServerConfig>, CertError> {
    let certs = load_certs(&paths.cert)?;
    let key = PrivateKeyDer::from_pem_file(&paths.key).map_err(|e| {
        CertError::Parse(format!(
            "Failed to read private key {}: {e}",
            paths.key.display()
        ))
    })?;

    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    debug!(cert = %paths.cert.display(), "TLS server configuration built");
    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let parse_err =
        |e: rustls::pki_types::pem::Error| CertError::Parse(format!("{}: {e}", path.display()));
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(parse_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(parse_err)?;
    if certs.is_empty() {
        return Err(CertError::Parse(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

/// Client configuration for dialing real printers.
///
/// Certificate chains are not validated. Never use this for anything other
/// than the relay's outbound leg.
pub fn insecure_client_config() -> Result<Arc<ClientConfig>, CertError> {
    let provider = provider();
    let config = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Accepts every server certificate but still verifies handshake signatures.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

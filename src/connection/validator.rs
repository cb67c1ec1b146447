//! Server certificate validation hook for the in-band TLS handshake

use crate::{Error, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{
    verify_tls12_signature, verify_tls13_signature, CryptoProvider, WebPkiSupportedAlgorithms,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;

/// Accepts or rejects the server's certificate during `EnableSsl`.
///
/// When validation is enforced, the decision is delegated to the webpki
/// verifier: chain of trust against the configured roots plus hostname
/// matching against the target server name. Any error it raises rejects the
/// peer. When validation is not enforced every certificate is accepted;
/// handshake signatures are still checked so the peer must hold the key of
/// the certificate it presented.
#[derive(Debug)]
pub struct CertificateValidator {
    target_server: String,
    policy: Option<Arc<WebPkiServerVerifier>>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl CertificateValidator {
    /// Create a validator for `target_server`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if validation is enforced and no verifier can
    /// be built from `roots` (for example, an empty root store).
    pub fn new(
        target_server: impl Into<String>,
        validate: bool,
        roots: Arc<RootCertStore>,
        provider: Arc<CryptoProvider>,
    ) -> Result<Self> {
        let algorithms = provider.signature_verification_algorithms;
        let policy = if validate {
            let verifier = WebPkiServerVerifier::builder_with_provider(roots, provider)
                .build()
                .map_err(|e| {
                    Error::Config(format!("cannot build certificate verifier: {}", e))
                })?;
            Some(verifier)
        } else {
            None
        };

        Ok(Self {
            target_server: target_server.into(),
            policy,
            algorithms,
        })
    }

    /// Whether certificates are actually checked
    pub fn is_enforced(&self) -> bool {
        self.policy.is_some()
    }

    /// Server identity certificates are matched against
    pub fn target_server(&self) -> &str {
        &self.target_server
    }
}

impl ServerCertVerifier for CertificateValidator {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let Some(policy) = &self.policy else {
            tracing::debug!(server = %self.target_server, "certificate validation not enforced");
            return Ok(ServerCertVerified::assertion());
        };

        policy
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            .map_err(|e| {
                tracing::warn!(server = %self.target_server, error = %e, "server certificate rejected");
                e
            })
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

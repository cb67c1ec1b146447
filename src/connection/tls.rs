//! TLS trust configuration for the in-band handshake.
//!
//! Whether the server certificate is checked at all is decided per call to
//! `enable_tls`; this module only decides *what* it is checked against.

use super::validator::CertificateValidator;
use crate::{Error, Result};
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::Item;
use rustls_pki_types::ServerName;
use std::fs;
use std::sync::Arc;

/// Where trusted root certificates come from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RootSource {
    /// Operating system trust store
    #[default]
    Native,
    /// Mozilla roots bundled with `webpki-roots`
    WebPki,
    /// PEM file with one or more CA certificates
    CaFile(String),
}

/// TLS configuration for encrypted pipe connections.
///
/// # Examples
///
/// ```ignore
/// use npipe_wire::connection::TlsConfig;
///
/// // System root certificates
/// let tls = TlsConfig::builder().build()?;
///
/// // Private CA
/// let tls = TlsConfig::builder()
///     .ca_cert_path("/etc/sqlserver/ca.pem")
///     .build()?;
/// ```
#[derive(Clone)]
pub struct TlsConfig {
    roots: RootSource,
    root_store: Arc<RootCertStore>,
    provider: Arc<CryptoProvider>,
}

impl TlsConfig {
    /// Create a new TLS configuration builder.
    pub fn builder() -> TlsConfigBuilder {
        TlsConfigBuilder::default()
    }

    /// Source of the trusted roots
    pub fn roots(&self) -> &RootSource {
        &self.roots
    }

    /// Number of trusted root certificates loaded
    pub fn root_count(&self) -> usize {
        self.root_store.len()
    }

    /// Build the certificate validator for one handshake against `target_server`.
    pub fn validator(&self, target_server: &str, validate: bool) -> Result<CertificateValidator> {
        CertificateValidator::new(
            target_server,
            validate,
            self.root_store.clone(),
            self.provider.clone(),
        )
    }

    /// Build the rustls ClientConfig for one handshake.
    pub fn client_config(&self, validator: CertificateValidator) -> Result<Arc<ClientConfig>> {
        let config = ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Config(format!("unsupported TLS protocol versions: {}", e)))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(validator))
            .with_no_client_auth();
        Ok(Arc::new(config))
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("roots", &self.roots)
            .field("root_count", &self.root_store.len())
            .field("provider", &"<CryptoProvider>")
            .finish()
    }
}

/// Builder for TLS configuration.
#[derive(Debug, Default)]
pub struct TlsConfigBuilder {
    roots: RootSource,
    provider: Option<Arc<CryptoProvider>>,
}

impl TlsConfigBuilder {
    /// Trust only the CA certificates in a PEM file.
    pub fn ca_cert_path(mut self, path: impl Into<String>) -> Self {
        self.roots = RootSource::CaFile(path.into());
        self
    }

    /// Trust the bundled Mozilla roots instead of the system store.
    pub fn webpki_roots(mut self) -> Self {
        self.roots = RootSource::WebPki;
        self
    }

    /// Use a specific crypto provider (default: the process default, else aws-lc-rs).
    pub fn crypto_provider(mut self, provider: Arc<CryptoProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Build the TLS configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the CA file cannot be read or contains no
    /// certificate. An empty system store is not an error here: it only
    /// matters once validation is enforced.
    pub fn build(self) -> Result<TlsConfig> {
        let root_store = match &self.roots {
            RootSource::CaFile(path) => load_custom_ca(path)?,
            RootSource::WebPki => RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            },
            RootSource::Native => {
                let result = rustls_native_certs::load_native_certs();
                let mut store = RootCertStore::empty();
                let (added, ignored) = store.add_parsable_certificates(result.certs);
                if !result.errors.is_empty() || ignored > 0 {
                    tracing::warn!(
                        added,
                        ignored,
                        errors = result.errors.len(),
                        "problems loading system root certificates"
                    );
                }
                store
            }
        };

        let provider = self.provider.unwrap_or_else(default_provider);

        Ok(TlsConfig {
            roots: self.roots,
            root_store: Arc::new(root_store),
            provider,
        })
    }
}

fn default_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// Load CA certificates from a PEM file.
fn load_custom_ca(ca_path: &str) -> Result<RootCertStore> {
    let ca_cert_data = fs::read(ca_path).map_err(|e| {
        Error::Config(format!(
            "Failed to read CA certificate file '{}': {}",
            ca_path, e
        ))
    })?;

    let mut reader = std::io::Cursor::new(&ca_cert_data);
    let mut root_store = RootCertStore::empty();
    let mut found_certs = 0;

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(Item::X509Certificate(cert))) => {
                let _ = root_store.add_parsable_certificates(std::iter::once(cert));
                found_certs += 1;
            }
            Ok(Some(_)) => {
                // Skip non-certificate items (private keys, etc.)
            }
            Ok(None) => break,
            Err(_) => {
                return Err(Error::Config(format!(
                    "Failed to parse CA certificate from '{}'",
                    ca_path
                )));
            }
        }
    }

    if found_certs == 0 {
        return Err(Error::Config(format!(
            "No valid certificates found in '{}'",
            ca_path
        )));
    }

    Ok(root_store)
}

/// Parse server name from hostname for TLS SNI (Server Name Indication).
///
/// Local aliases (`.`, `(local)`) become `localhost`.
///
/// # Errors
///
/// Returns an error if the hostname is invalid.
pub fn parse_server_name(hostname: &str) -> Result<String> {
    if hostname == "." || hostname.eq_ignore_ascii_case("(local)") {
        return Ok("localhost".to_string());
    }

    // Remove trailing dot if present
    let hostname = hostname.trim_end_matches('.');

    if hostname.is_empty() || hostname.len() > 253 {
        return Err(Error::Config(format!(
            "Invalid hostname for TLS: '{}'",
            hostname
        )));
    }

    if !hostname
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '.' || c == '_')
    {
        return Err(Error::Config(format!(
            "Invalid hostname for TLS: '{}'",
            hostname
        )));
    }

    Ok(hostname.to_string())
}

/// rustls server name for `hostname`
pub fn tls_server_name(hostname: &str) -> Result<ServerName<'static>> {
    let name = parse_server_name(hostname)?;
    ServerName::try_from(name)
        .map_err(|_| Error::Config(format!("Invalid hostname for TLS: {}", hostname)))
}

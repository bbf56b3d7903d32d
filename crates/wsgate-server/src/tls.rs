//! TLS material for `wss://`.
//!
//! Certificates come from the configured PEM files or, when TLS is enabled
//! without paths and `autoGenerate` is on, from a self-signed certificate
//! generated in memory at startup.

use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tracing::{debug, info, warn};
use wsgate_settings::TlsSettings;

use crate::errors::TlsError;

/// PEM-encoded certificate and private key.
#[derive(Clone)]
pub struct PemPair {
    /// Certificate chain.
    pub cert_chain: String,
    /// PKCS#8 private key.
    pub private_key: String,
}

impl std::fmt::Debug for PemPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PemPair")
            .field("cert_chain", &self.cert_chain.len())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Build the rustls server configuration described by `settings`.
pub fn server_config(settings: &TlsSettings) -> Result<Arc<ServerConfig>, TlsError> {
    let (certs, key) = match (&settings.cert_chain_path, &settings.private_key_path) {
        (Some(chain), Some(key)) => {
            info!(cert_chain = %chain.display(), "loading tls certificate");
            (load_certs(chain)?, load_private_key(key)?)
        }
        (None, None) if settings.auto_generate => {
            warn!("tls enabled without a certificate, generating a self-signed one");
            let pem = generate_self_signed(&["localhost".to_owned()])?;
            (parse_certs(&pem.cert_chain)?, parse_private_key(&pem.private_key)?)
        }
        _ => return Err(TlsError::NoCertificateConfigured),
    };
    build(certs, key)
}

/// Assemble a rustls config advertising HTTP/1.1 only.
pub fn build(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, TlsError> {
    // Installing twice is harmless; the first provider wins
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Self-signed certificate for `names`, valid for local development.
pub fn generate_self_signed(names: &[String]) -> Result<PemPair, TlsError> {
    use rcgen::{CertificateParams, DnType, KeyPair};

    let mut params =
        CertificateParams::new(names.to_vec()).map_err(|e| TlsError::Generate(e.to_string()))?;
    params
        .distinguished_name
        .push(DnType::CommonName, "wsgate self-signed");
    let key_pair = KeyPair::generate().map_err(|e| TlsError::Generate(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TlsError::Generate(e.to_string()))?;
    Ok(PemPair {
        cert_chain: cert.pem(),
        private_key: key_pair.serialize_pem(),
    })
}

/// Load a certificate chain from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    ensure_exists(path, "certificate chain")?;
    let certs = CertificateDer::pem_file_iter(path)
        .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
        .map_err(|e| TlsError::CertRead {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.display().to_string()));
    }
    debug!(count = certs.len(), path = %path.display(), "loaded certificates");
    Ok(certs)
}

/// Load a private key (PKCS#8, PKCS#1 or SEC1) from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    ensure_exists(path, "private key")?;
    PrivateKeyDer::from_pem_file(path).map_err(|e| TlsError::KeyRead {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    CertificateDer::pem_slice_iter(pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertRead {
            path: "<generated>".into(),
            message: e.to_string(),
        })
}

fn parse_private_key(pem: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    PrivateKeyDer::from_pem_slice(pem.as_bytes()).map_err(|e| TlsError::KeyRead {
        path: "<generated>".into(),
        message: e.to_string(),
    })
}

fn ensure_exists(path: &Path, kind: &'static str) -> Result<(), TlsError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(TlsError::MissingFile {
            kind,
            path: path.display().to_string(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

//! Building the rustls server configuration used by the encryption stage.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};

use crate::error::LifecycleError;

/// Produces the TLS server configuration for a registrar.
///
/// Called at most once per registrar, when the first connection needs an
/// encryption stage.
pub trait TlsContextBuilder: Send + Sync {
    fn build(&self) -> Result<Arc<ServerConfig>, LifecycleError>;
}

/// Loads a certificate chain and private key from PEM files.
#[derive(Clone)]
pub struct PemFiles {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl PemFiles {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }
}

impl TlsContextBuilder for PemFiles {
    fn build(&self) -> Result<Arc<ServerConfig>, LifecycleError> {
        let certs = read_certs(BufReader::new(open(&self.cert_path)?))?;
        let key = read_private_key(BufReader::new(open(&self.key_path)?))?;
        server_config(certs, key)
    }
}

impl fmt::Debug for PemFiles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PemFiles")
            .field("cert_path", &self.cert_path)
            .finish()
    }
}

/// Certificate chain and key already in memory, PEM encoded.
#[derive(Clone)]
pub struct PemBytes {
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
}

impl PemBytes {
    pub fn new(cert_pem: impl Into<Vec<u8>>, key_pem: impl Into<Vec<u8>>) -> Self {
        Self {
            cert_pem: cert_pem.into(),
            key_pem: key_pem.into(),
        }
    }
}

impl TlsContextBuilder for PemBytes {
    fn build(&self) -> Result<Arc<ServerConfig>, LifecycleError> {
        let certs = read_certs(BufReader::new(self.cert_pem.as_slice()))?;
        let key = read_private_key(BufReader::new(self.key_pem.as_slice()))?;
        server_config(certs, key)
    }
}

fn open(path: &Path) -> Result<File, LifecycleError> {
    File::open(path)
        .map_err(|e| LifecycleError::Tls(format!("failed to open {}: {}", path.display(), e)))
}

fn read_certs(mut reader: impl std::io::BufRead) -> Result<Vec<CertificateDer<'static>>, LifecycleError> {
    let certs = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| LifecycleError::Tls(format!("failed to parse certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(LifecycleError::Tls("no certificates found".to_string()));
    }
    Ok(certs)
}

fn read_private_key(mut reader: impl std::io::BufRead) -> Result<PrivateKeyDer<'static>, LifecycleError> {
    private_key(&mut reader)
        .map_err(|e| LifecycleError::Tls(format!("failed to read private key: {}", e)))?
        .ok_or_else(|| LifecycleError::Tls("no private key found".to_string()))
}

fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, LifecycleError> {
    let mut config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| LifecycleError::Tls(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| LifecycleError::Tls(format!("invalid certificate or key: {}", e)))?;

    // the codec stage speaks HTTP/1 only
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_files() {
        let builder = PemFiles::new("/nonexistent/cert.pem", "/nonexistent/key.pem");
        match builder.build() {
            Err(LifecycleError::Tls(message)) => assert!(message.contains("/nonexistent/cert.pem")),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    /// Empty PEM input is reported instead of producing an unusable config.
    #[test]
    fn test_empty_pem() {
        match PemBytes::new(Vec::new(), Vec::new()).build() {
            Err(LifecycleError::Tls(message)) => assert_eq!(message, "no certificates found"),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }
}

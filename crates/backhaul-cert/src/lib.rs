//! TLS material loading
//!
//! The relay terminates TLS with a certificate/key pair; satellites verify
//! it against a pinned pool loaded from the same PEM file. No client
//! certificates are used anywhere; peer identity is carried by the
//! challenge/response layer instead.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::{TlsAcceptor, TlsConnector};

#[derive(Debug, Error)]
pub enum CertError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse PEM in {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("no certificates found in {0}")]
    EmptyCertFile(String),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] rustls::Error),
}

// rustls requires a process-wide crypto provider before any config is built.
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("rustls crypto provider already installed");
        }
    });
}

/// Load a certificate chain from a PEM file.
pub fn load_certs(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| CertError::Open {
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

    if certs.is_empty() {
        return Err(CertError::EmptyCertFile(path.display().to_string()));
    }
    Ok(certs)
}

/// Load a private key from a PEM file.
pub fn load_private_key(path: impl AsRef<Path>) -> Result<PrivateKeyDer<'static>, CertError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| CertError::Open {
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| CertError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| CertError::NoPrivateKey(path.display().to_string()))
}

/// Build the relay-side acceptor from a certificate/key pair on disk.
pub fn build_acceptor(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<TlsAcceptor, CertError> {
    ensure_crypto_provider();

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build a satellite-side connector pinned to the certificates in `ca_path`.
///
/// The pool typically contains just the relay's own (self-signed)
/// certificate; the system never consults the platform trust store.
pub fn build_connector(ca_path: impl AsRef<Path>) -> Result<TlsConnector, CertError> {
    ensure_crypto_provider();

    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_path)? {
        roots.add(cert)?;
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_self_signed(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
        std::fs::create_dir_all(dir).unwrap();
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();

        let cert_path = dir.join("server.crt");
        let key_path = dir.join("server.key");

        let mut cert_file = File::create(&cert_path).unwrap();
        cert_file.write_all(cert.cert.pem().as_bytes()).unwrap();

        let mut key_file = File::create(&key_path).unwrap();
        key_file
            .write_all(cert.key_pair.serialize_pem().as_bytes())
            .unwrap();

        (cert_path, key_path)
    }

    #[test]
    fn test_acceptor_and_connector_from_files() {
        let dir = std::env::temp_dir().join("backhaul-cert-test");
        let (cert_path, key_path) = write_self_signed(&dir);

        build_acceptor(&cert_path, &key_path).unwrap();
        build_connector(&cert_path).unwrap();
    }

    #[test]
    fn test_missing_file_is_open_error() {
        let result = load_certs("/nonexistent/server.crt");
        assert!(matches!(result, Err(CertError::Open { .. })));
    }

    #[test]
    fn test_empty_pem_rejected() {
        let dir = std::env::temp_dir().join("backhaul-cert-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("empty.crt");
        std::fs::write(&path, "").unwrap();

        assert!(matches!(load_certs(&path), Err(CertError::EmptyCertFile(_))));
    }

    #[test]
    fn test_key_file_without_key_rejected() {
        let dir = std::env::temp_dir().join("backhaul-cert-test");
        let (cert_path, _) = write_self_signed(&dir);

        // A cert PEM contains no private key.
        assert!(matches!(
            load_private_key(&cert_path),
            Err(CertError::NoPrivateKey(_))
        ));
    }
}

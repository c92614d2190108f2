//! TLS material for the secure listener

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use rustls::{Certificate, PrivateKey, ServerConfig};
use tokio_rustls::TlsAcceptor;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no PKCS#8, RSA or EC private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("invalid certificate or key: {0}")]
    Config(#[from] rustls::Error),
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

/// Load the certificate chain from a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<Certificate>, TlsError> {
    let certs = rustls_pemfile::certs(&mut open(path)?).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

/// Load the first private key from a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKey, TlsError> {
    let items = rustls_pemfile::read_all(&mut open(path)?).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    items
        .into_iter()
        .find_map(|item| match item {
            rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::ECKey(key) => Some(PrivateKey(key)),
            _ => None,
        })
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

/// Build the acceptor for the `wss://` listener
pub fn load_acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor, TlsError> {
    let certs = load_certs(cert)?;
    let key = load_private_key(key)?;

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

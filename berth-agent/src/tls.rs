//! TLS material loading for the HTTPS listener.
//!
//! Certificates and keys are PEM files named by `TLS_CERT_PATH` and
//! `TLS_KEY_PATH`. Missing or unparsable material is a startup error; the
//! agent exits non-zero rather than serving plaintext by accident.

use axum_server::tls_rustls::RustlsConfig;
use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("certificate file not found: {0}")]
    CertificateNotFound(PathBuf),

    #[error("private key file not found: {0}")]
    PrivateKeyNotFound(PathBuf),

    #[error("failed to parse certificate: {0}")]
    CertificateParseFailed(String),

    #[error("failed to parse private key: {0}")]
    PrivateKeyParseFailed(String),

    #[error("no private key found in file")]
    NoPrivateKeysFound,

    #[error("TLS configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Build an axum-server rustls config from PEM files.
pub async fn load_rustls_config(cert: &Path, key: &Path) -> Result<RustlsConfig, TlsError> {
    let cert_chain = load_certificates(cert).await?;
    let private_key = load_private_key(key).await?;

    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| TlsError::ConfigurationError(e.to_string()))?;
    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(RustlsConfig::from_config(Arc::new(server_config)))
}

async fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    if !path.exists() {
        return Err(TlsError::CertificateNotFound(path.to_path_buf()));
    }
    let pem_data = fs::read(path).await?;

    let mut reader = BufReader::new(&pem_data[..]);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateParseFailed(e.to_string()))?;

    if certs.is_empty() {
        return Err(TlsError::CertificateParseFailed(
            "no certificates found in file".to_string(),
        ));
    }
    Ok(certs)
}

async fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    if !path.exists() {
        return Err(TlsError::PrivateKeyNotFound(path.to_path_buf()));
    }
    let pem_data = fs::read(path).await?;

    let mut reader = BufReader::new(&pem_data[..]);
    let keys = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::PrivateKeyParseFailed(e.to_string()))?;
    if let Some(key) = keys.into_iter().next() {
        return Ok(PrivateKeyDer::from(key));
    }

    let mut reader = BufReader::new(&pem_data[..]);
    let keys = rustls_pemfile::rsa_private_keys(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::PrivateKeyParseFailed(e.to_string()))?;
    if let Some(key) = keys.into_iter().next() {
        return Ok(PrivateKeyDer::from(key));
    }

    Err(TlsError::NoPrivateKeysFound)
}

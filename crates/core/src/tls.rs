//! TLS server configuration from PEM material.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Errors building a TLS server configuration.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to parse PEM material: {0}")]
    Pem(#[from] std::io::Error),

    #[error("no certificate found in PEM material")]
    NoCertificate,

    #[error("no private key found in PEM material")]
    NoPrivateKey,

    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Builds a server configuration from PEM-encoded certificate chain and
/// private key text. `alpn` lists the protocols to advertise, most
/// preferred first; empty disables ALPN.
pub fn server_config(
    certificate_pem: &str,
    key_pem: &str,
    alpn: &[&[u8]],
) -> Result<Arc<rustls::ServerConfig>, TlsError> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut certificate_pem.as_bytes()).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate);
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_bytes())?
        .ok_or(TlsError::NoPrivateKey)?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

    Ok(Arc::new(config))
}

use std::path::Path;
use std::sync::Arc;

use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::TransportError;

/// Builds a TLS acceptor from one PEM file holding the certificate chain
/// and its private key.
pub(crate) fn build_acceptor(path: &Path) -> Result<TlsAcceptor, TransportError> {
    let pem = std::fs::read(path).map_err(|source| TransportError::CertificateRead {
        path: path.display().to_string(),
        source,
    })?;

    let mut certs: Vec<CertificateDer<'static>> = Vec::new();
    let mut key: Option<PrivateKeyDer<'static>> = None;
    for item in rustls_pemfile::read_all(&mut pem.as_slice()) {
        match item {
            Ok(rustls_pemfile::Item::X509Certificate(cert)) => certs.push(cert),
            Ok(rustls_pemfile::Item::Pkcs8Key(inner)) if key.is_none() => {
                key = Some(PrivateKeyDer::Pkcs8(inner));
            }
            Ok(rustls_pemfile::Item::Pkcs1Key(inner)) if key.is_none() => {
                key = Some(PrivateKeyDer::Pkcs1(inner));
            }
            Ok(rustls_pemfile::Item::Sec1Key(inner)) if key.is_none() => {
                key = Some(PrivateKeyDer::Sec1(inner));
            }
            Ok(_) => {}
            Err(source) => {
                return Err(TransportError::CertificateRead {
                    path: path.display().to_string(),
                    source,
                });
            }
        }
    }

    let (certs, key) = match (certs.is_empty(), key) {
        (false, Some(key)) => (certs, key),
        _ => {
            return Err(TransportError::CertificateInvalid {
                path: path.display().to_string(),
            });
        }
    };

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

//! TLS acceptor setup.
//!
//! The certificate file is PEM, holding the certificate chain and the
//! private key (PKCS#8, PKCS#1 or SEC1).

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read certificate file: {source}")]
    Read {
        #[from]
        source: std::io::Error,
    },

    #[error("certificate file contains no certificates")]
    NoCertificates,

    #[error("certificate file contains no private key")]
    NoPrivateKey,

    #[error("tls configuration rejected: {source}")]
    Config {
        #[from]
        source: rustls::Error,
    },
}

/// Builds a server-side TLS acceptor from a PEM file.
pub(crate) fn load_acceptor(path: &Path) -> Result<TlsAcceptor, TlsError> {
    let pem = std::fs::read(path)?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut &pem[..]).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates);
    }

    let key = rustls_pemfile::private_key(&mut &pem[..])?.ok_or(TlsError::NoPrivateKey)?;

    let config = rustls::ServerConfig::builder().with_no_client_auth().with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_acceptor(&dir.path().join("nope.pem")).err().expect("expected an error");
        assert!(matches!(err, TlsError::Read { .. }));
    }

    #[test]
    fn file_without_certificates_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        std::fs::File::create(&path).unwrap().write_all(b"not pem at all\n").unwrap();
        let err = load_acceptor(&path).err().expect("expected an error");
        assert!(matches!(err, TlsError::NoCertificates));
    }
}

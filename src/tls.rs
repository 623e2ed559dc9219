//! TLS Setup
//!
//! Loads PEM material and builds the mutually authenticated rustls
//! configurations used between `RemoteStore` and `StoreServer`.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::TlsConfig;
use crate::error::{Error, Result};

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| Error::Tls(format!("cannot open {}: {}", path.display(), e)))
}

/// Read every certificate in a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::Tls(format!("invalid certificate in {}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificates found in {}", path.display())));
    }
    Ok(certs)
}

/// Read the first private key in a PEM file
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Tls(format!("invalid key in {}: {}", path.display(), e)))?
        .ok_or_else(|| Error::Tls(format!("no private key found in {}", path.display())))
}

/// Build a trust store from a CA bundle
pub fn load_roots(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| Error::Tls(format!("bad CA certificate in {}: {}", path.display(), e)))?;
    }
    Ok(roots)
}

/// Server side: present our certificate, require one signed by the CA
pub fn server_config(tls: &TlsConfig) -> Result<Arc<ServerConfig>> {
    let (cert, key, ca) = tls.require()?;
    let roots = load_roots(ca)?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| Error::Tls(format!("client verifier: {}", e)))?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(cert)?, load_key(key)?)
        .map_err(|e| Error::Tls(e.to_string()))?;
    Ok(Arc::new(config))
}

/// Client side: verify the server against the CA, present our certificate
pub fn client_config(tls: &TlsConfig) -> Result<Arc<ClientConfig>> {
    let (cert, key, ca) = tls.require()?;
    let config = ClientConfig::builder()
        .with_root_certificates(load_roots(ca)?)
        .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
        .map_err(|e| Error::Tls(e.to_string()))?;
    Ok(Arc::new(config))
}

pub fn acceptor(tls: &TlsConfig) -> Result<TlsAcceptor> {
    Ok(TlsAcceptor::from(server_config(tls)?))
}

pub fn connector(tls: &TlsConfig) -> Result<TlsConnector> {
    Ok(TlsConnector::from(client_config(tls)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_material_is_config_error() {
        let tls = TlsConfig {
            cert: Some("/tmp/cert.pem".into()),
            key: Some("/tmp/key.pem".into()),
            ca: None,
        };
        assert!(matches!(client_config(&tls), Err(Error::Config(_))));
        assert!(matches!(server_config(&tls), Err(Error::Config(_))));
    }

    #[test]
    fn test_unreadable_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.pem");
        assert!(matches!(load_certs(&missing), Err(Error::Tls(_))));

        let empty = dir.path().join("empty.pem");
        std::fs::write(&empty, "").unwrap();
        assert!(matches!(load_certs(&empty), Err(Error::Tls(msg)) if msg.contains("no certificates")));
        assert!(matches!(load_key(&empty), Err(Error::Tls(msg)) if msg.contains("no private key")));

        let tls = TlsConfig::new(&empty, &empty, &empty);
        assert!(matches!(connector(&tls), Err(Error::Tls(_))));
    }
}

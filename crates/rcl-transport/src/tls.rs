use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::TransportError;

/// Load certificate chain and private key from PEM files.
pub fn load_certs_and_key(
    cert_path: &str,
    key_path: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TransportError> {
    let cert_pem = std::fs::read(cert_path)?;
    let key_pem = std::fs::read(key_path)?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()?;

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key_pem[..])?
        .ok_or_else(|| TransportError::TlsSetup(format!("no private key found in {}", key_path)))?;

    Ok((certs, key))
}

/// Build a TLS acceptor for the server side.
pub fn build_server_tls(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, TransportError> {
    let (certs, key) = load_certs_and_key(cert_path, key_path)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build a TLS connector for the client side.
/// Trusts `ca_cert_path` when given, the webpki root set otherwise.
pub fn build_client_tls(ca_cert_path: Option<&str>) -> Result<TlsConnector, TransportError> {
    let mut root_store = rustls::RootCertStore::empty();

    if let Some(ca_path) = ca_cert_path {
        let ca_pem = std::fs::read(ca_path)?;
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &ca_pem[..])
            .collect::<Result<Vec<_>, _>>()?;
        for cert in certs {
            root_store.add(cert)?;
        }
    } else {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Server name for certificate verification, taken from the host part of `host:port`.
pub fn server_name_for(
    address: &str,
) -> Result<rustls::pki_types::ServerName<'static>, TransportError> {
    let host = address
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(address)
        .trim_start_matches('[')
        .trim_end_matches(']');
    rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|e| TransportError::TlsSetup(format!("invalid server name '{}': {}", host, e)))
}

//! TLS acceptor for the embedded broker and connector for the external
//! broker client.

use crate::config::{ClientTlsConfig, ServerTlsConfig};
use crate::error::BrokerError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Builds the listener-side acceptor, verifying client certificates when
/// `require_client_cert` is set.
pub fn create_tls_acceptor(config: &ServerTlsConfig) -> Result<TlsAcceptor, BrokerError> {
    let cert_path = config
        .cert_path
        .as_ref()
        .ok_or_else(|| BrokerError::TlsConfig("cert_path not set".into()))?;
    let key_path = config
        .key_path
        .as_ref()
        .ok_or_else(|| BrokerError::TlsConfig("key_path not set".into()))?;
    let client_ca_path = match (config.require_client_cert, &config.client_ca_path) {
        (true, None) => {
            return Err(BrokerError::TlsConfig(
                "client_ca_path not set for mTLS".into(),
            ))
        }
        (true, Some(path)) => Some(path),
        (false, _) => None,
    };

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let server_config = match client_ca_path {
        Some(ca_path) => {
            let roots = root_store_from(ca_path)?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| {
                    BrokerError::TlsConfig(format!("failed to build client verifier: {}", e))
                })?;
            rustls::ServerConfig::builder()
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
        }
        None => rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key),
    }
    .map_err(|e| BrokerError::TlsConfig(format!("invalid server cert/key: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Builds the client-side connector and the name presented for SNI.
///
/// Without `ca_cert_path` the bundled webpki roots are trusted.
pub fn create_tls_connector(
    config: &ClientTlsConfig,
    server_host: &str,
) -> Result<(TlsConnector, ServerName<'static>), BrokerError> {
    let roots = match &config.ca_cert_path {
        Some(ca_path) => root_store_from(ca_path)?,
        None => {
            let mut store = RootCertStore::empty();
            store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            store
        }
    };

    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
    let client_config = match (&config.client_cert_path, &config.client_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = load_private_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| BrokerError::TlsConfig(format!("invalid client cert/key: {}", e)))?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(BrokerError::TlsConfig(
                "client_cert_path and client_key_path must be set together".into(),
            ))
        }
    };

    let name = config.server_name.as_deref().unwrap_or(server_host);
    let server_name = ServerName::try_from(name.to_string())
        .map_err(|_| BrokerError::TlsConfig(format!("invalid server name: {}", name)))?;

    Ok((TlsConnector::from(Arc::new(client_config)), server_name))
}

fn root_store_from(path: &Path) -> Result<RootCertStore, BrokerError> {
    let mut store = RootCertStore::empty();
    for cert in load_certs(path)? {
        store
            .add(cert)
            .map_err(|e| BrokerError::TlsConfig(format!("invalid CA cert in {:?}: {}", path, e)))?;
    }
    Ok(store)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, BrokerError> {
    let file = File::open(path)
        .map_err(|e| BrokerError::TlsConfig(format!("cannot open cert file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| BrokerError::TlsConfig(format!("invalid cert file {:?}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(BrokerError::TlsConfig(format!(
            "no certificates found in {:?}",
            path
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, BrokerError> {
    let file = File::open(path)
        .map_err(|e| BrokerError::TlsConfig(format!("cannot open key file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    loop {
        let item = rustls_pemfile::read_one(&mut reader)
            .map_err(|e| BrokerError::TlsConfig(format!("invalid key file {:?}: {}", path, e)))?;
        match item {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            Some(_) => continue,
            None => {
                return Err(BrokerError::TlsConfig(format!(
                    "no private key found in {:?}",
                    path
                )))
            }
        }
    }
}

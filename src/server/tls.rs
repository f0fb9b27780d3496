use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::config::AppConfig;
use crate::error::{Error, Result};

/// Builds the dev server's TLS acceptor. `Ok(None)` when no certificate
/// is configured; unreadable or invalid key material is a config error.
pub fn load_tls_acceptor(config: &AppConfig) -> Result<Option<TlsAcceptor>> {
    let (Some(cert_path), Some(key_path)) = (&config.tls_cert_path, &config.tls_key_path) else {
        return Ok(None);
    };

    info!(
        "Loading TLS certificates from {} and {}",
        cert_path, key_path
    );

    let cert_file = File::open(cert_path)
        .map_err(|e| Error::Config(format!("cannot open cert file {}: {}", cert_path, e)))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<CertificateDer> = certs(&mut cert_reader).filter_map(|c| c.ok()).collect();
    if certs.is_empty() {
        return Err(Error::Config(format!("no certificates in {}", cert_path)));
    }

    let key_file = File::open(key_path)
        .map_err(|e| Error::Config(format!("cannot open key file {}: {}", key_path, e)))?;
    let mut key_reader = BufReader::new(key_file);
    let key = match private_key(&mut key_reader) {
        Ok(Some(k)) => k,
        _ => {
            return Err(Error::Config(format!(
                "failed to parse private key from {}",
                key_path
            )))
        }
    };

    let mut server_config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Config(format!("TLS setup failed: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::Config(format!("invalid TLS certificate: {}", e)))?;

    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
}

//! TLS configuration and certificate loading.
//!
//! Server configs are built on the `ring` crypto provider. TCP listeners
//! advertise `h2` ahead of `http/1.1` when HTTP/2 is allowed; QUIC
//! listeners use TLS 1.3 only and advertise `h3`.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;

use crate::error::GatewayError;

fn tls_error(reason: impl std::fmt::Display) -> GatewayError {
    GatewayError::create_component("tls", reason)
}

/// Load a PEM certificate chain and private key.
pub fn load_pem(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), GatewayError> {
    let cert_file = File::open(cert_path)
        .map_err(|e| tls_error(format!("certificate {}: {e}", cert_path.display())))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("certificate {}: {e}", cert_path.display())))?;
    if certs.is_empty() {
        return Err(tls_error(format!("no certificate in {}", cert_path.display())));
    }

    let key_file =
        File::open(key_path).map_err(|e| tls_error(format!("private key {}: {e}", key_path.display())))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| tls_error(format!("private key {}: {e}", key_path.display())))?
        .ok_or_else(|| tls_error(format!("no private key in {}", key_path.display())))?;

    Ok((certs, key))
}

/// Move `h2` to the front of an ALPN list, adding it when missing.
pub fn prefer_h2(alpn: &mut Vec<Vec<u8>>) {
    alpn.retain(|p| p.as_slice() != b"h2");
    alpn.insert(0, b"h2".to_vec());
}

/// Server config for a TCP listener.
pub fn server_config(
    cert_path: &Path,
    key_path: &Path,
    alpn: &[String],
    allow_http2: bool,
) -> Result<Arc<ServerConfig>, GatewayError> {
    let (certs, key) = load_pem(cert_path, key_path)?;
    let mut config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(tls_error)?;

    let mut protocols: Vec<Vec<u8>> = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
    if !protocols.iter().any(|p| p.as_slice() == b"http/1.1") {
        protocols.push(b"http/1.1".to_vec());
    }
    if allow_http2 {
        prefer_h2(&mut protocols);
    } else {
        protocols.retain(|p| p.as_slice() != b"h2");
    }
    config.alpn_protocols = protocols;
    Ok(Arc::new(config))
}

/// Server config for a QUIC listener.
pub fn quic_server_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig, GatewayError> {
    let (certs, key) = load_pem(cert_path, key_path)?;
    let mut config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_error)?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(tls_error)?;
    config.alpn_protocols = vec![b"h3".to_vec()];
    config.max_early_data_size = u32::MAX;
    Ok(config)
}

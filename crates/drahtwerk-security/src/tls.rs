// SPDX-License-Identifier: MIT
//
// rustls server configuration for the transport's secure connection factory.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use drahtwerk_core::error::{DrahtwerkError, Result};

/// Build a TLS acceptor from PEM files on disk.
///
/// The server presents `cert_path`'s chain; when `ca_bundle` is given its
/// certificates are appended to the presented chain so clients behind
/// intermediate CAs can validate.
pub fn server_acceptor(
    cert_path: &Path,
    key_path: &Path,
    ca_bundle: Option<&Path>,
) -> Result<TlsAcceptor> {
    let mut chain = load_certs(cert_path)?;
    if let Some(bundle) = ca_bundle {
        chain.extend(load_certs(bundle)?);
    }
    let key = load_key(key_path)?;

    debug!(
        cert = %cert_path.display(),
        chain_len = chain.len(),
        "building TLS server config"
    );

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| DrahtwerkError::Tls(format!("{}: {e}", cert_path.display())))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| DrahtwerkError::Tls(format!("open {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);

    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<_>>()
        .map_err(|e| DrahtwerkError::Tls(format!("parse {}: {e}", path.display())))?;

    if certs.is_empty() {
        return Err(DrahtwerkError::Tls(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| DrahtwerkError::Tls(format!("open {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| DrahtwerkError::Tls(format!("parse {}: {e}", path.display())))?
        .ok_or_else(|| DrahtwerkError::Tls(format!("no private key in {}", path.display())))
}

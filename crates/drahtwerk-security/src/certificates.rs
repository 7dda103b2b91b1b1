// SPDX-License-Identifier: MIT
//
// Self-signed TLS certificate generation.
//
// When the bridge is configured with `tlsEnabled` + `tlsSelfSigned`, the
// supervisor calls [`generate_self_signed`] before installing the secure
// factory on the transport. The certificate is keyed to the configured
// public address so browsers connecting to `wss://{address}:{port}` can be
// pointed at it for a one-time trust prompt.

use std::path::Path;

use rcgen::{CertificateParams, DnType, KeyPair};
use tracing::info;

use drahtwerk_core::error::{DrahtwerkError, Result};

/// Generate a self-signed ECDSA P-256 certificate for `address` and write
/// the certificate and private key as PEM to the given paths, overwriting
/// any previous pair.
///
/// Parent directories are created if absent so a fresh install with the
/// default `tls/` layout works without manual setup.
pub fn generate_self_signed(address: &str, cert_path: &Path, key_path: &Path) -> Result<()> {
    let key_pair = KeyPair::generate()
        .map_err(|e| DrahtwerkError::Certificate(format!("key generation: {e}")))?;

    let mut params = CertificateParams::new(vec![address.to_string()])
        .map_err(|e| DrahtwerkError::Certificate(format!("invalid subject {address}: {e}")))?;
    params.distinguished_name.push(DnType::CommonName, address);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| DrahtwerkError::Certificate(format!("signing: {e}")))?;

    for path in [cert_path, key_path] {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
    }

    std::fs::write(cert_path, cert.pem())?;
    std::fs::write(key_path, key_pair.serialize_pem())?;

    info!(
        address,
        cert = %cert_path.display(),
        key = %key_path.display(),
        "self-signed certificate generated"
    );

    Ok(())
}

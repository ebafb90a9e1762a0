use std::{fs::File, io::BufReader, path::Path, sync::Arc};

use anyhow::{Context, Result, anyhow};
use tokio_rustls::{TlsAcceptor, rustls};

/// Builds the acceptor for the secure endpoint from PEM encoded files.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let cert_file = File::open(cert_path)
        .with_context(|| format!("failed to open certificate file {}", cert_path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse certificates")?;
    if certs.is_empty() {
        return Err(anyhow!(
            "no certificates found in {}",
            cert_path.display()
        ));
    }

    let key_file = File::open(key_path)
        .with_context(|| format!("failed to open key file {}", key_path.display()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .context("failed to parse private key")?
        .ok_or_else(|| anyhow!("no private key found in {}", key_path.display()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("failed to build tls config")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::crypto::aws_lc_rs as provider;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;

pub fn make_server_config(
    cert_path: &Path,
    key_path: &Path,
) -> anyhow::Result<Arc<ServerConfig>> {
    let cert_data = std::fs::read(cert_path)
        .with_context(|| format!("reading certificate from {}", cert_path.display()))?;
    let certificates = load_certs(&cert_data)
        .with_context(|| format!("loading certificates from {}", cert_path.display()))?;

    let key_data = std::fs::read(key_path)
        .with_context(|| format!("reading private key from {}", key_path.display()))?;
    let private_key = load_private_key(&key_data)
        .with_context(|| format!("loading private key from {}", key_path.display()))?;

    let config = ServerConfig::builder_with_provider(Arc::new(provider::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certificates, private_key)?;

    Ok(Arc::new(config))
}

fn load_certs(data: &[u8]) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(data);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("reading PEM encoded certificates")?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found");
    }
    Ok(certs)
}

fn load_private_key(data: &[u8]) -> anyhow::Result<PrivateKeyDer<'static>> {
    let mut reader = std::io::BufReader::new(data);
    rustls_pemfile::private_key(&mut reader)
        .context("reading PEM encoded private key")?
        .ok_or_else(|| anyhow::anyhow!("no key found in key data (encrypted keys not supported)"))
}

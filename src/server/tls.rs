//! TLS configuration and certificate loading.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;

/// Reads every certificate from a PEM file.
pub fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .with_context(|| format!("Certificate file not found: {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("invalid PEM in {}", path.display()))?;
    if certs.is_empty() {
        bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

/// Reads the first PKCS#1, PKCS#8 or SEC1 private key from a PEM file.
pub fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .with_context(|| format!("Private key file not found: {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("invalid PEM in {}", path.display()))?
        .ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}

/// Builds the rustls server configuration.
///
/// With a CA file, client certificates signed by it are requested; they
/// are required only when `verify_client` is set.
pub fn build_server_config(tls: &TlsConfig) -> anyhow::Result<ServerConfig> {
    let certs = load_certs(&tls.cert_file)?;
    let key = load_private_key(&tls.key_file)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .context("configuring TLS protocol versions")?;

    let builder = match &tls.ca_file {
        Some(ca_file) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_file)? {
                roots.add(cert).context("adding CA certificate")?;
            }
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider);
            let verifier = if tls.verify_client {
                verifier.build()
            } else {
                verifier.allow_unauthenticated().build()
            }
            .context("building client certificate verifier")?;
            builder.with_client_cert_verifier(verifier)
        }
        None => {
            if tls.verify_client {
                bail!("tls.verify_client requires tls.ca_file");
            }
            builder.with_no_client_auth()
        }
    };

    let mut config = builder
        .with_single_cert(certs, key)
        .context("certificate and private key do not match")?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

pub fn load_tls_acceptor(tls: &TlsConfig) -> anyhow::Result<TlsAcceptor> {
    let config = build_server_config(tls)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

//! TLS for the RPC listeners: loads the configured certificate pair, or
//! generates a self-signed one on first start.

use chrono::Datelike;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::io;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

/// Organization written into generated certificates.
pub const CERT_ORGANIZATION: &str = "pod autogenerated cert";
const CERT_VALID_YEARS: i32 = 10;

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),
    #[error("Invalid certificate")]
    InvalidCertificate,
    #[error("Invalid private key")]
    InvalidPrivateKey,
}

/// Writes a new self-signed certificate and key. The key file is readable
/// by the owner only.
pub fn gen_cert_pair(cert_path: &Path, key_path: &Path) -> Result<(), TlsError> {
    tracing::info!("generating TLS certificates...");

    let mut names = vec!["localhost".to_string(), "127.0.0.1".to_string(), "::1".to_string()];
    if let Ok(host) = hostname::get() {
        let host = host.to_string_lossy().into_owned();
        if !host.is_empty() && !names.contains(&host) {
            names.push(host);
        }
    }

    let mut params = rcgen::CertificateParams::new(names)?;
    params
        .distinguished_name
        .push(rcgen::DnType::OrganizationName, CERT_ORGANIZATION);
    let today = chrono::Utc::now().date_naive();
    params.not_before = rcgen::date_time_ymd(today.year(), today.month() as u8, today.day() as u8);
    // Feb 29th does not exist ten years on; the 28th is close enough.
    let expiry_day = (today.day() as u8).min(28);
    params.not_after = rcgen::date_time_ymd(today.year() + CERT_VALID_YEARS, today.month() as u8, expiry_day);

    let key_pair = rcgen::KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    for path in [cert_path, key_path] {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
    }
    std::fs::write(cert_path, cert.pem())?;
    std::fs::write(key_path, key_pair.serialize_pem())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!("done generating TLS certificates");
    Ok(())
}

/// Builds an acceptor from PEM files, generating them when neither exists.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, TlsError> {
    if !cert_path.exists() && !key_path.exists() {
        gen_cert_pair(cert_path, key_path)?;
    }

    let mut cert_reader = io::BufReader::new(std::fs::File::open(cert_path)?);
    let mut key_reader = io::BufReader::new(std::fs::File::open(key_path)?);

    let certs: Vec<CertificateDer> =
        rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::InvalidCertificate);
    }
    let key: PrivateKeyDer =
        rustls_pemfile::private_key(&mut key_reader)?.ok_or(TlsError::InvalidPrivateKey)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_pair_loads() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("rpc.cert");
        let key = dir.path().join("rpc.key");

        load_acceptor(&cert, &key).unwrap();
        assert!(cert.exists() && key.exists());
        let pem = std::fs::read_to_string(&cert).unwrap();
        assert!(pem.contains("BEGIN CERTIFICATE"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&key).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_missing_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("rpc.cert");
        let key = dir.path().join("rpc.key");
        std::fs::write(&cert, "not a pem").unwrap();
        assert!(load_acceptor(&cert, &key).is_err());
    }
}

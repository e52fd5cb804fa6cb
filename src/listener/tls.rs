//! TLS certificate loading.
//!
//! Certificate loading is an external collaborator per §1 — operators supply
//! already-issued PEM material — so this module only loads what configuration
//! points at; it does not generate or manage certificates.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;

use crate::errors::{Result, ServerError};

/// Load a PEM certificate chain and private key from disk.
pub fn load_cert_chain(cert_path: &Path, key_path: &Path) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(ServerError::ConfigInvalid(format!("no certificates found in {}", cert_path.display())));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| ServerError::ConfigInvalid(format!("no private key found in {}", key_path.display())))?;

    Ok((certs, key))
}

/// Build a `rustls::ServerConfig` advertising TLS 1.2, matching §8 Scenario 6
/// ("client uses TLS 1.2, no peer verification").
pub fn build_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ServerError::ConfigInvalid(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::ConfigInvalid(e.to_string()))?;
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::PrivatePkcs8KeyDer;

    fn write_self_signed(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
        let rcgen::CertifiedKey { cert, signing_key } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, signing_key.serialize_pem()).unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn loads_generated_cert_and_key() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_self_signed(dir.path());

        let (certs, key) = load_cert_chain(&cert_path, &key_path).unwrap();
        assert!(!certs.is_empty());
        let _: PrivateKeyDer = key;
    }

    #[test]
    fn missing_cert_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_cert_chain(&dir.path().join("missing.pem"), &dir.path().join("missing.key")).unwrap_err();
        assert!(matches!(err, ServerError::Io(_)));
    }

    #[test]
    fn build_server_config_succeeds_for_loaded_cert() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_self_signed(dir.path());
        let (certs, key) = load_cert_chain(&cert_path, &key_path).unwrap();
        assert!(build_server_config(certs, key).is_ok());
    }

    #[test]
    fn no_key_in_file_is_config_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, _) = write_self_signed(dir.path());
        // Write garbage where the key should be.
        let bogus_key_path = dir.path().join("bogus.key");
        std::fs::write(&bogus_key_path, b"not a key").unwrap();
        let err = load_cert_chain(&cert_path, &bogus_key_path).unwrap_err();
        assert_eq!(err.error_code(), "config_invalid");
    }

    #[allow(dead_code)]
    fn _silence_unused_import(_: PrivatePkcs8KeyDer) {}
}

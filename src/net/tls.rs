//! TLS context construction from a PEM keystore.
//!
//! # Responsibilities
//! - Load the certificate chain and private key from one PEM bundle
//! - Remove excluded cipher suites and protocol versions
//! - Produce the acceptor the listener terminates TLS with
//!
//! # Design Decisions
//! - The crypto provider is always passed explicitly (ring), never taken
//!   from process-wide state
//! - Exclusions are matched by name, case-insensitively, ignoring `.` and `_`
//!   so `TLSv1.2` and `TLSv1_2` name the same version
//! - Names the provider never offers are already excluded; they are only logged

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ServerConfig, SupportedProtocolVersion};
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

use crate::config::ListenerConfig;

/// Errors raised while building the TLS context.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("cannot read keystore {path:?}: {source}")]
    Keystore {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("keystore {0:?} holds no certificate")]
    NoCertificate(PathBuf),

    #[error("keystore {0:?} holds no private key")]
    NoPrivateKey(PathBuf),

    #[error("keystore {0:?} holds an encrypted private key; PEM keystores must be unencrypted")]
    EncryptedKey(PathBuf),

    #[error("every cipher suite is excluded")]
    NoCipherSuites,

    #[error("every protocol version is excluded")]
    NoProtocolVersions,

    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Build a TLS acceptor from the listener's keystore and exclusion lists.
pub async fn load_tls_acceptor(config: &ListenerConfig) -> Result<TlsAcceptor, TlsError> {
    let path = PathBuf::from(&config.tls_keystore_path);
    let pem = tokio::fs::read(&path)
        .await
        .map_err(|source| TlsError::Keystore {
            path: path.clone(),
            source,
        })?;

    let (certs, key) = parse_keystore(&path, &pem)?;
    if !config.tls_keystore_password.is_empty() {
        tracing::debug!(path = %path.display(), "Keystore password ignored for PEM keystore");
    }

    let server_config = server_config(config, certs, key)?;
    tracing::info!(
        path = %path.display(),
        cipher_suites = server_config.crypto_provider().cipher_suites.len(),
        "TLS context loaded"
    );
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn parse_keystore(
    path: &Path,
    pem: &[u8],
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsError> {
    let keystore_err = |source| TlsError::Keystore {
        path: path.to_path_buf(),
        source,
    };

    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(keystore_err)?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate(path.to_path_buf()));
    }

    match rustls_pemfile::private_key(&mut &pem[..]).map_err(keystore_err)? {
        Some(key) => Ok((certs, key)),
        None if contains(pem, b"ENCRYPTED PRIVATE KEY") => Err(TlsError::EncryptedKey(path.to_path_buf())),
        None => Err(TlsError::NoPrivateKey(path.to_path_buf())),
    }
}

fn server_config(
    config: &ListenerConfig,
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig, TlsError> {
    let mut provider = ring::default_provider();

    let excluded_suites: Vec<String> = config
        .excluded_cipher_suites
        .iter()
        .map(|name| normalize(name))
        .collect();
    provider
        .cipher_suites
        .retain(|suite| !excluded_suites.contains(&normalize(&format!("{:?}", suite.suite()))));
    log_unknown(
        "cipher suite",
        &config.excluded_cipher_suites,
        ring::ALL_CIPHER_SUITES
            .iter()
            .map(|suite| format!("{:?}", suite.suite())),
    );
    if provider.cipher_suites.is_empty() {
        return Err(TlsError::NoCipherSuites);
    }

    let excluded_versions: Vec<String> = config
        .excluded_protocols
        .iter()
        .map(|name| normalize(name))
        .collect();
    let versions: Vec<&'static SupportedProtocolVersion> = rustls::ALL_VERSIONS
        .iter()
        .copied()
        .filter(|v| !excluded_versions.contains(&normalize(&format!("{:?}", v.version))))
        .collect();
    log_unknown(
        "protocol",
        &config.excluded_protocols,
        rustls::ALL_VERSIONS.iter().map(|v| format!("{:?}", v.version)),
    );
    if versions.is_empty() {
        return Err(TlsError::NoProtocolVersions);
    }

    let mut server_config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&versions)?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(server_config)
}

fn log_unknown<'a>(
    what: &'static str,
    excluded: impl IntoIterator<Item = &'a String>,
    offered: impl Iterator<Item = String>,
) {
    let offered: Vec<String> = offered.map(|name| normalize(&name)).collect();
    for name in excluded {
        if !offered.contains(&normalize(name)) {
            tracing::debug!(kind = what, name = %name, "Excluded name is never offered");
        }
    }
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '.' && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::io::Write;

    fn keystore() -> tempfile::NamedTempFile {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}{}", cert.cert.pem(), cert.key_pair.serialize_pem()).unwrap();
        file
    }

    fn tls_config(path: &std::path::Path) -> ListenerConfig {
        ListenerConfig {
            tls_enabled: true,
            tls_keystore_path: path.display().to_string(),
            ..ListenerConfig::default()
        }
    }

    #[test]
    fn names_are_normalized() {
        assert_eq!(normalize("TLSv1.2"), normalize("TLSv1_2"));
        assert_eq!(normalize("tls13_aes_128_gcm_sha256"), normalize("TLS13_AES_128_GCM_SHA256"));
    }

    #[tokio::test]
    async fn loads_pem_keystore() {
        let file = keystore();
        assert!(load_tls_acceptor(&tls_config(file.path())).await.is_ok());
    }

    #[tokio::test]
    async fn missing_keystore_is_an_error() {
        let config = tls_config(std::path::Path::new("/nonexistent/keystore.pem"));
        assert!(matches!(
            load_tls_acceptor(&config).await,
            Err(TlsError::Keystore { .. })
        ));
    }

    #[tokio::test]
    async fn keystore_without_key_is_an_error() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", cert.cert.pem()).unwrap();
        assert!(matches!(
            load_tls_acceptor(&tls_config(file.path())).await,
            Err(TlsError::NoPrivateKey(_))
        ));
    }

    #[tokio::test]
    async fn excluding_every_version_is_an_error() {
        let file = keystore();
        let config = ListenerConfig {
            excluded_protocols: BTreeSet::from(["TLSv1.2".to_string(), "TLSv1.3".to_string()]),
            ..tls_config(file.path())
        };
        assert!(matches!(
            load_tls_acceptor(&config).await,
            Err(TlsError::NoProtocolVersions)
        ));
    }

    #[tokio::test]
    async fn excluded_suites_are_removed() {
        let file = keystore();
        let excluded: BTreeSet<String> = ring::ALL_CIPHER_SUITES
            .iter()
            .map(|suite| format!("{:?}", suite.suite()))
            .collect();
        let config = ListenerConfig {
            excluded_cipher_suites: excluded,
            ..tls_config(file.path())
        };
        assert!(matches!(
            load_tls_acceptor(&config).await,
            Err(TlsError::NoCipherSuites)
        ));
    }
}

//! TLS configuration and certificate loading.
//!
//! Key pairs arrive as PEM text from the store. Each snapshot owns one
//! `ServerConfig` whose resolver picks the certificate by SNI.

use std::collections::BTreeMap;
use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use thiserror::Error;

use crate::store::KeyPair;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("no certificate found in PEM data")]
    NoCertificate,

    #[error("no private key found in PEM data")]
    NoPrivateKey,

    #[error("invalid PEM data: {0}")]
    Pem(#[from] std::io::Error),

    #[error("unsupported private key: {0}")]
    Key(rustls::Error),

    #[error("failed to build TLS config: {0}")]
    Config(rustls::Error),

    #[error("https listener without any host key pair")]
    NoKeyPairs,
}

/// Parse a PEM key pair into a signing-ready certificate.
pub fn parse_key_pair(key_pair: &KeyPair) -> Result<Arc<CertifiedKey>, TlsError> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(key_pair.cert.as_bytes()))
            .collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate);
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(key_pair.key.as_bytes()))?
        .ok_or(TlsError::NoPrivateKey)?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key).map_err(TlsError::Key)?;

    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

/// Certificate selection by SNI host name.
///
/// Clients that send no SNI, or an unknown name, get the certificate of the
/// first host in name order.
#[derive(Debug)]
pub struct SniResolver {
    certs: BTreeMap<String, Arc<CertifiedKey>>,
}

impl SniResolver {
    pub fn new(certs: BTreeMap<String, Arc<CertifiedKey>>) -> Self {
        Self { certs }
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        client_hello
            .server_name()
            .and_then(|sni| self.certs.get(&sni.to_ascii_lowercase()))
            .or_else(|| self.certs.values().next())
            .cloned()
    }
}

/// Build a server config serving every `(host name, key pair)` given.
///
/// ALPN advertises h2 and http/1.1.
pub fn build_server_config<'a, I>(key_pairs: I) -> Result<Arc<ServerConfig>, TlsError>
where
    I: IntoIterator<Item = (&'a str, &'a KeyPair)>,
{
    let mut certs = BTreeMap::new();
    for (name, key_pair) in key_pairs {
        certs.insert(name.to_ascii_lowercase(), parse_key_pair(key_pair)?);
    }
    if certs.is_empty() {
        return Err(TlsError::NoKeyPairs);
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(TlsError::Config)?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniResolver::new(certs)));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

#[cfg(test)]
pub(crate) fn self_signed(name: &str) -> KeyPair {
    let generated = rcgen::generate_simple_self_signed(vec![name.to_string()])
        .expect("generate certificate");
    KeyPair {
        cert: generated.cert.pem(),
        key: generated.key_pair.serialize_pem(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_generated_key_pair() {
        let kp = self_signed("localhost");
        assert!(parse_key_pair(&kp).is_ok());
    }

    #[test]
    fn rejects_garbage() {
        let kp = KeyPair {
            cert: "not a certificate".into(),
            key: "not a key".into(),
        };
        assert!(matches!(parse_key_pair(&kp), Err(TlsError::NoCertificate)));
    }

    #[test]
    fn rejects_missing_key() {
        let mut kp = self_signed("localhost");
        kp.key = String::new();
        assert!(matches!(parse_key_pair(&kp), Err(TlsError::NoPrivateKey)));
    }

    #[test]
    fn builds_config_with_alpn() {
        let a = self_signed("a.example");
        let b = self_signed("b.example");
        let config = build_server_config([("a.example", &a), ("B.example", &b)]).unwrap();
        assert_eq!(config.alpn_protocols.len(), 2);
    }

    #[test]
    fn empty_key_pair_set_is_an_error() {
        let none: Vec<(&str, &KeyPair)> = Vec::new();
        assert!(matches!(build_server_config(none), Err(TlsError::NoKeyPairs)));
    }
}

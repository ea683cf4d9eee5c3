//! rustls client setup.

use rustls::crypto::ring::{cipher_suite, default_provider};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore, SupportedProtocolVersion};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::config::{TlsConfig, TlsVersion};
use crate::errors::{DeliveryError, DeliveryResult};

/// AEAD suites with forward secrecy.
const RESTRICTED_SUITES: &[rustls::SupportedCipherSuite] = &[
    cipher_suite::TLS13_AES_256_GCM_SHA384,
    cipher_suite::TLS13_AES_128_GCM_SHA256,
    cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
    cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
];

/// TLS connector bound to one server name.
#[derive(Clone)]
pub struct TlsClient {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl fmt::Debug for TlsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsClient")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl TlsClient {
    /// Builds a client for `host`, honoring the SNI override if set.
    pub fn new(config: &TlsConfig, host: &str) -> DeliveryResult<Self> {
        let name = config.sni_override.as_deref().unwrap_or(host).to_string();
        let server_name = ServerName::try_from(name.clone())
            .map_err(|_| DeliveryError::tls(format!("Invalid server name: {}", name)))?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(Self::client_config(config)?)),
            server_name,
        })
    }

    /// Builds the rustls configuration: protocol floor, cipher restriction
    /// and trust anchors.
    pub fn client_config(config: &TlsConfig) -> DeliveryResult<ClientConfig> {
        let versions: &[&'static SupportedProtocolVersion] = match config.min_version {
            TlsVersion::Tls12 => &[&rustls::version::TLS13, &rustls::version::TLS12],
            TlsVersion::Tls13 => &[&rustls::version::TLS13],
        };

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(path) = &config.ca_cert_path {
            let file = File::open(path).map_err(|e| {
                DeliveryError::invalid_configuration(format!("Cannot open CA bundle {}: {}", path.display(), e))
            })?;

            let mut added = 0usize;
            for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
                let cert = cert.map_err(|e| {
                    DeliveryError::invalid_configuration(format!("Cannot parse CA bundle {}: {}", path.display(), e))
                })?;
                roots
                    .add(cert)
                    .map_err(|e| DeliveryError::invalid_configuration(format!("Rejected CA certificate: {}", e)))?;
                added += 1;
            }

            if added == 0 {
                return Err(DeliveryError::invalid_configuration(format!(
                    "No certificates found in {}",
                    path.display()
                )));
            }
        }

        let tls = ClientConfig::builder_with_provider(Arc::new(crypto_provider(config)))
            .with_protocol_versions(versions)
            .map_err(|e| DeliveryError::tls(format!("Unusable TLS settings: {}", e)))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(tls)
    }

    /// Runs the handshake over `stream`.
    pub async fn connect(&self, stream: TcpStream) -> io::Result<TlsStream<TcpStream>> {
        self.connector.connect(self.server_name.clone(), stream).await
    }

    /// Returns the name presented in SNI and checked against the certificate.
    pub fn server_name(&self) -> &ServerName<'static> {
        &self.server_name
    }
}

fn crypto_provider(config: &TlsConfig) -> CryptoProvider {
    let mut provider = default_provider();
    if config.restrict_ciphers {
        provider.cipher_suites = RESTRICTED_SUITES.to_vec();
    }
    provider
}

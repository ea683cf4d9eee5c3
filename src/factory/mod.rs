//! Transport factory.
//!
//! Turns resolved credentials into a verified real transport, or into a
//! tagged simulation decision when that is not possible. Verified
//! transports are cached per account so their connection pools are shared
//! by every send from that account. At most one transport is cached per
//! account; a changed endpoint or password replaces it.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::{DeliveryConfig, SmtpConfig};
use crate::errors::DeliveryResult;
use crate::observability::DeliveryMetrics;
use crate::policy::{ResolvedCredentials, SimulationReason};
use crate::transport::{MailTransport, PooledTransport};

/// Builds real transports from configuration.
#[async_trait]
pub trait TransportConnector: Send + Sync + fmt::Debug {
    /// Creates a transport. Implementations should not perform I/O here;
    /// liveness is checked separately through [`MailTransport::verify`].
    async fn connect(&self, config: SmtpConfig) -> DeliveryResult<Arc<dyn MailTransport>>;
}

/// Connector producing pooled SMTP transports.
#[derive(Debug, Clone)]
pub struct SmtpConnector {
    metrics: Arc<DeliveryMetrics>,
}

impl SmtpConnector {
    /// Creates a connector reporting into `metrics`.
    pub fn new(metrics: Arc<DeliveryMetrics>) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl TransportConnector for SmtpConnector {
    async fn connect(&self, config: SmtpConfig) -> DeliveryResult<Arc<dyn MailTransport>> {
        Ok(Arc::new(PooledTransport::new(config, self.metrics.clone())?))
    }
}

/// What the factory produced.
#[derive(Debug, Clone)]
pub enum SelectedTransport {
    /// A real transport.
    Real {
        /// The transport.
        transport: Arc<dyn MailTransport>,
        /// Verification failed but the account is exempt, so it is used anyway.
        optimistic: bool,
    },
    /// Fall back to simulation.
    Simulated(SimulationReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoint {
    host: String,
    port: u16,
    secure: bool,
    username: String,
}

impl Endpoint {
    fn of(creds: &ResolvedCredentials) -> Self {
        Self {
            host: creds.host.clone(),
            port: creds.port,
            secure: creds.secure,
            username: creds.username.clone(),
        }
    }
}

struct CachedTransport {
    endpoint: Endpoint,
    password: SecretString,
    transport: Arc<dyn MailTransport>,
}

impl CachedTransport {
    fn matches(&self, creds: &ResolvedCredentials) -> bool {
        self.endpoint == Endpoint::of(creds) && self.password.expose_secret() == creds.password.expose_secret()
    }
}

/// Builds and verifies real transports.
pub struct TransportFactory {
    connector: Arc<dyn TransportConnector>,
    config: Arc<DeliveryConfig>,
    metrics: Arc<DeliveryMetrics>,
    cache: Mutex<HashMap<i64, CachedTransport>>,
}

impl fmt::Debug for TransportFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportFactory")
            .field("connector", &self.connector)
            .field("cached", &self.cached())
            .finish()
    }
}

impl TransportFactory {
    /// Creates a factory.
    pub fn new(
        connector: Arc<dyn TransportConnector>,
        config: Arc<DeliveryConfig>,
        metrics: Arc<DeliveryMetrics>,
    ) -> Self {
        Self {
            connector,
            config,
            metrics,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the number of cached transports.
    pub fn cached(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns a transport for `creds`.
    ///
    /// A transport that fails verification is still returned, marked
    /// optimistic, for exempt accounts; every other failure degrades to
    /// simulation. Errors never propagate.
    pub async fn build(&self, creds: &ResolvedCredentials) -> SelectedTransport {
        if let Some(transport) = self.lookup(creds) {
            return SelectedTransport::Real {
                transport,
                optimistic: false,
            };
        }

        let transport = match self.create(creds).await {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!(account_id = creds.account_id, error = %e, "Transport factory failed, using simulated transport");
                self.metrics.record_fallback();
                return SelectedTransport::Simulated(SimulationReason::FactoryError(e.to_string()));
            }
        };

        match transport.verify().await {
            Ok(()) => {
                self.store(creds, transport.clone());
                SelectedTransport::Real {
                    transport,
                    optimistic: false,
                }
            }
            Err(e) if creds.exempt => {
                tracing::warn!(
                    account_id = creds.account_id,
                    error = %e,
                    "Transport verification failed for exempt sender, proceeding optimistically"
                );
                SelectedTransport::Real {
                    transport,
                    optimistic: true,
                }
            }
            Err(e) => {
                tracing::warn!(account_id = creds.account_id, error = %e, "Transport verification failed, using simulated transport");
                self.metrics.record_fallback();
                SelectedTransport::Simulated(SimulationReason::VerifyFailed(e.to_string()))
            }
        }
    }

    /// Builds a throwaway transport and runs its liveness check.
    pub async fn verify(&self, creds: &ResolvedCredentials) -> DeliveryResult<()> {
        self.create(creds).await?.verify().await
    }

    async fn create(&self, creds: &ResolvedCredentials) -> DeliveryResult<Arc<dyn MailTransport>> {
        let config = creds.smtp_config(&self.config)?;
        self.connector.connect(config).await
    }

    /// Returns the cached transport if it still matches `creds`. A stale
    /// entry is dropped so its pool closes once in-flight sends finish.
    fn lookup(&self, creds: &ResolvedCredentials) -> Option<Arc<dyn MailTransport>> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        match cache.get(&creds.account_id) {
            Some(cached) if cached.matches(creds) => Some(cached.transport.clone()),
            Some(_) => {
                tracing::debug!(account_id = creds.account_id, "Account endpoint changed, dropping cached transport");
                cache.remove(&creds.account_id);
                None
            }
            None => None,
        }
    }

    fn store(&self, creds: &ResolvedCredentials, transport: Arc<dyn MailTransport>) {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).insert(
            creds.account_id,
            CachedTransport {
                endpoint: Endpoint::of(creds),
                password: creds.password.clone(),
                transport,
            },
        );
    }
}

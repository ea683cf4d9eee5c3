//! Real transport: rate-limited, pooled SMTP.

use async_trait::async_trait;
use deadpool::managed::{Object, PoolError};
use deadpool::Status;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::SmtpConfig;
use crate::errors::{DeliveryError, DeliveryErrorKind, DeliveryResult};
use crate::mime::MimeEncoder;
use crate::observability::{DeliveryMetrics, Timer};
use crate::resilience::RateLimiter;
use crate::types::{OutboundMessage, TransportKind, TransportReceipt};

use super::pool::{create_pool, SmtpConnectionManager, SmtpPool};
use super::{session, MailTransport, SmtpTransport};

/// Pooled SMTP transport for one sender account.
#[derive(Debug)]
pub struct PooledTransport {
    pool: SmtpPool,
    config: Arc<SmtpConfig>,
    limiter: RateLimiter,
    encoder: MimeEncoder,
}

impl PooledTransport {
    /// Creates the transport. No connection is opened until first use.
    pub fn new(config: SmtpConfig, metrics: Arc<DeliveryMetrics>) -> DeliveryResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        Ok(Self {
            pool: create_pool(config.clone(), metrics)?,
            limiter: RateLimiter::new(config.rate_limit.clone()),
            config,
            encoder: MimeEncoder::new(),
        })
    }

    /// Returns the transport configuration.
    pub fn config(&self) -> &SmtpConfig {
        &self.config
    }

    /// Returns pool occupancy.
    pub fn status(&self) -> Status {
        self.pool.status()
    }

    /// Closes the pool; idle connections are dropped.
    pub fn close(&self) {
        self.pool.close();
    }

    async fn acquire(&self) -> DeliveryResult<Object<SmtpConnectionManager>> {
        self.pool.get().await.map_err(map_pool_error)
    }
}

#[async_trait]
impl MailTransport for PooledTransport {
    async fn send(&self, message: &OutboundMessage, cancel: CancellationToken) -> DeliveryResult<TransportReceipt> {
        let timer = Timer::start("smtp_send");
        let encoded = self.encoder.encode(message)?;

        let mut conn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            conn = async {
                self.limiter.acquire().await?;
                self.acquire().await
            } => conn?,
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = session::transmit(&mut *conn, message, &encoded, self.config.max_message_size) => Some(result),
        };

        let transmission = match outcome {
            Some(result) => result?,
            None => {
                // Mid-transaction state is unknown, so the connection never goes back
                drop(Object::take(conn));
                tracing::debug!(host = %self.config.host, "Send cancelled, connection discarded");
                return Err(cancelled());
            }
        };

        Ok(TransportReceipt {
            message_id: message.message_id_header(),
            response: transmission.response.to_string(),
            accepted: transmission.accepted,
            rejected: transmission.rejected,
            duration: timer.stop(),
            kind: TransportKind::Real,
        })
    }

    async fn verify(&self) -> DeliveryResult<()> {
        let mut conn = self.acquire().await?;
        conn.health_check().await
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Real
    }
}

fn cancelled() -> DeliveryError {
    DeliveryError::new(DeliveryErrorKind::Cancelled, "Send cancelled")
}

fn map_pool_error(error: PoolError<DeliveryError>) -> DeliveryError {
    match error {
        PoolError::Backend(e) => e,
        PoolError::Timeout(_) => DeliveryError::timeout(
            DeliveryErrorKind::AcquireTimeout,
            "Timed out waiting for a pooled connection",
        ),
        other => DeliveryError::connection(format!("Connection pool error: {}", other)),
    }
}

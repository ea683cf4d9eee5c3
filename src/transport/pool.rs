//! deadpool manager for authenticated SMTP connections.

use async_trait::async_trait;
use deadpool::managed::{Manager, Metrics, Pool, PoolConfig as DeadpoolConfig, RecycleError, RecycleResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::SmtpConfig;
use crate::errors::{DeliveryError, DeliveryResult};
use crate::observability::DeliveryMetrics;

use super::session::{self, SessionParams};
use super::{SmtpTransport, TcpTransport, TlsClient};

/// Creates connections that are greeted, encrypted and authenticated.
#[derive(Debug)]
pub struct SmtpConnectionManager {
    config: Arc<SmtpConfig>,
    params: SessionParams,
    tls: TlsClient,
    metrics: Arc<DeliveryMetrics>,
    created: AtomicUsize,
}

impl SmtpConnectionManager {
    /// Creates a new connection manager.
    pub fn new(config: Arc<SmtpConfig>, metrics: Arc<DeliveryMetrics>) -> DeliveryResult<Self> {
        let tls = TlsClient::new(&config.tls, &config.host)?;
        Ok(Self {
            params: SessionParams::from_config(&config),
            config,
            tls,
            metrics,
            created: AtomicUsize::new(0),
        })
    }

    /// Returns how many connections have been opened.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Manager for SmtpConnectionManager {
    type Type = TcpTransport;
    type Error = DeliveryError;

    async fn create(&self) -> Result<TcpTransport, DeliveryError> {
        let mut transport = match TcpTransport::connect(&self.config, &self.tls).await {
            Ok(transport) => transport,
            Err(e) => {
                self.metrics.record_connection(false);
                return Err(e);
            }
        };
        self.metrics.record_connection(true);
        self.created.fetch_add(1, Ordering::Relaxed);

        if transport.is_tls() {
            self.metrics.record_tls_upgrade();
        }

        if let Err(e) = session::establish(&mut transport, &self.params, &self.tls, &self.metrics).await {
            let _ = transport.close().await;
            return Err(e);
        }

        Ok(transport)
    }

    async fn recycle(&self, conn: &mut TcpTransport, _: &Metrics) -> RecycleResult<DeliveryError> {
        let pool = &self.config.pool;
        check_reusable(conn, pool.max_messages_per_connection, pool.health_check_enabled).await
    }
}

/// Decides whether a returned connection may serve another message.
pub(crate) async fn check_reusable<T>(
    conn: &mut T,
    max_messages: usize,
    health_check: bool,
) -> RecycleResult<DeliveryError>
where
    T: SmtpTransport + ?Sized,
{
    if !conn.state().is_idle() {
        return Err(RecycleError::Message(format!("Connection left in state {:?}", conn.state())));
    }

    if conn.messages_sent() >= max_messages {
        let _ = conn.close().await;
        return Err(RecycleError::StaticMessage("Connection reached its message quota"));
    }

    if health_check {
        conn.health_check().await.map_err(RecycleError::Backend)?;
    }

    Ok(())
}

/// Pool of authenticated SMTP connections.
pub type SmtpPool = Pool<SmtpConnectionManager>;

/// Creates a pool sized from the transport configuration.
pub fn create_pool(config: Arc<SmtpConfig>, metrics: Arc<DeliveryMetrics>) -> DeliveryResult<SmtpPool> {
    let pool_config = DeadpoolConfig {
        max_size: config.pool.max_connections,
        ..Default::default()
    };
    let acquire_timeout = config.pool.acquire_timeout;

    Pool::builder(SmtpConnectionManager::new(config, metrics)?)
        .config(pool_config)
        .wait_timeout(Some(acquire_timeout))
        .runtime(deadpool::Runtime::Tokio1)
        .build()
        .map_err(|e| DeliveryError::invalid_configuration(format!("Failed to create pool: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockTransport;
    use crate::protocol::TransactionState;

    fn idle() -> MockTransport {
        let mut transport = MockTransport::new();
        transport.set_state(TransactionState::Ready);
        transport
    }

    #[tokio::test]
    async fn test_idle_connection_is_reused() {
        let mut conn = idle();
        assert!(check_reusable(&mut conn, 10, true).await.is_ok());
        assert_eq!(conn.recorded_commands().len(), 1);
    }

    #[tokio::test]
    async fn test_mid_transaction_connection_is_dropped() {
        let mut conn = idle();
        conn.set_state(TransactionState::InTransaction);
        assert!(check_reusable(&mut conn, 10, true).await.is_err());
    }

    #[tokio::test]
    async fn test_quota_reached_closes() {
        let mut conn = idle();
        for _ in 0..3 {
            conn.record_message_sent();
        }
        assert!(check_reusable(&mut conn, 3, false).await.is_err());
        assert_eq!(conn.state(), TransactionState::Closed);
    }

    #[tokio::test]
    async fn test_failed_noop_is_dropped() {
        let mut conn = idle();
        conn.queue_error(421, "4.3.2 Shutting down");
        let result = check_reusable(&mut conn, 10, true).await;
        assert!(matches!(result, Err(RecycleError::Backend(_))));
    }

    #[tokio::test]
    async fn test_pool_builds_without_connecting() {
        let config = SmtpConfig::builder().host("smtp.example.com").build().unwrap();
        let pool = create_pool(Arc::new(config), Arc::new(DeliveryMetrics::new())).unwrap();
        assert_eq!(pool.status().size, 0);
        assert_eq!(pool.status().max_size, 5);
    }
}

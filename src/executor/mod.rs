//! Delivery executor.
//!
//! Races one transport call against the send timeout. On timeout the
//! cancellation token is fired so the transport releases its connection.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::errors::{DeliveryError, DeliveryErrorKind, DeliveryResult};
use crate::observability::{DeliveryMetrics, Timer};
use crate::transport::MailTransport;
use crate::types::{OutboundMessage, TransportKind, TransportReceipt};

/// Normalized result of one dispatch.
#[derive(Debug)]
pub struct Execution {
    /// Transport result.
    pub result: DeliveryResult<TransportReceipt>,
    /// Transport class that was used.
    pub kind: TransportKind,
    /// Dispatch-to-completion time.
    pub elapsed: Duration,
}

impl Execution {
    /// Returns the elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Runs transport calls under a timeout.
#[derive(Debug, Clone)]
pub struct DeliveryExecutor {
    timeout: Duration,
    metrics: Arc<DeliveryMetrics>,
}

impl DeliveryExecutor {
    /// Creates an executor with the given send timeout.
    pub fn new(timeout: Duration, metrics: Arc<DeliveryMetrics>) -> Self {
        Self { timeout, metrics }
    }

    /// Returns the send timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends `message` through `transport`, whichever of completion and the
    /// timeout comes first.
    pub async fn execute(&self, transport: Arc<dyn MailTransport>, message: &OutboundMessage) -> Execution {
        let kind = transport.kind();
        let timer = Timer::start("delivery");
        let cancel = CancellationToken::new();

        let task = {
            let transport = transport.clone();
            let message = message.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { transport.send(&message, cancel).await })
        };
        let abort = task.abort_handle();

        let result = tokio::select! {
            joined = task => match joined {
                Ok(result) => result,
                Err(e) => Err(DeliveryError::new(DeliveryErrorKind::Unknown, format!("Send task failed: {}", e))),
            },
            _ = tokio::time::sleep(self.timeout) => {
                cancel.cancel();
                self.metrics.record_timeout();
                tracing::warn!(
                    message_id = %message.message_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    transport = %kind,
                    "Send timed out, cancelling transport call"
                );
                // The transport observes the token; abort covers one that never polls it.
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    abort.abort();
                });
                Err(DeliveryError::timeout(
                    DeliveryErrorKind::SendTimeout,
                    format!("Send exceeded {:?}", self.timeout),
                ))
            }
        };

        let elapsed = timer.stop();
        match &result {
            Ok(_) => self.metrics.record_sent(kind),
            Err(_) => self.metrics.record_failure(),
        }

        Execution { result, kind, elapsed }
    }
}

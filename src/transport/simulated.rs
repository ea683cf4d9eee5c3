//! In-process stand-in for a real transport.

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::DEFAULT_SIMULATED_DELAY;
use crate::errors::{DeliveryError, DeliveryErrorKind, DeliveryResult};
use crate::types::{OutboundMessage, TransportKind, TransportReceipt};

use super::MailTransport;

/// Reply text every simulated send reports.
pub const SIMULATED_RESPONSE: &str = "250 2.0.0 OK (simulated)";

/// Accepts every message after a short delay without any I/O.
#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    delay: Duration,
}

impl SimulatedTransport {
    /// Creates a simulated transport with the given delay.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new(DEFAULT_SIMULATED_DELAY)
    }
}

#[async_trait]
impl MailTransport for SimulatedTransport {
    async fn send(&self, message: &OutboundMessage, cancel: CancellationToken) -> DeliveryResult<TransportReceipt> {
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(DeliveryError::new(DeliveryErrorKind::Cancelled, "Send cancelled"));
            }
            _ = tokio::time::sleep(self.delay) => {}
        }

        tracing::debug!(message_id = %message.message_id, recipients = message.recipient_count(), "Simulated send");

        Ok(TransportReceipt {
            message_id: message.message_id_header(),
            response: SIMULATED_RESPONSE.to_string(),
            accepted: message.all_recipients().cloned().collect(),
            rejected: Vec::new(),
            duration: self.delay,
            kind: TransportKind::Simulated,
        })
    }

    async fn verify(&self) -> DeliveryResult<()> {
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Simulated
    }
}

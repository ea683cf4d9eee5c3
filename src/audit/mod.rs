//! Attempt logger.

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::DeliveryError;
use crate::observability::DeliveryMetrics;
use crate::store::AttemptStore;
use crate::types::{Association, DeliveryAttemptRecord, TransportKind, TransportReceipt};

/// Appends one audit entry per delivery attempt.
///
/// Store failures are logged and counted but never surface to the caller,
/// and never prevent the business record from being written.
#[derive(Clone)]
pub struct AttemptLogger {
    store: Arc<dyn AttemptStore>,
    metrics: Arc<DeliveryMetrics>,
}

impl std::fmt::Debug for AttemptLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptLogger").finish_non_exhaustive()
    }
}

impl AttemptLogger {
    /// Creates a logger over `store`.
    pub fn new(store: Arc<dyn AttemptStore>, metrics: Arc<DeliveryMetrics>) -> Self {
        Self { store, metrics }
    }

    /// Records one attempt and returns the entry that was written, or would
    /// have been.
    pub async fn record(
        &self,
        account_id: i64,
        kind: TransportKind,
        result: Result<&TransportReceipt, &DeliveryError>,
        elapsed_ms: u64,
        association: Option<Association>,
    ) -> DeliveryAttemptRecord {
        let (success, message_id, error) = match result {
            Ok(receipt) => (true, Some(receipt.message_id.clone()), None),
            Err(e) => (false, None, Some(e.to_string())),
        };

        let record = DeliveryAttemptRecord {
            id: Uuid::new_v4().to_string(),
            account_id,
            success,
            message_id,
            transport: kind,
            elapsed_ms,
            error,
            association,
            recorded_at: Utc::now(),
        };

        if let Err(e) = self.store.append(record.clone()).await {
            self.metrics.record_persistence_failure();
            tracing::warn!(account_id, attempt_id = %record.id, error = %e, "Failed to append delivery attempt");
        }

        record
    }
}

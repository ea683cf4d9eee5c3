//! Persisted records: business email records and delivery attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Association, TransportKind};

/// Status of a business email record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailStatus {
    /// Waiting for a scheduled fire time.
    Scheduled,
    /// Handed to a transport successfully.
    Sent,
    /// Delivery failed.
    Failed,
}

impl fmt::Display for EmailStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmailStatus::Scheduled => write!(f, "scheduled"),
            EmailStatus::Sent => write!(f, "sent"),
            EmailStatus::Failed => write!(f, "failed"),
        }
    }
}

/// The business "Email" record owned by the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailRecord {
    /// Store-assigned id, zero until created.
    pub id: i64,
    /// Sending account.
    pub account_id: i64,
    /// Primary recipient.
    pub recipient: String,
    /// Subject as sent.
    pub subject: String,
    /// Hardened HTML body.
    pub html: Option<String>,
    /// Hardened text body.
    pub text: Option<String>,
    /// Current status.
    pub status: EmailStatus,
    /// Message id in header form.
    pub message_id: Option<String>,
    /// Campaign association.
    pub association: Option<Association>,
    /// Scheduled fire time.
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Time of successful hand-off.
    pub sent_at: Option<DateTime<Utc>>,
    /// Failure description.
    pub error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit entry for one delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttemptRecord {
    /// Unique attempt id.
    pub id: String,
    /// Sending account.
    pub account_id: i64,
    /// Outcome.
    pub success: bool,
    /// Provider message id.
    pub message_id: Option<String>,
    /// Transport kind used.
    pub transport: TransportKind,
    /// Dispatch-to-completion time.
    pub elapsed_ms: u64,
    /// Error detail.
    pub error: Option<String>,
    /// Originating association.
    pub association: Option<Association>,
    /// Time the attempt finished.
    pub recorded_at: DateTime<Utc>,
}

/// Opaque tracking handle returned by a tracking injector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackingHandle(pub String);

impl fmt::Display for TrackingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

//! Caller-visible result shapes.

use serde::{Deserialize, Serialize};

/// Result of `send_email` and friends.
///
/// `test_mode` is true whenever no real transmission happened, whatever the
/// reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOutcome {
    /// The message was handed off.
    pub success: bool,
    /// Message id in header form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Business record id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_id: Option<i64>,
    /// Failure description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// No real transmission occurred.
    pub test_mode: bool,
}

impl SendOutcome {
    /// A successful hand-off.
    pub fn sent(message_id: String, email_id: Option<i64>, test_mode: bool) -> Self {
        Self {
            success: true,
            message_id: Some(message_id),
            email_id,
            error: None,
            test_mode,
        }
    }

    /// A failed send.
    pub fn failed(error: impl Into<String>, test_mode: bool) -> Self {
        Self {
            success: false,
            message_id: None,
            email_id: None,
            error: Some(error.into()),
            test_mode,
        }
    }

    /// Attaches a business record id.
    pub fn with_email_id(mut self, email_id: Option<i64>) -> Self {
        self.email_id = email_id;
        self
    }
}

/// Result of `schedule_email`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleOutcome {
    /// The send was accepted for later execution.
    pub success: bool,
    /// Business record id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_id: Option<i64>,
    /// The account is test-mode only.
    pub test_mode: bool,
    /// Failure description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// SPF plausibility result for the sender domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum SpfCheck {
    /// An SPF record exists and plausibly covers the relay.
    Plausible {
        /// The record found.
        record: String,
    },
    /// An SPF record exists but does not mention the relay.
    Unrelated {
        /// The record found.
        record: String,
    },
    /// No SPF record.
    Missing,
    /// The lookup failed.
    LookupFailed {
        /// Resolver error.
        reason: String,
    },
    /// Not checked (no relay host).
    Skipped,
}

/// Detailed probe findings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeDetails {
    /// SMTP host probed.
    pub smtp_host: Option<String>,
    /// SMTP port probed.
    pub smtp_port: Option<u16>,
    /// TCP reachability of the SMTP endpoint.
    pub smtp_reachable: bool,
    /// TCP reachability of the IMAP endpoint, when configured.
    pub imap_reachable: Option<bool>,
    /// SPF plausibility.
    pub spf: SpfCheck,
    /// Result of the transport liveness check, when attempted.
    pub verified: Option<bool>,
    /// Non-blocking findings.
    pub warnings: Vec<String>,
    /// Time spent probing.
    pub elapsed_ms: u64,
}

/// Result of `validate_email_account`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    /// No blocking issues were found.
    pub valid: bool,
    /// Blocking issues.
    pub issues: Vec<String>,
    /// The SMTP endpoint accepted a TCP connection.
    pub can_connect: bool,
    /// Detailed findings.
    pub details: ProbeDetails,
}

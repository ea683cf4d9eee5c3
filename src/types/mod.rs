//! Core types for the delivery engine.
//!
//! This module provides:
//! - Address types with validation
//! - The wire-level [`OutboundMessage`] handed to transports
//! - Sender accounts and send requests
//! - Records, receipts and caller-visible outcomes

mod account;
mod outcome;
mod record;
mod request;

pub use account::{AccountStatus, HealthMetrics, MailEndpoint, SendLimits, SenderAccount, WarmupState};
pub use outcome::{ProbeDetails, ScheduleOutcome, SendOutcome, SpfCheck, ValidationReport};
pub use record::{DeliveryAttemptRecord, EmailRecord, EmailStatus, TrackingHandle};
pub use request::{Association, SendRequest, SendRequestBuilder, SenderRef};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::errors::{DeliveryError, DeliveryErrorKind, DeliveryResult};

/// Email address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Display name (e.g., "John Doe").
    pub name: Option<String>,
    /// Email address (e.g., "john@example.com").
    pub email: String,
}

impl Address {
    /// Creates a new address with just an email.
    pub fn new(email: impl Into<String>) -> DeliveryResult<Self> {
        let email = email.into();
        Self::validate_email(&email, DeliveryErrorKind::InvalidRecipientAddress)?;
        Ok(Self { name: None, email })
    }

    /// Creates a new address with display name and email.
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> DeliveryResult<Self> {
        let email = email.into();
        Self::validate_email(&email, DeliveryErrorKind::InvalidRecipientAddress)?;
        Ok(Self {
            name: Some(name.into()),
            email,
        })
    }

    /// Creates a sender address, reporting failures as invalid-from errors.
    pub fn sender(name: Option<&str>, email: &str) -> DeliveryResult<Self> {
        Self::validate_email(email, DeliveryErrorKind::InvalidFromAddress)?;
        Ok(Self {
            name: name.filter(|n| !n.trim().is_empty()).map(str::to_string),
            email: email.to_string(),
        })
    }

    /// Parses an address from a string (e.g., "John Doe <john@example.com>").
    pub fn parse(s: &str) -> DeliveryResult<Self> {
        let s = s.trim();

        if let (Some(start), Some(end)) = (s.find('<'), s.rfind('>')) {
            if start < end {
                let name = s[..start].trim().trim_matches('"');
                let email = s[start + 1..end].trim();
                if name.is_empty() {
                    return Self::new(email);
                }
                return Self::with_name(name, email);
            }
        }

        Self::new(s)
    }

    fn validate_email(email: &str, kind: DeliveryErrorKind) -> DeliveryResult<()> {
        if email.is_empty() {
            return Err(DeliveryError::message_error(kind, "Email address cannot be empty"));
        }

        if email.len() > 254 {
            return Err(DeliveryError::message_error(
                kind,
                "Email address too long (max 254 characters)",
            ));
        }

        let Some((local, domain)) = email.split_once('@') else {
            return Err(DeliveryError::message_error(
                kind,
                "Email address must contain exactly one @",
            ));
        };

        if domain.contains('@') {
            return Err(DeliveryError::message_error(
                kind,
                "Email address must contain exactly one @",
            ));
        }

        if local.is_empty() || local.len() > 64 {
            return Err(DeliveryError::message_error(kind, "Local part must be 1-64 characters"));
        }

        if domain.is_empty() {
            return Err(DeliveryError::message_error(kind, "Domain cannot be empty"));
        }

        if email.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(DeliveryError::message_error(
                kind,
                "Email address cannot contain control characters or whitespace",
            ));
        }

        Ok(())
    }

    /// Returns the email part only.
    pub fn email(&self) -> &str {
        &self.email
    }

    /// Returns the domain part, lowercased.
    pub fn domain(&self) -> String {
        self.email
            .rsplit_once('@')
            .map(|(_, d)| d.to_ascii_lowercase())
            .unwrap_or_default()
    }

    /// Formats the address for SMTP MAIL FROM/RCPT TO commands.
    pub fn to_smtp(&self) -> String {
        format!("<{}>", self.email)
    }

    /// Formats the address for email headers.
    pub fn to_header(&self) -> String {
        match &self.name {
            Some(name) => {
                if name.contains(|c: char| !c.is_alphanumeric() && c != ' ') {
                    format!("\"{}\" <{}>", name.replace('"', "'"), self.email)
                } else {
                    format!("{} <{}>", name, self.email)
                }
            }
            None => self.email.clone(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_header())
    }
}

impl TryFrom<&str> for Address {
    type Error = DeliveryError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Address::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = DeliveryError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Address::parse(&s)
    }
}

/// File attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Filename.
    pub filename: String,
    /// MIME content type.
    pub content_type: String,
    /// Binary content.
    pub data: Vec<u8>,
}

impl Attachment {
    /// Creates a new attachment.
    pub fn new(filename: impl Into<String>, content_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            data,
        }
    }

    /// Creates an attachment with auto-detected content type.
    pub fn from_file(filename: impl Into<String>, data: Vec<u8>) -> Self {
        let filename = filename.into();
        let content_type = mime_guess::from_path(&filename)
            .first_or_octet_stream()
            .to_string();
        Self::new(filename, content_type, data)
    }
}

/// A fully hardened message ready for a transport.
///
/// Only the content hardening pipeline produces these; the message id and
/// date are fixed at that point and written exactly once by the encoder.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Sender address.
    pub from: Address,
    /// Primary recipients.
    pub to: Vec<Address>,
    /// CC recipients.
    pub cc: Vec<Address>,
    /// BCC recipients.
    pub bcc: Vec<Address>,
    /// Reply-to address.
    pub reply_to: Option<Address>,
    /// Email subject.
    pub subject: String,
    /// Plain text body.
    pub text: Option<String>,
    /// HTML body.
    pub html: Option<String>,
    /// File attachments.
    pub attachments: Vec<Attachment>,
    /// Additional headers in emission order.
    pub headers: Vec<(String, String)>,
    /// Domain-qualified message id, without angle brackets.
    pub message_id: String,
    /// Origination date.
    pub date: DateTime<Utc>,
}

impl OutboundMessage {
    /// Creates a new message with no recipients or body.
    pub fn new(from: Address, message_id: impl Into<String>) -> Self {
        Self {
            from,
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            reply_to: None,
            subject: String::new(),
            text: None,
            html: None,
            attachments: Vec::new(),
            headers: Vec::new(),
            message_id: message_id.into(),
            date: Utc::now(),
        }
    }

    /// Returns all recipients (to + cc + bcc).
    pub fn all_recipients(&self) -> impl Iterator<Item = &Address> {
        self.to.iter().chain(self.cc.iter()).chain(self.bcc.iter())
    }

    /// Returns the count of all recipients.
    pub fn recipient_count(&self) -> usize {
        self.to.len() + self.cc.len() + self.bcc.len()
    }

    /// Returns true if the email has any attachments.
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    /// Returns the values of every header with the given name.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns the message id in header form (`<id@domain>`).
    pub fn message_id_header(&self) -> String {
        format!("<{}>", self.message_id)
    }
}

/// Which class of transport carried a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// A real network transport.
    Real,
    /// The in-process stand-in.
    Simulated,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Real => write!(f, "real"),
            TransportKind::Simulated => write!(f, "simulated"),
        }
    }
}

/// A recipient that was rejected by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecipient {
    /// The rejected address.
    pub address: Address,
    /// SMTP status code.
    pub code: u16,
    /// Error message from server.
    pub message: String,
}

/// Result of handing one message to a transport.
#[derive(Debug, Clone)]
pub struct TransportReceipt {
    /// Message id in header form.
    pub message_id: String,
    /// Final server reply text.
    pub response: String,
    /// Successfully accepted recipients.
    pub accepted: Vec<Address>,
    /// Rejected recipients.
    pub rejected: Vec<RejectedRecipient>,
    /// Time spent inside the transport.
    pub duration: Duration,
    /// Transport that produced this receipt.
    pub kind: TransportKind,
}

impl TransportReceipt {
    /// Returns true if all recipients were accepted.
    pub fn is_complete_success(&self) -> bool {
        self.rejected.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parse() {
        let addr = Address::parse("test@example.com").unwrap();
        assert_eq!(addr.email, "test@example.com");
        assert!(addr.name.is_none());

        let addr = Address::parse("John Doe <john@example.com>").unwrap();
        assert_eq!(addr.email, "john@example.com");
        assert_eq!(addr.name, Some("John Doe".to_string()));

        let addr = Address::parse("\"John, Doe\" <john@example.com>").unwrap();
        assert_eq!(addr.name, Some("John, Doe".to_string()));
        assert_eq!(addr.to_header(), "\"John, Doe\" <john@example.com>");
    }

    #[test]
    fn test_address_validation() {
        assert!(Address::new("test@example.com").is_ok());
        assert!(Address::new("test.name@sub.example.com").is_ok());

        assert!(Address::new("").is_err());
        assert!(Address::new("no-at-sign").is_err());
        assert!(Address::new("two@@signs.com").is_err());
        assert!(Address::new("@no-local.com").is_err());
        assert!(Address::new("no-domain@").is_err());
        assert!(Address::new("has space@example.com").is_err());
    }

    #[test]
    fn test_address_error_kinds() {
        let err = Address::new("broken").unwrap_err();
        assert_eq!(err.kind(), DeliveryErrorKind::InvalidRecipientAddress);

        let err = Address::sender(Some("Ops"), "broken").unwrap_err();
        assert_eq!(err.kind(), DeliveryErrorKind::InvalidFromAddress);
    }

    #[test]
    fn test_address_domain() {
        let addr = Address::new("Someone@Mail.Example.COM").unwrap();
        assert_eq!(addr.domain(), "mail.example.com");
    }

    #[test]
    fn test_attachment_content_type() {
        let attachment = Attachment::from_file("test.pdf", vec![1, 2, 3]);
        assert_eq!(attachment.content_type, "application/pdf");

        let unknown = Attachment::from_file("blob", vec![]);
        assert_eq!(unknown.content_type, "application/octet-stream");
    }

    #[test]
    fn test_outbound_message_headers() {
        let from = Address::new("a@example.com").unwrap();
        let mut msg = OutboundMessage::new(from, "id.1@example.com");
        msg.headers.push(("Precedence".into(), "bulk".into()));
        msg.headers.push(("X-Tag".into(), "one".into()));

        assert_eq!(msg.header_values("precedence").collect::<Vec<_>>(), vec!["bulk"]);
        assert_eq!(msg.message_id_header(), "<id.1@example.com>");
        assert_eq!(msg.recipient_count(), 0);
    }
}

//! Send requests and sender references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Address, Attachment};
use crate::errors::{DeliveryError, DeliveryErrorKind, DeliveryResult};

/// Reference to a sender: an account id or an address.
///
/// Also used for owning entities, whose primary account is resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SenderRef {
    /// Numeric id.
    Id(i64),
    /// Email address.
    Email(String),
}

impl From<i64> for SenderRef {
    fn from(id: i64) -> Self {
        SenderRef::Id(id)
    }
}

impl From<&str> for SenderRef {
    fn from(s: &str) -> Self {
        match s.trim().parse::<i64>() {
            Ok(id) => SenderRef::Id(id),
            Err(_) => SenderRef::Email(s.trim().to_string()),
        }
    }
}

impl From<String> for SenderRef {
    fn from(s: String) -> Self {
        SenderRef::from(s.as_str())
    }
}

impl fmt::Display for SenderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SenderRef::Id(id) => write!(f, "#{}", id),
            SenderRef::Email(email) => write!(f, "{}", email),
        }
    }
}

/// Campaign context a send belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Association {
    /// Campaign id.
    pub campaign_id: Option<i64>,
    /// Contact id.
    pub contact_id: Option<i64>,
    /// Position in the campaign sequence.
    pub sequence_index: Option<u32>,
}

impl Association {
    /// Creates an association for a campaign contact.
    pub fn campaign(campaign_id: i64, contact_id: i64) -> Self {
        Self {
            campaign_id: Some(campaign_id),
            contact_id: Some(contact_id),
            sequence_index: None,
        }
    }

    /// Sets the sequence index.
    pub fn at_step(mut self, index: u32) -> Self {
        self.sequence_index = Some(index);
        self
    }
}

/// An immutable request to send one email.
#[derive(Debug, Clone)]
pub struct SendRequest {
    /// Primary recipients.
    pub to: Vec<Address>,
    /// CC recipients.
    pub cc: Vec<Address>,
    /// BCC recipients.
    pub bcc: Vec<Address>,
    /// Subject.
    pub subject: String,
    /// Plain text body.
    pub text: Option<String>,
    /// HTML body.
    pub html: Option<String>,
    /// Attachments.
    pub attachments: Vec<Attachment>,
    /// Campaign association.
    pub association: Option<Association>,
    /// Explicit fire time.
    pub fire_at: Option<DateTime<Utc>>,
}

impl SendRequest {
    /// Creates a new request builder.
    pub fn builder() -> SendRequestBuilder {
        SendRequestBuilder::default()
    }

    /// Returns the first recipient, whose domain keys hardening decisions.
    pub fn primary_recipient(&self) -> Option<&Address> {
        self.to.first().or_else(|| self.cc.first()).or_else(|| self.bcc.first())
    }

    /// Returns the count of all recipients.
    pub fn recipient_count(&self) -> usize {
        self.to.len() + self.cc.len() + self.bcc.len()
    }

    /// Returns a copy with the fire time replaced.
    pub fn with_fire_at(&self, fire_at: Option<DateTime<Utc>>) -> Self {
        Self {
            fire_at,
            ..self.clone()
        }
    }
}

/// Builder for [`SendRequest`].
#[derive(Debug, Default)]
pub struct SendRequestBuilder {
    to: Vec<Address>,
    cc: Vec<Address>,
    bcc: Vec<Address>,
    subject: String,
    text: Option<String>,
    html: Option<String>,
    attachments: Vec<Attachment>,
    association: Option<Association>,
    fire_at: Option<DateTime<Utc>>,
}

impl SendRequestBuilder {
    /// Adds a primary recipient.
    pub fn to(mut self, address: impl TryInto<Address, Error = DeliveryError>) -> DeliveryResult<Self> {
        self.to.push(address.try_into()?);
        Ok(self)
    }

    /// Adds multiple primary recipients.
    pub fn to_many<I, A>(mut self, addresses: I) -> DeliveryResult<Self>
    where
        I: IntoIterator<Item = A>,
        A: TryInto<Address, Error = DeliveryError>,
    {
        for addr in addresses {
            self.to.push(addr.try_into()?);
        }
        Ok(self)
    }

    /// Adds a CC recipient.
    pub fn cc(mut self, address: impl TryInto<Address, Error = DeliveryError>) -> DeliveryResult<Self> {
        self.cc.push(address.try_into()?);
        Ok(self)
    }

    /// Adds a BCC recipient.
    pub fn bcc(mut self, address: impl TryInto<Address, Error = DeliveryError>) -> DeliveryResult<Self> {
        self.bcc.push(address.try_into()?);
        Ok(self)
    }

    /// Sets the subject.
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Sets the plain text body.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Sets the HTML body.
    pub fn html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    /// Adds an attachment.
    pub fn attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Sets the campaign association.
    pub fn association(mut self, association: Association) -> Self {
        self.association = Some(association);
        self
    }

    /// Sets the fire time.
    pub fn fire_at(mut self, at: DateTime<Utc>) -> Self {
        self.fire_at = Some(at);
        self
    }

    /// Builds the request.
    pub fn build(self) -> DeliveryResult<SendRequest> {
        if self.to.is_empty() && self.cc.is_empty() && self.bcc.is_empty() {
            return Err(DeliveryError::message_error(
                DeliveryErrorKind::InvalidRecipientAddress,
                "At least one recipient is required",
            ));
        }

        if self.subject.contains(['\r', '\n']) {
            return Err(DeliveryError::message_error(
                DeliveryErrorKind::InvalidHeader,
                "Subject cannot contain line breaks",
            ));
        }

        Ok(SendRequest {
            to: self.to,
            cc: self.cc,
            bcc: self.bcc,
            subject: self.subject,
            text: self.text,
            html: self.html,
            attachments: self.attachments,
            association: self.association,
            fire_at: self.fire_at,
        })
    }
}

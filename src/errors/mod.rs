//! Error types for the delivery engine.
//!
//! Errors are classified by [`DeliveryErrorKind`], grouped into the classes
//! the engine reacts to: configuration, connection, timeout, validation and
//! persistence. SMTP replies carry their status and enhanced status codes.

use std::fmt;
use thiserror::Error;

/// Result type for delivery operations.
pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// Error kinds categorizing different failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryErrorKind {
    // Resolution errors
    /// No sender account matched the reference.
    AccountNotFound,
    /// The account is paused or suspended.
    AccountInactive,

    // Configuration errors
    /// Required endpoint fields are missing or invalid.
    ConfigurationMissing,
    /// Configuration is present but unusable.
    ConfigurationInvalid,

    // Connection errors
    /// DNS resolution failed.
    DnsResolution,
    /// Connection was refused.
    ConnectionRefused,
    /// Connection was reset.
    ConnectionReset,
    /// Liveness check failed.
    VerifyFailed,
    /// TLS handshake failed.
    TlsHandshakeFailed,
    /// STARTTLS not offered by the server.
    StarttlsNotSupported,

    // Authentication errors
    /// Credentials were rejected.
    CredentialsInvalid,
    /// No mutually supported authentication method.
    AuthMethodNotSupported,
    /// Server requires authentication.
    AuthenticationRequired,

    // Protocol errors
    /// Malformed reply from server.
    InvalidResponse,
    /// Reply code did not match the expected one.
    UnexpectedResponse,
    /// Server is shutting down (421).
    ServerShutdown,

    // Message errors
    /// Invalid sender address.
    InvalidFromAddress,
    /// Invalid or rejected recipient address.
    InvalidRecipientAddress,
    /// Message exceeds size limit.
    MessageTooLarge,
    /// Invalid header.
    InvalidHeader,
    /// Content failed the configured quality policy.
    ContentRejected,

    // Timeout errors
    /// Connect timeout.
    ConnectTimeout,
    /// Read timeout.
    ReadTimeout,
    /// Write timeout.
    WriteTimeout,
    /// Whole-send timeout enforced by the executor.
    SendTimeout,
    /// Send was cancelled before completion.
    Cancelled,

    // Pool and rate limiting
    /// Pool acquire failed.
    AcquireTimeout,
    /// Connection failed its health check.
    ConnectionUnhealthy,
    /// Local rate limit exceeded.
    RateLimited,

    // Persistence
    /// External store rejected a write or read.
    Persistence,

    /// Unknown or internal error.
    Unknown,
}

impl DeliveryErrorKind {
    /// Returns true if this error kind is typically retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeliveryErrorKind::ConnectionReset
                | DeliveryErrorKind::ConnectTimeout
                | DeliveryErrorKind::ReadTimeout
                | DeliveryErrorKind::WriteTimeout
                | DeliveryErrorKind::SendTimeout
                | DeliveryErrorKind::ServerShutdown
                | DeliveryErrorKind::AcquireTimeout
                | DeliveryErrorKind::ConnectionUnhealthy
                | DeliveryErrorKind::RateLimited
        )
    }

    /// Returns the error class this kind belongs to.
    pub fn class(&self) -> ErrorClass {
        match self {
            DeliveryErrorKind::AccountNotFound | DeliveryErrorKind::AccountInactive => {
                ErrorClass::NotFound
            }
            DeliveryErrorKind::ConfigurationMissing | DeliveryErrorKind::ConfigurationInvalid => {
                ErrorClass::Configuration
            }
            DeliveryErrorKind::ConnectTimeout
            | DeliveryErrorKind::ReadTimeout
            | DeliveryErrorKind::WriteTimeout
            | DeliveryErrorKind::SendTimeout
            | DeliveryErrorKind::Cancelled => ErrorClass::Timeout,
            DeliveryErrorKind::ContentRejected => ErrorClass::Validation,
            DeliveryErrorKind::Persistence => ErrorClass::Persistence,
            _ => ErrorClass::Connection,
        }
    }

    /// Returns the severity level of this error kind.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            DeliveryErrorKind::CredentialsInvalid
            | DeliveryErrorKind::ConfigurationMissing
            | DeliveryErrorKind::ConfigurationInvalid => ErrorSeverity::Critical,

            DeliveryErrorKind::ConnectTimeout
            | DeliveryErrorKind::ConnectionReset
            | DeliveryErrorKind::ReadTimeout
            | DeliveryErrorKind::WriteTimeout
            | DeliveryErrorKind::SendTimeout
            | DeliveryErrorKind::ServerShutdown
            | DeliveryErrorKind::AcquireTimeout
            | DeliveryErrorKind::ConnectionUnhealthy
            | DeliveryErrorKind::RateLimited
            | DeliveryErrorKind::VerifyFailed
            | DeliveryErrorKind::Persistence => ErrorSeverity::Warning,

            DeliveryErrorKind::AccountInactive | DeliveryErrorKind::Cancelled => {
                ErrorSeverity::Info
            }

            _ => ErrorSeverity::Error,
        }
    }
}

impl fmt::Display for DeliveryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DeliveryErrorKind::AccountNotFound => "Sender account not found",
            DeliveryErrorKind::AccountInactive => "Sender account inactive",
            DeliveryErrorKind::ConfigurationMissing => "Missing configuration",
            DeliveryErrorKind::ConfigurationInvalid => "Invalid configuration",
            DeliveryErrorKind::DnsResolution => "DNS resolution failed",
            DeliveryErrorKind::ConnectionRefused => "Connection refused",
            DeliveryErrorKind::ConnectionReset => "Connection reset",
            DeliveryErrorKind::VerifyFailed => "Transport verification failed",
            DeliveryErrorKind::TlsHandshakeFailed => "TLS handshake failed",
            DeliveryErrorKind::StarttlsNotSupported => "STARTTLS not supported",
            DeliveryErrorKind::CredentialsInvalid => "Invalid credentials",
            DeliveryErrorKind::AuthMethodNotSupported => "Auth method not supported",
            DeliveryErrorKind::AuthenticationRequired => "Authentication required",
            DeliveryErrorKind::InvalidResponse => "Invalid server response",
            DeliveryErrorKind::UnexpectedResponse => "Unexpected response",
            DeliveryErrorKind::ServerShutdown => "Server shutting down",
            DeliveryErrorKind::InvalidFromAddress => "Invalid sender address",
            DeliveryErrorKind::InvalidRecipientAddress => "Invalid recipient address",
            DeliveryErrorKind::MessageTooLarge => "Message too large",
            DeliveryErrorKind::InvalidHeader => "Invalid header",
            DeliveryErrorKind::ContentRejected => "Content rejected",
            DeliveryErrorKind::ConnectTimeout => "Connect timeout",
            DeliveryErrorKind::ReadTimeout => "Read timeout",
            DeliveryErrorKind::WriteTimeout => "Write timeout",
            DeliveryErrorKind::SendTimeout => "Send timeout",
            DeliveryErrorKind::Cancelled => "Send cancelled",
            DeliveryErrorKind::AcquireTimeout => "Pool acquire timeout",
            DeliveryErrorKind::ConnectionUnhealthy => "Connection unhealthy",
            DeliveryErrorKind::RateLimited => "Local rate limit exceeded",
            DeliveryErrorKind::Persistence => "Persistence failure",
            DeliveryErrorKind::Unknown => "Unknown error",
        };
        f.write_str(text)
    }
}

/// Coarse error classes the engine branches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Account could not be resolved or is not sendable.
    NotFound,
    /// Endpoint configuration absent or unusable.
    Configuration,
    /// Liveness check or transmission failed.
    Connection,
    /// Transmission exceeded its bound.
    Timeout,
    /// Content or SPF quality issue.
    Validation,
    /// Business-record or audit write failed.
    Persistence,
}

/// Error severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Informational - expected scenario.
    Info,
    /// Warning - temporary issue, may recover.
    Warning,
    /// Error - operation failed.
    Error,
    /// Critical - requires immediate attention.
    Critical,
}

/// Enhanced SMTP status code (RFC 2034).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedStatusCode {
    /// Class (2=success, 4=temporary, 5=permanent).
    pub class: u8,
    /// Subject (e.g., 1=addressing, 2=mailbox, 3=mail system).
    pub subject: u16,
    /// Detail code.
    pub detail: u16,
}

impl EnhancedStatusCode {
    /// Parses an enhanced status code from a string (e.g., "5.1.1").
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let class = parts.next()?.parse().ok()?;
        let subject = parts.next()?.parse().ok()?;
        let detail = parts.next()?.parse().ok()?;
        if parts.next().is_some() || !(2..=5).contains(&class) {
            return None;
        }
        Some(Self { class, subject, detail })
    }

    /// Returns true if this is a permanent failure.
    pub fn is_permanent(&self) -> bool {
        self.class == 5
    }
}

impl fmt::Display for EnhancedStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// Delivery error with detailed information.
#[derive(Error, Debug)]
pub struct DeliveryError {
    kind: DeliveryErrorKind,
    message: String,
    smtp_code: Option<u16>,
    enhanced_code: Option<EnhancedStatusCode>,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl DeliveryError {
    /// Creates a new delivery error.
    pub fn new(kind: DeliveryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            smtp_code: None,
            enhanced_code: None,
            cause: None,
        }
    }

    /// Sets the SMTP status code.
    pub fn with_smtp_code(mut self, code: u16) -> Self {
        self.smtp_code = Some(code);
        self
    }

    /// Sets the enhanced status code.
    pub fn with_enhanced_code(mut self, code: EnhancedStatusCode) -> Self {
        self.enhanced_code = Some(code);
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> DeliveryErrorKind {
        self.kind
    }

    /// Returns the error class.
    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the SMTP status code if available.
    pub fn smtp_code(&self) -> Option<u16> {
        self.smtp_code
    }

    /// Returns the enhanced status code if available.
    pub fn enhanced_code(&self) -> Option<&EnhancedStatusCode> {
        self.enhanced_code.as_ref()
    }

    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        if let Some(code) = self.smtp_code {
            return matches!(code, 421 | 450 | 451 | 452);
        }
        self.kind.is_retryable()
    }

    /// Returns the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        self.kind.severity()
    }

    /// Creates an account-not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(DeliveryErrorKind::AccountNotFound, message)
    }

    /// Creates a missing-configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(DeliveryErrorKind::ConfigurationMissing, message)
    }

    /// Creates an invalid-configuration error.
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::new(DeliveryErrorKind::ConfigurationInvalid, message)
    }

    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(DeliveryErrorKind::ConnectionRefused, message)
    }

    /// Creates a timeout error.
    pub fn timeout(kind: DeliveryErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message)
    }

    /// Creates a TLS error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::new(DeliveryErrorKind::TlsHandshakeFailed, message)
    }

    /// Creates an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(DeliveryErrorKind::CredentialsInvalid, message)
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(DeliveryErrorKind::InvalidResponse, message)
    }

    /// Creates a message error.
    pub fn message_error(kind: DeliveryErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message)
    }

    /// Creates a content-rejected error.
    pub fn content_rejected(message: impl Into<String>) -> Self {
        Self::new(DeliveryErrorKind::ContentRejected, message)
    }

    /// Creates a persistence error.
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::new(DeliveryErrorKind::Persistence, message)
    }

    /// Creates an error from an SMTP reply.
    pub fn from_smtp_response(code: u16, message: impl Into<String>) -> Self {
        let kind = match code {
            421 => DeliveryErrorKind::ServerShutdown,
            500..=503 => DeliveryErrorKind::InvalidResponse,
            530 => DeliveryErrorKind::AuthenticationRequired,
            535 => DeliveryErrorKind::CredentialsInvalid,
            550 => DeliveryErrorKind::InvalidRecipientAddress,
            552 => DeliveryErrorKind::MessageTooLarge,
            553 => DeliveryErrorKind::InvalidFromAddress,
            400..=599 => DeliveryErrorKind::UnexpectedResponse,
            _ => DeliveryErrorKind::Unknown,
        };
        Self::new(kind, message).with_smtp_code(code)
    }
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(code) = self.smtp_code {
            write!(f, " (SMTP {})", code)?;
        }
        if let Some(enhanced) = &self.enhanced_code {
            write!(f, " [{}]", enhanced)?;
        }
        Ok(())
    }
}

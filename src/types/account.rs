//! Sender account model.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a sender account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// May send.
    #[default]
    Active,
    /// Temporarily stopped by an operator or warmup process.
    Paused,
    /// Stopped for policy reasons.
    Suspended,
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountStatus::Active => write!(f, "active"),
            AccountStatus::Paused => write!(f, "paused"),
            AccountStatus::Suspended => write!(f, "suspended"),
        }
    }
}

/// Host, port and credential for one mail protocol endpoint.
///
/// Used symmetrically for SMTP and IMAP. Host and port are optional because
/// account records are frequently incomplete.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailEndpoint {
    /// Server hostname.
    pub host: Option<String>,
    /// Server port.
    pub port: Option<u16>,
    /// Implicit TLS when true, STARTTLS otherwise.
    #[serde(default)]
    pub secure: bool,
    /// Login name. Defaults to the account address when absent.
    pub username: Option<String>,
    /// Stored credential.
    #[serde(skip)]
    pub password: Option<SecretString>,
}

impl MailEndpoint {
    /// Creates an endpoint with host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port),
            ..Default::default()
        }
    }

    /// Sets the secure flag.
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Sets username and stored password.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(SecretString::new(password.into()));
        self
    }

    /// Returns host and port when both are present and non-empty.
    pub fn host_port(&self) -> Option<(&str, u16)> {
        match (self.host.as_deref().map(str::trim), self.port) {
            (Some(host), Some(port)) if !host.is_empty() && port != 0 => Some((host, port)),
            _ => None,
        }
    }

    /// Returns true if host and port are both set.
    pub fn is_configured(&self) -> bool {
        self.host_port().is_some()
    }
}

/// Daily and hourly send ceilings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendLimits {
    /// Maximum sends per day.
    pub daily: Option<u32>,
    /// Maximum sends per hour.
    pub hourly: Option<u32>,
}

/// Warmup flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmupState {
    /// Warmup is running for this account.
    pub enabled: bool,
    /// Day of the warmup schedule.
    pub day: u32,
}

/// Rolling health metrics, as fractions in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    /// Share of sends that bounced.
    pub bounce_rate: f64,
    /// Share of sends reported as spam.
    pub complaint_rate: f64,
    /// SPF/DKIM set up for the sender domain.
    pub domain_authenticated: bool,
}

/// A sender identity with its endpoints and policy flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderAccount {
    /// Account id.
    pub id: i64,
    /// Sender address.
    pub email: String,
    /// Display name for the From header.
    pub display_name: Option<String>,
    /// Provider tag (e.g. "gmail", "outlook", "other").
    pub provider: String,
    /// Outbound endpoint.
    #[serde(default)]
    pub smtp: MailEndpoint,
    /// Inbound endpoint, probed but never used for sending.
    pub imap: Option<MailEndpoint>,
    /// Send ceilings.
    #[serde(default)]
    pub limits: SendLimits,
    /// Lifecycle status.
    #[serde(default)]
    pub status: AccountStatus,
    /// Never use a real transport for this account.
    #[serde(default)]
    pub test_mode_only: bool,
    /// Warmup flags.
    #[serde(default)]
    pub warmup: WarmupState,
    /// Health metrics.
    #[serde(default)]
    pub health: HealthMetrics,
    /// Owning entity (e.g. a creator).
    pub owner_id: Option<i64>,
    /// This is the owner's primary account.
    #[serde(default)]
    pub is_primary: bool,
}

impl SenderAccount {
    /// Creates an active account with no endpoints configured.
    pub fn new(id: i64, email: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id,
            email: email.into(),
            display_name: None,
            provider: provider.into(),
            smtp: MailEndpoint::default(),
            imap: None,
            limits: SendLimits::default(),
            status: AccountStatus::Active,
            test_mode_only: false,
            warmup: WarmupState::default(),
            health: HealthMetrics::default(),
            owner_id: None,
            is_primary: false,
        }
    }

    /// Sets the display name.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Sets the SMTP endpoint.
    pub fn with_smtp(mut self, endpoint: MailEndpoint) -> Self {
        self.smtp = endpoint;
        self
    }

    /// Sets the IMAP endpoint.
    pub fn with_imap(mut self, endpoint: MailEndpoint) -> Self {
        self.imap = Some(endpoint);
        self
    }

    /// Sets the test-mode-only flag.
    pub fn with_test_mode_only(mut self, test_mode_only: bool) -> Self {
        self.test_mode_only = test_mode_only;
        self
    }

    /// Sets the lifecycle status.
    pub fn with_status(mut self, status: AccountStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets health metrics.
    pub fn with_health(mut self, health: HealthMetrics) -> Self {
        self.health = health;
        self
    }

    /// Links the account to an owner, optionally as its primary.
    pub fn owned_by(mut self, owner_id: i64, primary: bool) -> Self {
        self.owner_id = Some(owner_id);
        self.is_primary = primary;
        self
    }

    /// Returns the lowercased sender domain.
    pub fn domain(&self) -> String {
        self.email
            .rsplit_once('@')
            .map(|(_, d)| d.trim().to_ascii_lowercase())
            .unwrap_or_default()
    }

    /// Returns the display name, or the address when unset.
    pub fn display_label(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&self.email)
    }

    /// Returns the SMTP login name.
    pub fn smtp_username(&self) -> &str {
        self.smtp.username.as_deref().unwrap_or(&self.email)
    }

    /// Returns true if the account may send.
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

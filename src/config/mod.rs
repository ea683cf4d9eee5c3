//! Configuration types for the delivery engine.
//!
//! Two layers are configured here:
//! - [`DeliveryConfig`]: engine-wide policy (exempt senders, provider secret
//!   sources, timeouts, pooling, hardening)
//! - [`SmtpConfig`]: one concrete transport, built per account by the
//!   transport factory
//!
//! Secrets never live in configuration. Only the *names* of the secrets to
//! look up are configured; values are resolved at credential-resolution time.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::AuthMethod;
use crate::errors::{DeliveryError, DeliveryResult};

/// Default SMTP port (submission with STARTTLS).
pub const DEFAULT_PORT: u16 = 587;

/// Default timeout for establishing a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for individual socket reads and writes.
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound for a whole send, enforced by the executor.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(60);

/// Default delay of the simulated transport.
pub const DEFAULT_SIMULATED_DELAY: Duration = Duration::from_millis(150);

/// Default maximum message size (10 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// TLS mode for SMTP connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// No TLS. Only used against local test servers.
    None,
    /// Opportunistic STARTTLS.
    StartTls,
    /// STARTTLS, failing if the server does not offer it.
    #[default]
    StartTlsRequired,
    /// Implicit TLS (port 465).
    Implicit,
}

impl std::fmt::Display for TlsMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsMode::None => write!(f, "none"),
            TlsMode::StartTls => write!(f, "STARTTLS (opportunistic)"),
            TlsMode::StartTlsRequired => write!(f, "STARTTLS"),
            TlsMode::Implicit => write!(f, "implicit TLS"),
        }
    }
}

/// Minimum TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsVersion {
    /// TLS 1.2.
    #[default]
    Tls12,
    /// TLS 1.3.
    Tls13,
}

/// TLS configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// TLS mode.
    #[serde(default)]
    pub mode: TlsMode,
    /// Minimum TLS version.
    #[serde(default)]
    pub min_version: TlsVersion,
    /// Restrict negotiation to modern AEAD cipher suites.
    #[serde(default = "default_true")]
    pub restrict_ciphers: bool,
    /// Extra CA bundle (PEM) trusted in addition to the web PKI roots.
    pub ca_cert_path: Option<PathBuf>,
    /// Server Name Indication override.
    pub sni_override: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            mode: TlsMode::default(),
            min_version: TlsVersion::default(),
            restrict_ciphers: true,
            ca_cert_path: None,
            sni_override: None,
        }
    }
}

impl TlsConfig {
    /// Creates a new TLS config builder.
    pub fn builder() -> TlsConfigBuilder {
        TlsConfigBuilder::default()
    }
}

/// Builder for TLS configuration.
#[derive(Debug, Default)]
pub struct TlsConfigBuilder {
    config: TlsConfig,
}

impl TlsConfigBuilder {
    /// Sets the TLS mode.
    pub fn mode(mut self, mode: TlsMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Sets the minimum TLS version.
    pub fn min_version(mut self, version: TlsVersion) -> Self {
        self.config.min_version = version;
        self
    }

    /// Sets whether cipher suites are restricted.
    pub fn restrict_ciphers(mut self, restrict: bool) -> Self {
        self.config.restrict_ciphers = restrict;
        self
    }

    /// Sets the CA bundle path.
    pub fn ca_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ca_cert_path = Some(path.into());
        self
    }

    /// Sets the SNI override.
    pub fn sni_override(mut self, sni: impl Into<String>) -> Self {
        self.config.sni_override = Some(sni.into());
        self
    }

    /// Builds the TLS configuration.
    pub fn build(self) -> TlsConfig {
        self.config
    }
}

/// Connection pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum concurrent connections per transport.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Messages sent over one connection before it is retired.
    #[serde(default = "default_max_messages")]
    pub max_messages_per_connection: usize,
    /// Connection acquire timeout.
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// Run NOOP before handing out a recycled connection.
    #[serde(default = "default_true")]
    pub health_check_enabled: bool,
}

fn default_max_connections() -> usize { 5 }
fn default_max_messages() -> usize { 10 }
fn default_acquire_timeout() -> Duration { Duration::from_secs(30) }

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_messages_per_connection: default_max_messages(),
            acquire_timeout: default_acquire_timeout(),
            health_check_enabled: true,
        }
    }
}

/// Behavior when the rate limit is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnLimitBehavior {
    /// Reject immediately with error.
    Reject,
    /// Wait until the window reopens.
    #[default]
    Wait,
}

/// Rate limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum messages per window.
    pub max_emails: Option<u32>,
    /// Time window for rate limiting.
    #[serde(default = "default_rate_window", with = "humantime_serde")]
    pub window: Duration,
    /// Behavior when limit is exceeded.
    #[serde(default)]
    pub on_limit: OnLimitBehavior,
    /// Enable rate limiting.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_rate_window() -> Duration { Duration::from_secs(1) }

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_emails: Some(5),
            window: default_rate_window(),
            on_limit: OnLimitBehavior::default(),
            enabled: true,
        }
    }
}

/// SMTP transport configuration for a single sender account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// SMTP server hostname.
    pub host: String,
    /// SMTP server port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// TLS configuration.
    #[serde(default)]
    pub tls: TlsConfig,
    /// Authentication username.
    pub username: Option<String>,
    /// Authentication password (serialization skipped for security).
    #[serde(skip)]
    pub password: Option<SecretString>,
    /// Preferred authentication method.
    pub auth_method: Option<AuthMethod>,
    /// Connect timeout.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Socket read/write timeout.
    #[serde(default = "default_socket_timeout", with = "humantime_serde")]
    pub socket_timeout: Duration,
    /// Maximum message size.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Connection pool configuration.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Rate limit configuration.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Client identifier for EHLO.
    pub client_id: Option<String>,
}

fn default_port() -> u16 { DEFAULT_PORT }
fn default_connect_timeout() -> Duration { DEFAULT_CONNECT_TIMEOUT }
fn default_socket_timeout() -> Duration { DEFAULT_SOCKET_TIMEOUT }
fn default_max_message_size() -> usize { DEFAULT_MAX_MESSAGE_SIZE }

impl SmtpConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> SmtpConfigBuilder {
        SmtpConfigBuilder::default()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> DeliveryResult<()> {
        if self.host.trim().is_empty() {
            return Err(DeliveryError::configuration("SMTP host is required"));
        }

        if self.port == 0 {
            return Err(DeliveryError::configuration("SMTP port must be non-zero"));
        }

        if self.pool.max_connections == 0 {
            return Err(DeliveryError::invalid_configuration(
                "max_connections must be positive",
            ));
        }

        if self.pool.max_messages_per_connection == 0 {
            return Err(DeliveryError::invalid_configuration(
                "max_messages_per_connection must be positive",
            ));
        }

        Ok(())
    }

    /// Returns the full server address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns true if authentication is configured.
    pub fn has_auth(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// Returns the client identifier for EHLO.
    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or("localhost")
    }
}

/// Builder for SMTP configuration.
#[derive(Debug, Default)]
pub struct SmtpConfigBuilder {
    host: Option<String>,
    port: u16,
    tls: TlsConfig,
    username: Option<String>,
    password: Option<SecretString>,
    auth_method: Option<AuthMethod>,
    connect_timeout: Duration,
    socket_timeout: Duration,
    max_message_size: usize,
    pool: PoolConfig,
    rate_limit: RateLimitConfig,
    client_id: Option<String>,
}

impl SmtpConfigBuilder {
    /// Sets the SMTP server host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the SMTP server port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets username and password.
    pub fn credentials(mut self, username: impl Into<String>, password: SecretString) -> Self {
        self.username = Some(username.into());
        self.password = Some(password);
        self
    }

    /// Sets the preferred authentication method.
    pub fn auth_method(mut self, method: AuthMethod) -> Self {
        self.auth_method = Some(method);
        self
    }

    /// Sets the TLS configuration.
    pub fn tls(mut self, config: TlsConfig) -> Self {
        self.tls = config;
        self
    }

    /// Sets the TLS mode.
    pub fn tls_mode(mut self, mode: TlsMode) -> Self {
        self.tls.mode = mode;
        self
    }

    /// Sets connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets socket timeout.
    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    /// Sets maximum message size.
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Sets pool configuration.
    pub fn pool(mut self, config: PoolConfig) -> Self {
        self.pool = config;
        self
    }

    /// Sets rate limit configuration.
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = config;
        self
    }

    /// Sets the client identifier for EHLO.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> DeliveryResult<SmtpConfig> {
        let config = SmtpConfig {
            host: self
                .host
                .ok_or_else(|| DeliveryError::configuration("SMTP host is required"))?,
            port: if self.port == 0 { DEFAULT_PORT } else { self.port },
            tls: self.tls,
            username: self.username,
            password: self.password,
            auth_method: self.auth_method,
            connect_timeout: non_zero_or(self.connect_timeout, DEFAULT_CONNECT_TIMEOUT),
            socket_timeout: non_zero_or(self.socket_timeout, DEFAULT_SOCKET_TIMEOUT),
            max_message_size: if self.max_message_size == 0 {
                DEFAULT_MAX_MESSAGE_SIZE
            } else {
                self.max_message_size
            },
            pool: self.pool,
            rate_limit: self.rate_limit,
            client_id: self.client_id,
        };

        config.validate()?;
        Ok(config)
    }
}

fn non_zero_or(value: Duration, fallback: Duration) -> Duration {
    if value == Duration::ZERO {
        fallback
    } else {
        value
    }
}

/// A sender exempt from the normal credential policy.
///
/// Exempt senders read their secret from `secret_key` before the stored
/// credential and proceed optimistically when the liveness check fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExemptSender {
    /// Sender address, compared case-insensitively.
    pub email: String,
    /// Name of the secret holding this sender's password.
    pub secret_key: String,
}

/// A provider class with a dedicated secret source (e.g. app passwords).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSecret {
    /// Provider tag, compared case-insensitively.
    pub provider: String,
    /// Name of the secret holding the provider-wide password.
    pub secret_key: String,
}

/// What to do when content scoring flags a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "threshold")]
pub enum ContentPolicy {
    /// Log warnings and send anyway.
    #[default]
    SoftFail,
    /// Reject sends whose spam score exceeds the threshold.
    BlockAbove(u32),
}

/// Content hardening settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardeningConfig {
    /// Postal address shown in every footer.
    #[serde(default = "default_physical_address")]
    pub physical_address: String,
    /// HTTPS base used for one-click unsubscribe links.
    #[serde(default = "default_unsubscribe_url")]
    pub unsubscribe_url: String,
    /// Local part of the unsubscribe mailbox on the sender domain.
    #[serde(default = "default_unsubscribe_mailbox")]
    pub unsubscribe_mailbox: String,
    /// Local part of the abuse mailbox on the sender domain.
    #[serde(default = "default_abuse_mailbox")]
    pub abuse_mailbox: String,
    /// Category encoded in the Feedback-ID header.
    #[serde(default = "default_category")]
    pub category: String,
    /// Visible characters below which content counts as a placeholder.
    #[serde(default = "default_min_substantive_chars")]
    pub min_substantive_chars: usize,
    /// Content quality policy.
    #[serde(default)]
    pub content_policy: ContentPolicy,
}

fn default_physical_address() -> String {
    "1 Market Street, Suite 100, San Francisco, CA 94105".to_string()
}
fn default_unsubscribe_url() -> String { "https://unsubscribe.example.com".to_string() }
fn default_unsubscribe_mailbox() -> String { "unsubscribe".to_string() }
fn default_abuse_mailbox() -> String { "abuse".to_string() }
fn default_category() -> String { "outreach".to_string() }
fn default_min_substantive_chars() -> usize { 40 }

impl Default for HardeningConfig {
    fn default() -> Self {
        Self {
            physical_address: default_physical_address(),
            unsubscribe_url: default_unsubscribe_url(),
            unsubscribe_mailbox: default_unsubscribe_mailbox(),
            abuse_mailbox: default_abuse_mailbox(),
            category: default_category(),
            min_substantive_chars: default_min_substantive_chars(),
            content_policy: ContentPolicy::default(),
        }
    }
}

/// Engine-wide delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Operationally trusted senders.
    #[serde(default)]
    pub exempt_senders: Vec<ExemptSender>,
    /// Provider classes with a dedicated secret.
    #[serde(default)]
    pub provider_secrets: Vec<ProviderSecret>,
    /// Bound on a single send.
    #[serde(default = "default_send_timeout", with = "humantime_serde")]
    pub send_timeout: Duration,
    /// Delay of the simulated transport.
    #[serde(default = "default_simulated_delay", with = "humantime_serde")]
    pub simulated_delay: Duration,
    /// Connect timeout for real transports and probes.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Socket timeout for real transports.
    #[serde(default = "default_socket_timeout", with = "humantime_serde")]
    pub socket_timeout: Duration,
    /// Pool limits for real transports.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Provider throttling protection.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// TLS hardening shared by all real transports.
    #[serde(default)]
    pub tls: TlsConfig,
    /// Content hardening.
    #[serde(default)]
    pub hardening: HardeningConfig,
    /// Client identifier for EHLO.
    pub client_id: Option<String>,
}

fn default_send_timeout() -> Duration { DEFAULT_SEND_TIMEOUT }
fn default_simulated_delay() -> Duration { DEFAULT_SIMULATED_DELAY }

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            exempt_senders: Vec::new(),
            provider_secrets: Vec::new(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
            simulated_delay: DEFAULT_SIMULATED_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            pool: PoolConfig::default(),
            rate_limit: RateLimitConfig::default(),
            tls: TlsConfig::default(),
            hardening: HardeningConfig::default(),
            client_id: None,
        }
    }
}

impl DeliveryConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> DeliveryConfigBuilder {
        DeliveryConfigBuilder::default()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> DeliveryResult<()> {
        if self.send_timeout == Duration::ZERO {
            return Err(DeliveryError::invalid_configuration("send_timeout must be positive"));
        }
        if self.pool.max_connections == 0 || self.pool.max_messages_per_connection == 0 {
            return Err(DeliveryError::invalid_configuration("pool limits must be positive"));
        }
        if !self.hardening.unsubscribe_url.starts_with("https://") {
            return Err(DeliveryError::invalid_configuration(
                "unsubscribe_url must be an https URL",
            ));
        }
        for exempt in &self.exempt_senders {
            if exempt.secret_key.trim().is_empty() {
                return Err(DeliveryError::invalid_configuration(format!(
                    "exempt sender {} has no secret key",
                    exempt.email
                )));
            }
        }
        Ok(())
    }

    /// Returns the exempt entry for an address, if any.
    pub fn exempt_sender(&self, email: &str) -> Option<&ExemptSender> {
        self.exempt_senders
            .iter()
            .find(|e| e.email.eq_ignore_ascii_case(email.trim()))
    }

    /// Returns true if the address is on the exempt allowlist.
    pub fn is_exempt(&self, email: &str) -> bool {
        self.exempt_sender(email).is_some()
    }

    /// Returns the dedicated secret source for a provider, if any.
    pub fn provider_secret(&self, provider: &str) -> Option<&ProviderSecret> {
        self.provider_secrets
            .iter()
            .find(|p| p.provider.eq_ignore_ascii_case(provider.trim()))
    }
}

/// Builder for [`DeliveryConfig`].
#[derive(Debug, Default)]
pub struct DeliveryConfigBuilder {
    config: DeliveryConfig,
}

impl DeliveryConfigBuilder {
    /// Adds an exempt sender.
    pub fn exempt_sender(mut self, email: impl Into<String>, secret_key: impl Into<String>) -> Self {
        self.config.exempt_senders.push(ExemptSender {
            email: email.into(),
            secret_key: secret_key.into(),
        });
        self
    }

    /// Adds a provider secret source.
    pub fn provider_secret(mut self, provider: impl Into<String>, secret_key: impl Into<String>) -> Self {
        self.config.provider_secrets.push(ProviderSecret {
            provider: provider.into(),
            secret_key: secret_key.into(),
        });
        self
    }

    /// Sets the send timeout.
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.config.send_timeout = timeout;
        self
    }

    /// Sets the simulated transport delay.
    pub fn simulated_delay(mut self, delay: Duration) -> Self {
        self.config.simulated_delay = delay;
        self
    }

    /// Sets the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Sets pool configuration.
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }

    /// Sets rate limit configuration.
    pub fn rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.config.rate_limit = rate_limit;
        self
    }

    /// Sets TLS configuration.
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.config.tls = tls;
        self
    }

    /// Sets hardening configuration.
    pub fn hardening(mut self, hardening: HardeningConfig) -> Self {
        self.config.hardening = hardening;
        self
    }

    /// Sets the content quality policy.
    pub fn content_policy(mut self, policy: ContentPolicy) -> Self {
        self.config.hardening.content_policy = policy;
        self
    }

    /// Sets the EHLO client identifier.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.config.client_id = Some(id.into());
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> DeliveryResult<DeliveryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// Humantime serde support
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smtp_config_builder() {
        let config = SmtpConfig::builder()
            .host("smtp.example.com")
            .port(465)
            .credentials("user", SecretString::new("pass".to_string()))
            .build()
            .unwrap();

        assert_eq!(config.host, "smtp.example.com");
        assert_eq!(config.port, 465);
        assert!(config.has_auth());
        assert_eq!(config.address(), "smtp.example.com:465");
    }

    #[test]
    fn test_smtp_config_defaults() {
        let config = SmtpConfig::builder().host("smtp.example.com").build().unwrap();

        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.socket_timeout, DEFAULT_SOCKET_TIMEOUT);
        assert_eq!(config.tls.mode, TlsMode::StartTlsRequired);
        assert_eq!(config.pool.max_connections, 5);
        assert_eq!(config.pool.max_messages_per_connection, 10);
    }

    #[test]
    fn test_smtp_config_validation() {
        assert!(SmtpConfig::builder().build().is_err());
        assert!(SmtpConfig::builder().host("   ").build().is_err());

        let result = SmtpConfig::builder()
            .host("smtp.example.com")
            .pool(PoolConfig {
                max_connections: 0,
                ..Default::default()
            })
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_delivery_config_lookups() {
        let config = DeliveryConfig::builder()
            .exempt_sender("Ops@Example.com", "OPS_SMTP_PASSWORD")
            .provider_secret("gmail", "GMAIL_APP_PASSWORD")
            .build()
            .unwrap();

        assert!(config.is_exempt("ops@example.com"));
        assert!(!config.is_exempt("other@example.com"));
        assert_eq!(
            config.provider_secret("Gmail").map(|p| p.secret_key.as_str()),
            Some("GMAIL_APP_PASSWORD")
        );
        assert!(config.provider_secret("other").is_none());
    }

    #[test]
    fn test_delivery_config_rejects_bad_values() {
        let result = DeliveryConfig::builder().send_timeout(Duration::ZERO).build();
        assert!(result.is_err());

        let result = DeliveryConfig::builder().exempt_sender("ops@example.com", " ").build();
        assert!(result.is_err());
    }

    #[test]
    fn test_delivery_config_deserialize() {
        let json = r#"{
            "exempt_senders": [{"email": "ops@example.com", "secret_key": "OPS_PASS"}],
            "send_timeout": "45s",
            "hardening": {"content_policy": {"mode": "block_above", "threshold": 8}}
        }"#;
        let config: DeliveryConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.send_timeout, Duration::from_secs(45));
        assert_eq!(config.simulated_delay, DEFAULT_SIMULATED_DELAY);
        assert_eq!(config.hardening.content_policy, ContentPolicy::BlockAbove(8));
        assert!(config.rate_limit.enabled);
        assert!(config.is_exempt("ops@example.com"));
    }
}

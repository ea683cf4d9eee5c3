//! Credential and transport-selection policy.

use secrecy::SecretString;
use std::fmt;

use crate::config::{DeliveryConfig, SmtpConfig, TlsMode};
use crate::errors::{DeliveryError, DeliveryResult};
use crate::secrets::{CredentialSource, SecretResolver};
use crate::types::SenderAccount;

/// Why a send was routed to the simulated transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulationReason {
    /// The account is flagged test-mode only.
    TestModeOnly,
    /// No credential resolved by any route.
    MissingCredentials,
    /// The real transport could not be built.
    FactoryError(String),
    /// The real transport failed its liveness check.
    VerifyFailed(String),
}

impl fmt::Display for SimulationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimulationReason::TestModeOnly => write!(f, "account is test-mode only"),
            SimulationReason::MissingCredentials => write!(f, "no SMTP credential resolved"),
            SimulationReason::FactoryError(e) => write!(f, "transport could not be built: {}", e),
            SimulationReason::VerifyFailed(e) => write!(f, "transport verification failed: {}", e),
        }
    }
}

/// Everything needed to open a real transport for one account.
#[derive(Clone)]
pub struct ResolvedCredentials {
    /// Account id.
    pub account_id: i64,
    /// SMTP host.
    pub host: String,
    /// SMTP port.
    pub port: u16,
    /// Implicit TLS.
    pub secure: bool,
    /// Login name.
    pub username: String,
    /// Password.
    pub password: SecretString,
    /// Where the password came from.
    pub source: CredentialSource,
    /// The account is on the delivery-exempt allowlist.
    pub exempt: bool,
}

impl fmt::Debug for ResolvedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCredentials")
            .field("account_id", &self.account_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("source", &self.source)
            .field("exempt", &self.exempt)
            .finish()
    }
}

impl ResolvedCredentials {
    /// Builds the transport configuration, applying engine-wide TLS, pool,
    /// rate and timeout settings.
    pub fn smtp_config(&self, config: &DeliveryConfig) -> DeliveryResult<SmtpConfig> {
        let mut tls = config.tls.clone();
        tls.mode = if self.secure {
            TlsMode::Implicit
        } else {
            TlsMode::StartTlsRequired
        };

        let mut builder = SmtpConfig::builder()
            .host(self.host.clone())
            .port(self.port)
            .credentials(self.username.clone(), self.password.clone())
            .tls(tls)
            .connect_timeout(config.connect_timeout)
            .socket_timeout(config.socket_timeout)
            .pool(config.pool.clone())
            .rate_limit(config.rate_limit.clone());

        if let Some(client_id) = &config.client_id {
            builder = builder.client_id(client_id.clone());
        }

        builder.build()
    }
}

/// Transport decision for one account.
#[derive(Debug, Clone)]
pub enum TransportPlan {
    /// Build a real transport with these credentials.
    Real(ResolvedCredentials),
    /// Use the simulated transport.
    Simulated(SimulationReason),
}

impl TransportPlan {
    /// Returns true for the simulated variant.
    pub fn is_simulated(&self) -> bool {
        matches!(self, TransportPlan::Simulated(_))
    }
}

/// Decides between real and simulated delivery.
#[derive(Debug, Clone)]
pub struct CredentialPolicy {
    secrets: SecretResolver,
}

impl CredentialPolicy {
    /// Creates a policy over a secret resolver.
    pub fn new(secrets: SecretResolver) -> Self {
        Self { secrets }
    }

    /// Returns the secret resolver.
    pub fn secrets(&self) -> &SecretResolver {
        &self.secrets
    }

    /// Selects the transport plan for `account`.
    ///
    /// Test-mode accounts always simulate, before anything else is looked
    /// at. A missing host or port is a configuration error. A missing
    /// credential degrades to simulation with a warning.
    pub fn select(&self, account: &SenderAccount) -> DeliveryResult<TransportPlan> {
        if account.test_mode_only {
            return Ok(TransportPlan::Simulated(SimulationReason::TestModeOnly));
        }

        let Some((host, port)) = account.smtp.host_port() else {
            return Err(DeliveryError::configuration(format!(
                "Missing SMTP configuration for {}: host and port are required",
                account.email
            )));
        };

        let Some(secret) = self.secrets.resolve(account) else {
            tracing::warn!(
                account_id = account.id,
                provider = %account.provider,
                "No SMTP credential resolved, falling back to simulated transport"
            );
            return Ok(TransportPlan::Simulated(SimulationReason::MissingCredentials));
        };

        tracing::debug!(account_id = account.id, source = %secret.source, "Resolved SMTP credential");

        Ok(TransportPlan::Real(ResolvedCredentials {
            account_id: account.id,
            host: host.to_string(),
            port,
            secure: account.smtp.secure,
            username: account.smtp_username().to_string(),
            password: secret.password,
            source: secret.source,
            exempt: self.secrets.is_exempt(account),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExemptSender, ProviderSecret};
    use crate::errors::{DeliveryErrorKind, ErrorClass};
    use crate::secrets::StaticSecretProvider;
    use crate::types::MailEndpoint;
    use rstest::rstest;
    use std::sync::Arc;

    fn policy() -> CredentialPolicy {
        let provider = StaticSecretProvider::new()
            .with("GMAIL_APP_PASSWORD", "app-password")
            .with("OPS_PASSWORD", "ops");
        CredentialPolicy::new(SecretResolver::new(
            Arc::new(provider),
            vec![ExemptSender {
                email: "ops@example.com".into(),
                secret_key: "OPS_PASSWORD".into(),
            }],
            vec![ProviderSecret {
                provider: "gmail".into(),
                secret_key: "GMAIL_APP_PASSWORD".into(),
            }],
        ))
    }

    #[rstest]
    #[case(MailEndpoint::new("smtp.gmail.com", 587))]
    #[case(MailEndpoint::default())]
    fn test_test_mode_always_simulates(#[case] smtp: MailEndpoint) {
        let account = SenderAccount::new(1, "ops@example.com", "gmail")
            .with_smtp(smtp)
            .with_test_mode_only(true);
        let plan = policy().select(&account).unwrap();
        assert!(matches!(plan, TransportPlan::Simulated(SimulationReason::TestModeOnly)));
    }

    #[rstest]
    #[case(MailEndpoint::default())]
    #[case(MailEndpoint { port: None, ..MailEndpoint::new("smtp.example.com", 587) })]
    #[case(MailEndpoint::new("", 587))]
    fn test_missing_endpoint_is_configuration_error(#[case] smtp: MailEndpoint) {
        let account = SenderAccount::new(1, "a@example.com", "other").with_smtp(smtp);
        let err = policy().select(&account).unwrap_err();
        assert_eq!(err.kind(), DeliveryErrorKind::ConfigurationMissing);
        assert_eq!(err.class(), ErrorClass::Configuration);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_missing_credential_simulates() {
        let account = SenderAccount::new(1, "a@example.com", "other")
            .with_smtp(MailEndpoint::new("smtp.example.com", 587));
        let plan = policy().select(&account).unwrap();
        assert!(matches!(plan, TransportPlan::Simulated(SimulationReason::MissingCredentials)));
    }

    #[test]
    fn test_real_plan_carries_endpoint() {
        let account = SenderAccount::new(4, "sales@example.com", "gmail")
            .with_smtp(MailEndpoint::new("smtp.gmail.com", 465).secure(true));

        let TransportPlan::Real(creds) = policy().select(&account).unwrap() else {
            panic!("expected a real plan");
        };
        assert_eq!(creds.host, "smtp.gmail.com");
        assert_eq!(creds.username, "sales@example.com");
        assert_eq!(creds.source, CredentialSource::ProviderOverride);
        assert!(!creds.exempt);

        let config = creds.smtp_config(&DeliveryConfig::default()).unwrap();
        assert_eq!(config.tls.mode, TlsMode::Implicit);
        assert_eq!(config.pool.max_connections, 5);
        assert!(config.has_auth());
    }

    #[test]
    fn test_exempt_flagged() {
        let account = SenderAccount::new(2, "ops@example.com", "other")
            .with_smtp(MailEndpoint::new("smtp.example.com", 587));
        let TransportPlan::Real(creds) = policy().select(&account).unwrap() else {
            panic!("expected a real plan");
        };
        assert!(creds.exempt);
        assert_eq!(creds.source, CredentialSource::ExemptOverride);
        assert!(!format!("{:?}", creds).contains("ops\""));
    }
}

//! Credential lookup with a fixed precedence order.
//!
//! Secrets are read through a [`SecretProvider`] at resolution time, never
//! cached at startup, so rotating an environment value takes effect on the
//! next send.

use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::{DeliveryConfig, ExemptSender, ProviderSecret};
use crate::types::SenderAccount;

/// Named secret lookup.
pub trait SecretProvider: Send + Sync + fmt::Debug {
    /// Returns the secret stored under `key`, if any.
    fn get(&self, key: &str) -> Option<SecretString>;
}

/// Reads secrets from process environment variables.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSecretProvider;

impl SecretProvider for EnvSecretProvider {
    fn get(&self, key: &str) -> Option<SecretString> {
        std::env::var(key)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(SecretString::new)
    }
}

/// Fixed secret map.
#[derive(Default)]
pub struct StaticSecretProvider {
    values: HashMap<String, SecretString>,
}

impl StaticSecretProvider {
    /// Creates an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a secret.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), SecretString::new(value.into()));
        self
    }
}

impl fmt::Debug for StaticSecretProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticSecretProvider")
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SecretProvider for StaticSecretProvider {
    fn get(&self, key: &str) -> Option<SecretString> {
        self.values.get(key).cloned()
    }
}

/// Where a resolved credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// Override for a delivery-exempt sender.
    ExemptOverride,
    /// Override for the account's provider class.
    ProviderOverride,
    /// The account record.
    Stored,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::ExemptOverride => write!(f, "exempt_override"),
            CredentialSource::ProviderOverride => write!(f, "provider_override"),
            CredentialSource::Stored => write!(f, "stored"),
        }
    }
}

/// A credential and its origin.
#[derive(Clone)]
pub struct ResolvedSecret {
    /// The password.
    pub password: SecretString,
    /// Where it came from.
    pub source: CredentialSource,
}

impl fmt::Debug for ResolvedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedSecret")
            .field("password", &"[REDACTED]")
            .field("source", &self.source)
            .finish()
    }
}

/// Applies credential precedence for one account.
///
/// Exempt senders take their override first and fall back to the stored
/// credential. Other accounts whose provider has a dedicated secret take
/// that first. Everyone else uses the stored credential.
#[derive(Debug, Clone)]
pub struct SecretResolver {
    provider: Arc<dyn SecretProvider>,
    exempt_senders: Vec<ExemptSender>,
    provider_secrets: Vec<ProviderSecret>,
}

impl SecretResolver {
    /// Creates a resolver.
    pub fn new(
        provider: Arc<dyn SecretProvider>,
        exempt_senders: Vec<ExemptSender>,
        provider_secrets: Vec<ProviderSecret>,
    ) -> Self {
        Self {
            provider,
            exempt_senders,
            provider_secrets,
        }
    }

    /// Creates a resolver from the allowlist and provider table in `config`.
    pub fn from_config(provider: Arc<dyn SecretProvider>, config: &DeliveryConfig) -> Self {
        Self::new(
            provider,
            config.exempt_senders.clone(),
            config.provider_secrets.clone(),
        )
    }

    /// Returns true if the account is on the delivery-exempt allowlist.
    pub fn is_exempt(&self, account: &SenderAccount) -> bool {
        self.exempt_entry(account).is_some()
    }

    /// Resolves the credential for `account`, or `None` if no route yields one.
    pub fn resolve(&self, account: &SenderAccount) -> Option<ResolvedSecret> {
        if let Some(exempt) = self.exempt_entry(account) {
            if let Some(password) = self.lookup(&exempt.secret_key) {
                return Some(ResolvedSecret {
                    password,
                    source: CredentialSource::ExemptOverride,
                });
            }
            tracing::debug!(account_id = account.id, key = %exempt.secret_key, "Exempt override unset, using stored credential");
            return stored(account);
        }

        let dedicated = self
            .provider_secrets
            .iter()
            .find(|p| p.provider.eq_ignore_ascii_case(&account.provider));

        if let Some(dedicated) = dedicated {
            if let Some(password) = self.lookup(&dedicated.secret_key) {
                return Some(ResolvedSecret {
                    password,
                    source: CredentialSource::ProviderOverride,
                });
            }
        }

        stored(account)
    }

    fn exempt_entry(&self, account: &SenderAccount) -> Option<&ExemptSender> {
        self.exempt_senders
            .iter()
            .find(|e| e.email.eq_ignore_ascii_case(account.email.trim()))
    }

    fn lookup(&self, key: &str) -> Option<SecretString> {
        self.provider
            .get(key)
            .filter(|s| !s.expose_secret().is_empty())
    }
}

fn stored(account: &SenderAccount) -> Option<ResolvedSecret> {
    account
        .smtp
        .password
        .as_ref()
        .filter(|p| !p.expose_secret().is_empty())
        .map(|password| ResolvedSecret {
            password: password.clone(),
            source: CredentialSource::Stored,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MailEndpoint;

    fn resolver(provider: StaticSecretProvider) -> SecretResolver {
        SecretResolver::new(
            Arc::new(provider),
            vec![ExemptSender {
                email: "ops@example.com".into(),
                secret_key: "OPS_SMTP_PASSWORD".into(),
            }],
            vec![ProviderSecret {
                provider: "gmail".into(),
                secret_key: "GMAIL_APP_PASSWORD".into(),
            }],
        )
    }

    fn account(email: &str, provider: &str, stored: Option<&str>) -> SenderAccount {
        let mut smtp = MailEndpoint::new("smtp.example.com", 587);
        if let Some(pw) = stored {
            smtp = smtp.credentials(email, pw);
        }
        SenderAccount::new(1, email, provider).with_smtp(smtp)
    }

    fn secret(resolved: Option<ResolvedSecret>) -> Option<(String, CredentialSource)> {
        resolved.map(|r| (r.password.expose_secret().clone(), r.source))
    }

    #[test]
    fn test_exempt_override_wins() {
        let r = resolver(StaticSecretProvider::new().with("OPS_SMTP_PASSWORD", "env"));
        let resolved = r.resolve(&account("OPS@example.com", "gmail", Some("db")));
        assert_eq!(secret(resolved), Some(("env".into(), CredentialSource::ExemptOverride)));
    }

    #[test]
    fn test_exempt_falls_back_to_stored() {
        let r = resolver(StaticSecretProvider::new().with("GMAIL_APP_PASSWORD", "app"));
        let resolved = r.resolve(&account("ops@example.com", "gmail", Some("db")));
        assert_eq!(secret(resolved), Some(("db".into(), CredentialSource::Stored)));
    }

    #[test]
    fn test_provider_override_before_stored() {
        let r = resolver(StaticSecretProvider::new().with("GMAIL_APP_PASSWORD", "app"));
        let resolved = r.resolve(&account("sales@example.com", "Gmail", Some("db")));
        assert_eq!(secret(resolved), Some(("app".into(), CredentialSource::ProviderOverride)));
    }

    #[test]
    fn test_nothing_resolves() {
        let r = resolver(StaticSecretProvider::new());
        assert!(r.resolve(&account("sales@example.com", "other", None)).is_none());
        assert!(r.resolve(&account("sales@example.com", "other", Some(""))).is_none());
    }

    #[test]
    fn test_env_provider_reads_at_call_time() {
        let key = format!("MAIL_DELIVERY_TEST_{}", uuid::Uuid::new_v4().simple());
        assert!(EnvSecretProvider.get(&key).is_none());
        std::env::set_var(&key, "late");
        assert_eq!(EnvSecretProvider.get(&key).unwrap().expose_secret(), "late");
        std::env::remove_var(&key);
    }

    #[test]
    fn test_debug_hides_values() {
        let provider = StaticSecretProvider::new().with("KEY", "hunter2");
        assert!(!format!("{:?}", provider).contains("hunter2"));
    }
}

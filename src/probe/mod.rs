//! Validation probe.
//!
//! Diagnoses an account's configuration without sending mail: TCP
//! reachability of its endpoints, SPF plausibility for the sender domain,
//! and a transport liveness check. The probe has no access to the attempt
//! log and never opens a mail transaction.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::TokioAsyncResolver;

use crate::errors::{DeliveryError, DeliveryErrorKind, DeliveryResult};
use crate::factory::TransportFactory;
use crate::observability::Timer;
use crate::policy::{CredentialPolicy, SimulationReason, TransportPlan};
use crate::types::{MailEndpoint, ProbeDetails, SenderAccount, SpfCheck, ValidationReport};

/// Bounce rate above which the probe warns.
pub const BOUNCE_RATE_WARNING: f64 = 0.05;

/// Complaint rate above which the probe warns.
pub const COMPLAINT_RATE_WARNING: f64 = 0.001;

/// DNS TXT lookup.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TxtLookup: Send + Sync {
    /// Returns the TXT records of `domain`, or an empty list if it has none.
    async fn txt_records(&self, domain: &str) -> DeliveryResult<Vec<String>>;
}

/// [`TxtLookup`] backed by trust-dns.
#[derive(Clone)]
pub struct DnsTxtLookup {
    resolver: TokioAsyncResolver,
}

impl std::fmt::Debug for DnsTxtLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsTxtLookup").finish_non_exhaustive()
    }
}

impl DnsTxtLookup {
    /// Uses the system resolver configuration.
    pub fn from_system_conf() -> DeliveryResult<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().map_err(|e| {
            DeliveryError::new(DeliveryErrorKind::DnsResolution, "Failed to load resolver configuration")
                .with_cause(e)
        })?;
        Ok(Self { resolver })
    }

    /// Wraps an existing resolver.
    pub fn new(resolver: TokioAsyncResolver) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl TxtLookup for DnsTxtLookup {
    async fn txt_records(&self, domain: &str) -> DeliveryResult<Vec<String>> {
        match self.resolver.txt_lookup(domain).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|txt| {
                    txt.txt_data()
                        .iter()
                        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
                        .collect::<String>()
                })
                .collect()),
            Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => Ok(Vec::new()),
            Err(e) => Err(DeliveryError::new(
                DeliveryErrorKind::DnsResolution,
                format!("TXT lookup for {} failed", domain),
            )
            .with_cause(e)),
        }
    }
}

/// Runs account diagnostics.
pub struct ValidationProbe {
    policy: Arc<CredentialPolicy>,
    factory: Arc<TransportFactory>,
    dns: Arc<dyn TxtLookup>,
    connect_timeout: Duration,
}

impl std::fmt::Debug for ValidationProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationProbe")
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl ValidationProbe {
    /// Creates a probe.
    pub fn new(
        policy: Arc<CredentialPolicy>,
        factory: Arc<TransportFactory>,
        dns: Arc<dyn TxtLookup>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            policy,
            factory,
            dns,
            connect_timeout,
        }
    }

    /// Validates `account`.
    ///
    /// `issues` are blocking and make the report invalid; `details.warnings`
    /// never do.
    pub async fn validate(&self, account: &SenderAccount) -> ValidationReport {
        let timer = Timer::start("probe");
        let mut issues = Vec::new();
        let mut warnings = health_warnings(account);

        let endpoint = account.smtp.host_port().map(|(h, p)| (h.to_string(), p));
        let imap = account.imap.as_ref().and_then(MailEndpoint::host_port);
        let domain = account.domain();

        let (smtp_probe, imap_probe, spf) = futures::join!(
            async {
                match &endpoint {
                    Some((host, port)) => Some(self.reachable(host, *port).await),
                    None => None,
                }
            },
            async {
                match imap {
                    Some((host, port)) => Some(self.reachable(host, port).await.is_ok()),
                    None => None,
                }
            },
            async {
                match &endpoint {
                    Some((host, _)) => self.check_spf(&domain, host).await,
                    None => SpfCheck::Skipped,
                }
            },
        );

        let smtp_reachable = match (&endpoint, smtp_probe) {
            (Some(_), Some(Ok(()))) => true,
            (Some((host, port)), Some(Err(e))) => {
                issues.push(format!("Cannot connect to SMTP server {}:{}: {}", host, port, e.message()));
                false
            }
            _ => {
                issues.push("SMTP host and port are required".to_string());
                false
            }
        };

        if let (Some((host, port)), Some(false)) = (imap, imap_probe) {
            warnings.push(format!("IMAP server {}:{} is not reachable", host, port));
        }
        let imap_reachable = imap_probe;

        match &spf {
            SpfCheck::Missing => warnings.push(format!("No SPF record published for {}", domain)),
            SpfCheck::Unrelated { record } => {
                warnings.push(format!("SPF record for {} does not cover the SMTP relay: {}", domain, record))
            }
            SpfCheck::LookupFailed { reason } => warnings.push(format!("SPF lookup failed: {}", reason)),
            SpfCheck::Plausible { .. } | SpfCheck::Skipped => {}
        }

        let verified = if smtp_reachable {
            self.verify(account, &mut issues, &mut warnings).await
        } else {
            None
        };

        for warning in &warnings {
            tracing::warn!(account_id = account.id, warning = %warning, "Account validation warning");
        }

        let valid = issues.is_empty();
        tracing::info!(account_id = account.id, valid, smtp_reachable, issues = issues.len(), "Account validated");

        ValidationReport {
            valid,
            issues,
            can_connect: smtp_reachable,
            details: ProbeDetails {
                smtp_host: endpoint.as_ref().map(|(h, _)| h.clone()),
                smtp_port: endpoint.as_ref().map(|(_, p)| *p),
                smtp_reachable,
                imap_reachable,
                spf,
                verified,
                warnings,
                elapsed_ms: timer.elapsed_ms(),
            },
        }
    }

    async fn verify(&self, account: &SenderAccount, issues: &mut Vec<String>, warnings: &mut Vec<String>) -> Option<bool> {
        match self.policy.select(account) {
            Ok(TransportPlan::Real(creds)) => match self.factory.verify(&creds).await {
                Ok(()) => Some(true),
                Err(e) => {
                    issues.push(format!("SMTP verification failed: {}", e));
                    Some(false)
                }
            },
            Ok(TransportPlan::Simulated(SimulationReason::TestModeOnly)) => {
                warnings.push("Account is test-mode only; real delivery is disabled".to_string());
                None
            }
            Ok(TransportPlan::Simulated(reason)) => {
                issues.push(format!("SMTP credentials unavailable: {}", reason));
                None
            }
            Err(e) => {
                issues.push(e.message().to_string());
                None
            }
        }
    }

    async fn reachable(&self, host: &str, port: u16) -> DeliveryResult<()> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(DeliveryError::connection(e.to_string())),
            Err(_) => Err(DeliveryError::timeout(
                DeliveryErrorKind::ConnectTimeout,
                format!("No answer within {:?}", self.connect_timeout),
            )),
        }
    }

    async fn check_spf(&self, domain: &str, relay: &str) -> SpfCheck {
        if domain.is_empty() {
            return SpfCheck::Skipped;
        }
        match self.dns.txt_records(domain).await {
            Ok(records) => spf_plausibility(domain, relay, &records),
            Err(e) => SpfCheck::LookupFailed { reason: e.to_string() },
        }
    }
}

/// Judges whether the sender domain's SPF policy plausibly covers `relay`.
pub fn spf_plausibility(domain: &str, relay: &str, records: &[String]) -> SpfCheck {
    let Some(record) = records
        .iter()
        .find(|r| r.trim_start().to_ascii_lowercase().starts_with("v=spf1"))
    else {
        return SpfCheck::Missing;
    };

    let lowered = record.to_ascii_lowercase();
    let relay_domain = base_domain(relay);

    let mut tokens = vec![relay_domain.clone()];
    match relay_domain.as_str() {
        "gmail.com" | "googlemail.com" => tokens.push("google.com".to_string()),
        "office365.com" | "outlook.com" | "hotmail.com" => tokens.push("outlook.com".to_string()),
        "yahoo.com" => tokens.push("yahoodns.net".to_string()),
        _ => {}
    }

    let mentions_relay = tokens.iter().any(|t| lowered.contains(t.as_str()));
    let self_hosted = relay_domain == base_domain(domain)
        && lowered.split_whitespace().any(|m| {
            let m = m.trim_start_matches(['+', '~', '?']);
            m == "a" || m == "mx" || m.starts_with("a:") || m.starts_with("mx:")
        });

    if mentions_relay || self_hosted {
        SpfCheck::Plausible { record: record.clone() }
    } else {
        SpfCheck::Unrelated { record: record.clone() }
    }
}

fn base_domain(host: &str) -> String {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 {
        return host;
    }
    labels[labels.len() - 2..].join(".")
}

fn health_warnings(account: &SenderAccount) -> Vec<String> {
    let mut warnings = Vec::new();
    let health = &account.health;

    if health.bounce_rate > BOUNCE_RATE_WARNING {
        warnings.push(format!("Bounce rate {:.1}% exceeds {:.0}%", health.bounce_rate * 100.0, BOUNCE_RATE_WARNING * 100.0));
    }
    if health.complaint_rate > COMPLAINT_RATE_WARNING {
        warnings.push(format!(
            "Complaint rate {:.2}% exceeds {:.1}%",
            health.complaint_rate * 100.0,
            COMPLAINT_RATE_WARNING * 100.0
        ));
    }
    if !health.domain_authenticated {
        warnings.push(format!("Domain {} is not authenticated (SPF/DKIM)", account.domain()));
    }
    if !account.is_active() {
        warnings.push(format!("Account is {}", account.status));
    }
    if account.limits.daily == Some(0) || account.limits.hourly == Some(0) {
        warnings.push("A send limit of zero blocks all outbound mail".to_string());
    }
    if account.warmup.enabled {
        warnings.push(format!("Warmup in progress (day {}); keep volume low", account.warmup.day));
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeliveryConfig;
    use crate::mocks::{MockConnector, MockMailTransport};
    use crate::observability::DeliveryMetrics;
    use crate::secrets::{SecretResolver, StaticSecretProvider};
    use crate::types::{AccountStatus, HealthMetrics};
    use mockall::predicate::eq;
    use tokio::net::TcpListener;

    const GOOGLE_SPF: &str = "v=spf1 include:_spf.google.com ~all";

    fn probe(transport: MockMailTransport, dns: MockTxtLookup) -> ValidationProbe {
        let config = DeliveryConfig::builder()
            .provider_secret("gmail", "GMAIL_APP_PASSWORD")
            .build()
            .unwrap();
        let provider = StaticSecretProvider::new().with("GMAIL_APP_PASSWORD", "app");
        let policy = Arc::new(CredentialPolicy::new(SecretResolver::from_config(Arc::new(provider), &config)));
        let factory = Arc::new(TransportFactory::new(
            Arc::new(MockConnector::new(transport)),
            Arc::new(config),
            Arc::new(DeliveryMetrics::new()),
        ));
        ValidationProbe::new(policy, factory, Arc::new(dns), Duration::from_secs(2))
    }

    fn dns_with(records: Vec<&'static str>) -> MockTxtLookup {
        let mut dns = MockTxtLookup::new();
        dns.expect_txt_records()
            .with(eq("brand.example"))
            .returning(move |_| Ok(records.iter().map(|r| r.to_string()).collect()));
        dns
    }

    async fn listening_port() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    async fn closed_port() -> u16 {
        let (listener, port) = listening_port().await;
        drop(listener);
        port
    }

    fn account(port: u16) -> SenderAccount {
        SenderAccount::new(1, "sales@brand.example", "gmail")
            .with_smtp(MailEndpoint::new("127.0.0.1", port))
            .with_health(HealthMetrics {
                domain_authenticated: true,
                ..Default::default()
            })
    }

    #[tokio::test]
    async fn test_healthy_account_is_valid() {
        let (_listener, port) = listening_port().await;
        let report = probe(MockMailTransport::new(), dns_with(vec!["v=spf1 a mx ~all"]))
            .validate(&account(port))
            .await;

        assert!(report.valid, "issues: {:?}", report.issues);
        assert!(report.can_connect);
        assert_eq!(report.details.verified, Some(true));
        assert!(matches!(report.details.spf, SpfCheck::Unrelated { .. }));
        assert_eq!(report.details.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_skips_verify() {
        let port = closed_port().await;
        let transport = MockMailTransport::new();
        let report = probe(transport.clone(), dns_with(vec![])).validate(&account(port)).await;

        assert!(!report.valid);
        assert!(!report.can_connect);
        assert_eq!(report.details.verified, None);
        assert_eq!(report.details.spf, SpfCheck::Missing);
        assert_eq!(transport.verify_count(), 0);
        assert!(report.issues[0].starts_with("Cannot connect to SMTP server"));
    }

    #[tokio::test]
    async fn test_verify_failure_is_an_issue() {
        let (_listener, port) = listening_port().await;
        let transport = MockMailTransport::new().with_verify_error(DeliveryError::authentication("535 bad credentials"));
        let report = probe(transport, dns_with(vec![GOOGLE_SPF])).validate(&account(port)).await;

        assert!(!report.valid);
        assert!(report.can_connect);
        assert_eq!(report.details.verified, Some(false));
        assert!(report.issues.iter().any(|i| i.contains("verification failed")));
    }

    #[tokio::test]
    async fn test_missing_endpoint() {
        let account = SenderAccount::new(1, "sales@brand.example", "other");
        let mut dns = MockTxtLookup::new();
        dns.expect_txt_records().never();

        let report = probe(MockMailTransport::new(), dns).validate(&account).await;
        assert!(!report.valid);
        assert_eq!(report.issues, vec!["SMTP host and port are required".to_string()]);
        assert_eq!(report.details.spf, SpfCheck::Skipped);
    }

    #[tokio::test]
    async fn test_health_warnings_do_not_invalidate() {
        let (_listener, port) = listening_port().await;
        let account = account(port)
            .with_status(AccountStatus::Paused)
            .with_health(HealthMetrics {
                bounce_rate: 0.08,
                complaint_rate: 0.002,
                domain_authenticated: false,
            });

        let report = probe(MockMailTransport::new(), dns_with(vec![GOOGLE_SPF]))
            .validate(&account)
            .await;

        assert!(report.valid);
        let warnings = report.details.warnings.join("\n");
        assert!(warnings.contains("Bounce rate 8.0%"));
        assert!(warnings.contains("Complaint rate 0.20%"));
        assert!(warnings.contains("not authenticated"));
        assert!(warnings.contains("Account is paused"));
    }

    #[test]
    fn test_spf_plausibility() {
        let records = vec!["google-site-verification=abc".to_string(), GOOGLE_SPF.to_string()];
        assert!(matches!(
            spf_plausibility("brand.example", "smtp.gmail.com", &records),
            SpfCheck::Plausible { .. }
        ));
        assert!(matches!(
            spf_plausibility("brand.example", "smtp.mailhost.net", &records),
            SpfCheck::Unrelated { .. }
        ));
        assert!(matches!(
            spf_plausibility("brand.example", "mail.brand.example", &["v=spf1 mx -all".to_string()]),
            SpfCheck::Plausible { .. }
        ));
        assert_eq!(spf_plausibility("brand.example", "smtp.gmail.com", &[]), SpfCheck::Missing);
    }
}

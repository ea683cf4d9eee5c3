//! Delivery engine.
//!
//! The public face of the crate. Every operation returns a definite result
//! shape; delivery failures never surface as `Err`.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::Instrument;

use crate::audit::AttemptLogger;
use crate::config::{DeliveryConfig, TlsMode};
use crate::errors::{DeliveryError, DeliveryErrorKind, DeliveryResult};
use crate::executor::DeliveryExecutor;
use crate::factory::{SelectedTransport, SmtpConnector, TransportConnector, TransportFactory};
use crate::hardening::{ContentHardener, HardenedContent};
use crate::observability::{DeliveryContext, DeliveryMetrics};
use crate::policy::{CredentialPolicy, SimulationReason, TransportPlan};
use crate::probe::{DnsTxtLookup, TxtLookup, ValidationProbe};
use crate::resolver::AccountResolver;
use crate::scheduler::{self, ScheduledSendTicket, Scheduler};
use crate::secrets::{EnvSecretProvider, SecretProvider, SecretResolver};
use crate::store::{
    AccountStore, AttemptStore, EmailRecordStore, InMemoryAttemptStore, InMemoryEmailStore, TrackingInjector,
};
use crate::transport::{MailTransport, SimulatedTransport};
use crate::types::{
    EmailRecord, EmailStatus, ScheduleOutcome, SendOutcome, SendRequest, SenderAccount, SenderRef,
    TransportKind, ValidationReport,
};

/// Outbound delivery engine.
///
/// Cheap to clone; clones share pools, stores and scheduled tickets.
#[derive(Clone)]
pub struct DeliveryEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: Arc<DeliveryConfig>,
    resolver: AccountResolver,
    policy: Arc<CredentialPolicy>,
    factory: Arc<TransportFactory>,
    hardener: ContentHardener,
    executor: DeliveryExecutor,
    audit: AttemptLogger,
    emails: Arc<dyn EmailRecordStore>,
    tracking: Option<Arc<dyn TrackingInjector>>,
    scheduler: Scheduler,
    probe: ValidationProbe,
    simulated: Arc<SimulatedTransport>,
    metrics: Arc<DeliveryMetrics>,
}

impl std::fmt::Debug for DeliveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryEngine")
            .field("factory", &self.inner.factory)
            .field("pending_tickets", &self.inner.scheduler.pending())
            .finish_non_exhaustive()
    }
}

impl DeliveryEngine {
    /// Creates a builder. Only the account store is required.
    pub fn builder(config: DeliveryConfig) -> DeliveryEngineBuilder {
        DeliveryEngineBuilder::new(config)
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &DeliveryConfig {
        &self.inner.config
    }

    /// Returns the delivery counters.
    pub fn metrics(&self) -> &Arc<DeliveryMetrics> {
        &self.inner.metrics
    }

    /// Returns the scheduler, for ticket introspection.
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Returns the transport factory.
    pub fn factory(&self) -> &TransportFactory {
        &self.inner.factory
    }

    /// Sends `request` from the account referenced by `sender`.
    pub async fn send_email(&self, sender: impl Into<SenderRef>, request: SendRequest) -> SendOutcome {
        let sender = sender.into();
        let span = tracing::info_span!("send_email", sender = %sender);
        async {
            match self.inner.resolver.resolve(&sender).await {
                Ok(account) => self.deliver(account, request, None).await,
                Err(e) => self.unresolved(e),
            }
        }
        .instrument(span)
        .await
    }

    /// Sends `request` from the primary account of the owning entity `owner`.
    pub async fn send_email_from_creator(&self, owner: impl Into<SenderRef>, request: SendRequest) -> SendOutcome {
        let owner = owner.into();
        let span = tracing::info_span!("send_email_from_creator", owner = %owner);
        async {
            match self.inner.resolver.resolve_owner(&owner).await {
                Ok(account) => self.deliver(account, request, None).await,
                Err(e) => self.unresolved(e),
            }
        }
        .instrument(span)
        .await
    }

    /// Sends `request` at `fire_at`.
    ///
    /// A fire time that is not in the future sends immediately, exactly as
    /// [`send_email`](Self::send_email) would. Otherwise a ticket is armed
    /// and the send happens in the background.
    pub async fn schedule_email(
        &self,
        sender: impl Into<SenderRef>,
        request: SendRequest,
        fire_at: DateTime<Utc>,
    ) -> ScheduleOutcome {
        let sender = sender.into();
        let request = request.with_fire_at(Some(fire_at));

        if scheduler::is_due(Some(fire_at)) {
            let outcome = self.send_email(sender, request).await;
            return ScheduleOutcome {
                success: outcome.success,
                email_id: outcome.email_id,
                test_mode: outcome.test_mode,
                error: outcome.error,
            };
        }

        let span = tracing::info_span!("schedule_email", sender = %sender, fire_at = %fire_at);
        self.arm(sender, request, fire_at).instrument(span).await
    }

    /// Diagnoses `account` without sending mail.
    pub async fn validate_email_account(&self, account: &SenderAccount) -> ValidationReport {
        let span = tracing::info_span!("validate_email_account", account_id = account.id);
        self.inner.probe.validate(account).instrument(span).await
    }

    /// Sends a generated diagnostic message to `recipient`.
    pub async fn send_test_email(&self, sender: impl Into<SenderRef>, recipient: &str) -> SendOutcome {
        let sender = sender.into();
        let span = tracing::info_span!("send_test_email", sender = %sender);
        async {
            let account = match self.inner.resolver.resolve(&sender).await {
                Ok(account) => account,
                Err(e) => return self.unresolved(e),
            };

            let request = match test_email_request(&account, recipient) {
                Ok(request) => request,
                Err(e) => return SendOutcome::failed(e.to_string(), account.test_mode_only),
            };

            self.deliver(account, request, None).await
        }
        .instrument(span)
        .await
    }

    async fn arm(&self, sender: SenderRef, request: SendRequest, fire_at: DateTime<Utc>) -> ScheduleOutcome {
        let account = match self.inner.resolver.resolve(&sender).await {
            Ok(account) => account,
            Err(e) => return schedule_failed(e, false),
        };
        if !account.is_active() {
            return schedule_failed(inactive(&account), account.test_mode_only);
        }

        let now = Utc::now();
        let record = EmailRecord {
            id: 0,
            account_id: account.id,
            recipient: request.primary_recipient().map(|a| a.email.clone()).unwrap_or_default(),
            subject: request.subject.clone(),
            html: request.html.clone(),
            text: request.text.clone(),
            status: EmailStatus::Scheduled,
            message_id: None,
            association: request.association,
            scheduled_for: Some(fire_at),
            sent_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        let email_id = self.persist_new(record).await;

        let ticket = ScheduledSendTicket::new(sender, account.id, request, fire_at).with_email_id(email_id);
        let engine = self.clone();
        self.inner.scheduler.arm(ticket, move |ticket| async move { engine.fire(ticket).await });

        ScheduleOutcome {
            success: true,
            email_id,
            test_mode: account.test_mode_only,
            error: None,
        }
    }

    async fn fire(&self, ticket: ScheduledSendTicket) -> SendOutcome {
        match self.inner.resolver.resolve(&ticket.sender).await {
            Ok(account) => self.deliver(account, ticket.request, ticket.email_id).await,
            Err(e) => {
                let outcome = self.unresolved(e);
                if let Some(id) = ticket.email_id {
                    self.mark_failed(id, outcome.error.clone()).await;
                }
                outcome
            }
        }
    }

    fn unresolved(&self, e: DeliveryError) -> SendOutcome {
        self.inner.metrics.record_failure();
        tracing::warn!(error = %e, "Sender account could not be resolved");
        SendOutcome::failed(e.to_string(), false)
    }

    /// Runs the pipeline for one resolved account. `email_id` links a record
    /// created at scheduling time.
    async fn deliver(&self, account: SenderAccount, request: SendRequest, email_id: Option<i64>) -> SendOutcome {
        let ctx = DeliveryContext::new(account.id, account.email.clone())
            .with_recipients(request.recipient_count())
            .with_association(request.association);
        let span = ctx.span();
        self.run_pipeline(account, request, email_id).instrument(span).await
    }

    async fn run_pipeline(&self, account: SenderAccount, request: SendRequest, email_id: Option<i64>) -> SendOutcome {
        let inner = &self.inner;

        if !account.is_active() {
            return self.reject(inactive(&account), account.test_mode_only, email_id).await;
        }

        let plan = match inner.policy.select(&account) {
            Ok(plan) => plan,
            Err(e) => return self.reject(e, false, email_id).await,
        };

        let hardened = match inner.hardener.harden(&account, &request) {
            Ok(hardened) => hardened,
            Err(e) => return self.reject(e, plan.is_simulated(), email_id).await,
        };

        let transport = self.select_transport(&account, plan).await;
        let execution = inner.executor.execute(transport, &hardened.message).await;
        let elapsed_ms = execution.elapsed_ms();

        inner
            .audit
            .record(account.id, execution.kind, execution.result.as_ref(), elapsed_ms, request.association)
            .await;

        let test_mode = execution.kind == TransportKind::Simulated;
        let message_id = hardened.message.message_id_header();

        match execution.result {
            Ok(receipt) => {
                let email_id = self
                    .persist_result(&account, &request, &hardened, email_id, EmailStatus::Sent, None)
                    .await;

                if let Some(id) = email_id {
                    self.track(id, &message_id).await;
                }

                tracing::info!(
                    message_id = %message_id,
                    transport = %execution.kind,
                    elapsed_ms,
                    accepted = receipt.accepted.len(),
                    rejected = receipt.rejected.len(),
                    "Email sent"
                );
                SendOutcome::sent(message_id, email_id, test_mode)
            }
            Err(e) => {
                let error = e.to_string();
                let email_id = self
                    .persist_result(&account, &request, &hardened, email_id, EmailStatus::Failed, Some(error.clone()))
                    .await;

                tracing::warn!(
                    message_id = %message_id,
                    transport = %execution.kind,
                    elapsed_ms,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Email send failed"
                );
                SendOutcome::failed(error, test_mode).with_email_id(email_id)
            }
        }
    }

    async fn select_transport(&self, account: &SenderAccount, plan: TransportPlan) -> Arc<dyn MailTransport> {
        let reason = match plan {
            TransportPlan::Real(creds) => match self.inner.factory.build(&creds).await {
                SelectedTransport::Real { transport, optimistic } => {
                    if optimistic {
                        tracing::info!(account_id = account.id, "Using unverified transport for exempt sender");
                    }
                    return transport;
                }
                SelectedTransport::Simulated(reason) => reason,
            },
            TransportPlan::Simulated(reason) => reason,
        };

        match reason {
            SimulationReason::TestModeOnly => {
                tracing::info!(account_id = account.id, "Account is test-mode only, using simulated transport");
            }
            reason => {
                tracing::warn!(account_id = account.id, reason = %reason, "Using simulated transport");
            }
        }
        self.inner.simulated.clone()
    }

    /// Fails a send before any transport is used. No attempt is recorded.
    async fn reject(&self, e: DeliveryError, test_mode: bool, email_id: Option<i64>) -> SendOutcome {
        self.inner.metrics.record_failure();
        tracing::warn!(error = %e, kind = %e.kind(), "Send rejected before dispatch");

        if let Some(id) = email_id {
            self.mark_failed(id, Some(e.to_string())).await;
        }
        SendOutcome::failed(e.to_string(), test_mode).with_email_id(email_id)
    }

    async fn persist_result(
        &self,
        account: &SenderAccount,
        request: &SendRequest,
        hardened: &HardenedContent,
        email_id: Option<i64>,
        status: EmailStatus,
        error: Option<String>,
    ) -> Option<i64> {
        let now = Utc::now();
        let message = &hardened.message;
        let record = EmailRecord {
            id: email_id.unwrap_or_default(),
            account_id: account.id,
            recipient: request.primary_recipient().map(|a| a.email.clone()).unwrap_or_default(),
            subject: message.subject.clone(),
            html: message.html.clone(),
            text: message.text.clone(),
            status,
            message_id: Some(message.message_id_header()),
            association: request.association,
            scheduled_for: request.fire_at,
            sent_at: (status == EmailStatus::Sent).then_some(now),
            error,
            created_at: now,
            updated_at: now,
        };

        match email_id {
            Some(id) => {
                let created_at = match self.inner.emails.get(id).await {
                    Ok(Some(existing)) => existing.created_at,
                    _ => now,
                };
                let record = EmailRecord { created_at, ..record };
                if let Err(e) = self.inner.emails.update(&record).await {
                    self.persistence_failed(&e);
                }
                Some(id)
            }
            None => self.persist_new(record).await,
        }
    }

    async fn persist_new(&self, record: EmailRecord) -> Option<i64> {
        match self.inner.emails.create(record).await {
            Ok(created) => Some(created.id),
            Err(e) => {
                self.persistence_failed(&e);
                None
            }
        }
    }

    async fn mark_failed(&self, id: i64, error: Option<String>) {
        let existing = match self.inner.emails.get(id).await {
            Ok(Some(existing)) => existing,
            Ok(None) => return,
            Err(e) => return self.persistence_failed(&e),
        };
        let record = EmailRecord {
            status: EmailStatus::Failed,
            error,
            updated_at: Utc::now(),
            ..existing
        };
        if let Err(e) = self.inner.emails.update(&record).await {
            self.persistence_failed(&e);
        }
    }

    fn persistence_failed(&self, e: &DeliveryError) {
        self.inner.metrics.record_persistence_failure();
        tracing::warn!(error = %e, "Failed to persist email record");
    }

    async fn track(&self, email_id: i64, message_id: &str) {
        let Some(tracking) = &self.inner.tracking else {
            return;
        };
        match tracking.inject(email_id, message_id).await {
            Ok(handle) => tracing::debug!(email_id, tracking = %handle, "Tracking attached"),
            Err(e) => tracing::warn!(email_id, error = %e, "Tracking injection failed"),
        }
    }
}

fn inactive(account: &SenderAccount) -> DeliveryError {
    DeliveryError::new(
        DeliveryErrorKind::AccountInactive,
        format!("Sender account {} is {}", account.email, account.status),
    )
}

fn schedule_failed(e: DeliveryError, test_mode: bool) -> ScheduleOutcome {
    tracing::warn!(error = %e, "Send could not be scheduled");
    ScheduleOutcome {
        success: false,
        email_id: None,
        test_mode,
        error: Some(e.to_string()),
    }
}

fn test_email_request(account: &SenderAccount, recipient: &str) -> DeliveryResult<SendRequest> {
    let (host, port) = match account.smtp.host_port() {
        Some((host, port)) => (host.to_string(), port.to_string()),
        None => ("not configured".to_string(), "not configured".to_string()),
    };
    let tls = if account.smtp.secure {
        TlsMode::Implicit
    } else {
        TlsMode::StartTlsRequired
    };

    let body = format!(
        concat!(
            "This is a test email from {label}.\n\n",
            "Connection details:\n",
            "SMTP host: {host}\n",
            "SMTP port: {port}\n",
            "TLS: {tls}\n",
            "Provider: {provider}\n",
            "Test mode only: {test_mode}\n\n",
            "If you received this message, the account is able to send email."
        ),
        label = account.display_label(),
        host = host,
        port = port,
        tls = tls,
        provider = account.provider,
        test_mode = if account.test_mode_only { "yes" } else { "no" },
    );

    SendRequest::builder()
        .to(recipient.trim())?
        .subject(format!("Test email from {}", account.display_label()))
        .text(body)
        .build()
}

/// Builder for [`DeliveryEngine`].
pub struct DeliveryEngineBuilder {
    config: DeliveryConfig,
    accounts: Option<Arc<dyn AccountStore>>,
    emails: Option<Arc<dyn EmailRecordStore>>,
    attempts: Option<Arc<dyn AttemptStore>>,
    tracking: Option<Arc<dyn TrackingInjector>>,
    secrets: Option<Arc<dyn SecretProvider>>,
    connector: Option<Arc<dyn TransportConnector>>,
    dns: Option<Arc<dyn TxtLookup>>,
    metrics: Option<Arc<DeliveryMetrics>>,
}

impl DeliveryEngineBuilder {
    fn new(config: DeliveryConfig) -> Self {
        Self {
            config,
            accounts: None,
            emails: None,
            attempts: None,
            tracking: None,
            secrets: None,
            connector: None,
            dns: None,
            metrics: None,
        }
    }

    /// Sets the account store.
    pub fn accounts(mut self, store: Arc<dyn AccountStore>) -> Self {
        self.accounts = Some(store);
        self
    }

    /// Sets the business record store. Defaults to in-memory.
    pub fn emails(mut self, store: Arc<dyn EmailRecordStore>) -> Self {
        self.emails = Some(store);
        self
    }

    /// Sets the attempt store. Defaults to in-memory.
    pub fn attempts(mut self, store: Arc<dyn AttemptStore>) -> Self {
        self.attempts = Some(store);
        self
    }

    /// Installs a tracking injector.
    pub fn tracking(mut self, injector: Arc<dyn TrackingInjector>) -> Self {
        self.tracking = Some(injector);
        self
    }

    /// Sets the secret provider. Defaults to process environment variables.
    pub fn secrets(mut self, provider: Arc<dyn SecretProvider>) -> Self {
        self.secrets = Some(provider);
        self
    }

    /// Sets the transport connector. Defaults to pooled SMTP.
    pub fn connector(mut self, connector: Arc<dyn TransportConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Sets the TXT lookup used by the probe. Defaults to the system resolver.
    pub fn dns(mut self, dns: Arc<dyn TxtLookup>) -> Self {
        self.dns = Some(dns);
        self
    }

    /// Shares an existing metrics instance.
    pub fn metrics(mut self, metrics: Arc<DeliveryMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Builds the engine.
    pub fn build(self) -> DeliveryResult<DeliveryEngine> {
        self.config.validate()?;

        let accounts = self
            .accounts
            .ok_or_else(|| DeliveryError::configuration("An account store is required"))?;
        let dns: Arc<dyn TxtLookup> = match self.dns {
            Some(dns) => dns,
            None => Arc::new(DnsTxtLookup::from_system_conf()?),
        };

        let config = Arc::new(self.config);
        let metrics = self.metrics.unwrap_or_default();
        let secrets = self.secrets.unwrap_or_else(|| Arc::new(EnvSecretProvider));
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(SmtpConnector::new(metrics.clone())));

        let policy = Arc::new(CredentialPolicy::new(SecretResolver::from_config(secrets, &config)));
        let factory = Arc::new(TransportFactory::new(connector, config.clone(), metrics.clone()));
        let probe = ValidationProbe::new(policy.clone(), factory.clone(), dns, config.connect_timeout);

        Ok(DeliveryEngine {
            inner: Arc::new(EngineInner {
                resolver: AccountResolver::new(accounts),
                hardener: ContentHardener::new(config.hardening.clone()),
                executor: DeliveryExecutor::new(config.send_timeout, metrics.clone()),
                audit: AttemptLogger::new(
                    self.attempts.unwrap_or_else(|| Arc::new(InMemoryAttemptStore::new())),
                    metrics.clone(),
                ),
                emails: self.emails.unwrap_or_else(|| Arc::new(InMemoryEmailStore::new())),
                tracking: self.tracking,
                scheduler: Scheduler::new(),
                simulated: Arc::new(SimulatedTransport::new(config.simulated_delay)),
                policy,
                factory,
                probe,
                metrics,
                config,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MockConnector, MockMailTransport, StaticTxtLookup};
    use crate::secrets::StaticSecretProvider;
    use crate::store::InMemoryAccountStore;
    use crate::types::{AccountStatus, MailEndpoint};
    use std::time::Duration;

    struct Harness {
        engine: DeliveryEngine,
        emails: Arc<InMemoryEmailStore>,
        attempts: Arc<InMemoryAttemptStore>,
        transport: MockMailTransport,
        connector: MockConnector,
    }

    fn harness(accounts: Vec<SenderAccount>) -> Harness {
        let store = InMemoryAccountStore::new();
        for account in accounts {
            store.upsert(account);
        }
        let emails = Arc::new(InMemoryEmailStore::new());
        let attempts = Arc::new(InMemoryAttemptStore::new());
        let transport = MockMailTransport::new();
        let connector = MockConnector::new(transport.clone());

        let config = DeliveryConfig::builder()
            .provider_secret("gmail", "GMAIL_APP_PASSWORD")
            .simulated_delay(Duration::from_millis(5))
            .build()
            .unwrap();

        let engine = DeliveryEngine::builder(config)
            .accounts(Arc::new(store))
            .emails(emails.clone())
            .attempts(attempts.clone())
            .secrets(Arc::new(StaticSecretProvider::new().with("GMAIL_APP_PASSWORD", "app")))
            .connector(Arc::new(connector.clone()))
            .dns(Arc::new(StaticTxtLookup::default()))
            .build()
            .unwrap();

        Harness {
            engine,
            emails,
            attempts,
            transport,
            connector,
        }
    }

    fn gmail_account() -> SenderAccount {
        SenderAccount::new(1, "sales@brand.example", "gmail")
            .with_display_name("Brand")
            .with_smtp(MailEndpoint::new("smtp.gmail.com", 587))
    }

    fn request() -> SendRequest {
        SendRequest::builder()
            .to("b@example.com")
            .unwrap()
            .subject("Hello")
            .text("A short note about our upcoming collaboration with your channel.")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_real_send_persists_record() {
        let h = harness(vec![gmail_account()]);

        let outcome = h.engine.send_email(SenderRef::Id(1), request()).await;

        assert!(outcome.success, "{:?}", outcome.error);
        assert!(!outcome.test_mode);
        assert_eq!(outcome.email_id, Some(1));
        assert_eq!(h.transport.sent().len(), 1);

        let record = h.emails.records().pop().unwrap();
        assert_eq!(record.status, EmailStatus::Sent);
        assert_eq!(record.message_id, outcome.message_id);
        assert!(record.sent_at.is_some());
        assert_eq!(h.attempts.attempts()[0].transport, TransportKind::Real);
    }

    #[tokio::test]
    async fn test_persistence_failure_still_succeeds() {
        let h = harness(vec![gmail_account()]);
        h.emails.fail_writes(true);

        let outcome = h.engine.send_email(SenderRef::Id(1), request()).await;

        assert!(outcome.success);
        assert_eq!(outcome.email_id, None);
        assert_eq!(h.attempts.attempts().len(), 1);
        assert_eq!(h.engine.metrics().snapshot().persistence_failures, 1);
    }

    #[tokio::test]
    async fn test_attempt_failure_keeps_record() {
        let h = harness(vec![gmail_account()]);
        h.attempts.fail_writes(true);

        let outcome = h.engine.send_email(SenderRef::Id(1), request()).await;

        assert!(outcome.success);
        assert_eq!(h.emails.records().len(), 1);
    }

    #[tokio::test]
    async fn test_inactive_account_rejected() {
        let h = harness(vec![gmail_account().with_status(AccountStatus::Suspended)]);

        let outcome = h.engine.send_email(SenderRef::Id(1), request()).await;

        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("suspended"));
        assert!(h.attempts.attempts().is_empty());
        assert_eq!(h.connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_sender() {
        let h = harness(vec![]);
        let outcome = h.engine.send_email("nobody@example.com", request()).await;
        assert!(!outcome.success);
        assert!(!outcome.test_mode);
        assert!(h.attempts.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_records_failed() {
        let h = harness(vec![gmail_account()]);
        h.transport.fail_next(DeliveryError::from_smtp_response(550, "no such user"));

        let outcome = h.engine.send_email(SenderRef::Id(1), request()).await;

        assert!(!outcome.success);
        assert!(!outcome.test_mode);
        assert_eq!(h.emails.records()[0].status, EmailStatus::Failed);
        assert!(!h.attempts.attempts()[0].success);
    }

    #[tokio::test]
    async fn test_send_test_email_body() {
        let h = harness(vec![gmail_account()]);

        let outcome = h.engine.send_test_email(SenderRef::Id(1), "ops@example.com").await;

        assert!(outcome.success);
        let sent = h.transport.sent();
        let message = &sent[0];
        assert_eq!(message.subject, "Test email from Brand");
        let text = message.text.as_deref().unwrap();
        assert!(text.contains("SMTP host: smtp.gmail.com"));
        assert!(text.contains("SMTP port: 587"));
        assert!(text.contains("Provider: gmail"));
        assert!(text.contains("Test mode only: no"));
    }

    #[tokio::test]
    async fn test_send_test_email_rejects_bad_recipient() {
        let h = harness(vec![gmail_account()]);
        let outcome = h.engine.send_test_email(SenderRef::Id(1), "not an address").await;
        assert!(!outcome.success);
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_builder_requires_accounts() {
        let err = DeliveryEngine::builder(DeliveryConfig::default())
            .dns(Arc::new(StaticTxtLookup::default()))
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), DeliveryErrorKind::ConfigurationMissing);
    }
}

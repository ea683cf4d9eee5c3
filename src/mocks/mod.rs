//! Test doubles for the delivery engine.
//!
//! - [`MockTransport`]: a scripted SMTP connection
//! - [`MockMailTransport`] / [`MockConnector`]: a recording transport and the
//!   connector that hands it to the factory
//! - [`StaticTxtLookup`]: fixed DNS answers
//! - [`RecordingTracker`]: a tracking injector that remembers its calls

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::SmtpConfig;
use crate::errors::{DeliveryError, DeliveryErrorKind, DeliveryResult};
use crate::factory::TransportConnector;
use crate::probe::TxtLookup;
use crate::protocol::{codes, EsmtpCapabilities, SmtpCommand, SmtpResponse, TransactionState};
use crate::store::TrackingInjector;
use crate::transport::{MailTransport, SmtpTransport, TlsClient};
use crate::types::{OutboundMessage, TrackingHandle, TransportKind, TransportReceipt};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Rebuildable error description, since [`DeliveryError`] is not `Clone`.
#[derive(Debug, Clone)]
struct ScriptedError {
    kind: DeliveryErrorKind,
    message: String,
    smtp_code: Option<u16>,
}

impl ScriptedError {
    fn of(error: &DeliveryError) -> Self {
        Self {
            kind: error.kind(),
            message: error.message().to_string(),
            smtp_code: error.smtp_code(),
        }
    }

    fn build(&self) -> DeliveryError {
        let error = DeliveryError::new(self.kind, self.message.clone());
        match self.smtp_code {
            Some(code) => error.with_smtp_code(code),
            None => error,
        }
    }
}

/// Scripted SMTP connection.
///
/// Replies are served from a queue; an empty queue answers `250 OK`.
#[derive(Debug)]
pub struct MockTransport {
    commands: Arc<Mutex<Vec<SmtpCommand>>>,
    responses: Arc<Mutex<VecDeque<SmtpResponse>>>,
    data_received: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_next: Arc<Mutex<Option<DeliveryError>>>,
    state: TransactionState,
    capabilities: Option<EsmtpCapabilities>,
    tls_enabled: bool,
    messages_sent: usize,
}

impl MockTransport {
    /// Creates a connected mock with default capabilities.
    pub fn new() -> Self {
        Self {
            commands: Arc::new(Mutex::new(Vec::new())),
            responses: Arc::new(Mutex::new(VecDeque::new())),
            data_received: Arc::new(Mutex::new(Vec::new())),
            fail_next: Arc::new(Mutex::new(None)),
            state: TransactionState::Connected,
            capabilities: Some(Self::default_capabilities()),
            tls_enabled: false,
            messages_sent: 0,
        }
    }

    /// Capabilities of a typical submission server.
    pub fn default_capabilities() -> EsmtpCapabilities {
        EsmtpCapabilities::from_ehlo(&fixtures::ehlo_response())
    }

    /// Queues a reply.
    pub fn queue_response(&self, response: SmtpResponse) -> &Self {
        lock(&self.responses).push_back(response);
        self
    }

    /// Queues `250 OK`.
    pub fn queue_ok(&self) -> &Self {
        self.queue_response(SmtpResponse::new(codes::OK, "OK"))
    }

    /// Queues an error reply.
    pub fn queue_error(&self, code: u16, message: &str) -> &Self {
        self.queue_response(SmtpResponse::new(code, message))
    }

    /// Makes the next I/O call fail with `error`.
    pub fn fail_next_with(&self, error: DeliveryError) -> &Self {
        *lock(&self.fail_next) = Some(error);
        self
    }

    /// Sets the TLS flag.
    pub fn set_tls_enabled(&mut self, enabled: bool) {
        self.tls_enabled = enabled;
    }

    /// Returns every command sent so far.
    pub fn recorded_commands(&self) -> Vec<SmtpCommand> {
        lock(&self.commands).clone()
    }

    /// Returns every DATA payload written so far.
    pub fn received_data(&self) -> Vec<Vec<u8>> {
        lock(&self.data_received).clone()
    }

    /// Forgets recorded traffic and scripted replies.
    pub fn clear(&self) {
        lock(&self.commands).clear();
        lock(&self.responses).clear();
        lock(&self.data_received).clear();
        *lock(&self.fail_next) = None;
    }

    fn take_failure(&self) -> DeliveryResult<()> {
        match lock(&self.fail_next).take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn next_response(&self) -> SmtpResponse {
        lock(&self.responses)
            .pop_front()
            .unwrap_or_else(|| SmtpResponse::new(codes::OK, "OK"))
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SmtpTransport for MockTransport {
    async fn send_command(&mut self, command: &SmtpCommand) -> DeliveryResult<SmtpResponse> {
        self.take_failure()?;
        lock(&self.commands).push(command.clone());
        Ok(self.next_response())
    }

    async fn send_data(&mut self, data: &[u8]) -> DeliveryResult<()> {
        self.take_failure()?;
        lock(&self.data_received).push(data.to_vec());
        Ok(())
    }

    async fn read_response(&mut self) -> DeliveryResult<SmtpResponse> {
        self.take_failure()?;
        Ok(self.next_response())
    }

    async fn upgrade_tls(&mut self, _tls: &TlsClient) -> DeliveryResult<()> {
        self.take_failure()?;
        self.tls_enabled = true;
        Ok(())
    }

    fn is_tls(&self) -> bool {
        self.tls_enabled
    }

    async fn close(&mut self) -> DeliveryResult<()> {
        self.state = TransactionState::Closed;
        Ok(())
    }

    fn state(&self) -> TransactionState {
        self.state
    }

    fn set_state(&mut self, state: TransactionState) {
        self.state = state;
    }

    fn capabilities(&self) -> Option<&EsmtpCapabilities> {
        self.capabilities.as_ref()
    }

    fn set_capabilities(&mut self, caps: EsmtpCapabilities) {
        self.capabilities = Some(caps);
    }

    fn messages_sent(&self) -> usize {
        self.messages_sent
    }

    fn record_message_sent(&mut self) {
        self.messages_sent += 1;
    }
}

#[derive(Debug, Default)]
struct MailState {
    sent: Mutex<Vec<OutboundMessage>>,
    failures: Mutex<VecDeque<DeliveryError>>,
    verify_error: Mutex<Option<ScriptedError>>,
    verify_calls: AtomicUsize,
    cancelled: AtomicUsize,
}

/// Recording [`MailTransport`] that reports itself as real.
///
/// Clones share recorded state, so a test can keep one handle while the
/// engine owns another.
#[derive(Debug, Clone, Default)]
pub struct MockMailTransport {
    state: Arc<MailState>,
    delay: Duration,
}

impl MockMailTransport {
    /// Creates a transport that accepts everything immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every send.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Makes every `verify` call fail like `error`.
    pub fn with_verify_error(self, error: DeliveryError) -> Self {
        *lock(&self.state.verify_error) = Some(ScriptedError::of(&error));
        self
    }

    /// Makes the next send fail with `error`.
    pub fn fail_next(&self, error: DeliveryError) {
        lock(&self.state.failures).push_back(error);
    }

    /// Returns every message accepted so far.
    pub fn sent(&self) -> Vec<OutboundMessage> {
        lock(&self.state.sent).clone()
    }

    /// Returns how often `verify` ran.
    pub fn verify_count(&self) -> usize {
        self.state.verify_calls.load(Ordering::SeqCst)
    }

    /// Returns how many sends observed cancellation.
    pub fn cancelled_count(&self) -> usize {
        self.state.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailTransport for MockMailTransport {
    async fn send(&self, message: &OutboundMessage, cancel: CancellationToken) -> DeliveryResult<TransportReceipt> {
        if !self.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.state.cancelled.fetch_add(1, Ordering::SeqCst);
                    return Err(DeliveryError::new(DeliveryErrorKind::Cancelled, "Send cancelled"));
                }
                _ = tokio::time::sleep(self.delay) => {}
            }
        }

        if let Some(error) = lock(&self.state.failures).pop_front() {
            return Err(error);
        }

        lock(&self.state.sent).push(message.clone());
        Ok(TransportReceipt {
            message_id: message.message_id_header(),
            response: "250 2.0.0 OK queued".to_string(),
            accepted: message.all_recipients().cloned().collect(),
            rejected: Vec::new(),
            duration: self.delay,
            kind: TransportKind::Real,
        })
    }

    async fn verify(&self) -> DeliveryResult<()> {
        self.state.verify_calls.fetch_add(1, Ordering::SeqCst);
        match lock(&self.state.verify_error).as_ref() {
            Some(error) => Err(error.build()),
            None => Ok(()),
        }
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Real
    }
}

/// [`TransportConnector`] handing out a shared [`MockMailTransport`].
#[derive(Debug, Clone)]
pub struct MockConnector {
    transport: MockMailTransport,
    failure: Option<ScriptedError>,
    configs: Arc<Mutex<Vec<SmtpConfig>>>,
}

impl MockConnector {
    /// Creates a connector returning `transport`.
    pub fn new(transport: MockMailTransport) -> Self {
        Self {
            transport,
            failure: None,
            configs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Creates a connector whose every call fails like `error`.
    pub fn failing(error: DeliveryError) -> Self {
        Self {
            failure: Some(ScriptedError::of(&error)),
            ..Self::new(MockMailTransport::new())
        }
    }

    /// Returns the transport handed out.
    pub fn transport(&self) -> &MockMailTransport {
        &self.transport
    }

    /// Returns how many transports were requested.
    pub fn connect_count(&self) -> usize {
        lock(&self.configs).len()
    }

    /// Returns the configurations transports were requested with.
    pub fn configs(&self) -> Vec<SmtpConfig> {
        lock(&self.configs).clone()
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn connect(&self, config: SmtpConfig) -> DeliveryResult<Arc<dyn MailTransport>> {
        lock(&self.configs).push(config);
        match &self.failure {
            Some(error) => Err(error.build()),
            None => Ok(Arc::new(self.transport.clone())),
        }
    }
}

/// [`TxtLookup`] with fixed answers. Unknown domains have no records.
#[derive(Debug, Clone, Default)]
pub struct StaticTxtLookup {
    records: HashMap<String, Vec<String>>,
}

impl StaticTxtLookup {
    /// Creates an empty lookup.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a TXT record for `domain`.
    pub fn with(mut self, domain: impl Into<String>, record: impl Into<String>) -> Self {
        self.records.entry(domain.into()).or_default().push(record.into());
        self
    }
}

#[async_trait]
impl TxtLookup for StaticTxtLookup {
    async fn txt_records(&self, domain: &str) -> DeliveryResult<Vec<String>> {
        Ok(self.records.get(domain).cloned().unwrap_or_default())
    }
}

/// [`TrackingInjector`] that records each call.
#[derive(Debug, Clone, Default)]
pub struct RecordingTracker {
    calls: Arc<Mutex<Vec<(i64, String)>>>,
    fail: bool,
}

impl RecordingTracker {
    /// Creates a tracker that succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a tracker whose every call fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Returns `(email_id, message_id)` for every call.
    pub fn calls(&self) -> Vec<(i64, String)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl TrackingInjector for RecordingTracker {
    async fn inject(&self, email_id: i64, message_id: &str) -> DeliveryResult<TrackingHandle> {
        lock(&self.calls).push((email_id, message_id.to_string()));
        if self.fail {
            return Err(DeliveryError::persistence("Tracking store unavailable"));
        }
        Ok(TrackingHandle(format!("trk-{}", email_id)))
    }
}

/// Canned replies and records.
pub mod fixtures {
    use crate::protocol::{codes, SmtpResponse};
    use crate::types::{MailEndpoint, SendRequest, SenderAccount};

    /// EHLO reply advertising STARTTLS and AUTH PLAIN LOGIN.
    pub fn ehlo_response() -> SmtpResponse {
        SmtpResponse::multiline(
            codes::OK,
            vec![
                "smtp.example.com Hello".to_string(),
                "SIZE 10485760".to_string(),
                "AUTH PLAIN LOGIN".to_string(),
                "STARTTLS".to_string(),
                "8BITMIME".to_string(),
                "PIPELINING".to_string(),
                "ENHANCEDSTATUSCODES".to_string(),
            ],
        )
    }

    /// Service-ready greeting.
    pub fn greeting_response() -> SmtpResponse {
        SmtpResponse::new(codes::SERVICE_READY, "smtp.example.com ESMTP ready")
    }

    /// AUTH accepted.
    pub fn auth_success_response() -> SmtpResponse {
        SmtpResponse::new(codes::AUTH_SUCCESS, "2.7.0 Authentication successful")
    }

    /// DATA go-ahead.
    pub fn data_ready_response() -> SmtpResponse {
        SmtpResponse::new(codes::START_MAIL_INPUT, "Start mail input")
    }

    /// AUTH continuation carrying `challenge`.
    pub fn auth_continue_response(challenge: &str) -> SmtpResponse {
        SmtpResponse::new(codes::AUTH_CONTINUE, challenge)
    }

    /// Active account with a configured SMTP endpoint and stored password.
    pub fn sender_account(id: i64, email: &str, provider: &str) -> SenderAccount {
        SenderAccount::new(id, email, provider)
            .with_display_name("Outreach Team")
            .with_smtp(MailEndpoint::new("smtp.example.com", 587).credentials(email, "stored-password"))
    }

    /// Plain request to `to` with enough copy to count as substantive.
    pub fn send_request(to: &str) -> SendRequest {
        let builder = match SendRequest::builder().to(to) {
            Ok(builder) => builder,
            Err(e) => panic!("invalid fixture recipient {}: {}", to, e),
        };
        match builder
            .subject("Partnership idea")
            .text("Hi there,\n\nWe enjoyed your latest episode and would like to talk about a partnership.")
            .build()
        {
            Ok(request) => request,
            Err(e) => panic!("invalid fixture request: {}", e),
        }
    }
}

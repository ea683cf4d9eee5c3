//! # Mail Delivery Engine
//!
//! Outbound email delivery for sender accounts stored by the host
//! application:
//! - Credential policy deciding between a real SMTP transport and a
//!   simulated one, with exempt senders and provider-wide secrets
//! - Pooled SMTP transport (STARTTLS, implicit TLS, PLAIN/LOGIN/CRAM-MD5)
//! - Deliverability hardening (unsubscribe headers, compliance footer,
//!   content scoring)
//! - Timeout-bounded dispatch with an append-only attempt log
//! - In-process scheduling of deferred sends
//! - Account validation probes (reachability, SPF, credentials, health)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use integrations_mail_delivery::{
//!     DeliveryConfig, DeliveryEngine, InMemoryAccountStore, MailEndpoint, SendRequest, SenderAccount,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let accounts = Arc::new(InMemoryAccountStore::new());
//!     accounts.upsert(
//!         SenderAccount::new(1, "outreach@example.com", "gmail")
//!             .with_smtp(MailEndpoint::new("smtp.gmail.com", 587).credentials("outreach@example.com", "app-password")),
//!     );
//!
//!     let engine = DeliveryEngine::builder(DeliveryConfig::default())
//!         .accounts(accounts)
//!         .build()?;
//!
//!     let request = SendRequest::builder()
//!         .to("host@podcast.example")?
//!         .subject("Guest idea for your show")
//!         .text("Hi, we would love to join an upcoming episode to talk about open source funding.")
//!         .build()?;
//!
//!     let outcome = engine.send_email("outreach@example.com", request).await;
//!     println!("sent={} test_mode={} id={:?}", outcome.success, outcome.test_mode, outcome.message_id);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;
pub mod types;

// Persistence seams
pub mod store;
pub mod secrets;

// Protocol layer
pub mod protocol;

// Transport layer
pub mod transport;
pub mod factory;

// Authentication
pub mod auth;

// MIME encoding
pub mod mime;

// Resilience
pub mod resilience;

// Observability
pub mod observability;

// Delivery pipeline
pub mod resolver;
pub mod policy;
pub mod hardening;
pub mod executor;
pub mod audit;
pub mod scheduler;
pub mod probe;
pub mod engine;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use config::{
    ContentPolicy, DeliveryConfig, DeliveryConfigBuilder, HardeningConfig, PoolConfig, RateLimitConfig,
    SmtpConfig, SmtpConfigBuilder, TlsConfig, TlsMode, TlsVersion,
};
pub use engine::{DeliveryEngine, DeliveryEngineBuilder};
pub use errors::{DeliveryError, DeliveryErrorKind, DeliveryResult};
pub use factory::{SelectedTransport, SmtpConnector, TransportConnector, TransportFactory};
pub use observability::{DeliveryMetrics, MetricsSnapshot};
pub use policy::{CredentialPolicy, SimulationReason, TransportPlan};
pub use probe::{DnsTxtLookup, TxtLookup};
pub use scheduler::{ScheduledSendTicket, Scheduler, TicketState};
pub use secrets::{EnvSecretProvider, SecretProvider, StaticSecretProvider};
pub use store::{
    AccountStore, AttemptStore, EmailRecordStore, InMemoryAccountStore, InMemoryAttemptStore, InMemoryEmailStore,
    TrackingInjector,
};
pub use transport::{MailTransport, PooledTransport, SimulatedTransport};
pub use types::{
    AccountStatus, Address, Association, Attachment, DeliveryAttemptRecord, EmailRecord, EmailStatus,
    HealthMetrics, MailEndpoint, OutboundMessage, ScheduleOutcome, SendOutcome, SendRequest, SenderAccount,
    SenderRef, TransportKind, TransportReceipt, ValidationReport,
};

//! Metrics and tracing helpers for delivery.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::types::{Association, TransportKind};

/// Delivery counters shared by the engine and its transports.
#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    /// Messages handed to a real transport successfully.
    pub real_sends: AtomicU64,
    /// Messages accepted by the simulated transport.
    pub simulated_sends: AtomicU64,
    /// Failed sends of either kind.
    pub failures: AtomicU64,
    /// Sends cut off by the send timeout.
    pub timeouts: AtomicU64,
    /// Real transports replaced by simulation.
    pub fallbacks: AtomicU64,
    /// Connections opened.
    pub connections: AtomicU64,
    /// Connections that failed to open.
    pub connection_failures: AtomicU64,
    /// AUTH exchanges started.
    pub auth_attempts: AtomicU64,
    /// AUTH exchanges rejected.
    pub auth_failures: AtomicU64,
    /// STARTTLS or implicit TLS handshakes.
    pub tls_upgrades: AtomicU64,
    /// Business record writes that failed.
    pub persistence_failures: AtomicU64,
}

impl DeliveryMetrics {
    /// Creates a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful send through the given transport.
    pub fn record_sent(&self, kind: TransportKind) {
        match kind {
            TransportKind::Real => self.real_sends.fetch_add(1, Ordering::Relaxed),
            TransportKind::Simulated => self.simulated_sends.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Records a failed send.
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a send timeout.
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a fallback to simulation.
    pub fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a connection attempt.
    pub fn record_connection(&self, success: bool) {
        if success {
            self.connections.fetch_add(1, Ordering::Relaxed);
        } else {
            self.connection_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records an authentication attempt.
    pub fn record_auth(&self, success: bool) {
        self.auth_attempts.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.auth_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a TLS handshake.
    pub fn record_tls_upgrade(&self) {
        self.tls_upgrades.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a swallowed persistence failure.
    pub fn record_persistence_failure(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            real_sends: self.real_sends.load(Ordering::Relaxed),
            simulated_sends: self.simulated_sends.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            auth_attempts: self.auth_attempts.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            tls_upgrades: self.tls_upgrades.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DeliveryMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Real sends.
    pub real_sends: u64,
    /// Simulated sends.
    pub simulated_sends: u64,
    /// Failed sends.
    pub failures: u64,
    /// Timed-out sends.
    pub timeouts: u64,
    /// Fallbacks to simulation.
    pub fallbacks: u64,
    /// Connections opened.
    pub connections: u64,
    /// Connection failures.
    pub connection_failures: u64,
    /// AUTH attempts.
    pub auth_attempts: u64,
    /// AUTH failures.
    pub auth_failures: u64,
    /// TLS handshakes.
    pub tls_upgrades: u64,
    /// Persistence failures.
    pub persistence_failures: u64,
}

impl MetricsSnapshot {
    /// Returns the share of sends that succeeded.
    pub fn success_rate(&self) -> f64 {
        let ok = self.real_sends + self.simulated_sends;
        let total = ok + self.failures;
        if total == 0 {
            1.0
        } else {
            ok as f64 / total as f64
        }
    }
}

/// Timer for measuring operation duration.
///
/// Uses the tokio clock so paused-time tests see deterministic values.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    name: &'static str,
}

impl Timer {
    /// Creates and starts a new timer.
    pub fn start(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    /// Returns the elapsed time.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Returns the elapsed time in whole milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Stops the timer and returns the duration.
    pub fn stop(self) -> Duration {
        let elapsed = self.start.elapsed();
        tracing::trace!(timer = self.name, duration_ms = elapsed.as_millis() as u64, "Timer stopped");
        elapsed
    }
}

/// Per-send context carried into tracing spans and attempt records.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    /// Unique id for correlating log lines of one send.
    pub request_id: String,
    /// Sending account.
    pub account_id: i64,
    /// Sender address.
    pub from: String,
    /// Recipient count.
    pub recipient_count: usize,
    /// Campaign association.
    pub association: Option<Association>,
}

impl DeliveryContext {
    /// Creates a new context.
    pub fn new(account_id: i64, from: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            account_id,
            from: from.into(),
            recipient_count: 0,
            association: None,
        }
    }

    /// Sets the recipient count.
    pub fn with_recipients(mut self, count: usize) -> Self {
        self.recipient_count = count;
        self
    }

    /// Sets the association.
    pub fn with_association(mut self, association: Option<Association>) -> Self {
        self.association = association;
        self
    }

    /// Creates the tracing span for this send.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "delivery",
            request_id = %self.request_id,
            account_id = self.account_id,
            campaign_id = self.association.and_then(|a| a.campaign_id),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics() {
        let metrics = DeliveryMetrics::new();

        metrics.record_sent(TransportKind::Real);
        metrics.record_sent(TransportKind::Simulated);
        metrics.record_failure();
        metrics.record_auth(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.real_sends, 1);
        assert_eq!(snapshot.simulated_sends, 1);
        assert_eq!(snapshot.auth_attempts, 1);
        assert_eq!(snapshot.auth_failures, 1);
        assert!((snapshot.success_rate() - 0.666).abs() < 0.01);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer() {
        let timer = Timer::start("test");
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(timer.elapsed_ms(), 25);
        assert!(timer.stop() >= Duration::from_millis(25));
    }

    #[test]
    fn test_context() {
        let ctx = DeliveryContext::new(7, "a@example.com")
            .with_recipients(2)
            .with_association(Some(Association::campaign(1, 2)));
        assert_eq!(ctx.recipient_count, 2);
        assert_eq!(ctx.request_id.len(), 36);
    }
}

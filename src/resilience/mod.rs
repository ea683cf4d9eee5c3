//! Provider throttling protection.
//!
//! Mail providers penalize bursts from one account, so every real transport
//! owns a fixed-window limiter sized from [`RateLimitConfig`].

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::config::{OnLimitBehavior, RateLimitConfig};
use crate::errors::{DeliveryError, DeliveryErrorKind, DeliveryResult};

#[derive(Debug)]
struct Window {
    started: Instant,
    used: u32,
}

/// Fixed-window rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    window: Mutex<Window>,
}

impl RateLimiter {
    /// Creates a new rate limiter.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            window: Mutex::new(Window {
                started: Instant::now(),
                used: 0,
            }),
        }
    }

    /// Takes a slot if one is free, otherwise returns the time until the
    /// window reopens.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let Some(max) = self.config.max_emails.filter(|_| self.config.enabled) else {
            return Ok(());
        };

        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.duration_since(window.started);

        if elapsed >= self.config.window {
            window.started = now;
            window.used = 0;
        }

        if window.used < max {
            window.used += 1;
            Ok(())
        } else {
            Err(self.config.window.saturating_sub(now.duration_since(window.started)))
        }
    }

    /// Acquires permission to send, waiting or rejecting per configuration.
    pub async fn acquire(&self) -> DeliveryResult<()> {
        loop {
            match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(wait) => match self.config.on_limit {
                    OnLimitBehavior::Reject => {
                        return Err(DeliveryError::new(
                            DeliveryErrorKind::RateLimited,
                            "Rate limit exceeded",
                        ));
                    }
                    OnLimitBehavior::Wait => {
                        tracing::debug!(wait_ms = wait.as_millis() as u64, "Rate limited, waiting");
                        sleep(wait.max(Duration::from_millis(1))).await;
                    }
                },
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

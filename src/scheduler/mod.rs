//! In-process scheduler for deferred sends.
//!
//! Each ticket owns one timer task. Tickets live only in memory: a process
//! exit before the fire time loses them. Armed tickets cannot be cancelled.
//! A fired ticket leaves the armed set and only its outcome is kept, in a
//! bounded history.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::types::{SendOutcome, SendRequest, SenderRef};

/// Ticket lifecycle: `Scheduled` then exactly one of `Sent` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketState {
    /// Timer armed.
    Scheduled,
    /// The pipeline reported success.
    Sent,
    /// The pipeline reported failure.
    Failed,
}

impl TicketState {
    /// Returns true for `Sent` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TicketState::Scheduled)
    }
}

impl fmt::Display for TicketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TicketState::Scheduled => write!(f, "scheduled"),
            TicketState::Sent => write!(f, "sent"),
            TicketState::Failed => write!(f, "failed"),
        }
    }
}

/// A deferred send.
#[derive(Debug, Clone)]
pub struct ScheduledSendTicket {
    /// Ticket id.
    pub id: String,
    /// Sender as the caller referenced it.
    pub sender: SenderRef,
    /// Resolved account id.
    pub account_id: i64,
    /// The request to send.
    pub request: SendRequest,
    /// Target fire time.
    pub fire_at: DateTime<Utc>,
    /// Business record created at scheduling time.
    pub email_id: Option<i64>,
    /// Time the ticket was armed.
    pub created_at: DateTime<Utc>,
}

impl ScheduledSendTicket {
    /// Creates a ticket in the `Scheduled` state.
    pub fn new(sender: SenderRef, account_id: i64, request: SendRequest, fire_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender,
            account_id,
            request,
            fire_at,
            email_id: None,
            created_at: Utc::now(),
        }
    }

    /// Links the business record.
    pub fn with_email_id(mut self, email_id: Option<i64>) -> Self {
        self.email_id = email_id;
        self
    }
}

/// Outcomes kept for fired tickets.
pub const DEFAULT_HISTORY_LIMIT: usize = 256;

/// What remains of a ticket after it fired. The request is not retained.
#[derive(Debug, Clone)]
pub struct FiredTicket {
    /// Ticket id.
    pub id: String,
    /// Resolved account id.
    pub account_id: i64,
    /// Business record created at scheduling time.
    pub email_id: Option<i64>,
    /// Target fire time.
    pub fire_at: DateTime<Utc>,
    /// `Sent` or `Failed`.
    pub state: TicketState,
    /// Pipeline result.
    pub outcome: SendOutcome,
}

#[derive(Debug)]
struct SchedulerState {
    armed: HashMap<String, ScheduledSendTicket>,
    fired: VecDeque<FiredTicket>,
    history_limit: usize,
}

impl SchedulerState {
    fn finish(&mut self, id: &str, state: TicketState, outcome: SendOutcome) {
        if !state.is_terminal() {
            return;
        }
        let Some(ticket) = self.armed.remove(id) else { return };
        if self.history_limit == 0 {
            return;
        }
        while self.fired.len() >= self.history_limit {
            self.fired.pop_front();
        }
        self.fired.push_back(FiredTicket {
            id: ticket.id,
            account_id: ticket.account_id,
            email_id: ticket.email_id,
            fire_at: ticket.fire_at,
            state,
            outcome,
        });
    }
}

/// Returns true if `fire_at` is absent or not in the future.
pub fn is_due(fire_at: Option<DateTime<Utc>>) -> bool {
    fire_at.map_or(true, |at| at <= Utc::now())
}

/// Owns armed tickets and their timers.
#[derive(Debug, Clone)]
pub struct Scheduler {
    state: Arc<RwLock<SchedulerState>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }
}

impl Scheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a scheduler keeping at most `limit` fired outcomes.
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(SchedulerState {
                armed: HashMap::new(),
                fired: VecDeque::with_capacity(limit.min(DEFAULT_HISTORY_LIMIT)),
                history_limit: limit,
            })),
        }
    }

    /// Arms a timer for `ticket`. When it fires, `job` runs and its outcome
    /// moves the ticket to `Sent` or `Failed`. Returns the ticket id.
    pub fn arm<F, Fut>(&self, ticket: ScheduledSendTicket, job: F) -> String
    where
        F: FnOnce(ScheduledSendTicket) -> Fut + Send + 'static,
        Fut: Future<Output = SendOutcome> + Send + 'static,
    {
        let id = ticket.id.clone();
        let delay = (ticket.fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tracing::info!(
            ticket_id = %id,
            account_id = ticket.account_id,
            fire_at = %ticket.fire_at,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Scheduled send armed"
        );

        self.write().armed.insert(id.clone(), ticket.clone());

        let shared = self.state.clone();
        let ticket_id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let outcome = job(ticket).await;

            let state = if outcome.success {
                TicketState::Sent
            } else {
                TicketState::Failed
            };
            tracing::info!(ticket_id = %ticket_id, state = %state, test_mode = outcome.test_mode, "Scheduled send fired");

            shared
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .finish(&ticket_id, state, outcome);
        });

        id
    }

    /// Returns an armed ticket by id.
    pub fn ticket(&self, id: &str) -> Option<ScheduledSendTicket> {
        self.read().armed.get(id).cloned()
    }

    /// Returns armed tickets, oldest fire time first.
    pub fn tickets(&self) -> Vec<ScheduledSendTicket> {
        let mut tickets: Vec<_> = self.read().armed.values().cloned().collect();
        tickets.sort_by_key(|t| t.fire_at);
        tickets
    }

    /// Returns the number of tickets still waiting to fire.
    pub fn pending(&self) -> usize {
        self.read().armed.len()
    }

    /// Returns the state of a ticket that is armed or still in history.
    pub fn state(&self, id: &str) -> Option<TicketState> {
        let state = self.read();
        if state.armed.contains_key(id) {
            return Some(TicketState::Scheduled);
        }
        state.fired.iter().find(|t| t.id == id).map(|t| t.state)
    }

    /// Returns the outcome of a fired ticket still in history.
    pub fn fired(&self, id: &str) -> Option<FiredTicket> {
        self.read().fired.iter().find(|t| t.id == id).cloned()
    }

    /// Returns fired tickets, oldest first.
    pub fn history(&self) -> Vec<FiredTicket> {
        self.read().fired.iter().cloned().collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SchedulerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SchedulerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

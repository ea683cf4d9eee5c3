//! Persistence collaborator contracts.
//!
//! The engine never owns storage. Account lookup, business email records,
//! attempt audit entries and tracking all sit behind these traits; the
//! in-memory implementations back tests and single-process deployments.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use crate::errors::{DeliveryError, DeliveryResult};
use crate::types::{DeliveryAttemptRecord, EmailRecord, SenderAccount, TrackingHandle};

/// Account lookup.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Finds an account by id.
    async fn find_by_id(&self, id: i64) -> DeliveryResult<Option<SenderAccount>>;

    /// Finds an account by address, case-insensitively.
    async fn find_by_email(&self, email: &str) -> DeliveryResult<Option<SenderAccount>>;

    /// Finds the primary account linked to an owning entity.
    async fn find_primary_for_owner(&self, owner_id: i64) -> DeliveryResult<Option<SenderAccount>>;

    /// Finds an owning entity's id by its address.
    async fn find_owner_by_email(&self, email: &str) -> DeliveryResult<Option<i64>>;
}

/// Business "Email" records.
#[async_trait]
pub trait EmailRecordStore: Send + Sync {
    /// Stores a new record and returns it with its assigned id.
    async fn create(&self, record: EmailRecord) -> DeliveryResult<EmailRecord>;

    /// Replaces an existing record.
    async fn update(&self, record: &EmailRecord) -> DeliveryResult<()>;

    /// Loads a record.
    async fn get(&self, id: i64) -> DeliveryResult<Option<EmailRecord>>;
}

/// Append-only attempt log.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Appends one attempt.
    async fn append(&self, record: DeliveryAttemptRecord) -> DeliveryResult<()>;
}

/// Open/click instrumentation hook.
#[async_trait]
pub trait TrackingInjector: Send + Sync {
    /// Correlates a sent email with a tracking identifier.
    async fn inject(&self, email_id: i64, message_id: &str) -> DeliveryResult<TrackingHandle>;
}

/// In-memory [`AccountStore`].
#[derive(Debug, Default)]
pub struct InMemoryAccountStore {
    accounts: RwLock<Vec<SenderAccount>>,
    owners: RwLock<Vec<(i64, String)>>,
}

impl InMemoryAccountStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an account.
    pub fn upsert(&self, account: SenderAccount) {
        let mut accounts = self.accounts.write().unwrap_or_else(PoisonError::into_inner);
        accounts.retain(|a| a.id != account.id);
        accounts.push(account);
    }

    /// Registers an owning entity's address.
    pub fn add_owner(&self, owner_id: i64, email: impl Into<String>) {
        self.owners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((owner_id, email.into()));
    }

    fn find(&self, pred: impl Fn(&SenderAccount) -> bool) -> Option<SenderAccount> {
        self.accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|a| pred(a))
            .cloned()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn find_by_id(&self, id: i64) -> DeliveryResult<Option<SenderAccount>> {
        Ok(self.find(|a| a.id == id))
    }

    async fn find_by_email(&self, email: &str) -> DeliveryResult<Option<SenderAccount>> {
        Ok(self.find(|a| a.email.eq_ignore_ascii_case(email)))
    }

    async fn find_primary_for_owner(&self, owner_id: i64) -> DeliveryResult<Option<SenderAccount>> {
        Ok(self.find(|a| a.owner_id == Some(owner_id) && a.is_primary))
    }

    async fn find_owner_by_email(&self, email: &str) -> DeliveryResult<Option<i64>> {
        Ok(self
            .owners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(_, e)| e.eq_ignore_ascii_case(email))
            .map(|(id, _)| *id))
    }
}

/// In-memory [`EmailRecordStore`].
#[derive(Debug)]
pub struct InMemoryEmailStore {
    records: Mutex<Vec<EmailRecord>>,
    next_id: AtomicI64,
    fail_writes: AtomicBool,
}

impl Default for InMemoryEmailStore {
    fn default() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
            fail_writes: AtomicBool::new(false),
        }
    }
}

impl InMemoryEmailStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail, simulating an unavailable database.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Returns a copy of all records.
    pub fn records(&self) -> Vec<EmailRecord> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn check_writable(&self) -> DeliveryResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(DeliveryError::persistence("Email store unavailable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl EmailRecordStore for InMemoryEmailStore {
    async fn create(&self, mut record: EmailRecord) -> DeliveryResult<EmailRecord> {
        self.check_writable()?;
        record.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(record)
    }

    async fn update(&self, record: &EmailRecord) -> DeliveryResult<()> {
        self.check_writable()?;
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let existing = records
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or_else(|| DeliveryError::persistence(format!("Email record {} not found", record.id)))?;

        *existing = EmailRecord {
            updated_at: Utc::now(),
            ..record.clone()
        };
        Ok(())
    }

    async fn get(&self, id: i64) -> DeliveryResult<Option<EmailRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }
}

/// In-memory [`AttemptStore`].
#[derive(Debug, Default)]
pub struct InMemoryAttemptStore {
    attempts: Mutex<Vec<DeliveryAttemptRecord>>,
    fail_writes: AtomicBool,
}

impl InMemoryAttemptStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent append fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Returns a copy of all attempts in append order.
    pub fn attempts(&self) -> Vec<DeliveryAttemptRecord> {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl AttemptStore for InMemoryAttemptStore {
    async fn append(&self, record: DeliveryAttemptRecord) -> DeliveryResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DeliveryError::persistence("Attempt store unavailable"));
        }
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EmailStatus, MailEndpoint, TransportKind};

    fn record() -> EmailRecord {
        let now = Utc::now();
        EmailRecord {
            id: 0,
            account_id: 1,
            recipient: "b@example.com".into(),
            subject: "Hi".into(),
            html: None,
            text: Some("Hello".into()),
            status: EmailStatus::Sent,
            message_id: None,
            association: None,
            scheduled_for: None,
            sent_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_account_lookups() {
        let store = InMemoryAccountStore::new();
        store.upsert(
            SenderAccount::new(1, "Sales@Example.com", "gmail")
                .with_smtp(MailEndpoint::new("smtp.gmail.com", 587))
                .owned_by(9, true),
        );
        store.upsert(SenderAccount::new(2, "other@example.com", "other").owned_by(9, false));
        store.add_owner(9, "creator@example.com");

        assert_eq!(store.find_by_id(2).await.unwrap().unwrap().email, "other@example.com");
        assert_eq!(store.find_by_email("sales@example.com").await.unwrap().unwrap().id, 1);
        assert_eq!(store.find_primary_for_owner(9).await.unwrap().unwrap().id, 1);
        assert_eq!(store.find_owner_by_email("CREATOR@example.com").await.unwrap(), Some(9));
        assert!(store.find_by_id(3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_email_records() {
        let store = InMemoryEmailStore::new();
        let mut created = store.create(record()).await.unwrap();
        assert_eq!(created.id, 1);

        created.status = EmailStatus::Failed;
        store.update(&created).await.unwrap();
        assert_eq!(store.get(1).await.unwrap().unwrap().status, EmailStatus::Failed);

        store.fail_writes(true);
        assert!(store.create(record()).await.is_err());
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test]
    async fn test_attempts_append_in_order() {
        let store = InMemoryAttemptStore::new();
        for i in 0..3 {
            store
                .append(DeliveryAttemptRecord {
                    id: i.to_string(),
                    account_id: 1,
                    success: true,
                    message_id: None,
                    transport: TransportKind::Simulated,
                    elapsed_ms: 0,
                    error: None,
                    association: None,
                    recorded_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let ids: Vec<String> = store.attempts().into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["0", "1", "2"]);
    }
}

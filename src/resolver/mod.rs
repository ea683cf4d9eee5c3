//! Sender reference resolution.

use std::sync::Arc;

use crate::errors::{DeliveryError, DeliveryResult};
use crate::store::AccountStore;
use crate::types::{SenderAccount, SenderRef};

/// Maps sender references to accounts.
#[derive(Clone)]
pub struct AccountResolver {
    store: Arc<dyn AccountStore>,
}

impl std::fmt::Debug for AccountResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountResolver").finish_non_exhaustive()
    }
}

impl AccountResolver {
    /// Creates a resolver over `store`.
    pub fn new(store: Arc<dyn AccountStore>) -> Self {
        Self { store }
    }

    /// Resolves an account reference.
    ///
    /// Tries an exact id, then an address, then treats the reference as an
    /// owning entity and takes its primary account.
    pub async fn resolve(&self, sender: &SenderRef) -> DeliveryResult<SenderAccount> {
        let found = match sender {
            SenderRef::Id(id) => self.store.find_by_id(*id).await?,
            SenderRef::Email(email) => self.store.find_by_email(email).await?,
        };

        if let Some(account) = found {
            return Ok(account);
        }

        self.primary_for(sender).await?.ok_or_else(|| not_found(sender))
    }

    /// Resolves an owning entity to its primary account.
    pub async fn resolve_owner(&self, owner: &SenderRef) -> DeliveryResult<SenderAccount> {
        self.primary_for(owner).await?.ok_or_else(|| {
            DeliveryError::not_found(format!("No primary sender account for owner {}", owner))
        })
    }

    async fn primary_for(&self, owner: &SenderRef) -> DeliveryResult<Option<SenderAccount>> {
        let owner_id = match owner {
            SenderRef::Id(id) => Some(*id),
            SenderRef::Email(email) => self.store.find_owner_by_email(email).await?,
        };

        match owner_id {
            Some(id) => self.store.find_primary_for_owner(id).await,
            None => Ok(None),
        }
    }
}

fn not_found(sender: &SenderRef) -> DeliveryError {
    DeliveryError::not_found(format!("Sender account {} not found", sender))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DeliveryErrorKind;
    use crate::store::InMemoryAccountStore;

    fn resolver() -> AccountResolver {
        let store = InMemoryAccountStore::new();
        store.upsert(SenderAccount::new(1, "one@example.com", "other"));
        store.upsert(SenderAccount::new(2, "two@example.com", "other").owned_by(50, true));
        store.upsert(SenderAccount::new(3, "three@example.com", "other").owned_by(50, false));
        store.add_owner(50, "creator@example.com");
        AccountResolver::new(Arc::new(store))
    }

    #[tokio::test]
    async fn test_resolution_order() {
        let resolver = resolver();

        assert_eq!(resolver.resolve(&SenderRef::Id(1)).await.unwrap().id, 1);
        assert_eq!(resolver.resolve(&"TWO@example.com".into()).await.unwrap().id, 2);
        // No account 50, so the id is taken as an owner
        assert_eq!(resolver.resolve(&SenderRef::Id(50)).await.unwrap().id, 2);
        assert_eq!(resolver.resolve(&"creator@example.com".into()).await.unwrap().id, 2);
    }

    #[tokio::test]
    async fn test_owner_resolution() {
        let resolver = resolver();
        assert_eq!(resolver.resolve_owner(&SenderRef::Id(50)).await.unwrap().id, 2);
        assert!(resolver.resolve_owner(&SenderRef::Id(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_not_found_is_not_retryable() {
        let err = resolver().resolve(&"nobody@example.com".into()).await.unwrap_err();
        assert_eq!(err.kind(), DeliveryErrorKind::AccountNotFound);
        assert!(!err.is_retryable());
    }
}

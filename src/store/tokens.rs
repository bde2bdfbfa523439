//! Token cache repository over a [`DocumentStore`].

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::{Document, DocumentStore};
use crate::auth::{SharedClock, TokenCacheItem, system_clock};
use crate::{Error, Result};

/// Reads and writes [`TokenCacheItem`]s keyed by audience and email (or subject).
#[derive(Clone)]
pub struct TokenRepository {
    store: Arc<dyn DocumentStore>,
    collection: String,
    clock: SharedClock,
}

impl TokenRepository {
    /// Repository over `collection` of `store`.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
            clock: system_clock(),
        }
    }

    /// Stamp `updated` from `clock` instead of the system clock.
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// The item for `audience` owned by `principal`, matched on email first, then subject.
    pub async fn find(&self, audience: &str, principal: &str) -> Result<Option<TokenCacheItem>> {
        for field in ["email", "subject"] {
            let filter: Document = [
                ("audience".to_string(), Value::String(audience.to_string())),
                (field.to_string(), Value::String(principal.to_string())),
            ]
            .into_iter()
            .collect();

            if let Some(record) = self.store.find_by_fields(&self.collection, &filter).await? {
                return serde_json::from_value(Value::Object(record))
                    .map(Some)
                    .map_err(|e| Error::Store(format!("Corrupt token cache item: {e}")));
            }
        }
        Ok(None)
    }

    /// Write `item` wholesale, keyed by `(audience, email)` or `(audience, subject)`.
    ///
    /// # Errors
    ///
    /// `Error::Store` for an item with neither email nor subject, which
    /// could never be found again.
    pub async fn upsert(&self, item: &TokenCacheItem) -> Result<String> {
        let keys: &[&str] = match (&item.email, &item.subject) {
            (Some(_), _) => &["audience", "email"],
            (None, Some(_)) => &["audience", "subject"],
            (None, None) => {
                return Err(Error::Store(format!(
                    "Refusing to store a token for '{}' without email or subject",
                    item.audience
                )));
            }
        };

        let mut item = item.clone();
        item.id = None;
        item.updated = self.clock.now();
        let Value::Object(record) = serde_json::to_value(&item)? else {
            return Err(Error::Internal("token cache item did not serialize to an object".to_string()));
        };

        let id = self.store.insert_or_update(&self.collection, keys, record).await?;
        debug!(audience = %item.audience, principal = ?item.principal(), "Stored token cache item");
        Ok(id)
    }

    /// Remove an item by id.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.store.delete_by_id(&self.collection, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token::tests::token_with;
    use crate::auth::ManualClock;
    use crate::store::InMemoryDocumentStore;
    use chrono::{Duration, TimeZone, Utc};

    fn repo() -> TokenRepository {
        TokenRepository::new(Arc::new(InMemoryDocumentStore::new()), "tokens")
    }

    #[tokio::test]
    async fn upsert_then_find_by_email_or_subject() {
        let repo = repo();
        let item = TokenCacheItem::create(token_with(Some("ID"), Duration::hours(1))).unwrap();

        let id = repo.upsert(&item).await.unwrap();

        let by_email = repo.find("tools", "alice@example.com").await.unwrap().unwrap();
        let by_subject = repo.find("tools", "user-1").await.unwrap().unwrap();
        assert_eq!(by_email.id.as_deref(), Some(id.as_str()));
        assert_eq!(by_email.id_token, item.id_token);
        assert_eq!(by_subject.id, by_email.id);
        assert!(repo.find("search", "alice@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_overwrites_on_same_key() {
        let repo = repo();
        let first = TokenCacheItem::create(token_with(Some("Bearer"), -Duration::hours(1))).unwrap();
        let second = TokenCacheItem::create(token_with(Some("Bearer"), Duration::hours(1))).unwrap();

        let a = repo.upsert(&first).await.unwrap();
        let b = repo.upsert(&second).await.unwrap();

        assert_eq!(a, b);
        let stored = repo.find("tools", "alice@example.com").await.unwrap().unwrap();
        assert!(!stored.is_expired());
    }

    #[tokio::test]
    async fn updated_comes_from_the_injected_clock() {
        let at = Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap();
        let repo = repo().with_clock(Arc::new(ManualClock::new(at)));
        let item = TokenCacheItem::create(token_with(Some("ID"), Duration::hours(1))).unwrap();

        repo.upsert(&item).await.unwrap();

        let stored = repo.find("tools", "alice@example.com").await.unwrap().unwrap();
        assert_eq!(stored.updated, at);
    }

    #[tokio::test]
    async fn item_without_principal_is_refused() {
        // GIVEN: an item that names neither an email nor a subject
        let repo = repo();
        let mut item = TokenCacheItem::create(token_with(Some("ID"), Duration::hours(1))).unwrap();
        item.email = None;
        item.subject = None;

        // WHEN: stored
        let err = repo.upsert(&item).await.unwrap_err();

        // THEN: nothing is written under a null key
        assert!(matches!(err, Error::Store(_)), "{err:?}");
        item.subject = Some("user-1".to_string());
        repo.upsert(&item).await.unwrap();
        assert!(repo.find("tools", "user-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_removes_item() {
        let repo = repo();
        let item = TokenCacheItem::create(token_with(None, Duration::hours(1))).unwrap();
        let id = repo.upsert(&item).await.unwrap();

        assert!(repo.delete(&id).await.unwrap());
        assert!(repo.find("tools", "alice@example.com").await.unwrap().is_none());
    }
}

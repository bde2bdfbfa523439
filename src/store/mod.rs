//! Persistence boundary for the token cache.
//!
//! The [`DocumentStore`] trait abstracts over storage backends:
//! [`InMemoryDocumentStore`] for tests and development, and
//! `MongoDocumentStore` (feature `mongo`) for deployments where several
//! gateway processes share one cache. The backend is picked by
//! `token_cache.backend`, not by code path.

#[cfg(feature = "mongo")]
pub mod mongo;
pub mod tokens;

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Map, Value};
use tracing::{debug, info};

pub use tokens::TokenRepository;

use crate::config::{CacheBackend, TokenCacheConfig};
use crate::{Error, Result};

/// A stored record. `_id` holds the store-assigned identifier.
pub type Document = Map<String, Value>;

/// Identifier field.
pub const ID_FIELD: &str = "_id";

/// Keyed document store.
///
/// Implementations must be `Send + Sync` because the store is shared across
/// request tasks.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// First record whose fields equal every entry of `filter`.
    /// A `null` filter value matches a missing field.
    async fn find_by_fields(&self, collection: &str, filter: &Document) -> Result<Option<Document>>;

    /// Insert a new record and return its id.
    async fn insert(&self, collection: &str, record: Document) -> Result<String>;

    /// Replace the record matching `record` on `filter_keys` wholesale, or
    /// insert it. Returns the id of the written record.
    async fn insert_or_update(
        &self,
        collection: &str,
        filter_keys: &[&str],
        record: Document,
    ) -> Result<String>;

    /// Delete by id. Returns `true` if a record was removed.
    async fn delete_by_id(&self, collection: &str, id: &str) -> Result<bool>;
}

/// Filter built from `record`'s values for `keys`.
#[must_use]
pub fn filter_for(record: &Document, keys: &[&str]) -> Document {
    keys.iter()
        .map(|key| ((*key).to_string(), record.get(*key).cloned().unwrap_or(Value::Null)))
        .collect()
}

fn matches(record: &Document, filter: &Document) -> bool {
    filter
        .iter()
        .all(|(key, expected)| record.get(key).unwrap_or(&Value::Null) == expected)
}

/// In-memory store backed by a `DashMap` of collections.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    collections: DashMap<String, Vec<Document>>,
}

impl InMemoryDocumentStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in `collection`.
    #[must_use]
    pub fn len(&self, collection: &str) -> usize {
        self.collections.get(collection).map_or(0, |c| c.len())
    }

    /// Whether `collection` holds no records.
    #[must_use]
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }
}

#[async_trait::async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn find_by_fields(&self, collection: &str, filter: &Document) -> Result<Option<Document>> {
        Ok(self
            .collections
            .get(collection)
            .and_then(|records| records.iter().find(|r| matches(r, filter)).cloned()))
    }

    async fn insert(&self, collection: &str, mut record: Document) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        record.insert(ID_FIELD.to_string(), Value::String(id.clone()));
        self.collections
            .entry(collection.to_string())
            .or_default()
            .push(record);
        Ok(id)
    }

    async fn insert_or_update(
        &self,
        collection: &str,
        filter_keys: &[&str],
        mut record: Document,
    ) -> Result<String> {
        let filter = filter_for(&record, filter_keys);
        let mut records = self.collections.entry(collection.to_string()).or_default();

        if let Some(existing) = records.iter_mut().find(|r| matches(r, &filter)) {
            let id = existing
                .get(ID_FIELD)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::Store(format!("record in {collection} has no {ID_FIELD}")))?;
            record.insert(ID_FIELD.to_string(), Value::String(id.clone()));
            *existing = record;
            debug!(collection = %collection, id = %id, "Replaced record");
            return Ok(id);
        }

        let id = uuid::Uuid::new_v4().to_string();
        record.insert(ID_FIELD.to_string(), Value::String(id.clone()));
        records.push(record);
        debug!(collection = %collection, id = %id, "Inserted record");
        Ok(id)
    }

    async fn delete_by_id(&self, collection: &str, id: &str) -> Result<bool> {
        let Some(mut records) = self.collections.get_mut(collection) else {
            return Ok(false);
        };
        let before = records.len();
        records.retain(|r| r.get(ID_FIELD).and_then(Value::as_str) != Some(id));
        Ok(records.len() < before)
    }
}

/// Open the configured backend.
///
/// # Errors
///
/// Returns an error if the Mongo backend is selected but unavailable.
pub async fn open(config: &TokenCacheConfig) -> Result<Arc<dyn DocumentStore>> {
    match config.backend {
        CacheBackend::Memory => {
            info!("Using in-memory token cache");
            Ok(Arc::new(InMemoryDocumentStore::new()))
        }
        #[cfg(feature = "mongo")]
        CacheBackend::Mongo => {
            let url = config
                .mongo_url
                .as_deref()
                .ok_or_else(|| Error::Config("OAUTH_CACHE=mongo requires MONGO_URL".to_string()))?;
            let store = mongo::MongoDocumentStore::connect(url, &config.database).await?;
            info!(database = %config.database, collection = %config.collection, "Using MongoDB token cache");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "mongo"))]
        CacheBackend::Mongo => Err(Error::Config(
            "OAUTH_CACHE=mongo but the gateway was built without the `mongo` feature".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[tokio::test]
    async fn insert_assigns_ids_and_find_matches_all_fields() {
        let store = InMemoryDocumentStore::new();
        let id = store
            .insert("tokens", doc(json!({"audience": "tools", "email": "a@example.com"})))
            .await
            .unwrap();

        let hit = store
            .find_by_fields("tokens", &doc(json!({"audience": "tools", "email": "a@example.com"})))
            .await
            .unwrap()
            .unwrap();
        let miss = store
            .find_by_fields("tokens", &doc(json!({"audience": "search", "email": "a@example.com"})))
            .await
            .unwrap();

        assert_eq!(hit.get(ID_FIELD), Some(&json!(id)));
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn null_filter_value_matches_missing_field() {
        let store = InMemoryDocumentStore::new();
        store.insert("tokens", doc(json!({"audience": "tools"}))).await.unwrap();

        let hit = store
            .find_by_fields("tokens", &doc(json!({"audience": "tools", "email": null})))
            .await
            .unwrap();

        assert!(hit.is_some());
    }

    #[tokio::test]
    async fn insert_or_update_replaces_wholesale_and_keeps_id() {
        // GIVEN: an existing record with an extra field
        let store = InMemoryDocumentStore::new();
        let first = store
            .insert_or_update(
                "tokens",
                &["audience", "email"],
                doc(json!({"audience": "tools", "email": "a@example.com", "stale": true})),
            )
            .await
            .unwrap();

        // WHEN: upserted again on the same key without that field
        let second = store
            .insert_or_update(
                "tokens",
                &["audience", "email"],
                doc(json!({"audience": "tools", "email": "a@example.com", "fresh": true})),
            )
            .await
            .unwrap();

        // THEN: same id, one record, old fields gone
        assert_eq!(first, second);
        assert_eq!(store.len("tokens"), 1);
        let record = store
            .find_by_fields("tokens", &doc(json!({"audience": "tools"})))
            .await
            .unwrap()
            .unwrap();
        assert!(record.get("stale").is_none());
        assert_eq!(record.get("fresh"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn delete_by_id_removes_record() {
        let store = InMemoryDocumentStore::new();
        let id = store.insert("tokens", doc(json!({"audience": "tools"}))).await.unwrap();

        assert!(store.delete_by_id("tokens", &id).await.unwrap());
        assert!(!store.delete_by_id("tokens", &id).await.unwrap());
        assert!(store.is_empty("tokens"));
    }

    #[tokio::test]
    async fn open_defaults_to_memory() {
        let store = open(&TokenCacheConfig::default()).await.unwrap();
        let id = store.insert("tokens", Document::new()).await.unwrap();
        assert!(!id.is_empty());
    }
}

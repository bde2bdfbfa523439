//! MongoDB backend.

use mongodb::bson::{self, Document as BsonDocument, doc};
use mongodb::{Client, Collection, Database};
use serde_json::Value;
use tracing::debug;

use super::{Document, DocumentStore, ID_FIELD, filter_for};
use crate::{Error, Result};

fn store_err(e: impl std::fmt::Display) -> Error {
    Error::Store(e.to_string())
}

fn to_bson(record: &Document) -> Result<BsonDocument> {
    bson::to_document(record).map_err(store_err)
}

fn from_bson(document: BsonDocument) -> Result<Document> {
    bson::from_document(document).map_err(store_err)
}

/// Document store over one MongoDB database.
pub struct MongoDocumentStore {
    db: Database,
}

impl MongoDocumentStore {
    /// Connect to `url` and select `database`.
    pub async fn connect(url: &str, database: &str) -> Result<Self> {
        let client = Client::with_uri_str(url).await.map_err(store_err)?;
        Ok(Self {
            db: client.database(database),
        })
    }

    fn collection(&self, name: &str) -> Collection<BsonDocument> {
        self.db.collection(name)
    }
}

#[async_trait::async_trait]
impl DocumentStore for MongoDocumentStore {
    async fn find_by_fields(&self, collection: &str, filter: &Document) -> Result<Option<Document>> {
        let found = self
            .collection(collection)
            .find_one(to_bson(filter)?)
            .await
            .map_err(store_err)?;
        found.map(from_bson).transpose()
    }

    async fn insert(&self, collection: &str, mut record: Document) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        record.insert(ID_FIELD.to_string(), Value::String(id.clone()));
        self.collection(collection)
            .insert_one(to_bson(&record)?)
            .await
            .map_err(store_err)?;
        Ok(id)
    }

    async fn insert_or_update(
        &self,
        collection: &str,
        filter_keys: &[&str],
        mut record: Document,
    ) -> Result<String> {
        let coll = self.collection(collection);
        let filter = to_bson(&filter_for(&record, filter_keys))?;

        let existing_id = coll
            .find_one(filter)
            .await
            .map_err(store_err)?
            .and_then(|d| d.get_str(ID_FIELD).ok().map(str::to_string));

        match existing_id {
            Some(id) => {
                record.insert(ID_FIELD.to_string(), Value::String(id.clone()));
                coll.replace_one(doc! { "_id": &id }, to_bson(&record)?)
                    .await
                    .map_err(store_err)?;
                debug!(collection = %collection, id = %id, "Replaced record");
                Ok(id)
            }
            None => self.insert(collection, record).await,
        }
    }

    async fn delete_by_id(&self, collection: &str, id: &str) -> Result<bool> {
        let result = self
            .collection(collection)
            .delete_one(doc! { "_id": id })
            .await
            .map_err(store_err)?;
        Ok(result.deleted_count > 0)
    }
}

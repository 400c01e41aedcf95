//! MongoDB client and collection wrapper
//!
//! Every round trip goes through [`MongoCollection::bounded`], so a slow or
//! unreachable server surfaces as `StoreError::Timeout` instead of hanging
//! the caller.

use bson::{doc, Document};
use futures_util::TryStreamExt;
use mongodb::{
    error::{ErrorKind, WriteFailure},
    options::{IndexOptions, ReturnDocument, UpdateModifications},
    Client, Collection, IndexModel,
};
use serde::{de::DeserializeOwned, Serialize};
use std::future::IntoFuture;
use std::time::Duration;
use tracing::{error, info};

use crate::types::StoreError;

/// MongoDB duplicate key error code
const DUPLICATE_KEY: i32 = 11000;

/// Trait for schemas that provide index definitions
pub trait IntoIndexes {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)>;
}

/// MongoDB client wrapper
#[derive(Clone)]
pub struct MongoClient {
    client: Client,
    db_name: String,
    op_timeout: Duration,
}

impl MongoClient {
    /// Connect and verify the connection with a ping.
    ///
    /// `op_timeout` bounds server selection, connection setup and every
    /// later collection operation.
    pub async fn new(uri: &str, db_name: &str, op_timeout: Duration) -> Result<Self, StoreError> {
        info!("Connecting to MongoDB at {}", uri);

        let timeout_ms = op_timeout.as_millis();
        let timeout_uri = if uri.contains('?') {
            format!(
                "{}&serverSelectionTimeoutMS={}&connectTimeoutMS={}",
                uri, timeout_ms, timeout_ms
            )
        } else {
            format!(
                "{}?serverSelectionTimeoutMS={}&connectTimeoutMS={}",
                uri, timeout_ms, timeout_ms
            )
        };

        let client = Client::with_uri_str(&timeout_uri)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to connect to MongoDB: {}", e)))?;

        client
            .database(db_name)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| StoreError::Unavailable(format!("MongoDB ping failed: {}", e)))?;

        info!("Connected to MongoDB database '{}'", db_name);

        Ok(Self {
            client,
            db_name: db_name.to_string(),
            op_timeout,
        })
    }

    /// Get a typed collection, applying its indexes
    pub async fn collection<T>(&self, name: &str) -> Result<MongoCollection<T>, StoreError>
    where
        T: Serialize + DeserializeOwned + Unpin + Send + Sync + IntoIndexes,
    {
        MongoCollection::new(&self.client, &self.db_name, name, self.op_timeout).await
    }

    /// Get the database name
    pub fn db_name(&self) -> &str {
        &self.db_name
    }
}

/// Typed MongoDB collection with automatic indexing and bounded operations
#[derive(Debug, Clone)]
pub struct MongoCollection<T>
where
    T: Serialize + DeserializeOwned + Unpin + Send + Sync,
{
    inner: Collection<T>,
    op_timeout: Duration,
}

impl<T> MongoCollection<T>
where
    T: Serialize + DeserializeOwned + Unpin + Send + Sync + IntoIndexes,
{
    /// Create a new collection and apply indexes
    pub async fn new(
        client: &Client,
        db_name: &str,
        collection_name: &str,
        op_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let collection = client.database(db_name).collection::<T>(collection_name);
        let mongo_collection = MongoCollection {
            inner: collection,
            op_timeout,
        };

        mongo_collection.apply_indexes().await?;

        Ok(mongo_collection)
    }

    /// Apply schema-defined indexes
    async fn apply_indexes(&self) -> Result<(), StoreError> {
        let schema_indices = T::into_indices();

        if schema_indices.is_empty() {
            return Ok(());
        }

        let indices: Vec<IndexModel> = schema_indices
            .into_iter()
            .map(|(keys, opts)| IndexModel::builder().keys(keys).options(opts).build())
            .collect();

        self.bounded("create_indexes", self.inner.create_indexes(indices))
            .await
            .map_err(|e| match e {
                StoreError::Unavailable(msg) => {
                    StoreError::Unavailable(format!("Failed to create indexes: {}", msg))
                }
                other => other,
            })?;

        Ok(())
    }

    /// Run one driver operation under the operation timeout
    async fn bounded<F, R>(&self, operation: &'static str, op: F) -> Result<R, StoreError>
    where
        F: IntoFuture<Output = mongodb::error::Result<R>>,
    {
        match tokio::time::timeout(self.op_timeout, op).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if is_duplicate_key(&e) {
                    return Err(StoreError::Conflict(format!(
                        "{}: duplicate key: {}",
                        operation, e
                    )));
                }
                error!("MongoDB {} failed: {}", operation, e);
                Err(StoreError::from(e))
            }
            Err(_) => {
                let timeout_ms = u64::try_from(self.op_timeout.as_millis()).unwrap_or(u64::MAX);
                error!("MongoDB {} timed out after {}ms", operation, timeout_ms);
                Err(StoreError::Timeout {
                    operation,
                    timeout_ms,
                })
            }
        }
    }

    /// Find one document by filter
    pub async fn find_one(&self, filter: Document) -> Result<Option<T>, StoreError> {
        self.bounded("find_one", self.inner.find_one(filter)).await
    }

    /// Atomically update the first matching document and return it as it is
    /// after the update. With `upsert`, inserts when nothing matches.
    ///
    /// A duplicate key error from a concurrent upsert is reported as
    /// `StoreError::Conflict`.
    pub async fn find_one_and_update(
        &self,
        filter: Document,
        update: impl Into<UpdateModifications>,
        upsert: bool,
    ) -> Result<Option<T>, StoreError> {
        self.bounded(
            "find_one_and_update",
            self.inner
                .find_one_and_update(filter, update)
                .upsert(upsert)
                .return_document(ReturnDocument::After),
        )
        .await
    }

    /// Delete all matching documents, returning how many were removed
    pub async fn delete_many(&self, filter: Document) -> Result<u64, StoreError> {
        let result = self
            .bounded("delete_many", self.inner.delete_many(filter))
            .await?;
        Ok(result.deleted_count)
    }

    /// Run an aggregation pipeline and collect the output documents
    pub async fn aggregate(&self, pipeline: Vec<Document>) -> Result<Vec<Document>, StoreError> {
        self.bounded("aggregate", async {
            let cursor = self.inner.aggregate(pipeline).await?;
            cursor.try_collect::<Vec<Document>>().await
        })
        .await
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Command(command_error) => command_error.code == DUPLICATE_KEY,
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => {
            write_error.code == DUPLICATE_KEY
        }
        _ => false,
    }
}

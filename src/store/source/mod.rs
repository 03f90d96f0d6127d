use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::store::error::{StoreError, StoreResult};
use crate::store::model::{DocumentKey, FieldPath};
use crate::store::query::Query;
use crate::store::snapshot::{QuerySnapshot, RawDocument};
use crate::subscription::{ErrorSink, RawTeardown};

mod in_memory;

pub use in_memory::InMemorySource;

/// Receives every state of a watched document; `None` means it does not exist.
pub type DocumentSink = Arc<dyn Fn(Option<RawDocument>) + Send + Sync + 'static>;
/// Receives every result of a watched query.
pub type QuerySink = Arc<dyn Fn(QuerySnapshot) + Send + Sync + 'static>;

#[derive(Clone, Debug, PartialEq)]
pub enum WriteOperation {
    /// Replaces the whole document.
    Set {
        key: DocumentKey,
        data: Map<String, Value>,
    },
    /// Deep-merges `data` into the document, creating it if needed.
    Merge {
        key: DocumentKey,
        data: Map<String, Value>,
    },
    /// Writes individual fields of an existing document.
    Update {
        key: DocumentKey,
        fields: Vec<(FieldPath, Value)>,
    },
    Delete {
        key: DocumentKey,
    },
}

impl WriteOperation {
    pub fn key(&self) -> &DocumentKey {
        match self {
            WriteOperation::Set { key, .. }
            | WriteOperation::Merge { key, .. }
            | WriteOperation::Update { key, .. }
            | WriteOperation::Delete { key } => key,
        }
    }
}

/// The remote database client the typed collection layer reads and writes
/// through.
///
/// Watches report their first state as soon as they can and every change
/// after that until the returned teardown runs. A watch that cannot be
/// established reports through `on_error`, possibly before returning.
#[async_trait]
pub trait DocumentSource: Send + Sync + 'static {
    async fn get_document(&self, key: &DocumentKey) -> StoreResult<Option<RawDocument>>;

    async fn get_documents(&self, keys: &[DocumentKey]) -> StoreResult<Vec<Option<RawDocument>>> {
        let mut documents = Vec::with_capacity(keys.len());
        for key in keys {
            documents.push(self.get_document(key).await?);
        }
        Ok(documents)
    }

    async fn run_query(&self, query: &Query) -> StoreResult<Vec<RawDocument>>;

    /// Applies every write or none of them.
    async fn commit(&self, writes: Vec<WriteOperation>) -> StoreResult<()>;

    fn watch_document(
        &self,
        key: &DocumentKey,
        on_next: DocumentSink,
        on_error: ErrorSink<StoreError>,
    ) -> RawTeardown;

    fn watch_query(
        &self,
        query: &Query,
        on_next: QuerySink,
        on_error: ErrorSink<StoreError>,
    ) -> RawTeardown;
}

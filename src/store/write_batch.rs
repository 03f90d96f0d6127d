use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::store::collection::Collection;
use crate::store::error::{invalid_argument, StoreResult};
use crate::store::model::IntoFieldPath;
use crate::store::source::{DocumentSource, WriteOperation};

const MAX_BATCH_WRITES: usize = 500;

/// Queues writes across collections of one source and commits them atomically.
#[derive(Clone)]
pub struct WriteBatch {
    source: Arc<dyn DocumentSource>,
    writes: Vec<WriteOperation>,
}

impl fmt::Debug for WriteBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteBatch")
            .field("writes", &self.writes)
            .finish()
    }
}

impl WriteBatch {
    pub(crate) fn new(source: Arc<dyn DocumentSource>) -> Self {
        Self {
            source,
            writes: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn set<T>(&mut self, collection: &Collection<T>, id: &str, data: &T) -> StoreResult<&mut Self>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.ensure_writable(collection)?;
        let write = collection.set_operation(id, data)?;
        self.writes.push(write);
        Ok(self)
    }

    pub fn upset<T>(&mut self, collection: &Collection<T>, id: &str, data: &T) -> StoreResult<&mut Self>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.ensure_writable(collection)?;
        let write = collection.merge_operation(id, data)?;
        self.writes.push(write);
        Ok(self)
    }

    pub fn update<T, I, F, V>(
        &mut self,
        collection: &Collection<T>,
        id: &str,
        fields: I,
    ) -> StoreResult<&mut Self>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        I: IntoIterator<Item = (F, V)>,
        F: IntoFieldPath,
        V: Into<Value>,
    {
        self.ensure_writable(collection)?;
        let write = collection.update_operation(id, fields)?;
        self.writes.push(write);
        Ok(self)
    }

    pub fn remove<T>(&mut self, collection: &Collection<T>, id: &str) -> StoreResult<&mut Self>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.ensure_writable(collection)?;
        let write = collection.delete_operation(id)?;
        self.writes.push(write);
        Ok(self)
    }

    /// Commits every queued write, or none of them.
    pub async fn commit(self) -> StoreResult<()> {
        if self.writes.is_empty() {
            return Ok(());
        }
        self.source.commit(self.writes).await
    }

    fn ensure_writable<T>(&self, collection: &Collection<T>) -> StoreResult<()>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        if self.writes.len() >= MAX_BATCH_WRITES {
            return Err(invalid_argument(format!(
                "A write batch holds at most {MAX_BATCH_WRITES} writes"
            )));
        }
        let same_source = std::ptr::eq(
            Arc::as_ptr(&self.source) as *const (),
            Arc::as_ptr(collection.source()) as *const (),
        );
        if !same_source {
            return Err(invalid_argument(
                "All writes in a batch must target the same source",
            ));
        }
        Ok(())
    }
}

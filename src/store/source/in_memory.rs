use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock, Mutex, Weak};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::logger::Logger;
use crate::store::error::{not_found, unavailable, StoreError, StoreResult};
use crate::store::model::DocumentKey;
use crate::store::query::Query;
use crate::store::query_evaluator::apply_query;
use crate::store::snapshot::{QuerySnapshot, RawDocument};
use crate::subscription::{ErrorSink, RawTeardown};

use super::{DocumentSink, DocumentSource, QuerySink, WriteOperation};

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@docstore/store"));

type Fields = Map<String, Value>;

/// A [`DocumentSource`] that keeps every document in process memory.
///
/// Watches are notified synchronously from within `commit`. The source can be
/// switched offline with [`set_unavailable`](Self::set_unavailable), which
/// fails every open watch and every later operation until switched back.
#[derive(Clone, Default)]
pub struct InMemorySource {
    inner: Arc<SourceInner>,
}

#[derive(Default)]
struct SourceInner {
    state: Mutex<SourceState>,
}

#[derive(Default)]
struct SourceState {
    documents: BTreeMap<DocumentKey, Fields>,
    unavailable: bool,
    next_watch_id: u64,
    document_watches: BTreeMap<u64, DocumentWatch>,
    query_watches: BTreeMap<u64, QueryWatch>,
}

struct DocumentWatch {
    key: DocumentKey,
    last: Option<RawDocument>,
    on_next: DocumentSink,
    on_error: ErrorSink<StoreError>,
}

struct QueryWatch {
    query: Query,
    last: Vec<RawDocument>,
    on_next: QuerySink,
    on_error: ErrorSink<StoreError>,
}

type Delivery = Box<dyn FnOnce() + Send>;

impl SourceState {
    fn document(&self, key: &DocumentKey) -> Option<RawDocument> {
        self.documents
            .get(key)
            .map(|data| RawDocument::new(key.clone(), data.clone()))
    }

    fn query(&self, query: &Query) -> Vec<RawDocument> {
        let documents = self
            .documents
            .iter()
            .map(|(key, data)| RawDocument::new(key.clone(), data.clone()))
            .collect();
        apply_query(documents, query)
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.unavailable {
            return Err(unavailable("The in-memory source is offline"));
        }
        Ok(())
    }

    fn next_id(&mut self) -> u64 {
        self.next_watch_id += 1;
        self.next_watch_id
    }

    /// Collects a notification for every watch whose result changed.
    fn pending_deliveries(&mut self) -> Vec<Delivery> {
        let mut deliveries: Vec<Delivery> = Vec::new();

        let documents = &self.documents;
        for watch in self.document_watches.values_mut() {
            let current = documents
                .get(&watch.key)
                .map(|data| RawDocument::new(watch.key.clone(), data.clone()));
            if current != watch.last {
                watch.last = current.clone();
                let on_next = watch.on_next.clone();
                deliveries.push(Box::new(move || on_next(current)));
            }
        }

        let ids: Vec<u64> = self.query_watches.keys().copied().collect();
        for id in ids {
            let results = match self.query_watches.get(&id) {
                Some(watch) => self.query(&watch.query),
                None => continue,
            };
            let Some(watch) = self.query_watches.get_mut(&id) else {
                continue;
            };
            let snapshot = QuerySnapshot::diff(Some(&watch.last), results);
            if snapshot.changes.is_empty() {
                continue;
            }
            watch.last = snapshot.documents.clone();
            let on_next = watch.on_next.clone();
            deliveries.push(Box::new(move || on_next(snapshot)));
        }

        deliveries
    }
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switches the source offline or back online.
    ///
    /// Going offline fails and closes every open watch.
    pub fn set_unavailable(&self, unavailable_now: bool) {
        let failed: Vec<ErrorSink<StoreError>> = {
            let mut state = self.inner.state.lock().unwrap();
            state.unavailable = unavailable_now;
            if !unavailable_now {
                return;
            }
            let documents = std::mem::take(&mut state.document_watches)
                .into_values()
                .map(|watch| watch.on_error);
            let queries = std::mem::take(&mut state.query_watches)
                .into_values()
                .map(|watch| watch.on_error);
            documents.chain(queries).collect()
        };
        LOGGER.debug(format!(
            "Source went offline, failing {} open watch(es)",
            failed.len()
        ));
        for on_error in failed {
            on_error(unavailable("The in-memory source went offline"));
        }
    }

    /// Number of watches currently open.
    pub fn active_watches(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.document_watches.len() + state.query_watches.len()
    }

    fn teardown_for(&self, id: u64) -> RawTeardown {
        let weak: Weak<SourceInner> = Arc::downgrade(&self.inner);
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut state = inner.state.lock().unwrap();
                state.document_watches.remove(&id);
                state.query_watches.remove(&id);
            }
        })
    }

    fn apply_writes(
        documents: &mut BTreeMap<DocumentKey, Fields>,
        writes: Vec<WriteOperation>,
    ) -> StoreResult<()> {
        for write in writes {
            match write {
                WriteOperation::Set { key, data } => {
                    documents.insert(key, data);
                }
                WriteOperation::Merge { key, data } => {
                    let target = documents.entry(key).or_default();
                    merge_fields(target, data);
                }
                WriteOperation::Update { key, fields } => {
                    let target = documents
                        .get_mut(&key)
                        .ok_or_else(|| not_found(format!("Document {key} does not exist")))?;
                    for (path, value) in fields {
                        path.assign(target, value);
                    }
                }
                WriteOperation::Delete { key } => {
                    documents.remove(&key);
                }
            }
        }
        Ok(())
    }
}

fn merge_fields(target: &mut Fields, source: Fields) {
    for (name, value) in source {
        match value {
            Value::Object(incoming) => match target.get_mut(&name) {
                Some(Value::Object(existing)) => merge_fields(existing, incoming),
                _ => {
                    target.insert(name, Value::Object(incoming));
                }
            },
            value => {
                target.insert(name, value);
            }
        }
    }
}

#[async_trait]
impl DocumentSource for InMemorySource {
    async fn get_document(&self, key: &DocumentKey) -> StoreResult<Option<RawDocument>> {
        let state = self.inner.state.lock().unwrap();
        state.ensure_available()?;
        Ok(state.document(key))
    }

    async fn get_documents(&self, keys: &[DocumentKey]) -> StoreResult<Vec<Option<RawDocument>>> {
        let state = self.inner.state.lock().unwrap();
        state.ensure_available()?;
        Ok(keys.iter().map(|key| state.document(key)).collect())
    }

    async fn run_query(&self, query: &Query) -> StoreResult<Vec<RawDocument>> {
        let state = self.inner.state.lock().unwrap();
        state.ensure_available()?;
        Ok(state.query(query))
    }

    async fn commit(&self, writes: Vec<WriteOperation>) -> StoreResult<()> {
        let deliveries = {
            let mut state = self.inner.state.lock().unwrap();
            state.ensure_available()?;
            let mut documents = state.documents.clone();
            Self::apply_writes(&mut documents, writes)?;
            state.documents = documents;
            state.pending_deliveries()
        };
        for deliver in deliveries {
            deliver();
        }
        Ok(())
    }

    fn watch_document(
        &self,
        key: &DocumentKey,
        on_next: DocumentSink,
        on_error: ErrorSink<StoreError>,
    ) -> RawTeardown {
        let registered = {
            let mut state = self.inner.state.lock().unwrap();
            match state.ensure_available() {
                Ok(()) => {
                    let id = state.next_id();
                    let current = state.document(key);
                    state.document_watches.insert(
                        id,
                        DocumentWatch {
                            key: key.clone(),
                            last: current.clone(),
                            on_next: on_next.clone(),
                            on_error: on_error.clone(),
                        },
                    );
                    Ok((id, current))
                }
                Err(err) => Err(err),
            }
        };
        match registered {
            Ok((id, current)) => {
                on_next(current);
                self.teardown_for(id)
            }
            Err(err) => {
                on_error(err);
                Box::new(|| {})
            }
        }
    }

    fn watch_query(
        &self,
        query: &Query,
        on_next: QuerySink,
        on_error: ErrorSink<StoreError>,
    ) -> RawTeardown {
        let registered = {
            let mut state = self.inner.state.lock().unwrap();
            match state.ensure_available() {
                Ok(()) => {
                    let id = state.next_id();
                    let snapshot = QuerySnapshot::diff(None, state.query(query));
                    state.query_watches.insert(
                        id,
                        QueryWatch {
                            query: query.clone(),
                            last: snapshot.documents.clone(),
                            on_next: on_next.clone(),
                            on_error: on_error.clone(),
                        },
                    );
                    Ok((id, snapshot))
                }
                Err(err) => Err(err),
            }
        };
        match registered {
            Ok((id, snapshot)) => {
                on_next(snapshot);
                self.teardown_for(id)
            }
            Err(err) => {
                on_error(err);
                Box::new(|| {})
            }
        }
    }
}

use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use futures::future::{self, BoxFuture, FutureExt};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::store::error::{internal_error, invalid_argument, StoreError, StoreResult};
use crate::store::model::{DocumentKey, FieldPath, IntoFieldPath, ResourcePath};
use crate::store::query::Query;
use crate::store::snapshot::{Doc, QueryMeta, QuerySnapshot, RawDocument};
use crate::store::source::{DocumentSource, WriteOperation};
use crate::store::write_batch::WriteBatch;
use crate::subscription::{ErrorSink, RawTeardown, RequestDescriptor, ResultSink, SubscriptionFuture};

const AUTO_ID_LENGTH: usize = 20;

/// Subscription future returned by collection scans and queries.
pub type QueryFuture<T> = SubscriptionFuture<Vec<Doc<T>>, StoreError, QueryMeta<T>>;

/// Typed access to the documents of one collection.
///
/// Reads return a [`SubscriptionFuture`], so each of them can be awaited once
/// or listened to for live updates. Writes go straight to the source.
pub struct Collection<T> {
    source: Arc<dyn DocumentSource>,
    path: ResourcePath,
    base_query: Query,
    _model: PhantomData<fn() -> T>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            path: self.path.clone(),
            base_query: self.base_query.clone(),
            _model: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("path", &self.path.canonical_string())
            .finish()
    }
}

impl<T> Collection<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Opens the collection at `path`, which must have an odd number of segments.
    pub fn new(source: Arc<dyn DocumentSource>, path: &str) -> StoreResult<Self> {
        let path = ResourcePath::from_string(path)?;
        let base_query = Query::new(path.clone())?;
        Ok(Self {
            source,
            path,
            base_query,
            _model: PhantomData,
        })
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn id(&self) -> &str {
        self.path.last_segment().unwrap_or_default()
    }

    pub fn source(&self) -> &Arc<dyn DocumentSource> {
        &self.source
    }

    /// The key of document `id` in this collection.
    pub fn doc(&self, id: &str) -> StoreResult<DocumentKey> {
        DocumentKey::in_collection(&self.path, id)
    }

    /// An unconstrained query over this collection, ready for chaining.
    pub fn new_query(&self) -> Query {
        self.base_query.clone()
    }

    /// Reads one document. Resolves to `None` when it does not exist.
    pub fn get(&self, id: &str) -> SubscriptionFuture<Option<Doc<T>>, StoreError> {
        let request = RequestDescriptor::Get {
            path: self.path.child(id).canonical_string(),
        };
        let key = match self.doc(id) {
            Ok(key) => key,
            Err(err) => return failed(request, err),
        };

        let fetch = {
            let source = Arc::clone(&self.source);
            let key = key.clone();
            move || -> BoxFuture<'static, StoreResult<Option<Doc<T>>>> {
                async move {
                    let raw = source.get_document(&key).await?;
                    raw.as_ref().map(Doc::decode).transpose()
                }
                .boxed()
            }
        };

        let source = Arc::clone(&self.source);
        let subscribe = move |on_result: ResultSink<Option<Doc<T>>, ()>,
                              on_error: ErrorSink<StoreError>| {
            let decode_error = Arc::clone(&on_error);
            source.watch_document(
                &key,
                Arc::new(move |raw: Option<RawDocument>| {
                    match raw.as_ref().map(Doc::decode).transpose() {
                        Ok(doc) => on_result(doc, ()),
                        Err(err) => decode_error(err),
                    }
                }),
                on_error,
            )
        };

        SubscriptionFuture::new(request, fetch, subscribe)
    }

    /// Reads several documents, in the order of `ids`.
    ///
    /// Listening opens one watch per id and emits once every id has reported,
    /// then again on every change. Only the first error is reported.
    pub fn many<I, S>(&self, ids: I) -> SubscriptionFuture<Vec<Option<Doc<T>>>, StoreError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        let request = RequestDescriptor::Many {
            collection: self.path.canonical_string(),
            ids: ids.clone(),
        };
        let keys = match ids
            .iter()
            .map(|id| self.doc(id))
            .collect::<StoreResult<Vec<_>>>()
        {
            Ok(keys) => keys,
            Err(err) => return failed(request, err),
        };

        let fetch = {
            let source = Arc::clone(&self.source);
            let keys = keys.clone();
            move || -> BoxFuture<'static, StoreResult<Vec<Option<Doc<T>>>>> {
                async move {
                    let documents = source.get_documents(&keys).await?;
                    documents
                        .iter()
                        .map(|raw| raw.as_ref().map(Doc::decode).transpose())
                        .collect()
                }
                .boxed()
            }
        };

        let source = Arc::clone(&self.source);
        let subscribe = move |on_result: ResultSink<Vec<Option<Doc<T>>>, ()>,
                              on_error: ErrorSink<StoreError>| {
            watch_many(source.as_ref(), &keys, on_result, on_error)
        };

        SubscriptionFuture::new(request, fetch, subscribe)
    }

    /// Reads every document in the collection.
    pub fn all(&self) -> QueryFuture<T> {
        let request = RequestDescriptor::All {
            collection: self.path.canonical_string(),
        };
        self.query_future(request, self.new_query())
    }

    /// Reads the documents matching `query`, which must target this collection.
    pub fn query(&self, query: Query) -> QueryFuture<T> {
        let request = match describe_query(&self.path, &query) {
            Ok(request) => request,
            Err(err) => {
                let request = RequestDescriptor::All {
                    collection: self.path.canonical_string(),
                };
                return failed(request, err);
            }
        };
        if query.collection() != &self.path {
            return failed(
                request,
                invalid_argument(format!(
                    "Query targets '{}' but the collection is '{}'",
                    query.collection(),
                    self.path
                )),
            );
        }
        self.query_future(request, query)
    }

    fn query_future(&self, request: RequestDescriptor, query: Query) -> QueryFuture<T> {
        let fetch = {
            let source = Arc::clone(&self.source);
            let query = query.clone();
            move || -> BoxFuture<'static, StoreResult<Vec<Doc<T>>>> {
                async move {
                    let documents = source.run_query(&query).await?;
                    documents.iter().map(Doc::decode).collect()
                }
                .boxed()
            }
        };

        let source = Arc::clone(&self.source);
        let subscribe = move |on_result: ResultSink<Vec<Doc<T>>, QueryMeta<T>>,
                              on_error: ErrorSink<StoreError>| {
            let decode_error = Arc::clone(&on_error);
            source.watch_query(
                &query,
                Arc::new(move |snapshot: QuerySnapshot| match decode_snapshot(&snapshot) {
                    Ok((documents, meta)) => on_result(documents, meta),
                    Err(err) => decode_error(err),
                }),
                on_error,
            )
        };

        SubscriptionFuture::new(request, fetch, subscribe)
    }

    /// Creates a document with a generated id.
    pub async fn add(&self, data: &T) -> StoreResult<Doc<T>> {
        let key = self.doc(&generate_auto_id())?;
        let fields = encode_document(data)?;
        self.source
            .commit(vec![WriteOperation::Set {
                key: key.clone(),
                data: fields,
            }])
            .await?;
        Ok(Doc::new(key, data.clone()))
    }

    /// Creates or replaces document `id`.
    pub async fn set(&self, id: &str, data: &T) -> StoreResult<()> {
        let write = self.set_operation(id, data)?;
        self.source.commit(vec![write]).await
    }

    /// Merges `data` into document `id`, creating it if needed.
    pub async fn upset(&self, id: &str, data: &T) -> StoreResult<()> {
        let write = self.merge_operation(id, data)?;
        self.source.commit(vec![write]).await
    }

    /// Writes individual fields of an existing document.
    ///
    /// Fails with `docstore/not-found` when the document does not exist.
    pub async fn update<I, F, V>(&self, id: &str, fields: I) -> StoreResult<()>
    where
        I: IntoIterator<Item = (F, V)>,
        F: IntoFieldPath,
        V: Into<Value>,
    {
        let write = self.update_operation(id, fields)?;
        self.source.commit(vec![write]).await
    }

    pub async fn remove(&self, id: &str) -> StoreResult<()> {
        let key = self.doc(id)?;
        self.source.commit(vec![WriteOperation::Delete { key }]).await
    }

    /// Starts an atomic batch of writes against this collection's source.
    pub fn batch(&self) -> WriteBatch {
        WriteBatch::new(Arc::clone(&self.source))
    }

    pub(crate) fn set_operation(&self, id: &str, data: &T) -> StoreResult<WriteOperation> {
        Ok(WriteOperation::Set {
            key: self.doc(id)?,
            data: encode_document(data)?,
        })
    }

    pub(crate) fn merge_operation(&self, id: &str, data: &T) -> StoreResult<WriteOperation> {
        Ok(WriteOperation::Merge {
            key: self.doc(id)?,
            data: encode_document(data)?,
        })
    }

    pub(crate) fn update_operation<I, F, V>(&self, id: &str, fields: I) -> StoreResult<WriteOperation>
    where
        I: IntoIterator<Item = (F, V)>,
        F: IntoFieldPath,
        V: Into<Value>,
    {
        let key = self.doc(id)?;
        let fields = fields
            .into_iter()
            .map(|(path, value)| Ok((path.into_field_path()?, value.into())))
            .collect::<StoreResult<Vec<(FieldPath, Value)>>>()?;
        if fields.is_empty() {
            return Err(invalid_argument("update requires at least one field"));
        }
        Ok(WriteOperation::Update { key, fields })
    }

    pub(crate) fn delete_operation(&self, id: &str) -> StoreResult<WriteOperation> {
        Ok(WriteOperation::Delete { key: self.doc(id)? })
    }
}

fn describe_query<Q: Serialize>(collection: &ResourcePath, query: &Q) -> StoreResult<RequestDescriptor> {
    let query = serde_json::to_value(query)
        .map_err(|err| internal_error(format!("Failed to describe query: {err}")))?;
    Ok(RequestDescriptor::Query {
        collection: collection.canonical_string(),
        query,
    })
}

/// A future whose fetch fails and whose subscription reports `err` at once.
fn failed<R, M>(request: RequestDescriptor, err: StoreError) -> SubscriptionFuture<R, StoreError, M>
where
    R: Clone + Send + Sync + 'static,
    M: Send + Sync + 'static,
{
    let fetch_err = err.clone();
    SubscriptionFuture::new(
        request,
        move || future::ready(Err(fetch_err)).boxed(),
        move |_on_result: ResultSink<R, M>, on_error: ErrorSink<StoreError>| -> RawTeardown {
            on_error(err.clone());
            Box::new(|| {})
        },
    )
}

fn watch_many<T>(
    source: &dyn DocumentSource,
    keys: &[DocumentKey],
    on_result: ResultSink<Vec<Option<Doc<T>>>, ()>,
    on_error: ErrorSink<StoreError>,
) -> RawTeardown
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    struct Progress {
        slots: Vec<Option<Option<RawDocument>>>,
        failed: bool,
    }

    let progress = Arc::new(Mutex::new(Progress {
        slots: vec![None; keys.len()],
        failed: false,
    }));

    if keys.is_empty() {
        on_result(Vec::new(), ());
        return Box::new(|| {});
    }

    let report_error: ErrorSink<StoreError> = {
        let progress = Arc::clone(&progress);
        Arc::new(move |err: StoreError| {
            let first = {
                let mut progress = progress.lock().unwrap();
                !std::mem::replace(&mut progress.failed, true)
            };
            if first {
                on_error(err);
            }
        })
    };

    let teardowns: Vec<RawTeardown> = keys
        .iter()
        .enumerate()
        .map(|(index, key)| {
            let progress = Arc::clone(&progress);
            let on_result = Arc::clone(&on_result);
            let report_error_next = Arc::clone(&report_error);
            source.watch_document(
                key,
                Arc::new(move |raw: Option<RawDocument>| {
                    let ready: Option<Vec<Option<RawDocument>>> = {
                        let mut progress = progress.lock().unwrap();
                        if progress.failed {
                            return;
                        }
                        progress.slots[index] = Some(raw);
                        progress.slots.iter().cloned().collect()
                    };
                    let Some(documents) = ready else {
                        return;
                    };
                    let decoded = documents
                        .iter()
                        .map(|raw| raw.as_ref().map(Doc::decode).transpose())
                        .collect::<StoreResult<Vec<_>>>();
                    match decoded {
                        Ok(docs) => on_result(docs, ()),
                        Err(err) => report_error_next(err),
                    }
                }),
                Arc::clone(&report_error),
            )
        })
        .collect();

    Box::new(move || {
        for teardown in teardowns {
            teardown();
        }
    })
}

fn decode_snapshot<T: DeserializeOwned>(
    snapshot: &QuerySnapshot,
) -> StoreResult<(Vec<Doc<T>>, QueryMeta<T>)> {
    let documents = snapshot
        .documents
        .iter()
        .map(Doc::decode)
        .collect::<StoreResult<Vec<_>>>()?;
    Ok((documents, QueryMeta::decode(snapshot)?))
}

fn encode_document<T: Serialize>(data: &T) -> StoreResult<Map<String, Value>> {
    match serde_json::to_value(data) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(_) => Err(invalid_argument("Documents must serialize to a JSON object")),
        Err(err) => Err(invalid_argument(format!("Failed to encode document: {err}"))),
    }
}

fn generate_auto_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .map(char::from)
        .take(AUTO_ID_LENGTH)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::source::InMemorySource;
    use crate::subscription::Listen;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct City {
        name: String,
        #[serde(default)]
        population: u64,
    }

    fn city(name: &str, population: u64) -> City {
        City {
            name: name.to_string(),
            population,
        }
    }

    fn cities() -> (InMemorySource, Collection<City>) {
        let source = InMemorySource::new();
        let collection = Collection::new(Arc::new(source.clone()), "cities").unwrap();
        (source, collection)
    }

    #[test]
    fn rejects_document_paths() {
        let source: Arc<dyn DocumentSource> = Arc::new(InMemorySource::new());
        assert!(Collection::<City>::new(source, "cities/sf").is_err());
    }

    #[test]
    fn auto_ids_are_alphanumeric() {
        let id = generate_auto_id();
        assert_eq!(id.len(), AUTO_ID_LENGTH);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn request_descriptors_describe_reads() {
        let (_, cities) = cities();
        assert_eq!(
            cities.get("sf").request(),
            &RequestDescriptor::Get {
                path: "cities/sf".into()
            }
        );
        assert_eq!(cities.all().request().kind(), "all");
        assert_eq!(cities.many(["a", "b"]).request().kind(), "many");
    }

    #[tokio::test]
    async fn add_then_get() {
        let (_, cities) = cities();
        let added = cities.add(&city("Paris", 2)).await.unwrap();
        let fetched = cities.get(added.id()).await.unwrap().unwrap();
        assert_eq!(fetched.data(), &city("Paris", 2));
        assert!(cities.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_id_fails_both_ways() {
        let (_, cities) = cities();
        let err = cities.get("a/b").await.unwrap_err();
        assert_eq!(err.code_str(), "docstore/invalid-argument");

        let errors = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&errors);
        let _registration = cities
            .get("a/b")
            .listen(|_, _| {})
            .unwrap()
            .catch(move |err: &StoreError| captured.lock().unwrap().push(err.clone()));
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upset_merges_and_update_requires_document() {
        let (_, cities) = cities();
        cities.set("sf", &city("SF", 1)).await.unwrap();
        cities.upset("sf", &city("San Francisco", 1)).await.unwrap();
        cities.update("sf", [("population", json!(800))]).await.unwrap();
        let doc = cities.get("sf").await.unwrap().unwrap();
        assert_eq!(doc.into_data(), city("San Francisco", 800));

        let err = cities
            .update("la", [("population", json!(1))])
            .await
            .unwrap_err();
        assert_eq!(err.code_str(), "docstore/not-found");
        let empty: [(&str, Value); 0] = [];
        assert!(cities.update("sf", empty).await.is_err());
    }

    #[tokio::test]
    async fn many_keeps_requested_order() {
        let (_, cities) = cities();
        cities.set("a", &city("A", 1)).await.unwrap();
        cities.set("c", &city("C", 3)).await.unwrap();
        let docs = cities.many(["c", "b", "a"]).await.unwrap();
        let names: Vec<Option<String>> = docs
            .iter()
            .map(|doc| doc.as_ref().map(|doc| doc.data().name.clone()))
            .collect();
        assert_eq!(names, [Some("C".into()), None, Some("A".into())]);
    }

    #[tokio::test]
    async fn many_listen_emits_once_all_ids_reported() {
        let (source, cities) = cities();
        cities.set("a", &city("A", 1)).await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&seen);
        let registration = cities
            .many(["a", "b"])
            .listen(move |docs: &Vec<Option<Doc<City>>>, _: &()| {
                captured
                    .lock()
                    .unwrap()
                    .push(docs.iter().filter(|doc| doc.is_some()).count());
            })
            .unwrap();
        cities.set("b", &city("B", 2)).await.unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), &[1, 2]);

        registration.detach();
        assert_eq!(source.active_watches(), 0);
    }

    #[tokio::test]
    async fn decode_failures_are_internal_errors() {
        let (source, cities) = cities();
        source
            .commit(vec![WriteOperation::Set {
                key: cities.doc("bad").unwrap(),
                data: json!({"name": 12}).as_object().cloned().unwrap(),
            }])
            .await
            .unwrap();
        let err = cities.get("bad").await.unwrap_err();
        assert_eq!(err.code_str(), "docstore/internal");
        let err = cities.all().await.unwrap_err();
        assert_eq!(err.code_str(), "docstore/internal");
    }

    #[tokio::test]
    async fn query_for_other_collection_is_rejected() {
        let (_, cities) = cities();
        let towns = Query::new(ResourcePath::from_string("towns").unwrap()).unwrap();
        let err = cities.query(towns).await.unwrap_err();
        assert_eq!(err.code_str(), "docstore/invalid-argument");
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("cursor cannot be encoded"))
        }
    }

    #[test]
    fn query_description_failures_are_internal_errors() {
        let path = ResourcePath::from_string("cities").unwrap();
        let err = describe_query(&path, &Unserializable).unwrap_err();
        assert_eq!(err.code_str(), "docstore/internal");
        assert!(err.to_string().contains("cursor cannot be encoded"));

        let query = Query::new(path.clone()).unwrap();
        match describe_query(&path, &query).unwrap() {
            RequestDescriptor::Query { collection, query } => {
                assert_eq!(collection, "cities");
                assert!(query.is_object());
            }
            other => panic!("unexpected descriptor {other:?}"),
        }
    }
}

#![cfg(not(target_arch = "wasm32"))]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use typed_docstore::store::{
    ChangeKind, Collection, Doc, FilterOperator, InMemorySource, OrderDirection, QueryMeta,
    StoreError, StoreErrorCode,
};
use typed_docstore::subscription::{with_retry, Listen, RequestDescriptor, RetryOptions};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct City {
    name: String,
    population: u64,
}

fn city(name: &str, population: u64) -> City {
    City {
        name: name.to_string(),
        population,
    }
}

fn setup() -> (InMemorySource, Collection<City>) {
    let source = InMemorySource::new();
    let cities = Collection::new(Arc::new(source.clone()), "cities").unwrap();
    (source, cities)
}

#[tokio::test]
async fn get_listen_follows_document_changes() {
    let (_, cities) = setup();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let captured = seen.clone();

    let registration = cities
        .get("sf")
        .listen(move |doc: &Option<Doc<City>>, _: &()| {
            captured
                .lock()
                .unwrap()
                .push(doc.as_ref().map(|doc| doc.data().population));
        })
        .unwrap();

    cities.set("sf", &city("San Francisco", 800)).await.unwrap();
    cities.update("sf", [("population", json!(815))]).await.unwrap();
    cities.remove("sf").await.unwrap();
    registration.detach();
    cities.set("sf", &city("San Francisco", 900)).await.unwrap();

    assert_eq!(
        seen.lock().unwrap().as_slice(),
        &[None, Some(800), Some(815), None]
    );
}

#[tokio::test]
async fn query_listen_reports_changes_in_metadata() {
    let (_, cities) = setup();
    cities.set("sf", &city("San Francisco", 800)).await.unwrap();
    cities.set("la", &city("Los Angeles", 3_900)).await.unwrap();

    let query = cities
        .new_query()
        .where_field("population", FilterOperator::GreaterThan, 500)
        .unwrap()
        .order_by("population", OrderDirection::Desc)
        .unwrap();
    let future = cities.query(query);
    assert_eq!(future.request().kind(), "query");

    let metas: Arc<Mutex<Vec<(Vec<String>, QueryMeta<City>)>>> = Arc::new(Mutex::new(Vec::new()));
    let captured = metas.clone();
    let registration = future
        .listen(move |docs: &Vec<Doc<City>>, meta: &QueryMeta<City>| {
            let ids = docs.iter().map(|doc| doc.id().to_string()).collect();
            captured.lock().unwrap().push((ids, meta.clone()));
        })
        .unwrap();

    cities.set("nyc", &city("New York", 8_300)).await.unwrap();
    cities.update("sf", [("population", json!(400))]).await.unwrap();
    registration.detach();

    let metas = metas.lock().unwrap();
    assert_eq!(metas.len(), 3);

    let (ids, initial) = &metas[0];
    assert_eq!(ids, &["la", "sf"]);
    assert_eq!(initial.size, 2);
    assert!(initial.changes.iter().all(|change| change.kind == ChangeKind::Added));

    let (ids, added) = &metas[1];
    assert_eq!(ids, &["nyc", "la", "sf"]);
    assert_eq!(added.changes[0].kind, ChangeKind::Added);
    assert_eq!(added.changes[0].new_index, Some(0));

    let (ids, removed) = &metas[2];
    assert_eq!(ids, &["nyc", "la"]);
    let change = &removed.changes[0];
    assert_eq!(change.kind, ChangeKind::Removed);
    assert_eq!(change.doc.data(), &city("San Francisco", 800));
    assert_eq!(change.old_index, Some(2));
}

#[tokio::test]
async fn all_resolves_in_key_order() {
    let (_, cities) = setup();
    let added = cities.add(&city("Zurich", 400)).await.unwrap();
    cities.set("amsterdam", &city("Amsterdam", 900)).await.unwrap();

    let future = cities.all();
    assert_eq!(
        future.request(),
        &RequestDescriptor::All {
            collection: "cities".into()
        }
    );
    let docs = future.await.unwrap();
    assert_eq!(docs.len(), 2);
    assert!(docs.iter().any(|doc| doc.id() == added.id()));
}

#[tokio::test]
async fn mixing_modes_surfaces_failed_precondition() {
    let (_, cities) = setup();
    let future = cities.get("sf");
    let registration = future.listen(|_, _| {}).unwrap();

    let err = future.resolve().await.unwrap_err();
    assert_eq!(err.code, StoreErrorCode::FailedPrecondition);
    registration.detach();
}

#[tokio::test(start_paused = true)]
async fn retry_rides_out_an_outage() {
    let (source, cities) = setup();
    cities.set("sf", &city("San Francisco", 800)).await.unwrap();

    let live = with_retry(
        cities.get("sf"),
        RetryOptions::new().with_pattern_millis([100, 100, 100]),
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    let errors = Arc::new(Mutex::new(Vec::<StoreError>::new()));

    let registration = live
        .listen(move |doc: &Option<Doc<City>>, _: &()| {
            let _ = tx.send(doc.as_ref().map(|doc| doc.data().population));
        })
        .unwrap();
    let captured = errors.clone();
    let _errors = registration.catch(move |err: &StoreError| captured.lock().unwrap().push(err.clone()));
    assert_eq!(rx.recv().await, Some(Some(800)));

    source.set_unavailable(true);
    tokio::time::sleep(Duration::from_millis(150)).await;
    source.set_unavailable(false);
    cities.update("sf", [("population", json!(810))]).await.unwrap();

    assert_eq!(rx.recv().await, Some(Some(810)));
    assert!(errors.lock().unwrap().is_empty());
    assert_eq!(source.active_watches(), 1);

    registration.detach();
    assert_eq!(source.active_watches(), 0);
}

#[tokio::test(start_paused = true)]
async fn retry_gives_up_when_the_outage_outlasts_the_pattern() {
    let (source, cities) = setup();
    let live = with_retry(cities.all(), RetryOptions::new().with_pattern_millis([50, 50]));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let registration = live
        .listen(|_: &Vec<Doc<City>>, _: &QueryMeta<City>| {})
        .unwrap();
    let _errors = registration.catch(move |err: &StoreError| {
        let _ = tx.send(err.code.clone());
    });

    source.set_unavailable(true);
    assert_eq!(rx.recv().await, Some(StoreErrorCode::Unavailable));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(rx.try_recv().is_err());
    registration.detach();
}

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::store::error::{internal_error, StoreResult};
use crate::store::model::DocumentKey;

/// A stored document as the source sees it: a key and untyped JSON fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawDocument {
    key: DocumentKey,
    data: Map<String, Value>,
}

impl RawDocument {
    pub fn new(key: DocumentKey, data: Map<String, Value>) -> Self {
        Self { key, data }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn id(&self) -> &str {
        self.key.id()
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn into_data(self) -> Map<String, Value> {
        self.data
    }
}

/// A document decoded into the model type `T`.
#[derive(Clone, Debug, PartialEq)]
pub struct Doc<T> {
    key: DocumentKey,
    data: T,
}

impl<T> Doc<T> {
    pub fn new(key: DocumentKey, data: T) -> Self {
        Self { key, data }
    }

    pub fn id(&self) -> &str {
        self.key.id()
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn into_data(self) -> T {
        self.data
    }
}

impl<T: DeserializeOwned> Doc<T> {
    /// Decodes a raw document, reporting mismatched fields as an internal error.
    pub fn decode(raw: &RawDocument) -> StoreResult<Self> {
        let data = serde_json::from_value(Value::Object(raw.data.clone())).map_err(|err| {
            internal_error(format!("Failed to decode document {}: {err}", raw.key))
        })?;
        Ok(Self {
            key: raw.key.clone(),
            data,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One document's change between two consecutive query results.
///
/// `old_index` is the position in the previous result (absent for additions),
/// `new_index` the position in the new one (absent for removals). Removals
/// carry the removed document.
#[derive(Clone, Debug, PartialEq)]
pub struct RawChange {
    pub kind: ChangeKind,
    pub document: RawDocument,
    pub old_index: Option<usize>,
    pub new_index: Option<usize>,
}

/// A query result together with the changes since the previous result.
#[derive(Clone, Debug, PartialEq)]
pub struct QuerySnapshot {
    pub documents: Vec<RawDocument>,
    pub changes: Vec<RawChange>,
}

impl QuerySnapshot {
    pub(crate) fn diff(previous: Option<&[RawDocument]>, documents: Vec<RawDocument>) -> Self {
        let changes = compute_changes(previous, &documents);
        Self { documents, changes }
    }
}

/// Typed counterpart of [`RawChange`].
#[derive(Clone, Debug, PartialEq)]
pub struct DocChange<T> {
    pub kind: ChangeKind,
    pub doc: Doc<T>,
    pub old_index: Option<usize>,
    pub new_index: Option<usize>,
}

/// Subscription metadata delivered with every collection or query result.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryMeta<T> {
    pub changes: Vec<DocChange<T>>,
    pub size: usize,
    pub empty: bool,
}

impl<T: DeserializeOwned> QueryMeta<T> {
    pub(crate) fn decode(snapshot: &QuerySnapshot) -> StoreResult<Self> {
        let changes = snapshot
            .changes
            .iter()
            .map(|change| {
                Ok(DocChange {
                    kind: change.kind,
                    doc: Doc::decode(&change.document)?,
                    old_index: change.old_index,
                    new_index: change.new_index,
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(Self {
            changes,
            size: snapshot.documents.len(),
            empty: snapshot.documents.is_empty(),
        })
    }
}

/// Diffs two ordered results. Removals are listed first, then additions and
/// modifications in the order of `current`. Without a previous result every
/// document is an addition.
pub(crate) fn compute_changes(
    previous: Option<&[RawDocument]>,
    current: &[RawDocument],
) -> Vec<RawChange> {
    let previous = previous.unwrap_or_default();
    let old_positions: BTreeMap<&DocumentKey, usize> = previous
        .iter()
        .enumerate()
        .map(|(index, document)| (document.key(), index))
        .collect();
    let new_positions: BTreeMap<&DocumentKey, usize> = current
        .iter()
        .enumerate()
        .map(|(index, document)| (document.key(), index))
        .collect();

    let mut changes = Vec::new();
    for (index, document) in previous.iter().enumerate() {
        if !new_positions.contains_key(document.key()) {
            changes.push(RawChange {
                kind: ChangeKind::Removed,
                document: document.clone(),
                old_index: Some(index),
                new_index: None,
            });
        }
    }

    for (index, document) in current.iter().enumerate() {
        match old_positions.get(document.key()) {
            None => changes.push(RawChange {
                kind: ChangeKind::Added,
                document: document.clone(),
                old_index: None,
                new_index: Some(index),
            }),
            Some(&old_index) => {
                if previous[old_index].data() != document.data() || old_index != index {
                    changes.push(RawChange {
                        kind: ChangeKind::Modified,
                        document: document.clone(),
                        old_index: Some(old_index),
                        new_index: Some(index),
                    });
                }
            }
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Deserialize)]
    struct City {
        name: String,
    }

    fn raw(id: &str, fields: Value) -> RawDocument {
        RawDocument::new(
            DocumentKey::from_string(&format!("cities/{id}")).unwrap(),
            fields.as_object().cloned().unwrap(),
        )
    }

    #[test]
    fn decodes_typed_documents() {
        let doc = Doc::<City>::decode(&raw("sf", json!({"name": "San Francisco"}))).unwrap();
        assert_eq!(doc.id(), "sf");
        assert_eq!(doc.data().name, "San Francisco");

        let err = Doc::<City>::decode(&raw("sf", json!({"name": 4}))).unwrap_err();
        assert_eq!(err.code_str(), "docstore/internal");
    }

    #[test]
    fn first_result_is_all_additions() {
        let current = vec![raw("a", json!({})), raw("b", json!({}))];
        let changes = compute_changes(None, &current);
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|change| change.kind == ChangeKind::Added));
        assert_eq!(changes[1].new_index, Some(1));
    }

    #[test]
    fn reports_removals_with_the_removed_document() {
        let previous = vec![
            raw("a", json!({"name": "A"})),
            raw("b", json!({"name": "B"})),
        ];
        let current = vec![raw("b", json!({"name": "B2"})), raw("c", json!({"name": "C"}))];
        let changes = compute_changes(Some(&previous), &current);

        let kinds: Vec<_> = changes
            .iter()
            .map(|change| (change.kind, change.document.id().to_string()))
            .collect();
        assert_eq!(
            kinds,
            [
                (ChangeKind::Removed, "a".to_string()),
                (ChangeKind::Modified, "b".to_string()),
                (ChangeKind::Added, "c".to_string()),
            ]
        );
        assert_eq!(changes[0].document.data()["name"], json!("A"));
        assert_eq!((changes[1].old_index, changes[1].new_index), (Some(1), Some(0)));
    }

    #[test]
    fn unchanged_results_have_no_changes() {
        let documents = vec![raw("a", json!({"name": "A"}))];
        assert!(compute_changes(Some(&documents), &documents).is_empty());
    }

    #[test]
    fn meta_reports_size() {
        let snapshot = QuerySnapshot::diff(None, vec![raw("a", json!({"name": "A"}))]);
        let meta = QueryMeta::<City>::decode(&snapshot).unwrap();
        assert_eq!(meta.size, 1);
        assert!(!meta.empty);
        assert_eq!(meta.changes[0].doc.data().name, "A");
    }
}

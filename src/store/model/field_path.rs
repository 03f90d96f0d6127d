use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::store::error::{invalid_argument, StoreResult};

const DOCUMENT_ID_FIELD: &str = "__name__";

/// A dot-separated path into a document's fields.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn new<S, I>(segments: I) -> StoreResult<Self>
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() || segments.iter().any(String::is_empty) {
            return Err(invalid_argument(
                "FieldPath segments must be non-empty and there must be at least one",
            ));
        }
        Ok(Self { segments })
    }

    pub fn from_dot_separated(path: &str) -> StoreResult<Self> {
        if path.trim().is_empty() {
            return Err(invalid_argument("FieldPath string cannot be empty"));
        }
        FieldPath::new(path.split('.'))
    }

    /// Refers to the id of the document rather than to one of its fields.
    pub fn document_id() -> Self {
        Self {
            segments: vec![DOCUMENT_ID_FIELD.to_string()],
        }
    }

    pub fn is_document_id(&self) -> bool {
        self.segments.len() == 1 && self.segments[0] == DOCUMENT_ID_FIELD
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join(".")
    }

    /// Looks the path up in a document's fields.
    pub fn lookup<'a>(&self, fields: &'a Map<String, Value>) -> Option<&'a Value> {
        let (first, rest) = self.segments.split_first()?;
        let mut current = fields.get(first)?;
        for segment in rest {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Writes `value` at this path, creating intermediate maps as needed.
    pub fn assign(&self, fields: &mut Map<String, Value>, value: Value) {
        let (last, parents) = match self.segments.split_last() {
            Some(split) => split,
            None => return,
        };
        let mut current = fields;
        for segment in parents {
            let entry = current
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            current = match entry.as_object_mut() {
                Some(map) => map,
                None => return,
            };
        }
        current.insert(last.clone(), value);
    }
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical_string())
    }
}

/// Converts common user inputs into a validated [`FieldPath`].
pub trait IntoFieldPath {
    fn into_field_path(self) -> StoreResult<FieldPath>;
}

impl IntoFieldPath for FieldPath {
    fn into_field_path(self) -> StoreResult<FieldPath> {
        Ok(self)
    }
}

impl IntoFieldPath for &FieldPath {
    fn into_field_path(self) -> StoreResult<FieldPath> {
        Ok(self.clone())
    }
}

impl IntoFieldPath for String {
    fn into_field_path(self) -> StoreResult<FieldPath> {
        FieldPath::from_dot_separated(&self)
    }
}

impl IntoFieldPath for &str {
    fn into_field_path(self) -> StoreResult<FieldPath> {
        FieldPath::from_dot_separated(self)
    }
}

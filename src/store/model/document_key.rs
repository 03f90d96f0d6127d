use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::store::error::{invalid_argument, StoreResult};

use super::ResourcePath;

/// The path of a single document: an even, non-zero number of segments.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    pub fn from_path(path: ResourcePath) -> StoreResult<Self> {
        if path.is_empty() || path.is_collection() {
            return Err(invalid_argument(format!(
                "Document keys must point to a document (even number of segments), got '{path}'"
            )));
        }
        Ok(Self { path })
    }

    pub fn from_string(path: &str) -> StoreResult<Self> {
        Self::from_path(ResourcePath::from_string(path)?)
    }

    /// Builds the key of document `id` inside `collection`.
    pub fn in_collection(collection: &ResourcePath, id: &str) -> StoreResult<Self> {
        if id.is_empty() || id.contains('/') {
            return Err(invalid_argument(format!("Invalid document id '{id}'")));
        }
        Self::from_path(collection.child(id))
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_path(&self) -> ResourcePath {
        self.path.without_last()
    }

    pub fn id(&self) -> &str {
        // Construction guarantees at least two segments.
        self.path.last_segment().unwrap_or_default()
    }
}

impl Display for DocumentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.path, f)
    }
}

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::store::error::{invalid_argument, StoreResult};

/// A slash-separated path to a collection or a document.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Parses `rooms/eros/messages`. Leading and trailing slashes are ignored;
    /// empty inner segments are rejected.
    pub fn from_string(path: &str) -> StoreResult<Self> {
        let trimmed = path.trim().trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        if trimmed.split('/').any(str::is_empty) {
            return Err(invalid_argument(format!(
                "Found empty segment in resource path '{path}'"
            )));
        }
        Ok(Self::from_segments(trimmed.split('/')))
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn child<S: Into<String>>(&self, segment: S) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    pub fn without_last(&self) -> Self {
        let mut segments = self.segments.clone();
        segments.pop();
        Self { segments }
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Whether the path names a collection (odd number of segments).
    pub fn is_collection(&self) -> bool {
        self.segments.len() % 2 == 1
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join("/")
    }
}

impl Display for ResourcePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical_string())
    }
}

impl From<ResourcePath> for String {
    fn from(value: ResourcePath) -> Self {
        value.canonical_string()
    }
}

impl TryFrom<String> for ResourcePath {
    type Error = crate::store::error::StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ResourcePath::from_string(&value)
    }
}

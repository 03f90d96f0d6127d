use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Describes the read operation that produced a subscription future.
///
/// The subscription core never interprets the descriptor; it is carried for
/// introspection and for assertions in tests.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RequestDescriptor {
    /// A single document read.
    Get { path: String },
    /// A read of several documents from one collection, in id order.
    Many { collection: String, ids: Vec<String> },
    /// A scan of every document in a collection.
    All { collection: String },
    /// A filtered collection read. `query` holds the serialized query.
    Query { collection: String, query: Value },
    /// Anything else a collaborator wants to describe.
    Custom { name: String, details: Value },
}

impl RequestDescriptor {
    /// Convenience constructor for [`RequestDescriptor::Custom`].
    pub fn custom(name: impl Into<String>, details: Value) -> Self {
        RequestDescriptor::Custom {
            name: name.into(),
            details,
        }
    }

    /// Returns the tag used when the descriptor is serialized.
    pub fn kind(&self) -> &'static str {
        match self {
            RequestDescriptor::Get { .. } => "get",
            RequestDescriptor::Many { .. } => "many",
            RequestDescriptor::All { .. } => "all",
            RequestDescriptor::Query { .. } => "query",
            RequestDescriptor::Custom { .. } => "custom",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_with_kind_tag() {
        let descriptor = RequestDescriptor::Many {
            collection: "users".into(),
            ids: vec!["a".into(), "b".into()],
        };
        let encoded = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(
            encoded,
            json!({"kind": "many", "collection": "users", "ids": ["a", "b"]})
        );
        assert_eq!(descriptor.kind(), "many");
    }

    #[test]
    fn custom_descriptor_carries_details() {
        let descriptor = RequestDescriptor::custom("count", json!({"collection": "posts"}));
        assert_eq!(descriptor.kind(), "custom");
        let decoded: RequestDescriptor =
            serde_json::from_value(serde_json::to_value(&descriptor).unwrap()).unwrap();
        assert_eq!(decoded, descriptor);
    }
}

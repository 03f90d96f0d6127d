use std::cmp::Ordering;

use serde_json::Value;

use crate::store::model::FieldPath;
use crate::store::query::{Bound, FieldFilter, FilterOperator, LimitType, OrderBy, OrderDirection, Query};
use crate::store::snapshot::RawDocument;

/// Filters, orders, bounds and limits `documents` according to `query`.
///
/// Documents outside the query's collection are dropped. Ties on the explicit
/// order-by fields are broken by document key.
pub(crate) fn apply_query(documents: Vec<RawDocument>, query: &Query) -> Vec<RawDocument> {
    let mut matched: Vec<RawDocument> = documents
        .into_iter()
        .filter(|document| &document.key().collection_path() == query.collection())
        .filter(|document| satisfies_filters(document, query.filters()))
        .collect();

    matched.sort_by(|left, right| {
        compare_documents(left, right, query.order_by_fields())
            .then_with(|| left.key().cmp(right.key()))
    });

    if let Some(bound) = query.start_bound() {
        matched.retain(|document| !is_before_start(document, bound, query.order_by_fields()));
    }
    if let Some(bound) = query.end_bound() {
        matched.retain(|document| !is_after_end(document, bound, query.order_by_fields()));
    }

    if let Some(limit) = query.limit_value() {
        let limit = limit as usize;
        if matched.len() > limit {
            match query.limit_type() {
                LimitType::First => matched.truncate(limit),
                LimitType::Last => {
                    let start = matched.len() - limit;
                    matched.drain(0..start);
                }
            }
        }
    }

    matched
}

fn satisfies_filters(document: &RawDocument, filters: &[FieldFilter]) -> bool {
    filters.iter().all(|filter| match field_value(document, &filter.field) {
        Some(value) => evaluate_filter(filter, &value),
        None => filter.op == FilterOperator::NotEqual && !filter.value.is_null(),
    })
}

fn evaluate_filter(filter: &FieldFilter, value: &Value) -> bool {
    let expected = &filter.value;
    match filter.op {
        FilterOperator::Equal => values_equal(value, expected),
        FilterOperator::NotEqual => !values_equal(value, expected),
        FilterOperator::LessThan => compare_values(value, expected) == Some(Ordering::Less),
        FilterOperator::LessThanOrEqual => matches!(
            compare_values(value, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        FilterOperator::GreaterThan => compare_values(value, expected) == Some(Ordering::Greater),
        FilterOperator::GreaterThanOrEqual => matches!(
            compare_values(value, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FilterOperator::ArrayContains => value
            .as_array()
            .is_some_and(|items| items.iter().any(|item| values_equal(item, expected))),
        FilterOperator::ArrayContainsAny => match (value.as_array(), expected.as_array()) {
            (Some(items), Some(needles)) => needles
                .iter()
                .any(|needle| items.iter().any(|item| values_equal(item, needle))),
            _ => false,
        },
        FilterOperator::In => expected
            .as_array()
            .is_some_and(|needles| needles.iter().any(|needle| values_equal(value, needle))),
        FilterOperator::NotIn => {
            !value.is_null()
                && expected
                    .as_array()
                    .is_some_and(|needles| needles.iter().all(|needle| !values_equal(value, needle)))
        }
    }
}

fn field_value(document: &RawDocument, field: &FieldPath) -> Option<Value> {
    if field.is_document_id() {
        return Some(Value::String(document.id().to_string()));
    }
    field.lookup(document.data()).cloned()
}

/// Numbers compare by value, so `1` and `1.0` are equal.
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(_), Value::Number(_)) => compare_values(left, right) == Some(Ordering::Equal),
        _ => left == right,
    }
}

fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn type_order(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order used for sorting: values of different types order by type.
fn sort_values(left: &Value, right: &Value) -> Ordering {
    compare_values(left, right)
        .unwrap_or_else(|| type_order(left).cmp(&type_order(right)))
}

fn compare_documents(left: &RawDocument, right: &RawDocument, order_by: &[OrderBy]) -> Ordering {
    for order in order_by {
        let left_value = field_value(left, &order.field).unwrap_or(Value::Null);
        let right_value = field_value(right, &order.field).unwrap_or(Value::Null);
        let mut ordering = sort_values(&left_value, &right_value);
        if order.direction == OrderDirection::Desc {
            ordering = ordering.reverse();
        }
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn compare_to_bound(document: &RawDocument, bound: &Bound, order_by: &[OrderBy]) -> Ordering {
    for (order, bound_value) in order_by.iter().zip(&bound.values) {
        let value = field_value(document, &order.field).unwrap_or(Value::Null);
        let mut ordering = sort_values(&value, bound_value);
        if order.direction == OrderDirection::Desc {
            ordering = ordering.reverse();
        }
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn is_before_start(document: &RawDocument, bound: &Bound, order_by: &[OrderBy]) -> bool {
    let ordering = compare_to_bound(document, bound, order_by);
    if bound.inclusive {
        ordering == Ordering::Less
    } else {
        ordering != Ordering::Greater
    }
}

fn is_after_end(document: &RawDocument, bound: &Bound, order_by: &[OrderBy]) -> bool {
    let ordering = compare_to_bound(document, bound, order_by);
    if bound.inclusive {
        ordering == Ordering::Greater
    } else {
        ordering != Ordering::Less
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::{DocumentKey, ResourcePath};
    use serde_json::json;

    fn cities() -> Query {
        Query::new(ResourcePath::from_string("cities").unwrap()).unwrap()
    }

    fn city(id: &str, fields: Value) -> RawDocument {
        let key = DocumentKey::from_string(&format!("cities/{id}")).unwrap();
        RawDocument::new(key, fields.as_object().cloned().unwrap())
    }

    fn fixtures() -> Vec<RawDocument> {
        vec![
            city("sf", json!({"population": 100, "tags": ["coast"], "state": "CA"})),
            city("nyc", json!({"population": 50.0, "tags": ["east"], "state": "NY"})),
            city("la", json!({"population": 75, "tags": ["coast", "south"], "state": "CA"})),
            city("ghost", json!({"state": "NV"})),
        ]
    }

    fn ids(documents: &[RawDocument]) -> Vec<&str> {
        documents.iter().map(RawDocument::id).collect()
    }

    #[test]
    fn applies_limit_and_ordering() {
        let query = cities()
            .order_by("population", OrderDirection::Asc)
            .unwrap()
            .limit(3)
            .unwrap();
        let result = apply_query(fixtures(), &query);
        assert_eq!(ids(&result), ["ghost", "nyc", "la"]);
    }

    #[test]
    fn limit_to_last_keeps_tail() {
        let query = cities()
            .order_by("population", OrderDirection::Asc)
            .unwrap()
            .limit_to_last(2)
            .unwrap();
        assert_eq!(ids(&apply_query(fixtures(), &query)), ["la", "sf"]);
    }

    #[test]
    fn filters_mixed_numbers_and_missing_fields() {
        let query = cities()
            .where_field("population", FilterOperator::GreaterThanOrEqual, 75)
            .unwrap();
        assert_eq!(ids(&apply_query(fixtures(), &query)), ["la", "sf"]);

        let query = cities()
            .where_field("population", FilterOperator::NotEqual, 50)
            .unwrap();
        assert_eq!(ids(&apply_query(fixtures(), &query)), ["ghost", "la", "sf"]);
    }

    #[test]
    fn array_and_membership_filters() {
        let coast = cities()
            .where_field("tags", FilterOperator::ArrayContains, "coast")
            .unwrap();
        assert_eq!(ids(&apply_query(fixtures(), &coast)), ["la", "sf"]);

        let states = cities()
            .where_field("state", FilterOperator::NotIn, json!(["CA"]))
            .unwrap();
        assert_eq!(ids(&apply_query(fixtures(), &states)), ["ghost", "nyc"]);

        let any = cities()
            .where_field("tags", FilterOperator::ArrayContainsAny, json!(["east", "south"]))
            .unwrap();
        assert_eq!(ids(&apply_query(fixtures(), &any)), ["la", "nyc"]);
    }

    #[test]
    fn cursors_bound_results() {
        let query = cities()
            .order_by("population", OrderDirection::Desc)
            .unwrap()
            .start_after(vec![json!(100)])
            .unwrap()
            .end_at(vec![json!(50)])
            .unwrap();
        assert_eq!(ids(&apply_query(fixtures(), &query)), ["la", "nyc"]);
    }

    #[test]
    fn drops_documents_from_other_collections() {
        let mut documents = fixtures();
        documents.push(RawDocument::new(
            DocumentKey::from_string("towns/sf").unwrap(),
            Default::default(),
        ));
        assert_eq!(apply_query(documents, &cities()).len(), 4);
    }

    #[test]
    fn document_id_filter() {
        let query = cities()
            .where_field(FieldPath::document_id(), FilterOperator::Equal, "la")
            .unwrap();
        assert_eq!(ids(&apply_query(fixtures(), &query)), ["la"]);
    }
}

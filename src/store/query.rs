use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::error::{invalid_argument, StoreResult};
use crate::store::model::{FieldPath, IntoFieldPath, ResourcePath};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOperator {
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "<=")]
    LessThanOrEqual,
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = ">=")]
    GreaterThanOrEqual,
    #[serde(rename = "array-contains")]
    ArrayContains,
    #[serde(rename = "array-contains-any")]
    ArrayContainsAny,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not-in")]
    NotIn,
}

impl FilterOperator {
    fn requires_array(self) -> bool {
        matches!(
            self,
            FilterOperator::ArrayContainsAny | FilterOperator::In | FilterOperator::NotIn
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitType {
    #[default]
    First,
    Last,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: FieldPath,
    pub op: FilterOperator,
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: FieldPath,
    pub direction: OrderDirection,
}

/// A cursor position expressed as values of the query's order-by fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub values: Vec<Value>,
    pub inclusive: bool,
}

/// A filtered, ordered and bounded read of one collection.
///
/// Built by chaining constraint methods:
///
/// ```
/// use typed_docstore::store::{FilterOperator, OrderDirection, Query, ResourcePath};
///
/// let query = Query::new(ResourcePath::from_string("users").unwrap())
///     .unwrap()
///     .where_field("age", FilterOperator::GreaterThanOrEqual, 18)
///     .unwrap()
///     .order_by("age", OrderDirection::Desc)
///     .unwrap()
///     .limit(10)
///     .unwrap();
/// assert_eq!(query.filters().len(), 1);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    collection: ResourcePath,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    filters: Vec<FieldFilter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    order_by: Vec<OrderBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    limit: Option<u32>,
    #[serde(default)]
    limit_type: LimitType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start_at: Option<Bound>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    end_at: Option<Bound>,
}

impl Query {
    pub fn new(collection: ResourcePath) -> StoreResult<Self> {
        if !collection.is_collection() {
            return Err(invalid_argument(
                "Queries must reference a collection (odd number of path segments)",
            ));
        }
        Ok(Self {
            collection,
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        })
    }

    pub fn collection(&self) -> &ResourcePath {
        &self.collection
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn order_by_fields(&self) -> &[OrderBy] {
        &self.order_by
    }

    pub fn limit_value(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn start_bound(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_bound(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn where_field(
        mut self,
        field: impl IntoFieldPath,
        op: FilterOperator,
        value: impl Into<Value>,
    ) -> StoreResult<Self> {
        let field = field.into_field_path()?;
        let value = value.into();
        if op.requires_array() && !value.is_array() {
            return Err(invalid_argument(format!(
                "Filter on '{field}' requires an array value"
            )));
        }
        self.filters.push(FieldFilter { field, op, value });
        Ok(self)
    }

    pub fn order_by(
        mut self,
        field: impl IntoFieldPath,
        direction: OrderDirection,
    ) -> StoreResult<Self> {
        if self.start_at.is_some() || self.end_at.is_some() {
            return Err(invalid_argument(
                "order_by must be applied before cursor bounds",
            ));
        }
        self.order_by.push(OrderBy {
            field: field.into_field_path()?,
            direction,
        });
        Ok(self)
    }

    pub fn limit(self, limit: u32) -> StoreResult<Self> {
        self.with_limit(limit, LimitType::First)
    }

    /// Keeps the last `limit` results. Requires at least one order-by clause.
    pub fn limit_to_last(self, limit: u32) -> StoreResult<Self> {
        if self.order_by.is_empty() {
            return Err(invalid_argument(
                "limit_to_last requires at least one order_by clause",
            ));
        }
        self.with_limit(limit, LimitType::Last)
    }

    fn with_limit(mut self, limit: u32, limit_type: LimitType) -> StoreResult<Self> {
        if limit == 0 {
            return Err(invalid_argument("Query limit must be greater than zero"));
        }
        self.limit = Some(limit);
        self.limit_type = limit_type;
        Ok(self)
    }

    pub fn start_at(self, values: Vec<Value>) -> StoreResult<Self> {
        self.with_start(values, true)
    }

    pub fn start_after(self, values: Vec<Value>) -> StoreResult<Self> {
        self.with_start(values, false)
    }

    pub fn end_at(self, values: Vec<Value>) -> StoreResult<Self> {
        self.with_end(values, true)
    }

    pub fn end_before(self, values: Vec<Value>) -> StoreResult<Self> {
        self.with_end(values, false)
    }

    fn with_start(mut self, values: Vec<Value>, inclusive: bool) -> StoreResult<Self> {
        self.start_at = Some(self.bound(values, inclusive)?);
        Ok(self)
    }

    fn with_end(mut self, values: Vec<Value>, inclusive: bool) -> StoreResult<Self> {
        self.end_at = Some(self.bound(values, inclusive)?);
        Ok(self)
    }

    fn bound(&self, values: Vec<Value>, inclusive: bool) -> StoreResult<Bound> {
        if values.is_empty() || values.len() > self.order_by.len() {
            return Err(invalid_argument(
                "Cursor values must match the query's order_by clauses",
            ));
        }
        Ok(Bound { values, inclusive })
    }
}

//! Query options for the base repository: filters, sorting, pagination, and
//! the SQL fragments they render to.
//!
//! Column names are resolved against the entity's whitelist before anything is
//! pushed into the SQL text; every value is a bound parameter.

use crate::error::{BillingError, BillingResult};
use crate::models::{PaymentProvider, PaymentStatus, PromoCodeType, SubscriptionTier};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

pub const MAX_PAGE_SIZE: u32 = 100;

/// A value that can be bound into a dynamically built statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int32(i32),
    BigInt(i64),
    Text(String),
    Decimal(Decimal),
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
    Json(serde_json::Value),
    TextArray(Vec<String>),
    /// Only meaningful for `In`, `NotIn` and `Between`.
    List(Vec<SqlValue>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

macro_rules! sql_value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for SqlValue {
                fn from(value: $ty) -> Self {
                    SqlValue::$variant(value)
                }
            }
        )*
    };
}

sql_value_from!(
    bool => Bool,
    i32 => Int32,
    i64 => BigInt,
    String => Text,
    Decimal => Decimal,
    DateTime<Utc> => Timestamp,
    Uuid => Uuid,
    serde_json::Value => Json,
    Vec<String> => TextArray,
);

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

impl From<SubscriptionTier> for SqlValue {
    fn from(value: SubscriptionTier) -> Self {
        SqlValue::Text(value.as_str().to_string())
    }
}

impl From<PaymentStatus> for SqlValue {
    fn from(value: PaymentStatus) -> Self {
        SqlValue::Text(value.as_str().to_string())
    }
}

impl From<PaymentProvider> for SqlValue {
    fn from(value: PaymentProvider) -> Self {
        SqlValue::Text(value.as_str().to_string())
    }
}

impl From<PromoCodeType> for SqlValue {
    fn from(value: PromoCodeType) -> Self {
        SqlValue::Text(value.as_str().to_string())
    }
}

/// Column assignments for inserts and partial updates, and equality criteria
/// for `find_one` / `find_many`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fields(Vec<(String, SqlValue)>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.0.push((column.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.0.iter().map(|(c, v)| (c.as_str(), v))
    }

    /// Equality criteria as filters; list values mean set membership.
    pub fn into_filters(self) -> Vec<FilterNode> {
        self.0
            .into_iter()
            .map(|(field, value)| {
                let operator = match value {
                    SqlValue::List(_) => FilterOperator::In,
                    _ => FilterOperator::Eq,
                };
                FilterNode::Filter(Filter {
                    field,
                    operator,
                    value,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Like,
    ILike,
    IsNull,
    Between,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub operator: FilterOperator,
    pub value: SqlValue,
}

impl Filter {
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: impl Into<SqlValue>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        Self::new(field, FilterOperator::Eq, value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOperator {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterGroup {
    pub operator: LogicalOperator,
    pub filters: Vec<FilterNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterNode {
    Filter(Filter),
    Group(FilterGroup),
}

impl From<Filter> for FilterNode {
    fn from(filter: Filter) -> Self {
        FilterNode::Filter(filter)
    }
}

impl From<FilterGroup> for FilterNode {
    fn from(group: FilterGroup) -> Self {
        FilterNode::Group(group)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortBy {
    pub field: String,
    pub direction: SortDirection,
}

impl SortBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Filters (ANDed at the top level), ordering, row cap and row locking for a select.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    pub filters: Vec<FilterNode>,
    pub sort: Vec<SortBy>,
    /// Ignored by `get_page`, which applies its own limit.
    pub limit: Option<u32>,
    pub lock_for_update: bool,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: impl Into<FilterNode>) -> Self {
        self.filters.push(filter.into());
        self
    }

    pub fn sort(mut self, sort: SortBy) -> Self {
        self.sort.push(sort);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn for_update(mut self) -> Self {
        self.lock_for_update = true;
        self
    }
}

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub size: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { page: 1, size: 20 }
    }
}

impl Pagination {
    pub fn new(page: u32, size: u32) -> BillingResult<Self> {
        if page < 1 {
            return Err(BillingError::validation("page must be at least 1"));
        }
        if size < 1 || size > MAX_PAGE_SIZE {
            return Err(BillingError::validation(format!(
                "page size must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        Ok(Self { page, size })
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page.saturating_sub(1)) * i64::from(self.size)
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.size)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub size: u32,
    pub pages: u32,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, pagination: Pagination) -> Self {
        let size = u64::from(pagination.size.max(1));
        let pages = u64::try_from(total).unwrap_or(0).div_ceil(size);
        let pages = u32::try_from(pages).unwrap_or(u32::MAX);
        Self {
            items,
            total,
            page: pagination.page,
            size: pagination.size,
            pages,
        }
    }

    pub fn has_next(&self) -> bool {
        self.page < self.pages
    }

    pub fn has_previous(&self) -> bool {
        self.page > 1
    }
}

// -------------------------------------------------------------------------
// SQL rendering
// -------------------------------------------------------------------------

/// Resolve a caller-supplied column name to the whitelisted static name.
pub(crate) fn resolve_column(
    entity: &str,
    columns: &'static [&'static str],
    field: &str,
) -> BillingResult<&'static str> {
    columns
        .iter()
        .copied()
        .find(|c| *c == field)
        .ok_or_else(|| BillingError::Validation {
            message: format!("Unknown field '{}' for {}", field, entity),
            details: None,
        })
}

pub(crate) fn push_value(qb: &mut QueryBuilder<'_, Postgres>, value: &SqlValue) -> BillingResult<()> {
    match value.clone() {
        SqlValue::Null => {
            qb.push("NULL");
        }
        SqlValue::Bool(v) => {
            qb.push_bind(v);
        }
        SqlValue::Int32(v) => {
            qb.push_bind(v);
        }
        SqlValue::BigInt(v) => {
            qb.push_bind(v);
        }
        SqlValue::Text(v) => {
            qb.push_bind(v);
        }
        SqlValue::Decimal(v) => {
            qb.push_bind(v);
        }
        SqlValue::Timestamp(v) => {
            qb.push_bind(v);
        }
        SqlValue::Uuid(v) => {
            qb.push_bind(v);
        }
        SqlValue::Json(v) => {
            qb.push_bind(v);
        }
        SqlValue::TextArray(v) => {
            qb.push_bind(v);
        }
        SqlValue::List(_) => {
            return Err(BillingError::validation(
                "List values are only allowed with IN, NOT IN and BETWEEN",
            ))
        }
    }
    Ok(())
}

/// Bind a value onto a raw statement. Nulls are sent as untyped text; raw SQL
/// should cast where the column type matters.
pub(crate) fn bind_value(
    query: Query<'_, Postgres, PgArguments>,
    value: SqlValue,
) -> BillingResult<Query<'_, Postgres, PgArguments>> {
    let query = match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Bool(v) => query.bind(v),
        SqlValue::Int32(v) => query.bind(v),
        SqlValue::BigInt(v) => query.bind(v),
        SqlValue::Text(v) => query.bind(v),
        SqlValue::Decimal(v) => query.bind(v),
        SqlValue::Timestamp(v) => query.bind(v),
        SqlValue::Uuid(v) => query.bind(v),
        SqlValue::Json(v) => query.bind(v),
        SqlValue::TextArray(v) => query.bind(v),
        SqlValue::List(_) => {
            return Err(BillingError::validation(
                "List values cannot be bound to a raw statement",
            ))
        }
    };
    Ok(query)
}

fn comparison(operator: FilterOperator) -> Option<&'static str> {
    match operator {
        FilterOperator::Eq => Some(" = "),
        FilterOperator::Ne => Some(" <> "),
        FilterOperator::Gt => Some(" > "),
        FilterOperator::Gte => Some(" >= "),
        FilterOperator::Lt => Some(" < "),
        FilterOperator::Lte => Some(" <= "),
        _ => None,
    }
}

fn push_filter(
    qb: &mut QueryBuilder<'_, Postgres>,
    entity: &str,
    columns: &'static [&'static str],
    filter: &Filter,
) -> BillingResult<()> {
    let column = resolve_column(entity, columns, &filter.field)?;

    if let Some(op) = comparison(filter.operator) {
        match (filter.operator, &filter.value) {
            (FilterOperator::Eq, SqlValue::Null) => {
                qb.push(column).push(" IS NULL");
            }
            (FilterOperator::Ne, SqlValue::Null) => {
                qb.push(column).push(" IS NOT NULL");
            }
            (_, value) => {
                qb.push(column).push(op);
                push_value(qb, value)?;
            }
        }
        return Ok(());
    }

    match (filter.operator, &filter.value) {
        (FilterOperator::In, SqlValue::List(items)) | (FilterOperator::NotIn, SqlValue::List(items)) => {
            if items.is_empty() {
                // IN () is not valid SQL
                qb.push(if filter.operator == FilterOperator::In {
                    "FALSE"
                } else {
                    "TRUE"
                });
                return Ok(());
            }
            qb.push(column);
            qb.push(if filter.operator == FilterOperator::In {
                " IN ("
            } else {
                " NOT IN ("
            });
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    qb.push(", ");
                }
                push_value(qb, item)?;
            }
            qb.push(")");
        }
        (FilterOperator::Like, SqlValue::Text(pattern))
        | (FilterOperator::ILike, SqlValue::Text(pattern)) => {
            qb.push(column);
            qb.push(if filter.operator == FilterOperator::Like {
                " LIKE "
            } else {
                " ILIKE "
            });
            qb.push_bind(format!("%{}%", pattern));
        }
        (FilterOperator::IsNull, SqlValue::Bool(is_null)) => {
            qb.push(column);
            qb.push(if *is_null { " IS NULL" } else { " IS NOT NULL" });
        }
        (FilterOperator::Between, SqlValue::List(bounds)) if bounds.len() == 2 => {
            qb.push(column).push(" BETWEEN ");
            push_value(qb, &bounds[0])?;
            qb.push(" AND ");
            push_value(qb, &bounds[1])?;
        }
        (operator, value) => {
            return Err(BillingError::Validation {
                message: format!("Invalid value for {:?} filter on '{}'", operator, column),
                details: Some(format!("{:?}", value)),
            })
        }
    }
    Ok(())
}

fn push_node(
    qb: &mut QueryBuilder<'_, Postgres>,
    entity: &str,
    columns: &'static [&'static str],
    node: &FilterNode,
) -> BillingResult<()> {
    match node {
        FilterNode::Filter(filter) => push_filter(qb, entity, columns, filter),
        FilterNode::Group(group) => {
            if group.filters.is_empty() {
                qb.push(match group.operator {
                    LogicalOperator::And => "TRUE",
                    LogicalOperator::Or => "FALSE",
                });
                return Ok(());
            }
            let joiner = match group.operator {
                LogicalOperator::And => " AND ",
                LogicalOperator::Or => " OR ",
            };
            qb.push("(");
            for (i, child) in group.filters.iter().enumerate() {
                if i > 0 {
                    qb.push(joiner);
                }
                push_node(qb, entity, columns, child)?;
            }
            qb.push(")");
            Ok(())
        }
    }
}

/// Append ` WHERE ...` for the given filters, if any.
pub(crate) fn push_where(
    qb: &mut QueryBuilder<'_, Postgres>,
    entity: &str,
    columns: &'static [&'static str],
    filters: &[FilterNode],
) -> BillingResult<()> {
    if filters.is_empty() {
        return Ok(());
    }
    qb.push(" WHERE ");
    for (i, node) in filters.iter().enumerate() {
        if i > 0 {
            qb.push(" AND ");
        }
        push_node(qb, entity, columns, node)?;
    }
    Ok(())
}

/// Append ` ORDER BY ...`.
pub(crate) fn push_order_by(
    qb: &mut QueryBuilder<'_, Postgres>,
    entity: &str,
    columns: &'static [&'static str],
    sort: &[SortBy],
) -> BillingResult<()> {
    if sort.is_empty() {
        return Ok(());
    }
    qb.push(" ORDER BY ");
    for (i, s) in sort.iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        let column = resolve_column(entity, columns, &s.field)?;
        qb.push(column);
        qb.push(match s.direction {
            SortDirection::Asc => " ASC",
            SortDirection::Desc => " DESC",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLUMNS: &[&str] = &["id", "user_id", "status", "amount", "paid_at", "error_message"];

    fn where_sql(filters: &[FilterNode]) -> BillingResult<String> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT id FROM payments");
        push_where(&mut qb, "Payment", COLUMNS, filters)?;
        Ok(qb.sql().to_string())
    }

    #[test]
    fn equality_filters_are_bound() {
        let sql = where_sql(&[
            Filter::eq("user_id", 7i64).into(),
            Filter::eq("status", PaymentStatus::Succeeded).into(),
        ])
        .unwrap();
        assert_eq!(
            sql,
            "SELECT id FROM payments WHERE user_id = $1 AND status = $2"
        );
    }

    #[test]
    fn null_equality_uses_is_null() {
        let sql = where_sql(&[
            Filter::eq("paid_at", SqlValue::Null).into(),
            Filter::new("error_message", FilterOperator::Ne, SqlValue::Null).into(),
        ])
        .unwrap();
        assert!(sql.ends_with("WHERE paid_at IS NULL AND error_message IS NOT NULL"));
    }

    #[test]
    fn groups_nest_with_parentheses() {
        let group = FilterGroup {
            operator: LogicalOperator::Or,
            filters: vec![
                Filter::eq("status", "failed").into(),
                Filter::eq("status", "cancelled").into(),
            ],
        };
        let sql = where_sql(&[Filter::eq("user_id", 1i64).into(), group.into()]).unwrap();
        assert!(sql.ends_with("WHERE user_id = $1 AND (status = $2 OR status = $3)"));
    }

    #[test]
    fn in_and_between_expand_lists() {
        let sql = where_sql(&[
            Filter::new(
                "status",
                FilterOperator::In,
                SqlValue::List(vec!["pending".into(), "processing".into()]),
            )
            .into(),
            Filter::new(
                "amount",
                FilterOperator::Between,
                SqlValue::List(vec![Decimal::from(100).into(), Decimal::from(500).into()]),
            )
            .into(),
        ])
        .unwrap();
        assert!(sql.ends_with("WHERE status IN ($1, $2) AND amount BETWEEN $3 AND $4"));
    }

    #[test]
    fn empty_in_list_matches_nothing() {
        let sql = where_sql(&[Filter::new("id", FilterOperator::In, SqlValue::List(vec![])).into()])
            .unwrap();
        assert!(sql.ends_with("WHERE FALSE"));
    }

    #[test]
    fn like_and_null_checks() {
        let sql = where_sql(&[
            Filter::new("error_message", FilterOperator::ILike, "declined").into(),
            Filter::new("paid_at", FilterOperator::IsNull, false).into(),
        ])
        .unwrap();
        assert!(sql.ends_with("WHERE error_message ILIKE $1 AND paid_at IS NOT NULL"));
    }

    #[test]
    fn unknown_columns_never_reach_sql() {
        let err = where_sql(&[Filter::eq("id; DROP TABLE payments", 1i64).into()]).unwrap_err();
        assert!(matches!(err, BillingError::Validation { .. }));
    }

    #[test]
    fn malformed_between_is_rejected() {
        let err = where_sql(&[Filter::new(
            "amount",
            FilterOperator::Between,
            SqlValue::List(vec![Decimal::ONE.into()]),
        )
        .into()])
        .unwrap_err();
        assert!(matches!(err, BillingError::Validation { .. }));
    }

    #[test]
    fn order_by_resolves_columns() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT id FROM payments");
        push_order_by(
            &mut qb,
            "Payment",
            COLUMNS,
            &[SortBy::desc("paid_at"), SortBy::asc("id")],
        )
        .unwrap();
        assert_eq!(qb.sql(), "SELECT id FROM payments ORDER BY paid_at DESC, id ASC");

        let mut qb = QueryBuilder::<Postgres>::new("SELECT id FROM payments");
        assert!(push_order_by(&mut qb, "Payment", COLUMNS, &[SortBy::asc("random()")]).is_err());
    }

    #[test]
    fn fields_become_equality_or_membership_filters() {
        let filters = Fields::new()
            .set("user_id", 7i64)
            .set("status", SqlValue::List(vec!["failed".into()]))
            .into_filters();
        assert!(matches!(
            &filters[1],
            FilterNode::Filter(Filter { operator: FilterOperator::In, .. })
        ));
    }

    #[test]
    fn pagination_bounds() {
        assert!(Pagination::new(0, 10).is_err());
        assert!(Pagination::new(1, 0).is_err());
        assert!(Pagination::new(1, MAX_PAGE_SIZE + 1).is_err());
        let p = Pagination::new(3, 25).unwrap();
        assert_eq!(p.offset(), 50);
        assert_eq!(p.limit(), 25);
    }

    #[test]
    fn page_math() {
        let page = Page::new(vec![1, 2, 3], 23, Pagination::new(2, 10).unwrap());
        assert_eq!(page.pages, 3);
        assert!(page.has_next());
        assert!(page.has_previous());

        let last = Page::new(vec![1], 21, Pagination::new(3, 10).unwrap());
        assert!(!last.has_next());

        let empty: Page<i32> = Page::new(vec![], 0, Pagination::default());
        assert_eq!(empty.pages, 0);
        assert!(!empty.has_next());
        assert!(!empty.has_previous());
    }

    #[test]
    fn page_count_saturates_for_huge_totals() {
        let huge: Page<i32> = Page::new(vec![], i64::MAX, Pagination::new(1, 1).unwrap());
        assert_eq!(huge.pages, u32::MAX);

        let negative: Page<i32> = Page::new(vec![], -5, Pagination::default());
        assert_eq!(negative.pages, 0);
    }

    #[test]
    fn optional_values_become_null() {
        assert_eq!(SqlValue::from(None::<i64>), SqlValue::Null);
        assert_eq!(SqlValue::from(Some(5i32)), SqlValue::Int32(5));
    }
}

//! Filter and sort vocabulary shared by the query, view and listing builders
//!
//! Filters arrive on the wire as `{field, operator, value?}` and are parsed into
//! an exhaustive [`FilterCondition`] so every operator is matched explicitly.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProvisionError, Result};
use crate::sql::sanitize::escape_identifier;
use crate::types::TableDefinition;

/// Soft-delete predicate appended to every read
pub const NOT_DELETED: &str = "deleted_at IS NULL";

const JSONB_CAST: &str = "JSONB";

/// Comparison operator names as they appear on the wire
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    In,
    IsNull,
    IsNotNull,
}

/// A filter operator together with its operand
#[derive(Debug, Clone, PartialEq)]
pub enum FilterCondition {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    Like(String),
    In(Vec<Value>),
    IsNull,
    IsNotNull,
}

impl FilterCondition {
    pub fn operator(&self) -> FilterOperator {
        match self {
            FilterCondition::Eq(_) => FilterOperator::Eq,
            FilterCondition::Ne(_) => FilterOperator::Ne,
            FilterCondition::Gt(_) => FilterOperator::Gt,
            FilterCondition::Gte(_) => FilterOperator::Gte,
            FilterCondition::Lt(_) => FilterOperator::Lt,
            FilterCondition::Lte(_) => FilterOperator::Lte,
            FilterCondition::Like(_) => FilterOperator::Like,
            FilterCondition::In(_) => FilterOperator::In,
            FilterCondition::IsNull => FilterOperator::IsNull,
            FilterCondition::IsNotNull => FilterOperator::IsNotNull,
        }
    }

    fn operand(&self) -> Option<Value> {
        match self {
            FilterCondition::Eq(v)
            | FilterCondition::Ne(v)
            | FilterCondition::Gt(v)
            | FilterCondition::Gte(v)
            | FilterCondition::Lt(v)
            | FilterCondition::Lte(v) => Some(v.clone()),
            FilterCondition::Like(pattern) => Some(Value::String(pattern.clone())),
            FilterCondition::In(values) => Some(Value::Array(values.clone())),
            FilterCondition::IsNull | FilterCondition::IsNotNull => None,
        }
    }
}

/// One filter over a table column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawFilter", into = "RawFilter")]
pub struct Filter {
    pub field: String,
    pub condition: FilterCondition,
}

/// Wire form of [`Filter`]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawFilter {
    field: String,
    operator: FilterOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
}

impl TryFrom<RawFilter> for Filter {
    type Error = String;

    fn try_from(raw: RawFilter) -> std::result::Result<Self, Self::Error> {
        let value = raw.value.unwrap_or(Value::Null);
        let condition = match raw.operator {
            FilterOperator::Eq => FilterCondition::Eq(value),
            FilterOperator::Ne => FilterCondition::Ne(value),
            FilterOperator::Gt => FilterCondition::Gt(value),
            FilterOperator::Gte => FilterCondition::Gte(value),
            FilterOperator::Lt => FilterCondition::Lt(value),
            FilterOperator::Lte => FilterCondition::Lte(value),
            FilterOperator::Like => match value {
                Value::String(pattern) => FilterCondition::Like(pattern),
                other => return Err(format!("like operator requires a string, got {}", other)),
            },
            FilterOperator::In => match value {
                Value::Array(values) => FilterCondition::In(values),
                Value::Null => FilterCondition::In(Vec::new()),
                other => return Err(format!("in operator requires an array, got {}", other)),
            },
            FilterOperator::IsNull => FilterCondition::IsNull,
            FilterOperator::IsNotNull => FilterCondition::IsNotNull,
        };

        Ok(Filter {
            field: raw.field,
            condition,
        })
    }
}

impl From<Filter> for RawFilter {
    fn from(filter: Filter) -> Self {
        RawFilter {
            field: filter.field,
            operator: filter.condition.operator(),
            value: filter.condition.operand(),
        }
    }
}

impl Filter {
    pub fn new(field: impl Into<String>, condition: FilterCondition) -> Self {
        Self {
            field: field.into(),
            condition,
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterCondition::Eq(value.into()))
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterCondition::Ne(value.into()))
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterCondition::Gt(value.into()))
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterCondition::Gte(value.into()))
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterCondition::Lt(value.into()))
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterCondition::Lte(value.into()))
    }

    pub fn like(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(field, FilterCondition::Like(pattern.into()))
    }

    pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(field, FilterCondition::In(values))
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Self::new(field, FilterCondition::IsNull)
    }

    pub fn is_not_null(field: impl Into<String>) -> Self {
        Self::new(field, FilterCondition::IsNotNull)
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// One ORDER BY term
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl Sort {
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

/// Positional parameter accumulator
///
/// Hands out `$n` placeholders in bind order.
#[derive(Debug, Default, Clone)]
pub struct Params {
    values: Vec<Value>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a value and return its placeholder, cast when a type is given.
    ///
    /// Values bound against `JSONB` are carried as their JSON text, so
    /// scalars such as `5` or `"hello"` reach PostgreSQL as JSON documents.
    pub fn push(&mut self, value: Value, cast: Option<&str>) -> String {
        let value = match (cast, value) {
            (Some(JSONB_CAST), value) if !value.is_null() => Value::String(value.to_string()),
            (_, value) => value,
        };
        self.values.push(value);
        match cast {
            Some(cast) => format!("${}::{}", self.values.len(), cast),
            None => format!("${}", self.values.len()),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// Validate a field against the table and return its escaped form with the
/// placeholder cast for its physical type.
pub fn resolve_field(table: &TableDefinition, field: &str) -> Result<(String, &'static str)> {
    let escaped = escape_identifier(field)?;
    let cast = table.placeholder_cast(field).ok_or_else(|| {
        ProvisionError::validation(format!(
            "Unknown field '{}' on table '{}'",
            field, table.name
        ))
    })?;
    Ok((escaped, cast))
}

/// Build one SQL predicate for a filter.
///
/// Returns `Ok(None)` for filters that are intentionally omitted (an `in`
/// filter with no values).
pub fn build_filter_clause(
    table: &TableDefinition,
    filter: &Filter,
    params: &mut Params,
) -> Result<Option<String>> {
    let (column, cast) = resolve_field(table, &filter.field)?;

    let comparison = |op: &str, value: &Value, params: &mut Params| -> Result<String> {
        if value.is_null() {
            return Err(ProvisionError::validation(format!(
                "Operator '{}' on field '{}' does not accept null",
                op, filter.field
            )));
        }
        let placeholder = params.push(value.clone(), Some(cast));
        Ok(format!("{} {} {}", column, op, placeholder))
    };

    let clause = match &filter.condition {
        FilterCondition::Eq(Value::Null) => format!("{} IS NULL", column),
        FilterCondition::Ne(Value::Null) => format!("{} IS NOT NULL", column),
        FilterCondition::Eq(value) => comparison("=", value, params)?,
        FilterCondition::Ne(value) => comparison("!=", value, params)?,
        FilterCondition::Gt(value) => comparison(">", value, params)?,
        FilterCondition::Gte(value) => comparison(">=", value, params)?,
        FilterCondition::Lt(value) => comparison("<", value, params)?,
        FilterCondition::Lte(value) => comparison("<=", value, params)?,
        FilterCondition::Like(pattern) => {
            let placeholder = params.push(Value::String(pattern.clone()), Some("TEXT"));
            format!("{}::TEXT LIKE {}", column, placeholder)
        }
        FilterCondition::In(values) if values.is_empty() => return Ok(None),
        FilterCondition::In(values) => {
            let placeholders = values
                .iter()
                .map(|v| params.push(v.clone(), Some(cast)))
                .collect::<Vec<_>>();
            format!("{} IN ({})", column, placeholders.join(", "))
        }
        FilterCondition::IsNull => format!("{} IS NULL", column),
        FilterCondition::IsNotNull => format!("{} IS NOT NULL", column),
    };

    Ok(Some(clause))
}

/// Build the full WHERE predicate list for a read.
///
/// The soft-delete predicate is always included, last.
pub fn build_where_clause(
    table: &TableDefinition,
    filters: &[Filter],
    params: &mut Params,
) -> Result<String> {
    let mut clauses = Vec::with_capacity(filters.len() + 1);
    for filter in filters {
        if let Some(clause) = build_filter_clause(table, filter, params)? {
            clauses.push(clause);
        }
    }
    clauses.push(NOT_DELETED.to_string());
    Ok(clauses.join(" AND "))
}

/// Build ORDER BY terms (without the `ORDER BY` prefix).
///
/// `collation` is applied to textual user columns when present.
pub fn build_order_by_clause(
    table: &TableDefinition,
    sorts: &[Sort],
    collation: Option<&str>,
) -> Result<String> {
    if sorts.is_empty() {
        return Ok("created_at ASC".to_string());
    }

    let mut parts = Vec::with_capacity(sorts.len());
    for sort in sorts {
        let (column, _) = resolve_field(table, &sort.field)?;
        let textual = table
            .column(&sort.field)
            .map(|c| c.column_type.is_textual())
            .unwrap_or(false);

        match collation {
            Some(collation) if textual => parts.push(format!(
                "{} COLLATE {} {}",
                column,
                collation,
                sort.direction.as_sql()
            )),
            _ => parts.push(format!("{} {}", column, sort.direction.as_sql())),
        }
    }

    Ok(parts.join(", "))
}

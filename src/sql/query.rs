//! Parameterized CRUD and DDL statements for one dynamic table
//!
//! Every builder returns a [`SqlStatement`]: SQL text with `$n` placeholders
//! and the positional values to bind. Only validated identifiers are placed
//! into the SQL text.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ProvisionError, Result};
use crate::sql::ddl::DdlGenerator;
use crate::sql::filter::{Filter, Params, Sort, build_order_by_clause, build_where_clause};
use crate::sql::sanitize::{build_table_name, escape_identifier, qualified_name, quote_literal};
use crate::types::{SYSTEM_COLUMNS, TableDefinition};

static PLACEHOLDER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(\d+)").expect("placeholder pattern is valid"));

/// A parameterized statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl SqlStatement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// Statement without parameters (DDL)
    pub fn ddl(sql: impl Into<String>) -> Self {
        Self::new(sql, Vec::new())
    }

    /// Replace every `$n` with its value as a SQL literal.
    ///
    /// PostgreSQL rejects bind parameters in utility statements such as
    /// `CREATE VIEW`, so view DDL is inlined before it runs. Placeholder
    /// casts stay in place and type each literal.
    pub fn into_inlined_ddl(self) -> Result<SqlStatement> {
        if self.params.is_empty() {
            return Ok(self);
        }

        let mut sql = String::with_capacity(self.sql.len());
        let mut last = 0;
        for captures in PLACEHOLDER_PATTERN.captures_iter(&self.sql) {
            let (Some(whole), Some(index)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            let value = index
                .as_str()
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|n| self.params.get(n))
                .ok_or_else(|| {
                    ProvisionError::validation(format!(
                        "Placeholder {} has no bound value",
                        whole.as_str()
                    ))
                })?;
            sql.push_str(&self.sql[last..whole.start()]);
            sql.push_str(&inline_literal(value));
            last = whole.end();
        }
        sql.push_str(&self.sql[last..]);

        Ok(SqlStatement::ddl(sql))
    }
}

fn inline_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        // Parenthesized so a trailing cast binds to the whole negative number
        Value::Number(n) if n.as_f64().is_some_and(|f| f < 0.0) => format!("({})", n),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_literal(s),
        Value::Array(_) | Value::Object(_) => quote_literal(&value.to_string()),
    }
}

/// Options for [`QueryBuilder::build_select_query`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectOptions {
    pub filters: Vec<Filter>,
    pub sorts: Vec<Sort>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl SelectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn sort(mut self, sort: Sort) -> Self {
        self.sorts.push(sort);
        self
    }

    pub fn paginate(mut self, offset: u32, limit: u32) -> Self {
        self.offset = Some(offset);
        self.limit = Some(limit);
        self
    }
}

/// Statement builder bound to one table of one project
///
/// Pure: holds no connection and no mutable state, so a builder can be shared
/// across threads freely.
#[derive(Debug, Clone)]
pub struct QueryBuilder<'a> {
    table: &'a TableDefinition,
    project_id: &'a str,
    target: String,
}

impl<'a> QueryBuilder<'a> {
    /// Create a builder for `project_{project_id}_{table.name}`
    pub fn new(table: &'a TableDefinition, project_id: &'a str) -> Result<Self> {
        let target = build_table_name(project_id, &table.name)?;
        Ok(Self {
            table,
            project_id,
            target,
        })
    }

    /// Qualify the table with a deployment schema
    pub fn in_schema(mut self, schema_name: &str) -> Result<Self> {
        let table = build_table_name(self.project_id, &self.table.name)?;
        self.target = qualified_name(schema_name, &table)?;
        Ok(self)
    }

    /// The escaped (optionally schema-qualified) table name
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn table(&self) -> &TableDefinition {
        self.table
    }

    /// `SELECT *` with filters, the soft-delete guard, ordering and pagination
    pub fn build_select_query(&self, options: &SelectOptions) -> Result<SqlStatement> {
        let mut params = Params::new();
        let where_clause = build_where_clause(self.table, &options.filters, &mut params)?;
        let order_by = build_order_by_clause(self.table, &options.sorts, None)?;

        let mut sql = format!(
            "SELECT * FROM {} WHERE {} ORDER BY {}",
            self.target, where_clause, order_by
        );
        append_pagination(&mut sql, &mut params, options.limit, options.offset);

        Ok(SqlStatement::new(sql, params.into_values()))
    }

    /// `SELECT COUNT(*)` over the same predicate as a select
    pub fn build_count_query(&self, filters: &[Filter]) -> Result<SqlStatement> {
        let mut params = Params::new();
        let where_clause = build_where_clause(self.table, filters, &mut params)?;
        Ok(SqlStatement::new(
            format!("SELECT COUNT(*) FROM {} WHERE {}", self.target, where_clause),
            params.into_values(),
        ))
    }

    /// `INSERT ... RETURNING *`
    pub fn build_insert_query(&self, data: &Map<String, Value>) -> Result<SqlStatement> {
        let assignments = self.writable_columns(data)?;

        if assignments.is_empty() {
            return Ok(SqlStatement::ddl(format!(
                "INSERT INTO {} DEFAULT VALUES RETURNING *",
                self.target
            )));
        }

        let mut params = Params::new();
        let mut columns = Vec::with_capacity(assignments.len());
        let mut placeholders = Vec::with_capacity(assignments.len());
        for (column, cast, value) in assignments {
            columns.push(column);
            placeholders.push(params.push(value.clone(), Some(cast)));
        }

        Ok(SqlStatement::new(
            format!(
                "INSERT INTO {} ({}) VALUES ({}) RETURNING *",
                self.target,
                columns.join(", "),
                placeholders.join(", ")
            ),
            params.into_values(),
        ))
    }

    /// `UPDATE ... SET col = $n, ..., updated_at = NOW() WHERE id = $k RETURNING *`
    pub fn build_update_query(&self, data: &Map<String, Value>, id: &str) -> Result<SqlStatement> {
        let assignments = self.writable_columns(data)?;

        let mut params = Params::new();
        let mut set_clauses = Vec::with_capacity(assignments.len() + 1);
        for (column, cast, value) in assignments {
            let placeholder = params.push(value.clone(), Some(cast));
            set_clauses.push(format!("{} = {}", column, placeholder));
        }
        set_clauses.push("updated_at = NOW()".to_string());

        let id_placeholder = params.push(Value::String(id.to_string()), None);

        Ok(SqlStatement::new(
            format!(
                "UPDATE {} SET {} WHERE id = {} AND deleted_at IS NULL RETURNING *",
                self.target,
                set_clauses.join(", "),
                id_placeholder
            ),
            params.into_values(),
        ))
    }

    /// Soft delete: `UPDATE ... SET deleted_at = NOW() WHERE id = $1 RETURNING *`
    pub fn build_delete_query(&self, id: &str) -> Result<SqlStatement> {
        Ok(SqlStatement::new(
            format!(
                "UPDATE {} SET deleted_at = NOW() WHERE id = $1 AND deleted_at IS NULL RETURNING *",
                self.target
            ),
            vec![Value::String(id.to_string())],
        ))
    }

    /// `CREATE TABLE` for this table's columns plus the system columns
    pub fn build_create_table_query(&self) -> Result<SqlStatement> {
        let sql = DdlGenerator::new().generate_create_table(&self.target, &self.table.columns)?;
        Ok(SqlStatement::ddl(sql))
    }

    /// Validate payload keys and pair each with its escaped column and cast.
    ///
    /// Every key is checked before anything is returned, so one bad key
    /// rejects the whole payload.
    fn writable_columns<'d>(
        &self,
        data: &'d Map<String, Value>,
    ) -> Result<Vec<(String, &'static str, &'d Value)>> {
        let mut columns = Vec::with_capacity(data.len());
        for (key, value) in data {
            let escaped = escape_identifier(key)?;
            if SYSTEM_COLUMNS.contains(&key.as_str()) {
                return Err(ProvisionError::validation(format!(
                    "Column '{}' is managed automatically and cannot be written",
                    key
                )));
            }
            let column = self.table.column(key).ok_or_else(|| {
                ProvisionError::validation(format!(
                    "Unknown column '{}' on table '{}'",
                    key, self.table.name
                ))
            })?;
            if !column.nullable && value.is_null() {
                return Err(ProvisionError::validation(format!(
                    "Column '{}' does not allow NULL values",
                    key
                )));
            }
            columns.push((escaped, column.column_type.to_sql_type(), value));
        }
        Ok(columns)
    }
}

/// Append `LIMIT $n OFFSET $m`, binding both values
pub(crate) fn append_pagination(
    sql: &mut String,
    params: &mut Params,
    limit: Option<u32>,
    offset: Option<u32>,
) {
    if let Some(limit) = limit {
        let placeholder = params.push(Value::from(limit), None);
        sql.push_str(&format!(" LIMIT {}", placeholder));
    }
    if let Some(offset) = offset {
        let placeholder = params.push(Value::from(offset), None);
        sql.push_str(&format!(" OFFSET {}", placeholder));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ColumnDefinition, ColumnType};
    use serde_json::json;

    fn users_table() -> TableDefinition {
        TableDefinition::new(
            "users",
            vec![
                ColumnDefinition::new("email", ColumnType::String).unique().not_null(),
                ColumnDefinition::new("age", ColumnType::Number),
                ColumnDefinition::new("bio", ColumnType::Text),
            ],
        )
    }

    fn data(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    // ==================== SELECT ====================

    #[test]
    fn test_select_without_filters_excludes_deleted() {
        let table = users_table();
        let qb = QueryBuilder::new(&table, "proj1").unwrap();

        let stmt = qb.build_select_query(&SelectOptions::new()).unwrap();

        assert_eq!(
            stmt.sql,
            "SELECT * FROM \"project_proj1_users\" WHERE deleted_at IS NULL ORDER BY created_at ASC"
        );
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn test_select_full_shape() {
        let table = users_table();
        let qb = QueryBuilder::new(&table, "proj1").unwrap();

        let stmt = qb
            .build_select_query(
                &SelectOptions::new()
                    .filter(Filter::gte("age", 18))
                    .filter(Filter::like("email", "%@example.com"))
                    .sort(Sort::desc("created_at"))
                    .paginate(20, 10),
            )
            .unwrap();

        assert_eq!(
            stmt.sql,
            "SELECT * FROM \"project_proj1_users\" WHERE \"age\" >= $1::DECIMAL(20,8) AND \"email\"::TEXT LIKE $2::TEXT AND deleted_at IS NULL ORDER BY \"created_at\" DESC LIMIT $3 OFFSET $4"
        );
        assert_eq!(
            stmt.params,
            vec![json!(18), json!("%@example.com"), json!(10), json!(20)]
        );
    }

    #[test]
    fn test_select_always_contains_soft_delete_guard() {
        let table = users_table();
        let qb = QueryBuilder::new(&table, "proj1").unwrap();

        let option_sets = [
            SelectOptions::new(),
            SelectOptions::new().filter(Filter::is_null("deleted_at")),
            SelectOptions::new().filter(Filter::is_not_null("deleted_at")),
            SelectOptions::new().filter(Filter::eq("email", "a")).paginate(0, 1),
        ];
        for options in option_sets {
            let stmt = qb.build_select_query(&options).unwrap();
            assert!(stmt.sql.contains("deleted_at IS NULL"), "{}", stmt.sql);
        }
    }

    #[test]
    fn test_select_empty_in_is_omitted() {
        let table = users_table();
        let qb = QueryBuilder::new(&table, "proj1").unwrap();

        let stmt = qb
            .build_select_query(&SelectOptions::new().filter(Filter::is_in("age", vec![])))
            .unwrap();

        assert!(!stmt.sql.contains(" IN ("));
        assert!(stmt.sql.contains("WHERE deleted_at IS NULL"));
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn test_select_invalid_identifier_emits_nothing() {
        let table = users_table();
        let qb = QueryBuilder::new(&table, "proj1").unwrap();

        let result = qb.build_select_query(
            &SelectOptions::new().filter(Filter::eq("email; DROP TABLE x", "a")),
        );
        assert!(result.is_err());

        let result = qb.build_select_query(&SelectOptions::new().sort(Sort::asc("select")));
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_rejects_invalid_table_name() {
        let table = TableDefinition::new("drop", vec![]);
        assert!(QueryBuilder::new(&table, "proj1").is_err());

        let table = TableDefinition::new("users", vec![]);
        assert!(QueryBuilder::new(&table, "proj 1").is_err());
    }

    #[test]
    fn test_in_schema_qualifies_target() {
        let table = users_table();
        let qb = QueryBuilder::new(&table, "proj1")
            .unwrap()
            .in_schema("fastbuild_proj1_preview")
            .unwrap();
        let stmt = qb.build_delete_query("abc").unwrap();
        assert!(
            stmt.sql
                .contains("\"fastbuild_proj1_preview\".\"project_proj1_users\"")
        );
    }

    #[test]
    fn test_count_query() {
        let table = users_table();
        let qb = QueryBuilder::new(&table, "proj1").unwrap();
        let stmt = qb.build_count_query(&[Filter::eq("email", "a")]).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT COUNT(*) FROM \"project_proj1_users\" WHERE \"email\" = $1::VARCHAR(255) AND deleted_at IS NULL"
        );
    }

    // ==================== INSERT ====================

    #[test]
    fn test_insert_query() {
        let table = users_table();
        let qb = QueryBuilder::new(&table, "proj1").unwrap();

        let stmt = qb
            .build_insert_query(&data(json!({"email": "a@b.c", "age": 30})))
            .unwrap();

        // serde_json::Map is ordered by key
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"project_proj1_users\" (\"age\", \"email\") VALUES ($1::DECIMAL(20,8), $2::VARCHAR(255)) RETURNING *"
        );
        assert_eq!(stmt.params, vec![json!(30), json!("a@b.c")]);
    }

    #[test]
    fn test_insert_empty_uses_default_values() {
        let table = users_table();
        let qb = QueryBuilder::new(&table, "proj1").unwrap();
        let stmt = qb.build_insert_query(&Map::new()).unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"project_proj1_users\" DEFAULT VALUES RETURNING *"
        );
    }

    #[test]
    fn test_insert_rejects_bad_keys() {
        let table = users_table();
        let qb = QueryBuilder::new(&table, "proj1").unwrap();

        assert!(matches!(
            qb.build_insert_query(&data(json!({"email\"; --": "x"}))).unwrap_err(),
            ProvisionError::InvalidIdentifier { .. }
        ));
        assert!(qb.build_insert_query(&data(json!({"unknown": 1}))).is_err());
        assert!(qb.build_insert_query(&data(json!({"id": "forged"}))).is_err());
        assert!(qb.build_insert_query(&data(json!({"email": null}))).is_err());
    }

    // ==================== UPDATE ====================

    #[test]
    fn test_update_query() {
        let table = users_table();
        let qb = QueryBuilder::new(&table, "proj1").unwrap();

        let stmt = qb
            .build_update_query(&data(json!({"bio": "hello"})), "row-1")
            .unwrap();

        assert_eq!(
            stmt.sql,
            "UPDATE \"project_proj1_users\" SET \"bio\" = $1::TEXT, updated_at = NOW() WHERE id = $2 AND deleted_at IS NULL RETURNING *"
        );
        assert_eq!(stmt.params, vec![json!("hello"), json!("row-1")]);
    }

    #[test]
    fn test_update_without_data_touches_updated_at() {
        let table = users_table();
        let qb = QueryBuilder::new(&table, "proj1").unwrap();
        let stmt = qb.build_update_query(&Map::new(), "row-1").unwrap();
        assert!(stmt.sql.contains("SET updated_at = NOW() WHERE id = $1"));
        assert_eq!(stmt.params, vec![json!("row-1")]);
    }

    // ==================== DELETE ====================

    #[test]
    fn test_delete_is_soft() {
        let table = users_table();
        let qb = QueryBuilder::new(&table, "proj1").unwrap();

        let stmt = qb.build_delete_query("row-1").unwrap();

        assert_eq!(
            stmt.sql,
            "UPDATE \"project_proj1_users\" SET deleted_at = NOW() WHERE id = $1 AND deleted_at IS NULL RETURNING *"
        );
        assert!(!stmt.sql.contains("DELETE"));
        assert_eq!(stmt.params, vec![json!("row-1")]);
    }

    #[test]
    fn test_row_lifecycle_ends_soft_deleted() {
        let table = users_table();
        let qb = QueryBuilder::new(&table, "proj1").unwrap();

        let statements = [
            qb.build_insert_query(&data(json!({"email": "a@b.c"}))).unwrap(),
            qb.build_update_query(&data(json!({"age": 5})), "row-1").unwrap(),
            qb.build_delete_query("row-1").unwrap(),
        ];

        assert!(statements.iter().all(|s| !s.sql.starts_with("DELETE")));
        assert!(statements[2].sql.contains("SET deleted_at = NOW()"));
    }

    // ==================== CREATE TABLE ====================

    #[test]
    fn test_create_table_query() {
        let table = users_table();
        let qb = QueryBuilder::new(&table, "proj1").unwrap();

        let stmt = qb.build_create_table_query().unwrap();

        assert!(stmt.sql.starts_with("CREATE TABLE \"project_proj1_users\" ("));
        assert!(stmt.sql.contains("\"email\" VARCHAR(255) UNIQUE NOT NULL"));
        assert!(stmt.sql.contains("\"age\" DECIMAL(20,8)"));
        assert!(stmt.sql.contains("\"bio\" TEXT"));
        assert!(stmt.sql.contains("deleted_at TIMESTAMPTZ"));
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn test_create_table_query_invalid_column() {
        let table = TableDefinition::new(
            "users",
            vec![ColumnDefinition::new("from", ColumnType::Text)],
        );
        let qb = QueryBuilder::new(&table, "proj1").unwrap();
        assert!(qb.build_create_table_query().is_err());
    }

    // ==================== Inlined DDL ====================

    #[test]
    fn test_inlined_ddl_renders_typed_literals() {
        let stmt = SqlStatement::new(
            "CREATE VIEW v AS SELECT * FROM t WHERE a = $1::TEXT AND b = $2::DECIMAL(20,8) AND c = $3::BOOLEAN AND d = $10::JSONB LIMIT $11",
            vec![
                json!("it's"),
                json!(9.5),
                json!(false),
                Value::Null,
                Value::Null,
                Value::Null,
                Value::Null,
                Value::Null,
                Value::Null,
                json!("{\"k\":1}"),
                json!(25),
            ],
        );

        let inlined = stmt.into_inlined_ddl().unwrap();

        assert_eq!(
            inlined.sql,
            "CREATE VIEW v AS SELECT * FROM t WHERE a = 'it''s'::TEXT AND b = 9.5::DECIMAL(20,8) AND c = FALSE::BOOLEAN AND d = '{\"k\":1}'::JSONB LIMIT 25"
        );
        assert!(inlined.params.is_empty());
    }

    #[test]
    fn test_inlined_ddl_parenthesizes_negative_numbers() {
        let stmt = SqlStatement::new("SELECT $1::TEXT", vec![json!(-3)]);
        assert_eq!(stmt.into_inlined_ddl().unwrap().sql, "SELECT (-3)::TEXT");
    }

    #[test]
    fn test_inlined_ddl_rejects_unbound_placeholder() {
        let stmt = SqlStatement::new("SELECT $1, $2", vec![json!(1)]);
        assert!(stmt.into_inlined_ddl().unwrap_err().is_validation());
    }

    #[test]
    fn test_inlined_ddl_without_params_is_unchanged() {
        let stmt = SqlStatement::ddl("CREATE SCHEMA s");
        assert_eq!(stmt.clone().into_inlined_ddl().unwrap(), stmt);
    }
}

//! CREATE VIEW statements over one dynamic table
//!
//! Views reuse the filter and sort vocabulary of [`crate::sql::query`] and
//! always exclude soft-deleted rows. Materialized views are created here but
//! never refreshed; refreshing is up to the caller.

use serde::{Deserialize, Serialize};

use crate::error::{ProvisionError, Result};
use crate::sql::filter::{Filter, Params, Sort, build_order_by_clause, build_where_clause, resolve_field};
use crate::sql::query::{SqlStatement, append_pagination};
use crate::sql::sanitize::{build_table_name, build_view_name, escape_identifier, qualified_name};
use crate::types::TableDefinition;

/// Aggregate function applied to a materialized view column
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Aggregate {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl Aggregate {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Aggregate::Count => "COUNT",
            Aggregate::Sum => "SUM",
            Aggregate::Avg => "AVG",
            Aggregate::Min => "MIN",
            Aggregate::Max => "MAX",
        }
    }
}

/// Projected column of a custom view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewColumn {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl ViewColumn {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            alias: None,
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

/// Options for [`ViewBuilder::build_custom_view_query`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomViewOptions {
    pub columns: Vec<ViewColumn>,
    pub filters: Vec<Filter>,
    pub sorts: Vec<Sort>,
    pub limit: Option<u32>,
}

/// Projected column of a materialized view, optionally aggregated.
///
/// `COUNT` accepts `*` as its source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterializedColumn {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<Aggregate>,
}

impl MaterializedColumn {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            alias: None,
            aggregate: None,
        }
    }

    pub fn aggregate(source: impl Into<String>, aggregate: Aggregate) -> Self {
        Self {
            aggregate: Some(aggregate),
            ..Self::new(source)
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

/// Options for [`ViewBuilder::build_materialized_view_query`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MaterializedViewOptions {
    pub columns: Vec<MaterializedColumn>,
    pub groups: Vec<String>,
    pub filters: Vec<Filter>,
}

/// View statement builder bound to one table of one project
#[derive(Debug, Clone)]
pub struct ViewBuilder<'a> {
    table: &'a TableDefinition,
    project_id: &'a str,
    schema: Option<String>,
    source: String,
}

impl<'a> ViewBuilder<'a> {
    pub fn new(table: &'a TableDefinition, project_id: &'a str) -> Result<Self> {
        let source = build_table_name(project_id, &table.name)?;
        Ok(Self {
            table,
            project_id,
            schema: None,
            source,
        })
    }

    /// Place the view next to a table inside a deployment schema
    pub fn in_schema(mut self, schema_name: &str) -> Result<Self> {
        self.source = qualified_name(schema_name, &self.source)?;
        self.schema = Some(schema_name.to_string());
        Ok(self)
    }

    fn view_target(&self, view_name: &str) -> Result<String> {
        let view = build_view_name(self.project_id, &self.table.name, view_name)?;
        match &self.schema {
            Some(schema) => qualified_name(schema, &view),
            None => Ok(view),
        }
    }

    /// Minimal view exposing `id, created_at, updated_at` of live rows
    pub fn build_default_view_query(&self, view_name: &str) -> Result<SqlStatement> {
        Ok(SqlStatement::ddl(format!(
            "CREATE OR REPLACE VIEW {} AS SELECT id, created_at, updated_at FROM {} WHERE deleted_at IS NULL",
            self.view_target(view_name)?,
            self.source
        )))
    }

    /// View with aliased columns, filters, ordering and an optional limit
    pub fn build_custom_view_query(
        &self,
        view_name: &str,
        options: &CustomViewOptions,
    ) -> Result<SqlStatement> {
        let target = self.view_target(view_name)?;

        if options.columns.is_empty() {
            return Err(ProvisionError::validation(format!(
                "View '{}' must project at least one column",
                view_name
            )));
        }

        let projection = options
            .columns
            .iter()
            .map(|c| self.project(&c.source, c.alias.as_deref()))
            .collect::<Result<Vec<_>>>()?;

        let mut params = Params::new();
        let where_clause = build_where_clause(self.table, &options.filters, &mut params)?;
        let order_by = build_order_by_clause(self.table, &options.sorts, None)?;

        let mut sql = format!(
            "CREATE OR REPLACE VIEW {} AS SELECT {} FROM {} WHERE {} ORDER BY {}",
            target,
            projection.join(", "),
            self.source,
            where_clause,
            order_by
        );
        append_pagination(&mut sql, &mut params, options.limit, None);

        Ok(SqlStatement::new(sql, params.into_values()))
    }

    /// Materialized view with per-column aggregates and GROUP BY
    ///
    /// When anything is grouped or aggregated, every plain column must also
    /// be listed in `groups`.
    pub fn build_materialized_view_query(
        &self,
        view_name: &str,
        options: &MaterializedViewOptions,
    ) -> Result<SqlStatement> {
        let target = self.view_target(view_name)?;

        if options.columns.is_empty() {
            return Err(ProvisionError::validation(format!(
                "View '{}' must project at least one column",
                view_name
            )));
        }

        let groups = options
            .groups
            .iter()
            .map(|g| resolve_field(self.table, g).map(|(column, _)| column))
            .collect::<Result<Vec<_>>>()?;

        let grouped =
            !groups.is_empty() || options.columns.iter().any(|c| c.aggregate.is_some());

        let mut projection = Vec::with_capacity(options.columns.len());
        for column in &options.columns {
            match column.aggregate {
                Some(aggregate) => projection.push(self.aggregate(column, aggregate)?),
                None => {
                    if grouped && !options.groups.contains(&column.source) {
                        return Err(ProvisionError::validation(format!(
                            "Column '{}' must be aggregated or listed in groups",
                            column.source
                        )));
                    }
                    projection.push(self.project(&column.source, column.alias.as_deref())?);
                }
            }
        }

        let mut params = Params::new();
        let where_clause = build_where_clause(self.table, &options.filters, &mut params)?;

        let mut sql = format!(
            "CREATE MATERIALIZED VIEW {} AS SELECT {} FROM {} WHERE {}",
            target,
            projection.join(", "),
            self.source,
            where_clause
        );
        if !groups.is_empty() {
            sql.push_str(&format!(" GROUP BY {}", groups.join(", ")));
        }

        Ok(SqlStatement::new(sql, params.into_values()))
    }

    fn project(&self, source: &str, alias: Option<&str>) -> Result<String> {
        let (column, _) = resolve_field(self.table, source)?;
        match alias {
            Some(alias) if alias != source => {
                Ok(format!("{} AS {}", column, escape_identifier(alias)?))
            }
            _ => Ok(column),
        }
    }

    fn aggregate(&self, column: &MaterializedColumn, aggregate: Aggregate) -> Result<String> {
        let argument = if column.source == "*" {
            if aggregate != Aggregate::Count {
                return Err(ProvisionError::validation(format!(
                    "{} cannot be applied to '*'",
                    aggregate.as_sql()
                )));
            }
            "*".to_string()
        } else {
            resolve_field(self.table, &column.source)?.0
        };

        let alias = match &column.alias {
            Some(alias) => alias.clone(),
            None if column.source == "*" => aggregate.as_sql().to_lowercase(),
            None => format!("{}_{}", aggregate.as_sql().to_lowercase(), column.source),
        };

        Ok(format!(
            "{}({}) AS {}",
            aggregate.as_sql(),
            argument,
            escape_identifier(&alias)?
        ))
    }
}

//! Listing and search with locale-aware ordering
//!
//! Shares the query builder's guarantees: parameterized values, validated
//! identifiers and the soft-delete guard. Text sorts use the ICU collation of
//! the requested locale, and results are paged by page number.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProvisionError, Result};
use crate::sql::filter::{Filter, Params, Sort, build_order_by_clause, build_where_clause, resolve_field};
use crate::sql::query::{SqlStatement, append_pagination};
use crate::sql::sanitize::{build_table_name, qualified_name};
use crate::types::TableDefinition;

/// Page size used when a request does not name one
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Upper bound for requested page sizes
pub const MAX_PAGE_SIZE: u32 = 100;

/// BCP 47 subset: language, optional script, optional region.
static LOCALE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z]{2,3}(-[A-Z][a-z]{3})?(-([A-Z]{2}|[0-9]{3}))?$")
        .expect("locale pattern is valid")
});

/// Map a locale tag to its quoted ICU collation, e.g. `de-DE` to `"de-DE-x-icu"`
pub fn collation_for_locale(locale: &str) -> Result<String> {
    if !LOCALE_PATTERN.is_match(locale) {
        return Err(ProvisionError::validation(format!(
            "Invalid locale '{}'",
            locale
        )));
    }
    Ok(format!("\"{}-x-icu\"", locale))
}

/// Listing request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ListOptions {
    pub locale: Option<String>,
    pub search: Option<String>,
    /// Text columns searched; all text columns when empty
    pub search_fields: Vec<String>,
    pub filters: Vec<Filter>,
    pub sorts: Vec<Sort>,
    /// 1-based page number
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl ListOptions {
    /// Effective `(page, page_size)` after defaults and clamping
    pub fn pagination(&self) -> (u32, u32) {
        let page = self.page.unwrap_or(1).max(1);
        let page_size = self
            .page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        (page, page_size)
    }
}

/// Page metadata derived from a total row count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub total_pages: u64,
}

impl PageInfo {
    pub fn new(options: &ListOptions, total: u64) -> Self {
        let (page, page_size) = options.pagination();
        Self {
            page,
            page_size,
            total,
            total_pages: total.div_ceil(u64::from(page_size)),
        }
    }
}

/// Listing statement builder for one table
#[derive(Debug, Clone)]
pub struct LocaleQueryService<'a> {
    table: &'a TableDefinition,
    target: String,
}

impl<'a> LocaleQueryService<'a> {
    pub fn new(table: &'a TableDefinition, project_id: &str) -> Result<Self> {
        Ok(Self {
            table,
            target: build_table_name(project_id, &table.name)?,
        })
    }

    pub fn in_schema(mut self, schema_name: &str) -> Result<Self> {
        self.target = qualified_name(schema_name, &self.target)?;
        Ok(self)
    }

    /// One page of live rows
    pub fn build_list_query(&self, options: &ListOptions) -> Result<SqlStatement> {
        let collation = options
            .locale
            .as_deref()
            .map(collation_for_locale)
            .transpose()?;

        let mut params = Params::new();
        let where_clause = self.predicate(options, &mut params)?;
        let order_by = build_order_by_clause(self.table, &options.sorts, collation.as_deref())?;

        let (page, page_size) = options.pagination();
        let offset = (page - 1).saturating_mul(page_size);

        let mut sql = format!(
            "SELECT * FROM {} WHERE {} ORDER BY {}",
            self.target, where_clause, order_by
        );
        append_pagination(&mut sql, &mut params, Some(page_size), Some(offset));

        Ok(SqlStatement::new(sql, params.into_values()))
    }

    /// Total row count matching the same search and filters
    pub fn build_count_query(&self, options: &ListOptions) -> Result<SqlStatement> {
        let mut params = Params::new();
        let where_clause = self.predicate(options, &mut params)?;
        Ok(SqlStatement::new(
            format!("SELECT COUNT(*) FROM {} WHERE {}", self.target, where_clause),
            params.into_values(),
        ))
    }

    fn predicate(&self, options: &ListOptions, params: &mut Params) -> Result<String> {
        let search = match options.search.as_deref().map(str::trim) {
            Some(term) if !term.is_empty() => {
                Some(self.search_clause(term, &options.search_fields, params)?)
            }
            _ => None,
        };
        let rest = build_where_clause(self.table, &options.filters, params)?;
        Ok(match search {
            Some(search) => format!("{} AND {}", search, rest),
            None => rest,
        })
    }

    /// `(a::TEXT ILIKE $n OR b::TEXT ILIKE $n)` with one bound pattern
    fn search_clause(&self, term: &str, fields: &[String], params: &mut Params) -> Result<String> {
        let names: Vec<&str> = if fields.is_empty() {
            let mut textual: Vec<_> = self
                .table
                .columns
                .iter()
                .filter(|c| c.column_type.is_textual())
                .collect();
            textual.sort_by_key(|c| c.order);
            textual.into_iter().map(|c| c.name.as_str()).collect()
        } else {
            fields.iter().map(String::as_str).collect()
        };

        if names.is_empty() {
            return Err(ProvisionError::validation(format!(
                "Table '{}' has no text columns to search",
                self.table.name
            )));
        }

        let mut columns = Vec::with_capacity(names.len());
        for name in names {
            let (column, _) = resolve_field(self.table, name)?;
            let textual = self
                .table
                .column(name)
                .is_some_and(|c| c.column_type.is_textual());
            if !textual {
                return Err(ProvisionError::validation(format!(
                    "Field '{}' is not a text column and cannot be searched",
                    name
                )));
            }
            columns.push(column);
        }

        let placeholder = params.push(Value::String(like_pattern(term)), Some("TEXT"));
        let terms = columns
            .iter()
            .map(|c| format!("{}::TEXT ILIKE {}", c, placeholder))
            .collect::<Vec<_>>();
        Ok(format!("({})", terms.join(" OR ")))
    }
}

/// `%term%` with LIKE wildcards in the term escaped
fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

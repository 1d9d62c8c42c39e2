//! DDL Generation for dynamic tables
//!
//! Generates PostgreSQL DDL for deployment schemas and the tables inside them.
//! Identifiers are validated before any statement text is assembled.

use sha2::{Digest, Sha256};

use crate::error::{ProvisionError, Result};
use crate::sql::sanitize::{MAX_IDENTIFIER_LENGTH, escape_identifier, validate_identifier};
use crate::types::{ColumnDefinition, SYSTEM_COLUMNS};

/// DDL generator for dynamic tables
#[derive(Debug, Clone, Copy, Default)]
pub struct DdlGenerator {
    if_not_exists: bool,
}

impl DdlGenerator {
    /// Create a generator that emits plain `CREATE` statements
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit `IF NOT EXISTS` so statements can be replayed against an
    /// existing schema
    pub fn if_not_exists(mut self) -> Self {
        self.if_not_exists = true;
        self
    }

    fn guard(&self) -> &'static str {
        if self.if_not_exists {
            "IF NOT EXISTS "
        } else {
            ""
        }
    }

    /// Generate `CREATE SCHEMA IF NOT EXISTS`; schema creation is always
    /// idempotent.
    pub fn generate_create_schema(&self, schema_name: &str) -> Result<String> {
        Ok(format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            escape_identifier(schema_name)?
        ))
    }

    /// Generate CREATE TABLE with user and system columns
    ///
    /// `target` is an already escaped (optionally schema-qualified) table name.
    /// Creates a table with:
    /// - `id` generated primary key
    /// - User-defined columns in their `order`
    /// - `created_at`, `updated_at` timestamps
    /// - `deleted_at` soft-delete marker
    pub fn generate_create_table(&self, target: &str, columns: &[ColumnDefinition]) -> Result<String> {
        let mut ordered = columns.to_vec();
        ordered.sort_by_key(|c| c.order);

        // Format every column first so an invalid one aborts before any text
        // is assembled.
        let user_columns = ordered
            .iter()
            .map(Self::format_column_definition)
            .collect::<Result<Vec<_>>>()?;

        let mut column_defs =
            vec!["id VARCHAR(255) PRIMARY KEY DEFAULT gen_random_uuid()::text".to_string()];
        column_defs.extend(user_columns);

        // TIMESTAMPTZ to match chrono::DateTime<Utc>
        column_defs.push("created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()".to_string());
        column_defs.push("updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()".to_string());
        column_defs.push("deleted_at TIMESTAMPTZ".to_string());

        Ok(format!(
            "CREATE TABLE {}{} ({})",
            self.guard(),
            target,
            column_defs.join(", ")
        ))
    }

    /// Generate an index on `created_at` covering live (non-deleted) rows
    ///
    /// `schema_name` qualifies the table when given; `physical_table` is the
    /// raw (unescaped) table name.
    pub fn generate_default_index(
        &self,
        schema_name: Option<&str>,
        physical_table: &str,
    ) -> Result<String> {
        let index_name = default_index_name(physical_table);
        let quoted_table = escape_identifier(physical_table)?;
        let target = match schema_name {
            Some(schema) => format!("{}.{}", escape_identifier(schema)?, quoted_table),
            None => quoted_table,
        };

        Ok(format!(
            "CREATE INDEX {}{} ON {}(created_at DESC) WHERE deleted_at IS NULL",
            self.guard(),
            escape_identifier(&index_name)?,
            target
        ))
    }

    /// Format a single column definition for CREATE TABLE
    pub fn format_column_definition(col: &ColumnDefinition) -> Result<String> {
        validate_identifier(&col.name)?;
        if SYSTEM_COLUMNS.contains(&col.name.as_str()) {
            return Err(ProvisionError::validation(format!(
                "Column name '{}' is reserved and cannot be used.",
                col.name
            )));
        }

        let mut parts = vec![
            escape_identifier(&col.name)?,
            col.column_type.to_sql_type().to_string(),
        ];

        if col.unique {
            parts.push("UNIQUE".to_string());
        }

        if !col.nullable {
            parts.push("NOT NULL".to_string());
        }

        if let Some(default) = &col.default_value {
            let literal = col.column_type.default_literal(default).map_err(|e| {
                ProvisionError::validation(format!(
                    "Invalid default for column '{}': {}",
                    col.name, e
                ))
            })?;
            parts.push(format!("DEFAULT {}", literal));
        }

        Ok(parts.join(" "))
    }
}

/// Name of the default index, falling back to a digest when the readable
/// form would exceed the identifier limit.
fn default_index_name(physical_table: &str) -> String {
    let readable = format!("{}_live_idx", physical_table);
    if readable.len() <= MAX_IDENTIFIER_LENGTH {
        return readable;
    }
    let digest = hex::encode(Sha256::digest(physical_table.as_bytes()));
    format!("idx_{}_live", &digest[..24])
}

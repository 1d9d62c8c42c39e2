//! Core type definitions for table metadata
//!
//! Includes abstract column types, column definitions and table definitions.

use serde::{Deserialize, Serialize};

use crate::error::{ProvisionError, Result};
use crate::sql::sanitize::quote_literal;

/// Auto-managed columns appended to every dynamic table
pub const SYSTEM_COLUMNS: &[&str] = &["id", "created_at", "updated_at", "deleted_at"];

// ============================================================================
// Column Types
// ============================================================================

/// Abstract column type with its physical PostgreSQL mapping
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColumnType {
    /// Bounded string (maps to VARCHAR(255))
    String,
    /// Unbounded text (maps to TEXT)
    Text,
    /// Fixed-point number (maps to DECIMAL(20,8))
    Number,
    /// Boolean (maps to BOOLEAN)
    Boolean,
    /// Calendar date (maps to DATE)
    Date,
    /// Timestamp without zone (maps to TIMESTAMP)
    Timestamp,
    /// Structured JSON (maps to JSONB)
    Json,
}

impl ColumnType {
    /// Physical PostgreSQL type
    pub fn to_sql_type(&self) -> &'static str {
        match self {
            ColumnType::String => "VARCHAR(255)",
            ColumnType::Text => "TEXT",
            ColumnType::Number => "DECIMAL(20,8)",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Date => "DATE",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::Json => "JSONB",
        }
    }

    /// Whether values of this type sort and search as text
    pub fn is_textual(&self) -> bool {
        matches!(self, ColumnType::String | ColumnType::Text)
    }

    /// Render a default value as a SQL literal.
    ///
    /// DDL cannot carry bind parameters, so defaults are type-checked and
    /// rendered here instead of being passed through as raw SQL.
    pub fn default_literal(&self, value: &serde_json::Value) -> std::result::Result<String, String> {
        use serde_json::Value;

        match (self, value) {
            (_, Value::Null) => Ok("NULL".to_string()),
            (ColumnType::String | ColumnType::Text, Value::String(s)) => Ok(quote_literal(s)),
            (ColumnType::Number, Value::Number(n)) => Ok(n.to_string()),
            (ColumnType::Number, Value::String(s)) => s
                .trim()
                .parse::<rust_decimal::Decimal>()
                .map(|d| d.to_string())
                .map_err(|_| format!("Cannot convert '{}' to number", s)),
            (ColumnType::Boolean, Value::Bool(b)) => {
                Ok(if *b { "TRUE" } else { "FALSE" }.to_string())
            }
            (ColumnType::Date, Value::String(s)) => {
                chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .map(|d| format!("DATE {}", quote_literal(&d.to_string())))
                    .map_err(|e| format!("Invalid date '{}': {}", s, e))
            }
            (ColumnType::Timestamp, Value::String(s)) if s.eq_ignore_ascii_case("now") => {
                Ok("CURRENT_TIMESTAMP".to_string())
            }
            (ColumnType::Timestamp, Value::String(s)) => chrono::DateTime::parse_from_rfc3339(s)
                .map(|ts| {
                    let naive = ts.naive_utc().format("%Y-%m-%d %H:%M:%S%.f").to_string();
                    format!("TIMESTAMP {}", quote_literal(&naive))
                })
                .map_err(|e| format!("Invalid timestamp '{}': {}", s, e)),
            (ColumnType::Json, other) => Ok(format!("{}::jsonb", quote_literal(&other.to_string()))),
            _ => Err(format!("Default {} does not match type {:?}", value, self)),
        }
    }
}

// ============================================================================
// Column Definitions
// ============================================================================

fn default_nullable() -> bool {
    true
}

/// User-defined column of a dynamic table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDefinition {
    /// Column name (must be a valid identifier)
    pub name: String,

    /// Human-readable label
    #[serde(default)]
    pub display_name: String,

    /// Abstract column type
    #[serde(rename = "type")]
    pub column_type: ColumnType,

    /// Whether the column allows NULL values (default: true)
    #[serde(default = "default_nullable")]
    pub nullable: bool,

    /// Default value, rendered through [`ColumnType::default_literal`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,

    /// Whether the column has a UNIQUE constraint (default: false)
    #[serde(default)]
    pub unique: bool,

    /// Position of the column within the table
    #[serde(default)]
    pub order: i32,
}

impl ColumnDefinition {
    /// Create a new nullable column definition
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            column_type,
            nullable: true,
            default_value: None,
            unique: false,
            order: 0,
        }
    }

    /// Set the column as non-nullable
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Set the column as unique
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Set a default value
    pub fn default(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    /// Set the display label
    pub fn display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    /// Set the column position
    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }
}

// ============================================================================
// Table Definitions
// ============================================================================

/// Metadata for one dynamic table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TableDefinition {
    /// Unique identifier (UUID), empty until persisted
    #[serde(default)]
    pub id: String,

    /// Owning project
    #[serde(default)]
    pub project_id: String,

    /// Logical table name (must be a valid identifier)
    pub name: String,

    /// Human-readable label
    #[serde(default)]
    pub display_name: String,

    /// Optional description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// User-defined columns
    #[serde(default)]
    pub columns: Vec<ColumnDefinition>,

    /// Free-form table options carried through snapshots untouched
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl TableDefinition {
    /// Create a new table definition
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDefinition>) -> Self {
        let name = name.into();
        Self {
            id: String::new(),
            project_id: String::new(),
            display_name: name.clone(),
            name,
            description: None,
            columns,
            options: serde_json::Map::new(),
        }
    }

    /// Set the owning project
    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = project_id.into();
        self
    }

    /// Set description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Find a user-defined column by name
    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Cast applied to placeholders bound against `field`.
    ///
    /// Covers user columns and system columns; `None` means the field does
    /// not exist on this table.
    pub fn placeholder_cast(&self, field: &str) -> Option<&'static str> {
        match field {
            "id" => Some("TEXT"),
            "created_at" | "updated_at" | "deleted_at" => Some("TIMESTAMPTZ"),
            _ => self.column(field).map(|c| c.column_type.to_sql_type()),
        }
    }

    /// Whether `field` is a user or system column of this table
    pub fn has_field(&self, field: &str) -> bool {
        self.placeholder_cast(field).is_some()
    }

    /// Columns sorted by their `order` (stable for equal positions)
    pub fn ordered_columns(&self) -> Vec<ColumnDefinition> {
        let mut columns = self.columns.clone();
        columns.sort_by_key(|c| c.order);
        columns
    }

    /// Validate the table and column names and column defaults.
    pub fn validate(&self) -> Result<()> {
        crate::sql::sanitize::validate_identifier(&self.name)?;

        let mut seen = std::collections::HashSet::new();
        for col in &self.columns {
            crate::sql::sanitize::validate_identifier(&col.name)?;

            if SYSTEM_COLUMNS.contains(&col.name.as_str()) {
                return Err(ProvisionError::validation(format!(
                    "Column name '{}' is reserved and cannot be used.",
                    col.name
                )));
            }

            if !seen.insert(col.name.as_str()) {
                return Err(ProvisionError::validation(format!(
                    "Duplicate column '{}' in table '{}'",
                    col.name, self.name
                )));
            }

            if let Some(default) = &col.default_value {
                col.column_type.default_literal(default).map_err(|e| {
                    ProvisionError::validation(format!(
                        "Invalid default for column '{}': {}",
                        col.name, e
                    ))
                })?;
            }
        }

        Ok(())
    }
}

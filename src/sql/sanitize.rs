//! SQL Identifier Validation and Escaping
//!
//! Every dynamic identifier (schema, table, column, view, alias) passes through
//! this module before it is placed into SQL text.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{ProvisionError, Result};

/// Maximum identifier length accepted by PostgreSQL without truncation
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Keywords that cannot be used as dynamic identifiers.
///
/// PostgreSQL reserved words plus the DML/DDL verbs that must never appear as
/// a table, column or view name.
pub const RESERVED_KEYWORDS: &[&str] = &[
    "ALL",
    "ALTER",
    "ANALYSE",
    "ANALYZE",
    "AND",
    "ANY",
    "ARRAY",
    "AS",
    "ASC",
    "ASYMMETRIC",
    "BOTH",
    "CASE",
    "CAST",
    "CHECK",
    "COLLATE",
    "COLUMN",
    "CONSTRAINT",
    "CREATE",
    "CURRENT_CATALOG",
    "CURRENT_DATE",
    "CURRENT_ROLE",
    "CURRENT_TIME",
    "CURRENT_TIMESTAMP",
    "CURRENT_USER",
    "DEFAULT",
    "DEFERRABLE",
    "DELETE",
    "DESC",
    "DISTINCT",
    "DO",
    "DROP",
    "ELSE",
    "END",
    "EXCEPT",
    "EXECUTE",
    "FALSE",
    "FETCH",
    "FOR",
    "FOREIGN",
    "FROM",
    "GRANT",
    "GROUP",
    "HAVING",
    "IN",
    "INITIALLY",
    "INSERT",
    "INTERSECT",
    "INTO",
    "LATERAL",
    "LEADING",
    "LIMIT",
    "LOCALTIME",
    "LOCALTIMESTAMP",
    "MERGE",
    "NOT",
    "NULL",
    "OFFSET",
    "ON",
    "ONLY",
    "OR",
    "ORDER",
    "PLACING",
    "PRIMARY",
    "REFERENCES",
    "RETURNING",
    "REVOKE",
    "SELECT",
    "SESSION_USER",
    "SOME",
    "SYMMETRIC",
    "TABLE",
    "THEN",
    "TO",
    "TRAILING",
    "TRUE",
    "TRUNCATE",
    "UNION",
    "UNIQUE",
    "UPDATE",
    "USER",
    "USING",
    "VARIADIC",
    "WHEN",
    "WHERE",
    "WINDOW",
    "WITH",
];

static IDENTIFIER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("identifier pattern is valid")
});

/// Validate a dynamic SQL identifier
///
/// Rules:
/// - Must start with a letter or underscore
/// - Can only contain ASCII letters, digits and underscores
/// - At most 63 characters
/// - Cannot be a reserved keyword (case-insensitive)
///
/// # Example
/// ```
/// use fastbuild_provisioner::sql::validate_identifier;
///
/// assert!(validate_identifier("products").is_ok());
/// assert!(validate_identifier("_internal").is_ok());
/// assert!(validate_identifier("select").is_err());
/// assert!(validate_identifier("1st").is_err());
/// ```
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ProvisionError::invalid_identifier(
            name,
            "identifier cannot be empty",
        ));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(ProvisionError::invalid_identifier(
            name,
            format!("identifier exceeds {} characters", MAX_IDENTIFIER_LENGTH),
        ));
    }

    if !IDENTIFIER_PATTERN.is_match(name) {
        return Err(ProvisionError::invalid_identifier(
            name,
            "must start with a letter or underscore and contain only letters, digits and underscores",
        ));
    }

    if RESERVED_KEYWORDS.contains(&name.to_uppercase().as_str()) {
        return Err(ProvisionError::invalid_identifier(
            name,
            "reserved SQL keyword",
        ));
    }

    Ok(())
}

/// Quote an identifier, doubling any embedded double quotes.
///
/// Does not validate; callers outside this module go through
/// [`escape_identifier`].
fn quote_identifier(identifier: &str) -> String {
    let escaped = identifier.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

/// Validate an identifier and return its double-quoted form
///
/// # Example
/// ```
/// use fastbuild_provisioner::sql::escape_identifier;
///
/// assert_eq!(escape_identifier("my_table").unwrap(), "\"my_table\"");
/// assert!(escape_identifier("users; DROP TABLE x").is_err());
/// ```
pub fn escape_identifier(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(quote_identifier(name))
}

/// Reverse [`escape_identifier`], returning the raw name.
///
/// Returns `None` when the input is not a double-quoted identifier.
pub fn unquote_identifier(quoted: &str) -> Option<String> {
    let inner = quoted.strip_prefix('"')?.strip_suffix('"')?;
    Some(inner.replace("\"\"", "\""))
}

/// Quote a string as a SQL literal, doubling embedded single quotes
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Escaped physical table name: `project_{project_id}_{table_name}`
pub fn build_table_name(project_id: &str, table_name: &str) -> Result<String> {
    validate_identifier(table_name)?;
    escape_identifier(&format!("project_{}_{}", project_id, table_name))
}

/// Escaped view name: `view_project_{project_id}_{table_name}_{view_name}`
pub fn build_view_name(project_id: &str, table_name: &str, view_name: &str) -> Result<String> {
    validate_identifier(table_name)?;
    validate_identifier(view_name)?;
    escape_identifier(&format!(
        "view_project_{}_{}_{}",
        project_id, table_name, view_name
    ))
}

/// Raw (unquoted) deployment schema name:
/// `fastbuild_{project_id}_{environment_lowercase}`
///
/// The result is validated so it can be escaped safely later.
pub fn build_schema_name(project_id: &str, environment: &str) -> Result<String> {
    let name = format!("fastbuild_{}_{}", project_id, environment.to_lowercase());
    validate_identifier(&name)?;
    Ok(name)
}

/// Schema-qualify an already escaped relation name
pub fn qualified_name(schema: &str, escaped_relation: &str) -> Result<String> {
    Ok(format!("{}.{}", escape_identifier(schema)?, escaped_relation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    // =========================================================================
    // validate_identifier
    // =========================================================================

    #[rstest]
    #[case("products")]
    #[case("users")]
    #[case("Products")]
    #[case("_internal")]
    #[case("my_table_123")]
    #[case("a")]
    #[case("created_at")]
    fn test_validate_identifier_valid(#[case] name: &str) {
        assert!(validate_identifier(name).is_ok(), "{name} should be valid");
    }

    #[test]
    fn test_validate_identifier_max_length() {
        let name = format!("a{}", "b".repeat(62));
        assert_eq!(name.len(), 63);
        assert!(validate_identifier(&name).is_ok());

        let too_long = format!("a{}", "b".repeat(63));
        assert!(validate_identifier(&too_long).is_err());
    }

    #[rstest]
    #[case("")]
    #[case("1products")]
    #[case("0abc")]
    #[case("users;")]
    #[case("users; DROP TABLE accounts")]
    #[case("name--")]
    #[case("my table")]
    #[case(" table")]
    #[case("my-table")]
    #[case("schema.table")]
    #[case("tëst")]
    #[case("quo\"te")]
    fn test_validate_identifier_rejects_pattern(#[case] name: &str) {
        let err = validate_identifier(name).unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidIdentifier { .. }));
    }

    #[rstest]
    #[case("select")]
    #[case("SELECT")]
    #[case("Insert")]
    #[case("update")]
    #[case("delete")]
    #[case("drop")]
    #[case("create")]
    #[case("alter")]
    #[case("table")]
    #[case("where")]
    #[case("user")]
    fn test_validate_identifier_rejects_keywords(#[case] name: &str) {
        let err = validate_identifier(name).unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn test_validate_identifier_empty_message() {
        let err = validate_identifier("").unwrap_err();
        assert!(err.to_string().contains("cannot be empty"));
    }

    // =========================================================================
    // escape / unquote
    // =========================================================================

    #[test]
    fn test_escape_identifier_quotes() {
        assert_eq!(escape_identifier("my_table").unwrap(), "\"my_table\"");
        assert_eq!(escape_identifier("Users").unwrap(), "\"Users\"");
    }

    #[test]
    fn test_escape_identifier_round_trips() {
        for name in ["email", "_x", "Mixed_Case_9"] {
            let escaped = escape_identifier(name).unwrap();
            assert_eq!(unquote_identifier(&escaped).as_deref(), Some(name));
        }
    }

    #[test]
    fn test_escape_identifier_rejects_invalid() {
        assert!(escape_identifier("a\"b").is_err());
        assert!(escape_identifier("select").is_err());
    }

    #[test]
    fn test_quote_identifier_doubles_quotes() {
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
        assert_eq!(unquote_identifier("\"a\"\"b\"").as_deref(), Some("a\"b"));
    }

    #[test]
    fn test_unquote_identifier_requires_quotes() {
        assert!(unquote_identifier("plain").is_none());
        assert!(unquote_identifier("\"open").is_none());
    }

    // =========================================================================
    // Naming contract
    // =========================================================================

    #[test]
    fn test_build_table_name() {
        assert_eq!(
            build_table_name("proj1", "users").unwrap(),
            "\"project_proj1_users\""
        );
    }

    #[test]
    fn test_build_table_name_rejects_bad_parts() {
        assert!(build_table_name("proj1", "select").is_err());
        assert!(build_table_name("proj-1", "users").is_err());
        assert!(build_table_name("proj1", "users;--").is_err());
    }

    #[test]
    fn test_build_view_name() {
        assert_eq!(
            build_view_name("proj1", "orders", "recent").unwrap(),
            "\"view_project_proj1_orders_recent\""
        );
        assert!(build_view_name("proj1", "orders", "drop").is_err());
    }

    #[test]
    fn test_build_schema_name_lowercases_environment() {
        assert_eq!(
            build_schema_name("proj1", "PREVIEW").unwrap(),
            "fastbuild_proj1_preview"
        );
        assert_eq!(
            build_schema_name("proj1", "PRODUCTION").unwrap(),
            "fastbuild_proj1_production"
        );
    }

    #[test]
    fn test_qualified_name() {
        let table = build_table_name("p", "users").unwrap();
        assert_eq!(
            qualified_name("fastbuild_p_preview", &table).unwrap(),
            "\"fastbuild_p_preview\".\"project_p_users\""
        );
    }

    #[test]
    fn test_reserved_keywords_cover_ddl_and_dml() {
        for keyword in ["SELECT", "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER"] {
            assert!(RESERVED_KEYWORDS.contains(&keyword), "{keyword} missing");
        }
    }
}

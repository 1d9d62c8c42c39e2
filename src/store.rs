//! PgProvisionStore - PostgreSQL adapter for metadata, deployments and audit
//!
//! Owns three metadata tables (table definitions, deployment records, audit
//! log), implements the deployment ports on top of them and executes the
//! statements produced by the SQL builders.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row};

use crate::audit::AuditLogEntry;
use crate::config::ProvisionerConfig;
use crate::deployment::model::{
    BuildOutcome, ChangeLog, DeploymentRecord, DeploymentStatus, Environment,
};
use crate::error::{ProvisionError, Result};
use crate::ports::{AuditSink, DeploymentRepository, SchemaExecutor, TableCatalog};
use crate::sql::query::SqlStatement;
use crate::sql::sanitize::{build_table_name, escape_identifier};
use crate::types::{ColumnDefinition, TableDefinition};

const UNIQUE_VIOLATION: &str = "23505";

const DEPLOYMENT_COLUMNS: &str = "id, project_id, version, environment, status, deployed_by, \
     table_snapshots, change_log, metadata, schema_name, build_log, build_time, created_at, deployed_at";

const TABLE_COLUMNS: &str = "id, project_id, name, display_name, description, columns, options";

/// PostgreSQL-backed store
///
/// Metadata lives in the tables named by [`crate::config::MetadataTables`];
/// dynamic tables live in per-deployment schemas.
pub struct PgProvisionStore {
    /// Database connection pool
    pool: PgPool,
    /// Store configuration
    config: ProvisionerConfig,
}

impl PgProvisionStore {
    /// Connect and create the metadata tables if they don't exist
    pub async fn new(config: ProvisionerConfig) -> Result<Self> {
        let pool = PgPool::connect(&config.database_url).await.map_err(|e| {
            ProvisionError::database(format!("Database connection failed: {}", e))
        })?;

        let store = Self { pool, config };
        store.ensure_metadata_tables().await?;

        Ok(store)
    }

    /// Create a store sharing an existing pool
    pub async fn from_pool(pool: PgPool, config: ProvisionerConfig) -> Result<Self> {
        let store = Self { pool, config };
        store.ensure_metadata_tables().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    fn tables_table(&self) -> Result<String> {
        escape_identifier(&self.config.metadata.tables)
    }

    fn deployments_table(&self) -> Result<String> {
        escape_identifier(&self.config.metadata.deployments)
    }

    fn audit_table(&self) -> Result<String> {
        escape_identifier(&self.config.metadata.audit_log)
    }

    /// Ensures the metadata tables exist
    async fn ensure_metadata_tables(&self) -> Result<()> {
        let tables = self.tables_table()?;
        let deployments = self.deployments_table()?;
        let audit = self.audit_table()?;
        let live_name_index =
            escape_identifier(&format!("{}_live_name_idx", self.config.metadata.tables))?;

        let statements = [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    id VARCHAR(255) PRIMARY KEY DEFAULT gen_random_uuid()::text,
                    project_id VARCHAR(255) NOT NULL,
                    name VARCHAR(63) NOT NULL,
                    display_name VARCHAR(255) NOT NULL,
                    description TEXT,
                    columns JSONB NOT NULL,
                    options JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    deleted_at TIMESTAMPTZ
                )
                "#,
                tables
            ),
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} (project_id, name) WHERE deleted_at IS NULL",
                live_name_index, tables
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    id VARCHAR(255) PRIMARY KEY,
                    project_id VARCHAR(255) NOT NULL,
                    version VARCHAR(255) NOT NULL,
                    environment VARCHAR(32) NOT NULL,
                    status VARCHAR(32) NOT NULL,
                    deployed_by VARCHAR(255) NOT NULL,
                    table_snapshots JSONB NOT NULL,
                    change_log JSONB NOT NULL,
                    metadata JSONB NOT NULL DEFAULT 'null'::jsonb,
                    schema_name VARCHAR(63) NOT NULL,
                    build_log JSONB NOT NULL DEFAULT '[]'::jsonb,
                    build_time BIGINT,
                    created_at TIMESTAMPTZ NOT NULL,
                    deployed_at TIMESTAMPTZ,
                    UNIQUE (project_id, environment, version)
                )
                "#,
                deployments
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    id VARCHAR(255) PRIMARY KEY,
                    action VARCHAR(64) NOT NULL,
                    resource_type VARCHAR(64) NOT NULL,
                    resource_id VARCHAR(255) NOT NULL,
                    project_id VARCHAR(255) NOT NULL,
                    user_id VARCHAR(255) NOT NULL,
                    metadata JSONB NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL
                )
                "#,
                audit
            ),
        ];

        for statement in statements {
            sqlx::query(&statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    // =========================================================================
    // Table Definitions
    // =========================================================================

    /// Register a new table definition for a project
    pub async fn create_table_definition(
        &self,
        project_id: &str,
        table: TableDefinition,
    ) -> Result<TableDefinition> {
        table.validate()?;
        build_table_name(project_id, &table.name)?;

        let id = uuid::Uuid::new_v4().to_string();
        let insert_sql = format!(
            r#"
            INSERT INTO {} (id, project_id, name, display_name, description, columns, options)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {}
            "#,
            self.tables_table()?,
            TABLE_COLUMNS
        );

        let row = sqlx::query(&insert_sql)
            .bind(&id)
            .bind(project_id)
            .bind(&table.name)
            .bind(&table.display_name)
            .bind(&table.description)
            .bind(Json(&table.columns))
            .bind(Json(&table.options))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                conflict_on_unique(e, format!("Table '{}' already exists", table.name))
            })?;

        row_to_table(&row)
    }

    /// Replace name, labels, columns and options of a live table definition
    pub async fn update_table_definition(
        &self,
        project_id: &str,
        table_id: &str,
        table: TableDefinition,
    ) -> Result<TableDefinition> {
        table.validate()?;
        build_table_name(project_id, &table.name)?;

        let update_sql = format!(
            r#"
            UPDATE {}
            SET name = $3, display_name = $4, description = $5, columns = $6, options = $7,
                updated_at = NOW()
            WHERE id = $1 AND project_id = $2 AND deleted_at IS NULL
            RETURNING {}
            "#,
            self.tables_table()?,
            TABLE_COLUMNS
        );

        let row = sqlx::query(&update_sql)
            .bind(table_id)
            .bind(project_id)
            .bind(&table.name)
            .bind(&table.display_name)
            .bind(&table.description)
            .bind(Json(&table.columns))
            .bind(Json(&table.options))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                conflict_on_unique(e, format!("Table '{}' already exists", table.name))
            })?
            .ok_or_else(|| ProvisionError::not_found(format!("Table '{}' not found", table_id)))?;

        row_to_table(&row)
    }

    /// Soft-delete a table definition. Deployed tables are left untouched.
    pub async fn delete_table_definition(&self, project_id: &str, table_id: &str) -> Result<()> {
        let delete_sql = format!(
            "UPDATE {} SET deleted_at = NOW() WHERE id = $1 AND project_id = $2 AND deleted_at IS NULL",
            self.tables_table()?
        );

        let result = sqlx::query(&delete_sql)
            .bind(table_id)
            .bind(project_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ProvisionError::not_found(format!(
                "Table '{}' not found",
                table_id
            )));
        }

        Ok(())
    }

    /// Get a live table definition by name
    pub async fn get_table_definition(
        &self,
        project_id: &str,
        name: &str,
    ) -> Result<Option<TableDefinition>> {
        let select_sql = format!(
            "SELECT {} FROM {} WHERE project_id = $1 AND name = $2 AND deleted_at IS NULL",
            TABLE_COLUMNS,
            self.tables_table()?
        );

        let row = sqlx::query(&select_sql)
            .bind(project_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_table).transpose()
    }

    /// Live table definitions of a project, oldest first
    pub async fn list_table_definitions(&self, project_id: &str) -> Result<Vec<TableDefinition>> {
        let select_sql = format!(
            "SELECT {} FROM {} WHERE project_id = $1 AND deleted_at IS NULL ORDER BY created_at, name",
            TABLE_COLUMNS,
            self.tables_table()?
        );

        let rows = sqlx::query(&select_sql)
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_table).collect()
    }

    // =========================================================================
    // Statement Execution
    // =========================================================================

    /// Run a statement and return the number of affected rows
    pub async fn execute(&self, statement: &SqlStatement) -> Result<u64> {
        let query = bind_params(sqlx::query(&statement.sql), &statement.params)?;
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| conflict_on_unique(e, "Duplicate value for a unique column"))?;
        Ok(result.rows_affected())
    }

    /// Run view DDL built by [`crate::sql::view::ViewBuilder`].
    ///
    /// Parameters are inlined as typed literals first.
    pub async fn create_view(&self, statement: &SqlStatement) -> Result<()> {
        let inlined = statement.clone().into_inlined_ddl()?;
        sqlx::query(&inlined.sql).execute(&self.pool).await?;
        Ok(())
    }

    /// Run a row-returning statement and return each row as a JSON object
    pub async fn fetch_json(&self, statement: &SqlStatement) -> Result<Vec<Value>> {
        let wrapped = format!(
            "WITH fb_rows AS ({}) SELECT to_jsonb(fb_rows) AS fb_row FROM fb_rows",
            statement.sql
        );
        let query = bind_params(sqlx::query(&wrapped), &statement.params)?;
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| conflict_on_unique(e, "Duplicate value for a unique column"))?;

        rows.iter()
            .map(|row| row.try_get::<Value, _>("fb_row").map_err(ProvisionError::from))
            .collect()
    }

    /// Run a `SELECT COUNT(*)` statement
    pub async fn fetch_count(&self, statement: &SqlStatement) -> Result<i64> {
        let query = bind_params(sqlx::query(&statement.sql), &statement.params)?;
        let row = query.fetch_one(&self.pool).await?;
        Ok(row.try_get::<i64, _>(0)?)
    }

    /// Audit entries of a project, newest first
    pub async fn list_audit_entries(
        &self,
        project_id: &str,
        limit: i64,
    ) -> Result<Vec<AuditLogEntry>> {
        let select_sql = format!(
            r#"
            SELECT id, action, resource_type, resource_id, project_id, user_id, metadata, created_at
            FROM {}
            WHERE project_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
            self.audit_table()?
        );

        let rows = sqlx::query(&select_sql)
            .bind(project_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_audit).collect()
    }
}

// =========================================================================
// Ports
// =========================================================================

#[async_trait]
impl DeploymentRepository for PgProvisionStore {
    async fn insert(&self, record: &DeploymentRecord) -> Result<()> {
        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
            self.deployments_table()?,
            DEPLOYMENT_COLUMNS
        );

        sqlx::query(&insert_sql)
            .bind(&record.id)
            .bind(&record.project_id)
            .bind(&record.version)
            .bind(record.environment.as_str())
            .bind(record.status.as_str())
            .bind(&record.deployed_by)
            .bind(Json(&record.table_snapshots))
            .bind(Json(&record.change_log))
            .bind(Json(&record.metadata))
            .bind(&record.schema_name)
            .bind(Json(&record.build_log))
            .bind(record.build_time)
            .bind(record.created_at)
            .bind(record.deployed_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                conflict_on_unique(
                    e,
                    format!(
                        "Version {} has already been deployed to {}",
                        record.version, record.environment
                    ),
                )
            })?;

        Ok(())
    }

    async fn find(&self, deployment_id: &str) -> Result<Option<DeploymentRecord>> {
        let select_sql = format!(
            "SELECT {} FROM {} WHERE id = $1",
            DEPLOYMENT_COLUMNS,
            self.deployments_table()?
        );

        let row = sqlx::query(&select_sql)
            .bind(deployment_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_deployment).transpose()
    }

    async fn version_exists(
        &self,
        project_id: &str,
        environment: Environment,
        version: &str,
    ) -> Result<bool> {
        let select_sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE project_id = $1 AND environment = $2 AND version = $3)",
            self.deployments_table()?
        );

        let exists: bool = sqlx::query_scalar(&select_sql)
            .bind(project_id)
            .bind(environment.as_str())
            .bind(version)
            .fetch_one(&self.pool)
            .await?;

        Ok(exists)
    }

    async fn finish_build(&self, deployment_id: &str, outcome: &BuildOutcome) -> Result<bool> {
        let update_sql = format!(
            r#"
            UPDATE {}
            SET status = $2, build_log = $3, build_time = $4, deployed_at = $5
            WHERE id = $1 AND status = 'BUILDING'
            "#,
            self.deployments_table()?
        );

        let result = sqlx::query(&update_sql)
            .bind(deployment_id)
            .bind(outcome.status.as_str())
            .bind(Json(&outcome.build_log))
            .bind(outcome.build_time)
            .bind(outcome.deployed_at)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_recent(&self, project_id: &str, limit: usize) -> Result<Vec<DeploymentRecord>> {
        let select_sql = format!(
            "SELECT {} FROM {} WHERE project_id = $1 ORDER BY created_at DESC LIMIT $2",
            DEPLOYMENT_COLUMNS,
            self.deployments_table()?
        );

        let rows = sqlx::query(&select_sql)
            .bind(project_id)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_deployment).collect()
    }

    async fn list_building_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<DeploymentRecord>> {
        let select_sql = format!(
            "SELECT {} FROM {} WHERE status = 'BUILDING' AND created_at < $1 ORDER BY created_at",
            DEPLOYMENT_COLUMNS,
            self.deployments_table()?
        );

        let rows = sqlx::query(&select_sql)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_deployment).collect()
    }
}

#[async_trait]
impl TableCatalog for PgProvisionStore {
    async fn list_tables(&self, project_id: &str) -> Result<Vec<TableDefinition>> {
        self.list_table_definitions(project_id).await
    }
}

#[async_trait]
impl AuditSink for PgProvisionStore {
    async fn record(&self, entry: &AuditLogEntry) -> Result<()> {
        let insert_sql = format!(
            r#"
            INSERT INTO {} (id, action, resource_type, resource_id, project_id, user_id, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
            self.audit_table()?
        );

        sqlx::query(&insert_sql)
            .bind(&entry.id)
            .bind(entry.action.as_str())
            .bind(&entry.resource_type)
            .bind(&entry.resource_id)
            .bind(&entry.project_id)
            .bind(&entry.user_id)
            .bind(&entry.metadata)
            .bind(entry.created_at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl SchemaExecutor for PgProvisionStore {
    async fn execute_ddl(&self, statement: &str) -> Result<()> {
        sqlx::query(statement).execute(&self.pool).await?;
        Ok(())
    }
}

// =========================================================================
// Helper Methods
// =========================================================================

/// Map a unique violation to `Conflict`, anything else to `Sql`
fn conflict_on_unique(error: sqlx::Error, message: impl Into<String>) -> ProvisionError {
    if let sqlx::Error::Database(db) = &error
        && db.code().as_deref() == Some(UNIQUE_VIOLATION)
    {
        return ProvisionError::conflict(message);
    }
    ProvisionError::from(error)
}

/// Bind positional JSON parameters by value kind.
///
/// Placeholders carry their own casts, so each value only needs a wire type
/// PostgreSQL can cast from.
fn bind_params<'q>(
    mut query: sqlx::query::Query<'q, Postgres, PgArguments>,
    params: &'q [Value],
) -> Result<sqlx::query::Query<'q, Postgres, PgArguments>> {
    for value in params {
        query = match value {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    query.bind(i)
                } else {
                    let decimal = n
                        .to_string()
                        .parse::<rust_decimal::Decimal>()
                        .or_else(|_| {
                            rust_decimal::Decimal::from_scientific(&n.to_string())
                        })
                        .map_err(|_| {
                            ProvisionError::validation(format!(
                                "Number {} cannot be represented as a decimal",
                                n
                            ))
                        })?;
                    query.bind(decimal)
                }
            }
            Value::String(s) => query.bind(s.as_str()),
            Value::Array(_) | Value::Object(_) => query.bind(value),
        };
    }
    Ok(query)
}

fn row_to_table(row: &PgRow) -> Result<TableDefinition> {
    let columns: Json<Vec<ColumnDefinition>> = row.try_get("columns")?;
    let options: Json<Map<String, Value>> = row.try_get("options")?;

    Ok(TableDefinition {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        name: row.try_get("name")?,
        display_name: row.try_get("display_name")?,
        description: row.try_get("description")?,
        columns: columns.0,
        options: options.0,
    })
}

fn row_to_deployment(row: &PgRow) -> Result<DeploymentRecord> {
    let environment: String = row.try_get("environment")?;
    let status: String = row.try_get("status")?;
    let table_snapshots: Json<Vec<TableDefinition>> = row.try_get("table_snapshots")?;
    let change_log: Json<ChangeLog> = row.try_get("change_log")?;
    let build_log: Json<Vec<String>> = row.try_get("build_log")?;

    Ok(DeploymentRecord {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        version: row.try_get("version")?,
        environment: Environment::parse(&environment)?,
        status: DeploymentStatus::parse(&status)?,
        deployed_by: row.try_get("deployed_by")?,
        table_snapshots: table_snapshots.0,
        change_log: change_log.0,
        metadata: row.try_get("metadata")?,
        schema_name: row.try_get("schema_name")?,
        build_log: build_log.0,
        build_time: row.try_get("build_time")?,
        created_at: row.try_get("created_at")?,
        deployed_at: row.try_get("deployed_at")?,
    })
}

fn row_to_audit(row: &PgRow) -> Result<AuditLogEntry> {
    let action: String = row.try_get("action")?;

    Ok(AuditLogEntry {
        id: row.try_get("id")?,
        action: crate::audit::AuditAction::parse(&action).ok_or_else(|| {
            ProvisionError::database(format!("Unknown audit action '{}'", action))
        })?,
        resource_type: row.try_get("resource_type")?,
        resource_id: row.try_get("resource_id")?,
        project_id: row.try_get("project_id")?,
        user_id: row.try_get("user_id")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

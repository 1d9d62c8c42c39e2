//! Ports consumed by the deployment service
//!
//! Each port is an async trait so the service can run against PostgreSQL
//! ([`crate::store::PgProvisionStore`]) or the in-memory adapters in
//! [`crate::memory`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::audit::AuditLogEntry;
use crate::deployment::model::{BuildOutcome, DeploymentRecord, Environment, ProjectRole};
use crate::error::Result;
use crate::types::TableDefinition;

/// Durable storage for deployment records.
#[async_trait]
pub trait DeploymentRepository: Send + Sync {
    /// Persist a new record. Fails with `Conflict` when the
    /// `(project, environment, version)` triple already exists.
    async fn insert(&self, record: &DeploymentRecord) -> Result<()>;

    async fn find(&self, deployment_id: &str) -> Result<Option<DeploymentRecord>>;

    async fn version_exists(
        &self,
        project_id: &str,
        environment: Environment,
        version: &str,
    ) -> Result<bool>;

    /// Move a `BUILDING` record to its terminal state.
    ///
    /// Returns `false` when the record was no longer `BUILDING`; the outcome
    /// is then discarded.
    async fn finish_build(&self, deployment_id: &str, outcome: &BuildOutcome) -> Result<bool>;

    /// Most recent records of a project, newest first.
    async fn list_recent(&self, project_id: &str, limit: usize) -> Result<Vec<DeploymentRecord>>;

    /// `BUILDING` records created before `cutoff`.
    async fn list_building_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<DeploymentRecord>>;
}

/// Read access to the live table metadata of a project.
#[async_trait]
pub trait TableCatalog: Send + Sync {
    /// Non-deleted tables of the project.
    async fn list_tables(&self, project_id: &str) -> Result<Vec<TableDefinition>>;
}

/// Project membership lookup.
#[async_trait]
pub trait AccessControl: Send + Sync {
    /// The user's role in the project, `None` when not a member.
    async fn project_role(&self, project_id: &str, user_id: &str) -> Result<Option<ProjectRole>>;
}

/// Append-only audit trail.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: &AuditLogEntry) -> Result<()>;
}

/// Executes generated DDL.
#[async_trait]
pub trait SchemaExecutor: Send + Sync {
    async fn execute_ddl(&self, statement: &str) -> Result<()>;
}

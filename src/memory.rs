//! In-memory port adapters and a settable clock
//!
//! Used by the unit tests and by callers that want to exercise the
//! deployment pipeline without a database.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeDelta, Utc};
use mockable::Clock;

use crate::audit::AuditLogEntry;
use crate::deployment::model::{
    BuildOutcome, DeploymentRecord, DeploymentStatus, Environment, ProjectRole,
};
use crate::error::{ProvisionError, Result};
use crate::ports::{AccessControl, AuditSink, DeploymentRepository, SchemaExecutor, TableCatalog};
use crate::types::TableDefinition;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Deployment records kept in a vector
#[derive(Debug, Default)]
pub struct InMemoryDeploymentRepository {
    records: Mutex<Vec<DeploymentRecord>>,
}

impl InMemoryDeploymentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every stored record
    pub fn records(&self) -> Vec<DeploymentRecord> {
        lock(&self.records).clone()
    }
}

#[async_trait]
impl DeploymentRepository for InMemoryDeploymentRepository {
    async fn insert(&self, record: &DeploymentRecord) -> Result<()> {
        let mut records = lock(&self.records);
        let duplicate = records.iter().any(|r| {
            r.project_id == record.project_id
                && r.environment == record.environment
                && r.version == record.version
        });
        if duplicate {
            return Err(ProvisionError::conflict(format!(
                "Version {} already deployed to {}",
                record.version, record.environment
            )));
        }
        records.push(record.clone());
        Ok(())
    }

    async fn find(&self, deployment_id: &str) -> Result<Option<DeploymentRecord>> {
        Ok(lock(&self.records)
            .iter()
            .find(|r| r.id == deployment_id)
            .cloned())
    }

    async fn version_exists(
        &self,
        project_id: &str,
        environment: Environment,
        version: &str,
    ) -> Result<bool> {
        Ok(lock(&self.records).iter().any(|r| {
            r.project_id == project_id && r.environment == environment && r.version == version
        }))
    }

    async fn finish_build(&self, deployment_id: &str, outcome: &BuildOutcome) -> Result<bool> {
        let mut records = lock(&self.records);
        let Some(record) = records
            .iter_mut()
            .find(|r| r.id == deployment_id && r.status == DeploymentStatus::Building)
        else {
            return Ok(false);
        };
        record.status = outcome.status;
        record.build_log = outcome.build_log.clone();
        record.build_time = Some(outcome.build_time);
        record.deployed_at = outcome.deployed_at;
        Ok(true)
    }

    async fn list_recent(&self, project_id: &str, limit: usize) -> Result<Vec<DeploymentRecord>> {
        let mut records: Vec<_> = lock(&self.records)
            .iter()
            .filter(|r| r.project_id == project_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn list_building_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<DeploymentRecord>> {
        Ok(lock(&self.records)
            .iter()
            .filter(|r| r.status == DeploymentStatus::Building && r.created_at < cutoff)
            .cloned()
            .collect())
    }
}

/// Live table definitions per project, in insertion order
#[derive(Debug, Default)]
pub struct InMemoryTableCatalog {
    tables: Mutex<HashMap<String, Vec<TableDefinition>>>,
}

impl InMemoryTableCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a table by name
    pub fn put_table(&self, project_id: &str, table: TableDefinition) {
        let mut tables = lock(&self.tables);
        let project = tables.entry(project_id.to_string()).or_default();
        match project.iter_mut().find(|t| t.name == table.name) {
            Some(existing) => *existing = table,
            None => project.push(table),
        }
    }

    pub fn remove_table(&self, project_id: &str, name: &str) {
        if let Some(project) = lock(&self.tables).get_mut(project_id) {
            project.retain(|t| t.name != name);
        }
    }
}

#[async_trait]
impl TableCatalog for InMemoryTableCatalog {
    async fn list_tables(&self, project_id: &str) -> Result<Vec<TableDefinition>> {
        Ok(lock(&self.tables)
            .get(project_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Fixed role assignments
#[derive(Debug, Default)]
pub struct StaticAccessControl {
    roles: Mutex<HashMap<(String, String), ProjectRole>>,
}

impl StaticAccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, project_id: &str, user_id: &str, role: ProjectRole) {
        lock(&self.roles).insert((project_id.to_string(), user_id.to_string()), role);
    }
}

#[async_trait]
impl AccessControl for StaticAccessControl {
    async fn project_role(&self, project_id: &str, user_id: &str) -> Result<Option<ProjectRole>> {
        Ok(lock(&self.roles)
            .get(&(project_id.to_string(), user_id.to_string()))
            .copied())
    }
}

/// Audit sink that keeps every entry
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    entries: Mutex<Vec<AuditLogEntry>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditLogEntry> {
        lock(&self.entries).clone()
    }
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn record(&self, entry: &AuditLogEntry) -> Result<()> {
        lock(&self.entries).push(entry.clone());
        Ok(())
    }
}

/// DDL executor that records statements instead of running them.
///
/// Can be told to fail statements containing a pattern, or to stall each
/// statement for a while.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    statements: Mutex<Vec<String>>,
    fail_pattern: Mutex<Option<String>>,
    delay: Option<Duration>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long before recording each statement
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail any statement containing `pattern`
    pub fn fail_when_contains(&self, pattern: impl Into<String>) {
        *lock(&self.fail_pattern) = Some(pattern.into());
    }

    pub fn statements(&self) -> Vec<String> {
        lock(&self.statements).clone()
    }
}

#[async_trait]
impl SchemaExecutor for RecordingExecutor {
    async fn execute_ddl(&self, statement: &str) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failing = lock(&self.fail_pattern)
            .as_deref()
            .is_some_and(|pattern| statement.contains(pattern));
        if failing {
            return Err(ProvisionError::execution(format!(
                "statement rejected: {}",
                statement
            )));
        }
        lock(&self.statements).push(statement.to_string());
        Ok(())
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct MutableClock(Mutex<DateTime<Utc>>);

impl MutableClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    pub fn advance(&self, delta: TimeDelta) {
        *lock(&self.0) += delta;
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *lock(&self.0) = now;
    }
}

impl Clock for MutableClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *lock(&self.0)
    }
}

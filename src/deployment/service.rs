//! Versioned deployment of a project's data model
//!
//! `deploy_data_model` validates, authorizes, snapshots and persists a
//! `BUILDING` record synchronously, then materializes the schema on the build
//! queue. Builds end in `DEPLOYED` or `FAILED` exactly once and each terminal
//! transition writes one audit entry. Nothing is rolled back on failure; the
//! build log records what was created.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, TimeDelta, Utc};
use mockable::Clock;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::audit::{AuditAction, AuditLogEntry};
use crate::config::DeploymentSettings;
use crate::deployment::model::{
    BuildLog, BuildOutcome, DeployResponse, DeploymentRecord, DeploymentRequest,
    DeploymentStatus, DeploymentStatusResponse, DeploymentSummary, ProjectRole,
};
use crate::deployment::queue::{BuildQueue, SchemaLocks};
use crate::error::{ProvisionError, Result};
use crate::ports::{AccessControl, AuditSink, DeploymentRepository, SchemaExecutor, TableCatalog};
use crate::sql::ddl::DdlGenerator;
use crate::sql::sanitize::{build_schema_name, build_table_name, qualified_name};
use crate::types::TableDefinition;

/// Clock shared with background builds
pub type SharedClock = Arc<dyn Clock + Send + Sync>;

/// Collaborators of the deployment service
#[derive(Clone)]
pub struct DeploymentPorts {
    pub deployments: Arc<dyn DeploymentRepository>,
    pub catalog: Arc<dyn TableCatalog>,
    pub access: Arc<dyn AccessControl>,
    pub audit: Arc<dyn AuditSink>,
    pub executor: Arc<dyn SchemaExecutor>,
}

/// Deployment pipeline
pub struct DeploymentService {
    ports: DeploymentPorts,
    clock: SharedClock,
    settings: DeploymentSettings,
    queue: BuildQueue,
    locks: Arc<SchemaLocks>,
}

impl DeploymentService {
    pub fn new(ports: DeploymentPorts, clock: SharedClock, settings: DeploymentSettings) -> Self {
        Self {
            ports,
            clock,
            settings,
            queue: BuildQueue::new(),
            locks: Arc::new(SchemaLocks::new()),
        }
    }

    pub fn settings(&self) -> &DeploymentSettings {
        &self.settings
    }

    /// Start a deployment and return as soon as the record is persisted
    #[tracing::instrument(
        skip(self, request),
        fields(version = %request.version, environment = %request.environment)
    )]
    pub async fn deploy_data_model(
        &self,
        project_id: &str,
        user_id: &str,
        request: DeploymentRequest,
    ) -> Result<DeployResponse> {
        request.validate()?;
        let schema_name = build_schema_name(project_id, request.environment.as_str())
            .map_err(|e| ProvisionError::validation(format!("Invalid project id: {}", e)))?;

        match self.role_of(project_id, user_id).await? {
            Some(role) if role.can_deploy() => {}
            _ => {
                return Err(ProvisionError::permission(
                    "Only project owners and admins can deploy the data model",
                ));
            }
        }

        if self
            .ports
            .deployments
            .version_exists(project_id, request.environment, &request.version)
            .await?
        {
            return Err(ProvisionError::conflict(format!(
                "Version {} has already been deployed to {}",
                request.version, request.environment
            )));
        }

        let table_snapshots = self.snapshot_tables(project_id).await?;

        let record = DeploymentRecord {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            version: request.version,
            environment: request.environment,
            status: DeploymentStatus::Building,
            deployed_by: user_id.to_string(),
            table_snapshots,
            change_log: request.change_log,
            metadata: request.metadata,
            schema_name,
            build_log: Vec::new(),
            build_time: None,
            created_at: self.clock.utc(),
            deployed_at: None,
        };
        self.ports.deployments.insert(&record).await?;

        tracing::info!(
            deployment_id = %record.id,
            schema = %record.schema_name,
            tables = record.table_snapshots.len(),
            "Deployment accepted"
        );

        let response = DeployResponse {
            deployment_id: record.id.clone(),
            version: record.version.clone(),
            environment: record.environment,
            status: record.status,
            table_count: record.table_snapshots.len(),
            schema_name: record.schema_name.clone(),
            created_at: record.created_at,
        };

        let build = Build {
            deployments: self.ports.deployments.clone(),
            audit: self.ports.audit.clone(),
            executor: self.ports.executor.clone(),
            clock: self.clock.clone(),
            locks: self.locks.clone(),
            deadline: self.settings.build_deadline,
        };
        self.queue.spawn(build.run(record));

        Ok(response)
    }

    /// Current state of one deployment, visible to project members
    #[tracing::instrument(skip(self))]
    pub async fn get_deployment_status(
        &self,
        deployment_id: &str,
        user_id: &str,
    ) -> Result<DeploymentStatusResponse> {
        let record = self
            .ports
            .deployments
            .find(deployment_id)
            .await?
            .ok_or_else(|| {
                ProvisionError::not_found(format!("Deployment '{}' not found", deployment_id))
            })?;

        self.require_member(&record.project_id, user_id).await?;

        let estimated_completion = (record.status == DeploymentStatus::Building).then(|| {
            let average = TimeDelta::from_std(self.settings.average_build_time)
                .unwrap_or_else(|_| TimeDelta::zero());
            record.created_at + average
        });

        let (api_url, access_token) = if record.status == DeploymentStatus::Deployed {
            (Some(self.api_url(&record)), Some(self.access_token(&record)))
        } else {
            (None, None)
        };

        Ok(DeploymentStatusResponse {
            deployment_id: record.id,
            version: record.version,
            environment: record.environment,
            status: record.status,
            progress: record.status.progress(),
            schema_name: record.schema_name,
            build_log: record.build_log,
            build_time: record.build_time,
            created_at: record.created_at,
            deployed_at: record.deployed_at,
            estimated_completion,
            api_url,
            access_token,
        })
    }

    /// Most recent deployments of a project, newest first.
    ///
    /// `limit` defaults to the configured history limit.
    #[tracing::instrument(skip(self))]
    pub async fn get_deployment_history(
        &self,
        project_id: &str,
        user_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<DeploymentSummary>> {
        self.require_member(project_id, user_id).await?;

        let limit = limit.unwrap_or(self.settings.history_limit).max(1);
        let records = self.ports.deployments.list_recent(project_id, limit).await?;
        Ok(records.iter().map(DeploymentSummary::from).collect())
    }

    /// Fail `BUILDING` records older than the stale-build threshold.
    ///
    /// Returns how many records this call moved to `FAILED`.
    #[tracing::instrument(skip(self))]
    pub async fn reap_stale_builds(&self) -> Result<usize> {
        let now = self.clock.utc();
        let threshold = TimeDelta::from_std(self.settings.stale_build_after)
            .map_err(|e| ProvisionError::validation(format!("Invalid stale-build threshold: {}", e)))?;
        let stale = self
            .ports
            .deployments
            .list_building_before(now - threshold)
            .await?;

        let mut reaped = 0;
        for record in stale {
            let reason = format!(
                "Build abandoned: still BUILDING after {}s",
                threshold.num_seconds()
            );
            let mut build_log = record.build_log.clone();
            build_log.push(reason.clone());

            let outcome = BuildOutcome {
                status: DeploymentStatus::Failed,
                build_log,
                build_time: (now - record.created_at).num_milliseconds(),
                deployed_at: None,
            };
            if !self.ports.deployments.finish_build(&record.id, &outcome).await? {
                continue;
            }

            tracing::warn!(deployment_id = %record.id, "Reaped stale build");
            let entry = AuditLogEntry::deployment(
                AuditAction::DeployDataModelFailed,
                &record.id,
                &record.project_id,
                &record.deployed_by,
                json!({
                    "version": record.version,
                    "environment": record.environment,
                    "schemaName": record.schema_name,
                    "error": reason,
                }),
                now,
            );
            if let Err(e) = self.ports.audit.record(&entry).await {
                tracing::error!(deployment_id = %record.id, error = %e, "Failed to write audit entry");
            }
            reaped += 1;
        }

        Ok(reaped)
    }

    /// Wait for every background build started by this service
    pub async fn wait_for_builds(&self) {
        self.queue.drain().await;
    }

    async fn role_of(&self, project_id: &str, user_id: &str) -> Result<Option<ProjectRole>> {
        self.ports.access.project_role(project_id, user_id).await
    }

    async fn require_member(&self, project_id: &str, user_id: &str) -> Result<ProjectRole> {
        self.role_of(project_id, user_id).await?.ok_or_else(|| {
            ProvisionError::permission(format!(
                "User '{}' is not a member of project '{}'",
                user_id, project_id
            ))
        })
    }

    /// Copy the project's live tables, columns in their declared order.
    ///
    /// Every name is checked here so a bad identifier is reported before any
    /// record exists.
    async fn snapshot_tables(&self, project_id: &str) -> Result<Vec<TableDefinition>> {
        let tables = self.ports.catalog.list_tables(project_id).await?;

        tables
            .into_iter()
            .map(|mut table| {
                table
                    .validate()
                    .and_then(|_| build_table_name(project_id, &table.name).map(|_| ()))
                    .map_err(|e| {
                        ProvisionError::validation(format!(
                            "Table '{}' cannot be deployed: {}",
                            table.name, e
                        ))
                    })?;
                table.columns = table.ordered_columns();
                Ok(table)
            })
            .collect()
    }

    fn api_url(&self, record: &DeploymentRecord) -> String {
        format!(
            "{}/projects/{}/{}",
            self.settings.api_base_url.trim_end_matches('/'),
            record.project_id,
            record.environment.as_str().to_lowercase()
        )
    }

    /// Opaque token derived on read; never persisted
    fn access_token(&self, record: &DeploymentRecord) -> String {
        let mut hasher = Sha256::new();
        hasher.update(record.id.as_bytes());
        hasher.update(b":");
        hasher.update(record.project_id.as_bytes());
        hasher.update(b":");
        hasher.update(record.environment.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(record.version.as_bytes());
        hasher.update(b":");
        hasher.update(self.settings.token_secret.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// State moved into a background build
struct Build {
    deployments: Arc<dyn DeploymentRepository>,
    audit: Arc<dyn AuditSink>,
    executor: Arc<dyn SchemaExecutor>,
    clock: SharedClock,
    locks: Arc<SchemaLocks>,
    deadline: std::time::Duration,
}

impl Build {
    #[tracing::instrument(
        name = "build",
        skip_all,
        fields(deployment_id = %record.id, schema = %record.schema_name)
    )]
    async fn run(self, record: DeploymentRecord) {
        let _guard = self.locks.acquire(&record.schema_name).await;

        let started = Instant::now();
        let mut log = BuildLog::new();
        let result =
            match tokio::time::timeout(self.deadline, self.materialize(&record, &mut log)).await {
                Ok(result) => result,
                Err(_) => Err(ProvisionError::execution(format!(
                    "Build exceeded the deadline of {}s",
                    self.deadline.as_secs_f64()
                ))),
            };
        let build_time = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
        let now = self.clock.utc();

        let (outcome, action, details) = match result {
            Ok(()) => {
                log.push(format!(
                    "Deployment {} completed in {}ms",
                    record.version, build_time
                ));
                tracing::info!(build_time_ms = build_time, "Deployment completed");
                (
                    BuildOutcome {
                        status: DeploymentStatus::Deployed,
                        build_log: log.into_lines(),
                        build_time,
                        deployed_at: Some(now),
                    },
                    AuditAction::DeployDataModel,
                    json!({ "tableCount": record.table_snapshots.len() }),
                )
            }
            Err(e) => {
                log.push(format!("Deployment failed: {}", e));
                tracing::error!(error = %e, build_time_ms = build_time, "Deployment failed");
                (
                    BuildOutcome {
                        status: DeploymentStatus::Failed,
                        build_log: log.into_lines(),
                        build_time,
                        deployed_at: None,
                    },
                    AuditAction::DeployDataModelFailed,
                    json!({ "error": e.to_string() }),
                )
            }
        };

        self.finish(&record, outcome, action, details, now).await;
    }

    /// Create the schema, then each table with its default index, in
    /// snapshot order. Stops at the first failure.
    async fn materialize(&self, record: &DeploymentRecord, log: &mut BuildLog) -> Result<()> {
        let ddl = DdlGenerator::new().if_not_exists();

        self.executor
            .execute_ddl(&ddl.generate_create_schema(&record.schema_name)?)
            .await?;
        log.push(format!("Schema {} ready", record.schema_name));

        let total = record.table_snapshots.len();
        for (position, table) in record.table_snapshots.iter().enumerate() {
            let step = format!("[{}/{}]", position + 1, total);
            match self.create_table(record, table, ddl).await {
                Ok(()) => log.push(format!("{} Created table {}", step, table.name)),
                Err(e) => {
                    log.push(format!("{} Failed to create table {}: {}", step, table.name, e));
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    async fn create_table(
        &self,
        record: &DeploymentRecord,
        table: &TableDefinition,
        ddl: DdlGenerator,
    ) -> Result<()> {
        let physical = format!("project_{}_{}", record.project_id, table.name);
        let target = qualified_name(
            &record.schema_name,
            &build_table_name(&record.project_id, &table.name)?,
        )?;

        let create = ddl.generate_create_table(&target, &table.columns)?;
        let index = ddl.generate_default_index(Some(&record.schema_name), &physical)?;

        self.executor.execute_ddl(&create).await?;
        self.executor.execute_ddl(&index).await?;
        Ok(())
    }

    /// Persist the terminal state and write its audit entry.
    ///
    /// Errors are logged; a build never propagates them.
    async fn finish(
        &self,
        record: &DeploymentRecord,
        outcome: BuildOutcome,
        action: AuditAction,
        details: serde_json::Value,
        now: DateTime<Utc>,
    ) {
        let build_time = outcome.build_time;
        match self.deployments.finish_build(&record.id, &outcome).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!("Deployment already reached a terminal state; outcome discarded");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to persist deployment outcome");
                return;
            }
        }

        let mut metadata = json!({
            "version": record.version,
            "environment": record.environment,
            "schemaName": record.schema_name,
            "buildTime": build_time,
        });
        if let (Some(target), Some(extra)) = (metadata.as_object_mut(), details.as_object()) {
            target.extend(extra.clone());
        }

        let entry = AuditLogEntry::deployment(
            action,
            &record.id,
            &record.project_id,
            &record.deployed_by,
            metadata,
            now,
        );
        if let Err(e) = self.audit.record(&entry).await {
            tracing::error!(error = %e, "Failed to write audit entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::model::{ChangeEntry, ChangeLog, ChangeType, Environment};
    use crate::memory::{
        InMemoryDeploymentRepository, InMemoryTableCatalog, MutableClock, RecordingAuditSink,
        RecordingExecutor, StaticAccessControl,
    };
    use crate::types::{ColumnDefinition, ColumnType};
    use chrono::TimeZone;
    use std::time::Duration;

    struct Harness {
        service: DeploymentService,
        deployments: Arc<InMemoryDeploymentRepository>,
        catalog: Arc<InMemoryTableCatalog>,
        audit: Arc<RecordingAuditSink>,
        executor: Arc<RecordingExecutor>,
        clock: Arc<MutableClock>,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0)
            .single()
            .expect("valid fixture timestamp")
    }

    fn harness_with(executor: RecordingExecutor, settings: DeploymentSettings) -> Harness {
        let deployments = Arc::new(InMemoryDeploymentRepository::new());
        let catalog = Arc::new(InMemoryTableCatalog::new());
        let access = Arc::new(StaticAccessControl::new());
        let audit = Arc::new(RecordingAuditSink::new());
        let executor = Arc::new(executor);
        let clock = Arc::new(MutableClock::new(t0()));

        access.grant("proj1", "owner1", ProjectRole::Owner);
        access.grant("proj1", "admin1", ProjectRole::Admin);
        access.grant("proj1", "editor1", ProjectRole::Editor);
        access.grant("proj1", "viewer1", ProjectRole::Viewer);

        catalog.put_table(
            "proj1",
            TableDefinition::new(
                "users",
                vec![ColumnDefinition::new("email", ColumnType::String).unique().not_null()],
            )
            .with_project("proj1"),
        );

        let ports = DeploymentPorts {
            deployments: deployments.clone(),
            catalog: catalog.clone(),
            access,
            audit: audit.clone(),
            executor: executor.clone(),
        };
        let service = DeploymentService::new(ports, clock.clone(), settings);

        Harness {
            service,
            deployments,
            catalog,
            audit,
            executor,
            clock,
        }
    }

    fn harness() -> Harness {
        harness_with(
            RecordingExecutor::new(),
            DeploymentSettings {
                token_secret: "test-secret".to_string(),
                api_base_url: "https://api.fastbuild.test/".to_string(),
                ..DeploymentSettings::default()
            },
        )
    }

    fn request(version: &str) -> DeploymentRequest {
        DeploymentRequest::new(
            version,
            Environment::Preview,
            ChangeLog {
                description: "init".to_string(),
                tables: vec!["users".to_string()],
                changes: vec![ChangeEntry::new(ChangeType::CreateTable, "users", "initial")],
            },
        )
    }

    // ==================== Happy path ====================

    #[tokio::test]
    async fn test_deploy_users_table_to_preview() {
        let h = harness();

        let response = h
            .service
            .deploy_data_model("proj1", "owner1", request("1.0.0"))
            .await
            .unwrap();

        assert_eq!(response.version, "1.0.0");
        assert_eq!(response.environment, Environment::Preview);
        assert_eq!(response.status, DeploymentStatus::Building);
        assert_eq!(response.table_count, 1);
        assert_eq!(response.schema_name, "fastbuild_proj1_preview");
        assert_eq!(response.created_at, t0());

        h.service.wait_for_builds().await;

        let status = h
            .service
            .get_deployment_status(&response.deployment_id, "owner1")
            .await
            .unwrap();
        assert_eq!(status.status, DeploymentStatus::Deployed);
        assert_eq!(status.progress, Some(100));
        assert_eq!(
            status.api_url.as_deref(),
            Some("https://api.fastbuild.test/projects/proj1/preview")
        );
        assert!(status.access_token.is_some());
        assert!(status.estimated_completion.is_none());
        assert!(status.build_time.is_some());

        let statements = h.executor.statements();
        assert_eq!(
            statements[0],
            "CREATE SCHEMA IF NOT EXISTS \"fastbuild_proj1_preview\""
        );
        assert!(statements[1].starts_with(
            "CREATE TABLE IF NOT EXISTS \"fastbuild_proj1_preview\".\"project_proj1_users\" ("
        ));
        assert!(statements[1].contains("\"email\" VARCHAR(255) UNIQUE NOT NULL"));
        assert!(statements[2].starts_with("CREATE INDEX IF NOT EXISTS"));

        let entries = h.audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::DeployDataModel);
        assert_eq!(entries[0].resource_id, response.deployment_id);
        assert_eq!(entries[0].user_id, "owner1");
        assert_eq!(entries[0].metadata["tableCount"], 1);
    }

    #[tokio::test]
    async fn test_admin_can_deploy_and_empty_model_is_allowed() {
        let h = harness();
        h.catalog.remove_table("proj1", "users");

        let response = h
            .service
            .deploy_data_model("proj1", "admin1", request("0.1.0"))
            .await
            .unwrap();
        assert_eq!(response.table_count, 0);

        h.service.wait_for_builds().await;
        let record = h.deployments.find(&response.deployment_id).await.unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Deployed);
        assert_eq!(h.executor.statements().len(), 1);
    }

    #[tokio::test]
    async fn test_status_while_building() {
        let h = harness_with(
            RecordingExecutor::new().with_delay(Duration::from_millis(50)),
            DeploymentSettings::default(),
        );

        let response = h
            .service
            .deploy_data_model("proj1", "owner1", request("1.0.0"))
            .await
            .unwrap();

        let status = h
            .service
            .get_deployment_status(&response.deployment_id, "viewer1")
            .await
            .unwrap();
        assert_eq!(status.status, DeploymentStatus::Building);
        assert_eq!(status.progress, Some(50));
        assert_eq!(
            status.estimated_completion,
            Some(t0() + TimeDelta::seconds(30))
        );
        assert!(status.api_url.is_none());
        assert!(status.access_token.is_none());

        h.service.wait_for_builds().await;
    }

    #[tokio::test]
    async fn test_access_token_is_stable_and_secret_bound() {
        let h = harness();
        let response = h
            .service
            .deploy_data_model("proj1", "owner1", request("1.0.0"))
            .await
            .unwrap();
        h.service.wait_for_builds().await;

        let first = h
            .service
            .get_deployment_status(&response.deployment_id, "owner1")
            .await
            .unwrap()
            .access_token
            .unwrap();
        let second = h
            .service
            .get_deployment_status(&response.deployment_id, "viewer1")
            .await
            .unwrap()
            .access_token
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));

        let record = h.deployments.find(&response.deployment_id).await.unwrap().unwrap();
        let serialized = serde_json::to_string(&record).unwrap();
        assert!(!serialized.contains(&first));
    }

    // ==================== Synchronous rejections ====================

    #[tokio::test]
    async fn test_editor_and_viewer_cannot_deploy() {
        let h = harness();
        for user in ["editor1", "viewer1", "stranger"] {
            let err = h
                .service
                .deploy_data_model("proj1", user, request("1.0.0"))
                .await
                .unwrap_err();
            assert!(matches!(err, ProvisionError::Permission(_)), "{user}");
        }
        assert!(h.deployments.records().is_empty());
        assert!(h.audit.entries().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected_before_anything_runs() {
        let h = harness();
        let err = h
            .service
            .deploy_data_model("proj1", "owner1", request("1.0"))
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let err = h
            .service
            .deploy_data_model("proj-1", "owner1", request("1.0.0"))
            .await
            .unwrap_err();
        assert!(err.is_validation());

        assert!(h.deployments.records().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_version_conflicts() {
        let h = harness();
        h.service
            .deploy_data_model("proj1", "owner1", request("1.0.0"))
            .await
            .unwrap();

        let err = h
            .service
            .deploy_data_model("proj1", "owner1", request("1.0.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Conflict(_)));

        let mut production = request("1.0.0");
        production.environment = Environment::Production;
        let response = h
            .service
            .deploy_data_model("proj1", "owner1", production)
            .await
            .unwrap();
        assert_eq!(response.schema_name, "fastbuild_proj1_production");

        h.service.wait_for_builds().await;
        assert_eq!(h.deployments.records().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_table_in_catalog_fails_synchronously() {
        let h = harness();
        h.catalog
            .put_table("proj1", TableDefinition::new("order", vec![]));

        let err = h
            .service
            .deploy_data_model("proj1", "owner1", request("1.0.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Validation(_)));
        assert!(h.deployments.records().is_empty());
    }

    // ==================== Asynchronous failures ====================

    #[tokio::test]
    async fn test_failure_on_nth_table() {
        let h = harness();
        h.catalog.put_table("proj1", TableDefinition::new("orders", vec![]));
        h.catalog.put_table("proj1", TableDefinition::new("invoices", vec![]));
        h.executor.fail_when_contains("project_proj1_orders");

        let response = h
            .service
            .deploy_data_model("proj1", "owner1", request("1.0.0"))
            .await
            .unwrap();
        assert_eq!(response.table_count, 3);
        h.service.wait_for_builds().await;

        let record = h.deployments.find(&response.deployment_id).await.unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Failed);
        assert!(record.deployed_at.is_none());
        assert!(record.build_time.is_some());

        let log = record.build_log.join("\n");
        assert!(log.contains("[1/3] Created table users"));
        assert!(log.contains("[2/3] Failed to create table orders"));
        assert!(!log.contains("invoices"));

        let entries = h.audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::DeployDataModelFailed);
        assert!(
            entries[0].metadata["error"]
                .as_str()
                .unwrap()
                .contains("statement rejected")
        );

        let status = h
            .service
            .get_deployment_status(&response.deployment_id, "owner1")
            .await
            .unwrap();
        assert_eq!(status.progress, None);
        assert!(status.api_url.is_none());
    }

    #[tokio::test]
    async fn test_build_exceeding_deadline_fails() {
        let h = harness_with(
            RecordingExecutor::new().with_delay(Duration::from_millis(500)),
            DeploymentSettings {
                build_deadline: Duration::from_millis(20),
                ..DeploymentSettings::default()
            },
        );

        let response = h
            .service
            .deploy_data_model("proj1", "owner1", request("1.0.0"))
            .await
            .unwrap();
        h.service.wait_for_builds().await;

        let record = h.deployments.find(&response.deployment_id).await.unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Failed);
        assert!(record.build_log.last().unwrap().contains("deadline"));
        assert_eq!(h.audit.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_snapshots_do_not_follow_catalog_edits() {
        let h = harness();
        let response = h
            .service
            .deploy_data_model("proj1", "owner1", request("1.0.0"))
            .await
            .unwrap();
        h.service.wait_for_builds().await;

        h.catalog.put_table(
            "proj1",
            TableDefinition::new(
                "users",
                vec![
                    ColumnDefinition::new("email", ColumnType::String),
                    ColumnDefinition::new("nickname", ColumnType::Text),
                ],
            ),
        );

        let record = h.deployments.find(&response.deployment_id).await.unwrap().unwrap();
        assert_eq!(record.table_snapshots.len(), 1);
        assert_eq!(record.table_snapshots[0].columns.len(), 1);
        assert!(record.table_snapshots[0].columns[0].unique);
    }

    #[tokio::test]
    async fn test_snapshot_orders_columns() {
        let h = harness();
        h.catalog.put_table(
            "proj1",
            TableDefinition::new(
                "users",
                vec![
                    ColumnDefinition::new("b", ColumnType::Text).order(2),
                    ColumnDefinition::new("a", ColumnType::Text).order(1),
                ],
            ),
        );

        let response = h
            .service
            .deploy_data_model("proj1", "owner1", request("1.0.0"))
            .await
            .unwrap();
        h.service.wait_for_builds().await;

        let record = h.deployments.find(&response.deployment_id).await.unwrap().unwrap();
        let names: Vec<_> = record.table_snapshots[0]
            .columns
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    // ==================== Status / history access ====================

    #[tokio::test]
    async fn test_status_unknown_and_non_member() {
        let h = harness();
        let err = h
            .service
            .get_deployment_status("missing", "owner1")
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::NotFound(_)));

        let response = h
            .service
            .deploy_data_model("proj1", "owner1", request("1.0.0"))
            .await
            .unwrap();
        let err = h
            .service
            .get_deployment_status(&response.deployment_id, "stranger")
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Permission(_)));
        h.service.wait_for_builds().await;
    }

    #[tokio::test]
    async fn test_history_newest_first_with_limit() {
        let h = harness();
        for version in ["1.0.0", "1.1.0", "1.2.0"] {
            h.service
                .deploy_data_model("proj1", "owner1", request(version))
                .await
                .unwrap();
            h.clock.advance(TimeDelta::minutes(1));
        }
        h.service.wait_for_builds().await;

        let history = h
            .service
            .get_deployment_history("proj1", "viewer1", None)
            .await
            .unwrap();
        let versions: Vec<_> = history.iter().map(|s| s.version.as_str()).collect();
        assert_eq!(versions, vec!["1.2.0", "1.1.0", "1.0.0"]);
        assert!(history.iter().all(|s| s.table_count == 1));

        let limited = h
            .service
            .get_deployment_history("proj1", "viewer1", Some(1))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].version, "1.2.0");

        let err = h
            .service
            .get_deployment_history("proj1", "stranger", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Permission(_)));
    }

    // ==================== Reaper ====================

    #[tokio::test]
    async fn test_reaper_fails_stale_builds_once() {
        let h = harness();
        let record = DeploymentRecord {
            id: "stale-1".to_string(),
            project_id: "proj1".to_string(),
            version: "0.9.0".to_string(),
            environment: Environment::Preview,
            status: DeploymentStatus::Building,
            deployed_by: "owner1".to_string(),
            table_snapshots: Vec::new(),
            change_log: ChangeLog::default(),
            metadata: serde_json::Value::Null,
            schema_name: "fastbuild_proj1_preview".to_string(),
            build_log: Vec::new(),
            build_time: None,
            created_at: t0(),
            deployed_at: None,
        };
        h.deployments.insert(&record).await.unwrap();

        assert_eq!(h.service.reap_stale_builds().await.unwrap(), 0);

        h.clock.advance(TimeDelta::minutes(16));
        assert_eq!(h.service.reap_stale_builds().await.unwrap(), 1);
        assert_eq!(h.service.reap_stale_builds().await.unwrap(), 0);

        let reaped = h.deployments.find("stale-1").await.unwrap().unwrap();
        assert_eq!(reaped.status, DeploymentStatus::Failed);
        assert_eq!(reaped.build_time, Some(16 * 60 * 1000));

        let entries = h.audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::DeployDataModelFailed);
    }

    #[tokio::test]
    async fn test_reaper_ignores_finished_builds() {
        let h = harness();
        h.service
            .deploy_data_model("proj1", "owner1", request("1.0.0"))
            .await
            .unwrap();
        h.service.wait_for_builds().await;

        h.clock.advance(TimeDelta::hours(2));
        assert_eq!(h.service.reap_stale_builds().await.unwrap(), 0);
        assert_eq!(h.audit.entries().len(), 1);
    }
}

//! Deployment request, record and response types

use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProvisionError, Result};
use crate::sql::sanitize::validate_identifier;
use crate::types::TableDefinition;

static SEMVER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(0|[1-9]\d*)\.(0|[1-9]\d*)\.(0|[1-9]\d*)(-[0-9A-Za-z-]+(\.[0-9A-Za-z-]+)*)?(\+[0-9A-Za-z-]+(\.[0-9A-Za-z-]+)*)?$",
    )
    .expect("semver pattern is valid")
});

/// Target environment of a deployment
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Environment {
    Preview,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Preview => "PREVIEW",
            Environment::Production => "PRODUCTION",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "PREVIEW" => Ok(Environment::Preview),
            "PRODUCTION" => Ok(Environment::Production),
            other => Err(ProvisionError::validation(format!(
                "Unknown environment '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment lifecycle state. `Deployed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Building,
    Deployed,
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Building => "BUILDING",
            DeploymentStatus::Deployed => "DEPLOYED",
            DeploymentStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "BUILDING" => Ok(DeploymentStatus::Building),
            "DEPLOYED" => Ok(DeploymentStatus::Deployed),
            "FAILED" => Ok(DeploymentStatus::Failed),
            other => Err(ProvisionError::database(format!(
                "Unknown deployment status '{}'",
                other
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeploymentStatus::Building)
    }

    /// Percent complete as reported to pollers
    pub fn progress(&self) -> Option<u8> {
        match self {
            DeploymentStatus::Building => Some(50),
            DeploymentStatus::Deployed => Some(100),
            DeploymentStatus::Failed => None,
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of change listed in a change log
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    CreateTable,
    UpdateTable,
    DeleteTable,
    AddColumn,
    UpdateColumn,
    DeleteColumn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEntry {
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub table_name: String,
    #[serde(default)]
    pub description: String,
}

impl ChangeEntry {
    pub fn new(
        change_type: ChangeType,
        table_name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            change_type,
            table_name: table_name.into(),
            description: description.into(),
        }
    }
}

/// Human-authored summary of what a deployment changes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeLog {
    pub description: String,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub changes: Vec<ChangeEntry>,
}

/// Request to publish the current data model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRequest {
    pub version: String,
    pub environment: Environment,
    pub change_log: ChangeLog,
    #[serde(default)]
    pub metadata: Value,
}

impl DeploymentRequest {
    pub fn new(version: impl Into<String>, environment: Environment, change_log: ChangeLog) -> Self {
        Self {
            version: version.into(),
            environment,
            change_log,
            metadata: Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Check version format and change log structure
    pub fn validate(&self) -> Result<()> {
        if !SEMVER_PATTERN.is_match(&self.version) {
            return Err(ProvisionError::validation(format!(
                "Version '{}' is not a semantic version (MAJOR.MINOR.PATCH)",
                self.version
            )));
        }

        if self.change_log.description.trim().is_empty() {
            return Err(ProvisionError::validation(
                "Change log description cannot be empty",
            ));
        }

        let table_names = self
            .change_log
            .tables
            .iter()
            .chain(self.change_log.changes.iter().map(|c| &c.table_name));
        for name in table_names {
            validate_identifier(name).map_err(|e| {
                ProvisionError::validation(format!("Change log references invalid table: {}", e))
            })?;
        }

        if !matches!(self.metadata, Value::Null | Value::Object(_)) {
            return Err(ProvisionError::validation("Metadata must be a JSON object"));
        }

        Ok(())
    }
}

/// Durable deployment record
///
/// `table_snapshots` is fixed at creation; only the status, build log, build
/// time and deployed-at fields change, and only once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    pub id: String,
    pub project_id: String,
    pub version: String,
    pub environment: Environment,
    pub status: DeploymentStatus,
    pub deployed_by: String,
    pub table_snapshots: Vec<TableDefinition>,
    pub change_log: ChangeLog,
    pub metadata: Value,
    pub schema_name: String,
    pub build_log: Vec<String>,
    /// Build duration in milliseconds
    pub build_time: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub deployed_at: Option<DateTime<Utc>>,
}

/// Terminal outcome written by a build or the reaper
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOutcome {
    pub status: DeploymentStatus,
    pub build_log: Vec<String>,
    pub build_time: i64,
    pub deployed_at: Option<DateTime<Utc>>,
}

/// Lines accumulated while materializing a deployment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildLog {
    lines: Vec<String>,
}

impl BuildLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }
}

/// Immediate answer to a deployment request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployResponse {
    pub deployment_id: String,
    pub version: String,
    pub environment: Environment,
    pub status: DeploymentStatus,
    pub table_count: usize,
    pub schema_name: String,
    pub created_at: DateTime<Utc>,
}

/// Polled deployment state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatusResponse {
    pub deployment_id: String,
    pub version: String,
    pub environment: Environment,
    pub status: DeploymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    pub schema_name: String,
    pub build_log: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_time: Option<i64>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_completion: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

/// History row, without build log or snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSummary {
    pub id: String,
    pub version: String,
    pub environment: Environment,
    pub status: DeploymentStatus,
    pub deployed_by: String,
    pub table_count: usize,
    pub schema_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_time: Option<i64>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<DateTime<Utc>>,
}

impl From<&DeploymentRecord> for DeploymentSummary {
    fn from(record: &DeploymentRecord) -> Self {
        Self {
            id: record.id.clone(),
            version: record.version.clone(),
            environment: record.environment,
            status: record.status,
            deployed_by: record.deployed_by.clone(),
            table_count: record.table_snapshots.len(),
            schema_name: record.schema_name.clone(),
            build_time: record.build_time,
            created_at: record.created_at,
            deployed_at: record.deployed_at,
        }
    }
}

/// A member's role within a project
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectRole {
    Owner,
    Admin,
    Editor,
    Viewer,
}

impl ProjectRole {
    pub fn can_deploy(&self) -> bool {
        matches!(self, ProjectRole::Owner | ProjectRole::Admin)
    }
}

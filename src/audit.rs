//! Append-only audit trail entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Resource type recorded for deployment events
pub const RESOURCE_DEPLOYMENT: &str = "deployment";

/// Stable action identifiers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    DeployDataModel,
    DeployDataModelFailed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::DeployDataModel => "DEPLOY_DATA_MODEL",
            AuditAction::DeployDataModelFailed => "DEPLOY_DATA_MODEL_FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "DEPLOY_DATA_MODEL" => Some(AuditAction::DeployDataModel),
            "DEPLOY_DATA_MODEL_FAILED" => Some(AuditAction::DeployDataModelFailed),
            _ => None,
        }
    }
}

/// One audit event. Entries are written once and never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: String,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: String,
    pub project_id: String,
    pub user_id: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl AuditLogEntry {
    /// Entry about a deployment record
    pub fn deployment(
        action: AuditAction,
        deployment_id: impl Into<String>,
        project_id: impl Into<String>,
        user_id: impl Into<String>,
        metadata: Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            action,
            resource_type: RESOURCE_DEPLOYMENT.to_string(),
            resource_id: deployment_id.into(),
            project_id: project_id.into(),
            user_id: user_id.into(),
            metadata,
            created_at,
        }
    }
}

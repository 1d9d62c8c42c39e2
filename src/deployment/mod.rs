//! Deployment pipeline: request and record types, build queue and service

pub mod model;
pub mod queue;
pub mod service;

pub use model::{
    BuildLog, BuildOutcome, ChangeEntry, ChangeLog, ChangeType, DeployResponse, DeploymentRecord,
    DeploymentRequest, DeploymentStatus, DeploymentStatusResponse, DeploymentSummary, Environment,
    ProjectRole,
};
pub use queue::{BuildQueue, SchemaLocks};
pub use service::{DeploymentPorts, DeploymentService, SharedClock};

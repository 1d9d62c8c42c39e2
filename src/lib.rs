//! # fastbuild-provisioner
//!
//! Versioned provisioning of metadata-defined PostgreSQL schemas.
//!
//! Projects describe their tables as metadata ([`TableDefinition`]). A
//! deployment snapshots those definitions under a semantic version and
//! materializes them into a dedicated schema per project and environment
//! (`fastbuild_<project>_<env>`), in the background. Callers poll the
//! deployment status until it reaches `DEPLOYED` or `FAILED`.
//!
//! ## Features
//!
//! - **Deployments**: semver-checked, one per (project, environment, version),
//!   built asynchronously with a per-schema lock and a build deadline
//! - **Audit Trail**: every terminal build writes one audit entry
//! - **Query Builder**: parameterized SELECT/INSERT/UPDATE/soft DELETE over
//!   dynamic tables, with typed placeholder casts
//! - **Views**: default, custom and aggregated (materialized) view DDL
//! - **Localized Listing**: ICU collation sorting, search and pagination
//! - **SQL Injection Prevention**: every identifier is validated and quoted
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use fastbuild_provisioner::memory::StaticAccessControl;
//! use fastbuild_provisioner::{
//!     ChangeLog, DeploymentPorts, DeploymentRequest, DeploymentService, Environment, PgProvisionStore,
//!     ProjectRole, ProvisionerConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProvisionerConfig::builder("postgres://localhost/mydb").build()?;
//!     let settings = config.deployment.clone();
//!     let store = Arc::new(PgProvisionStore::new(config).await?);
//!
//!     let access = Arc::new(StaticAccessControl::new());
//!     access.grant("acme", "alice", ProjectRole::Owner);
//!
//!     let ports = DeploymentPorts {
//!         deployments: store.clone(),
//!         catalog: store.clone(),
//!         access,
//!         audit: store.clone(),
//!         executor: store,
//!     };
//!     let service = DeploymentService::new(ports, Arc::new(mockable::DefaultClock), settings);
//!
//!     let accepted = service
//!         .deploy_data_model(
//!             "acme",
//!             "alice",
//!             DeploymentRequest::new(
//!                 "1.0.0",
//!                 Environment::Preview,
//!                 ChangeLog {
//!                     description: "Initial model".to_string(),
//!                     ..Default::default()
//!                 },
//!             ),
//!         )
//!         .await?;
//!
//!     service.wait_for_builds().await;
//!     let status = service
//!         .get_deployment_status(&accepted.deployment_id, "alice")
//!         .await?;
//!     println!("{} -> {}", status.schema_name, status.status);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! ```rust
//! use std::time::Duration;
//! use fastbuild_provisioner::ProvisionerConfig;
//!
//! let config = ProvisionerConfig::builder("postgres://localhost/mydb")
//!     .metadata_prefix("fb_")                       // fb_data_tables, fb_deployments, fb_audit_log
//!     .history_limit(20)                            // Default history page size
//!     .build_deadline(Duration::from_secs(120))     // Builds running longer fail
//!     .stale_build_after(Duration::from_secs(600))  // Reaper threshold
//!     .build()
//!     .unwrap();
//! ```
//!
//! [`ProvisionerConfig::from_env`] reads the same settings from `DATABASE_URL`
//! and the `FASTBUILD_*` variables.

pub mod audit;
pub mod config;
pub mod deployment;
pub mod error;
pub mod memory;
pub mod ports;
pub mod sql;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use audit::{AuditAction, AuditLogEntry};
pub use config::{DeploymentSettings, MetadataTables, ProvisionerConfig, ProvisionerConfigBuilder};
pub use deployment::{
    ChangeEntry, ChangeLog, ChangeType, DeployResponse, DeploymentPorts, DeploymentRecord,
    DeploymentRequest, DeploymentService, DeploymentStatus, DeploymentStatusResponse,
    DeploymentSummary, Environment, ProjectRole,
};
pub use error::{ProvisionError, Result};
pub use ports::{AccessControl, AuditSink, DeploymentRepository, SchemaExecutor, TableCatalog};
pub use store::PgProvisionStore;
pub use types::{ColumnDefinition, ColumnType, TableDefinition};

// Re-export SQL builders for advanced users
pub use sql::ddl::DdlGenerator;
pub use sql::filter::{Filter, Sort};
pub use sql::locale::{ListOptions, LocaleQueryService, PageInfo};
pub use sql::query::{QueryBuilder, SelectOptions, SqlStatement};
pub use sql::sanitize::{build_schema_name, validate_identifier};
pub use sql::view::ViewBuilder;

//! Configuration for the provisioner
//!
//! Provides a builder for the store and deployment settings, plus
//! environment-driven loading through [`mockable::Env`].

use std::time::Duration;

use mockable::Env;

use crate::error::{ProvisionError, Result};
use crate::sql::sanitize::validate_identifier;

const DATABASE_URL_ENV: &str = "DATABASE_URL";
const HISTORY_LIMIT_ENV: &str = "FASTBUILD_HISTORY_LIMIT";
const AVERAGE_BUILD_SECS_ENV: &str = "FASTBUILD_AVERAGE_BUILD_SECS";
const BUILD_DEADLINE_SECS_ENV: &str = "FASTBUILD_BUILD_DEADLINE_SECS";
const STALE_BUILD_SECS_ENV: &str = "FASTBUILD_STALE_BUILD_SECS";
const API_BASE_URL_ENV: &str = "FASTBUILD_API_BASE_URL";
const TOKEN_SECRET_ENV: &str = "FASTBUILD_TOKEN_SECRET";
const METADATA_PREFIX_ENV: &str = "FASTBUILD_METADATA_PREFIX";

/// Names of the metadata tables owned by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataTables {
    /// Table definitions (default: "__data_tables")
    pub tables: String,
    /// Deployment records (default: "__deployments")
    pub deployments: String,
    /// Audit log (default: "__audit_log")
    pub audit_log: String,
}

impl Default for MetadataTables {
    fn default() -> Self {
        Self::with_prefix("__")
    }
}

impl MetadataTables {
    /// All three tables sharing a prefix, e.g. `fb_` gives `fb_data_tables`
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            tables: format!("{}data_tables", prefix),
            deployments: format!("{}deployments", prefix),
            audit_log: format!("{}audit_log", prefix),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.tables)?;
        validate_identifier(&self.deployments)?;
        validate_identifier(&self.audit_log)?;
        Ok(())
    }
}

/// Tunables of the deployment pipeline
#[derive(Debug, Clone)]
pub struct DeploymentSettings {
    /// Default number of history entries returned
    pub history_limit: usize,
    /// Expected build duration, used for `estimatedCompletion`
    pub average_build_time: Duration,
    /// Builds running longer than this fail
    pub build_deadline: Duration,
    /// `BUILDING` records older than this are failed by the reaper.
    /// Keep it above `build_deadline`.
    pub stale_build_after: Duration,
    /// Base of the API URL reported for deployed schemas
    pub api_base_url: String,
    /// Secret mixed into derived access tokens
    pub token_secret: String,
}

impl Default for DeploymentSettings {
    fn default() -> Self {
        Self {
            history_limit: 10,
            average_build_time: Duration::from_secs(30),
            build_deadline: Duration::from_secs(300),
            stale_build_after: Duration::from_secs(900),
            api_base_url: "http://localhost:3000/api".to_string(),
            token_secret: String::new(),
        }
    }
}

/// Configuration for the provisioner
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// PostgreSQL database URL
    pub database_url: String,
    /// Metadata table names
    pub metadata: MetadataTables,
    /// Deployment pipeline settings
    pub deployment: DeploymentSettings,
}

impl ProvisionerConfig {
    /// Create a new configuration builder
    pub fn builder(database_url: impl Into<String>) -> ProvisionerConfigBuilder {
        ProvisionerConfigBuilder::new(database_url)
    }

    /// Load from `DATABASE_URL` and the `FASTBUILD_*` overrides
    pub fn from_env<E: Env>(env: &E) -> Result<Self> {
        let database_url = env.string(DATABASE_URL_ENV).ok_or_else(|| {
            ProvisionError::validation(format!(
                "missing required environment variable: {}",
                DATABASE_URL_ENV
            ))
        })?;

        let mut builder = Self::builder(database_url);

        if let Some(prefix) = env.string(METADATA_PREFIX_ENV) {
            builder = builder.metadata_prefix(&prefix);
        }
        if let Some(limit) = parse_env::<usize, _>(env, HISTORY_LIMIT_ENV)? {
            builder = builder.history_limit(limit);
        }
        if let Some(secs) = parse_env::<u64, _>(env, AVERAGE_BUILD_SECS_ENV)? {
            builder = builder.average_build_time(Duration::from_secs(secs));
        }
        if let Some(secs) = parse_env::<u64, _>(env, BUILD_DEADLINE_SECS_ENV)? {
            builder = builder.build_deadline(Duration::from_secs(secs));
        }
        if let Some(secs) = parse_env::<u64, _>(env, STALE_BUILD_SECS_ENV)? {
            builder = builder.stale_build_after(Duration::from_secs(secs));
        }
        if let Some(url) = env.string(API_BASE_URL_ENV) {
            builder = builder.api_base_url(url);
        }
        if let Some(secret) = env.string(TOKEN_SECRET_ENV) {
            builder = builder.token_secret(secret);
        }

        builder.build()
    }
}

fn parse_env<T, E>(env: &E, name: &'static str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    E: Env,
{
    match env.string(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            ProvisionError::validation(format!("invalid value for {}='{}'", name, raw))
        }),
    }
}

/// Builder for ProvisionerConfig
#[derive(Debug)]
pub struct ProvisionerConfigBuilder {
    database_url: String,
    metadata: MetadataTables,
    deployment: DeploymentSettings,
}

impl ProvisionerConfigBuilder {
    /// Create a new builder with the database URL
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            metadata: MetadataTables::default(),
            deployment: DeploymentSettings::default(),
        }
    }

    /// Prefix for all metadata tables (default: "__")
    pub fn metadata_prefix(mut self, prefix: &str) -> Self {
        self.metadata = MetadataTables::with_prefix(prefix);
        self
    }

    /// Set the table-definition metadata table name
    pub fn tables_table(mut self, name: impl Into<String>) -> Self {
        self.metadata.tables = name.into();
        self
    }

    /// Set the deployment metadata table name
    pub fn deployments_table(mut self, name: impl Into<String>) -> Self {
        self.metadata.deployments = name.into();
        self
    }

    /// Set the audit log table name
    pub fn audit_table(mut self, name: impl Into<String>) -> Self {
        self.metadata.audit_log = name.into();
        self
    }

    /// Default history page size (default: 10)
    pub fn history_limit(mut self, limit: usize) -> Self {
        self.deployment.history_limit = limit;
        self
    }

    pub fn average_build_time(mut self, duration: Duration) -> Self {
        self.deployment.average_build_time = duration;
        self
    }

    pub fn build_deadline(mut self, duration: Duration) -> Self {
        self.deployment.build_deadline = duration;
        self
    }

    pub fn stale_build_after(mut self, duration: Duration) -> Self {
        self.deployment.stale_build_after = duration;
        self
    }

    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.deployment.api_base_url = url.into();
        self
    }

    pub fn token_secret(mut self, secret: impl Into<String>) -> Self {
        self.deployment.token_secret = secret.into();
        self
    }

    /// Build the configuration
    ///
    /// Fails when a metadata table name is not a valid identifier or the
    /// history limit is zero.
    pub fn build(self) -> Result<ProvisionerConfig> {
        self.metadata.validate()?;
        if self.deployment.history_limit == 0 {
            return Err(ProvisionError::validation("history limit must be positive"));
        }
        if self.deployment.stale_build_after <= self.deployment.build_deadline {
            tracing::warn!(
                stale_build_after = ?self.deployment.stale_build_after,
                build_deadline = ?self.deployment.build_deadline,
                "Stale-build threshold does not exceed the build deadline; running builds may be reaped"
            );
        }
        Ok(ProvisionerConfig {
            database_url: self.database_url,
            metadata: self.metadata,
            deployment: self.deployment,
        })
    }
}

//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    /// Disable SSL/TLS entirely.
    Disable,
    /// Prefer SSL/TLS but allow unencrypted connections (default).
    #[default]
    Prefer,
    /// Require SSL/TLS for all connections.
    Require,
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database (single-node deployments and tests).
    Sqlite {
        /// Database file path, or `:memory:`.
        path: PathBuf,
        /// Query timeout in seconds (advisory only - SQLite cannot force-cancel queries).
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL (optional if using individual fields).
        /// Takes precedence over individual fields if both are provided.
        url: Option<String>,
        /// Database host (e.g., "localhost" or "db.example.com").
        host: Option<String>,
        /// Database port (default: 5432).
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        /// Database username.
        username: Option<String>,
        /// Database password.
        /// WARNING: Prefer TIDEMARK_METADATA__PASSWORD env var over storing in config.
        password: Option<String>,
        /// Database name.
        database: Option<String>,
        /// SSL mode for connections.
        ssl_mode: Option<PgSslMode>,
        /// Maximum connections in the pool.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Statement timeout in milliseconds.
        /// PostgreSQL cancels queries that exceed this duration.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_max_connections() -> u32 {
    10
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(300000) // 5 minutes
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(600) // 10 minutes (advisory only)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/tidemark.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                max_connections,
                ..
            } => {
                if *max_connections == 0 {
                    return Err("postgres max_connections must be at least 1".to_string());
                }
                match (url.as_ref(), host.as_ref(), database.as_ref()) {
                    (Some(_), _, _) => Ok(()),
                    (None, Some(_), Some(_)) => Ok(()),
                    (None, None, _) => Err(
                        "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                    ),
                    (None, Some(_), None) => Err(
                        "postgres config requires 'database' when using individual fields"
                            .to_string(),
                    ),
                }
            }
        }
    }
}

/// Commit graph visibility configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VisibilityConfig {
    /// Non-default branches created within this window protect their uploads.
    #[serde(default = "default_max_age_for_non_stale_branches_secs")]
    pub max_age_for_non_stale_branches_secs: u64,
    /// Tags created within this window protect their uploads.
    #[serde(default = "default_max_age_for_non_stale_tags_secs")]
    pub max_age_for_non_stale_tags_secs: u64,
    /// Rows per staging insert statement.
    #[serde(default = "default_staging_batch_size")]
    pub staging_batch_size: usize,
    /// Capacity of each producer channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_max_age_for_non_stale_branches_secs() -> u64 {
    90 * 24 * 3600 // 90 days
}

fn default_max_age_for_non_stale_tags_secs() -> u64 {
    365 * 24 * 3600 // 1 year
}

fn default_staging_batch_size() -> usize {
    500
}

fn default_channel_capacity() -> usize {
    1024
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            max_age_for_non_stale_branches_secs: default_max_age_for_non_stale_branches_secs(),
            max_age_for_non_stale_tags_secs: default_max_age_for_non_stale_tags_secs(),
            staging_batch_size: default_staging_batch_size(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl VisibilityConfig {
    /// Branch window a commit-graph updater passes to `sync_visibility`.
    pub fn max_age_for_non_stale_branches(&self) -> Duration {
        saturating_seconds(self.max_age_for_non_stale_branches_secs)
    }

    /// Tag window a commit-graph updater passes to `sync_visibility`.
    pub fn max_age_for_non_stale_tags(&self) -> Duration {
        saturating_seconds(self.max_age_for_non_stale_tags_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.staging_batch_size == 0 {
            return Err("visibility.staging_batch_size must be at least 1".to_string());
        }
        if self.channel_capacity == 0 {
            return Err("visibility.channel_capacity must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Reclamation and cleanup scheduling configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JanitorConfig {
    /// Seconds between janitor cycles.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Expired uploads examined per reference-count pass.
    #[serde(default = "default_reference_count_batch_size")]
    pub reference_count_batch_size: u32,
    /// Maximum uploads one traversal may visit before giving up.
    #[serde(default = "default_traversal_limit")]
    pub traversal_limit: u32,
    /// Uploads stuck in 'uploading' longer than this are deleted.
    #[serde(default = "default_stuck_upload_max_age_secs")]
    pub stuck_upload_max_age_secs: u64,
    /// Failed indexes older than this become eligible for expiry.
    #[serde(default = "default_failed_index_max_age_secs")]
    pub failed_index_max_age_secs: u64,
    /// Failed indexes examined per expiry pass.
    #[serde(default = "default_failed_index_batch_size")]
    pub failed_index_batch_size: u32,
}

fn default_interval_secs() -> u64 {
    60
}

fn default_reference_count_batch_size() -> u32 {
    100
}

fn default_traversal_limit() -> u32 {
    100
}

fn default_stuck_upload_max_age_secs() -> u64 {
    24 * 3600
}

fn default_failed_index_max_age_secs() -> u64 {
    30 * 24 * 3600 // 30 days
}

fn default_failed_index_batch_size() -> u32 {
    1000
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            reference_count_batch_size: default_reference_count_batch_size(),
            traversal_limit: default_traversal_limit(),
            stuck_upload_max_age_secs: default_stuck_upload_max_age_secs(),
            failed_index_max_age_secs: default_failed_index_max_age_secs(),
            failed_index_batch_size: default_failed_index_batch_size(),
        }
    }
}

impl JanitorConfig {
    /// Get the cycle interval as a std::time::Duration.
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs)
    }

    pub fn stuck_upload_max_age(&self) -> Duration {
        saturating_seconds(self.stuck_upload_max_age_secs)
    }

    pub fn failed_index_max_age(&self) -> Duration {
        saturating_seconds(self.failed_index_max_age_secs)
    }

    /// Validate janitor configuration for settings that would stall or overflow.
    pub fn validate(&self) -> Result<(), String> {
        if self.interval_secs == 0 {
            return Err("janitor.interval_secs must be at least 1".to_string());
        }
        if self.traversal_limit == 0 {
            return Err("janitor.traversal_limit must be at least 1".to_string());
        }
        for (name, value) in [
            ("stuck_upload_max_age_secs", self.stuck_upload_max_age_secs),
            ("failed_index_max_age_secs", self.failed_index_max_age_secs),
        ] {
            if value > i64::MAX as u64 {
                return Err(format!(
                    "janitor.{name} {value} exceeds maximum value {}",
                    i64::MAX
                ));
            }
        }
        Ok(())
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Metadata store configuration.
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Visibility configuration.
    #[serde(default)]
    pub visibility: VisibilityConfig,
    /// Janitor configuration.
    #[serde(default)]
    pub janitor: JanitorConfig,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

impl AppConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.metadata.validate()?;
        self.visibility.validate()?;
        self.janitor.validate()
    }
}

fn saturating_seconds(secs: u64) -> Duration {
    // Saturate at i64::MAX to prevent overflow wrapping to negative
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

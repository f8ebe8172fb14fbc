//! Metadata store abstraction and implementations for Tidemark.
//!
//! This crate owns the persisted side of code-intelligence upload tracking:
//! - Upload, index and package records
//! - Commit graph visibility (nearest uploads, links, visible-at-tip)
//! - Dirty tokens that order graph recomputation
//! - Retention scan claims and expiry marks
//! - Reclaiming expired uploads by reference count and by traversal
//! - Janitor cleanups for deleted repositories, stuck and failed records

pub mod error;
pub mod models;
pub mod observability;
pub mod postgres;
pub(crate) mod reclaim;
pub mod repos;
pub mod store;
pub mod visibility;

pub use error::{MetadataError, MetadataResult};
pub use observability::Operations;
pub use postgres::PostgresStore;
pub use repos::{ReclaimStats, SourcedCommitsCleanup, TableDiff, VisibilityStats};
pub use store::{MetadataStore, SqliteStore};
pub use visibility::StagingOptions;

use std::sync::Arc;
use tidemark_core::config::MetadataConfig;

/// Create a metadata store from configuration.
pub async fn from_config(
    config: &MetadataConfig,
    staging: StagingOptions,
    operations: Operations,
) -> MetadataResult<Arc<dyn MetadataStore>> {
    match config {
        MetadataConfig::Sqlite {
            path,
            query_timeout_secs,
        } => {
            let store = SqliteStore::new(path, *query_timeout_secs, operations)
                .await?
                .with_staging_options(staging);
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
        MetadataConfig::Postgres {
            url,
            host,
            port,
            username,
            password,
            database,
            ssl_mode,
            max_connections,
            statement_timeout_ms,
        } => {
            let store = if let Some(url) = url {
                // URL takes precedence over individual parameters
                tracing::info!("Connecting to PostgreSQL using connection URL");
                PostgresStore::from_url(url, *max_connections, *statement_timeout_ms, operations)
                    .await?
            } else if let (Some(host), Some(database)) = (host.as_ref(), database.as_ref()) {
                PostgresStore::from_params(
                    host,
                    port.unwrap_or(5432),
                    username.as_deref(),
                    password.as_deref(),
                    database,
                    *ssl_mode,
                    *max_connections,
                    *statement_timeout_ms,
                    operations,
                )
                .await?
            } else {
                return Err(MetadataError::Config(
                    "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                ));
            };
            Ok(Arc::new(store.with_staging_options(staging)) as Arc<dyn MetadataStore>)
        }
    }
}

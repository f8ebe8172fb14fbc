//! Tidemark janitor binary.
//!
//! Runs the expired-upload reclaimers and the supporting cleanup passes on a
//! fixed interval until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use prometheus::{Encoder, Registry, TextEncoder};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tidemark_core::config::{AppConfig, JanitorConfig, LogFormat};
use tidemark_metadata::repos::{CleanupRepo, DirtyRepo, ReclaimRepo};
use tidemark_metadata::{MetadataStore, Operations, StagingOptions};
use time::OffsetDateTime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Tidemark janitor - reclaims expired code-intelligence uploads
#[derive(Parser, Debug)]
#[command(name = "tidemark-janitor")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "TIDEMARK_CONFIG",
        default_value = "config/janitor.toml"
    )]
    config: String,

    /// Write Prometheus text exposition here after every cycle
    #[arg(long, env = "TIDEMARK_METRICS_TEXTFILE")]
    metrics_textfile: Option<PathBuf>,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,
}

/// Row counts produced by one janitor cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct CycleReport {
    reference_count_deleted: u64,
    traversal_deleted: u64,
    traversal_incomplete: bool,
    uploads_without_repository: u64,
    indexes_without_repository: u64,
    failed_indexes_deleted: u64,
    stuck_uploads_deleted: u64,
    failures: usize,
}

/// Load configuration from an optional TOML file overlaid with `TIDEMARK_` env vars.
fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if Path::new(path).exists() {
        figment = figment.merge(Toml::file(path));
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("TIDEMARK_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,sqlx=warn".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

/// Run every pass once. A failing pass is logged and the cycle continues.
async fn run_cycle(store: &dyn MetadataStore, config: &JanitorConfig) -> CycleReport {
    let mut report = CycleReport::default();

    match store
        .reclaim_by_reference_count(config.reference_count_batch_size)
        .await
    {
        Ok(stats) => report.reference_count_deleted = stats.deleted,
        Err(e) => {
            tracing::error!(error = %e, "Reference-count reclaim failed");
            report.failures += 1;
        }
    }

    match store.reclaim_by_traversal(config.traversal_limit).await {
        Ok(stats) => {
            report.traversal_deleted = stats.deleted;
            report.traversal_incomplete = stats.incomplete;
        }
        Err(e) => {
            tracing::error!(error = %e, "Traversal reclaim failed");
            report.failures += 1;
        }
    }

    let now = OffsetDateTime::now_utc();

    match store.delete_uploads_without_repository(now).await {
        Ok(counts) => {
            report.uploads_without_repository = counts.values().sum();
            for (repository_id, count) in &counts {
                tracing::info!(
                    repository_id,
                    count,
                    "Deleted uploads of deleted or blocked repository"
                );
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Deleting uploads without repository failed");
            report.failures += 1;
        }
    }

    match store.delete_indexes_without_repository(now).await {
        Ok(counts) => report.indexes_without_repository = counts.values().sum(),
        Err(e) => {
            tracing::error!(error = %e, "Deleting indexes without repository failed");
            report.failures += 1;
        }
    }

    match store
        .expire_failed_records(
            config.failed_index_batch_size,
            config.failed_index_max_age(),
            now,
        )
        .await
    {
        Ok((scanned, deleted)) => {
            tracing::debug!(scanned, deleted, "Expired failed indexes");
            report.failed_indexes_deleted = deleted;
        }
        Err(e) => {
            tracing::error!(error = %e, "Expiring failed indexes failed");
            report.failures += 1;
        }
    }

    match store
        .delete_uploads_stuck_uploading(now - config.stuck_upload_max_age())
        .await
    {
        Ok(deleted) => report.stuck_uploads_deleted = deleted,
        Err(e) => {
            tracing::error!(error = %e, "Deleting stuck uploads failed");
            report.failures += 1;
        }
    }

    match store.get_repositories_max_stale_age(now).await {
        Ok(age) => tracing::debug!(
            max_stale_age_secs = age.whole_seconds(),
            "Commit graph staleness"
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read commit graph staleness");
            report.failures += 1;
        }
    }

    report
}

/// Replace `path` with the current contents of `registry`.
fn write_metrics(registry: &Registry, path: &Path) -> Result<()> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("failed to encode metrics")?;
    let tmp = path.with_extension("prom.tmp");
    std::fs::write(&tmp, &buffer)
        .with_context(|| format!("failed to write metrics to {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to move metrics into {}", path.display()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    init_tracing(config.log_format);
    tracing::info!("Tidemark janitor v{}", env!("CARGO_PKG_VERSION"));

    let registry = Registry::new();
    let operations = Operations::new(&registry).context("failed to register metrics")?;

    let metadata: Arc<dyn MetadataStore> = tidemark_metadata::from_config(
        &config.metadata,
        StagingOptions::from(&config.visibility),
        operations,
    )
    .await
    .context("failed to initialize metadata store")?;
    metadata
        .health_check()
        .await
        .context("metadata health check failed")?;
    tracing::info!("Metadata store initialized");

    let mut interval = tokio::time::interval(config.janitor.interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tracing::info!(
        interval_secs = config.janitor.interval_secs,
        "Janitor scheduler started"
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
        }

        let report = run_cycle(metadata.as_ref(), &config.janitor).await;
        tracing::info!(
            reference_count_deleted = report.reference_count_deleted,
            traversal_deleted = report.traversal_deleted,
            traversal_incomplete = report.traversal_incomplete,
            uploads_without_repository = report.uploads_without_repository,
            indexes_without_repository = report.indexes_without_repository,
            failed_indexes_deleted = report.failed_indexes_deleted,
            stuck_uploads_deleted = report.stuck_uploads_deleted,
            failures = report.failures,
            "Janitor cycle finished"
        );

        if let Some(path) = &args.metrics_textfile
            && let Err(e) = write_metrics(&registry, path)
        {
            tracing::warn!(error = %e, "Failed to export metrics");
        }

        if args.once {
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemark_core::UploadState;
    use tidemark_core::config::MetadataConfig;
    use tidemark_metadata::SqliteStore;
    use tidemark_metadata::models::NewUpload;
    use tidemark_metadata::repos::UploadRepo;
    use time::Duration;

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("janitor.toml");
        std::fs::write(
            &path,
            r#"
log_format = "json"

[metadata]
type = "sqlite"
path = "/tmp/tidemark-test.db"

[janitor]
traversal_limit = 7
"#,
        )
        .unwrap();

        let config = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.janitor.traversal_limit, 7);
        assert_eq!(config.janitor.reference_count_batch_size, 100);
        assert!(matches!(config.metadata, MetadataConfig::Sqlite { .. }));
    }

    #[test]
    fn test_load_config_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("janitor.toml");
        std::fs::write(&path, "[janitor]\ninterval_secs = 0\n").unwrap();

        let err = load_config(path.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("interval_secs"));
    }

    #[tokio::test]
    async fn test_run_cycle_deletes_stuck_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(
            dir.path().join("janitor.db"),
            None,
            Operations::unregistered().unwrap(),
        )
        .await
        .unwrap();

        let now = OffsetDateTime::now_utc();
        let stuck = store
            .insert_upload(&NewUpload {
                repository_id: 1,
                commit_sha: "a".repeat(40),
                root: String::new(),
                indexer: "scip-rust".to_string(),
                state: UploadState::Uploading,
                uploaded_at: now - Duration::days(3),
                finished_at: None,
            })
            .await
            .unwrap();
        let fresh = store
            .insert_upload(&NewUpload {
                repository_id: 1,
                commit_sha: "b".repeat(40),
                root: String::new(),
                indexer: "scip-rust".to_string(),
                state: UploadState::Uploading,
                uploaded_at: now,
                finished_at: None,
            })
            .await
            .unwrap();

        let report = run_cycle(&store, &JanitorConfig::default()).await;
        assert_eq!(report.failures, 0);
        assert_eq!(report.stuck_uploads_deleted, 1);

        let stuck = store.get_upload(stuck).await.unwrap().unwrap();
        assert_eq!(stuck.state, "deleted");
        let fresh = store.get_upload(fresh).await.unwrap().unwrap();
        assert_eq!(fresh.state, "uploading");
    }

    #[test]
    fn test_write_metrics_textfile() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        let _operations = Operations::new(&registry).unwrap();
        let path = dir.path().join("tidemark.prom");

        write_metrics(&registry, &path).unwrap();
        assert!(path.exists());
    }
}

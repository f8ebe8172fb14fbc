//! Metadata store harnesses for SQLite and PostgreSQL.

use sqlx::{Pool, Postgres as SqlxPostgres, Sqlite};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tidemark_metadata::{
    MetadataError, MetadataResult, MetadataStore, Operations, PostgresStore, SqliteStore,
    StagingOptions,
};

/// Marks errors caused by Docker being unavailable rather than by the store.
pub const POSTGRES_CONTAINER_START_ERR_PREFIX: &str = "postgres-container-start:";

/// Small batches so every sync stages rows over several round trips.
#[allow(dead_code)]
pub const TEST_STAGING: StagingOptions = StagingOptions {
    batch_size: 2,
    channel_capacity: 1,
};

/// A SQLite store living in a temporary directory.
#[allow(dead_code)]
pub struct TestMetadata {
    sqlite: Arc<SqliteStore>,
    _dir: TempDir,
}

impl TestMetadata {
    async fn open(location: impl AsRef<Path>, dir: TempDir) -> MetadataResult<Self> {
        let store = SqliteStore::new(location.as_ref(), None, Operations::unregistered()?)
            .await?
            .with_staging_options(TEST_STAGING);
        Ok(Self {
            sqlite: Arc::new(store),
            _dir: dir,
        })
    }

    /// File-backed store.
    pub async fn new() -> MetadataResult<Self> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tidemark.db");
        Self::open(path, dir).await
    }

    #[allow(dead_code)]
    pub async fn in_memory() -> MetadataResult<Self> {
        Self::open(":memory:", tempfile::tempdir()?).await
    }

    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.sqlite.clone()
    }

    #[allow(dead_code)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        self.sqlite.pool()
    }

    /// Per-operation counters recorded by the store.
    #[allow(dead_code)]
    pub fn operations(&self) -> &Operations {
        self.sqlite.operations()
    }
}

/// A PostgreSQL store backed by a throwaway container.
#[allow(dead_code)]
pub struct PostgresTestMetadata {
    postgres: Arc<PostgresStore>,
    _container: ContainerAsync<Postgres>,
}

impl PostgresTestMetadata {
    pub async fn new() -> MetadataResult<Self> {
        let container = Postgres::default()
            .with_tag("15-alpine")
            .start()
            .await
            .map_err(|e| {
                MetadataError::Internal(format!(
                    "{POSTGRES_CONTAINER_START_ERR_PREFIX} Failed to start PostgreSQL container: {e}"
                ))
            })?;

        let host = container
            .get_host()
            .await
            .map_err(|e| MetadataError::Internal(format!("container host: {e}")))?;
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .map_err(|e| MetadataError::Internal(format!("container port: {e}")))?;

        // testcontainers-modules ships postgres/postgres credentials.
        let url = format!("postgres://postgres:postgres@{host}:{port}/postgres");
        let store = PostgresStore::new(&url, 5, None, Operations::unregistered()?)
            .await?
            .with_staging_options(TEST_STAGING);

        Ok(Self {
            postgres: Arc::new(store),
            _container: container,
        })
    }

    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.postgres.clone()
    }

    #[allow(dead_code)]
    pub fn pool(&self) -> &Pool<SqlxPostgres> {
        self.postgres.pool()
    }
}

/// Start a PostgreSQL store, or `None` when Docker is unavailable or
/// SKIP_POSTGRES_TESTS is set.
///
/// Any other setup failure panics, so schema regressions are not skipped.
#[allow(dead_code)]
pub async fn postgres_or_skip() -> Option<PostgresTestMetadata> {
    if std::env::var("SKIP_POSTGRES_TESTS").is_ok() {
        return None;
    }
    match PostgresTestMetadata::new().await {
        Ok(metadata) => Some(metadata),
        Err(err) => {
            let msg = err.to_string();
            if msg.contains(POSTGRES_CONTAINER_START_ERR_PREFIX) {
                eprintln!("Skipping PostgreSQL test (Docker unavailable): {msg}");
                None
            } else {
                panic!("PostgreSQL test setup failed: {msg}");
            }
        }
    }
}

/// Run `test_fn` against a fresh SQLite store, then a fresh PostgreSQL store.
#[allow(dead_code)]
pub async fn run_metadata_test_both<F, Fut>(test_fn: F)
where
    F: Fn(Arc<dyn MetadataStore>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let sqlite = TestMetadata::new()
        .await
        .expect("Failed to create SQLite test metadata");
    test_fn(sqlite.store()).await;

    if let Some(postgres) = postgres_or_skip().await {
        test_fn(postgres.store()).await;
    }
}

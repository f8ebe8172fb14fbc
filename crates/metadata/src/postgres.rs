//! PostgreSQL-based metadata store implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::*;
use crate::observability::Operations;
use crate::reclaim::{self, Node, ProviderRow, ReclaimSource, ReferenceRow};
use crate::repos::{
    CleanupRepo, DELETED_REPOSITORY_GRACE_PERIOD, DirtyRepo, ReclaimRepo, ReclaimStats,
    RetentionRepo, SourcedCommitsCleanup, TableDiff, UploadRepo, VisibilityRepo, VisibilityStats,
};
use crate::store::{
    MetadataStore, TRAVERSAL_PAGE_SIZE, count_by_repository, group_sourced_commits, metas,
    record_reclaim, record_sync,
};
use crate::visibility::{self, RefPolicy, SeedUpload, StagingOptions, StagingSink, TipRow};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::types::Json;
use sqlx::{PgConnection, Pool, Postgres, QueryBuilder};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use tidemark_core::config::PgSslMode;
use tidemark_core::{
    CommitGraph, LinkRow, NearestUploadsRow, PackageKey, RefDescription, UploadMeta, UploadState,
};
use time::{Duration, OffsetDateTime};

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
    operations: Operations,
    staging: StagingOptions,
}

impl PostgresStore {
    /// Create a new PostgreSQL store from a connection URL.
    ///
    /// For deployments that keep the password out of the URL, prefer
    /// `from_params()`.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
        operations: Operations,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms, operations).await
    }

    /// Create a new PostgreSQL store from individual connection parameters.
    ///
    /// This allows credentials to be passed separately, enabling better
    /// secret management (e.g., passwords via environment variables).
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
        operations: Operations,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            let sqlx_mode = match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            };
            opts = opts.ssl_mode(sqlx_mode);
        }

        // Log connection info without password
        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(
            opts,
            max_connections,
            statement_timeout_ms,
            operations,
        )
        .await
    }

    /// Delegates to `from_url`.
    pub async fn new(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
        operations: Operations,
    ) -> MetadataResult<Self> {
        Self::from_url(url, max_connections, statement_timeout_ms, operations).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
        operations: Operations,
    ) -> MetadataResult<Self> {
        // Bounds every statement, including the diff queries of a large sync.
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{}ms", timeout_ms))]);
            tracing::info!("PostgreSQL statement_timeout set to {}ms", timeout_ms);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            operations,
            staging: StagingOptions::default(),
        };
        store.migrate().await?;

        Ok(store)
    }

    /// Override the staging batch size and channel capacity.
    pub fn with_staging_options(mut self, staging: StagingOptions) -> Self {
        self.staging = staging;
        self
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Metrics recorded by this store.
    pub fn operations(&self) -> &Operations {
        &self.operations
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // PostgreSQL doesn't allow multiple statements in a single prepared statement,
        // so we split the schema and execute each statement separately.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Column-wise arrays for joining against `UNNEST`.
fn package_columns(packages: &[PackageKey]) -> [Vec<String>; 4] {
    let mut columns: [Vec<String>; 4] = Default::default();
    for package in packages {
        columns[0].push(package.scheme.clone());
        columns[1].push(package.manager.clone());
        columns[2].push(package.name.clone());
        columns[3].push(package.version.clone());
    }
    columns
}

/// Bump the dirty token of each repository.
async fn mark_dirty(
    conn: &mut PgConnection,
    repository_ids: &[i64],
    now: OffsetDateTime,
) -> MetadataResult<()> {
    let mut repository_ids = repository_ids.to_vec();
    repository_ids.sort_unstable();
    repository_ids.dedup();
    for repository_id in repository_ids {
        sqlx::query(
            r#"
            INSERT INTO dirty_repositories (repository_id, dirty_token, update_token, set_dirty_at)
            VALUES ($1, 1, 0, $2)
            ON CONFLICT (repository_id) DO UPDATE SET
                set_dirty_at = CASE
                    WHEN dirty_repositories.update_token = dirty_repositories.dirty_token
                    THEN EXCLUDED.set_dirty_at
                    ELSE dirty_repositories.set_dirty_at
                END,
                dirty_token = dirty_repositories.dirty_token + 1
            "#,
        )
        .bind(repository_id)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Lock `ids` in ascending order, returning those still completed.
async fn lock_completed(conn: &mut PgConnection, ids: &[i64]) -> MetadataResult<Vec<i64>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let locked = sqlx::query_scalar(
        r#"
        SELECT id FROM uploads
        WHERE id = ANY($1) AND state = 'completed'
        ORDER BY id
        FOR UPDATE
        "#,
    )
    .bind(ids)
    .fetch_all(&mut *conn)
    .await?;
    Ok(locked)
}

/// Move completed uploads to 'deleting', returning their repositories.
async fn soft_delete_completed(conn: &mut PgConnection, ids: &[i64]) -> MetadataResult<Vec<i64>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let repositories = sqlx::query_scalar(
        r#"
        UPDATE uploads SET state = 'deleting'
        WHERE id = ANY($1) AND state = 'completed'
        RETURNING repository_id
        "#,
    )
    .bind(ids)
    .fetch_all(&mut *conn)
    .await?;
    Ok(repositories)
}

/// Set a scan timestamp on `ids`, locking them in ascending order first.
async fn stamp(
    conn: &mut PgConnection,
    column: &'static str,
    ids: &[i64],
    now: OffsetDateTime,
) -> MetadataResult<()> {
    if ids.is_empty() {
        return Ok(());
    }
    sqlx::query("SELECT id FROM uploads WHERE id = ANY($1) ORDER BY id FOR UPDATE")
        .bind(ids)
        .fetch_all(&mut *conn)
        .await?;
    sqlx::query(&format!(
        "UPDATE uploads SET {column} = $1 WHERE id = ANY($2)"
    ))
    .bind(now)
    .bind(ids)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

struct PgSink<'c> {
    conn: &'c mut PgConnection,
}

#[async_trait]
impl StagingSink for PgSink<'_> {
    async fn stage_nearest_uploads(&mut self, rows: &[NearestUploadsRow]) -> MetadataResult<()> {
        let mut qb =
            QueryBuilder::<Postgres>::new("INSERT INTO t_nearest_uploads (commit_sha, uploads) ");
        qb.push_values(rows, |mut b, row| {
            let uploads: BTreeMap<i64, u32> = row
                .uploads
                .iter()
                .map(|m| (m.upload_id, m.distance))
                .collect();
            b.push_bind(row.commit.clone()).push_bind(Json(uploads));
        });
        qb.build().persistent(false).execute(&mut *self.conn).await?;
        Ok(())
    }

    async fn stage_links(&mut self, rows: &[LinkRow]) -> MetadataResult<()> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO t_nearest_uploads_links (commit_sha, ancestor_commit_sha, distance) ",
        );
        qb.push_values(rows, |mut b, row| {
            b.push_bind(row.commit.clone())
                .push_bind(row.ancestor_commit.clone())
                .push_bind(i64::from(row.distance));
        });
        qb.build().persistent(false).execute(&mut *self.conn).await?;
        Ok(())
    }

    async fn stage_visible_at_tip(&mut self, rows: &[TipRow]) -> MetadataResult<()> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO t_uploads_visible_at_tip (upload_id, branch_or_tag_name, is_default_branch) ",
        );
        qb.push_values(rows, |mut b, row| {
            b.push_bind(row.upload_id)
                .push_bind(row.branch_or_tag_name.clone())
                .push_bind(row.is_default_branch);
        });
        qb.build().persistent(false).execute(&mut *self.conn).await?;
        Ok(())
    }
}

const CREATE_STAGING_TABLES: [&str; 3] = [
    "CREATE TEMPORARY TABLE t_nearest_uploads (commit_sha TEXT PRIMARY KEY, uploads JSONB NOT NULL) ON COMMIT DROP",
    "CREATE TEMPORARY TABLE t_nearest_uploads_links (commit_sha TEXT PRIMARY KEY, ancestor_commit_sha TEXT NOT NULL, distance BIGINT NOT NULL) ON COMMIT DROP",
    "CREATE TEMPORARY TABLE t_uploads_visible_at_tip (upload_id BIGINT NOT NULL, branch_or_tag_name TEXT NOT NULL, is_default_branch BOOLEAN NOT NULL) ON COMMIT DROP",
];

/// Run the update, delete and insert halves of a table diff. `$1` is the
/// repository id; an empty `update` is skipped.
async fn apply_diff(
    conn: &mut PgConnection,
    repository_id: i64,
    update: &str,
    insert: &str,
    delete: &str,
) -> MetadataResult<TableDiff> {
    let mut diff = TableDiff::default();
    if !update.is_empty() {
        diff.updated = sqlx::query(update)
            .persistent(false)
            .bind(repository_id)
            .execute(&mut *conn)
            .await?
            .rows_affected();
    }
    diff.deleted = sqlx::query(delete)
        .persistent(false)
        .bind(repository_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    diff.inserted = sqlx::query(insert)
        .persistent(false)
        .bind(repository_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    Ok(diff)
}

impl PostgresStore {
    #[allow(clippy::too_many_arguments)]
    async fn sync_visibility_tx(
        &self,
        repository_id: i64,
        commit_graph: &CommitGraph,
        ref_descriptions: &HashMap<String, Vec<RefDescription>>,
        max_age_for_non_stale_branches: Duration,
        max_age_for_non_stale_tags: Duration,
        dirty_token: i64,
        now: OffsetDateTime,
    ) -> MetadataResult<VisibilityStats> {
        let mut tx = self.pool.begin().await?;
        // Syncs of one repository rewrite the same rows; run them one at a time.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(repository_id)
            .execute(&mut *tx)
            .await?;

        let overrides: Option<(Option<i64>, Option<i64>)> = sqlx::query_as(
            r#"
            SELECT max_age_for_non_stale_branches_secs, max_age_for_non_stale_tags_secs
            FROM retention_configuration WHERE repository_id = $1
            "#,
        )
        .bind(repository_id)
        .fetch_optional(&mut *tx)
        .await?;
        let (branch_override, tag_override) = overrides.unwrap_or_default();
        let policy = RefPolicy {
            now,
            max_age_for_branches: visibility::window(
                branch_override,
                max_age_for_non_stale_branches,
            ),
            max_age_for_tags: visibility::window(tag_override, max_age_for_non_stale_tags),
        };

        let seeds: Vec<SeedUpload> = sqlx::query_as(
            r#"
            SELECT id, commit_sha, root, indexer FROM uploads
            WHERE repository_id = $1 AND state = 'completed'
            ORDER BY id
            "#,
        )
        .bind(repository_id)
        .fetch_all(&mut *tx)
        .await?;
        let view = visibility::seed_view(&seeds);

        for statement in CREATE_STAGING_TABLES {
            sqlx::query(statement)
                .persistent(false)
                .execute(&mut *tx)
                .await?;
        }
        let staged = {
            let mut sink = PgSink { conn: &mut tx };
            visibility::stage(
                &mut sink,
                commit_graph,
                view,
                ref_descriptions,
                policy,
                self.staging,
            )
            .await?
        };

        let nearest_uploads = apply_diff(
            &mut tx,
            repository_id,
            r#"
            UPDATE nearest_uploads n SET uploads = t.uploads
            FROM t_nearest_uploads t
            WHERE n.repository_id = $1
              AND n.commit_sha = t.commit_sha
              AND n.uploads IS DISTINCT FROM t.uploads
            "#,
            r#"
            INSERT INTO nearest_uploads (repository_id, commit_sha, uploads)
            SELECT $1, t.commit_sha, t.uploads FROM t_nearest_uploads t
            WHERE NOT EXISTS (
                SELECT 1 FROM nearest_uploads n
                WHERE n.repository_id = $1 AND n.commit_sha = t.commit_sha
            )
            "#,
            r#"
            DELETE FROM nearest_uploads n
            WHERE n.repository_id = $1 AND NOT EXISTS (
                SELECT 1 FROM t_nearest_uploads t WHERE t.commit_sha = n.commit_sha
            )
            "#,
        )
        .await?;

        let nearest_upload_links = apply_diff(
            &mut tx,
            repository_id,
            r#"
            UPDATE nearest_uploads_links l
            SET ancestor_commit_sha = t.ancestor_commit_sha, distance = t.distance
            FROM t_nearest_uploads_links t
            WHERE l.repository_id = $1
              AND l.commit_sha = t.commit_sha
              AND (l.ancestor_commit_sha, l.distance) IS DISTINCT FROM (t.ancestor_commit_sha, t.distance)
            "#,
            r#"
            INSERT INTO nearest_uploads_links (repository_id, commit_sha, ancestor_commit_sha, distance)
            SELECT $1, t.commit_sha, t.ancestor_commit_sha, t.distance FROM t_nearest_uploads_links t
            WHERE NOT EXISTS (
                SELECT 1 FROM nearest_uploads_links l
                WHERE l.repository_id = $1 AND l.commit_sha = t.commit_sha
            )
            "#,
            r#"
            DELETE FROM nearest_uploads_links l
            WHERE l.repository_id = $1 AND NOT EXISTS (
                SELECT 1 FROM t_nearest_uploads_links t WHERE t.commit_sha = l.commit_sha
            )
            "#,
        )
        .await?;

        let uploads_visible_at_tip = apply_diff(
            &mut tx,
            repository_id,
            "",
            r#"
            INSERT INTO uploads_visible_at_tip (repository_id, upload_id, branch_or_tag_name, is_default_branch)
            SELECT $1, t.upload_id, t.branch_or_tag_name, t.is_default_branch FROM t_uploads_visible_at_tip t
            WHERE NOT EXISTS (
                SELECT 1 FROM uploads_visible_at_tip v
                WHERE v.repository_id = $1
                  AND v.upload_id = t.upload_id
                  AND v.branch_or_tag_name = t.branch_or_tag_name
                  AND v.is_default_branch = t.is_default_branch
            )
            "#,
            r#"
            DELETE FROM uploads_visible_at_tip v
            WHERE v.repository_id = $1 AND NOT EXISTS (
                SELECT 1 FROM t_uploads_visible_at_tip t
                WHERE t.upload_id = v.upload_id
                  AND t.branch_or_tag_name = v.branch_or_tag_name
                  AND t.is_default_branch = v.is_default_branch
            )
            "#,
        )
        .await?;

        let mut superseded = false;
        if dirty_token != 0 {
            let still_dirty: Option<bool> = sqlx::query_scalar(
                r#"
                UPDATE dirty_repositories
                SET update_token = GREATEST(update_token, $1), updated_at = $2
                WHERE repository_id = $3
                RETURNING dirty_token > update_token
                "#,
            )
            .bind(dirty_token)
            .bind(now)
            .bind(repository_id)
            .fetch_optional(&mut *tx)
            .await?;
            superseded = still_dirty.unwrap_or(false);
        }

        let finalized_deletions = sqlx::query(
            r#"
            WITH candidates AS (
                SELECT id FROM uploads
                WHERE repository_id = $1 AND state = 'deleting'
                ORDER BY id
                FOR UPDATE
            )
            UPDATE uploads u SET state = 'deleted'
            FROM candidates c
            WHERE u.id = c.id
            "#,
        )
        .bind(repository_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        Ok(VisibilityStats {
            nearest_uploads,
            nearest_upload_links,
            uploads_visible_at_tip,
            staged_nearest_uploads: staged.nearest_uploads,
            staged_nearest_upload_links: staged.links,
            staged_uploads_visible_at_tip: staged.visible_at_tip,
            finalized_deletions,
            superseded,
        })
    }
}

#[async_trait]
impl VisibilityRepo for PostgresStore {
    async fn sync_visibility(
        &self,
        repository_id: i64,
        commit_graph: &CommitGraph,
        ref_descriptions: &HashMap<String, Vec<RefDescription>>,
        max_age_for_non_stale_branches: Duration,
        max_age_for_non_stale_tags: Duration,
        dirty_token: i64,
        now: OffsetDateTime,
    ) -> MetadataResult<VisibilityStats> {
        let stats = self
            .operations
            .observe(
                "sync_visibility",
                self.sync_visibility_tx(
                    repository_id,
                    commit_graph,
                    ref_descriptions,
                    max_age_for_non_stale_branches,
                    max_age_for_non_stale_tags,
                    dirty_token,
                    now,
                ),
            )
            .await?;
        record_sync(&self.operations, repository_id, &stats);
        tracing::info!(
            repository_id,
            dirty_token,
            nearest_uploads = stats.staged_nearest_uploads,
            links = stats.staged_nearest_upload_links,
            visible_at_tip = stats.staged_uploads_visible_at_tip,
            finalized_deletions = stats.finalized_deletions,
            superseded = stats.superseded,
            "Synced commit graph visibility"
        );
        Ok(stats)
    }

    async fn get_visible_uploads(
        &self,
        repository_id: i64,
        commit_sha: &str,
    ) -> MetadataResult<Vec<UploadMeta>> {
        let explicit: Option<Json<BTreeMap<i64, u32>>> = sqlx::query_scalar(
            "SELECT uploads FROM nearest_uploads WHERE repository_id = $1 AND commit_sha = $2",
        )
        .bind(repository_id)
        .bind(commit_sha)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(Json(uploads)) = explicit {
            return Ok(metas(uploads, 0));
        }

        let inherited: Option<(Json<BTreeMap<i64, u32>>, i64)> = sqlx::query_as(
            r#"
            SELECT n.uploads, l.distance
            FROM nearest_uploads_links l
            JOIN nearest_uploads n
              ON n.repository_id = l.repository_id AND n.commit_sha = l.ancestor_commit_sha
            WHERE l.repository_id = $1 AND l.commit_sha = $2
            "#,
        )
        .bind(repository_id)
        .bind(commit_sha)
        .fetch_optional(&self.pool)
        .await?;
        Ok(inherited
            .map(|(Json(uploads), distance)| {
                metas(uploads, u32::try_from(distance).unwrap_or(u32::MAX))
            })
            .unwrap_or_default())
    }

    async fn get_nearest_uploads(
        &self,
        repository_id: i64,
    ) -> MetadataResult<Vec<NearestUploadsEntry>> {
        let rows = sqlx::query_as::<_, NearestUploadsEntry>(
            r#"
            SELECT repository_id, commit_sha, uploads FROM nearest_uploads
            WHERE repository_id = $1 ORDER BY commit_sha
            "#,
        )
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get_nearest_upload_links(&self, repository_id: i64) -> MetadataResult<Vec<LinkEntry>> {
        let rows = sqlx::query_as::<_, LinkEntry>(
            r#"
            SELECT repository_id, commit_sha, ancestor_commit_sha, distance
            FROM nearest_uploads_links
            WHERE repository_id = $1 ORDER BY commit_sha
            "#,
        )
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get_uploads_visible_at_tip(
        &self,
        repository_id: i64,
    ) -> MetadataResult<Vec<VisibleAtTipRow>> {
        let rows = sqlx::query_as::<_, VisibleAtTipRow>(
            r#"
            SELECT repository_id, upload_id, branch_or_tag_name, is_default_branch
            FROM uploads_visible_at_tip
            WHERE repository_id = $1
            ORDER BY upload_id, branch_or_tag_name
            "#,
        )
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl DirtyRepo for PostgresStore {
    async fn set_repository_dirty(&self, repository_id: i64) -> MetadataResult<()> {
        let mut conn = self.pool.acquire().await?;
        self.operations
            .observe(
                "set_repository_dirty",
                mark_dirty(&mut conn, &[repository_id], OffsetDateTime::now_utc()),
            )
            .await
    }

    async fn get_dirty_repositories(&self) -> MetadataResult<Vec<DirtyRepository>> {
        let rows = sqlx::query_as::<_, DirtyRepository>(
            r#"
            SELECT d.repository_id, d.dirty_token
            FROM dirty_repositories d
            LEFT JOIN repositories r ON r.id = d.repository_id
            WHERE d.dirty_token > d.update_token
              AND (r.id IS NULL OR (r.deleted_at IS NULL AND NOT r.blocked))
            ORDER BY d.repository_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get_commit_graph_metadata(
        &self,
        repository_id: i64,
    ) -> MetadataResult<CommitGraphMetadata> {
        let row: Option<(i64, i64, Option<OffsetDateTime>)> = sqlx::query_as(
            r#"
            SELECT dirty_token, update_token, updated_at
            FROM dirty_repositories WHERE repository_id = $1
            "#,
        )
        .bind(repository_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some((dirty_token, update_token, updated_at)) => CommitGraphMetadata {
                stale: dirty_token > update_token,
                updated_at,
            },
            None => CommitGraphMetadata {
                stale: false,
                updated_at: None,
            },
        })
    }

    async fn get_repositories_max_stale_age(&self, now: OffsetDateTime) -> MetadataResult<Duration> {
        let oldest: Option<OffsetDateTime> = sqlx::query_scalar(
            r#"
            SELECT set_dirty_at FROM dirty_repositories
            WHERE dirty_token > update_token AND set_dirty_at IS NOT NULL
            ORDER BY set_dirty_at
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(oldest
            .map(|since| (now - since).max(Duration::ZERO))
            .unwrap_or(Duration::ZERO))
    }
}

impl PostgresStore {
    async fn claim_tx(
        &self,
        process_delay: Duration,
        limit: u32,
        now: OffsetDateTime,
    ) -> MetadataResult<Vec<i64>> {
        let cutoff = now - process_delay;
        let mut tx = self.pool.begin().await?;

        let candidates: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT c.repository_id
            FROM (SELECT DISTINCT repository_id FROM uploads WHERE state = 'completed') c
            LEFT JOIN last_retention_scan s ON s.repository_id = c.repository_id
            LEFT JOIN dirty_repositories d ON d.repository_id = c.repository_id
            WHERE (s.last_retention_scan_at IS NULL OR s.last_retention_scan_at < $1)
              AND (d.repository_id IS NULL OR d.dirty_token <= d.update_token)
            ORDER BY s.last_retention_scan_at NULLS FIRST, c.repository_id
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(i64::from(limit))
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for repository_id in candidates {
            let won: Option<i64> = sqlx::query_scalar(
                r#"
                INSERT INTO last_retention_scan (repository_id, last_retention_scan_at)
                VALUES ($1, $2)
                ON CONFLICT (repository_id) DO UPDATE
                SET last_retention_scan_at = EXCLUDED.last_retention_scan_at
                WHERE last_retention_scan.last_retention_scan_at < $3
                RETURNING repository_id
                "#,
            )
            .bind(repository_id)
            .bind(now)
            .bind(cutoff)
            .fetch_optional(&mut *tx)
            .await?;
            claimed.extend(won);
        }

        tx.commit().await?;
        Ok(claimed)
    }

    async fn mark_retention_tx(
        &self,
        protected_ids: &[i64],
        expired_ids: &[i64],
        now: OffsetDateTime,
    ) -> MetadataResult<()> {
        let mut protected_ids = protected_ids.to_vec();
        protected_ids.sort_unstable();
        protected_ids.dedup();
        let mut expired_ids = expired_ids.to_vec();
        expired_ids.sort_unstable();
        expired_ids.dedup();

        let mut tx = self.pool.begin().await?;
        stamp(&mut tx, "last_retention_scan_at", &protected_ids, now).await?;
        if !expired_ids.is_empty() {
            sqlx::query("UPDATE uploads SET expired = TRUE WHERE id = ANY($1)")
                .bind(&expired_ids)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl RetentionRepo for PostgresStore {
    async fn claim_repositories_for_retention_scan(
        &self,
        process_delay: Duration,
        limit: u32,
        now: OffsetDateTime,
    ) -> MetadataResult<Vec<i64>> {
        let claimed = self
            .operations
            .observe(
                "claim_repositories_for_retention_scan",
                self.claim_tx(process_delay, limit, now),
            )
            .await?;
        self.operations.record_rows(
            "claim_repositories_for_retention_scan",
            "claimed",
            claimed.len() as u64,
        );
        Ok(claimed)
    }

    async fn mark_retention(
        &self,
        protected_ids: &[i64],
        expired_ids: &[i64],
        now: OffsetDateTime,
    ) -> MetadataResult<()> {
        self.operations
            .observe(
                "mark_retention",
                self.mark_retention_tx(protected_ids, expired_ids, now),
            )
            .await?;
        self.operations
            .record_rows("mark_retention", "expired", expired_ids.len() as u64);
        Ok(())
    }

    async fn get_last_retention_scan(
        &self,
        repository_id: i64,
    ) -> MetadataResult<Option<OffsetDateTime>> {
        let at = sqlx::query_scalar(
            "SELECT last_retention_scan_at FROM last_retention_scan WHERE repository_id = $1",
        )
        .bind(repository_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(at)
    }
}

struct PgReclaim<'c> {
    conn: &'c mut PgConnection,
}

#[async_trait]
impl ReclaimSource for PgReclaim<'_> {
    async fn providers(&mut self, upload_ids: &[i64]) -> MetadataResult<Vec<ProviderRow>> {
        if upload_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, ProviderRow>(
            r#"
            SELECT u.id AS upload_id, u.repository_id, u.indexer, u.root,
                   p.scheme, p.manager, p.name, p.version, cd.committed_at
            FROM packages p
            JOIN uploads u ON u.id = p.dump_id
            LEFT JOIN commit_dates cd
              ON cd.repository_id = u.repository_id AND cd.commit_sha = u.commit_sha
            WHERE u.state = 'completed' AND EXISTS (
                SELECT 1 FROM packages q
                WHERE q.dump_id = ANY($1)
                  AND q.scheme = p.scheme AND q.manager = p.manager
                  AND q.name = p.name AND q.version = p.version
            )
            "#,
        )
        .bind(upload_ids)
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(rows)
    }

    async fn references(&mut self, packages: &[PackageKey]) -> MetadataResult<Vec<ReferenceRow>> {
        if packages.is_empty() {
            return Ok(Vec::new());
        }
        let [schemes, managers, names, versions] = package_columns(packages);
        let rows = sqlx::query_as::<_, ReferenceRow>(
            r#"
            SELECT r.dump_id AS upload_id, r.scheme, r.manager, r.name, r.version
            FROM package_references r
            JOIN UNNEST($1::text[], $2::text[], $3::text[], $4::text[]) AS k(scheme, manager, name, version)
              ON r.scheme = k.scheme AND r.manager = k.manager
             AND r.name = k.name AND r.version = k.version
            JOIN uploads u ON u.id = r.dump_id
            WHERE u.state <> 'deleted'
            "#,
        )
        .bind(schemes)
        .bind(managers)
        .bind(names)
        .bind(versions)
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(rows)
    }

    async fn traversal_candidates(
        &mut self,
        offset: u64,
        limit: u32,
    ) -> MetadataResult<Vec<Node>> {
        let nodes: Vec<Node> = sqlx::query_as(
            r#"
            SELECT id, repository_id, expired FROM uploads
            WHERE state = 'completed' AND expired
            ORDER BY last_traversal_scan_at NULLS FIRST, finished_at, id
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(i64::from(limit))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(nodes)
    }

    async fn dependents(
        &mut self,
        packages: &[PackageKey],
        exclude: &[i64],
        limit: u32,
    ) -> MetadataResult<Vec<Node>> {
        if packages.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let [schemes, managers, names, versions] = package_columns(packages);
        let rows = sqlx::query_as::<_, Node>(
            r#"
            SELECT DISTINCT u.id, u.repository_id, (u.state = 'completed' AND u.expired) AS expired
            FROM package_references r
            JOIN UNNEST($1::text[], $2::text[], $3::text[], $4::text[]) AS k(scheme, manager, name, version)
              ON r.scheme = k.scheme AND r.manager = k.manager
             AND r.name = k.name AND r.version = k.version
            JOIN uploads u ON u.id = r.dump_id
            WHERE u.state <> 'deleted' AND NOT (u.id = ANY($5))
            ORDER BY u.id
            LIMIT $6
            "#,
        )
        .bind(schemes)
        .bind(managers)
        .bind(names)
        .bind(versions)
        .bind(exclude)
        .bind(i64::from(limit))
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(rows)
    }
}

impl PostgresStore {
    async fn reclaim_by_reference_count_tx(&self, batch_size: u32) -> MetadataResult<ReclaimStats> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        let ordered: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM uploads
            WHERE state = 'completed' AND expired
            ORDER BY last_referenced_scan_at NULLS FIRST, finished_at, id
            LIMIT $1
            "#,
        )
        .bind(i64::from(batch_size))
        .fetch_all(&mut *tx)
        .await?;
        let candidates = lock_completed(&mut tx, &ordered).await?;
        if candidates.is_empty() {
            tx.commit().await?;
            return Ok(ReclaimStats::default());
        }

        let safe = reclaim::unreferenced(&mut PgReclaim { conn: &mut tx }, &candidates).await?;
        stamp(&mut tx, "last_referenced_scan_at", &candidates, now).await?;
        let repositories = soft_delete_completed(&mut tx, &safe).await?;
        mark_dirty(&mut tx, &repositories, now).await?;
        tx.commit().await?;

        Ok(ReclaimStats {
            scanned: candidates.len() as u64,
            deleted: repositories.len() as u64,
            incomplete: false,
        })
    }

    async fn reclaim_by_traversal_tx(&self, traversal_limit: u32) -> MetadataResult<ReclaimStats> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        let search =
            reclaim::find_root(&mut PgReclaim { conn: &mut tx }, TRAVERSAL_PAGE_SIZE).await?;
        stamp(&mut tx, "last_traversal_scan_at", &search.rejected, now).await?;
        let Some(root) = search.root else {
            tx.commit().await?;
            return Ok(ReclaimStats {
                scanned: search.rejected.len() as u64,
                ..ReclaimStats::default()
            });
        };

        let component =
            reclaim::explore(&mut PgReclaim { conn: &mut tx }, root, traversal_limit).await?;
        let mut deleted = 0;
        if component.deletable() {
            let locked = lock_completed(&mut tx, &component.visited).await?;
            let repositories = soft_delete_completed(&mut tx, &locked).await?;
            deleted = repositories.len() as u64;
            mark_dirty(&mut tx, &repositories, now).await?;
        }
        stamp(&mut tx, "last_traversal_scan_at", &component.visited, now).await?;
        tx.commit().await?;

        Ok(ReclaimStats {
            scanned: (search.rejected.len() + component.visited.len()) as u64,
            deleted,
            incomplete: !component.complete,
        })
    }
}

#[async_trait]
impl ReclaimRepo for PostgresStore {
    async fn reclaim_by_reference_count(&self, batch_size: u32) -> MetadataResult<ReclaimStats> {
        let stats = self
            .operations
            .observe(
                "reclaim_by_reference_count",
                self.reclaim_by_reference_count_tx(batch_size),
            )
            .await?;
        record_reclaim(&self.operations, "reclaim_by_reference_count", &stats);
        Ok(stats)
    }

    async fn reclaim_by_traversal(&self, traversal_limit: u32) -> MetadataResult<ReclaimStats> {
        let stats = self
            .operations
            .observe(
                "reclaim_by_traversal",
                self.reclaim_by_traversal_tx(traversal_limit),
            )
            .await?;
        record_reclaim(&self.operations, "reclaim_by_traversal", &stats);
        Ok(stats)
    }
}

impl PostgresStore {
    async fn delete_without_repository(
        &self,
        table: &'static str,
        now: OffsetDateTime,
    ) -> MetadataResult<HashMap<i64, u64>> {
        let cutoff = now - DELETED_REPOSITORY_GRACE_PERIOD;
        let repositories: Vec<i64> = sqlx::query_scalar(&format!(
            r#"
            WITH candidates AS (
                SELECT x.id FROM {table} x
                JOIN repositories r ON r.id = x.repository_id
                WHERE x.state <> 'deleted'
                  AND ((r.deleted_at IS NOT NULL AND r.deleted_at < $1) OR r.blocked)
                ORDER BY x.id
                FOR UPDATE OF x
            )
            UPDATE {table} x SET state = 'deleted'
            FROM candidates c
            WHERE x.id = c.id
            RETURNING x.repository_id
            "#
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(count_by_repository(repositories))
    }

    async fn expire_failed_records_tx(
        &self,
        batch_size: u32,
        max_age: Duration,
        now: OffsetDateTime,
    ) -> MetadataResult<(u64, u64)> {
        let cutoff = now - max_age;
        let mut tx = self.pool.begin().await?;
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM indexes
            WHERE state = 'failed' AND COALESCE(finished_at, queued_at) < $1
            ORDER BY id
            LIMIT $2
            FOR UPDATE
            "#,
        )
        .bind(cutoff)
        .bind(i64::from(batch_size))
        .fetch_all(&mut *tx)
        .await?;
        if ids.is_empty() {
            tx.commit().await?;
            return Ok((0, 0));
        }

        let deleted = sqlx::query(
            r#"
            DELETE FROM indexes i
            WHERE i.id = ANY($1) AND EXISTS (
                SELECT 1 FROM indexes later
                WHERE later.repository_id = i.repository_id
                  AND later.root = i.root
                  AND later.indexer = i.indexer
                  AND later.state IN ('completed', 'failed')
                  AND (later.queued_at, later.id) > (i.queued_at, i.id)
            )
            "#,
        )
        .bind(&ids)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok((ids.len() as u64, deleted))
    }

    async fn delete_sourced_commits_tx(
        &self,
        repository_id: i64,
        commit_sha: &str,
        maximum_commit_lag: Duration,
        now: OffsetDateTime,
    ) -> MetadataResult<SourcedCommitsCleanup> {
        let cutoff = now - maximum_commit_lag;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE uploads SET commit_last_checked_at = $1
            WHERE repository_id = $2 AND commit_sha = $3
              AND state NOT IN ('deleted', 'deleting') AND uploaded_at >= $4
            "#,
        )
        .bind(now)
        .bind(repository_id)
        .bind(commit_sha)
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let deleted = sqlx::query(
            r#"
            UPDATE uploads
            SET state = CASE WHEN state = 'completed' THEN 'deleting' ELSE 'deleted' END
            WHERE repository_id = $1 AND commit_sha = $2
              AND state NOT IN ('deleted', 'deleting') AND uploaded_at < $3
            "#,
        )
        .bind(repository_id)
        .bind(commit_sha)
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if deleted > 0 {
            mark_dirty(&mut tx, &[repository_id], now).await?;
        }
        tx.commit().await?;
        Ok(SourcedCommitsCleanup { updated, deleted })
    }
}

#[async_trait]
impl CleanupRepo for PostgresStore {
    async fn delete_uploads_without_repository(
        &self,
        now: OffsetDateTime,
    ) -> MetadataResult<HashMap<i64, u64>> {
        self.operations
            .observe(
                "delete_uploads_without_repository",
                self.delete_without_repository("uploads", now),
            )
            .await
    }

    async fn delete_indexes_without_repository(
        &self,
        now: OffsetDateTime,
    ) -> MetadataResult<HashMap<i64, u64>> {
        self.operations
            .observe(
                "delete_indexes_without_repository",
                self.delete_without_repository("indexes", now),
            )
            .await
    }

    async fn expire_failed_records(
        &self,
        batch_size: u32,
        max_age: Duration,
        now: OffsetDateTime,
    ) -> MetadataResult<(u64, u64)> {
        let (scanned, deleted) = self
            .operations
            .observe(
                "expire_failed_records",
                self.expire_failed_records_tx(batch_size, max_age, now),
            )
            .await?;
        self.operations
            .record_rows("expire_failed_records", "deleted", deleted);
        Ok((scanned, deleted))
    }

    async fn delete_uploads_stuck_uploading(
        &self,
        uploaded_before: OffsetDateTime,
    ) -> MetadataResult<u64> {
        let result = sqlx::query(
            "UPDATE uploads SET state = 'deleted' WHERE state = 'uploading' AND uploaded_at < $1",
        )
        .bind(uploaded_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get_stale_sourced_commits(
        &self,
        min_time_since_last_check: Duration,
        limit: u32,
        now: OffsetDateTime,
    ) -> MetadataResult<Vec<SourcedCommits>> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            r#"
            SELECT DISTINCT repository_id, commit_sha FROM uploads
            WHERE state NOT IN ('deleted', 'deleting')
              AND (commit_last_checked_at IS NULL OR commit_last_checked_at < $1)
            ORDER BY repository_id, commit_sha
            LIMIT $2
            "#,
        )
        .bind(now - min_time_since_last_check)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(group_sourced_commits(rows))
    }

    async fn update_sourced_commits(
        &self,
        repository_id: i64,
        commit_sha: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE uploads SET commit_last_checked_at = $1
            WHERE repository_id = $2 AND commit_sha = $3 AND state NOT IN ('deleted', 'deleting')
            "#,
        )
        .bind(now)
        .bind(repository_id)
        .bind(commit_sha)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_sourced_commits(
        &self,
        repository_id: i64,
        commit_sha: &str,
        maximum_commit_lag: Duration,
        now: OffsetDateTime,
    ) -> MetadataResult<SourcedCommitsCleanup> {
        self.operations
            .observe(
                "delete_sourced_commits",
                self.delete_sourced_commits_tx(repository_id, commit_sha, maximum_commit_lag, now),
            )
            .await
    }
}

#[async_trait]
impl UploadRepo for PostgresStore {
    async fn insert_upload(&self, upload: &NewUpload) -> MetadataResult<i64> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO uploads (
                repository_id, commit_sha, root, indexer, state, uploaded_at, finished_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(upload.repository_id)
        .bind(&upload.commit_sha)
        .bind(&upload.root)
        .bind(&upload.indexer)
        .bind(upload.state.as_str())
        .bind(upload.uploaded_at)
        .bind(upload.finished_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn get_upload(&self, id: i64) -> MetadataResult<Option<UploadRow>> {
        let row = sqlx::query_as::<_, UploadRow>("SELECT * FROM uploads WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get_uploads_by_repository(&self, repository_id: i64) -> MetadataResult<Vec<UploadRow>> {
        let rows = sqlx::query_as::<_, UploadRow>(
            "SELECT * FROM uploads WHERE repository_id = $1 AND state <> 'deleted' ORDER BY id",
        )
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn transition_upload_state(
        &self,
        id: i64,
        from: UploadState,
        to: UploadState,
        now: OffsetDateTime,
    ) -> MetadataResult<bool> {
        if !from.can_transition_to(to) {
            return Err(MetadataError::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let result = if matches!(to, UploadState::Completed | UploadState::Failed) {
            sqlx::query(
                r#"
                UPDATE uploads SET state = $1, finished_at = COALESCE(finished_at, $2)
                WHERE id = $3 AND state = $4
                "#,
            )
            .bind(to.as_str())
            .bind(now)
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query("UPDATE uploads SET state = $1 WHERE id = $2 AND state = $3")
                .bind(to.as_str())
                .bind(id)
                .bind(from.as_str())
                .execute(&self.pool)
                .await?
        };
        Ok(result.rows_affected() == 1)
    }

    async fn insert_packages(&self, upload_id: i64, packages: &[PackageKey]) -> MetadataResult<()> {
        insert_package_rows(&self.pool, "packages", upload_id, packages).await
    }

    async fn insert_package_references(
        &self,
        upload_id: i64,
        packages: &[PackageKey],
    ) -> MetadataResult<()> {
        insert_package_rows(&self.pool, "package_references", upload_id, packages).await
    }

    async fn update_commit_date(
        &self,
        repository_id: i64,
        commit_sha: &str,
        committed_at: OffsetDateTime,
    ) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO commit_dates (repository_id, commit_sha, committed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (repository_id, commit_sha) DO UPDATE
            SET committed_at = EXCLUDED.committed_at
            "#,
        )
        .bind(repository_id)
        .bind(commit_sha)
        .bind(committed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_index(&self, index: &NewIndex) -> MetadataResult<i64> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO indexes (
                repository_id, commit_sha, root, indexer, state, queued_at,
                finished_at, failure_message
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(index.repository_id)
        .bind(&index.commit_sha)
        .bind(&index.root)
        .bind(&index.indexer)
        .bind(index.state.as_str())
        .bind(index.queued_at)
        .bind(index.finished_at)
        .bind(&index.failure_message)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn get_index(&self, id: i64) -> MetadataResult<Option<IndexRow>> {
        let row = sqlx::query_as::<_, IndexRow>("SELECT * FROM indexes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn upsert_repository(&self, id: i64, name: &str) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO repositories (id, name) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name
            "#,
        )
        .bind(id)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_repository(&self, id: i64) -> MetadataResult<Option<RepositoryRow>> {
        let row = sqlx::query_as::<_, RepositoryRow>("SELECT * FROM repositories WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn mark_repository_deleted(
        &self,
        id: i64,
        deleted_at: OffsetDateTime,
    ) -> MetadataResult<()> {
        let result = sqlx::query("UPDATE repositories SET deleted_at = $1 WHERE id = $2")
            .bind(deleted_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!("repository {id} not found")));
        }
        Ok(())
    }

    async fn set_repository_blocked(&self, id: i64, blocked: bool) -> MetadataResult<()> {
        let result = sqlx::query("UPDATE repositories SET blocked = $1 WHERE id = $2")
            .bind(blocked)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!("repository {id} not found")));
        }
        Ok(())
    }

    async fn set_retention_configuration(
        &self,
        repository_id: i64,
        max_age_for_non_stale_branches: Option<Duration>,
        max_age_for_non_stale_tags: Option<Duration>,
    ) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO retention_configuration (
                repository_id, max_age_for_non_stale_branches_secs, max_age_for_non_stale_tags_secs
            ) VALUES ($1, $2, $3)
            ON CONFLICT (repository_id) DO UPDATE SET
                max_age_for_non_stale_branches_secs = EXCLUDED.max_age_for_non_stale_branches_secs,
                max_age_for_non_stale_tags_secs = EXCLUDED.max_age_for_non_stale_tags_secs
            "#,
        )
        .bind(repository_id)
        .bind(max_age_for_non_stale_branches.map(|d| d.whole_seconds()))
        .bind(max_age_for_non_stale_tags.map(|d| d.whole_seconds()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

async fn insert_package_rows(
    pool: &Pool<Postgres>,
    table: &'static str,
    upload_id: i64,
    packages: &[PackageKey],
) -> MetadataResult<()> {
    if packages.is_empty() {
        return Ok(());
    }
    let mut qb = QueryBuilder::<Postgres>::new(format!(
        "INSERT INTO {table} (dump_id, scheme, manager, name, version) "
    ));
    qb.push_values(packages, |mut b, package| {
        b.push_bind(upload_id)
            .push_bind(package.scheme.clone())
            .push_bind(package.manager.clone())
            .push_bind(package.name.clone())
            .push_bind(package.version.clone());
    });
    qb.push(" ON CONFLICT DO NOTHING");
    qb.build().execute(pool).await?;
    Ok(())
}

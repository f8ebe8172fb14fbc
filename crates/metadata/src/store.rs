//! Metadata store trait and implementations.

use crate::error::{MetadataError, MetadataResult};
use crate::observability::Operations;
use crate::repos::{CleanupRepo, DirtyRepo, ReclaimRepo, RetentionRepo, UploadRepo, VisibilityRepo};
use crate::visibility::StagingOptions;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    UploadRepo + VisibilityRepo + DirtyRepo + RetentionRepo + ReclaimRepo + CleanupRepo + Send + Sync
{
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// Expired uploads read per page while searching for a traversal root.
pub(crate) const TRAVERSAL_PAGE_SIZE: u32 = 100;

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    #[allow(dead_code)] // SQLite cannot cancel a running statement
    query_timeout_secs: u64,
    operations: Operations,
    staging: StagingOptions,
}

impl SqliteStore {
    /// Create a new SQLite store.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
        operations: Operations,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let query_timeout_secs = query_timeout_secs.unwrap_or(600); // 10 minutes default
        let in_memory = path.as_os_str() == ":memory:";

        if !in_memory && let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{}?mode=rwc", path.display())
        };
        let opts = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let mut pool_opts = SqlitePoolOptions::new()
            // SQLite permits limited write concurrency; a single connection also
            // serializes syncs of the same repository.
            .max_connections(1);
        if in_memory {
            // The database lives only as long as its connection.
            pool_opts = pool_opts.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_opts.connect_with(opts).await?;

        let store = Self {
            pool,
            query_timeout_secs,
            operations,
            staging: StagingOptions::default(),
        };
        store.migrate().await?;

        tracing::warn!(
            query_timeout_secs = query_timeout_secs,
            "SQLite query timeout is advisory only - long syncs may exceed it. \
             Use PostgreSQL for deployments with more than one worker."
        );

        Ok(store)
    }

    /// Override the staging batch size and channel capacity.
    pub fn with_staging_options(mut self, staging: StagingOptions) -> Self {
        self.staging = staging;
        self
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Metrics recorded by this store.
    pub fn operations(&self) -> &Operations {
        &self.operations
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// Implement all the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use crate::reclaim::{self, Node, ProviderRow, ReclaimSource, ReferenceRow};
    use crate::repos::{
        DELETED_REPOSITORY_GRACE_PERIOD, ReclaimStats, SourcedCommitsCleanup, TableDiff,
        VisibilityStats,
    };
    use crate::visibility::{self, RefPolicy, SeedUpload, StagingSink, TipRow};
    use sqlx::types::Json;
    use sqlx::{QueryBuilder, SqliteConnection};
    use std::collections::{BTreeMap, BTreeSet, HashMap};
    use tidemark_core::{
        CommitGraph, LinkRow, NearestUploadsRow, PackageKey, RefDescription,
        UploadMeta, UploadState,
    };
    use time::{Duration, OffsetDateTime, UtcOffset};

    /// Stored timestamps are compared as text, so they must share an offset.
    fn utc(ts: OffsetDateTime) -> OffsetDateTime {
        ts.to_offset(UtcOffset::UTC)
    }

    fn push_id_list(qb: &mut QueryBuilder<'_, Sqlite>, ids: &[i64]) {
        qb.push("(");
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
    }

    fn push_package_list(qb: &mut QueryBuilder<'_, Sqlite>, packages: &[PackageKey]) {
        qb.push("(VALUES ");
        for (i, package) in packages.iter().enumerate() {
            if i > 0 {
                qb.push(", ");
            }
            qb.push("(")
                .push_bind(package.scheme.clone())
                .push(", ")
                .push_bind(package.manager.clone())
                .push(", ")
                .push_bind(package.name.clone())
                .push(", ")
                .push_bind(package.version.clone())
                .push(")");
        }
        qb.push(")");
    }

    /// Bump the dirty token of each repository.
    async fn mark_dirty(
        conn: &mut SqliteConnection,
        repository_ids: &BTreeSet<i64>,
        now: OffsetDateTime,
    ) -> MetadataResult<()> {
        for repository_id in repository_ids {
            sqlx::query(
                r#"
                INSERT INTO dirty_repositories (repository_id, dirty_token, update_token, set_dirty_at)
                VALUES (?, 1, 0, ?)
                ON CONFLICT(repository_id) DO UPDATE SET
                    set_dirty_at = CASE
                        WHEN dirty_repositories.update_token = dirty_repositories.dirty_token
                        THEN excluded.set_dirty_at
                        ELSE dirty_repositories.set_dirty_at
                    END,
                    dirty_token = dirty_repositories.dirty_token + 1
                "#,
            )
            .bind(repository_id)
            .bind(utc(now))
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    /// Move completed uploads to 'deleting', returning their repositories.
    async fn soft_delete_completed(
        conn: &mut SqliteConnection,
        ids: &[i64],
    ) -> MetadataResult<Vec<i64>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(
            "UPDATE uploads SET state = 'deleting' WHERE state = 'completed' AND id IN ",
        );
        push_id_list(&mut qb, ids);
        qb.push(" RETURNING repository_id");
        let repositories: Vec<i64> = qb.build_query_scalar().fetch_all(&mut *conn).await?;
        Ok(repositories)
    }

    async fn stamp(
        conn: &mut SqliteConnection,
        column: &'static str,
        ids: &[i64],
        now: OffsetDateTime,
    ) -> MetadataResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(format!("UPDATE uploads SET {column} = "));
        qb.push_bind(utc(now)).push(" WHERE id IN ");
        push_id_list(&mut qb, ids);
        qb.build().execute(&mut *conn).await?;
        Ok(())
    }

    struct SqliteSink<'c> {
        conn: &'c mut SqliteConnection,
    }

    #[async_trait]
    impl StagingSink for SqliteSink<'_> {
        async fn stage_nearest_uploads(
            &mut self,
            rows: &[NearestUploadsRow],
        ) -> MetadataResult<()> {
            let mut qb =
                QueryBuilder::<Sqlite>::new("INSERT INTO t_nearest_uploads (commit_sha, uploads) ");
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
            let mut qb = QueryBuilder::<Sqlite>::new(
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
            let mut qb = QueryBuilder::<Sqlite>::new(
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

    const CREATE_STAGING_TABLES: [&str; 6] = [
        "DROP TABLE IF EXISTS temp.t_nearest_uploads",
        "DROP TABLE IF EXISTS temp.t_nearest_uploads_links",
        "DROP TABLE IF EXISTS temp.t_uploads_visible_at_tip",
        "CREATE TEMP TABLE t_nearest_uploads (commit_sha TEXT PRIMARY KEY, uploads TEXT NOT NULL)",
        "CREATE TEMP TABLE t_nearest_uploads_links (commit_sha TEXT PRIMARY KEY, ancestor_commit_sha TEXT NOT NULL, distance INTEGER NOT NULL)",
        "CREATE TEMP TABLE t_uploads_visible_at_tip (upload_id INTEGER NOT NULL, branch_or_tag_name TEXT NOT NULL, is_default_branch INTEGER NOT NULL)",
    ];

    const DROP_STAGING_TABLES: [&str; 3] = [
        "DROP TABLE IF EXISTS temp.t_nearest_uploads",
        "DROP TABLE IF EXISTS temp.t_nearest_uploads_links",
        "DROP TABLE IF EXISTS temp.t_uploads_visible_at_tip",
    ];

    async fn run_each(conn: &mut SqliteConnection, statements: &[&str]) -> MetadataResult<()> {
        for statement in statements {
            sqlx::query(statement)
                .persistent(false)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    /// Run the update, delete and insert halves of a table diff. Every `?`
    /// is the repository id; an empty `update` is skipped.
    async fn apply_diff(
        conn: &mut SqliteConnection,
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
            .bind(repository_id)
            .execute(&mut *conn)
            .await?
            .rows_affected();
        Ok(diff)
    }

    impl SqliteStore {
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
            let now = utc(now);
            let mut tx = self.pool.begin().await?;

            let overrides: Option<(Option<i64>, Option<i64>)> = sqlx::query_as(
                r#"
                SELECT max_age_for_non_stale_branches_secs, max_age_for_non_stale_tags_secs
                FROM retention_configuration WHERE repository_id = ?
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
                WHERE repository_id = ? AND state = 'completed'
                ORDER BY id
                "#,
            )
            .bind(repository_id)
            .fetch_all(&mut *tx)
            .await?;
            let view = visibility::seed_view(&seeds);

            run_each(&mut tx, &CREATE_STAGING_TABLES).await?;
            let staged = {
                let mut sink = SqliteSink { conn: &mut tx };
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
                UPDATE nearest_uploads SET uploads = t.uploads
                FROM t_nearest_uploads t
                WHERE nearest_uploads.repository_id = ?
                  AND nearest_uploads.commit_sha = t.commit_sha
                  AND nearest_uploads.uploads <> t.uploads
                "#,
                r#"
                INSERT INTO nearest_uploads (repository_id, commit_sha, uploads)
                SELECT ?, t.commit_sha, t.uploads FROM t_nearest_uploads t
                WHERE NOT EXISTS (
                    SELECT 1 FROM nearest_uploads n
                    WHERE n.repository_id = ? AND n.commit_sha = t.commit_sha
                )
                "#,
                r#"
                DELETE FROM nearest_uploads
                WHERE repository_id = ? AND NOT EXISTS (
                    SELECT 1 FROM t_nearest_uploads t
                    WHERE t.commit_sha = nearest_uploads.commit_sha
                )
                "#,
            )
            .await?;

            let nearest_upload_links = apply_diff(
                &mut tx,
                repository_id,
                r#"
                UPDATE nearest_uploads_links
                SET ancestor_commit_sha = t.ancestor_commit_sha, distance = t.distance
                FROM t_nearest_uploads_links t
                WHERE nearest_uploads_links.repository_id = ?
                  AND nearest_uploads_links.commit_sha = t.commit_sha
                  AND (nearest_uploads_links.ancestor_commit_sha <> t.ancestor_commit_sha
                       OR nearest_uploads_links.distance <> t.distance)
                "#,
                r#"
                INSERT INTO nearest_uploads_links (repository_id, commit_sha, ancestor_commit_sha, distance)
                SELECT ?, t.commit_sha, t.ancestor_commit_sha, t.distance FROM t_nearest_uploads_links t
                WHERE NOT EXISTS (
                    SELECT 1 FROM nearest_uploads_links l
                    WHERE l.repository_id = ? AND l.commit_sha = t.commit_sha
                )
                "#,
                r#"
                DELETE FROM nearest_uploads_links
                WHERE repository_id = ? AND NOT EXISTS (
                    SELECT 1 FROM t_nearest_uploads_links t
                    WHERE t.commit_sha = nearest_uploads_links.commit_sha
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
                SELECT ?, t.upload_id, t.branch_or_tag_name, t.is_default_branch FROM t_uploads_visible_at_tip t
                WHERE NOT EXISTS (
                    SELECT 1 FROM uploads_visible_at_tip v
                    WHERE v.repository_id = ?
                      AND v.upload_id = t.upload_id
                      AND v.branch_or_tag_name = t.branch_or_tag_name
                      AND v.is_default_branch = t.is_default_branch
                )
                "#,
                r#"
                DELETE FROM uploads_visible_at_tip
                WHERE repository_id = ? AND NOT EXISTS (
                    SELECT 1 FROM t_uploads_visible_at_tip t
                    WHERE t.upload_id = uploads_visible_at_tip.upload_id
                      AND t.branch_or_tag_name = uploads_visible_at_tip.branch_or_tag_name
                      AND t.is_default_branch = uploads_visible_at_tip.is_default_branch
                )
                "#,
            )
            .await?;

            let mut superseded = false;
            if dirty_token != 0 {
                sqlx::query(
                    r#"
                    UPDATE dirty_repositories
                    SET update_token = MAX(update_token, ?), updated_at = ?
                    WHERE repository_id = ?
                    "#,
                )
                .bind(dirty_token)
                .bind(now)
                .bind(repository_id)
                .execute(&mut *tx)
                .await?;

                let still_dirty: Option<bool> = sqlx::query_scalar(
                    "SELECT dirty_token > update_token FROM dirty_repositories WHERE repository_id = ?",
                )
                .bind(repository_id)
                .fetch_optional(&mut *tx)
                .await?;
                superseded = still_dirty.unwrap_or(false);
            }

            let finalized_deletions = sqlx::query(
                "UPDATE uploads SET state = 'deleted' WHERE repository_id = ? AND state = 'deleting'",
            )
            .bind(repository_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            run_each(&mut tx, &DROP_STAGING_TABLES).await?;
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
    impl VisibilityRepo for SqliteStore {
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
                "SELECT uploads FROM nearest_uploads WHERE repository_id = ? AND commit_sha = ?",
            )
            .bind(repository_id)
            .bind(commit_sha)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(Json(uploads)) = explicit {
                return Ok(metas(uploads, 0));
            }

            let link: Option<(String, i64)> = sqlx::query_as(
                r#"
                SELECT ancestor_commit_sha, distance FROM nearest_uploads_links
                WHERE repository_id = ? AND commit_sha = ?
                "#,
            )
            .bind(repository_id)
            .bind(commit_sha)
            .fetch_optional(&self.pool)
            .await?;
            let Some((ancestor, distance)) = link else {
                return Ok(Vec::new());
            };

            let inherited: Option<Json<BTreeMap<i64, u32>>> = sqlx::query_scalar(
                "SELECT uploads FROM nearest_uploads WHERE repository_id = ? AND commit_sha = ?",
            )
            .bind(repository_id)
            .bind(&ancestor)
            .fetch_optional(&self.pool)
            .await?;
            let offset = u32::try_from(distance).unwrap_or(u32::MAX);
            Ok(inherited
                .map(|Json(uploads)| metas(uploads, offset))
                .unwrap_or_default())
        }

        async fn get_nearest_uploads(
            &self,
            repository_id: i64,
        ) -> MetadataResult<Vec<NearestUploadsEntry>> {
            let rows = sqlx::query_as::<_, NearestUploadsEntry>(
                r#"
                SELECT repository_id, commit_sha, uploads FROM nearest_uploads
                WHERE repository_id = ? ORDER BY commit_sha
                "#,
            )
            .bind(repository_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn get_nearest_upload_links(
            &self,
            repository_id: i64,
        ) -> MetadataResult<Vec<LinkEntry>> {
            let rows = sqlx::query_as::<_, LinkEntry>(
                r#"
                SELECT repository_id, commit_sha, ancestor_commit_sha, distance
                FROM nearest_uploads_links
                WHERE repository_id = ? ORDER BY commit_sha
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
                WHERE repository_id = ?
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
    impl DirtyRepo for SqliteStore {
        async fn set_repository_dirty(&self, repository_id: i64) -> MetadataResult<()> {
            let mut conn = self.pool.acquire().await?;
            self.operations
                .observe(
                    "set_repository_dirty",
                    mark_dirty(
                        &mut conn,
                        &BTreeSet::from([repository_id]),
                        OffsetDateTime::now_utc(),
                    ),
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
                  AND (r.id IS NULL OR (r.deleted_at IS NULL AND r.blocked = 0))
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
                FROM dirty_repositories WHERE repository_id = ?
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

        async fn get_repositories_max_stale_age(
            &self,
            now: OffsetDateTime,
        ) -> MetadataResult<Duration> {
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

    impl SqliteStore {
        async fn claim_tx(
            &self,
            process_delay: Duration,
            limit: u32,
            now: OffsetDateTime,
        ) -> MetadataResult<Vec<i64>> {
            let now = utc(now);
            let cutoff = now - process_delay;
            let mut tx = self.pool.begin().await?;

            let candidates: Vec<i64> = sqlx::query_scalar(
                r#"
                SELECT c.repository_id
                FROM (SELECT DISTINCT repository_id FROM uploads WHERE state = 'completed') c
                LEFT JOIN last_retention_scan s ON s.repository_id = c.repository_id
                LEFT JOIN dirty_repositories d ON d.repository_id = c.repository_id
                WHERE (s.last_retention_scan_at IS NULL OR s.last_retention_scan_at < ?)
                  AND (d.repository_id IS NULL OR d.dirty_token <= d.update_token)
                ORDER BY s.last_retention_scan_at NULLS FIRST, c.repository_id
                LIMIT ?
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
                    VALUES (?, ?)
                    ON CONFLICT(repository_id) DO UPDATE
                    SET last_retention_scan_at = excluded.last_retention_scan_at
                    WHERE last_retention_scan.last_retention_scan_at < ?
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
                let mut qb = QueryBuilder::<Sqlite>::new("UPDATE uploads SET expired = 1 WHERE id IN ");
                push_id_list(&mut qb, &expired_ids);
                qb.build().execute(&mut *tx).await?;
            }
            tx.commit().await?;
            Ok(())
        }
    }

    #[async_trait]
    impl RetentionRepo for SqliteStore {
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
                "SELECT last_retention_scan_at FROM last_retention_scan WHERE repository_id = ?",
            )
            .bind(repository_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(at)
        }
    }

    struct SqliteReclaim<'c> {
        conn: &'c mut SqliteConnection,
    }

    #[async_trait]
    impl ReclaimSource for SqliteReclaim<'_> {
        async fn providers(&mut self, upload_ids: &[i64]) -> MetadataResult<Vec<ProviderRow>> {
            if upload_ids.is_empty() {
                return Ok(Vec::new());
            }
            let mut qb = QueryBuilder::<Sqlite>::new(
                r#"
                SELECT u.id AS upload_id, u.repository_id, u.indexer, u.root,
                       p.scheme, p.manager, p.name, p.version, cd.committed_at
                FROM packages p
                JOIN uploads u ON u.id = p.dump_id
                LEFT JOIN commit_dates cd
                  ON cd.repository_id = u.repository_id AND cd.commit_sha = u.commit_sha
                WHERE u.state = 'completed' AND EXISTS (
                    SELECT 1 FROM packages q
                    WHERE q.scheme = p.scheme AND q.manager = p.manager
                      AND q.name = p.name AND q.version = p.version
                      AND q.dump_id IN "#,
            );
            push_id_list(&mut qb, upload_ids);
            qb.push(")");
            let rows = qb
                .build_query_as::<ProviderRow>()
                .fetch_all(&mut *self.conn)
                .await?;
            Ok(rows)
        }

        async fn references(
            &mut self,
            packages: &[PackageKey],
        ) -> MetadataResult<Vec<ReferenceRow>> {
            if packages.is_empty() {
                return Ok(Vec::new());
            }
            let mut qb = QueryBuilder::<Sqlite>::new(
                r#"
                SELECT r.dump_id AS upload_id, r.scheme, r.manager, r.name, r.version
                FROM package_references r
                JOIN uploads u ON u.id = r.dump_id
                WHERE u.state <> 'deleted'
                  AND (r.scheme, r.manager, r.name, r.version) IN "#,
            );
            push_package_list(&mut qb, packages);
            let rows = qb
                .build_query_as::<ReferenceRow>()
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
                WHERE state = 'completed' AND expired = 1
                ORDER BY last_traversal_scan_at NULLS FIRST, finished_at, id
                LIMIT ? OFFSET ?
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
            let mut qb = QueryBuilder::<Sqlite>::new(
                r#"
                SELECT DISTINCT u.id, u.repository_id,
                       (u.state = 'completed' AND u.expired = 1) AS expired
                FROM package_references r
                JOIN uploads u ON u.id = r.dump_id
                WHERE u.state <> 'deleted'
                  AND (r.scheme, r.manager, r.name, r.version) IN "#,
            );
            push_package_list(&mut qb, packages);
            if !exclude.is_empty() {
                qb.push(" AND u.id NOT IN ");
                push_id_list(&mut qb, exclude);
            }
            qb.push(" ORDER BY u.id LIMIT ").push_bind(i64::from(limit));
            let rows = qb
                .build_query_as::<Node>()
                .fetch_all(&mut *self.conn)
                .await?;
            Ok(rows)
        }
    }

    impl SqliteStore {
        async fn reclaim_by_reference_count_tx(
            &self,
            batch_size: u32,
        ) -> MetadataResult<ReclaimStats> {
            let now = OffsetDateTime::now_utc();
            let mut tx = self.pool.begin().await?;

            let candidates: Vec<i64> = sqlx::query_scalar(
                r#"
                SELECT id FROM uploads
                WHERE state = 'completed' AND expired = 1
                ORDER BY last_referenced_scan_at NULLS FIRST, finished_at, id
                LIMIT ?
                "#,
            )
            .bind(i64::from(batch_size))
            .fetch_all(&mut *tx)
            .await?;
            if candidates.is_empty() {
                tx.commit().await?;
                return Ok(ReclaimStats::default());
            }

            let safe =
                reclaim::unreferenced(&mut SqliteReclaim { conn: &mut tx }, &candidates).await?;
            stamp(&mut tx, "last_referenced_scan_at", &candidates, now).await?;
            let repositories = soft_delete_completed(&mut tx, &safe).await?;
            mark_dirty(&mut tx, &repositories.iter().copied().collect(), now).await?;
            tx.commit().await?;

            Ok(ReclaimStats {
                scanned: candidates.len() as u64,
                deleted: repositories.len() as u64,
                incomplete: false,
            })
        }

        async fn reclaim_by_traversal_tx(
            &self,
            traversal_limit: u32,
        ) -> MetadataResult<ReclaimStats> {
            let now = OffsetDateTime::now_utc();
            let mut tx = self.pool.begin().await?;

            let search = reclaim::find_root(
                &mut SqliteReclaim { conn: &mut tx },
                TRAVERSAL_PAGE_SIZE,
            )
            .await?;
            stamp(&mut tx, "last_traversal_scan_at", &search.rejected, now).await?;
            let Some(root) = search.root else {
                tx.commit().await?;
                return Ok(ReclaimStats {
                    scanned: search.rejected.len() as u64,
                    ..ReclaimStats::default()
                });
            };

            let component = reclaim::explore(
                &mut SqliteReclaim { conn: &mut tx },
                root,
                traversal_limit,
            )
            .await?;
            stamp(&mut tx, "last_traversal_scan_at", &component.visited, now).await?;

            let mut deleted = 0;
            if component.deletable() {
                let repositories = soft_delete_completed(&mut tx, &component.visited).await?;
                deleted = repositories.len() as u64;
                mark_dirty(&mut tx, &repositories.into_iter().collect(), now).await?;
            }
            tx.commit().await?;

            Ok(ReclaimStats {
                scanned: (search.rejected.len() + component.visited.len()) as u64,
                deleted,
                incomplete: !component.complete,
            })
        }
    }

    #[async_trait]
    impl ReclaimRepo for SqliteStore {
        async fn reclaim_by_reference_count(
            &self,
            batch_size: u32,
        ) -> MetadataResult<ReclaimStats> {
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

    impl SqliteStore {
        async fn delete_without_repository(
            &self,
            table: &'static str,
            now: OffsetDateTime,
        ) -> MetadataResult<HashMap<i64, u64>> {
            let cutoff = utc(now) - DELETED_REPOSITORY_GRACE_PERIOD;
            let repositories: Vec<i64> = sqlx::query_scalar(&format!(
                r#"
                UPDATE {table} SET state = 'deleted'
                WHERE state <> 'deleted' AND repository_id IN (
                    SELECT id FROM repositories
                    WHERE (deleted_at IS NOT NULL AND deleted_at < ?) OR blocked = 1
                )
                RETURNING repository_id
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
            let cutoff = utc(now) - max_age;
            let mut tx = self.pool.begin().await?;
            let ids: Vec<i64> = sqlx::query_scalar(
                r#"
                SELECT id FROM indexes
                WHERE state = 'failed' AND COALESCE(finished_at, queued_at) < ?
                ORDER BY id
                LIMIT ?
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

            let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM indexes WHERE id IN ");
            push_id_list(&mut qb, &ids);
            qb.push(
                r#"
                AND EXISTS (
                    SELECT 1 FROM indexes later
                    WHERE later.repository_id = indexes.repository_id
                      AND later.root = indexes.root
                      AND later.indexer = indexes.indexer
                      AND later.state IN ('completed', 'failed')
                      AND (later.queued_at, later.id) > (indexes.queued_at, indexes.id)
                )
                "#,
            );
            let deleted = qb.build().execute(&mut *tx).await?.rows_affected();
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
            let now = utc(now);
            let cutoff = now - maximum_commit_lag;
            let mut tx = self.pool.begin().await?;

            let updated = sqlx::query(
                r#"
                UPDATE uploads SET commit_last_checked_at = ?
                WHERE repository_id = ? AND commit_sha = ?
                  AND state NOT IN ('deleted', 'deleting') AND uploaded_at >= ?
                "#,
            )
            .bind(now)
            .bind(repository_id)
            .bind(commit_sha)
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            let soft_deleted = sqlx::query(
                r#"
                UPDATE uploads SET state = 'deleted'
                WHERE repository_id = ? AND commit_sha = ?
                  AND state NOT IN ('deleted', 'deleting', 'completed') AND uploaded_at < ?
                "#,
            )
            .bind(repository_id)
            .bind(commit_sha)
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            let deleting = sqlx::query(
                r#"
                UPDATE uploads SET state = 'deleting'
                WHERE repository_id = ? AND commit_sha = ? AND state = 'completed' AND uploaded_at < ?
                "#,
            )
            .bind(repository_id)
            .bind(commit_sha)
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            let deleted = soft_deleted + deleting;
            if deleted > 0 {
                mark_dirty(&mut tx, &BTreeSet::from([repository_id]), now).await?;
            }
            tx.commit().await?;
            Ok(SourcedCommitsCleanup { updated, deleted })
        }
    }

    #[async_trait]
    impl CleanupRepo for SqliteStore {
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
                "UPDATE uploads SET state = 'deleted' WHERE state = 'uploading' AND uploaded_at < ?",
            )
            .bind(utc(uploaded_before))
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
                  AND (commit_last_checked_at IS NULL OR commit_last_checked_at < ?)
                ORDER BY repository_id, commit_sha
                LIMIT ?
                "#,
            )
            .bind(utc(now) - min_time_since_last_check)
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
                UPDATE uploads SET commit_last_checked_at = ?
                WHERE repository_id = ? AND commit_sha = ? AND state NOT IN ('deleted', 'deleting')
                "#,
            )
            .bind(utc(now))
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
    impl UploadRepo for SqliteStore {
        async fn insert_upload(&self, upload: &NewUpload) -> MetadataResult<i64> {
            let id = sqlx::query_scalar(
                r#"
                INSERT INTO uploads (
                    repository_id, commit_sha, root, indexer, state, uploaded_at, finished_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                RETURNING id
                "#,
            )
            .bind(upload.repository_id)
            .bind(&upload.commit_sha)
            .bind(&upload.root)
            .bind(&upload.indexer)
            .bind(upload.state.as_str())
            .bind(utc(upload.uploaded_at))
            .bind(upload.finished_at.map(utc))
            .fetch_one(&self.pool)
            .await?;
            Ok(id)
        }

        async fn get_upload(&self, id: i64) -> MetadataResult<Option<UploadRow>> {
            let row = sqlx::query_as::<_, UploadRow>("SELECT * FROM uploads WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn get_uploads_by_repository(
            &self,
            repository_id: i64,
        ) -> MetadataResult<Vec<UploadRow>> {
            let rows = sqlx::query_as::<_, UploadRow>(
                "SELECT * FROM uploads WHERE repository_id = ? AND state <> 'deleted' ORDER BY id",
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
            let finishes = matches!(to, UploadState::Completed | UploadState::Failed);
            let sql = if finishes {
                "UPDATE uploads SET state = ?, finished_at = COALESCE(finished_at, ?) WHERE id = ? AND state = ?"
            } else {
                "UPDATE uploads SET state = ? WHERE id = ? AND state = ?"
            };
            let mut query = sqlx::query(sql).bind(to.as_str());
            if finishes {
                query = query.bind(utc(now));
            }
            let result = query
                .bind(id)
                .bind(from.as_str())
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn insert_packages(
            &self,
            upload_id: i64,
            packages: &[PackageKey],
        ) -> MetadataResult<()> {
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
                VALUES (?, ?, ?)
                ON CONFLICT(repository_id, commit_sha) DO UPDATE
                SET committed_at = excluded.committed_at
                "#,
            )
            .bind(repository_id)
            .bind(commit_sha)
            .bind(utc(committed_at))
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
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                RETURNING id
                "#,
            )
            .bind(index.repository_id)
            .bind(&index.commit_sha)
            .bind(&index.root)
            .bind(&index.indexer)
            .bind(index.state.as_str())
            .bind(utc(index.queued_at))
            .bind(index.finished_at.map(utc))
            .bind(&index.failure_message)
            .fetch_one(&self.pool)
            .await?;
            Ok(id)
        }

        async fn get_index(&self, id: i64) -> MetadataResult<Option<IndexRow>> {
            let row = sqlx::query_as::<_, IndexRow>("SELECT * FROM indexes WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn upsert_repository(&self, id: i64, name: &str) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO repositories (id, name) VALUES (?, ?)
                ON CONFLICT(id) DO UPDATE SET name = excluded.name
                "#,
            )
            .bind(id)
            .bind(name)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn get_repository(&self, id: i64) -> MetadataResult<Option<RepositoryRow>> {
            let row = sqlx::query_as::<_, RepositoryRow>("SELECT * FROM repositories WHERE id = ?")
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
            let result = sqlx::query("UPDATE repositories SET deleted_at = ? WHERE id = ?")
                .bind(utc(deleted_at))
                .bind(id)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("repository {id} not found")));
            }
            Ok(())
        }

        async fn set_repository_blocked(&self, id: i64, blocked: bool) -> MetadataResult<()> {
            let result = sqlx::query("UPDATE repositories SET blocked = ? WHERE id = ?")
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
                ) VALUES (?, ?, ?)
                ON CONFLICT(repository_id) DO UPDATE SET
                    max_age_for_non_stale_branches_secs = excluded.max_age_for_non_stale_branches_secs,
                    max_age_for_non_stale_tags_secs = excluded.max_age_for_non_stale_tags_secs
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
        pool: &Pool<Sqlite>,
        table: &'static str,
        upload_id: i64,
        packages: &[PackageKey],
    ) -> MetadataResult<()> {
        if packages.is_empty() {
            return Ok(());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "INSERT OR IGNORE INTO {table} (dump_id, scheme, manager, name, version) "
        ));
        qb.push_values(packages, |mut b, package| {
            b.push_bind(upload_id)
                .push_bind(package.scheme.clone())
                .push_bind(package.manager.clone())
                .push_bind(package.name.clone())
                .push_bind(package.version.clone());
        });
        qb.build().execute(pool).await?;
        Ok(())
    }
}

/// Upload ids visible through a stored map, `offset` edges further away.
pub(crate) fn metas(
    uploads: std::collections::BTreeMap<i64, u32>,
    offset: u32,
) -> Vec<tidemark_core::UploadMeta> {
    uploads
        .into_iter()
        .map(|(upload_id, distance)| tidemark_core::UploadMeta {
            upload_id,
            distance: distance.saturating_add(offset),
        })
        .collect()
}

pub(crate) fn count_by_repository(
    repositories: Vec<i64>,
) -> std::collections::HashMap<i64, u64> {
    let mut counts = std::collections::HashMap::new();
    for repository_id in repositories {
        *counts.entry(repository_id).or_insert(0) += 1;
    }
    counts
}

pub(crate) fn group_sourced_commits(rows: Vec<(i64, String)>) -> Vec<crate::models::SourcedCommits> {
    let mut grouped: Vec<crate::models::SourcedCommits> = Vec::new();
    for (repository_id, commit_sha) in rows {
        match grouped.last_mut() {
            Some(last) if last.repository_id == repository_id => last.commits.push(commit_sha),
            _ => grouped.push(crate::models::SourcedCommits {
                repository_id,
                commits: vec![commit_sha],
            }),
        }
    }
    grouped
}

pub(crate) fn record_sync(
    operations: &Operations,
    repository_id: i64,
    stats: &crate::repos::VisibilityStats,
) {
    for (kind, diff) in [
        ("nearest_uploads", stats.nearest_uploads),
        ("nearest_upload_links", stats.nearest_upload_links),
        ("uploads_visible_at_tip", stats.uploads_visible_at_tip),
    ] {
        operations.record_rows("sync_visibility", kind, diff.inserted + diff.updated + diff.deleted);
    }
    operations.record_rows(
        "sync_visibility",
        "finalized_deletions",
        stats.finalized_deletions,
    );
    if stats.superseded {
        tracing::warn!(
            repository_id,
            "Repository was marked dirty again during sync, leaving it dirty"
        );
    }
}

pub(crate) fn record_reclaim(
    operations: &Operations,
    op: &'static str,
    stats: &crate::repos::ReclaimStats,
) {
    operations.record_rows(op, "scanned", stats.scanned);
    operations.record_rows(op, "deleted", stats.deleted);
    if stats.incomplete {
        tracing::warn!(
            op,
            scanned = stats.scanned,
            "Traversal exceeded its limit, component left in place"
        );
    } else if stats.deleted > 0 {
        tracing::info!(
            op,
            scanned = stats.scanned,
            deleted = stats.deleted,
            "Reclaimed expired uploads"
        );
    }
}

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
-- Mirror of the externally owned repository table
CREATE TABLE IF NOT EXISTS repositories (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    deleted_at TEXT,
    blocked INTEGER NOT NULL DEFAULT 0
);

-- Uploads
CREATE TABLE IF NOT EXISTS uploads (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repository_id INTEGER NOT NULL,
    commit_sha TEXT NOT NULL,
    root TEXT NOT NULL DEFAULT '',
    indexer TEXT NOT NULL,
    state TEXT NOT NULL,
    expired INTEGER NOT NULL DEFAULT 0,
    uploaded_at TEXT NOT NULL,
    finished_at TEXT,
    last_retention_scan_at TEXT,
    last_referenced_scan_at TEXT,
    last_traversal_scan_at TEXT,
    commit_last_checked_at TEXT,
    num_failures INTEGER NOT NULL DEFAULT 0,
    failure_message TEXT
);
CREATE INDEX IF NOT EXISTS idx_uploads_repository_state ON uploads(repository_id, state);
CREATE INDEX IF NOT EXISTS idx_uploads_repository_commit ON uploads(repository_id, commit_sha);
CREATE INDEX IF NOT EXISTS idx_uploads_state_expired ON uploads(state, expired);

-- Indexes (build jobs)
CREATE TABLE IF NOT EXISTS indexes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repository_id INTEGER NOT NULL,
    commit_sha TEXT NOT NULL,
    root TEXT NOT NULL DEFAULT '',
    indexer TEXT NOT NULL,
    state TEXT NOT NULL,
    queued_at TEXT NOT NULL,
    finished_at TEXT,
    failure_message TEXT,
    num_failures INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_indexes_pipeline ON indexes(repository_id, root, indexer);
CREATE INDEX IF NOT EXISTS idx_indexes_state ON indexes(state, finished_at);

-- Packages provided and referenced by uploads
CREATE TABLE IF NOT EXISTS packages (
    dump_id INTEGER NOT NULL,
    scheme TEXT NOT NULL,
    manager TEXT NOT NULL DEFAULT '',
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    PRIMARY KEY (dump_id, scheme, manager, name, version)
);
CREATE INDEX IF NOT EXISTS idx_packages_key ON packages(scheme, manager, name, version);

CREATE TABLE IF NOT EXISTS package_references (
    dump_id INTEGER NOT NULL,
    scheme TEXT NOT NULL,
    manager TEXT NOT NULL DEFAULT '',
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    PRIMARY KEY (dump_id, scheme, manager, name, version)
);
CREATE INDEX IF NOT EXISTS idx_package_references_key ON package_references(scheme, manager, name, version);

-- Commit dates used to rank competing providers
CREATE TABLE IF NOT EXISTS commit_dates (
    repository_id INTEGER NOT NULL,
    commit_sha TEXT NOT NULL,
    committed_at TEXT NOT NULL,
    PRIMARY KEY (repository_id, commit_sha)
);

-- Visibility data
CREATE TABLE IF NOT EXISTS nearest_uploads (
    repository_id INTEGER NOT NULL,
    commit_sha TEXT NOT NULL,
    uploads TEXT NOT NULL,
    PRIMARY KEY (repository_id, commit_sha)
);

CREATE TABLE IF NOT EXISTS nearest_uploads_links (
    repository_id INTEGER NOT NULL,
    commit_sha TEXT NOT NULL,
    ancestor_commit_sha TEXT NOT NULL,
    distance INTEGER NOT NULL,
    PRIMARY KEY (repository_id, commit_sha)
);

CREATE TABLE IF NOT EXISTS uploads_visible_at_tip (
    repository_id INTEGER NOT NULL,
    upload_id INTEGER NOT NULL,
    branch_or_tag_name TEXT NOT NULL,
    is_default_branch INTEGER NOT NULL,
    PRIMARY KEY (repository_id, upload_id, branch_or_tag_name)
);
CREATE INDEX IF NOT EXISTS idx_uploads_visible_at_tip_upload ON uploads_visible_at_tip(upload_id);

-- Dirty tracking
CREATE TABLE IF NOT EXISTS dirty_repositories (
    repository_id INTEGER PRIMARY KEY,
    dirty_token INTEGER NOT NULL DEFAULT 0,
    update_token INTEGER NOT NULL DEFAULT 0,
    set_dirty_at TEXT,
    updated_at TEXT
);

-- Retention
CREATE TABLE IF NOT EXISTS last_retention_scan (
    repository_id INTEGER PRIMARY KEY,
    last_retention_scan_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS retention_configuration (
    repository_id INTEGER PRIMARY KEY,
    max_age_for_non_stale_branches_secs INTEGER,
    max_age_for_non_stale_tags_secs INTEGER
);
"#;

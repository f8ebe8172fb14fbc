//! Supporting cleanup repository.

use crate::error::MetadataResult;
use crate::models::SourcedCommits;
use async_trait::async_trait;
use std::collections::HashMap;
use time::{Duration, OffsetDateTime};

/// How long a repository must be deleted before its records are pruned.
pub const DELETED_REPOSITORY_GRACE_PERIOD: Duration = Duration::minutes(30);

/// Outcome of cleaning up the uploads of a vanished commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourcedCommitsCleanup {
    /// Recent uploads that were only re-stamped.
    pub updated: u64,
    /// Uploads moved to 'deleting' or 'deleted'.
    pub deleted: u64,
}

/// Repository for pruning records that can never become useful again.
#[async_trait]
pub trait CleanupRepo: Send + Sync {
    /// Soft-delete uploads of repositories deleted before the grace period, or blocked.
    async fn delete_uploads_without_repository(
        &self,
        now: OffsetDateTime,
    ) -> MetadataResult<HashMap<i64, u64>>;

    /// Soft-delete indexes of repositories deleted before the grace period, or blocked.
    async fn delete_indexes_without_repository(
        &self,
        now: OffsetDateTime,
    ) -> MetadataResult<HashMap<i64, u64>>;

    /// Hard-delete failed indexes older than `max_age` that a later attempt
    /// of the same (repository, root, indexer) superseded.
    ///
    /// Returns (scanned, deleted).
    async fn expire_failed_records(
        &self,
        batch_size: u32,
        max_age: Duration,
        now: OffsetDateTime,
    ) -> MetadataResult<(u64, u64)>;

    /// Soft-delete uploads still in 'uploading' that started before `uploaded_before`.
    async fn delete_uploads_stuck_uploading(
        &self,
        uploaded_before: OffsetDateTime,
    ) -> MetadataResult<u64>;

    /// Commits whose existence has not been re-checked within `min_time_since_last_check`.
    async fn get_stale_sourced_commits(
        &self,
        min_time_since_last_check: Duration,
        limit: u32,
        now: OffsetDateTime,
    ) -> MetadataResult<Vec<SourcedCommits>>;

    /// Record that `commit_sha` still exists.
    async fn update_sourced_commits(
        &self,
        repository_id: i64,
        commit_sha: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<u64>;

    /// Handle a commit that no longer exists.
    ///
    /// Uploads younger than `maximum_commit_lag` are only re-stamped. Older
    /// completed uploads move to 'deleting', other live ones to 'deleted', and
    /// the repository is marked dirty.
    async fn delete_sourced_commits(
        &self,
        repository_id: i64,
        commit_sha: &str,
        maximum_commit_lag: Duration,
        now: OffsetDateTime,
    ) -> MetadataResult<SourcedCommitsCleanup>;
}

//! Upload, index, package and repository record management.

use crate::error::MetadataResult;
use crate::models::{IndexRow, NewIndex, NewUpload, RepositoryRow, UploadRow};
use async_trait::async_trait;
use tidemark_core::{PackageKey, UploadState};
use time::{Duration, OffsetDateTime};

/// Repository for the records the reclaimers operate on.
#[async_trait]
pub trait UploadRepo: Send + Sync {
    /// Insert an upload, returning its id.
    async fn insert_upload(&self, upload: &NewUpload) -> MetadataResult<i64>;

    /// Get an upload by ID.
    async fn get_upload(&self, id: i64) -> MetadataResult<Option<UploadRow>>;

    /// All non-deleted uploads of a repository, ordered by id.
    async fn get_uploads_by_repository(&self, repository_id: i64) -> MetadataResult<Vec<UploadRow>>;

    /// Move an upload from `from` to `to` if it is still in `from`.
    ///
    /// Returns false if the upload was not in `from`. Fails with
    /// `InvalidStateTransition` if the step is not part of the lifecycle.
    /// Entering 'completed' or 'failed' records `finished_at` if unset.
    async fn transition_upload_state(
        &self,
        id: i64,
        from: UploadState,
        to: UploadState,
        now: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Record packages provided by an upload.
    async fn insert_packages(&self, upload_id: i64, packages: &[PackageKey]) -> MetadataResult<()>;

    /// Record packages referenced by an upload.
    async fn insert_package_references(
        &self,
        upload_id: i64,
        packages: &[PackageKey],
    ) -> MetadataResult<()>;

    /// Record the commit date used to rank competing package providers.
    async fn update_commit_date(
        &self,
        repository_id: i64,
        commit_sha: &str,
        committed_at: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Insert an index record, returning its id.
    async fn insert_index(&self, index: &NewIndex) -> MetadataResult<i64>;

    /// Get an index by ID.
    async fn get_index(&self, id: i64) -> MetadataResult<Option<IndexRow>>;

    /// Create or rename a repository mirror row.
    async fn upsert_repository(&self, id: i64, name: &str) -> MetadataResult<()>;

    /// Get a repository mirror row.
    async fn get_repository(&self, id: i64) -> MetadataResult<Option<RepositoryRow>>;

    /// Mark a repository as deleted at `deleted_at`.
    async fn mark_repository_deleted(
        &self,
        id: i64,
        deleted_at: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Block or unblock a repository.
    async fn set_repository_blocked(&self, id: i64, blocked: bool) -> MetadataResult<()>;

    /// Override the ref max-age windows used when syncing this repository.
    /// `None` falls back to the caller's defaults.
    async fn set_retention_configuration(
        &self,
        repository_id: i64,
        max_age_for_non_stale_branches: Option<Duration>,
        max_age_for_non_stale_tags: Option<Duration>,
    ) -> MetadataResult<()>;
}

//! Commit graph visibility repository.

use crate::error::MetadataResult;
use crate::models::{LinkEntry, NearestUploadsEntry, VisibleAtTipRow};
use async_trait::async_trait;
use std::collections::HashMap;
use tidemark_core::{CommitGraph, RefDescription, UploadMeta};
use time::{Duration, OffsetDateTime};

/// Rows changed in one persisted table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TableDiff {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
}

impl TableDiff {
    pub fn is_empty(&self) -> bool {
        self.inserted == 0 && self.updated == 0 && self.deleted == 0
    }
}

/// Outcome of one visibility sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VisibilityStats {
    pub nearest_uploads: TableDiff,
    pub nearest_upload_links: TableDiff,
    pub uploads_visible_at_tip: TableDiff,
    /// Rows produced by the graph builder, per table.
    pub staged_nearest_uploads: u64,
    pub staged_nearest_upload_links: u64,
    pub staged_uploads_visible_at_tip: u64,
    /// Uploads moved from 'deleting' to 'deleted'.
    pub finalized_deletions: u64,
    /// A newer dirty mark arrived while this sync ran; the repository stays dirty.
    pub superseded: bool,
}

impl VisibilityStats {
    /// Whether the sync changed no persisted visibility row.
    pub fn is_noop(&self) -> bool {
        self.nearest_uploads.is_empty()
            && self.nearest_upload_links.is_empty()
            && self.uploads_visible_at_tip.is_empty()
    }
}

/// Repository for persisted nearest-upload data.
#[async_trait]
pub trait VisibilityRepo: Send + Sync {
    /// Recompute and persist the visibility data of one repository.
    ///
    /// Runs as a single transaction: stages the builder output, applies the
    /// minimal insert/update/delete diff, raises the update token to
    /// `dirty_token` (when non-zero) and finalizes 'deleting' uploads.
    #[allow(clippy::too_many_arguments)]
    async fn sync_visibility(
        &self,
        repository_id: i64,
        commit_graph: &CommitGraph,
        ref_descriptions: &HashMap<String, Vec<RefDescription>>,
        max_age_for_non_stale_branches: Duration,
        max_age_for_non_stale_tags: Duration,
        dirty_token: i64,
        now: OffsetDateTime,
    ) -> MetadataResult<VisibilityStats>;

    /// Uploads visible from `commit`, resolving links, sorted by upload id.
    async fn get_visible_uploads(
        &self,
        repository_id: i64,
        commit_sha: &str,
    ) -> MetadataResult<Vec<UploadMeta>>;

    /// Persisted nearest-upload rows of a repository, ordered by commit.
    async fn get_nearest_uploads(&self, repository_id: i64)
    -> MetadataResult<Vec<NearestUploadsEntry>>;

    /// Persisted link rows of a repository, ordered by commit.
    async fn get_nearest_upload_links(&self, repository_id: i64) -> MetadataResult<Vec<LinkEntry>>;

    /// Persisted visible-at-tip rows, ordered by upload id then ref names.
    async fn get_uploads_visible_at_tip(
        &self,
        repository_id: i64,
    ) -> MetadataResult<Vec<VisibleAtTipRow>>;
}

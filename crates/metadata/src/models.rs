//! Database models mapping to the metadata schema.

use crate::error::MetadataResult;
use sqlx::FromRow;
use sqlx::types::Json;
use std::collections::BTreeMap;
use tidemark_core::{IndexState, PackageKey, UploadMeta, UploadState};
use time::OffsetDateTime;

// =============================================================================
// Repositories
// =============================================================================

/// Mirror of an externally owned repository.
#[derive(Debug, Clone, FromRow)]
pub struct RepositoryRow {
    pub id: i64,
    pub name: String,
    pub deleted_at: Option<OffsetDateTime>,
    pub blocked: bool,
}

// =============================================================================
// Uploads and indexes
// =============================================================================

/// Upload record.
#[derive(Debug, Clone, FromRow)]
pub struct UploadRow {
    pub id: i64,
    pub repository_id: i64,
    pub commit_sha: String,
    pub root: String,
    pub indexer: String,
    pub state: String,
    /// Set once by the retention scanner, never cleared.
    pub expired: bool,
    pub uploaded_at: OffsetDateTime,
    pub finished_at: Option<OffsetDateTime>,
    pub last_retention_scan_at: Option<OffsetDateTime>,
    pub last_referenced_scan_at: Option<OffsetDateTime>,
    pub last_traversal_scan_at: Option<OffsetDateTime>,
    pub commit_last_checked_at: Option<OffsetDateTime>,
    pub num_failures: i64,
    pub failure_message: Option<String>,
}

impl UploadRow {
    pub fn upload_state(&self) -> MetadataResult<UploadState> {
        Ok(self.state.parse()?)
    }
}

/// Parameters for inserting an upload.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub repository_id: i64,
    pub commit_sha: String,
    pub root: String,
    pub indexer: String,
    pub state: UploadState,
    pub uploaded_at: OffsetDateTime,
    pub finished_at: Option<OffsetDateTime>,
}

/// Index (build job) record.
#[derive(Debug, Clone, FromRow)]
pub struct IndexRow {
    pub id: i64,
    pub repository_id: i64,
    pub commit_sha: String,
    pub root: String,
    pub indexer: String,
    pub state: String,
    pub queued_at: OffsetDateTime,
    pub finished_at: Option<OffsetDateTime>,
    pub failure_message: Option<String>,
    pub num_failures: i64,
}

impl IndexRow {
    pub fn index_state(&self) -> MetadataResult<IndexState> {
        Ok(self.state.parse()?)
    }
}

/// Parameters for inserting an index.
#[derive(Debug, Clone)]
pub struct NewIndex {
    pub repository_id: i64,
    pub commit_sha: String,
    pub root: String,
    pub indexer: String,
    pub state: IndexState,
    pub queued_at: OffsetDateTime,
    pub finished_at: Option<OffsetDateTime>,
    pub failure_message: Option<String>,
}

// =============================================================================
// Commit graph visibility
// =============================================================================

/// Uploads visible from one commit, keyed by upload id.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct NearestUploadsEntry {
    pub repository_id: i64,
    pub commit_sha: String,
    pub uploads: Json<BTreeMap<i64, u32>>,
}

impl NearestUploadsEntry {
    /// Uploads sorted by id.
    pub fn upload_metas(&self) -> Vec<UploadMeta> {
        self.uploads
            .iter()
            .map(|(upload_id, distance)| UploadMeta {
                upload_id: *upload_id,
                distance: *distance,
            })
            .collect()
    }
}

/// Compressed pointer from a commit to its nearest ancestor with an entry.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct LinkEntry {
    pub repository_id: i64,
    pub commit_sha: String,
    pub ancestor_commit_sha: String,
    pub distance: i64,
}

/// An upload visible from a retained branch or tag tip.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct VisibleAtTipRow {
    pub repository_id: i64,
    pub upload_id: i64,
    /// Comma-joined, sorted ref names sharing the tip commit.
    pub branch_or_tag_name: String,
    pub is_default_branch: bool,
}

// =============================================================================
// Dirty tracking
// =============================================================================

/// A repository whose commit graph must be recomputed.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct DirtyRepository {
    pub repository_id: i64,
    pub dirty_token: i64,
}

/// Freshness of a repository's persisted visibility data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitGraphMetadata {
    pub stale: bool,
    pub updated_at: Option<OffsetDateTime>,
}

// =============================================================================
// Packages
// =============================================================================

/// A package provided or referenced by an upload.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct PackageRow {
    pub dump_id: i64,
    pub scheme: String,
    pub manager: String,
    pub name: String,
    pub version: String,
}

impl PackageRow {
    pub fn key(&self) -> PackageKey {
        PackageKey::new(&self.scheme, &self.manager, &self.name, &self.version)
    }
}

/// The commits of one repository that uploads were built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcedCommits {
    pub repository_id: i64,
    pub commits: Vec<String>,
}

//! Dirty-token repository.

use crate::error::MetadataResult;
use crate::models::{CommitGraphMetadata, DirtyRepository};
use async_trait::async_trait;
use time::{Duration, OffsetDateTime};

/// Repository for commit graph staleness tracking.
///
/// A repository is dirty while its dirty token is greater than its update
/// token. Marking increments the dirty token; a successful sync raises the
/// update token to the dirty token it was started with.
#[async_trait]
pub trait DirtyRepo: Send + Sync {
    /// Mark a repository's commit graph as stale.
    async fn set_repository_dirty(&self, repository_id: i64) -> MetadataResult<()>;

    /// Dirty repositories that still exist and are not blocked, ordered by id.
    async fn get_dirty_repositories(&self) -> MetadataResult<Vec<DirtyRepository>>;

    /// Staleness and last sync time of one repository.
    async fn get_commit_graph_metadata(
        &self,
        repository_id: i64,
    ) -> MetadataResult<CommitGraphMetadata>;

    /// Age of the longest-dirty repository, zero if none is dirty.
    async fn get_repositories_max_stale_age(&self, now: OffsetDateTime) -> MetadataResult<Duration>;
}

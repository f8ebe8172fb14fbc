//! Expired upload reclamation repository.

use crate::error::MetadataResult;
use async_trait::async_trait;

/// Outcome of one reclamation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReclaimStats {
    /// Uploads examined.
    pub scanned: u64,
    /// Uploads moved to 'deleting'.
    pub deleted: u64,
    /// The traversal hit its limit, so nothing was deleted.
    pub incomplete: bool,
}

/// Repository for deleting expired uploads nobody depends on.
#[async_trait]
pub trait ReclaimRepo: Send + Sync {
    /// Delete expired uploads that are not the canonical provider of a
    /// package referenced by another upload.
    async fn reclaim_by_reference_count(&self, batch_size: u32) -> MetadataResult<ReclaimStats>;

    /// Delete one connected component of expired uploads that only depend
    /// on each other, visiting at most `traversal_limit` uploads.
    async fn reclaim_by_traversal(&self, traversal_limit: u32) -> MetadataResult<ReclaimStats>;
}

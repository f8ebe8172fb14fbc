//! Retention scan repository.

use crate::error::MetadataResult;
use async_trait::async_trait;
use time::{Duration, OffsetDateTime};

/// Repository for claiming and recording retention decisions.
#[async_trait]
pub trait RetentionRepo: Send + Sync {
    /// Claim up to `limit` repositories due for a retention scan.
    ///
    /// A repository is due when it has a completed upload, a clean commit
    /// graph, and no scan within `process_delay` of `now`. Claiming stamps
    /// the scan time with a compare-and-swap, so a repository is returned to
    /// at most one caller per window. Never-scanned repositories come first.
    async fn claim_repositories_for_retention_scan(
        &self,
        process_delay: Duration,
        limit: u32,
        now: OffsetDateTime,
    ) -> MetadataResult<Vec<i64>>;

    /// Stamp `protected_ids` as scanned and flag `expired_ids` as expired.
    async fn mark_retention(
        &self,
        protected_ids: &[i64],
        expired_ids: &[i64],
        now: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// When a repository was last claimed for a retention scan.
    async fn get_last_retention_scan(
        &self,
        repository_id: i64,
    ) -> MetadataResult<Option<OffsetDateTime>>;
}

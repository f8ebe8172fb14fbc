//! Repository traits for metadata operations.

pub mod cleanup;
pub mod dirty;
pub mod reclaim;
pub mod retention;
pub mod uploads;
pub mod visibility;

pub use cleanup::{CleanupRepo, DELETED_REPOSITORY_GRACE_PERIOD, SourcedCommitsCleanup};
pub use dirty::DirtyRepo;
pub use reclaim::{ReclaimRepo, ReclaimStats};
pub use retention::RetentionRepo;
pub use uploads::UploadRepo;
pub use visibility::{TableDiff, VisibilityRepo, VisibilityStats};

//! Upload and index lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Upload state.
///
/// Transitions are monotone: an upload never returns to an earlier state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    /// Payload is still being received.
    Uploading,
    /// Waiting for a worker.
    Queued,
    /// A worker is converting the payload.
    Processing,
    /// Queryable.
    Completed,
    /// Processing failed.
    Failed,
    /// Selected for reclamation, still visible until the next visibility sync.
    Deleting,
    /// Soft-deleted.
    Deleted,
}

impl UploadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
        }
    }

    /// Check if the upload reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deleted)
    }

    /// Whether `self -> next` is a legal lifecycle step.
    pub fn can_transition_to(&self, next: UploadState) -> bool {
        use UploadState::*;
        match (self, next) {
            (Deleted, _) => false,
            (_, Deleted) => true,
            (Uploading, Queued | Processing) => true,
            (Queued, Processing) => true,
            (Processing, Completed | Failed) => true,
            (Completed, Deleting) => true,
            _ => false,
        }
    }

    /// Validate a transition, returning the target state.
    pub fn transition(&self, next: UploadState) -> crate::Result<UploadState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(crate::Error::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadState {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "uploading" => Ok(Self::Uploading),
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "deleting" => Ok(Self::Deleting),
            "deleted" => Ok(Self::Deleted),
            other => Err(crate::Error::InvalidState(format!(
                "unknown upload state '{other}'"
            ))),
        }
    }
}

/// Index (pre-upload build record) state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexState {
    Queued,
    Processing,
    Completed,
    Failed,
    Deleted,
}

impl IndexState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexState {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "deleted" => Ok(Self::Deleted),
            other => Err(crate::Error::InvalidState(format!(
                "unknown index state '{other}'"
            ))),
        }
    }
}

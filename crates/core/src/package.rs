//! Package identities exported and imported by uploads.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A versioned package as provided or referenced by an upload.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageKey {
    pub scheme: String,
    pub manager: String,
    pub name: String,
    pub version: String,
}

impl PackageKey {
    pub fn new(
        scheme: impl Into<String>,
        manager: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            manager: manager.into(),
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for PackageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}@{}",
            self.scheme, self.manager, self.name, self.version
        )
    }
}

//! Visibility token hashing.

use sha2::{Digest, Sha256};

/// Compute the visibility token of an upload.
///
/// Two uploads compete for visibility at a commit only when they share a
/// token, i.e. the same `root` directory indexed by the same `indexer`.
pub fn upload_token(root: &str, indexer: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(root.as_bytes());
    hasher.update(b":");
    hasher.update(indexer.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_is_hex_sha256() {
        let token = upload_token("lib/", "scip-go");
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_token_separates_root_and_indexer() {
        assert_eq!(upload_token("a", "b"), upload_token("a", "b"));
        assert_ne!(upload_token("a", "b"), upload_token("b", "a"));
        assert_ne!(upload_token("", "lsif-go"), upload_token("", "scip-go"));
    }

    #[test]
    fn test_token_known_value() {
        // sha256("a:b")
        assert_eq!(
            upload_token("a", "b"),
            "6783a31eabf68ccc0660f935c0826282bdd2241f3a80a9f2d10d59aea9ebb5d8"
        );
    }
}

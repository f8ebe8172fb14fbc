//! Backend-independent decisions of the upload reclaimers.
//!
//! Among completed uploads providing the same package from the same
//! (repository, indexer, root), the one built from the oldest commit (lower
//! id on ties, unknown dates last) is the canonical provider. Only canonical
//! providers can be depended on, so only they can be kept alive by references.

use crate::error::MetadataResult;
use async_trait::async_trait;
use sqlx::FromRow;
use std::collections::{BTreeSet, HashMap, HashSet};
use tidemark_core::PackageKey;
use time::OffsetDateTime;

/// A completed upload providing a package.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct ProviderRow {
    pub upload_id: i64,
    pub repository_id: i64,
    pub indexer: String,
    pub root: String,
    pub scheme: String,
    pub manager: String,
    pub name: String,
    pub version: String,
    pub committed_at: Option<OffsetDateTime>,
}

impl ProviderRow {
    fn key(&self) -> PackageKey {
        PackageKey::new(&self.scheme, &self.manager, &self.name, &self.version)
    }
}

/// A live upload referencing a package.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct ReferenceRow {
    pub upload_id: i64,
    pub scheme: String,
    pub manager: String,
    pub name: String,
    pub version: String,
}

impl ReferenceRow {
    fn key(&self) -> PackageKey {
        PackageKey::new(&self.scheme, &self.manager, &self.name, &self.version)
    }
}

/// An upload reached while scanning.
///
/// `expired` is only set for completed uploads; a referrer in any other
/// live state counts as protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRow)]
pub(crate) struct Node {
    pub id: i64,
    pub repository_id: i64,
    pub expired: bool,
}

/// Package lookups the reclaimers need, answered inside one transaction.
#[async_trait]
pub(crate) trait ReclaimSource: Send {
    /// Every completed provider of any package provided by `upload_ids`.
    async fn providers(&mut self, upload_ids: &[i64]) -> MetadataResult<Vec<ProviderRow>>;

    /// Non-deleted uploads referencing any of `packages`.
    async fn references(&mut self, packages: &[PackageKey]) -> MetadataResult<Vec<ReferenceRow>>;

    /// Expired completed uploads in traversal order, least recently
    /// scanned first.
    async fn traversal_candidates(&mut self, offset: u64, limit: u32)
    -> MetadataResult<Vec<Node>>;

    /// Up to `limit` non-deleted uploads referencing any of `packages`,
    /// excluding `exclude`, ordered by id.
    async fn dependents(
        &mut self,
        packages: &[PackageKey],
        exclude: &[i64],
        limit: u32,
    ) -> MetadataResult<Vec<Node>>;
}

/// Packages each upload is the canonical provider of.
pub(crate) fn canonical_packages(providers: &[ProviderRow]) -> HashMap<i64, Vec<PackageKey>> {
    let mut groups: HashMap<(PackageKey, i64, &str, &str), Vec<&ProviderRow>> = HashMap::new();
    for row in providers {
        groups
            .entry((row.key(), row.repository_id, row.indexer.as_str(), row.root.as_str()))
            .or_default()
            .push(row);
    }

    let mut canonical: HashMap<i64, Vec<PackageKey>> = HashMap::new();
    for ((key, ..), mut rows) in groups {
        rows.sort_by_key(|r| (r.committed_at.is_none(), r.committed_at, r.upload_id));
        if let Some(first) = rows.first() {
            canonical.entry(first.upload_id).or_default().push(key);
        }
    }
    for packages in canonical.values_mut() {
        packages.sort();
        packages.dedup();
    }
    canonical
}

/// Canonical packages of `ids`, merged and sorted.
fn packages_of(canonical: &HashMap<i64, Vec<PackageKey>>, ids: &[i64]) -> Vec<PackageKey> {
    let set: BTreeSet<&PackageKey> = ids
        .iter()
        .filter_map(|id| canonical.get(id))
        .flatten()
        .collect();
    set.into_iter().cloned().collect()
}

/// Uploads among `candidates` whose canonical packages another upload references.
async fn externally_referenced<S: ReclaimSource>(
    source: &mut S,
    candidates: &[i64],
) -> MetadataResult<HashSet<i64>> {
    let canonical = canonical_packages(&source.providers(candidates).await?);
    let packages = packages_of(&canonical, candidates);
    if packages.is_empty() {
        return Ok(HashSet::new());
    }

    let mut referrers: HashMap<PackageKey, Vec<i64>> = HashMap::new();
    for row in source.references(&packages).await? {
        referrers.entry(row.key()).or_default().push(row.upload_id);
    }

    let referenced = candidates
        .iter()
        .copied()
        .filter(|id| {
            canonical.get(id).into_iter().flatten().any(|key| {
                referrers
                    .get(key)
                    .is_some_and(|ids| ids.iter().any(|referrer| referrer != id))
            })
        })
        .collect();
    Ok(referenced)
}

/// Candidates that can be deleted without breaking a dependent.
pub(crate) async fn unreferenced<S: ReclaimSource>(
    source: &mut S,
    candidates: &[i64],
) -> MetadataResult<Vec<i64>> {
    let referenced = externally_referenced(source, candidates).await?;
    Ok(candidates
        .iter()
        .copied()
        .filter(|id| !referenced.contains(id))
        .collect())
}

/// Outcome of looking for a traversal root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RootSearch {
    pub root: Option<Node>,
    /// Candidates examined and rejected before the root was found.
    pub rejected: Vec<i64>,
}

/// First candidate, in traversal order, that some other upload depends on.
///
/// Candidates are read `page_size` at a time until a root turns up or they
/// run out. Candidates nobody depends on are left to the reference-count
/// pass.
pub(crate) async fn find_root<S: ReclaimSource>(
    source: &mut S,
    page_size: u32,
) -> MetadataResult<RootSearch> {
    let page_size = page_size.max(1);
    let mut rejected = Vec::new();
    let mut offset = 0u64;

    loop {
        let page = source.traversal_candidates(offset, page_size).await?;
        let ids: Vec<i64> = page.iter().map(|n| n.id).collect();
        let referenced = externally_referenced(source, &ids).await?;

        for node in &page {
            if referenced.contains(&node.id) {
                return Ok(RootSearch {
                    root: Some(*node),
                    rejected,
                });
            }
            rejected.push(node.id);
        }

        if page.len() < page_size as usize {
            return Ok(RootSearch {
                root: None,
                rejected,
            });
        }
        offset += page.len() as u64;
    }
}

/// The uploads reachable from a root over dependency edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Component {
    /// Visited upload ids, ascending.
    pub visited: Vec<i64>,
    pub repositories: Vec<i64>,
    /// The whole component fit within the limit.
    pub complete: bool,
    /// No visited upload is still protected.
    pub all_expired: bool,
}

impl Component {
    pub fn deletable(&self) -> bool {
        self.complete && self.all_expired
    }
}

/// Breadth-first walk from `root` to the uploads depending on it.
///
/// Stops at the first live dependent, or once more than `traversal_limit`
/// uploads have been visited. A limit of zero never sees a complete
/// component.
pub(crate) async fn explore<S: ReclaimSource>(
    source: &mut S,
    root: Node,
    traversal_limit: u32,
) -> MetadataResult<Component> {
    let limit = traversal_limit as usize;
    let mut visited: BTreeSet<i64> = BTreeSet::from([root.id]);
    let mut repositories: BTreeSet<i64> = BTreeSet::from([root.repository_id]);
    let mut all_expired = root.expired;
    let mut complete = visited.len() <= limit;
    let mut frontier = vec![root.id];

    while complete && all_expired && !frontier.is_empty() {
        let canonical = canonical_packages(&source.providers(&frontier).await?);
        let packages = packages_of(&canonical, &frontier);
        if packages.is_empty() {
            break;
        }

        let exclude: Vec<i64> = visited.iter().copied().collect();
        let budget = (limit + 1).saturating_sub(visited.len()) as u32;
        let dependents = source.dependents(&packages, &exclude, budget).await?;

        let mut next = Vec::with_capacity(dependents.len());
        for node in dependents {
            if !visited.insert(node.id) {
                continue;
            }
            repositories.insert(node.repository_id);
            if node.expired {
                next.push(node.id);
            } else {
                all_expired = false;
            }
        }

        if visited.len() > limit {
            complete = false;
            break;
        }
        frontier = next;
    }

    tracing::debug!(
        root = root.id,
        visited = visited.len(),
        complete,
        all_expired,
        "explored upload dependency component"
    );

    Ok(Component {
        visited: visited.into_iter().collect(),
        repositories: repositories.into_iter().collect(),
        complete,
        all_expired,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    /// In-memory upload table: (id, repository, expired, provides, references).
    #[derive(Default)]
    struct Fixture {
        uploads: Vec<(i64, i64, bool, Vec<&'static str>, Vec<&'static str>)>,
        dates: HashMap<i64, OffsetDateTime>,
    }

    fn pkg(name: &str) -> PackageKey {
        PackageKey::new("scip-go", "gomod", name, "v1")
    }

    #[async_trait]
    impl ReclaimSource for Fixture {
        async fn traversal_candidates(
            &mut self,
            offset: u64,
            limit: u32,
        ) -> MetadataResult<Vec<Node>> {
            Ok(self
                .uploads
                .iter()
                .filter(|u| u.2)
                .skip(offset as usize)
                .take(limit as usize)
                .map(|u| Node {
                    id: u.0,
                    repository_id: u.1,
                    expired: u.2,
                })
                .collect())
        }

        async fn providers(&mut self, upload_ids: &[i64]) -> MetadataResult<Vec<ProviderRow>> {
            let wanted: HashSet<&str> = self
                .uploads
                .iter()
                .filter(|u| upload_ids.contains(&u.0))
                .flat_map(|u| u.3.iter().copied())
                .collect();
            let mut rows = Vec::new();
            for (id, repository_id, _, provides, _) in &self.uploads {
                for name in provides.iter().filter(|n| wanted.contains(*n)) {
                    rows.push(ProviderRow {
                        upload_id: *id,
                        repository_id: *repository_id,
                        indexer: "scip-go".to_string(),
                        root: String::new(),
                        scheme: "scip-go".to_string(),
                        manager: "gomod".to_string(),
                        name: name.to_string(),
                        version: "v1".to_string(),
                        committed_at: self.dates.get(id).copied(),
                    });
                }
            }
            Ok(rows)
        }

        async fn references(
            &mut self,
            packages: &[PackageKey],
        ) -> MetadataResult<Vec<ReferenceRow>> {
            let mut rows = Vec::new();
            for (id, _, _, _, references) in &self.uploads {
                for name in references {
                    if packages.contains(&pkg(name)) {
                        rows.push(ReferenceRow {
                            upload_id: *id,
                            scheme: "scip-go".to_string(),
                            manager: "gomod".to_string(),
                            name: name.to_string(),
                            version: "v1".to_string(),
                        });
                    }
                }
            }
            Ok(rows)
        }

        async fn dependents(
            &mut self,
            packages: &[PackageKey],
            exclude: &[i64],
            limit: u32,
        ) -> MetadataResult<Vec<Node>> {
            let mut nodes: Vec<Node> = self
                .uploads
                .iter()
                .filter(|u| !exclude.contains(&u.0))
                .filter(|u| u.4.iter().any(|name| packages.contains(&pkg(name))))
                .map(|u| Node {
                    id: u.0,
                    repository_id: u.1,
                    expired: u.2,
                })
                .collect();
            nodes.sort_by_key(|n| n.id);
            nodes.truncate(limit as usize);
            Ok(nodes)
        }
    }

    fn node(fixture: &Fixture, id: i64) -> Node {
        let u = fixture.uploads.iter().find(|u| u.0 == id).unwrap();
        Node {
            id,
            repository_id: u.1,
            expired: u.2,
        }
    }

    #[test]
    fn test_canonical_provider_is_oldest_commit() {
        let row = |upload_id, committed_at| ProviderRow {
            upload_id,
            repository_id: 1,
            indexer: "scip-go".to_string(),
            root: String::new(),
            scheme: "scip-go".to_string(),
            manager: "gomod".to_string(),
            name: "fmt".to_string(),
            version: "v1".to_string(),
            committed_at,
        };
        let rows = vec![
            row(1, None),
            row(2, Some(datetime!(2024-02-01 00:00 UTC))),
            row(3, Some(datetime!(2024-01-01 00:00 UTC))),
            row(4, Some(datetime!(2024-01-01 00:00 UTC))),
        ];
        let canonical = canonical_packages(&rows);
        assert_eq!(canonical.len(), 1);
        assert_eq!(canonical[&3], vec![pkg("fmt")]);

        let undated = canonical_packages(&[row(9, None), row(8, None)]);
        assert!(undated.contains_key(&8));
    }

    #[tokio::test]
    async fn test_unreferenced_ignores_self_and_non_canonical() {
        let mut fixture = Fixture {
            uploads: vec![
                (1, 1, true, vec!["a"], vec!["a"]),
                (2, 1, true, vec!["b"], vec![]),
                (3, 1, true, vec!["b"], vec![]),
                (4, 2, false, vec![], vec!["b"]),
            ],
            dates: HashMap::new(),
        };
        let safe = unreferenced(&mut fixture, &[1, 2, 3]).await.unwrap();
        // 2 is the canonical provider of b, which 4 references
        assert_eq!(safe, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_explore_expired_chain_is_deletable() {
        let mut fixture = Fixture {
            uploads: vec![
                (1, 1, true, vec!["a"], vec![]),
                (2, 2, true, vec!["b"], vec!["a"]),
                (3, 3, true, vec![], vec!["b"]),
            ],
            dates: HashMap::new(),
        };
        let root = find_root(&mut fixture, 100).await.unwrap();
        assert_eq!(root.root, Some(node(&fixture, 1)));
        assert!(root.rejected.is_empty());

        let start = node(&fixture, 1);
        let component = explore(&mut fixture, start, 10).await.unwrap();
        assert_eq!(component.visited, vec![1, 2, 3]);
        assert_eq!(component.repositories, vec![1, 2, 3]);
        assert!(component.deletable());
    }

    #[tokio::test]
    async fn test_explore_stops_at_unexpired_dependent() {
        let mut fixture = Fixture {
            uploads: vec![
                (1, 1, true, vec!["a"], vec![]),
                (2, 1, true, vec!["b"], vec!["a"]),
                (3, 1, false, vec![], vec!["b"]),
            ],
            dates: HashMap::new(),
        };
        let start = node(&fixture, 1);
        let component = explore(&mut fixture, start, 10).await.unwrap();
        assert!(component.complete);
        assert!(!component.all_expired);
        assert!(!component.deletable());
    }

    #[tokio::test]
    async fn test_explore_reports_incomplete_past_limit() {
        let mut fixture = Fixture {
            uploads: vec![
                (1, 1, true, vec!["a"], vec![]),
                (2, 1, true, vec![], vec!["a"]),
                (3, 1, true, vec![], vec!["a"]),
                (4, 1, true, vec![], vec!["a"]),
            ],
            dates: HashMap::new(),
        };
        let start = node(&fixture, 1);
        let component = explore(&mut fixture, start, 3).await.unwrap();
        assert!(!component.complete);
        assert!(!component.deletable());

        let start = node(&fixture, 1);
        let component = explore(&mut fixture, start, 4).await.unwrap();
        assert!(component.deletable());
        assert_eq!(component.visited, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_explore_with_zero_limit_is_incomplete() {
        let mut fixture = Fixture {
            uploads: vec![(1, 1, true, vec!["a"], vec![]), (2, 1, true, vec![], vec!["a"])],
            dates: HashMap::new(),
        };
        let start = node(&fixture, 1);
        let component = explore(&mut fixture, start, 0).await.unwrap();
        assert_eq!(component.visited, vec![1]);
        assert!(!component.complete);
        assert!(!component.deletable());
    }

    #[tokio::test]
    async fn test_find_root_rejects_unreferenced_page() {
        let mut fixture = Fixture {
            uploads: vec![(1, 1, true, vec!["a"], vec![]), (2, 1, true, vec![], vec![])],
            dates: HashMap::new(),
        };
        let search = find_root(&mut fixture, 100).await.unwrap();
        assert_eq!(search.root, None);
        assert_eq!(search.rejected, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_find_root_pages_past_unreferenced_candidates() {
        let mut fixture = Fixture {
            uploads: vec![
                (1, 1, true, vec!["a"], vec![]),
                (2, 1, true, vec![], vec![]),
                (3, 1, true, vec!["c"], vec![]),
                (4, 2, false, vec![], vec!["c"]),
            ],
            dates: HashMap::new(),
        };
        let search = find_root(&mut fixture, 1).await.unwrap();
        assert_eq!(search.root, Some(node(&fixture, 3)));
        assert_eq!(search.rejected, vec![1, 2]);
    }
}

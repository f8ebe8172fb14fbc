//! Test fixtures for generating test data.
//!
//! Note: items carry #[allow(dead_code)] because each test file compiles common/ separately.

use std::collections::HashMap;
use tidemark_core::{CommitGraph, IndexState, PackageKey, RefDescription, RefType, UploadState};
use tidemark_metadata::MetadataStore;
use tidemark_metadata::models::{NewIndex, NewUpload};
use tidemark_metadata::repos::UploadRepo;
use time::{Duration, OffsetDateTime};

/// Default indexer used by fixtures.
#[allow(dead_code)]
pub const INDEXER: &str = "scip-go";

/// A 40-character commit hash derived from `n`.
#[allow(dead_code)]
pub fn commit(n: u32) -> String {
    format!("{n:040x}")
}

/// Current time truncated to whole seconds, so it survives every backend unchanged.
#[allow(dead_code)]
pub fn now_secs() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(0).unwrap_or(now)
}

/// Build a commit graph from `(commit, parents)` pairs.
#[allow(dead_code)]
pub fn graph(edges: &[(&str, &[&str])]) -> CommitGraph {
    let parents: HashMap<String, Vec<String>> = edges
        .iter()
        .map(|(c, ps)| (c.to_string(), ps.iter().map(|p| p.to_string()).collect()))
        .collect();
    CommitGraph::new(parents).expect("fixture graph is acyclic")
}

/// A linear history `commits[0] <- commits[1] <- ...`.
#[allow(dead_code)]
pub fn linear_graph(commits: &[String]) -> CommitGraph {
    let mut parents: HashMap<String, Vec<String>> = HashMap::new();
    for (i, c) in commits.iter().enumerate() {
        let ps = if i == 0 {
            Vec::new()
        } else {
            vec![commits[i - 1].clone()]
        };
        parents.insert(c.clone(), ps);
    }
    CommitGraph::new(parents).expect("linear graph is acyclic")
}

#[allow(dead_code)]
pub fn branch(
    name: &str,
    is_default_branch: bool,
    created_date: Option<OffsetDateTime>,
) -> RefDescription {
    RefDescription {
        name: name.to_string(),
        ref_type: RefType::Branch,
        is_default_branch,
        created_date,
    }
}

#[allow(dead_code)]
pub fn tag(name: &str, created_date: Option<OffsetDateTime>) -> RefDescription {
    RefDescription {
        name: name.to_string(),
        ref_type: RefType::Tag,
        is_default_branch: false,
        created_date,
    }
}

/// A Go package identity.
#[allow(dead_code)]
pub fn package(name: &str) -> PackageKey {
    PackageKey::new("scip-go", "gomod", name, "v1.0.0")
}

/// Insert an upload in the given state at `commit`.
#[allow(dead_code)]
pub async fn insert_upload_in_state(
    store: &dyn MetadataStore,
    repository_id: i64,
    commit_sha: &str,
    root: &str,
    state: UploadState,
    uploaded_at: OffsetDateTime,
) -> i64 {
    let finished_at = matches!(state, UploadState::Completed | UploadState::Failed)
        .then_some(uploaded_at);
    store
        .insert_upload(&NewUpload {
            repository_id,
            commit_sha: commit_sha.to_string(),
            root: root.to_string(),
            indexer: INDEXER.to_string(),
            state,
            uploaded_at,
            finished_at,
        })
        .await
        .expect("Failed to insert upload")
}

/// Insert a completed upload at `commit` with the default indexer.
#[allow(dead_code)]
pub async fn insert_completed(
    store: &dyn MetadataStore,
    repository_id: i64,
    commit_sha: &str,
    root: &str,
) -> i64 {
    insert_upload_in_state(
        store,
        repository_id,
        commit_sha,
        root,
        UploadState::Completed,
        now_secs() - Duration::hours(1),
    )
    .await
}

/// Insert an index record in `state` queued at `queued_at`.
#[allow(dead_code)]
pub async fn insert_index(
    store: &dyn MetadataStore,
    repository_id: i64,
    root: &str,
    state: IndexState,
    queued_at: OffsetDateTime,
) -> i64 {
    let finished_at =
        matches!(state, IndexState::Completed | IndexState::Failed).then_some(queued_at);
    store
        .insert_index(&NewIndex {
            repository_id,
            commit_sha: commit(1),
            root: root.to_string(),
            indexer: INDEXER.to_string(),
            state,
            queued_at,
            finished_at,
            failure_message: matches!(state, IndexState::Failed).then(|| "exit 1".to_string()),
        })
        .await
        .expect("Failed to insert index")
}

/// Current state of an upload.
#[allow(dead_code)]
pub async fn state_of(store: &dyn MetadataStore, id: i64) -> String {
    store
        .get_upload(id)
        .await
        .expect("Failed to get upload")
        .expect("upload exists")
        .state
}

//! Nearest-upload graph builder.
//!
//! Given a commit DAG and the commits that carry uploads, computes for every
//! commit the set of uploads visible from it: for each visibility token, the
//! upload reachable over the fewest parent edges (lower upload id on ties).
//!
//! Only commits that carry uploads, root commits and merge commits get an
//! explicit set. A single-parent commit without uploads can only see what its
//! parent sees, so it is stored as a link to the nearest explicit ancestor
//! plus the number of edges in between.

use crate::commit_graph::CommitGraph;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An upload visible from some commit, `distance` parent edges away.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadMeta {
    pub upload_id: i64,
    pub distance: u32,
}

impl UploadMeta {
    fn shifted(self, by: u32) -> Self {
        Self {
            upload_id: self.upload_id,
            distance: self.distance.saturating_add(by),
        }
    }

    fn beats(&self, other: &UploadMeta) -> bool {
        (self.distance, self.upload_id) < (other.distance, other.upload_id)
    }
}

/// Seed data for the builder: which uploads live at which commit.
#[derive(Clone, Debug, Default)]
pub struct CommitGraphView {
    meta: HashMap<String, Vec<UploadMeta>>,
    tokens: HashMap<i64, String>,
}

impl CommitGraphView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an upload at `commit` competing under `token`.
    pub fn add(&mut self, meta: UploadMeta, commit: &str, token: &str) {
        self.meta.entry(commit.to_string()).or_default().push(meta);
        self.tokens.insert(meta.upload_id, token.to_string());
    }

    /// Number of registered uploads.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Uploads visible from a commit that has its own entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NearestUploadsRow {
    pub commit: String,
    /// Sorted by upload id.
    pub uploads: Vec<UploadMeta>,
}

/// A commit that sees exactly what `ancestor_commit` sees, `distance` edges further.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkRow {
    pub commit: String,
    pub ancestor_commit: String,
    pub distance: u32,
}

/// One item of [`Graph::stream`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Envelope {
    Uploads(NearestUploadsRow),
    Links(LinkRow),
}

/// Resolved nearest-upload mapping of one repository.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    order: Vec<String>,
    explicit: HashMap<String, Vec<UploadMeta>>,
    links: HashMap<String, (String, u32)>,
}

impl Graph {
    /// Resolve the visible uploads of every commit in `commit_graph`.
    ///
    /// Uploads registered at commits outside the graph are ignored.
    pub fn new(commit_graph: &CommitGraph, view: &CommitGraphView) -> Self {
        let mut sets: HashMap<&str, HashMap<&str, UploadMeta>> = HashMap::new();
        let mut links: HashMap<String, (String, u32)> = HashMap::new();

        for commit in commit_graph.order() {
            let own = view.meta.get(commit).filter(|m| !m.is_empty());
            let parents = commit_graph.parents(commit);

            if own.is_none() && parents.len() == 1 {
                let parent = &parents[0];
                let link = match links.get(parent) {
                    Some((anchor, offset)) => (anchor.clone(), offset + 1),
                    None => (parent.clone(), 1),
                };
                links.insert(commit.clone(), link);
                continue;
            }

            let mut set: HashMap<&str, UploadMeta> = HashMap::new();
            for parent in parents {
                let (anchor, offset) = match links.get(parent) {
                    Some((anchor, offset)) => (anchor.as_str(), *offset),
                    None => (parent.as_str(), 0),
                };
                let Some(inherited) = sets.get(anchor) else {
                    continue;
                };
                for (token, meta) in inherited {
                    merge(&mut set, *token, meta.shifted(offset + 1));
                }
            }
            for meta in own.into_iter().flatten() {
                if let Some(token) = view.tokens.get(&meta.upload_id) {
                    merge(&mut set, token, *meta);
                }
            }
            sets.insert(commit.as_str(), set);
        }

        let explicit = sets
            .into_iter()
            .map(|(commit, set)| {
                let mut uploads: Vec<UploadMeta> = set.into_values().collect();
                uploads.sort_by_key(|m| m.upload_id);
                (commit.to_string(), uploads)
            })
            .collect();

        Self {
            order: commit_graph.order().to_vec(),
            explicit,
            links,
        }
    }

    /// Emit the compressed mapping in parents-first order.
    ///
    /// Commits that see no uploads produce nothing.
    pub fn stream(&self) -> impl Iterator<Item = Envelope> + '_ {
        self.order.iter().filter_map(move |commit| {
            if let Some(uploads) = self.explicit.get(commit) {
                return (!uploads.is_empty()).then(|| {
                    Envelope::Uploads(NearestUploadsRow {
                        commit: commit.clone(),
                        uploads: uploads.clone(),
                    })
                });
            }
            let (ancestor, distance) = self.links.get(commit)?;
            let visible = self.explicit.get(ancestor).is_some_and(|u| !u.is_empty());
            visible.then(|| {
                Envelope::Links(LinkRow {
                    commit: commit.clone(),
                    ancestor_commit: ancestor.clone(),
                    distance: *distance,
                })
            })
        })
    }

    /// Uploads visible from `commit`, sorted by upload id.
    pub fn uploads_visible_at_commit(&self, commit: &str) -> Vec<UploadMeta> {
        if let Some(uploads) = self.explicit.get(commit) {
            return uploads.clone();
        }
        match self.links.get(commit) {
            Some((ancestor, distance)) => self
                .explicit
                .get(ancestor)
                .map(|uploads| uploads.iter().map(|m| m.shifted(*distance)).collect())
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

fn merge<'a>(set: &mut HashMap<&'a str, UploadMeta>, token: &'a str, candidate: UploadMeta) {
    set.entry(token)
        .and_modify(|current| {
            if candidate.beats(current) {
                *current = candidate;
            }
        })
        .or_insert(candidate);
}

//! Commit DAG and ref descriptions.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use time::{Duration, OffsetDateTime};

/// A repository's commit DAG.
///
/// Parent lists only contain commits that are themselves part of the graph,
/// and `order()` lists every commit after all of its parents.
#[derive(Clone, Debug, Default)]
pub struct CommitGraph {
    parents: HashMap<String, Vec<String>>,
    order: Vec<String>,
}

impl CommitGraph {
    /// Build a graph from a commit -> parents map.
    ///
    /// Parents that are not keys of the map are dropped. Fails if the
    /// edges contain a cycle.
    pub fn new(parents: HashMap<String, Vec<String>>) -> crate::Result<Self> {
        let known: HashMap<String, Vec<String>> = parents
            .iter()
            .map(|(commit, ps)| {
                let mut filtered: Vec<String> = Vec::with_capacity(ps.len());
                for parent in ps {
                    if parents.contains_key(parent) && !filtered.contains(parent) {
                        filtered.push(parent.clone());
                    }
                }
                (commit.clone(), filtered)
            })
            .collect();

        let order = topological_order(&known)?;
        Ok(Self {
            parents: known,
            order,
        })
    }

    /// Parse `git log --pretty='%H %P'` output, one commit per line.
    pub fn parse(output: &str) -> crate::Result<Self> {
        let mut parents: HashMap<String, Vec<String>> = HashMap::new();
        for (lineno, line) in output.lines().enumerate() {
            let mut fields = line.split_whitespace();
            let Some(commit) = fields.next() else {
                continue;
            };
            if !commit.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(crate::Error::InvalidCommitGraph(format!(
                    "line {}: '{commit}' is not a commit hash",
                    lineno + 1
                )));
            }
            parents
                .entry(commit.to_string())
                .or_default()
                .extend(fields.map(str::to_string));
        }
        Self::new(parents)
    }

    /// Parents of `commit` that are part of the graph.
    pub fn parents(&self, commit: &str) -> &[String] {
        self.parents.get(commit).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Commits in parents-first order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn contains(&self, commit: &str) -> bool {
        self.parents.contains_key(commit)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Kahn's algorithm, breaking ties by commit hash so the order is stable.
fn topological_order(parents: &HashMap<String, Vec<String>>) -> crate::Result<Vec<String>> {
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut pending: HashMap<&str, usize> = HashMap::with_capacity(parents.len());
    for (commit, ps) in parents {
        pending.insert(commit.as_str(), ps.len());
        for parent in ps {
            children
                .entry(parent.as_str())
                .or_default()
                .push(commit.as_str());
        }
    }

    let mut ready: BTreeSet<&str> = pending
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(commit, _)| *commit)
        .collect();
    let mut order = Vec::with_capacity(parents.len());

    while let Some(commit) = ready.pop_first() {
        order.push(commit.to_string());
        for child in children.get(commit).into_iter().flatten() {
            if let Some(n) = pending.get_mut(child) {
                *n -= 1;
                if *n == 0 {
                    ready.insert(child);
                }
            }
        }
    }

    if order.len() != parents.len() {
        return Err(crate::Error::InvalidCommitGraph(format!(
            "cycle detected: {} of {} commits unordered",
            parents.len() - order.len(),
            parents.len()
        )));
    }
    Ok(order)
}

/// Kind of git ref.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefType {
    Branch,
    Tag,
}

/// A branch or tag pointing at a commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefDescription {
    pub name: String,
    pub ref_type: RefType,
    pub is_default_branch: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_date: Option<OffsetDateTime>,
}

impl RefDescription {
    /// Whether uploads visible from this ref should be protected at `now`.
    ///
    /// The default branch always qualifies. Other refs qualify while their
    /// creation date is within the max age of their type; refs without a
    /// creation date never do.
    pub fn is_retained(
        &self,
        now: OffsetDateTime,
        max_age_for_branches: Duration,
        max_age_for_tags: Duration,
    ) -> bool {
        if self.is_default_branch {
            return true;
        }
        let max_age = match self.ref_type {
            RefType::Branch => max_age_for_branches,
            RefType::Tag => max_age_for_tags,
        };
        match self.created_date {
            Some(created) => now - created <= max_age,
            None => false,
        }
    }
}

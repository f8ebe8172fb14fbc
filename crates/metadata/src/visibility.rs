//! Staging pipeline for visibility syncs.
//!
//! The graph builder runs on a blocking thread and streams its rows over
//! three bounded channels. The async side drains them in batches into a
//! [`StagingSink`], which each backend implements over its open transaction.

use crate::error::{MetadataError, MetadataResult};
use async_trait::async_trait;
use sqlx::FromRow;
use std::collections::HashMap;
use tidemark_core::config::VisibilityConfig;
use tidemark_core::{
    CommitGraph, CommitGraphView, Envelope, Graph, LinkRow, NearestUploadsRow, RefDescription,
    UploadMeta, upload_token,
};
use time::{Duration, OffsetDateTime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Batching and backpressure knobs for the staging pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingOptions {
    /// Rows per staging insert statement.
    pub batch_size: usize,
    /// Capacity of each producer channel.
    pub channel_capacity: usize,
}

impl Default for StagingOptions {
    fn default() -> Self {
        Self::from(&VisibilityConfig::default())
    }
}

impl From<&VisibilityConfig> for StagingOptions {
    fn from(config: &VisibilityConfig) -> Self {
        Self {
            batch_size: config.staging_batch_size.max(1),
            channel_capacity: config.channel_capacity.max(1),
        }
    }
}

/// A completed upload that seeds the builder.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct SeedUpload {
    pub id: i64,
    pub commit_sha: String,
    pub root: String,
    pub indexer: String,
}

pub(crate) fn seed_view(uploads: &[SeedUpload]) -> CommitGraphView {
    let mut view = CommitGraphView::new();
    for upload in uploads {
        let token = upload_token(&upload.root, &upload.indexer);
        view.add(
            UploadMeta {
                upload_id: upload.id,
                distance: 0,
            },
            &upload.commit_sha,
            &token,
        );
    }
    view
}

/// Which refs protect the uploads visible from their tip.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RefPolicy {
    pub now: OffsetDateTime,
    pub max_age_for_branches: Duration,
    pub max_age_for_tags: Duration,
}

/// A per-repository max-age override in seconds, or `default`.
pub(crate) fn window(override_secs: Option<i64>, default: Duration) -> Duration {
    override_secs
        .filter(|secs| *secs >= 0)
        .map(Duration::seconds)
        .unwrap_or(default)
}

/// An upload visible from the tip of one or more retained refs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TipRow {
    pub upload_id: i64,
    pub branch_or_tag_name: String,
    pub is_default_branch: bool,
}

/// Rows written to each staging table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct StagedCounts {
    pub nearest_uploads: u64,
    pub links: u64,
    pub visible_at_tip: u64,
}

/// Destination of staged rows, usually temp tables inside a transaction.
#[async_trait]
pub(crate) trait StagingSink: Send {
    async fn stage_nearest_uploads(&mut self, rows: &[NearestUploadsRow]) -> MetadataResult<()>;
    async fn stage_links(&mut self, rows: &[LinkRow]) -> MetadataResult<()>;
    async fn stage_visible_at_tip(&mut self, rows: &[TipRow]) -> MetadataResult<()>;
}

struct Senders {
    uploads: mpsc::Sender<NearestUploadsRow>,
    links: mpsc::Sender<LinkRow>,
    tips: mpsc::Sender<TipRow>,
}

/// Build the graph and write every row it produces into `sink`.
pub(crate) async fn stage<S: StagingSink>(
    sink: &mut S,
    commit_graph: &CommitGraph,
    view: CommitGraphView,
    ref_descriptions: &HashMap<String, Vec<RefDescription>>,
    policy: RefPolicy,
    options: StagingOptions,
) -> MetadataResult<StagedCounts> {
    let batch_size = options.batch_size.max(1);
    let capacity = options.channel_capacity.max(1);

    let (uploads_tx, mut uploads_rx) = mpsc::channel(capacity);
    let (links_tx, mut links_rx) = mpsc::channel(capacity);
    let (tips_tx, mut tips_rx) = mpsc::channel(capacity);
    let senders = Senders {
        uploads: uploads_tx,
        links: links_tx,
        tips: tips_tx,
    };

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let commit_graph = commit_graph.clone();
    let ref_descriptions = ref_descriptions.clone();
    let producer = tokio::task::spawn_blocking(move || {
        produce(&commit_graph, &view, &ref_descriptions, policy, senders, &cancel)
    });

    let mut counts = StagedCounts::default();
    let mut uploads_buf: Vec<NearestUploadsRow> = Vec::with_capacity(batch_size);
    let mut links_buf: Vec<LinkRow> = Vec::with_capacity(batch_size);
    let mut tips_buf: Vec<TipRow> = Vec::with_capacity(batch_size);
    let (mut uploads_open, mut links_open, mut tips_open) = (true, true, true);

    while uploads_open || links_open || tips_open {
        tokio::select! {
            row = uploads_rx.recv(), if uploads_open => match row {
                Some(row) => {
                    uploads_buf.push(row);
                    if uploads_buf.len() >= batch_size {
                        sink.stage_nearest_uploads(&uploads_buf).await?;
                        counts.nearest_uploads += uploads_buf.len() as u64;
                        uploads_buf.clear();
                    }
                }
                None => uploads_open = false,
            },
            row = links_rx.recv(), if links_open => match row {
                Some(row) => {
                    links_buf.push(row);
                    if links_buf.len() >= batch_size {
                        sink.stage_links(&links_buf).await?;
                        counts.links += links_buf.len() as u64;
                        links_buf.clear();
                    }
                }
                None => links_open = false,
            },
            row = tips_rx.recv(), if tips_open => match row {
                Some(row) => {
                    tips_buf.push(row);
                    if tips_buf.len() >= batch_size {
                        sink.stage_visible_at_tip(&tips_buf).await?;
                        counts.visible_at_tip += tips_buf.len() as u64;
                        tips_buf.clear();
                    }
                }
                None => tips_open = false,
            },
        }
    }

    if !uploads_buf.is_empty() {
        sink.stage_nearest_uploads(&uploads_buf).await?;
        counts.nearest_uploads += uploads_buf.len() as u64;
    }
    if !links_buf.is_empty() {
        sink.stage_links(&links_buf).await?;
        counts.links += links_buf.len() as u64;
    }
    if !tips_buf.is_empty() {
        sink.stage_visible_at_tip(&tips_buf).await?;
        counts.visible_at_tip += tips_buf.len() as u64;
    }

    producer.await.map_err(|e| {
        MetadataError::Cancelled(format!("visibility producer did not finish: {e}"))
    })?;
    guard.disarm();
    Ok(counts)
}

/// Runs on a blocking thread. Stops early once `cancel` fires or the
/// consumer hangs up.
fn produce(
    commit_graph: &CommitGraph,
    view: &CommitGraphView,
    ref_descriptions: &HashMap<String, Vec<RefDescription>>,
    policy: RefPolicy,
    senders: Senders,
    cancel: &CancellationToken,
) {
    let Senders {
        uploads,
        links,
        tips,
    } = senders;

    let graph = Graph::new(commit_graph, view);
    for envelope in graph.stream() {
        if cancel.is_cancelled() {
            return;
        }
        let sent = match envelope {
            Envelope::Uploads(row) => uploads.blocking_send(row).is_ok(),
            Envelope::Links(row) => links.blocking_send(row).is_ok(),
        };
        if !sent {
            return;
        }
    }
    drop(uploads);
    drop(links);

    let mut commits: Vec<&String> = ref_descriptions.keys().collect();
    commits.sort();
    for commit in commits {
        if cancel.is_cancelled() {
            return;
        }
        let retained: Vec<&RefDescription> = ref_descriptions[commit]
            .iter()
            .filter(|r| {
                r.is_retained(
                    policy.now,
                    policy.max_age_for_branches,
                    policy.max_age_for_tags,
                )
            })
            .collect();
        if retained.is_empty() {
            continue;
        }
        let mut names: Vec<&str> = retained.iter().map(|r| r.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        let branch_or_tag_name = names.join(",");
        let is_default_branch = retained.iter().any(|r| r.is_default_branch);

        for upload in graph.uploads_visible_at_commit(commit) {
            let row = TipRow {
                upload_id: upload.upload_id,
                branch_or_tag_name: branch_or_tag_name.clone(),
                is_default_branch,
            };
            if tips.blocking_send(row).is_err() {
                return;
            }
        }
    }
}

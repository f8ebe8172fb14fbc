//! Integration tests for the reference-count and traversal reclaimers.

mod common;

use common::*;
use std::collections::HashMap;
use tidemark_core::UploadState;
use tidemark_metadata::models::DirtyRepository;
use tidemark_metadata::repos::{DirtyRepo, ReclaimRepo, RetentionRepo, UploadRepo, VisibilityRepo};
use tidemark_metadata::{MetadataStore, ReclaimStats};
use time::Duration;

const REPO: i64 = 1;

async fn expire(store: &dyn MetadataStore, ids: &[i64]) {
    store
        .mark_retention(&[], ids, now_secs())
        .await
        .expect("Failed to mark uploads expired");
}

#[tokio::test]
async fn test_reference_count_deletes_only_unreferenced() {
    run_metadata_test_both(|store| async move {
        let a = insert_completed(store.as_ref(), REPO, &commit(1), "a/").await;
        let b = insert_completed(store.as_ref(), REPO, &commit(2), "b/").await;
        let c = insert_completed(store.as_ref(), REPO, &commit(3), "c/").await;
        store.insert_packages(a, &[package("p1")]).await.unwrap();
        store.insert_packages(b, &[package("p2")]).await.unwrap();
        store
            .insert_package_references(c, &[package("p2")])
            .await
            .unwrap();
        expire(store.as_ref(), &[a, b]).await;

        let stats = store.reclaim_by_reference_count(10).await.unwrap();
        assert_eq!(
            stats,
            ReclaimStats {
                scanned: 2,
                deleted: 1,
                incomplete: false
            }
        );
        assert_eq!(state_of(store.as_ref(), a).await, "deleting");
        assert_eq!(state_of(store.as_ref(), b).await, "completed");
        assert_eq!(state_of(store.as_ref(), c).await, "completed");

        // Both candidates were scanned, kept or not.
        for id in [a, b] {
            let upload = store.get_upload(id).await.unwrap().unwrap();
            assert!(upload.last_referenced_scan_at.is_some());
        }

        assert_eq!(
            store.get_dirty_repositories().await.unwrap(),
            vec![DirtyRepository {
                repository_id: REPO,
                dirty_token: 1
            }]
        );

        // The next visibility sync finalizes the soft delete.
        let commits: Vec<String> = (1..=3).map(commit).collect();
        let stats = store
            .sync_visibility(
                REPO,
                &linear_graph(&commits),
                &HashMap::new(),
                Duration::days(90),
                Duration::days(365),
                1,
                now_secs(),
            )
            .await
            .unwrap();
        assert_eq!(stats.finalized_deletions, 1);
        assert_eq!(state_of(store.as_ref(), a).await, "deleted");
    })
    .await;
}

#[tokio::test]
async fn test_reference_count_ignores_self_and_deleted_references() {
    run_metadata_test_both(|store| async move {
        let selfish = insert_completed(store.as_ref(), REPO, &commit(1), "a/").await;
        let provider = insert_completed(store.as_ref(), REPO, &commit(2), "b/").await;
        let gone = insert_upload_in_state(
            store.as_ref(),
            REPO,
            &commit(3),
            "c/",
            UploadState::Deleted,
            now_secs() - Duration::hours(2),
        )
        .await;
        store.insert_packages(selfish, &[package("p1")]).await.unwrap();
        store
            .insert_package_references(selfish, &[package("p1")])
            .await
            .unwrap();
        store.insert_packages(provider, &[package("p2")]).await.unwrap();
        store
            .insert_package_references(gone, &[package("p2")])
            .await
            .unwrap();
        expire(store.as_ref(), &[selfish, provider]).await;

        let stats = store.reclaim_by_reference_count(10).await.unwrap();
        assert_eq!(stats.deleted, 2);
        assert_eq!(state_of(store.as_ref(), selfish).await, "deleting");
        assert_eq!(state_of(store.as_ref(), provider).await, "deleting");
    })
    .await;
}

#[tokio::test]
async fn test_reference_count_protects_only_canonical_provider() {
    run_metadata_test_both(|store| async move {
        let first = insert_completed(store.as_ref(), REPO, &commit(1), "").await;
        let second = insert_completed(store.as_ref(), REPO, &commit(2), "").await;
        let user = insert_completed(store.as_ref(), 2, &commit(9), "").await;
        let now = now_secs();
        // The second upload was built from the older commit, so it wins despite its higher id.
        store
            .update_commit_date(REPO, &commit(1), now - Duration::days(10))
            .await
            .unwrap();
        store
            .update_commit_date(REPO, &commit(2), now - Duration::days(20))
            .await
            .unwrap();
        store.insert_packages(first, &[package("shared")]).await.unwrap();
        store.insert_packages(second, &[package("shared")]).await.unwrap();
        store
            .insert_package_references(user, &[package("shared")])
            .await
            .unwrap();
        expire(store.as_ref(), &[first, second]).await;

        let stats = store.reclaim_by_reference_count(10).await.unwrap();
        assert_eq!(stats.scanned, 2);
        assert_eq!(stats.deleted, 1);
        assert_eq!(state_of(store.as_ref(), second).await, "completed");
        assert_eq!(state_of(store.as_ref(), first).await, "deleting");
    })
    .await;
}

#[tokio::test]
async fn test_reference_count_unknown_dates_rank_last() {
    run_metadata_test_both(|store| async move {
        let undated = insert_completed(store.as_ref(), REPO, &commit(1), "").await;
        let dated = insert_completed(store.as_ref(), REPO, &commit(2), "").await;
        let user = insert_completed(store.as_ref(), 2, &commit(9), "").await;
        store
            .update_commit_date(REPO, &commit(2), now_secs() - Duration::days(3))
            .await
            .unwrap();
        for id in [undated, dated] {
            store.insert_packages(id, &[package("shared")]).await.unwrap();
        }
        store
            .insert_package_references(user, &[package("shared")])
            .await
            .unwrap();
        expire(store.as_ref(), &[undated, dated]).await;

        store.reclaim_by_reference_count(10).await.unwrap();
        assert_eq!(state_of(store.as_ref(), dated).await, "completed");
        assert_eq!(state_of(store.as_ref(), undated).await, "deleting");
    })
    .await;
}

#[tokio::test]
async fn test_reference_count_batches_least_recently_scanned_first() {
    run_metadata_test_both(|store| async move {
        let user = insert_completed(store.as_ref(), 2, &commit(9), "").await;
        let mut providers = Vec::new();
        for n in 1..=3 {
            let id = insert_completed(store.as_ref(), REPO, &commit(n), &format!("r{n}/")).await;
            store
                .insert_packages(id, &[package(&format!("p{n}"))])
                .await
                .unwrap();
            store
                .insert_package_references(user, &[package(&format!("p{n}"))])
                .await
                .unwrap();
            providers.push(id);
        }
        expire(store.as_ref(), &providers).await;

        let first = store.reclaim_by_reference_count(2).await.unwrap();
        assert_eq!(first.scanned, 2);
        assert_eq!(first.deleted, 0);
        let third = store.get_upload(providers[2]).await.unwrap().unwrap();
        assert!(third.last_referenced_scan_at.is_none());

        store.reclaim_by_reference_count(1).await.unwrap();
        let third = store.get_upload(providers[2]).await.unwrap().unwrap();
        assert!(third.last_referenced_scan_at.is_some());
    })
    .await;
}

#[tokio::test]
async fn test_reference_count_without_candidates_is_empty() {
    run_metadata_test_both(|store| async move {
        insert_completed(store.as_ref(), REPO, &commit(1), "").await;
        let stats = store.reclaim_by_reference_count(10).await.unwrap();
        assert_eq!(stats, ReclaimStats::default());
        assert!(store.get_dirty_repositories().await.unwrap().is_empty());
    })
    .await;
}

/// D provides `pd`, E references `pd` and provides `pe`, F references `pe`.
async fn expired_chain(store: &dyn MetadataStore) -> (i64, i64, i64) {
    let d = insert_completed(store, REPO, &commit(1), "d/").await;
    let e = insert_completed(store, REPO, &commit(2), "e/").await;
    let f = insert_completed(store, REPO, &commit(3), "f/").await;
    store.insert_packages(d, &[package("pd")]).await.unwrap();
    store
        .insert_package_references(e, &[package("pd")])
        .await
        .unwrap();
    store.insert_packages(e, &[package("pe")]).await.unwrap();
    store
        .insert_package_references(f, &[package("pe")])
        .await
        .unwrap();
    expire(store, &[d, e, f]).await;
    (d, e, f)
}

#[tokio::test]
async fn test_traversal_deletes_fully_expired_component() {
    run_metadata_test_both(|store| async move {
        let (d, e, f) = expired_chain(store.as_ref()).await;

        // Exceeding the limit leaves the component in place.
        let stats = store.reclaim_by_traversal(1).await.unwrap();
        assert_eq!(
            stats,
            ReclaimStats {
                scanned: 2,
                deleted: 0,
                incomplete: true
            }
        );
        for id in [d, e, f] {
            assert_eq!(state_of(store.as_ref(), id).await, "completed");
        }
        for id in [d, e] {
            let upload = store.get_upload(id).await.unwrap().unwrap();
            assert!(upload.last_traversal_scan_at.is_some());
        }

        // F is now the least recently scanned; nobody depends on it, so the
        // walk starts again from D and reaches the whole chain.
        let stats = store.reclaim_by_traversal(10).await.unwrap();
        assert_eq!(
            stats,
            ReclaimStats {
                scanned: 4,
                deleted: 3,
                incomplete: false
            }
        );
        for id in [d, e, f] {
            assert_eq!(state_of(store.as_ref(), id).await, "deleting");
        }
        assert_eq!(store.get_dirty_repositories().await.unwrap().len(), 1);
    })
    .await;
}

#[tokio::test]
async fn test_traversal_chain_within_limit_deletes_in_one_call() {
    run_metadata_test_both(|store| async move {
        let (d, e, f) = expired_chain(store.as_ref()).await;

        let stats = store.reclaim_by_traversal(10).await.unwrap();
        assert_eq!(
            stats,
            ReclaimStats {
                scanned: 3,
                deleted: 3,
                incomplete: false
            }
        );
        for id in [d, e, f] {
            assert_eq!(state_of(store.as_ref(), id).await, "deleting");
        }
    })
    .await;
}

#[tokio::test]
async fn test_traversal_keeps_component_with_live_dependent() {
    run_metadata_test_both(|store| async move {
        let d = insert_completed(store.as_ref(), REPO, &commit(1), "d/").await;
        let live = insert_completed(store.as_ref(), 2, &commit(2), "").await;
        store.insert_packages(d, &[package("pd")]).await.unwrap();
        store
            .insert_package_references(live, &[package("pd")])
            .await
            .unwrap();
        expire(store.as_ref(), &[d]).await;

        let stats = store.reclaim_by_traversal(10).await.unwrap();
        assert_eq!(
            stats,
            ReclaimStats {
                scanned: 2,
                deleted: 0,
                incomplete: false
            }
        );
        assert_eq!(state_of(store.as_ref(), d).await, "completed");
        assert!(store.get_dirty_repositories().await.unwrap().is_empty());
    })
    .await;
}

#[tokio::test]
async fn test_traversal_leaves_unreferenced_uploads_to_reference_count() {
    run_metadata_test_both(|store| async move {
        let lonely = insert_completed(store.as_ref(), REPO, &commit(1), "").await;
        store.insert_packages(lonely, &[package("p1")]).await.unwrap();
        expire(store.as_ref(), &[lonely]).await;

        let stats = store.reclaim_by_traversal(10).await.unwrap();
        assert_eq!(
            stats,
            ReclaimStats {
                scanned: 1,
                deleted: 0,
                incomplete: false
            }
        );
        let upload = store.get_upload(lonely).await.unwrap().unwrap();
        assert_eq!(upload.state, "completed");
        assert!(upload.last_traversal_scan_at.is_some());

        let stats = store.reclaim_by_reference_count(10).await.unwrap();
        assert_eq!(stats.deleted, 1);
    })
    .await;
}

#[tokio::test]
async fn test_traversal_marks_every_touched_repository_dirty() {
    run_metadata_test_both(|store| async move {
        let root = insert_completed(store.as_ref(), 1, &commit(1), "").await;
        let dependent = insert_completed(store.as_ref(), 2, &commit(2), "").await;
        store.insert_packages(root, &[package("lib")]).await.unwrap();
        store
            .insert_package_references(dependent, &[package("lib")])
            .await
            .unwrap();
        expire(store.as_ref(), &[root, dependent]).await;

        let stats = store.reclaim_by_traversal(10).await.unwrap();
        assert_eq!(stats.deleted, 2);
        let dirty: Vec<i64> = store
            .get_dirty_repositories()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.repository_id)
            .collect();
        assert_eq!(dirty, vec![1, 2]);
    })
    .await;
}

#[tokio::test]
async fn test_processing_referrer_protects_in_both_reclaimers() {
    run_metadata_test_both(|store| async move {
        let provider = insert_completed(store.as_ref(), REPO, &commit(1), "").await;
        let processing = insert_upload_in_state(
            store.as_ref(),
            2,
            &commit(2),
            "",
            UploadState::Processing,
            now_secs(),
        )
        .await;
        store
            .insert_packages(provider, &[package("lib")])
            .await
            .unwrap();
        store
            .insert_package_references(processing, &[package("lib")])
            .await
            .unwrap();
        expire(store.as_ref(), &[provider]).await;

        let stats = store.reclaim_by_reference_count(10).await.unwrap();
        assert_eq!(stats.deleted, 0);
        assert_eq!(state_of(store.as_ref(), provider).await, "completed");

        let stats = store.reclaim_by_traversal(10).await.unwrap();
        assert_eq!(
            stats,
            ReclaimStats {
                scanned: 2,
                deleted: 0,
                incomplete: false
            }
        );
        assert_eq!(state_of(store.as_ref(), provider).await, "completed");
        assert_eq!(state_of(store.as_ref(), processing).await, "processing");
    })
    .await;
}

#[tokio::test]
async fn test_traversal_with_zero_limit_deletes_nothing() {
    run_metadata_test_both(|store| async move {
        let (d, e, f) = expired_chain(store.as_ref()).await;

        let stats = store.reclaim_by_traversal(0).await.unwrap();
        assert_eq!(
            stats,
            ReclaimStats {
                scanned: 1,
                deleted: 0,
                incomplete: true
            }
        );
        for id in [d, e, f] {
            assert_eq!(state_of(store.as_ref(), id).await, "completed");
        }
        assert!(store.get_dirty_repositories().await.unwrap().is_empty());
    })
    .await;
}

#[tokio::test]
async fn test_traversal_finds_root_behind_a_full_page_of_unreferenced_uploads() {
    run_metadata_test_both(|store| async move {
        let mut expired = Vec::new();
        for i in 0..100 {
            let root = format!("tools/{i}/");
            expired.push(insert_completed(store.as_ref(), REPO, &commit(100 + i), &root).await);
        }
        let d = insert_completed(store.as_ref(), REPO, &commit(1), "d/").await;
        let e = insert_completed(store.as_ref(), REPO, &commit(2), "e/").await;
        store.insert_packages(d, &[package("pd")]).await.unwrap();
        store
            .insert_package_references(e, &[package("pd")])
            .await
            .unwrap();
        expired.extend([d, e]);
        expire(store.as_ref(), &expired).await;

        let stats = store.reclaim_by_traversal(10).await.unwrap();
        assert_eq!(
            stats,
            ReclaimStats {
                scanned: 102,
                deleted: 2,
                incomplete: false
            }
        );
        assert_eq!(state_of(store.as_ref(), d).await, "deleting");
        assert_eq!(state_of(store.as_ref(), e).await, "deleting");
        assert_eq!(state_of(store.as_ref(), expired[0]).await, "completed");
    })
    .await;
}

//! Integration tests for the janitor cleanup passes.

mod common;

use common::*;
use std::collections::HashMap;
use tidemark_core::{IndexState, UploadState};
use tidemark_metadata::SourcedCommitsCleanup;
use tidemark_metadata::models::SourcedCommits;
use tidemark_metadata::repos::{CleanupRepo, DirtyRepo, UploadRepo};
use time::Duration;

#[tokio::test]
async fn test_delete_uploads_without_repository_honors_grace_period() {
    run_metadata_test_both(|store| async move {
        let now = now_secs();
        for id in 1..=4 {
            store
                .upsert_repository(id, &format!("github.com/acme/repo-{id}"))
                .await
                .unwrap();
        }
        store
            .mark_repository_deleted(1, now - Duration::hours(1))
            .await
            .unwrap();
        store
            .mark_repository_deleted(2, now - Duration::minutes(10))
            .await
            .unwrap();
        store.set_repository_blocked(3, true).await.unwrap();

        let old_deleted = [
            insert_completed(store.as_ref(), 1, &commit(1), "").await,
            insert_completed(store.as_ref(), 1, &commit(2), "").await,
        ];
        let recently_deleted = insert_completed(store.as_ref(), 2, &commit(1), "").await;
        let blocked = insert_completed(store.as_ref(), 3, &commit(1), "").await;
        let live = insert_completed(store.as_ref(), 4, &commit(1), "").await;

        let counts = store.delete_uploads_without_repository(now).await.unwrap();
        assert_eq!(counts, HashMap::from([(1, 2), (3, 1)]));

        for id in old_deleted {
            assert_eq!(state_of(store.as_ref(), id).await, "deleted");
        }
        assert_eq!(state_of(store.as_ref(), blocked).await, "deleted");
        assert_eq!(state_of(store.as_ref(), recently_deleted).await, "completed");
        assert_eq!(state_of(store.as_ref(), live).await, "completed");

        // Already-deleted rows are not counted again.
        let counts = store.delete_uploads_without_repository(now).await.unwrap();
        assert!(counts.is_empty());

        // Once the grace period has passed the second repository goes too.
        let counts = store
            .delete_uploads_without_repository(now + Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(counts, HashMap::from([(2, 1)]));
    })
    .await;
}

#[tokio::test]
async fn test_delete_indexes_without_repository() {
    run_metadata_test_both(|store| async move {
        let now = now_secs();
        store.upsert_repository(1, "github.com/acme/gone").await.unwrap();
        store.upsert_repository(2, "github.com/acme/live").await.unwrap();
        store
            .mark_repository_deleted(1, now - Duration::hours(2))
            .await
            .unwrap();

        let gone = insert_index(store.as_ref(), 1, "", IndexState::Queued, now).await;
        let live = insert_index(store.as_ref(), 2, "", IndexState::Queued, now).await;

        let counts = store.delete_indexes_without_repository(now).await.unwrap();
        assert_eq!(counts, HashMap::from([(1, 1)]));
        assert_eq!(store.get_index(gone).await.unwrap().unwrap().state, "deleted");
        assert_eq!(store.get_index(live).await.unwrap().unwrap().state, "queued");
    })
    .await;
}

#[tokio::test]
async fn test_expire_failed_records_requires_later_attempt() {
    run_metadata_test_both(|store| async move {
        let now = now_secs();
        let superseded =
            insert_index(store.as_ref(), 1, "", IndexState::Failed, now - Duration::days(10)).await;
        let success =
            insert_index(store.as_ref(), 1, "", IndexState::Completed, now - Duration::days(9)).await;
        let latest_failure =
            insert_index(store.as_ref(), 1, "", IndexState::Failed, now - Duration::days(8)).await;
        let recent =
            insert_index(store.as_ref(), 1, "web/", IndexState::Failed, now - Duration::hours(1))
                .await;
        insert_index(store.as_ref(), 1, "web/", IndexState::Completed, now).await;

        let (scanned, deleted) = store
            .expire_failed_records(100, Duration::days(7), now)
            .await
            .unwrap();
        assert_eq!((scanned, deleted), (2, 1));

        assert!(store.get_index(superseded).await.unwrap().is_none());
        assert!(store.get_index(success).await.unwrap().is_some());
        assert!(store.get_index(latest_failure).await.unwrap().is_some());
        assert!(store.get_index(recent).await.unwrap().is_some());
    })
    .await;
}

#[tokio::test]
async fn test_expire_failed_records_respects_batch_size() {
    run_metadata_test_both(|store| async move {
        let now = now_secs();
        for days in [12, 11, 10] {
            insert_index(store.as_ref(), 1, "", IndexState::Failed, now - Duration::days(days)).await;
        }

        let (scanned, deleted) = store
            .expire_failed_records(1, Duration::days(7), now)
            .await
            .unwrap();
        assert_eq!((scanned, deleted), (1, 1));

        // The newest failure is never superseded.
        let (scanned, deleted) = store
            .expire_failed_records(10, Duration::days(7), now)
            .await
            .unwrap();
        assert_eq!((scanned, deleted), (2, 1));
    })
    .await;
}

#[tokio::test]
async fn test_delete_uploads_stuck_uploading() {
    run_metadata_test_both(|store| async move {
        let now = now_secs();
        let stuck = insert_upload_in_state(
            store.as_ref(),
            1,
            &commit(1),
            "",
            UploadState::Uploading,
            now - Duration::days(3),
        )
        .await;
        let fresh = insert_upload_in_state(
            store.as_ref(),
            1,
            &commit(2),
            "",
            UploadState::Uploading,
            now,
        )
        .await;
        let queued = insert_upload_in_state(
            store.as_ref(),
            1,
            &commit(3),
            "",
            UploadState::Queued,
            now - Duration::days(3),
        )
        .await;

        let deleted = store
            .delete_uploads_stuck_uploading(now - Duration::days(1))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(state_of(store.as_ref(), stuck).await, "deleted");
        assert_eq!(state_of(store.as_ref(), fresh).await, "uploading");
        assert_eq!(state_of(store.as_ref(), queued).await, "queued");
    })
    .await;
}

#[tokio::test]
async fn test_sourced_commits_lifecycle() {
    run_metadata_test_both(|store| async move {
        let now = now_secs();
        let (c1, c2, c3) = (commit(1), commit(2), commit(3));
        insert_completed(store.as_ref(), 1, &c1, "").await;
        let old_queued = insert_upload_in_state(
            store.as_ref(),
            1,
            &c2,
            "",
            UploadState::Queued,
            now - Duration::days(10),
        )
        .await;
        let old_completed = insert_upload_in_state(
            store.as_ref(),
            1,
            &c2,
            "lib/",
            UploadState::Completed,
            now - Duration::days(10),
        )
        .await;
        let young = insert_upload_in_state(
            store.as_ref(),
            1,
            &c3,
            "",
            UploadState::Completed,
            now - Duration::minutes(1),
        )
        .await;
        insert_completed(store.as_ref(), 2, &c1, "").await;

        let stale = store
            .get_stale_sourced_commits(Duration::hours(1), 10, now)
            .await
            .unwrap();
        assert_eq!(
            stale,
            vec![
                SourcedCommits {
                    repository_id: 1,
                    commits: vec![c1.clone(), c2.clone(), c3.clone()],
                },
                SourcedCommits {
                    repository_id: 2,
                    commits: vec![c1.clone()],
                },
            ]
        );

        assert_eq!(store.update_sourced_commits(1, &c1, now).await.unwrap(), 1);

        let cleanup = store
            .delete_sourced_commits(1, &c2, Duration::days(1), now)
            .await
            .unwrap();
        assert_eq!(
            cleanup,
            SourcedCommitsCleanup {
                updated: 0,
                deleted: 2
            }
        );
        assert_eq!(state_of(store.as_ref(), old_queued).await, "deleted");
        assert_eq!(state_of(store.as_ref(), old_completed).await, "deleting");
        assert_eq!(store.get_dirty_repositories().await.unwrap().len(), 1);

        // Uploads younger than the commit lag are only re-stamped.
        let cleanup = store
            .delete_sourced_commits(1, &c3, Duration::days(1), now)
            .await
            .unwrap();
        assert_eq!(
            cleanup,
            SourcedCommitsCleanup {
                updated: 1,
                deleted: 0
            }
        );
        assert_eq!(state_of(store.as_ref(), young).await, "completed");

        let stale = store
            .get_stale_sourced_commits(Duration::hours(1), 10, now)
            .await
            .unwrap();
        assert_eq!(
            stale,
            vec![SourcedCommits {
                repository_id: 2,
                commits: vec![c1.clone()],
            }]
        );
    })
    .await;
}

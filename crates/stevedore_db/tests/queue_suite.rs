//! Queue store integration suite: claim/commit discipline, operator
//! actions, crash recovery, and ledger fidelity.

use stevedore_db::{CommitExtras, DbError, EntryFilter, QueueDb};
use stevedore_protocol::types::{
    BucketStatus, BucketUpdate, ConflictAction, FileStatus, NewBucket, NewQueueEntry,
};
use tempfile::TempDir;

async fn open_db(dir: &TempDir) -> QueueDb {
    QueueDb::open(dir.path().join("queue.sqlite3")).await.unwrap()
}

async fn make_bucket(db: &QueueDb, name: &str) -> i64 {
    let bucket = db
        .create_bucket(&NewBucket {
            name: name.to_string(),
            source_folders: vec!["/src/a".into(), "/src/b".into()],
            destination_folder: "/dst".into(),
            worker_count: 4,
        })
        .await
        .unwrap();
    bucket.id
}

fn entry(folder: &str, name: &str, size: u64) -> NewQueueEntry {
    NewQueueEntry {
        source_path: format!("{folder}/{name}"),
        source_folder: folder.to_string(),
        relative_path: name.to_string(),
        destination_path: format!("/dst/{name}"),
        file_size: size,
        status: FileStatus::Pending,
    }
}

#[tokio::test]
async fn insert_many_dedups_on_triple() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(&tmp).await;
    let bucket = make_bucket(&db, "photos").await;

    let rows = vec![entry("/src/a", "one.txt", 10), entry("/src/a", "two.txt", 20)];
    assert_eq!(db.insert_many(bucket, &rows).await.unwrap(), 2);
    // Reinsertion of the same triple set is a no-op.
    assert_eq!(db.insert_many(bucket, &rows).await.unwrap(), 0);

    let stats = db.stats().await;
    assert_eq!(stats.total.pending.count, 2);
    assert_eq!(stats.total.pending.total_size, 30);
    assert!(db.verify_ledger().await.unwrap());
}

#[tokio::test]
async fn claim_is_fifo_within_folder() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(&tmp).await;
    let bucket = make_bucket(&db, "docs").await;

    let rows: Vec<_> = (0..6).map(|i| entry("/src/a", &format!("f{i}"), 1)).collect();
    db.insert_many(bucket, &rows).await.unwrap();

    let first = db.claim(bucket, Some("/src/a"), 3, 1).await.unwrap();
    let second = db.claim(bucket, Some("/src/a"), 3, 2).await.unwrap();

    let ids: Vec<i64> = first.iter().chain(second.iter()).map(|e| e.id).collect();
    assert_eq!(ids.len(), 6);
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids not ascending: {ids:?}");
    assert_eq!(first[0].worker_id, Some(1));
    assert_eq!(second[0].worker_id, Some(2));
}

#[tokio::test]
async fn claim_respects_folder_scope_and_limit() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(&tmp).await;
    let bucket = make_bucket(&db, "mixed").await;

    db.insert_many(
        bucket,
        &[
            entry("/src/a", "a1", 1),
            entry("/src/b", "b1", 1),
            entry("/src/a", "a2", 1),
        ],
    )
    .await
    .unwrap();

    let claimed = db.claim(bucket, Some("/src/a"), 10, 1).await.unwrap();
    assert_eq!(claimed.len(), 2);
    assert!(claimed.iter().all(|e| e.source_folder == "/src/a"));

    let none_left = db.claim(bucket, Some("/src/a"), 10, 2).await.unwrap();
    assert!(none_left.is_empty());
}

#[tokio::test]
async fn concurrent_claims_never_hand_out_the_same_row() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(&tmp).await;
    let bucket = make_bucket(&db, "contended").await;

    let rows: Vec<_> = (0..40).map(|i| entry("/src/a", &format!("f{i}"), 1)).collect();
    db.insert_many(bucket, &rows).await.unwrap();

    let mut handles = Vec::new();
    for worker in 0..8 {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            db.claim(bucket, Some("/src/a"), 10, worker).await.unwrap()
        }));
    }

    let mut seen = std::collections::HashSet::new();
    let mut total = 0usize;
    for handle in handles {
        for entry in handle.await.unwrap() {
            assert!(seen.insert(entry.id), "row {} claimed twice", entry.id);
            total += 1;
        }
    }
    assert_eq!(total, 40);
    assert!(db.verify_ledger().await.unwrap());
}

#[tokio::test]
async fn commit_records_outcome_and_moves_ledger() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(&tmp).await;
    let bucket = make_bucket(&db, "commit").await;

    db.insert_many(bucket, &[entry("/src/a", "f", 13)]).await.unwrap();
    let claimed = db.claim(bucket, None, 1, 7).await.unwrap();
    let row = &claimed[0];
    assert_eq!(row.status, FileStatus::InProgress);
    assert!(row.started_at.is_some());

    db.commit_outcome(
        bucket,
        row.id,
        FileStatus::Completed,
        CommitExtras {
            source_hash: Some("abc".into()),
            destination_hash: Some("abc".into()),
            error_message: None,
        },
    )
    .await
    .unwrap();

    let stored = db.get_entry(bucket, row.id).await.unwrap().unwrap();
    assert_eq!(stored.status, FileStatus::Completed);
    assert_eq!(stored.source_hash.as_deref(), Some("abc"));
    assert_eq!(stored.destination_hash.as_deref(), Some("abc"));
    assert!(stored.completed_at.is_some());

    let stats = db.stats().await;
    assert_eq!(stats.total.pending.count, 0);
    assert_eq!(stats.total.in_progress.count, 0);
    assert_eq!(stats.total.completed.count, 1);
    assert_eq!(stats.total.completed.total_size, 13);
    assert!(db.verify_ledger().await.unwrap());
}

#[tokio::test]
async fn commit_unknown_row_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(&tmp).await;
    let bucket = make_bucket(&db, "missing").await;

    let err = db
        .commit_outcome(bucket, 9999, FileStatus::Completed, CommitExtras::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::NotFound(_)));
}

#[tokio::test]
async fn conflict_resolution_skip_and_overwrite() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(&tmp).await;
    let bucket = make_bucket(&db, "conflicts").await;

    db.insert_many(bucket, &[entry("/src/a", "c1", 5), entry("/src/a", "c2", 7)])
        .await
        .unwrap();
    let claimed = db.claim(bucket, None, 2, 1).await.unwrap();
    for row in &claimed {
        db.commit_outcome(
            bucket,
            row.id,
            FileStatus::Conflict,
            CommitExtras {
                source_hash: Some("src".into()),
                destination_hash: Some("dst".into()),
                error_message: None,
            },
        )
        .await
        .unwrap();
    }

    // skip: conflict -> completed, destination untouched, hashes kept
    assert!(db
        .resolve_conflict(bucket, claimed[0].id, ConflictAction::Skip)
        .await
        .unwrap());
    let skipped = db.get_entry(bucket, claimed[0].id).await.unwrap().unwrap();
    assert_eq!(skipped.status, FileStatus::Completed);
    assert_eq!(skipped.destination_hash.as_deref(), Some("dst"));

    // overwrite: conflict -> pending with the stale destination hash cleared
    assert!(db
        .resolve_conflict(bucket, claimed[1].id, ConflictAction::Overwrite)
        .await
        .unwrap());
    let requeued = db.get_entry(bucket, claimed[1].id).await.unwrap().unwrap();
    assert_eq!(requeued.status, FileStatus::Pending);
    assert!(requeued.destination_hash.is_none());
    assert!(requeued.worker_id.is_none());

    // resolving a row that is no longer in conflict fails silently
    assert!(!db
        .resolve_conflict(bucket, claimed[0].id, ConflictAction::Skip)
        .await
        .unwrap());

    assert!(db.verify_ledger().await.unwrap());
}

#[tokio::test]
async fn bulk_retry_shifts_errors_back_to_pending() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(&tmp).await;
    let bucket = make_bucket(&db, "retries").await;

    let rows: Vec<_> = (0..3).map(|i| entry("/src/a", &format!("e{i}"), 100)).collect();
    db.insert_many(bucket, &rows).await.unwrap();
    let claimed = db.claim(bucket, None, 3, 1).await.unwrap();
    for row in &claimed {
        db.commit_outcome(
            bucket,
            row.id,
            FileStatus::Error,
            CommitExtras {
                error_message: Some("disk detached".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    }

    let before = db.stats().await;
    assert_eq!(before.total.error.count, 3);
    assert_eq!(before.total.error.total_size, 300);

    let retried = db.retry_errors_bulk(Some(bucket)).await.unwrap();
    assert_eq!(retried, 3);

    let after = db.stats().await;
    assert_eq!(after.total.error.count, 0);
    assert_eq!(after.total.pending.count, 3);
    assert_eq!(after.total.pending.total_size, 300);

    let requeued = db
        .list_entries(&EntryFilter {
            bucket_id: Some(bucket),
            status: Some(FileStatus::Pending),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(requeued.len(), 3);
    assert!(requeued.iter().all(|e| e.error_message.is_none()));
    assert!(db.verify_ledger().await.unwrap());
}

#[tokio::test]
async fn reopen_recovers_interrupted_rows() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("queue.sqlite3");

    let bucket;
    {
        let db = QueueDb::open(&path).await.unwrap();
        bucket = make_bucket(&db, "crashy").await;
        db.insert_many(
            bucket,
            &[entry("/src/a", "f1", 1), entry("/src/a", "f2", 1)],
        )
        .await
        .unwrap();
        let claimed = db.claim(bucket, None, 2, 1).await.unwrap();
        assert_eq!(claimed.len(), 2);
        // process "crashes" here: rows are left in_progress on disk
    }

    let db = QueueDb::open(&path).await.unwrap();
    let stats = db.stats().await;
    assert_eq!(stats.total.in_progress.count, 0);
    assert_eq!(stats.total.pending.count, 2);

    let rows = db
        .list_entries(&EntryFilter {
            bucket_id: Some(bucket),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(rows.iter().all(|e| e.worker_id.is_none() && e.started_at.is_none()));
    assert!(db.verify_ledger().await.unwrap());
}

#[tokio::test]
async fn bucket_guards_and_cascade_delete() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(&tmp).await;
    let bucket = make_bucket(&db, "guarded").await;

    // duplicate name is a constraint violation
    let err = db
        .create_bucket(&NewBucket {
            name: "guarded".into(),
            source_folders: vec!["/x".into()],
            destination_folder: "/y".into(),
            worker_count: 1,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Constraint(_)));

    db.insert_many(bucket, &[entry("/src/a", "f", 9)]).await.unwrap();

    // layout changes require a stopped scheduler
    db.set_bucket_status(bucket, BucketStatus::Running).await.unwrap();
    let err = db
        .update_bucket(
            bucket,
            &BucketUpdate {
                destination_folder: Some("/elsewhere".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidState(_)));

    // the worker cap changes live
    let updated = db
        .update_bucket(
            bucket,
            &BucketUpdate {
                worker_count: Some(8),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.worker_count, 8);

    // deletion requires stopped, then cascades to rows and ledger
    let err = db.delete_bucket(bucket).await.unwrap_err();
    assert!(matches!(err, DbError::InvalidState(_)));

    db.set_bucket_status(bucket, BucketStatus::Stopped).await.unwrap();
    db.delete_bucket(bucket).await.unwrap();

    assert!(matches!(db.get_bucket(bucket).await, Err(DbError::NotFound(_))));
    let stats = db.stats().await;
    assert_eq!(stats.total.pending.count, 0);
    assert!(stats.buckets.get(&bucket).is_none());
    assert!(db.verify_ledger().await.unwrap());
}

#[tokio::test]
async fn folder_active_counts_track_claims() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(&tmp).await;
    let bucket = make_bucket(&db, "folders").await;

    db.insert_many(
        bucket,
        &[
            entry("/src/a", "a1", 1),
            entry("/src/a", "a2", 1),
            entry("/src/b", "b1", 1),
        ],
    )
    .await
    .unwrap();

    let counts = db.folder_active_counts(bucket).await.unwrap();
    assert_eq!(counts["/src/a"].pending, 2);
    assert_eq!(counts["/src/b"].pending, 1);
    assert_eq!(counts["/src/a"].in_progress, 0);

    db.claim(bucket, Some("/src/a"), 1, 1).await.unwrap();
    let counts = db.folder_active_counts(bucket).await.unwrap();
    assert_eq!(counts["/src/a"].pending, 1);
    assert_eq!(counts["/src/a"].in_progress, 1);

    let folder_stats = db.folder_stats(bucket).await.unwrap();
    assert_eq!(folder_stats["/src/a"].pending.count, 1);
    assert_eq!(folder_stats["/src/a"].in_progress.count, 1);
    assert_eq!(folder_stats["/src/b"].pending.count, 1);
}

#[tokio::test]
async fn schema_version_is_persisted() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(&tmp).await;
    let version = db.get_state("schema_version").await.unwrap();
    assert_eq!(version.as_deref(), Some(stevedore_db::SCHEMA_VERSION.to_string().as_str()));
}

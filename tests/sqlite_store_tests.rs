//! Store-contract tests against the SQLite implementation: fetch
//! predicate and ordering, conditional lock acquisition, commit atomicity,
//! cluster leases, and file-backed persistence across reconnects.

mod common;

use common::*;
use redrive::providers::sqlite::SqliteTaskStore;
use redrive::providers::{AttemptClose, OperatorUpdate, TaskCommit, TaskStore};
use redrive::task::{now_ms, NewExecutionLog, NewTask, TaskId, TaskPriority, TaskStatus, TaskType};

#[tokio::test]
async fn insert_and_get_round_trip() {
    let store = sqlite_store().await;
    let payload = serde_json::json!({"reason": "fraud", "items": [1, 2]});
    let metadata = serde_json::json!({"retryDelayHours": 2});

    let created = store
        .insert_task(
            NewTask::new(TaskType::PaymentRefund, "PAY-1")
                .payload(payload.clone())
                .metadata(metadata.clone())
                .priority(TaskPriority::High)
                .max_retries(2),
        )
        .await
        .unwrap();

    let read = store.get_task(created.id).await.unwrap().unwrap();
    assert_eq!(read.task_type, TaskType::PaymentRefund);
    assert_eq!(read.priority, TaskPriority::High);
    assert_eq!(read.payload, payload);
    assert_eq!(read.metadata, metadata);
    assert_eq!(read.max_retries, Some(2));
    assert_eq!(read.version, 0);
    assert_eq!(read.status, TaskStatus::Pending);
}

#[tokio::test]
async fn fetch_predicate_and_ordering() {
    let store = sqlite_store().await;
    let now = now_ms();

    let low = store
        .insert_task(
            NewTask::new(TaskType::OrderCancel, "low")
                .priority(TaskPriority::Low)
                .scheduled_at(now - 10_000),
        )
        .await
        .unwrap();
    let critical = store
        .insert_task(
            NewTask::new(TaskType::OrderCancel, "critical")
                .priority(TaskPriority::Critical)
                .scheduled_at(now - 1_000),
        )
        .await
        .unwrap();
    let normal_old = store
        .insert_task(NewTask::new(TaskType::OrderCancel, "normal-old").scheduled_at(now - 9_000))
        .await
        .unwrap();
    let normal_new = store
        .insert_task(NewTask::new(TaskType::OrderCancel, "normal-new").scheduled_at(now - 2_000))
        .await
        .unwrap();
    // Not selectable: future, expired, locked.
    store
        .insert_task(NewTask::new(TaskType::OrderCancel, "future").scheduled_at(now + 60_000))
        .await
        .unwrap();
    store
        .insert_task(
            NewTask::new(TaskType::OrderCancel, "expired")
                .scheduled_at(now - 10_000)
                .expires_at(now - 1),
        )
        .await
        .unwrap();
    let locked = store
        .insert_task(NewTask::new(TaskType::OrderCancel, "locked").scheduled_at(now - 10_000))
        .await
        .unwrap();
    store
        .acquire_task_lock(locked.id, locked.version, "other:1", now + 60_000, now)
        .await
        .unwrap();

    let due = store.fetch_due_tasks(now, 10).await.unwrap();
    let ids: Vec<TaskId> = due.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![critical.id, normal_old.id, normal_new.id, low.id]);

    // A claimed row is PROCESSING, so even after its lock expires the
    // poller ignores it; recovery belongs to the reaper.
    let due_later = store.fetch_due_tasks(now + 61_000, 10).await.unwrap();
    assert!(!due_later.iter().any(|t| t.id == locked.id));

    // Limit applies after ordering.
    let top = store.fetch_due_tasks(now, 2).await.unwrap();
    assert_eq!(top.len(), 2);
    assert_eq!(top[0].id, critical.id);
}

#[tokio::test]
async fn concurrent_acquisition_has_exactly_one_winner() {
    let store = sqlite_store().await;
    let task = store
        .insert_task(NewTask::new(TaskType::OrderCancel, "ORD-1"))
        .await
        .unwrap();

    let now = now_ms();
    let mut acquisitions = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        let id = task.id;
        let version = task.version;
        acquisitions.push(tokio::spawn(async move {
            store
                .acquire_task_lock(id, version, &format!("replica:{i}"), now + 60_000, now)
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in acquisitions {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let locked = store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(locked.status, TaskStatus::Processing);
    assert_eq!(locked.version, 1);
}

#[tokio::test]
async fn two_instances_fetch_and_claim_disjoint_sets() {
    let store = sqlite_store().await;
    let now = now_ms();
    for i in 0..10 {
        store
            .insert_task(NewTask::new(TaskType::OrderCancel, format!("ORD-{i}")).scheduled_at(now - 1_000))
            .await
            .unwrap();
    }

    // Both instances see the same candidates; the conditional update
    // decides ownership.
    let batch_a = store.fetch_due_tasks(now, 10).await.unwrap();
    let batch_b = store.fetch_due_tasks(now, 10).await.unwrap();

    let mut owned_a = Vec::new();
    let mut owned_b = Vec::new();
    for task in &batch_a {
        if store
            .acquire_task_lock(task.id, task.version, "replica:a", now + 60_000, now)
            .await
            .unwrap()
        {
            owned_a.push(task.id);
        }
    }
    for task in &batch_b {
        if store
            .acquire_task_lock(task.id, task.version, "replica:b", now + 60_000, now)
            .await
            .unwrap()
        {
            owned_b.push(task.id);
        }
    }

    // A claimed everything first here; the property that matters is the
    // disjoint union covering all ten exactly once.
    assert!(owned_a.iter().all(|id| !owned_b.contains(id)));
    assert_eq!(owned_a.len() + owned_b.len(), 10);
}

#[tokio::test]
async fn commit_attempt_closes_log_and_task_atomically() {
    let store = sqlite_store().await;
    let task = store
        .insert_task(NewTask::new(TaskType::OrderCancel, "ORD-1"))
        .await
        .unwrap();
    let now = now_ms();
    store
        .acquire_task_lock(task.id, task.version, "replica:a", now + 60_000, now)
        .await
        .unwrap();

    let log = store
        .open_attempt(NewExecutionLog {
            task_id: task.id,
            attempt_number: 1,
            executor_instance: "replica:a".into(),
            started_at: now,
            request_payload: Some(serde_json::json!({"referenceId": "ORD-1"})),
        })
        .await
        .unwrap();

    let committed = store
        .commit_attempt(
            task.id,
            "replica:a",
            log.id,
            AttemptClose {
                status: TaskStatus::Completed,
                completed_at: now + 100,
                duration_ms: 100,
                success: true,
                error_message: None,
                error_stack_trace: None,
                error_type: None,
                http_status_code: Some(200),
                response_payload: Some(serde_json::json!({"ok": true})),
            },
            TaskCommit {
                status: TaskStatus::Completed,
                retry_count: 0,
                scheduled_time: task.scheduled_time,
                completed_at: Some(now + 100),
                execution_duration_ms: Some(100),
                execution_result: Some(serde_json::json!({"ok": true})),
                last_error: None,
                last_error_stack_trace: None,
            },
            now + 100,
        )
        .await
        .unwrap();
    assert!(committed);

    let done = store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(done.locked_by.is_none());
    assert_eq!(done.version, 2);

    let attempts = store.list_attempts(task.id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].success);
    assert_eq!(attempts[0].http_status_code, Some(200));
}

#[tokio::test]
async fn commit_attempt_rolls_back_when_lock_is_lost() {
    let store = sqlite_store().await;
    let task = store
        .insert_task(NewTask::new(TaskType::OrderCancel, "ORD-1"))
        .await
        .unwrap();
    let now = now_ms();
    store
        .acquire_task_lock(task.id, task.version, "replica:a", now + 60_000, now)
        .await
        .unwrap();
    let log = store
        .open_attempt(NewExecutionLog {
            task_id: task.id,
            attempt_number: 1,
            executor_instance: "replica:a".into(),
            started_at: now,
            request_payload: None,
        })
        .await
        .unwrap();

    // A different holder tries to commit: the conditional update misses,
    // and the log close must roll back with it.
    let committed = store
        .commit_attempt(
            task.id,
            "replica:b",
            log.id,
            AttemptClose {
                status: TaskStatus::Completed,
                completed_at: now + 50,
                duration_ms: 50,
                success: true,
                error_message: None,
                error_stack_trace: None,
                error_type: None,
                http_status_code: None,
                response_payload: None,
            },
            TaskCommit {
                status: TaskStatus::Completed,
                retry_count: 0,
                scheduled_time: task.scheduled_time,
                completed_at: Some(now + 50),
                execution_duration_ms: Some(50),
                execution_result: None,
                last_error: None,
                last_error_stack_trace: None,
            },
            now + 50,
        )
        .await
        .unwrap();
    assert!(!committed);

    let unchanged = store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, TaskStatus::Processing);
    assert_eq!(unchanged.locked_by.as_deref(), Some("replica:a"));

    let attempts = store.list_attempts(task.id).await.unwrap();
    assert_eq!(attempts[0].status, TaskStatus::Processing);
    assert!(!attempts[0].success);
}

#[tokio::test]
async fn operator_update_conditional_on_version_and_lock() {
    let store = sqlite_store().await;
    let task = store
        .insert_task(NewTask::new(TaskType::OrderCancel, "ORD-1"))
        .await
        .unwrap();
    let now = now_ms();

    // Stale version misses.
    let update = OperatorUpdate {
        status: TaskStatus::Cancelled,
        scheduled_time: None,
        completed_at: Some(now),
        last_error: Some("Cancelled: stale".into()),
        clear_lock: false,
    };
    assert!(!store
        .operator_update(task.id, task.version + 1, update.clone(), now)
        .await
        .unwrap());

    // Matching version lands and bumps the version.
    assert!(store
        .operator_update(task.id, task.version, update, now)
        .await
        .unwrap());
    let cancelled = store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert_eq!(cancelled.version, task.version + 1);
    assert_eq!(cancelled.last_error.as_deref(), Some("Cancelled: stale"));
}

#[tokio::test]
async fn cluster_lock_is_exclusive_until_expiry() {
    let store = sqlite_store().await;
    let now = now_ms();

    assert!(store
        .acquire_cluster_lock("taskPollingJob", "a:1", 60_000, now)
        .await
        .unwrap());
    assert!(!store
        .acquire_cluster_lock("taskPollingJob", "b:2", 60_000, now)
        .await
        .unwrap());
    // The holder renews.
    assert!(store
        .acquire_cluster_lock("taskPollingJob", "a:1", 60_000, now + 30_000)
        .await
        .unwrap());
    // After expiry anyone can take it.
    assert!(store
        .acquire_cluster_lock("taskPollingJob", "b:2", 60_000, now + 120_000)
        .await
        .unwrap());

    // Independent lease names do not interfere.
    assert!(store
        .acquire_cluster_lock("staleTaskCleanup", "a:1", 60_000, now)
        .await
        .unwrap());

    // Release by the holder frees it immediately.
    store.release_cluster_lock("taskPollingJob", "b:2").await.unwrap();
    assert!(store
        .acquire_cluster_lock("taskPollingJob", "c:3", 60_000, now + 120_000)
        .await
        .unwrap());
}

#[tokio::test]
async fn stale_reset_only_touches_processing_rows() {
    let store = sqlite_store().await;
    let now = now_ms();

    let stale = store
        .insert_task(NewTask::new(TaskType::OrderCancel, "stale"))
        .await
        .unwrap();
    store
        .acquire_task_lock(stale.id, stale.version, "dead:1", now - 2 * HOUR_MS, now - 2 * HOUR_MS)
        .await
        .unwrap();
    let healthy = store
        .insert_task(NewTask::new(TaskType::OrderCancel, "healthy"))
        .await
        .unwrap();

    let found = store.find_stale_tasks(now - HOUR_MS).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, stale.id);

    // Passing extra ids is harmless: only PROCESSING rows reset.
    let reset = store
        .reset_stale_tasks(&[stale.id, healthy.id], now + 60_000, now)
        .await
        .unwrap();
    assert_eq!(reset, 1);
    assert_eq!(
        store.get_task(healthy.id).await.unwrap().unwrap().status,
        TaskStatus::Pending
    );
}

#[tokio::test]
async fn file_backed_store_survives_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("tasks.db");
    let url = format!("sqlite:{}", db_path.display());

    let task_id = {
        let store = SqliteTaskStore::new(&url).await.unwrap();
        let task = store
            .insert_task(
                NewTask::new(TaskType::PaymentVoid, "PAY-1")
                    .payload(serde_json::json!({"reason": "expired auth"})),
            )
            .await
            .unwrap();
        task.id
    };

    let store = SqliteTaskStore::new(&url).await.unwrap();
    let read = store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(read.task_type, TaskType::PaymentVoid);
    assert_eq!(read.payload["reason"], "expired auth");
}

#[tokio::test]
async fn search_and_counts_over_sqlite() {
    let store = sqlite_store().await;
    store
        .insert_task(NewTask::new(TaskType::OrderCancel, "ORD-1"))
        .await
        .unwrap();
    store
        .insert_task(NewTask::new(TaskType::OrderCancel, "ORD-2"))
        .await
        .unwrap();
    store
        .insert_task(NewTask::new(TaskType::PaymentRefund, "PAY-1"))
        .await
        .unwrap();

    let orders = store
        .search_tasks(&redrive::TaskQuery {
            task_type: Some(TaskType::OrderCancel),
            ..redrive::TaskQuery::new()
        })
        .await
        .unwrap();
    assert_eq!(orders.len(), 2);

    let counts = store.status_counts().await.unwrap();
    let pending = counts
        .iter()
        .find(|(s, _)| *s == TaskStatus::Pending)
        .map(|(_, n)| *n);
    assert_eq!(pending, Some(3));

    let by_type = store.type_status_counts().await.unwrap();
    assert!(by_type
        .iter()
        .any(|(t, s, n)| *t == TaskType::PaymentRefund && *s == TaskStatus::Pending && *n == 1));
}

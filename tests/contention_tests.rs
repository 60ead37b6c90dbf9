//! Multi-replica contention: two runtimes over one store must process
//! every task exactly once between them.

mod common;

use std::sync::Arc;

use common::*;
use redrive::task::{NewTask, TaskStatus, TaskType};
use redrive::CreateTaskRequest;

#[tokio::test]
async fn two_replicas_process_disjoint_sets() {
    let store = sqlite_store().await;

    let handler_a = Arc::new(StubHandler::succeeding(TaskType::OrderCancel));
    let handler_b = Arc::new(StubHandler::succeeding(TaskType::OrderCancel));

    let rt_a = start_runtime(
        store.clone(),
        vec![handler_a.clone()],
        RecordingAlerts::new(),
        manual_options(),
    )
    .await;
    let rt_b = start_runtime(
        store.clone(),
        vec![handler_b.clone()],
        RecordingAlerts::new(),
        manual_options(),
    )
    .await;
    assert_ne!(rt_a.instance_id(), rt_b.instance_id());

    let client = rt_a.client();
    let mut ids = Vec::new();
    for i in 0..10 {
        let task = client
            .create_task(CreateTaskRequest::new(NewTask::new(
                TaskType::OrderCancel,
                format!("ORD-{i}"),
            )))
            .await
            .unwrap();
        ids.push(task.id);
    }

    // Both replicas poll concurrently; the cluster mutex and the per-task
    // locks between them must keep every execution exclusive.
    tokio::join!(rt_a.poll_once(), rt_b.poll_once());
    // Whoever lost the mutex race polls again to drain anything left over.
    tokio::join!(rt_a.poll_once(), rt_b.poll_once());

    let total_calls = handler_a.call_count() + handler_b.call_count();
    assert_eq!(total_calls, 10, "every task executed exactly once across the cluster");

    for id in ids {
        let done = client.get_task_with_history(id).await.unwrap();
        assert_eq!(done.task.status, TaskStatus::Completed);
        assert_eq!(done.history.len(), 1, "task {id} has exactly one attempt");
    }

    rt_a.shutdown().await;
    rt_b.shutdown().await;
}

#[tokio::test]
async fn poll_cycles_do_not_overlap_within_a_replica() {
    let store = sqlite_store().await;
    let handler = Arc::new(StubHandler::succeeding(TaskType::OrderCancel));
    let rt = start_runtime(
        store.clone(),
        vec![handler.clone()],
        RecordingAlerts::new(),
        manual_options(),
    )
    .await;
    let client = rt.client();

    for i in 0..5 {
        client
            .create_task(CreateTaskRequest::new(NewTask::new(
                TaskType::OrderCancel,
                format!("ORD-{i}"),
            )))
            .await
            .unwrap();
    }

    // Concurrent cycles on one replica: the single-flight guard plus task
    // locks must still yield exactly one execution per task.
    tokio::join!(rt.poll_once(), rt.poll_once(), rt.poll_once());
    rt.poll_once().await;

    assert_eq!(handler.call_count(), 5);
    rt.shutdown().await;
}

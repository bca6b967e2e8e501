// Copyright 2025 FlowerPower Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::time::Duration;

use config::{meta::backend::BackendKind, utils::json};
use flowerpower::{registry, AddJobOptions, AddScheduleOptions, QueueManager, TriggerSpec};
use infra::{
    backend::{Backend, BackendOptions},
    errors::Error,
    store::{FunctionRef, JobStatus, RetryPolicy},
    trigger::{IntervalTrigger, Trigger},
};

static REGISTER: std::sync::Once = std::sync::Once::new();

fn register_functions() {
    REGISTER.call_once(|| {
        registry::register_builtins();
        registry::register("math", "add", |args, _kwargs, _token| {
            Box::pin(async move {
                let sum: i64 = args.iter().filter_map(|a| a.as_i64()).sum();
                Ok(json::json!(sum))
            })
        });
        registry::register("flaky", "succeed_third", |args, _kwargs, _token| {
            Box::pin(async move {
                // counter cell index is passed in as the first argument
                let slot = args[0].as_u64().unwrap() as usize;
                let calls = CALLS[slot].fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                if calls < 3 {
                    Err(anyhow::anyhow!("attempt {calls} fails"))
                } else {
                    Ok(json::json!(calls))
                }
            })
        });
    });
}

static CALLS: [std::sync::atomic::AtomicU64; 4] = [
    std::sync::atomic::AtomicU64::new(0),
    std::sync::atomic::AtomicU64::new(0),
    std::sync::atomic::AtomicU64::new(0),
    std::sync::atomic::AtomicU64::new(0),
];

async fn manager_on_queue(queue: &str) -> QueueManager {
    let mut backend =
        Backend::for_data_store(BackendKind::Memory, BackendOptions::default()).unwrap();
    backend.queues = vec![queue.to_string()];
    QueueManager::new(backend).await.unwrap()
}

#[tokio::test]
async fn test_enqueue_and_get_result_with_worker() {
    register_functions();
    let manager = manager_on_queue("it-basic").await;
    manager.start_worker_pool(Some(1), true, None).await.unwrap();

    let id = manager
        .add_job(
            FunctionRef::new("math", "add"),
            AddJobOptions {
                args: vec![json::json!(2), json::json!(3)],
                result_ttl: Some(Duration::from_secs(60)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let result = manager
        .get_job_result(&id, Some(Duration::from_secs(2)), false)
        .await
        .unwrap();
    assert_eq!(result, Some(json::json!(5)));

    let job = manager.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Finished);
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_run_job_round_trip() {
    register_functions();
    let manager = manager_on_queue("it-run").await;
    manager.start_worker_pool(Some(1), true, None).await.unwrap();

    let result = manager
        .run_job(
            FunctionRef::new("math", "add"),
            AddJobOptions {
                args: vec![json::json!(20), json::json!(22)],
                ttl: Some(Duration::from_secs(5)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(result, json::json!(42));
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_retry_policy_until_success() {
    register_functions();
    let manager = manager_on_queue("it-retry").await;
    manager.start_worker_pool(Some(1), true, None).await.unwrap();

    let id = manager
        .add_job(
            FunctionRef::new("flaky", "succeed_third"),
            AddJobOptions {
                args: vec![json::json!(0)],
                retry: Some(RetryPolicy {
                    max: 2,
                    delay: 100_000,
                }),
                result_ttl: Some(Duration::from_secs(60)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let result = manager
        .get_job_result(&id, Some(Duration::from_secs(5)), false)
        .await
        .unwrap();
    // third attempt succeeded and reported the attempt count
    assert_eq!(result, Some(json::json!(3)));
    let job = manager.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Finished);
    assert_eq!(
        CALLS[0].load(std::sync::atomic::Ordering::SeqCst),
        3,
        "function should have been invoked exactly three times"
    );
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_retry_exhausted_surfaces_failure() {
    register_functions();
    let manager = manager_on_queue("it-retry-fail").await;
    manager.start_worker_pool(Some(1), true, None).await.unwrap();

    let id = manager
        .add_job(
            FunctionRef::new("flaky", "succeed_third"),
            AddJobOptions {
                args: vec![json::json!(1)],
                // one retry only: attempts 1 and 2 both fail
                retry: Some(RetryPolicy { max: 1, delay: 0 }),
                result_ttl: Some(Duration::from_secs(60)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = manager
        .get_job_result(&id, Some(Duration::from_secs(5)), false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("fails"), "got: {err}");
    let job = manager.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 2);
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_cancel_before_worker_starts() {
    register_functions();
    let manager = manager_on_queue("it-cancel").await;

    let id = manager
        .add_job(FunctionRef::new("math", "add"), AddJobOptions::default())
        .await
        .unwrap();
    assert!(manager.cancel_job(&id).await.unwrap());

    // a worker that starts afterwards must never observe the job as started
    manager.start_worker_pool(Some(1), true, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let job = manager.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Canceled);
    assert!(job.started_at.is_none());
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_interval_schedule_end_to_end() {
    register_functions();
    let manager = manager_on_queue("it-schedule").await;
    manager.start_worker_pool(Some(1), true, None).await.unwrap();

    let trigger = Trigger::interval(IntervalTrigger {
        microseconds: 300_000,
        start: config::utils::time::now_micros(),
        ..Default::default()
    })
    .unwrap();
    let id = manager
        .add_schedule(
            FunctionRef::new("flowerpower", "echo"),
            TriggerSpec::Trigger(trigger),
            AddScheduleOptions {
                schedule_id: Some("it-echo".to_string()),
                result_ttl: Some(Duration::from_secs(60)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(id, "it-echo");

    // wait for at least one fired job to finish
    let mut produced = 0;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        produced = manager
            .get_jobs(None)
            .await
            .unwrap()
            .iter()
            .filter(|j| {
                j.schedule_id.as_deref() == Some("it-echo")
                    && j.status == JobStatus::Finished
            })
            .count();
        if produced >= 2 {
            break;
        }
    }
    assert!(produced >= 2, "schedule produced {produced} finished jobs");

    let schedule = manager.get_schedule("it-echo").await.unwrap().unwrap();
    assert!(schedule.next_fire_at.unwrap() > schedule.last_fire_at.unwrap());

    let results = manager
        .schedule_results("it-echo", "latest".parse().unwrap())
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_deferred_job_waits_for_fire_time() {
    register_functions();
    let manager = manager_on_queue("it-deferred").await;
    manager.start_worker_pool(Some(1), true, None).await.unwrap();

    let id = manager
        .add_job(
            FunctionRef::new("math", "add"),
            AddJobOptions {
                args: vec![json::json!(1), json::json!(1)],
                run_in: Some(Duration::from_millis(600)),
                result_ttl: Some(Duration::from_secs(60)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // not eligible yet
    tokio::time::sleep(Duration::from_millis(200)).await;
    let job = manager.get_job(&id).await.unwrap().unwrap();
    assert!(matches!(job.status, JobStatus::Deferred | JobStatus::Queued));
    assert!(job.started_at.is_none());

    let result = manager
        .get_job_result(&id, Some(Duration::from_secs(3)), false)
        .await
        .unwrap();
    assert_eq!(result, Some(json::json!(2)));
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_unknown_ids_are_reported_honestly() {
    register_functions();
    let manager = manager_on_queue("it-unknown").await;
    assert!(matches!(
        manager.get_job_result("no-such-job", None, false).await,
        Err(Error::NotFound(_))
    ));
    assert!(!manager.cancel_job("no-such-job").await.unwrap());
    assert!(!manager.delete_job("no-such-job", None).await.unwrap());
    assert!(!manager.cancel_schedule("no-such-schedule").await.unwrap());
    manager.close().await.unwrap();
}

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

use std::{sync::Arc, time::Duration};

use config::utils::{json, time::seconds_to_micros};
use dashmap::DashMap;
use infra::{
    backend::{Backend, JobExecutor},
    broker::{self, Event, EventBroker, EventType},
    errors::{Error, Result},
    store::{self, DataStore, Job, JobStatus},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::registry;

enum Invocation {
    Success(json::Value),
    Failure(String),
    Canceled,
    // a subprocess wrote the outcome itself
    Delegated,
}

/// One worker: owns its store and broker clients, loops acquiring jobs from
/// its queues and runs them on the configured executor.
pub struct Worker {
    pub id: String,
    queues: Vec<String>,
    store: Arc<dyn DataStore>,
    broker: Arc<dyn EventBroker>,
    running: Arc<DashMap<String, CancellationToken>>,
}

impl Worker {
    pub async fn connect(backend: &Backend, queues: Vec<String>) -> Result<Self> {
        // workers never share clients with the queue manager
        let store: Arc<dyn DataStore> = Arc::from(store::connect(backend).await?);
        let broker: Arc<dyn EventBroker> = match backend.kind {
            config::meta::backend::BackendKind::Postgres => Arc::new(
                broker::postgres::PostgresBroker::from_pool(infra::db::postgres::connect(
                    &backend.uri,
                    Some(&backend.schema),
                )?)
                .await?,
            ),
            config::meta::backend::BackendKind::Redis => {
                Arc::new(broker::redis::RedisBroker::connect(backend).await?)
            }
            _ => Arc::new(broker::local::LocalBroker::new()),
        };
        Ok(Self {
            id: format!(
                "worker-{}",
                config::utils::rand::generate_random_string(8).to_lowercase()
            ),
            queues,
            store,
            broker,
            running: Arc::new(DashMap::new()),
        })
    }

    /// Test seam: share the manager's clients instead of opening new ones.
    pub fn with_clients(
        queues: Vec<String>,
        store: Arc<dyn DataStore>,
        broker: Arc<dyn EventBroker>,
    ) -> Self {
        Self {
            id: format!(
                "worker-{}",
                config::utils::rand::generate_random_string(8).to_lowercase()
            ),
            queues,
            store,
            broker,
            running: Arc::new(DashMap::new()),
        }
    }

    pub async fn run(self, token: CancellationToken) -> Result<()> {
        log::info!(
            "[WORKER] {} serving queues: {}",
            self.id,
            self.queues.join(", ")
        );

        // cancellation requests for running jobs arrive as events
        let mut sub = self.broker.subscribe(Some(EventType::JobCanceled)).await?;
        let running = self.running.clone();
        let listener_token = token.child_token();
        tokio::task::spawn(async move {
            loop {
                tokio::select! {
                    _ = listener_token.cancelled() => break,
                    event = sub.recv() => match event {
                        Some(event) => {
                            if let Some(job_token) = running.get(&event.entity_id) {
                                log::info!(
                                    "[WORKER] interrupting job {} on request",
                                    event.entity_id
                                );
                                job_token.cancel();
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        let cfg = config::get_config();
        let poll = Duration::from_millis(cfg.limit.worker_poll_interval_ms);
        let lease = seconds_to_micros(cfg.limit.job_lease_timeout);
        let mut offset = 0usize;
        loop {
            if token.is_cancelled() {
                break;
            }
            let mut claimed = false;
            for i in 0..self.queues.len() {
                let queue = &self.queues[(offset + i) % self.queues.len()];
                let acquire_token = config::ider::generate();
                match self
                    .store
                    .acquire_next(queue, &self.id, &acquire_token, lease)
                    .await
                {
                    Ok(Some(job)) => {
                        claimed = true;
                        self.publish(EventType::JobAcquired, &job.id, json::Map::new())
                            .await;
                        self.execute(job).await;
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        log::error!("[WORKER] {} acquire error on '{queue}': {e}", self.id);
                    }
                }
            }
            offset = offset.wrapping_add(1);
            if !claimed {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        }
        log::info!("[WORKER] {} exit", self.id);
        Ok(())
    }

    async fn execute(&self, job: Job) {
        // independent of the worker token: pool shutdown lets the running
        // job finish, only an explicit cancel request interrupts it
        let job_token = CancellationToken::new();
        self.running.insert(job.id.clone(), job_token.clone());
        let outcome = self.invoke(&job, job_token).await;
        self.running.remove(&job.id);

        match outcome {
            Invocation::Success(value) => {
                match self.store.complete_job(&job.id, value).await {
                    Ok(updated) => {
                        let mut payload = json::Map::new();
                        payload.insert(
                            "status".to_string(),
                            json::Value::from(updated.status.to_string()),
                        );
                        self.publish(EventType::JobCompleted, &job.id, payload).await;
                        log::info!("[WORKER] {} finished job {}", self.id, job.id);
                    }
                    Err(e) => {
                        log::error!("[WORKER] {} complete job {} error: {e}", self.id, job.id);
                    }
                }
            }
            Invocation::Failure(reason) => {
                match self.store.fail_job(&job.id, &reason).await {
                    Ok(updated) => {
                        let requeued = updated.status == JobStatus::Queued;
                        let mut payload = json::Map::new();
                        payload.insert("attempts".to_string(), json::Value::from(updated.attempts));
                        payload.insert("requeued".to_string(), json::Value::from(requeued));
                        self.publish(EventType::JobFailed, &job.id, payload).await;
                        if requeued {
                            log::warn!(
                                "[WORKER] {} job {} failed (attempt {}), requeued: {reason}",
                                self.id,
                                job.id,
                                updated.attempts
                            );
                        } else {
                            log::error!(
                                "[WORKER] {} job {} failed permanently: {reason}",
                                self.id,
                                job.id
                            );
                        }
                    }
                    Err(e) => {
                        log::error!("[WORKER] {} fail job {} error: {e}", self.id, job.id);
                    }
                }
            }
            Invocation::Canceled => {
                if let Err(e) = self.store.force_cancel(&job.id).await {
                    log::error!("[WORKER] {} cancel job {} error: {e}", self.id, job.id);
                }
                self.publish(EventType::JobCanceled, &job.id, json::Map::new())
                    .await;
                log::info!("[WORKER] {} job {} canceled while running", self.id, job.id);
            }
            Invocation::Delegated => {}
        }
    }

    async fn invoke(&self, job: &Job, token: CancellationToken) -> Invocation {
        if job.executor == JobExecutor::ProcessPool {
            return self.invoke_subprocess(job, token).await;
        }

        let f = match registry::resolve(&job.func) {
            Ok(f) => f,
            Err(e) => return Invocation::Failure(e.to_string()),
        };
        let args = job.args.clone();
        let kwargs = job.kwargs.clone();
        let lease = Duration::from_secs(config::get_config().limit.job_lease_timeout);

        let fut: futures::future::BoxFuture<'static, anyhow::Result<json::Value>> = match job
            .executor
        {
            JobExecutor::Async => f(args, kwargs, token.clone()),
            JobExecutor::ThreadPool => {
                let handle = tokio::runtime::Handle::current();
                let inner_token = token.clone();
                let task = tokio::task::spawn_blocking(move || {
                    handle.block_on(f(args, kwargs, inner_token))
                });
                Box::pin(async move {
                    match task.await {
                        Ok(ret) => ret,
                        Err(e) => Err(anyhow::anyhow!("blocking task panicked: {e}")),
                    }
                })
            }
            JobExecutor::ProcessPool => unreachable!(),
        };

        tokio::select! {
            _ = token.cancelled() => Invocation::Canceled,
            ret = tokio::time::timeout(lease, fut) => match ret {
                Ok(Ok(value)) => Invocation::Success(value),
                Ok(Err(e)) => Invocation::Failure(e.to_string()),
                Err(_) => Invocation::Failure(Error::LeaseExpired(job.id.clone()).to_string()),
            },
        }
    }

    /// Fresh process with explicit argument passing; the child resolves the
    /// function from its own registry and writes the outcome itself.
    async fn invoke_subprocess(&self, job: &Job, token: CancellationToken) -> Invocation {
        let exe = match std::env::current_exe() {
            Ok(exe) => exe,
            Err(e) => return Invocation::Failure(format!("current_exe error: {e}")),
        };
        let mut child = match tokio::process::Command::new(exe)
            .arg("exec-job")
            .arg("--id")
            .arg(&job.id)
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return Invocation::Failure(format!("spawn error: {e}")),
        };
        let lease = Duration::from_secs(config::get_config().limit.job_lease_timeout);

        tokio::select! {
            _ = token.cancelled() => {
                if let Err(e) = child.start_kill() {
                    log::error!("[WORKER] kill subprocess error: {e}");
                }
                Invocation::Canceled
            }
            status = tokio::time::timeout(lease, child.wait()) => match status {
                Ok(Ok(status)) if status.success() => Invocation::Delegated,
                Ok(Ok(status)) => {
                    // only report the failure when the child did not
                    match self.store.get_job(&job.id).await {
                        Ok(Some(j)) if j.status == JobStatus::Started => {
                            Invocation::Failure(format!("subprocess exited with {status}"))
                        }
                        _ => Invocation::Delegated,
                    }
                }
                Ok(Err(e)) => Invocation::Failure(format!("subprocess wait error: {e}")),
                Err(_) => {
                    if let Err(e) = child.start_kill() {
                        log::error!("[WORKER] kill subprocess error: {e}");
                    }
                    Invocation::Failure("subprocess exceeded the job lease".to_string())
                }
            },
        }
    }

    async fn publish(
        &self,
        event_type: EventType,
        entity_id: &str,
        payload: json::Map<String, json::Value>,
    ) {
        let event = Event::new(event_type, entity_id).with_payload(payload);
        if let Err(e) = self.broker.publish(&event).await {
            log::error!("[WORKER] publish {} event error: {e}", event.event_type);
        }
    }
}

/// Runs one already-claimed job to completion in this process; entry point
/// of the hidden `exec-job` subcommand used by the process-pool executor.
pub async fn execute_single(job_id: &str) -> Result<()> {
    let backend = Backend::from_config()?;
    let store: Arc<dyn DataStore> = Arc::from(store::connect(&backend).await?);
    let job = store
        .get_job(job_id)
        .await?
        .ok_or_else(|| Error::NotFound(job_id.to_string()))?;
    let f = registry::resolve(&job.func)?;
    match f(job.args.clone(), job.kwargs.clone(), CancellationToken::new()).await {
        Ok(value) => {
            store.complete_job(job_id, value).await?;
        }
        Err(e) => {
            store.fail_job(job_id, &e.to_string()).await?;
        }
    }
    Ok(())
}

/// Supervised set of workers: restarts crashed ones, shuts down
/// cooperatively and escalates to abort after the configured timeout.
pub struct WorkerPool {
    token: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
}

impl WorkerPool {
    pub async fn start(backend: Backend, num_workers: usize, queues: Vec<String>) -> Result<Self> {
        // readiness probe before reporting the pool as started
        store::connect(&backend).await?.close().await?;

        let token = CancellationToken::new();
        let supervisor = tokio::task::spawn(supervise(
            backend,
            num_workers,
            queues,
            token.clone(),
        ));
        Ok(Self {
            token,
            supervisor: Some(supervisor),
        })
    }

    /// Block until the pool shuts down.
    pub async fn wait(&mut self) {
        if let Some(handle) = self.supervisor.as_mut() {
            if let Err(e) = handle.await {
                log::error!("[WORKER] supervisor join error: {e}");
            }
            self.supervisor = None;
        }
    }

    pub async fn stop(mut self) {
        self.token.cancel();
        self.wait().await;
    }
}

fn spawn_worker(
    backend: Backend,
    queues: Vec<String>,
    token: CancellationToken,
) -> JoinHandle<Result<()>> {
    tokio::task::spawn(async move {
        let worker = Worker::connect(&backend, queues).await?;
        worker.run(token).await
    })
}

async fn supervise(
    backend: Backend,
    num_workers: usize,
    queues: Vec<String>,
    token: CancellationToken,
) {
    let cfg = config::get_config();
    let mut handles: Vec<JoinHandle<Result<()>>> = (0..num_workers)
        .map(|_| spawn_worker(backend.clone(), queues.clone(), token.child_token()))
        .collect();

    let mut check = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = check.tick() => {
                for handle in handles.iter_mut() {
                    if !handle.is_finished() {
                        continue;
                    }
                    match (&mut *handle).await {
                        Ok(Ok(())) => continue, // clean exit
                        Ok(Err(e)) => {
                            log::error!("[WORKER] worker exited with error, restarting: {e}");
                        }
                        Err(e) => {
                            log::error!(
                                "[WORKER] worker crashed, restarting: {}",
                                Error::WorkerCrashed(e.to_string())
                            );
                        }
                    }
                    *handle = spawn_worker(backend.clone(), queues.clone(), token.child_token());
                }
            }
        }
    }

    // cooperative shutdown first, abort after the timeout
    let deadline = Duration::from_secs(cfg.worker.shutdown_timeout);
    let joined = tokio::time::timeout(
        deadline,
        futures::future::join_all(handles.iter_mut()),
    )
    .await;
    if joined.is_err() {
        log::warn!(
            "[WORKER] workers did not stop within {}s, aborting",
            cfg.worker.shutdown_timeout
        );
        for handle in &handles {
            handle.abort();
        }
    }
    log::info!("[WORKER] pool supervisor exit");
}

#[cfg(test)]
mod tests {
    use infra::{
        broker::local::LocalBroker,
        store::{FunctionRef, RetryPolicy},
    };

    use super::*;

    fn setup_clients() -> (Arc<dyn DataStore>, Arc<dyn EventBroker>) {
        let store: Arc<dyn DataStore> = Arc::new(infra::store::memory::MemoryStore::isolated());
        let broker: Arc<dyn EventBroker> = Arc::new(LocalBroker::new());
        (store, broker)
    }

    fn register_test_functions() {
        registry::register("worker_tests", "add", |args, _kwargs, _token| {
            Box::pin(async move {
                let sum: i64 = args.iter().filter_map(|a| a.as_i64()).sum();
                Ok(json::json!(sum))
            })
        });
        registry::register("worker_tests", "explode", |_args, _kwargs, _token| {
            Box::pin(async { Err(anyhow::anyhow!("boom")) })
        });
    }

    async fn queued_job(store: &Arc<dyn DataStore>, func: &str, retry: RetryPolicy) -> Job {
        let mut job = Job::new(FunctionRef::new("worker_tests", func), "default");
        job.args = vec![json::json!(2), json::json!(3)];
        job.result_ttl = 60_000_000;
        job.retry = retry;
        store.put_job(&job, false).await.unwrap();
        job
    }

    #[tokio::test]
    async fn test_worker_executes_job() {
        register_test_functions();
        let (store, broker) = setup_clients();
        let job = queued_job(&store, "add", RetryPolicy::default()).await;

        let worker =
            Worker::with_clients(vec!["default".to_string()], store.clone(), broker.clone());
        let token = CancellationToken::new();
        let run_token = token.clone();
        let handle = tokio::spawn(async move { worker.run(run_token).await });

        let mut done = None;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let current = store.get_job(&job.id).await.unwrap().unwrap();
            if current.status == JobStatus::Finished {
                done = Some(current);
                break;
            }
        }
        token.cancel();
        handle.await.unwrap().unwrap();

        let done = done.expect("job did not finish in time");
        assert_eq!(done.status, JobStatus::Finished);
        assert_eq!(store.get_result(&job.id).await.unwrap(), Some(json::json!(5)));
    }

    #[tokio::test]
    async fn test_worker_retries_then_fails() {
        register_test_functions();
        let (store, broker) = setup_clients();
        let job = queued_job(&store, "explode", RetryPolicy { max: 1, delay: 0 }).await;

        let worker =
            Worker::with_clients(vec!["default".to_string()], store.clone(), broker.clone());
        let token = CancellationToken::new();
        let run_token = token.clone();
        let handle = tokio::spawn(async move { worker.run(run_token).await });

        let mut failed = None;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let current = store.get_job(&job.id).await.unwrap().unwrap();
            if current.status == JobStatus::Failed {
                failed = Some(current);
                break;
            }
        }
        token.cancel();
        handle.await.unwrap().unwrap();

        let failed = failed.expect("job did not fail in time");
        assert_eq!(failed.attempts, 2);
        assert_eq!(failed.failure.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_unregistered_function_fails_job() {
        let (store, broker) = setup_clients();
        let mut job = Job::new(FunctionRef::new("nowhere", "missing"), "default");
        job.retry = RetryPolicy::default();
        store.put_job(&job, false).await.unwrap();

        let worker =
            Worker::with_clients(vec!["default".to_string()], store.clone(), broker.clone());
        let token = CancellationToken::new();
        let run_token = token.clone();
        let handle = tokio::spawn(async move { worker.run(run_token).await });

        let mut status = JobStatus::Queued;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            status = store.get_job(&job.id).await.unwrap().unwrap().status;
            if status == JobStatus::Failed {
                break;
            }
        }
        token.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(status, JobStatus::Failed);
        let failure = store.get_job(&job.id).await.unwrap().unwrap().failure.unwrap();
        assert!(failure.contains("FunctionNotRegistered"));
    }

    #[tokio::test]
    async fn test_canceled_job_never_starts() {
        register_test_functions();
        let (store, broker) = setup_clients();
        let job = queued_job(&store, "add", RetryPolicy::default()).await;
        // cancel before any worker runs
        store.cancel_job(&job.id).await.unwrap();

        let worker =
            Worker::with_clients(vec!["default".to_string()], store.clone(), broker.clone());
        let token = CancellationToken::new();
        let run_token = token.clone();
        let handle = tokio::spawn(async move { worker.run(run_token).await });

        tokio::time::sleep(Duration::from_millis(300)).await;
        token.cancel();
        handle.await.unwrap().unwrap();

        let current = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(current.status, JobStatus::Canceled);
        assert!(current.started_at.is_none());
    }
}

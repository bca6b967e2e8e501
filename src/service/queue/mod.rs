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

use std::{future::Future, sync::Arc, time::Duration};

use config::{meta::backend::BackendKind, utils::json, utils::time::now_micros};
use infra::{
    backend::{Backend, JobExecutor},
    broker::{self, Event, EventBroker, EventType},
    errors::{Error, Result},
    store::{
        self, CancelOutcome, CoalescePolicy, ConflictPolicy, DataStore, FunctionRef, Job,
        JobStatus, RepeatPolicy, RetryPolicy, Schedule, StoreOp,
    },
    trigger::{IntervalTrigger, Trigger},
};
use rand::Rng;
use tokio::sync::Mutex;

use crate::service::worker::WorkerPool;

mod selector;

pub use selector::ResultSelector;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default)]
pub struct AddJobOptions {
    pub args: Vec<json::Value>,
    pub kwargs: json::Map<String, json::Value>,
    pub job_id: Option<String>,
    pub result_ttl: Option<Duration>,
    pub ttl: Option<Duration>,
    pub queue: Option<String>,
    // unix micros; mutually exclusive with run_in
    pub run_at: Option<i64>,
    pub run_in: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    pub repeat: Option<RepeatPolicy>,
    pub executor: Option<JobExecutor>,
}

#[derive(Debug, Clone, Default)]
pub struct AddScheduleOptions {
    pub args: Vec<json::Value>,
    pub kwargs: json::Map<String, json::Value>,
    pub schedule_id: Option<String>,
    // reuse the `{name}-1` base id instead of numbering a successor
    pub overwrite: bool,
    pub queue: Option<String>,
    pub executor: Option<JobExecutor>,
    pub coalesce: Option<CoalescePolicy>,
    pub misfire_grace_time: Option<Duration>,
    pub max_jitter: Option<Duration>,
    pub max_running_jobs: Option<u32>,
    pub conflict_policy: Option<ConflictPolicy>,
    pub paused: bool,
    pub result_ttl: Option<Duration>,
}

/// Exactly one way of saying when a schedule fires.
#[derive(Debug, Clone)]
pub enum TriggerSpec {
    Trigger(Trigger),
    Cron(String),
    Interval(Duration),
    Date(i64),
}

impl TriggerSpec {
    fn into_trigger(self) -> Result<Trigger> {
        match self {
            TriggerSpec::Trigger(t) => Ok(t),
            TriggerSpec::Cron(expr) => Trigger::cron(&expr, None, None, None),
            TriggerSpec::Interval(d) => Trigger::interval(IntervalTrigger {
                seconds: d.as_secs() as i64,
                microseconds: d.subsec_micros() as i64,
                start: now_micros(),
                ..Default::default()
            }),
            TriggerSpec::Date(run_at) => Ok(Trigger::date(run_at)),
        }
    }
}

/// Façade over one backend deployment: enqueue, schedule, introspect and
/// mutate jobs and schedules, and control the worker pool. Thread safe, all
/// state lives in the data store.
pub struct QueueManager {
    backend: Backend,
    store: Arc<dyn DataStore>,
    broker: Arc<dyn EventBroker>,
    queues: Vec<String>,
    pool: Mutex<Option<WorkerPool>>,
    scheduler: Mutex<Option<tokio_util::sync::CancellationToken>>,
}

impl QueueManager {
    pub async fn new(backend: Backend) -> Result<Self> {
        let cfg = config::get_config();

        // redis is the fused case: its broker publishes on the store's
        // connection, so both are wired together here
        let (store, fused_broker): (Arc<dyn DataStore>, Option<Arc<dyn EventBroker>>) =
            if backend.kind == BackendKind::Redis {
                let store = infra::store::redis::RedisStore::connect(&backend).await?;
                store.create_table().await?;
                store.create_table_index().await?;
                let broker =
                    broker::redis::RedisBroker::from_store(&backend, store.connection())
                        .await?;
                (Arc::new(store), Some(Arc::new(broker)))
            } else {
                (Arc::from(store::connect(&backend).await?), None)
            };

        // explicit broker configuration wins, otherwise postgres shares the
        // data store's pool and everything else stays in-process
        let broker: Arc<dyn EventBroker> = if !cfg.backend.event_broker_type.is_empty() {
            let kind = BackendKind::from(cfg.backend.event_broker_type.as_str());
            let eb = Backend::for_event_broker(
                kind,
                infra::backend::BackendOptions {
                    uri: (!cfg.backend.event_broker_uri.is_empty())
                        .then(|| cfg.backend.event_broker_uri.clone()),
                    ..Default::default()
                },
            )?;
            Arc::from(broker::connect(&eb).await?)
        } else if let Some(fused) = fused_broker {
            fused
        } else {
            match backend.kind {
                BackendKind::Postgres => {
                    let pool = infra::db::postgres::connect(&backend.uri, Some(&backend.schema))?;
                    Arc::new(broker::postgres::PostgresBroker::from_pool(pool).await?)
                }
                _ => Arc::new(broker::local::LocalBroker::new()),
            }
        };

        Ok(Self {
            queues: backend.queues.clone(),
            backend,
            store,
            broker,
            pool: Mutex::new(None),
            scheduler: Mutex::new(None),
        })
    }

    pub async fn from_config() -> Result<Self> {
        Self::new(Backend::from_config()?).await
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn store(&self) -> Arc<dyn DataStore> {
        self.store.clone()
    }

    pub fn broker(&self) -> Arc<dyn EventBroker> {
        self.broker.clone()
    }

    /// Uniform random placement among configured queues; an unknown name
    /// falls back the same way, with a warning.
    fn resolve_queue(&self, queue: Option<&str>) -> String {
        match queue {
            Some(q) if self.queues.iter().any(|known| known == q) => q.to_string(),
            Some(q) => {
                let picked = self.random_queue();
                log::warn!("[QUEUE] queue '{q}' not found, using '{picked}'");
                picked
            }
            None => self.random_queue(),
        }
    }

    fn random_queue(&self) -> String {
        let idx = rand::thread_rng().gen_range(0..self.queues.len());
        self.queues[idx].clone()
    }

    async fn publish(&self, event_type: EventType, entity_id: &str, queue: Option<&str>) {
        let mut payload = json::Map::new();
        if let Some(queue) = queue {
            payload.insert("queue".to_string(), json::Value::from(queue));
        }
        let event = Event::new(event_type, entity_id).with_payload(payload);
        if let Err(e) = self.broker.publish(&event).await {
            log::error!("[QUEUE] publish {} event error: {}", event.event_type, e);
        }
    }

    // ------------------------------------------------------------------
    // enqueue / schedule
    // ------------------------------------------------------------------

    pub async fn add_job(&self, func: FunctionRef, opts: AddJobOptions) -> Result<String> {
        if opts.run_at.is_some() && opts.run_in.is_some() {
            return Err(Error::InvalidArgument(
                "run_at and run_in are mutually exclusive".to_string(),
            ));
        }
        let cfg = config::get_config();
        let queue = self.resolve_queue(opts.queue.as_deref());

        let mut job = Job::new(func.clone(), &queue);
        if let Some(id) = opts.job_id {
            job.id = id;
        }
        job.args = opts.args;
        job.kwargs = opts.kwargs;
        job.result_ttl = opts
            .result_ttl
            .map(|d| d.as_micros() as i64)
            .unwrap_or_else(|| {
                config::utils::time::seconds_to_micros(cfg.worker.result_ttl)
            });
        job.job_ttl = opts.ttl.map(|d| d.as_micros() as i64).unwrap_or(0);
        job.scheduled_at = match (opts.run_at, opts.run_in) {
            (Some(at), _) => Some(at),
            (_, Some(delay)) => Some(now_micros() + delay.as_micros() as i64),
            _ => None,
        };
        job.retry = opts.retry.unwrap_or_default();
        job.repeat = opts.repeat.unwrap_or_default();
        job.executor = opts
            .executor
            .unwrap_or(self.backend.default_job_executor);

        let store = self.store.clone();
        let stored = job.clone();
        retry_transient(move || {
            let store = store.clone();
            let job = stored.clone();
            async move { store.put_job(&job, false).await }
        })
        .await?;

        self.publish(EventType::JobEnqueued, &job.id, Some(&queue)).await;
        log::info!(
            "[QUEUE] enqueued job {} ({}) on queue '{}'",
            job.id,
            func,
            queue
        );
        Ok(job.id)
    }

    /// Enqueue and block until the job finishes, bounded by its ttl.
    pub async fn run_job(&self, func: FunctionRef, opts: AddJobOptions) -> Result<json::Value> {
        let cfg = config::get_config();
        let wait = opts
            .ttl
            .unwrap_or(Duration::from_secs(cfg.limit.job_timeout));
        let mut opts = opts;
        if opts.result_ttl.is_none() {
            opts.result_ttl = Some(Duration::from_secs(cfg.worker.result_ttl.max(60)));
        }
        let id = self.add_job(func, opts).await?;
        match self.get_job_result(&id, Some(wait), false).await? {
            Some(value) => Ok(value),
            None => Err(Error::JobTimedOut(id)),
        }
    }

    pub async fn add_schedule(
        &self,
        func: FunctionRef,
        trigger: TriggerSpec,
        opts: AddScheduleOptions,
    ) -> Result<String> {
        let trigger = trigger.into_trigger()?;
        let queue = self.resolve_queue(opts.queue.as_deref());

        let id = match &opts.schedule_id {
            Some(id) => id.clone(),
            None => self.next_schedule_id(&func.name, opts.overwrite).await?,
        };

        let mut schedule = Schedule::new(func.clone(), trigger, &queue);
        schedule.id = id.clone();
        schedule.args = opts.args;
        schedule.kwargs = opts.kwargs;
        schedule.coalesce = opts.coalesce.unwrap_or_default();
        schedule.misfire_grace = opts
            .misfire_grace_time
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        schedule.max_jitter = opts.max_jitter.map(|d| d.as_micros() as i64).unwrap_or(0);
        schedule.max_running_jobs = opts.max_running_jobs.unwrap_or(0);
        schedule.paused = opts.paused;
        schedule.result_ttl = opts
            .result_ttl
            .map(|d| d.as_micros() as i64)
            .unwrap_or_else(|| {
                config::utils::time::seconds_to_micros(config::get_config().worker.result_ttl)
            });
        schedule.executor = opts
            .executor
            .unwrap_or(self.backend.default_job_executor);

        let conflict = opts.conflict_policy.unwrap_or(if opts.overwrite {
            ConflictPolicy::Replace
        } else {
            ConflictPolicy::DoNothing
        });

        let store = self.store.clone();
        let stored = schedule.clone();
        let id = retry_transient(move || {
            let store = store.clone();
            let schedule = stored.clone();
            async move { store.put_schedule(&schedule, conflict).await }
        })
        .await?;

        self.publish(EventType::ScheduleAdded, &id, Some(&queue)).await;
        log::info!(
            "[QUEUE] scheduled {} ({}) on queue '{}' with {} trigger",
            id,
            func,
            queue,
            schedule.trigger.kind_str()
        );
        Ok(id)
    }

    /// Successor id for an unnamed schedule: `{name}-1`, `{name}-2`, ...
    /// With overwrite the base id is reused.
    async fn next_schedule_id(&self, name: &str, overwrite: bool) -> Result<String> {
        let base = format!("{name}-1");
        if overwrite {
            return Ok(base);
        }
        let prefix = format!("{name}-");
        let mut max_num = 0u32;
        let mut seen = false;
        for schedule in self.store.list_schedules(None).await? {
            if let Some(n) = schedule.id.strip_prefix(&prefix) {
                seen = true;
                match n.parse::<u32>() {
                    Ok(n) => max_num = max_num.max(n),
                    Err(_) => {
                        log::warn!(
                            "[QUEUE] could not parse number from schedule id: {}",
                            schedule.id
                        );
                    }
                }
            }
        }
        if !seen {
            return Ok(base);
        }
        Ok(format!("{name}-{}", max_num + 1))
    }

    // ------------------------------------------------------------------
    // introspection
    // ------------------------------------------------------------------

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        self.store.get_job(id).await
    }

    pub async fn get_jobs(&self, queue: Option<&str>) -> Result<Vec<Job>> {
        self.store.list_jobs(queue).await
    }

    pub async fn job_ids(&self, queue: Option<&str>) -> Result<Vec<String>> {
        Ok(self
            .get_jobs(queue)
            .await?
            .into_iter()
            .map(|j| j.id)
            .collect())
    }

    /// Unknown ids are NotFound; a known but unfinished job is Ok(None).
    /// With `wait` the call blocks (polling) until the result lands, the job
    /// fails, or the deadline passes.
    pub async fn get_job_result(
        &self,
        id: &str,
        wait: Option<Duration>,
        delete_after: bool,
    ) -> Result<Option<json::Value>> {
        let deadline = wait.map(|d| tokio::time::Instant::now() + d);
        loop {
            if let Some(value) = self.store.get_result(id).await? {
                if delete_after {
                    self.store.delete_result(id).await?;
                }
                return Ok(Some(value));
            }
            let job = self
                .store
                .get_job(id)
                .await?
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            match job.status {
                JobStatus::Failed => {
                    return Err(Error::Message(
                        job.failure.unwrap_or_else(|| "job failed".to_string()),
                    ));
                }
                JobStatus::Canceled => {
                    return Err(Error::Message(format!("job {id} was canceled")));
                }
                JobStatus::Finished => {
                    // result expired or was never kept
                    return Err(Error::NotFound(format!("result of job {id}")));
                }
                _ => {}
            }
            let Some(deadline) = deadline else {
                return Ok(None);
            };
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::JobTimedOut(id.to_string()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    pub async fn get_schedule(&self, id: &str) -> Result<Option<Schedule>> {
        self.store.get_schedule(id).await
    }

    pub async fn get_schedules(&self, queue: Option<&str>) -> Result<Vec<Schedule>> {
        self.store.list_schedules(queue).await
    }

    pub async fn schedule_ids(&self, queue: Option<&str>) -> Result<Vec<String>> {
        Ok(self
            .get_schedules(queue)
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect())
    }

    /// Results of the jobs a schedule has produced, oldest first, narrowed by
    /// the selector.
    pub async fn schedule_results(
        &self,
        id: &str,
        selector: ResultSelector,
    ) -> Result<Vec<json::Value>> {
        if self.store.get_schedule(id).await?.is_none() {
            return Err(Error::NotFound(id.to_string()));
        }
        let mut jobs: Vec<Job> = self
            .store
            .list_jobs(None)
            .await?
            .into_iter()
            .filter(|j| j.schedule_id.as_deref() == Some(id) && j.result.is_some())
            .collect();
        jobs.sort_by_key(|j| j.finished_at.unwrap_or(j.enqueued_at));
        let results: Vec<json::Value> = jobs.into_iter().filter_map(|j| j.result).collect();
        Ok(selector.apply(results))
    }

    pub async fn schedule_latest_result(&self, id: &str) -> Result<Option<json::Value>> {
        Ok(self
            .schedule_results(id, ResultSelector::Latest)
            .await?
            .pop())
    }

    // ------------------------------------------------------------------
    // lifecycle mutations
    // ------------------------------------------------------------------

    /// Queued and deferred jobs are canceled atomically at the store; a
    /// running job gets a cooperative interrupt via the JobCanceled event.
    pub async fn cancel_job(&self, id: &str) -> Result<bool> {
        match self.store.cancel_job(id).await? {
            CancelOutcome::Canceled => {
                self.publish(EventType::JobCanceled, id, None).await;
                log::info!("[QUEUE] canceled job {id}");
                Ok(true)
            }
            CancelOutcome::Running => {
                self.publish(EventType::JobCanceled, id, None).await;
                log::info!("[QUEUE] requested cancellation of running job {id}");
                Ok(true)
            }
            CancelOutcome::NotFound => {
                log::info!("[QUEUE] cancel_job: job {id} not found");
                Ok(false)
            }
            CancelOutcome::Terminal => Err(Error::IllegalTransition {
                entity: "job",
                id: id.to_string(),
                from: "terminal".to_string(),
                to: "canceled".to_string(),
            }),
        }
    }

    pub async fn cancel_all_jobs(&self, queue: Option<&str>) -> Result<u64> {
        let mut canceled = 0;
        for job in self.store.list_jobs(queue).await? {
            if job.status.is_terminal() {
                continue;
            }
            if self.cancel_job(&job.id).await.unwrap_or(false) {
                canceled += 1;
            }
        }
        log::info!("[QUEUE] canceled {canceled} jobs");
        Ok(canceled)
    }

    pub async fn delete_job(&self, id: &str, ttl: Option<Duration>) -> Result<bool> {
        let ttl = ttl.map(|d| d.as_micros() as i64).unwrap_or(0);
        self.store.delete_job(id, ttl).await
    }

    pub async fn delete_all_jobs(&self, queue: Option<&str>) -> Result<u64> {
        let mut deleted = 0;
        for job in self.store.list_jobs(queue).await? {
            if self.store.delete_job(&job.id, 0).await? {
                deleted += 1;
            }
        }
        log::info!("[QUEUE] deleted {deleted} jobs");
        Ok(deleted)
    }

    pub async fn pause_schedule(&self, id: &str) -> Result<bool> {
        if !self.store.supports(StoreOp::PauseSchedule) {
            log::info!(
                "[QUEUE] pause_schedule is not supported by the {} backend",
                self.backend.kind
            );
            return Ok(false);
        }
        self.store.set_schedule_paused(id, true).await
    }

    pub async fn resume_schedule(&self, id: &str) -> Result<bool> {
        if !self.store.supports(StoreOp::ResumeSchedule) {
            log::info!(
                "[QUEUE] resume_schedule is not supported by the {} backend",
                self.backend.kind
            );
            return Ok(false);
        }
        self.store.set_schedule_paused(id, false).await
    }

    pub async fn pause_all_schedules(&self) -> Result<u64> {
        let mut paused = 0;
        for id in self.schedule_ids(None).await? {
            if self.pause_schedule(&id).await? {
                paused += 1;
            }
        }
        Ok(paused)
    }

    pub async fn resume_all_schedules(&self) -> Result<u64> {
        let mut resumed = 0;
        for id in self.schedule_ids(None).await? {
            if self.resume_schedule(&id).await? {
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    pub async fn cancel_schedule(&self, id: &str) -> Result<bool> {
        let removed = self.store.delete_schedule(id).await?;
        if removed {
            self.publish(EventType::ScheduleRemoved, id, None).await;
            log::info!("[QUEUE] canceled schedule {id}");
        } else {
            log::info!("[QUEUE] cancel_schedule: schedule {id} not found");
        }
        Ok(removed)
    }

    pub async fn cancel_all_schedules(&self) -> Result<u64> {
        let mut canceled = 0;
        for id in self.schedule_ids(None).await? {
            if self.cancel_schedule(&id).await? {
                canceled += 1;
            }
        }
        Ok(canceled)
    }

    pub async fn delete_schedule(&self, id: &str) -> Result<bool> {
        self.cancel_schedule(id).await
    }

    pub async fn delete_all_schedules(&self) -> Result<u64> {
        self.cancel_all_schedules().await
    }

    // ------------------------------------------------------------------
    // worker control
    // ------------------------------------------------------------------

    fn worker_queues(&self, queue_names: Option<Vec<String>>) -> Vec<String> {
        match queue_names {
            None => self.queues.clone(),
            Some(names) => {
                let valid: Vec<String> = names
                    .into_iter()
                    .filter(|q| {
                        if self.queues.contains(q) {
                            true
                        } else {
                            log::warn!("[QUEUE] queue '{q}' not found, skipping");
                            false
                        }
                    })
                    .collect();
                valid
            }
        }
    }

    /// One worker. Foreground blocks the caller until shutdown; background
    /// returns once the pool is running.
    pub async fn start_worker(
        &self,
        background: bool,
        queue_names: Option<Vec<String>>,
    ) -> Result<()> {
        self.start_worker_pool(Some(1), background, queue_names).await
    }

    pub async fn start_worker_pool(
        &self,
        num_workers: Option<usize>,
        background: bool,
        queue_names: Option<Vec<String>>,
    ) -> Result<()> {
        let cfg = config::get_config();
        let num_workers = num_workers.unwrap_or_else(|| {
            if cfg.worker.num_workers > 0 {
                cfg.worker.num_workers
            } else {
                num_cpus()
            }
        });
        let queues = self.worker_queues(queue_names);
        if queues.is_empty() {
            log::error!("[QUEUE] no valid queues specified, cannot start worker pool");
            return Err(Error::InvalidArgument("no valid queues".to_string()));
        }

        self.start_scheduler().await?;

        let mut guard = self.pool.lock().await;
        if guard.is_some() {
            return Err(Error::InvalidArgument(
                "worker pool already running".to_string(),
            ));
        }
        let mut pool =
            WorkerPool::start(self.backend.clone(), num_workers, queues.clone()).await?;
        log::info!(
            "[QUEUE] worker pool started with {} workers across queues: {}",
            num_workers,
            queues.join(", ")
        );
        if background {
            *guard = Some(pool);
            return Ok(());
        }
        drop(guard);
        pool.wait().await;
        Ok(())
    }

    pub async fn stop_worker(&self) -> Result<()> {
        self.stop_worker_pool().await
    }

    pub async fn stop_worker_pool(&self) -> Result<()> {
        let pool = self.pool.lock().await.take();
        match pool {
            Some(pool) => {
                log::info!("[QUEUE] stopping worker pool");
                pool.stop().await;
                Ok(())
            }
            None => {
                log::warn!("[QUEUE] no worker pool to stop");
                Ok(())
            }
        }
    }

    /// One supervised scheduler loop per manager, idempotent.
    pub async fn start_scheduler(&self) -> Result<()> {
        let mut guard = self.scheduler.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let token = tokio_util::sync::CancellationToken::new();
        tokio::task::spawn(crate::service::scheduler::run(
            self.store.clone(),
            self.broker.clone(),
            self.backend.cleanup_interval,
            token.clone(),
        ));
        *guard = Some(token);
        Ok(())
    }

    pub async fn stop_scheduler(&self) {
        if let Some(token) = self.scheduler.lock().await.take() {
            token.cancel();
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.stop_worker_pool().await?;
        self.stop_scheduler().await;
        self.broker.close().await?;
        self.store.close().await?;
        Ok(())
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Bounded retry for transient backend failures: 100ms, 400ms, 1600ms, then
/// BackendUnavailable.
async fn retry_transient<T, F, Fut>(mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = Duration::from_millis(100);
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < 3 => {
                log::warn!("[QUEUE] transient backend error (attempt {attempt}): {e}");
                tokio::time::sleep(delay).await;
                delay *= 4;
                attempt += 1;
            }
            Err(e) if e.is_transient() => {
                return Err(Error::BackendUnavailable(e.to_string()));
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_manager() -> QueueManager {
        let backend = Backend::for_data_store(
            BackendKind::Memory,
            infra::backend::BackendOptions::default(),
        )
        .unwrap();
        QueueManager::new(backend).await.unwrap()
    }

    #[tokio::test]
    async fn test_add_job_and_introspect() {
        let manager = memory_manager().await;
        let id = manager
            .add_job(
                FunctionRef::new("flowerpower", "noop"),
                AddJobOptions::default(),
            )
            .await
            .unwrap();
        let job = manager.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(manager.job_ids(None).await.unwrap().contains(&id));
    }

    #[tokio::test]
    async fn test_run_at_and_run_in_exclusive() {
        let manager = memory_manager().await;
        let err = manager
            .add_job(
                FunctionRef::new("flowerpower", "noop"),
                AddJobOptions {
                    run_at: Some(now_micros() + 1_000_000),
                    run_in: Some(Duration::from_secs(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_future_job_is_deferred() {
        let manager = memory_manager().await;
        let id = manager
            .add_job(
                FunctionRef::new("flowerpower", "noop"),
                AddJobOptions {
                    run_in: Some(Duration::from_secs(60)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let job = manager.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Deferred);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let manager = memory_manager().await;
        let id = manager
            .add_job(
                FunctionRef::new("flowerpower", "noop"),
                AddJobOptions::default(),
            )
            .await
            .unwrap();
        assert!(manager.cancel_job(&id).await.unwrap());
        let job = manager.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
        // unknown id reports false
        assert!(!manager.cancel_job("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_job_result_disambiguates() {
        let manager = memory_manager().await;
        let id = manager
            .add_job(
                FunctionRef::new("flowerpower", "noop"),
                AddJobOptions::default(),
            )
            .await
            .unwrap();
        // known but unfinished
        assert_eq!(manager.get_job_result(&id, None, false).await.unwrap(), None);
        // unknown id
        assert!(matches!(
            manager.get_job_result("missing", None, false).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_schedule_id_successors() {
        let manager = memory_manager().await;
        let func = FunctionRef::new("flowerpower", "nightly");
        let first = manager
            .add_schedule(
                func.clone(),
                TriggerSpec::Cron("*/5 * * * *".to_string()),
                AddScheduleOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(first, "nightly-1");
        let second = manager
            .add_schedule(
                func.clone(),
                TriggerSpec::Cron("*/5 * * * *".to_string()),
                AddScheduleOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(second, "nightly-2");
        // overwrite reuses the base id
        let replaced = manager
            .add_schedule(
                func,
                TriggerSpec::Cron("*/10 * * * *".to_string()),
                AddScheduleOptions {
                    overwrite: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(replaced, "nightly-1");
    }

    #[tokio::test]
    async fn test_pause_resume_schedule() {
        let manager = memory_manager().await;
        let id = manager
            .add_schedule(
                FunctionRef::new("flowerpower", "noop"),
                TriggerSpec::Cron("*/5 * * * *".to_string()),
                AddScheduleOptions {
                    schedule_id: Some("pause-toggle".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(manager.pause_schedule(&id).await.unwrap());
        assert!(manager.get_schedule(&id).await.unwrap().unwrap().paused);
        assert!(manager.resume_schedule(&id).await.unwrap());
        assert!(!manager.get_schedule(&id).await.unwrap().unwrap().paused);
    }

    #[tokio::test]
    async fn test_random_placement_fairness() {
        // two queues, 1000 jobs, each side should get 450..=550
        let mut backend = Backend::for_data_store(
            BackendKind::Memory,
            infra::backend::BackendOptions::default(),
        )
        .unwrap();
        backend.queues = vec!["fast".to_string(), "slow".to_string()];
        let manager = QueueManager::new(backend).await.unwrap();
        for _ in 0..1000 {
            manager
                .add_job(
                    FunctionRef::new("flowerpower", "noop"),
                    AddJobOptions::default(),
                )
                .await
                .unwrap();
        }
        let fast = manager.get_jobs(Some("fast")).await.unwrap().len();
        let slow = manager.get_jobs(Some("slow")).await.unwrap().len();
        assert_eq!(fast + slow, 1000);
        assert!((450..=550).contains(&fast), "fast got {fast}");
        assert!((450..=550).contains(&slow), "slow got {slow}");
    }
}

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

use async_trait::async_trait;
use config::{meta::backend::BackendKind, utils::json};
use serde::{Deserialize, Serialize};

use crate::{
    backend::{Backend, JobExecutor},
    errors::{Error, Result},
    trigger::Trigger,
};

pub mod memory;
pub mod mongo;
pub mod mysql;
pub mod postgres;
pub mod redis;
pub mod sqlite;

/// `(module path, symbol name)` pair resolved by the worker through the
/// process-wide function registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct FunctionRef {
    pub module: String,
    pub name: String,
}

impl FunctionRef {
    pub fn new(module: &str, name: &str) -> Self {
        Self {
            module: module.to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for FunctionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.module, self.name)
    }
}

impl std::str::FromStr for FunctionRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.rsplit_once(':') {
            Some((module, name)) if !module.is_empty() && !name.is_empty() => {
                Ok(Self::new(module, name))
            }
            _ => Err(Error::InvalidArgument(format!(
                "function reference must be 'module:name', got '{s}'"
            ))),
        }
    }
}

#[derive(
    Debug, Clone, Copy, sqlx::Type, PartialEq, Eq, Serialize, Deserialize, Default, Hash,
)]
#[repr(i32)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Queued,
    Deferred,
    Started,
    Finished,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Deferred => write!(f, "deferred"),
            JobStatus::Started => write!(f, "started"),
            JobStatus::Finished => write!(f, "finished"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Canceled => write!(f, "canceled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RetryPolicy {
    pub max: u32,
    // delay before a failed attempt is retried, in microseconds
    #[serde(default)]
    pub delay: i64,
}

impl From<u32> for RetryPolicy {
    fn from(max: u32) -> Self {
        Self { max, delay: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RepeatPolicy {
    pub max: u32,
    // delay between successful repeats, in microseconds
    #[serde(default)]
    pub delay: i64,
}

impl From<u32> for RepeatPolicy {
    fn from(max: u32) -> Self {
        Self { max, delay: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub func: FunctionRef,
    #[serde(default)]
    pub args: Vec<json::Value>,
    #[serde(default)]
    pub kwargs: json::Map<String, json::Value>,
    pub queue: String,
    #[serde(default)]
    pub status: JobStatus,
    pub enqueued_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
    // how long a finished result is kept, 0 keeps nothing; counts from
    // completion
    #[serde(default)]
    pub result_ttl: i64,
    // bound on the job lifetime counted from enqueue, 0 is unbounded
    #[serde(default)]
    pub job_ttl: i64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub repeat: RepeatPolicy,
    #[serde(default)]
    pub repeats_done: u32,
    #[serde(default)]
    pub executor: JobExecutor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquire_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_until: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purge_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_expires_at: Option<i64>,
}

impl Job {
    pub fn new(func: FunctionRef, queue: &str) -> Self {
        Self {
            id: config::ider::generate(),
            func,
            args: Vec::new(),
            kwargs: json::Map::new(),
            queue: queue.to_string(),
            status: JobStatus::Queued,
            enqueued_at: config::utils::time::now_micros(),
            scheduled_at: None,
            started_at: None,
            finished_at: None,
            result_ttl: 0,
            job_ttl: 0,
            retry: RetryPolicy::default(),
            attempts: 0,
            repeat: RepeatPolicy::default(),
            repeats_done: 0,
            executor: JobExecutor::default(),
            schedule_id: None,
            worker_id: None,
            acquire_token: None,
            failure: None,
            lease_until: None,
            purge_at: None,
            result: None,
            result_expires_at: None,
        }
    }

    /// Instant after which the job may be evicted regardless of state.
    pub fn ttl_expires_at(&self) -> Option<i64> {
        (self.job_ttl > 0).then(|| self.enqueued_at + self.job_ttl)
    }

    /// Jobs with a future fire time start out deferred.
    pub fn initial_status(&self) -> JobStatus {
        match self.scheduled_at {
            Some(at) if at > config::utils::time::now_micros() => JobStatus::Deferred,
            _ => JobStatus::Queued,
        }
    }
}

#[derive(Debug, Clone, Copy, sqlx::Type, PartialEq, Eq, Serialize, Deserialize, Default)]
#[repr(i32)]
#[serde(rename_all = "lowercase")]
pub enum CoalescePolicy {
    #[default]
    Latest,
    Earliest,
    All,
}

impl From<&str> for CoalescePolicy {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "earliest" => CoalescePolicy::Earliest,
            "all" => CoalescePolicy::All,
            _ => CoalescePolicy::Latest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    #[default]
    DoNothing,
    Replace,
    Update,
}

impl From<&str> for ConflictPolicy {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "replace" => ConflictPolicy::Replace,
            "update" => ConflictPolicy::Update,
            _ => ConflictPolicy::DoNothing,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub func: FunctionRef,
    #[serde(default)]
    pub args: Vec<json::Value>,
    #[serde(default)]
    pub kwargs: json::Map<String, json::Value>,
    pub trigger: Trigger,
    pub queue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_fire_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fire_at: Option<i64>,
    // how late a missed fire may still run, 0 means always
    #[serde(default)]
    pub misfire_grace: i64,
    #[serde(default)]
    pub max_jitter: i64,
    #[serde(default)]
    pub coalesce: CoalescePolicy,
    // concurrent jobs cap for this schedule, 0 is unlimited
    #[serde(default)]
    pub max_running_jobs: u32,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub result_ttl: i64,
    #[serde(default)]
    pub executor: JobExecutor,
    pub created_at: i64,
}

impl Schedule {
    pub fn new(func: FunctionRef, trigger: Trigger, queue: &str) -> Self {
        let now = config::utils::time::now();
        let next_fire_at = trigger.compute_next(now).map(|t| t.timestamp_micros());
        Self {
            id: config::ider::generate(),
            func,
            args: Vec::new(),
            kwargs: json::Map::new(),
            trigger,
            queue: queue.to_string(),
            next_fire_at,
            last_fire_at: None,
            misfire_grace: 0,
            max_jitter: 0,
            coalesce: CoalescePolicy::default(),
            max_running_jobs: 0,
            paused: false,
            result_ttl: 0,
            executor: JobExecutor::default(),
            created_at: now.timestamp_micros(),
        }
    }
}

/// Outcome of a cancel request; the caller decides how to treat a job that
/// is already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled,
    NotFound,
    Running,
    Terminal,
}

/// Operations a backend may not implement; the queue manager reports the gap
/// instead of failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    PauseSchedule,
    ResumeSchedule,
    DelayedDelete,
}

#[async_trait]
pub trait DataStore: Sync + Send + 'static {
    fn kind(&self) -> BackendKind;

    fn supports(&self, _op: StoreOp) -> bool {
        true
    }

    async fn create_table(&self) -> Result<()>;
    async fn create_table_index(&self) -> Result<()>;

    /// Store a job. Fails with DuplicateId when the id exists and overwrite
    /// was not requested.
    async fn put_job(&self, job: &Job, overwrite: bool) -> Result<()>;
    async fn get_job(&self, id: &str) -> Result<Option<Job>>;
    async fn list_jobs(&self, queue: Option<&str>) -> Result<Vec<Job>>;

    /// Atomically claim the next due job of `queue`: queued (or deferred and
    /// due) -> started, stamping the worker and a lease deadline. Re-issuing
    /// with the same `token` returns the same job.
    async fn acquire_next(
        &self,
        queue: &str,
        worker_id: &str,
        token: &str,
        lease_micros: i64,
    ) -> Result<Option<Job>>;

    /// started -> finished; persists the result for `result_ttl` and
    /// re-queues the job when its repeat policy has runs left.
    async fn complete_job(&self, id: &str, result: json::Value) -> Result<Job>;

    /// started -> failed, or back to queued (with the retry delay) while the
    /// retry policy is not exhausted.
    async fn fail_job(&self, id: &str, failure: &str) -> Result<Job>;

    /// Atomic for queued/deferred jobs; running jobs are reported as such so
    /// the caller can interrupt cooperatively.
    async fn cancel_job(&self, id: &str) -> Result<CancelOutcome>;

    /// started -> canceled, used by a worker that honored a cooperative
    /// interrupt. The retry policy does not apply.
    async fn force_cancel(&self, id: &str) -> Result<()>;

    /// Remove immediately when `ttl_micros` is zero, otherwise schedule the
    /// removal. Deleting an unknown id returns false.
    async fn delete_job(&self, id: &str, ttl_micros: i64) -> Result<bool>;

    /// None when the job is known but unfinished (or the result expired);
    /// NotFound when the id never existed.
    async fn get_result(&self, id: &str) -> Result<Option<json::Value>>;
    async fn delete_result(&self, id: &str) -> Result<bool>;

    /// Returns the id the schedule is stored under after applying the
    /// conflict policy.
    async fn put_schedule(&self, schedule: &Schedule, conflict: ConflictPolicy)
        -> Result<String>;
    async fn get_schedule(&self, id: &str) -> Result<Option<Schedule>>;
    async fn list_schedules(&self, queue: Option<&str>) -> Result<Vec<Schedule>>;
    async fn delete_schedule(&self, id: &str) -> Result<bool>;
    async fn set_schedule_paused(&self, id: &str, paused: bool) -> Result<bool>;

    /// Unpaused schedules with next_fire_at <= now.
    async fn due_schedules(&self, now_micros: i64) -> Result<Vec<Schedule>>;

    /// Advance the schedule after a fire; next_fire_at None means the
    /// trigger is exhausted and the caller removes the schedule.
    async fn record_schedule_fired(
        &self,
        id: &str,
        last_fire_at: i64,
        next_fire_at: Option<i64>,
    ) -> Result<()>;

    async fn running_jobs_for_schedule(&self, schedule_id: &str) -> Result<u32>;

    /// Maintenance pass: promote due deferred jobs, requeue expired leases,
    /// evict expired results, purge jobs past job_ttl or a delayed delete.
    async fn sweep(&self, now_micros: i64) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Opaque part of the SQL job row; everything the state machine never
/// touches lives here, serialized into the payload column.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct JobBody {
    pub func: FunctionRef,
    #[serde(default)]
    pub args: Vec<json::Value>,
    #[serde(default)]
    pub kwargs: json::Map<String, json::Value>,
    #[serde(default)]
    pub result_ttl: i64,
    #[serde(default)]
    pub job_ttl: i64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub repeat: RepeatPolicy,
    #[serde(default)]
    pub executor: JobExecutor,
    #[serde(default)]
    pub schedule_id: Option<String>,
}

impl From<&Job> for JobBody {
    fn from(job: &Job) -> Self {
        Self {
            func: job.func.clone(),
            args: job.args.clone(),
            kwargs: job.kwargs.clone(),
            result_ttl: job.result_ttl,
            job_ttl: job.job_ttl,
            retry: job.retry,
            repeat: job.repeat,
            executor: job.executor,
            schedule_id: job.schedule_id.clone(),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JobRow {
    pub id: String,
    pub queue: String,
    pub status: JobStatus,
    pub enqueued_at: i64,
    pub scheduled_at: Option<i64>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub attempts: i32,
    pub repeats_done: i32,
    pub worker_id: Option<String>,
    pub acquire_token: Option<String>,
    pub failure: Option<String>,
    pub lease_until: Option<i64>,
    pub purge_at: Option<i64>,
    pub payload: Vec<u8>,
    pub result: Option<Vec<u8>>,
    pub result_expires_at: Option<i64>,
}

impl JobRow {
    pub(crate) fn into_job(self) -> Result<Job> {
        let body: JobBody = json::from_slice(&self.payload)?;
        let result = match self.result {
            Some(bytes) => Some(json::from_slice(&bytes)?),
            None => None,
        };
        Ok(Job {
            id: self.id,
            func: body.func,
            args: body.args,
            kwargs: body.kwargs,
            queue: self.queue,
            status: self.status,
            enqueued_at: self.enqueued_at,
            scheduled_at: self.scheduled_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            result_ttl: body.result_ttl,
            job_ttl: body.job_ttl,
            retry: body.retry,
            attempts: self.attempts as u32,
            repeat: body.repeat,
            repeats_done: self.repeats_done as u32,
            executor: body.executor,
            schedule_id: body.schedule_id,
            worker_id: self.worker_id,
            acquire_token: self.acquire_token,
            failure: self.failure,
            lease_until: self.lease_until,
            purge_at: self.purge_at,
            result,
            result_expires_at: self.result_expires_at,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ScheduleBody {
    pub func: FunctionRef,
    #[serde(default)]
    pub args: Vec<json::Value>,
    #[serde(default)]
    pub kwargs: json::Map<String, json::Value>,
    #[serde(default)]
    pub misfire_grace: i64,
    #[serde(default)]
    pub max_jitter: i64,
    #[serde(default)]
    pub max_running_jobs: u32,
    #[serde(default)]
    pub result_ttl: i64,
    #[serde(default)]
    pub executor: JobExecutor,
    #[serde(default)]
    pub created_at: i64,
}

impl From<&Schedule> for ScheduleBody {
    fn from(s: &Schedule) -> Self {
        Self {
            func: s.func.clone(),
            args: s.args.clone(),
            kwargs: s.kwargs.clone(),
            misfire_grace: s.misfire_grace,
            max_jitter: s.max_jitter,
            max_running_jobs: s.max_running_jobs,
            result_ttl: s.result_ttl,
            executor: s.executor,
            created_at: s.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ScheduleRow {
    pub id: String,
    pub queue: String,
    pub trigger_payload: Vec<u8>,
    pub next_fire_at: Option<i64>,
    pub last_fire_at: Option<i64>,
    pub paused: bool,
    pub coalesce_policy: CoalescePolicy,
    pub payload: Vec<u8>,
}

impl ScheduleRow {
    pub(crate) fn into_schedule(self) -> Result<Schedule> {
        let body: ScheduleBody = json::from_slice(&self.payload)?;
        let trigger: Trigger = json::from_slice(&self.trigger_payload)?;
        Ok(Schedule {
            id: self.id,
            func: body.func,
            args: body.args,
            kwargs: body.kwargs,
            trigger,
            queue: self.queue,
            next_fire_at: self.next_fire_at,
            last_fire_at: self.last_fire_at,
            misfire_grace: body.misfire_grace,
            max_jitter: body.max_jitter,
            coalesce: self.coalesce_policy,
            max_running_jobs: body.max_running_jobs,
            paused: self.paused,
            result_ttl: body.result_ttl,
            executor: body.executor,
            created_at: body.created_at,
        })
    }
}

/// Open a data store for the descriptor and make sure its schema exists.
pub async fn connect(backend: &Backend) -> Result<Box<dyn DataStore>> {
    let store: Box<dyn DataStore> = match backend.kind {
        BackendKind::Postgres => Box::new(postgres::PostgresStore::new(backend)?),
        BackendKind::Mysql => Box::new(mysql::MysqlStore::new(backend)?),
        BackendKind::Sqlite => Box::new(sqlite::SqliteStore::new(backend)?),
        BackendKind::Mongodb => Box::new(mongo::MongoStore::connect(backend).await?),
        BackendKind::Redis => Box::new(redis::RedisStore::connect(backend).await?),
        BackendKind::Memory => Box::new(memory::MemoryStore::new()),
        kind => return Err(Error::InvalidBackendKind(kind.to_string())),
    };
    store.create_table().await?;
    store.create_table_index().await?;
    Ok(store)
}

/// Shared transition check, used by every backend before mutating status.
pub(crate) fn check_transition(
    id: &str,
    from: JobStatus,
    to: JobStatus,
) -> Result<()> {
    let ok = matches!(
        (from, to),
        (JobStatus::Queued, JobStatus::Started)
            | (JobStatus::Queued, JobStatus::Deferred)
            | (JobStatus::Queued, JobStatus::Canceled)
            | (JobStatus::Deferred, JobStatus::Queued)
            | (JobStatus::Deferred, JobStatus::Canceled)
            | (JobStatus::Started, JobStatus::Finished)
            | (JobStatus::Started, JobStatus::Failed)
            | (JobStatus::Started, JobStatus::Canceled) // cooperative interrupt
            | (JobStatus::Started, JobStatus::Queued) // retry / lease expiry
            | (JobStatus::Failed, JobStatus::Queued) // explicit requeue
            | (JobStatus::Finished, JobStatus::Queued) // repeat policy
    );
    if ok {
        Ok(())
    } else {
        Err(Error::IllegalTransition {
            entity: "job",
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_ref_parse() {
        let f: FunctionRef = "flowerpower.pipeline:run".parse().unwrap();
        assert_eq!(f.module, "flowerpower.pipeline");
        assert_eq!(f.name, "run");
        assert!("no-colon".parse::<FunctionRef>().is_err());
    }

    #[test]
    fn test_status_terminal() {
        assert!(JobStatus::Finished.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
        assert!(!JobStatus::Started.is_terminal());
    }

    #[test]
    fn test_transitions() {
        assert!(check_transition("j", JobStatus::Queued, JobStatus::Started).is_ok());
        assert!(check_transition("j", JobStatus::Deferred, JobStatus::Queued).is_ok());
        // canceled never starts
        assert!(check_transition("j", JobStatus::Canceled, JobStatus::Started).is_err());
        // no backwards move out of finished except repeat requeue
        assert!(check_transition("j", JobStatus::Finished, JobStatus::Started).is_err());
    }

    #[test]
    fn test_initial_status() {
        let mut job = Job::new(FunctionRef::new("m", "f"), "default");
        assert_eq!(job.initial_status(), JobStatus::Queued);
        job.scheduled_at = Some(config::utils::time::now_micros() + 60_000_000);
        assert_eq!(job.initial_status(), JobStatus::Deferred);
    }

    #[test]
    fn test_job_serde_roundtrip() {
        let mut job = Job::new(FunctionRef::new("math", "add"), "fast");
        job.args = vec![json::json!(2), json::json!(3)];
        job.retry = RetryPolicy { max: 2, delay: 100_000 };
        let s = json::to_string(&job).unwrap();
        let back: Job = json::from_str(&s).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.args, job.args);
        assert_eq!(back.retry, job.retry);
    }
}

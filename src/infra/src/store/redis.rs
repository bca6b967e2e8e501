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
use config::{
    meta::backend::BackendKind,
    utils::{json, time::now_micros},
};
use redis::{aio::ConnectionManager, AsyncCommands, Script};

use super::{
    check_transition, CancelOutcome, ConflictPolicy, DataStore, Job, JobStatus, Schedule,
    StoreOp,
};
use crate::{
    backend::Backend,
    errors::{Error, Result},
};

fn queue_key(queue: &str) -> String {
    format!("queue:{queue}")
}

fn processing_key(queue: &str) -> String {
    format!("processing:{queue}")
}

fn scheduled_key(queue: &str) -> String {
    format!("scheduled:{queue}")
}

fn jobs_set_key(queue: &str) -> String {
    format!("jobs:{queue}")
}

fn job_key(id: &str) -> String {
    format!("job:{id}")
}

fn result_key(id: &str) -> String {
    format!("results:{id}")
}

fn token_key(token: &str) -> String {
    format!("token:{token}")
}

const SCHEDULES_KEY: &str = "schedules";

struct RedisScripts {
    push_job: Script,
    acquire_job: Script,
    promote_due: Script,
    cancel_job: Script,
}

impl RedisScripts {
    fn new() -> Self {
        Self {
            // KEYS: job, queue list, scheduled zset, jobs set
            // ARGV: id, data, status, scheduled_at millis (0 = immediate), overwrite
            push_job: Script::new(
                r#"
if redis.call('EXISTS', KEYS[1]) == 1 and ARGV[5] == '0' then
    return 0
end
redis.call('HSET', KEYS[1], 'data', ARGV[2], 'status', ARGV[3])
redis.call('SADD', KEYS[4], ARGV[1])
redis.call('LREM', KEYS[2], 0, ARGV[1])
redis.call('ZREM', KEYS[3], ARGV[1])
if ARGV[4] ~= '0' then
    redis.call('ZADD', KEYS[3], ARGV[4], ARGV[1])
else
    redis.call('LPUSH', KEYS[2], ARGV[1])
end
return 1
                "#,
            ),
            // KEYS: queue list, processing list
            // ARGV: status started, lease_until, worker, token key, token ttl millis
            acquire_job: Script::new(
                r#"
local id = redis.call('RPOPLPUSH', KEYS[1], KEYS[2])
if not id then
    return false
end
redis.call('HSET', 'job:' .. id, 'status', ARGV[1], 'lease_until', ARGV[2], 'worker', ARGV[3])
redis.call('SET', ARGV[4], id, 'PX', ARGV[5])
return id
                "#,
            ),
            // KEYS: scheduled zset, queue list
            // ARGV: now millis, queued status
            promote_due: Script::new(
                r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(due) do
    redis.call('ZREM', KEYS[1], id)
    redis.call('RPUSH', KEYS[2], id)
    redis.call('HSET', 'job:' .. id, 'status', ARGV[2])
end
return #due
                "#,
            ),
            // KEYS: job, queue list, scheduled zset
            // ARGV: id, canceled status
            // returns 0 missing, 1 canceled, 2 running, 3 terminal
            cancel_job: Script::new(
                r#"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then
    return 0
end
if status == '0' or status == '1' then
    redis.call('LREM', KEYS[2], 0, ARGV[1])
    redis.call('ZREM', KEYS[3], ARGV[1])
    redis.call('HSET', KEYS[1], 'status', ARGV[2])
    return 1
end
if status == '2' then
    return 2
end
return 3
                "#,
            ),
        }
    }
}

/// Redis realization of the queue broker: queues are Lua managed lists,
/// scheduled jobs live in a sorted set scored by fire time and results are
/// plain keys expiring with the result ttl. The event broker is fused: the
/// manager publishes on the same connection.
pub struct RedisStore {
    conn: ConnectionManager,
    queues: Vec<String>,
    scripts: RedisScripts,
}

impl RedisStore {
    pub async fn connect(backend: &Backend) -> Result<Self> {
        let client = redis::Client::open(backend.uri.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            queues: backend.queues.clone(),
            scripts: RedisScripts::new(),
        })
    }

    /// The fused event broker shares this connection.
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    async fn load_job(&self, id: &str) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        let data: Option<String> = conn.hget(job_key(id), "data").await?;
        let Some(data) = data else {
            return Ok(None);
        };
        let mut job: Job = json::from_str(&data)?;
        // scalar fields win over the serialized snapshot
        if let Some(status) = conn
            .hget::<_, _, Option<String>>(job_key(id), "status")
            .await?
            .and_then(|s| s.parse::<i32>().ok())
        {
            job.status = match status {
                0 => JobStatus::Queued,
                1 => JobStatus::Deferred,
                2 => JobStatus::Started,
                3 => JobStatus::Finished,
                4 => JobStatus::Failed,
                _ => JobStatus::Canceled,
            };
        }
        Ok(Some(job))
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        let mut conn = self.conn.clone();
        let data = json::to_string(job)?;
        let _: () = redis::pipe()
            .hset(job_key(&job.id), "data", data)
            .hset(job_key(&job.id), "status", job.status as i32)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn load_schedule(&self, id: &str) -> Result<Option<Schedule>> {
        let mut conn = self.conn.clone();
        let data: Option<String> = conn.hget(SCHEDULES_KEY, id).await?;
        data.map(|d| json::from_str(&d).map_err(Error::from)).transpose()
    }
}

#[async_trait]
impl DataStore for RedisStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    fn supports(&self, op: StoreOp) -> bool {
        !matches!(op, StoreOp::PauseSchedule | StoreOp::ResumeSchedule)
    }

    async fn create_table(&self) -> Result<()> {
        Ok(())
    }

    async fn create_table_index(&self) -> Result<()> {
        Ok(())
    }

    async fn put_job(&self, job: &Job, overwrite: bool) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut job = job.clone();
        job.status = job.initial_status();
        let data = json::to_string(&job)?;
        let scheduled_millis = job.scheduled_at.map(|t| t / 1000).unwrap_or(0);
        let ret: i32 = self
            .scripts
            .push_job
            .key(job_key(&job.id))
            .key(queue_key(&job.queue))
            .key(scheduled_key(&job.queue))
            .key(jobs_set_key(&job.queue))
            .arg(&job.id)
            .arg(data)
            .arg(job.status as i32)
            .arg(scheduled_millis)
            .arg(if overwrite { 1 } else { 0 })
            .invoke_async(&mut conn)
            .await?;
        if ret == 0 {
            return Err(Error::DuplicateId(job.id.clone()));
        }
        if job.job_ttl > 0 {
            let _: bool = redis::cmd("PEXPIRE")
                .arg(job_key(&job.id))
                .arg(job.job_ttl / 1000)
                .query_async(&mut conn)
                .await?;
        }
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        self.load_job(id).await
    }

    async fn list_jobs(&self, queue: Option<&str>) -> Result<Vec<Job>> {
        let mut conn = self.conn.clone();
        let queues: Vec<String> = match queue {
            Some(q) => vec![q.to_string()],
            None => self.queues.clone(),
        };
        let mut jobs = Vec::new();
        for queue in queues {
            let ids: Vec<String> = conn.smembers(jobs_set_key(&queue)).await?;
            for id in ids {
                match self.load_job(&id).await? {
                    Some(job) => jobs.push(job),
                    // hash expired (job_ttl), drop the stale member
                    None => {
                        let _: i32 = conn.srem(jobs_set_key(&queue), &id).await?;
                    }
                }
            }
        }
        Ok(jobs)
    }

    async fn acquire_next(
        &self,
        queue: &str,
        worker_id: &str,
        token: &str,
        lease_micros: i64,
    ) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        let now = now_micros();

        // the token key survives for the lease duration, so a retried
        // acquisition finds its claimed job again
        let held: Option<String> = conn.get(token_key(token)).await?;
        if let Some(id) = held {
            if let Some(job) = self.load_job(&id).await? {
                if job.status == JobStatus::Started {
                    return Ok(Some(job));
                }
            }
        }

        // promote due scheduled jobs first, then pop
        let _: i32 = self
            .scripts
            .promote_due
            .key(scheduled_key(queue))
            .key(queue_key(queue))
            .arg(now / 1000)
            .arg(JobStatus::Queued as i32)
            .invoke_async(&mut conn)
            .await?;

        let id: Option<String> = self
            .scripts
            .acquire_job
            .key(queue_key(queue))
            .key(processing_key(queue))
            .arg(JobStatus::Started as i32)
            .arg(now + lease_micros)
            .arg(worker_id)
            .arg(token_key(token))
            .arg(lease_micros / 1000)
            .invoke_async(&mut conn)
            .await?;
        let Some(id) = id else {
            return Ok(None);
        };

        let Some(mut job) = self.load_job(&id).await? else {
            return Ok(None);
        };
        job.status = JobStatus::Started;
        job.started_at = Some(now);
        job.worker_id = Some(worker_id.to_string());
        job.acquire_token = Some(token.to_string());
        job.lease_until = Some(now + lease_micros);
        self.save_job(&job).await?;
        Ok(Some(job))
    }

    async fn complete_job(&self, id: &str, result: json::Value) -> Result<Job> {
        let mut conn = self.conn.clone();
        let now = now_micros();
        let mut job = self
            .load_job(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        check_transition(id, job.status, JobStatus::Finished)?;

        let _: i32 = conn.lrem(processing_key(&job.queue), 0, id).await?;
        job.status = JobStatus::Finished;
        job.finished_at = Some(now);
        job.worker_id = None;
        job.lease_until = None;
        if job.result_ttl > 0 {
            let _: () = redis::cmd("SET")
                .arg(result_key(id))
                .arg(json::to_string(&result)?)
                .arg("PX")
                .arg(job.result_ttl / 1000)
                .query_async(&mut conn)
                .await?;
            job.result = Some(result);
            job.result_expires_at = Some(now + job.result_ttl);
        }
        if job.repeats_done < job.repeat.max {
            job.repeats_done += 1;
            job.status = JobStatus::Queued;
            job.scheduled_at = (job.repeat.delay > 0).then(|| now + job.repeat.delay);
            job.attempts = 0;
            self.save_job(&job).await?;
            // back through the normal push path
            let scheduled_millis = job.scheduled_at.map(|t| t / 1000).unwrap_or(0);
            if scheduled_millis > 0 {
                let _: () = conn
                    .zadd(scheduled_key(&job.queue), id, scheduled_millis)
                    .await?;
            } else {
                let _: () = conn.lpush(queue_key(&job.queue), id).await?;
            }
            return Ok(job);
        }
        self.save_job(&job).await?;
        Ok(job)
    }

    async fn fail_job(&self, id: &str, failure: &str) -> Result<Job> {
        let mut conn = self.conn.clone();
        let now = now_micros();
        let mut job = self
            .load_job(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        check_transition(id, job.status, JobStatus::Failed)?;

        let _: i32 = conn.lrem(processing_key(&job.queue), 0, id).await?;
        job.attempts += 1;
        job.failure = Some(failure.to_string());
        job.worker_id = None;
        job.lease_until = None;
        if job.attempts <= job.retry.max {
            job.status = JobStatus::Queued;
            job.scheduled_at = (job.retry.delay > 0).then(|| now + job.retry.delay);
            self.save_job(&job).await?;
            match job.scheduled_at {
                Some(at) => {
                    let _: () = conn.zadd(scheduled_key(&job.queue), id, at / 1000).await?;
                }
                None => {
                    let _: () = conn.lpush(queue_key(&job.queue), id).await?;
                }
            }
        } else {
            job.status = JobStatus::Failed;
            job.finished_at = Some(now);
            self.save_job(&job).await?;
        }
        Ok(job)
    }

    async fn cancel_job(&self, id: &str) -> Result<CancelOutcome> {
        let mut conn = self.conn.clone();
        let job = self.load_job(id).await?;
        let Some(job) = job else {
            return Ok(CancelOutcome::NotFound);
        };
        let ret: i32 = self
            .scripts
            .cancel_job
            .key(job_key(id))
            .key(queue_key(&job.queue))
            .key(scheduled_key(&job.queue))
            .arg(id)
            .arg(JobStatus::Canceled as i32)
            .invoke_async(&mut conn)
            .await?;
        match ret {
            0 => Ok(CancelOutcome::NotFound),
            1 => {
                let mut job = job;
                job.status = JobStatus::Canceled;
                job.finished_at = Some(now_micros());
                self.save_job(&job).await?;
                Ok(CancelOutcome::Canceled)
            }
            2 => Ok(CancelOutcome::Running),
            _ => Ok(CancelOutcome::Terminal),
        }
    }

    async fn force_cancel(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut job = self
            .load_job(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        check_transition(id, job.status, JobStatus::Canceled)?;
        let _: i32 = conn.lrem(processing_key(&job.queue), 0, id).await?;
        job.status = JobStatus::Canceled;
        job.finished_at = Some(now_micros());
        job.worker_id = None;
        job.lease_until = None;
        self.save_job(&job).await?;
        Ok(())
    }

    async fn delete_job(&self, id: &str, ttl_micros: i64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let Some(job) = self.load_job(id).await? else {
            return Ok(false);
        };
        if ttl_micros > 0 {
            let _: bool = redis::cmd("PEXPIRE")
                .arg(job_key(id))
                .arg(ttl_micros / 1000)
                .query_async(&mut conn)
                .await?;
            return Ok(true);
        }
        let _: () = redis::pipe()
            .lrem(queue_key(&job.queue), 0, id)
            .lrem(processing_key(&job.queue), 0, id)
            .zrem(scheduled_key(&job.queue), id)
            .srem(jobs_set_key(&job.queue), id)
            .del(job_key(id))
            .del(result_key(id))
            .query_async(&mut conn)
            .await?;
        Ok(true)
    }

    async fn get_result(&self, id: &str) -> Result<Option<json::Value>> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(job_key(id)).await?;
        if !exists {
            return Err(Error::NotFound(id.to_string()));
        }
        let data: Option<String> = conn.get(result_key(id)).await?;
        data.map(|d| json::from_str(&d).map_err(Error::from)).transpose()
    }

    async fn delete_result(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i32 = conn.del(result_key(id)).await?;
        Ok(removed > 0)
    }

    async fn put_schedule(
        &self,
        schedule: &Schedule,
        conflict: ConflictPolicy,
    ) -> Result<String> {
        let mut conn = self.conn.clone();
        let existing = self.load_schedule(&schedule.id).await?;
        match existing {
            Some(_) if conflict == ConflictPolicy::DoNothing => {
                log::info!(
                    "[REDIS] schedule {} exists, conflict policy keeps the old one",
                    schedule.id
                );
            }
            Some(old) => {
                let mut merged = schedule.clone();
                if conflict == ConflictPolicy::Update {
                    merged.next_fire_at = old.next_fire_at;
                    merged.last_fire_at = old.last_fire_at;
                    merged.paused = old.paused;
                    merged.created_at = old.created_at;
                }
                let _: () = conn
                    .hset(SCHEDULES_KEY, &schedule.id, json::to_string(&merged)?)
                    .await?;
            }
            None => {
                let _: () = conn
                    .hset(SCHEDULES_KEY, &schedule.id, json::to_string(schedule)?)
                    .await?;
            }
        }
        Ok(schedule.id.clone())
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<Schedule>> {
        self.load_schedule(id).await
    }

    async fn list_schedules(&self, queue: Option<&str>) -> Result<Vec<Schedule>> {
        let mut conn = self.conn.clone();
        let values: Vec<String> = conn.hvals(SCHEDULES_KEY).await?;
        let mut schedules = Vec::new();
        for value in values {
            let schedule: Schedule = json::from_str(&value)?;
            if queue.is_none_or(|q| schedule.queue == q) {
                schedules.push(schedule);
            }
        }
        Ok(schedules)
    }

    async fn delete_schedule(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i32 = conn.hdel(SCHEDULES_KEY, id).await?;
        Ok(removed > 0)
    }

    async fn set_schedule_paused(&self, _id: &str, _paused: bool) -> Result<bool> {
        Err(Error::UnsupportedOperation(
            "pausing schedules is not supported by the redis queue backend".to_string(),
        ))
    }

    async fn due_schedules(&self, now: i64) -> Result<Vec<Schedule>> {
        let schedules = self.list_schedules(None).await?;
        Ok(schedules
            .into_iter()
            .filter(|s| !s.paused && s.next_fire_at.is_some_and(|t| t <= now))
            .collect())
    }

    async fn record_schedule_fired(
        &self,
        id: &str,
        last_fire_at: i64,
        next_fire_at: Option<i64>,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut schedule = self
            .load_schedule(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        schedule.last_fire_at = Some(last_fire_at);
        schedule.next_fire_at = next_fire_at;
        let _: () = conn
            .hset(SCHEDULES_KEY, id, json::to_string(&schedule)?)
            .await?;
        Ok(())
    }

    async fn running_jobs_for_schedule(&self, schedule_id: &str) -> Result<u32> {
        let jobs = self.list_jobs(None).await?;
        Ok(jobs
            .iter()
            .filter(|j| {
                j.schedule_id.as_deref() == Some(schedule_id) && !j.status.is_terminal()
            })
            .count() as u32)
    }

    async fn sweep(&self, now: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        for queue in &self.queues {
            // promote due scheduled jobs
            let promoted: i32 = self
                .scripts
                .promote_due
                .key(scheduled_key(queue))
                .key(queue_key(queue))
                .arg(now / 1000)
                .arg(JobStatus::Queued as i32)
                .invoke_async(&mut conn)
                .await?;
            if promoted > 0 {
                log::debug!("[REDIS] promoted {promoted} scheduled jobs on '{queue}'");
            }

            // requeue jobs whose lease expired
            let in_flight: Vec<String> = conn.lrange(processing_key(queue), 0, -1).await?;
            for id in in_flight {
                let Some(mut job) = self.load_job(&id).await? else {
                    let _: i32 = conn.lrem(processing_key(queue), 0, &id).await?;
                    continue;
                };
                if job.status == JobStatus::Started
                    && job.lease_until.is_some_and(|l| l <= now)
                {
                    log::warn!("[REDIS] job {id} lease expired, requeueing");
                    let _: i32 = conn.lrem(processing_key(queue), 0, &id).await?;
                    job.status = JobStatus::Queued;
                    job.worker_id = None;
                    job.acquire_token = None;
                    job.lease_until = None;
                    job.attempts += 1;
                    self.save_job(&job).await?;
                    let _: () = conn.rpush(queue_key(queue), &id).await?;
                }
            }

            // drop set members whose job hash expired
            let ids: Vec<String> = conn.smembers(jobs_set_key(queue)).await?;
            for id in ids {
                let exists: bool = conn.exists(job_key(&id)).await?;
                if !exists {
                    let _: () = redis::pipe()
                        .srem(jobs_set_key(queue), &id)
                        .lrem(queue_key(queue), 0, &id)
                        .zrem(scheduled_key(queue), &id)
                        .query_async(&mut conn)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

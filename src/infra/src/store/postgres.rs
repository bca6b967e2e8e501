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
use sqlx::{Pool, Postgres};

use super::{
    check_transition, CancelOutcome, ConflictPolicy, DataStore, Job, JobBody, JobRow,
    JobStatus, Schedule, ScheduleBody, ScheduleRow,
};
use crate::{
    backend::Backend,
    db,
    errors::{Error, Result},
};

pub struct PostgresStore {
    pool: Pool<Postgres>,
    schema: String,
}

impl PostgresStore {
    pub fn new(backend: &Backend) -> Result<Self> {
        Ok(Self {
            pool: db::postgres::connect(&backend.uri, Some(&backend.schema))?,
            schema: backend.schema.clone(),
        })
    }

    pub fn pool(&self) -> Pool<Postgres> {
        self.pool.clone()
    }
}

#[async_trait]
impl DataStore for PostgresStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    async fn create_table(&self) -> Result<()> {
        let pool = self.pool.clone();
        if !self.schema.is_empty() {
            sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {};", self.schema))
                .execute(&pool)
                .await?;
        }
        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS jobs
(
    id                VARCHAR(64) PRIMARY KEY,
    queue             VARCHAR(256) not null,
    status            INT not null,
    enqueued_at       BIGINT not null,
    scheduled_at      BIGINT,
    started_at        BIGINT,
    finished_at       BIGINT,
    attempts          INT default 0 not null,
    repeats_done      INT default 0 not null,
    schedule_id       VARCHAR(256),
    worker_id         VARCHAR(256),
    acquire_token     VARCHAR(64),
    failure           TEXT,
    lease_until       BIGINT,
    purge_at          BIGINT,
    ttl_expires_at    BIGINT,
    payload           BYTEA not null,
    result            BYTEA,
    result_expires_at BIGINT,
    created_at        TIMESTAMP default CURRENT_TIMESTAMP
);
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS schedules
(
    id              VARCHAR(256) PRIMARY KEY,
    queue           VARCHAR(256) not null,
    trigger_kind    INT not null,
    trigger_payload BYTEA not null,
    next_fire_at    BIGINT,
    last_fire_at    BIGINT,
    paused          BOOLEAN default false not null,
    coalesce_policy INT default 0 not null,
    payload         BYTEA not null,
    created_at      TIMESTAMP default CURRENT_TIMESTAMP
);
            "#,
        )
        .execute(&pool)
        .await?;
        Ok(())
    }

    async fn create_table_index(&self) -> Result<()> {
        let pool = self.pool.clone();
        let queries = vec![
            "CREATE INDEX IF NOT EXISTS jobs_queue_status_idx on jobs (queue, status, scheduled_at);",
            "CREATE INDEX IF NOT EXISTS jobs_schedule_idx on jobs (schedule_id);",
            "CREATE INDEX IF NOT EXISTS jobs_token_idx on jobs (acquire_token);",
            "CREATE INDEX IF NOT EXISTS schedules_due_idx on schedules (next_fire_at) WHERE NOT paused;",
            "CREATE INDEX IF NOT EXISTS schedules_queue_idx on schedules (queue);",
        ];
        for query in queries {
            if let Err(e) = sqlx::query(query).execute(&pool).await {
                log::error!("[POSTGRES] create table index error: {}", e);
                return Err(e.into());
            }
        }
        Ok(())
    }

    async fn put_job(&self, job: &Job, overwrite: bool) -> Result<()> {
        let pool = self.pool.clone();
        let body = json::to_vec(&JobBody::from(job))?;
        let status = job.initial_status();
        let conflict = if overwrite {
            r#"ON CONFLICT (id) DO UPDATE SET
    queue = EXCLUDED.queue, status = EXCLUDED.status,
    enqueued_at = EXCLUDED.enqueued_at, scheduled_at = EXCLUDED.scheduled_at,
    attempts = 0, repeats_done = 0, schedule_id = EXCLUDED.schedule_id,
    worker_id = NULL, acquire_token = NULL, failure = NULL, lease_until = NULL,
    purge_at = NULL, ttl_expires_at = EXCLUDED.ttl_expires_at,
    payload = EXCLUDED.payload, result = NULL, result_expires_at = NULL"#
        } else {
            "ON CONFLICT DO NOTHING"
        };
        let query = format!(
            r#"
INSERT INTO jobs (id, queue, status, enqueued_at, scheduled_at, schedule_id, ttl_expires_at, payload)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    {conflict};
            "#
        );
        let ret = sqlx::query(&query)
            .bind(&job.id)
            .bind(&job.queue)
            .bind(status)
            .bind(job.enqueued_at)
            .bind(job.scheduled_at)
            .bind(&job.schedule_id)
            .bind(job.ttl_expires_at())
            .bind(&body)
            .execute(&pool)
            .await?;
        if !overwrite && ret.rows_affected() == 0 {
            return Err(Error::DuplicateId(job.id.clone()));
        }
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let pool = self.pool.clone();
        let row = sqlx::query_as::<_, JobRow>(r#"SELECT * FROM jobs WHERE id = $1;"#)
            .bind(id)
            .fetch_optional(&pool)
            .await?;
        row.map(|r| r.into_job()).transpose()
    }

    async fn list_jobs(&self, queue: Option<&str>) -> Result<Vec<Job>> {
        let pool = self.pool.clone();
        let rows = if let Some(queue) = queue {
            sqlx::query_as::<_, JobRow>(
                r#"SELECT * FROM jobs WHERE queue = $1 ORDER BY enqueued_at;"#,
            )
            .bind(queue)
            .fetch_all(&pool)
            .await?
        } else {
            sqlx::query_as::<_, JobRow>(r#"SELECT * FROM jobs ORDER BY enqueued_at;"#)
                .fetch_all(&pool)
                .await?
        };
        rows.into_iter().map(|r| r.into_job()).collect()
    }

    /// Claims the next due job of the queue. Steps:
    /// - Re-issue check: a started job carrying the same acquisition token is
    ///   returned as-is
    /// - Lock one due row with "FOR UPDATE SKIP LOCKED"
    /// - Flip it to started, stamping worker, token and lease
    /// - Commit as a single transaction
    async fn acquire_next(
        &self,
        queue: &str,
        worker_id: &str,
        token: &str,
        lease_micros: i64,
    ) -> Result<Option<Job>> {
        let pool = self.pool.clone();
        let now = now_micros();

        let held = sqlx::query_as::<_, JobRow>(
            r#"SELECT * FROM jobs WHERE acquire_token = $1 AND status = $2 AND lease_until > $3;"#,
        )
        .bind(token)
        .bind(JobStatus::Started)
        .bind(now)
        .fetch_optional(&pool)
        .await?;
        if let Some(row) = held {
            return Ok(Some(row.into_job()?));
        }

        let query = r#"UPDATE jobs
SET status = $1, started_at = $2, worker_id = $3, acquire_token = $4, lease_until = $5
WHERE id IN (
    SELECT id
    FROM jobs
    WHERE queue = $6
      AND ((status = $7 AND (scheduled_at IS NULL OR scheduled_at <= $8))
        OR (status = $9 AND scheduled_at <= $8))
    ORDER BY COALESCE(scheduled_at, enqueued_at), enqueued_at
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
RETURNING *;"#;

        let mut tx = pool.begin().await?;
        let row = match sqlx::query_as::<_, JobRow>(query)
            .bind(JobStatus::Started)
            .bind(now)
            .bind(worker_id)
            .bind(token)
            .bind(now + lease_micros)
            .bind(queue)
            .bind(JobStatus::Queued)
            .bind(now)
            .bind(JobStatus::Deferred)
            .fetch_optional(&mut *tx)
            .await
        {
            Ok(row) => row,
            Err(e) => {
                if let Err(e) = tx.rollback().await {
                    log::error!("[POSTGRES] rollback acquire_next error: {}", e);
                }
                return Err(e.into());
            }
        };
        if let Err(e) = tx.commit().await {
            log::error!("[POSTGRES] commit acquire_next error: {}", e);
            return Err(e.into());
        }
        row.map(|r| r.into_job()).transpose()
    }

    async fn complete_job(&self, id: &str, result: json::Value) -> Result<Job> {
        let pool = self.pool.clone();
        let now = now_micros();
        let mut tx = pool.begin().await?;

        let row = sqlx::query_as::<_, JobRow>(r#"SELECT * FROM jobs WHERE id = $1 FOR UPDATE;"#)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.rollback().await.ok();
            return Err(Error::NotFound(id.to_string()));
        };
        let mut job = row.into_job()?;
        if let Err(e) = check_transition(id, job.status, JobStatus::Finished) {
            tx.rollback().await.ok();
            return Err(e);
        }

        job.status = JobStatus::Finished;
        job.finished_at = Some(now);
        job.worker_id = None;
        job.lease_until = None;
        if job.result_ttl > 0 {
            job.result = Some(result);
            job.result_expires_at = Some(now + job.result_ttl);
        }
        if job.repeats_done < job.repeat.max {
            job.repeats_done += 1;
            job.status = JobStatus::Queued;
            job.scheduled_at = (job.repeat.delay > 0).then(|| now + job.repeat.delay);
            job.attempts = 0;
        }

        let result_bytes = match &job.result {
            Some(v) => Some(json::to_vec(v)?),
            None => None,
        };
        if let Err(e) = sqlx::query(
            r#"UPDATE jobs
SET status = $1, finished_at = $2, scheduled_at = $3, attempts = $4, repeats_done = $5,
    worker_id = NULL, lease_until = NULL, result = $6, result_expires_at = $7
WHERE id = $8;"#,
        )
        .bind(job.status)
        .bind(job.finished_at)
        .bind(job.scheduled_at)
        .bind(job.attempts as i32)
        .bind(job.repeats_done as i32)
        .bind(&result_bytes)
        .bind(job.result_expires_at)
        .bind(id)
        .execute(&mut *tx)
        .await
        {
            if let Err(e) = tx.rollback().await {
                log::error!("[POSTGRES] rollback complete_job error: {}", e);
            }
            return Err(e.into());
        }
        if let Err(e) = tx.commit().await {
            log::error!("[POSTGRES] commit complete_job error: {}", e);
            return Err(e.into());
        }
        Ok(job)
    }

    async fn fail_job(&self, id: &str, failure: &str) -> Result<Job> {
        let pool = self.pool.clone();
        let now = now_micros();
        let mut tx = pool.begin().await?;

        let row = sqlx::query_as::<_, JobRow>(r#"SELECT * FROM jobs WHERE id = $1 FOR UPDATE;"#)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.rollback().await.ok();
            return Err(Error::NotFound(id.to_string()));
        };
        let mut job = row.into_job()?;
        if let Err(e) = check_transition(id, job.status, JobStatus::Failed) {
            tx.rollback().await.ok();
            return Err(e);
        }

        job.attempts += 1;
        job.failure = Some(failure.to_string());
        job.worker_id = None;
        job.lease_until = None;
        if job.attempts <= job.retry.max {
            job.status = JobStatus::Queued;
            job.scheduled_at = (job.retry.delay > 0).then(|| now + job.retry.delay);
        } else {
            job.status = JobStatus::Failed;
            job.finished_at = Some(now);
        }

        if let Err(e) = sqlx::query(
            r#"UPDATE jobs
SET status = $1, finished_at = $2, scheduled_at = $3, attempts = $4, failure = $5,
    worker_id = NULL, lease_until = NULL
WHERE id = $6;"#,
        )
        .bind(job.status)
        .bind(job.finished_at)
        .bind(job.scheduled_at)
        .bind(job.attempts as i32)
        .bind(&job.failure)
        .bind(id)
        .execute(&mut *tx)
        .await
        {
            if let Err(e) = tx.rollback().await {
                log::error!("[POSTGRES] rollback fail_job error: {}", e);
            }
            return Err(e.into());
        }
        if let Err(e) = tx.commit().await {
            log::error!("[POSTGRES] commit fail_job error: {}", e);
            return Err(e.into());
        }
        Ok(job)
    }

    async fn cancel_job(&self, id: &str) -> Result<CancelOutcome> {
        let pool = self.pool.clone();
        let ret = sqlx::query(
            r#"UPDATE jobs SET status = $1, finished_at = $2 WHERE id = $3 AND status IN ($4, $5);"#,
        )
        .bind(JobStatus::Canceled)
        .bind(now_micros())
        .bind(id)
        .bind(JobStatus::Queued)
        .bind(JobStatus::Deferred)
        .execute(&pool)
        .await?;
        if ret.rows_affected() > 0 {
            return Ok(CancelOutcome::Canceled);
        }
        let status: Option<JobStatus> =
            sqlx::query_scalar(r#"SELECT status FROM jobs WHERE id = $1;"#)
                .bind(id)
                .fetch_optional(&pool)
                .await?;
        Ok(match status {
            None => CancelOutcome::NotFound,
            Some(JobStatus::Started) => CancelOutcome::Running,
            Some(_) => CancelOutcome::Terminal,
        })
    }

    async fn force_cancel(&self, id: &str) -> Result<()> {
        let pool = self.pool.clone();
        let ret = sqlx::query(
            r#"UPDATE jobs
SET status = $1, finished_at = $2, worker_id = NULL, lease_until = NULL
WHERE id = $3 AND status = $4;"#,
        )
        .bind(JobStatus::Canceled)
        .bind(now_micros())
        .bind(id)
        .bind(JobStatus::Started)
        .execute(&pool)
        .await?;
        if ret.rows_affected() == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn delete_job(&self, id: &str, ttl_micros: i64) -> Result<bool> {
        let pool = self.pool.clone();
        let ret = if ttl_micros <= 0 {
            sqlx::query(r#"DELETE FROM jobs WHERE id = $1;"#)
                .bind(id)
                .execute(&pool)
                .await?
        } else {
            sqlx::query(r#"UPDATE jobs SET purge_at = $1 WHERE id = $2;"#)
                .bind(now_micros() + ttl_micros)
                .bind(id)
                .execute(&pool)
                .await?
        };
        Ok(ret.rows_affected() > 0)
    }

    async fn get_result(&self, id: &str) -> Result<Option<json::Value>> {
        let pool = self.pool.clone();
        let row: Option<(Option<Vec<u8>>, Option<i64>)> = sqlx::query_as(
            r#"SELECT result, result_expires_at FROM jobs WHERE id = $1;"#,
        )
        .bind(id)
        .fetch_optional(&pool)
        .await?;
        let Some((result, expires_at)) = row else {
            return Err(Error::NotFound(id.to_string()));
        };
        if expires_at.is_some_and(|e| e <= now_micros()) {
            return Ok(None);
        }
        result.map(|b| json::from_slice(&b).map_err(Error::from)).transpose()
    }

    async fn delete_result(&self, id: &str) -> Result<bool> {
        let pool = self.pool.clone();
        let ret = sqlx::query(
            r#"UPDATE jobs SET result = NULL, result_expires_at = NULL
WHERE id = $1 AND result IS NOT NULL;"#,
        )
        .bind(id)
        .execute(&pool)
        .await?;
        Ok(ret.rows_affected() > 0)
    }

    async fn put_schedule(
        &self,
        schedule: &Schedule,
        conflict: ConflictPolicy,
    ) -> Result<String> {
        let pool = self.pool.clone();
        let body = json::to_vec(&ScheduleBody::from(schedule))?;
        let trigger = json::to_vec(&schedule.trigger)?;
        let mut tx = pool.begin().await?;

        let existing = sqlx::query_as::<_, ScheduleRow>(
            r#"SELECT * FROM schedules WHERE id = $1 FOR UPDATE;"#,
        )
        .bind(&schedule.id)
        .fetch_optional(&mut *tx)
        .await?;

        let ret = match existing {
            Some(_) if conflict == ConflictPolicy::DoNothing => {
                log::info!(
                    "[POSTGRES] schedule {} exists, conflict policy keeps the old one",
                    schedule.id
                );
                Ok(())
            }
            Some(old) => {
                // replace rewrites everything, update keeps the runtime state
                let (next, last, paused) = if conflict == ConflictPolicy::Update {
                    (old.next_fire_at, old.last_fire_at, old.paused)
                } else {
                    (schedule.next_fire_at, schedule.last_fire_at, schedule.paused)
                };
                sqlx::query(
                    r#"UPDATE schedules
SET queue = $1, trigger_kind = $2, trigger_payload = $3, next_fire_at = $4,
    last_fire_at = $5, paused = $6, coalesce_policy = $7, payload = $8
WHERE id = $9;"#,
                )
                .bind(&schedule.queue)
                .bind(schedule.trigger.kind())
                .bind(&trigger)
                .bind(next)
                .bind(last)
                .bind(paused)
                .bind(schedule.coalesce)
                .bind(&body)
                .bind(&schedule.id)
                .execute(&mut *tx)
                .await
                .map(|_| ())
            }
            None => sqlx::query(
                r#"
INSERT INTO schedules (id, queue, trigger_kind, trigger_payload, next_fire_at, last_fire_at, paused, coalesce_policy, payload)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9);
                "#,
            )
            .bind(&schedule.id)
            .bind(&schedule.queue)
            .bind(schedule.trigger.kind())
            .bind(&trigger)
            .bind(schedule.next_fire_at)
            .bind(schedule.last_fire_at)
            .bind(schedule.paused)
            .bind(schedule.coalesce)
            .bind(&body)
            .execute(&mut *tx)
            .await
            .map(|_| ()),
        };
        if let Err(e) = ret {
            if let Err(e) = tx.rollback().await {
                log::error!("[POSTGRES] rollback put_schedule error: {}", e);
            }
            return Err(e.into());
        }
        if let Err(e) = tx.commit().await {
            log::error!("[POSTGRES] commit put_schedule error: {}", e);
            return Err(e.into());
        }
        Ok(schedule.id.clone())
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<Schedule>> {
        let pool = self.pool.clone();
        let row = sqlx::query_as::<_, ScheduleRow>(r#"SELECT * FROM schedules WHERE id = $1;"#)
            .bind(id)
            .fetch_optional(&pool)
            .await?;
        row.map(|r| r.into_schedule()).transpose()
    }

    async fn list_schedules(&self, queue: Option<&str>) -> Result<Vec<Schedule>> {
        let pool = self.pool.clone();
        let rows = if let Some(queue) = queue {
            sqlx::query_as::<_, ScheduleRow>(
                r#"SELECT * FROM schedules WHERE queue = $1 ORDER BY id;"#,
            )
            .bind(queue)
            .fetch_all(&pool)
            .await?
        } else {
            sqlx::query_as::<_, ScheduleRow>(r#"SELECT * FROM schedules ORDER BY id;"#)
                .fetch_all(&pool)
                .await?
        };
        rows.into_iter().map(|r| r.into_schedule()).collect()
    }

    async fn delete_schedule(&self, id: &str) -> Result<bool> {
        let pool = self.pool.clone();
        let ret = sqlx::query(r#"DELETE FROM schedules WHERE id = $1;"#)
            .bind(id)
            .execute(&pool)
            .await?;
        Ok(ret.rows_affected() > 0)
    }

    async fn set_schedule_paused(&self, id: &str, paused: bool) -> Result<bool> {
        let pool = self.pool.clone();
        let ret = sqlx::query(r#"UPDATE schedules SET paused = $1 WHERE id = $2;"#)
            .bind(paused)
            .bind(id)
            .execute(&pool)
            .await?;
        Ok(ret.rows_affected() > 0)
    }

    async fn due_schedules(&self, now: i64) -> Result<Vec<Schedule>> {
        let pool = self.pool.clone();
        let rows = sqlx::query_as::<_, ScheduleRow>(
            r#"SELECT * FROM schedules
WHERE NOT paused AND next_fire_at IS NOT NULL AND next_fire_at <= $1
ORDER BY next_fire_at;"#,
        )
        .bind(now)
        .fetch_all(&pool)
        .await?;
        rows.into_iter().map(|r| r.into_schedule()).collect()
    }

    async fn record_schedule_fired(
        &self,
        id: &str,
        last_fire_at: i64,
        next_fire_at: Option<i64>,
    ) -> Result<()> {
        let pool = self.pool.clone();
        let ret = sqlx::query(
            r#"UPDATE schedules SET last_fire_at = $1, next_fire_at = $2 WHERE id = $3;"#,
        )
        .bind(last_fire_at)
        .bind(next_fire_at)
        .bind(id)
        .execute(&pool)
        .await?;
        if ret.rows_affected() == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn running_jobs_for_schedule(&self, schedule_id: &str) -> Result<u32> {
        let pool = self.pool.clone();
        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*)::BIGINT FROM jobs WHERE schedule_id = $1 AND status IN ($2, $3, $4);"#,
        )
        .bind(schedule_id)
        .bind(JobStatus::Queued)
        .bind(JobStatus::Deferred)
        .bind(JobStatus::Started)
        .fetch_one(&pool)
        .await?;
        Ok(count as u32)
    }

    /// Maintenance pass, mirrors the scheduler timeout watcher: promote due
    /// deferred jobs, requeue expired leases, clear expired results and purge
    /// jobs past their lifetime.
    async fn sweep(&self, now: i64) -> Result<()> {
        let pool = self.pool.clone();
        sqlx::query(
            r#"UPDATE jobs SET status = $1 WHERE status = $2 AND scheduled_at <= $3;"#,
        )
        .bind(JobStatus::Queued)
        .bind(JobStatus::Deferred)
        .bind(now)
        .execute(&pool)
        .await?;

        let ret = sqlx::query(
            r#"UPDATE jobs
SET status = $1, worker_id = NULL, acquire_token = NULL, lease_until = NULL,
    attempts = attempts + 1
WHERE status = $2 AND lease_until <= $3;"#,
        )
        .bind(JobStatus::Queued)
        .bind(JobStatus::Started)
        .bind(now)
        .execute(&pool)
        .await?;
        if ret.rows_affected() > 0 {
            log::warn!(
                "[POSTGRES] requeued {} jobs with expired leases",
                ret.rows_affected()
            );
        }

        sqlx::query(
            r#"UPDATE jobs SET result = NULL, result_expires_at = NULL
WHERE result_expires_at IS NOT NULL AND result_expires_at <= $1;"#,
        )
        .bind(now)
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"DELETE FROM jobs
WHERE (purge_at IS NOT NULL AND purge_at <= $1)
   OR (ttl_expires_at IS NOT NULL AND ttl_expires_at <= $1);"#,
        )
        .bind(now)
        .execute(&pool)
        .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

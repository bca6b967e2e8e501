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

use std::sync::Arc;

use async_trait::async_trait;
use config::{
    meta::backend::BackendKind,
    utils::{json, time::now_micros},
};
use sqlx::{Pool, Sqlite};
use tokio::sync::Mutex;

use super::{
    check_transition, CancelOutcome, ConflictPolicy, DataStore, Job, JobBody, JobRow,
    JobStatus, Schedule, ScheduleBody, ScheduleRow,
};
use crate::{
    backend::Backend,
    db,
    errors::{Error, Result},
};

pub struct SqliteStore {
    // single writer connection, serialized behind the mutex
    rw: Arc<Mutex<Pool<Sqlite>>>,
    ro: Pool<Sqlite>,
}

impl SqliteStore {
    pub fn new(backend: &Backend) -> Result<Self> {
        let uri = if backend.uri == "sqlite://" {
            let cfg = config::get_config();
            std::fs::create_dir_all(&cfg.common.data_dir)?;
            format!("sqlite://{}flowerpower.sqlite", cfg.common.data_dir)
        } else {
            backend.uri.clone()
        };
        if !backend.schema.is_empty() {
            log::warn!(
                "[SQLITE] schema directives are ignored, '{}' will not be created",
                backend.schema
            );
        }
        Ok(Self {
            rw: Arc::new(Mutex::new(db::sqlite::connect_rw(&uri)?)),
            ro: db::sqlite::connect_ro(&uri)?,
        })
    }
}

#[async_trait]
impl DataStore for SqliteStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn create_table(&self) -> Result<()> {
        let client = self.rw.lock().await;
        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS jobs
(
    id                VARCHAR not null primary key,
    queue             VARCHAR not null,
    status            INTEGER not null,
    enqueued_at       INTEGER not null,
    scheduled_at      INTEGER,
    started_at        INTEGER,
    finished_at       INTEGER,
    attempts          INTEGER not null default 0,
    repeats_done      INTEGER not null default 0,
    schedule_id       VARCHAR,
    worker_id         VARCHAR,
    acquire_token     VARCHAR,
    failure           TEXT,
    lease_until       INTEGER,
    purge_at          INTEGER,
    ttl_expires_at    INTEGER,
    payload           BLOB not null,
    result            BLOB,
    result_expires_at INTEGER
);
            "#,
        )
        .execute(&*client)
        .await?;
        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS schedules
(
    id              VARCHAR not null primary key,
    queue           VARCHAR not null,
    trigger_kind    INTEGER not null,
    trigger_payload BLOB not null,
    next_fire_at    INTEGER,
    last_fire_at    INTEGER,
    paused          BOOLEAN not null default false,
    coalesce_policy INTEGER not null default 0,
    payload         BLOB not null
);
            "#,
        )
        .execute(&*client)
        .await?;
        Ok(())
    }

    async fn create_table_index(&self) -> Result<()> {
        let client = self.rw.lock().await;
        let queries = vec![
            "CREATE INDEX IF NOT EXISTS jobs_queue_status_idx on jobs (queue, status, scheduled_at);",
            "CREATE INDEX IF NOT EXISTS jobs_schedule_idx on jobs (schedule_id);",
            "CREATE INDEX IF NOT EXISTS jobs_token_idx on jobs (acquire_token);",
            "CREATE INDEX IF NOT EXISTS schedules_due_idx on schedules (next_fire_at);",
            "CREATE INDEX IF NOT EXISTS schedules_queue_idx on schedules (queue);",
        ];
        for query in queries {
            if let Err(e) = sqlx::query(query).execute(&*client).await {
                log::error!("[SQLITE] create table index error: {}", e);
                return Err(e.into());
            }
        }
        Ok(())
    }

    async fn put_job(&self, job: &Job, overwrite: bool) -> Result<()> {
        let body = json::to_vec(&JobBody::from(job))?;
        let status = job.initial_status();
        let query = if overwrite {
            r#"
INSERT INTO jobs (id, queue, status, enqueued_at, scheduled_at, schedule_id, ttl_expires_at, payload)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    ON CONFLICT(id) DO UPDATE SET
        queue = excluded.queue, status = excluded.status,
        enqueued_at = excluded.enqueued_at, scheduled_at = excluded.scheduled_at,
        attempts = 0, repeats_done = 0, schedule_id = excluded.schedule_id,
        worker_id = NULL, acquire_token = NULL, failure = NULL, lease_until = NULL,
        purge_at = NULL, ttl_expires_at = excluded.ttl_expires_at,
        payload = excluded.payload, result = NULL, result_expires_at = NULL;
            "#
        } else {
            r#"
INSERT OR IGNORE INTO jobs (id, queue, status, enqueued_at, scheduled_at, schedule_id, ttl_expires_at, payload)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8);
            "#
        };
        let client = self.rw.lock().await;
        let ret = sqlx::query(query)
            .bind(&job.id)
            .bind(&job.queue)
            .bind(status)
            .bind(job.enqueued_at)
            .bind(job.scheduled_at)
            .bind(&job.schedule_id)
            .bind(job.ttl_expires_at())
            .bind(&body)
            .execute(&*client)
            .await?;
        if !overwrite && ret.rows_affected() == 0 {
            return Err(Error::DuplicateId(job.id.clone()));
        }
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let pool = self.ro.clone();
        let row = sqlx::query_as::<_, JobRow>(r#"SELECT * FROM jobs WHERE id = $1;"#)
            .bind(id)
            .fetch_optional(&pool)
            .await?;
        row.map(|r| r.into_job()).transpose()
    }

    async fn list_jobs(&self, queue: Option<&str>) -> Result<Vec<Job>> {
        let pool = self.ro.clone();
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

    /// The writer mutex stands in for row locks: select the candidate and
    /// flip it to started in one short critical section.
    async fn acquire_next(
        &self,
        queue: &str,
        worker_id: &str,
        token: &str,
        lease_micros: i64,
    ) -> Result<Option<Job>> {
        let now = now_micros();
        let client = self.rw.lock().await;

        let held = sqlx::query_as::<_, JobRow>(
            r#"SELECT * FROM jobs WHERE acquire_token = $1 AND status = $2 AND lease_until > $3;"#,
        )
        .bind(token)
        .bind(JobStatus::Started)
        .bind(now)
        .fetch_optional(&*client)
        .await?;
        if let Some(row) = held {
            return Ok(Some(row.into_job()?));
        }

        let row = sqlx::query_as::<_, JobRow>(
            r#"SELECT *
FROM jobs
WHERE queue = $1
  AND ((status = $2 AND (scheduled_at IS NULL OR scheduled_at <= $3))
    OR (status = $4 AND scheduled_at <= $3))
ORDER BY COALESCE(scheduled_at, enqueued_at), enqueued_at
LIMIT 1;"#,
        )
        .bind(queue)
        .bind(JobStatus::Queued)
        .bind(now)
        .bind(JobStatus::Deferred)
        .fetch_optional(&*client)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        sqlx::query(
            r#"UPDATE jobs
SET status = $1, started_at = $2, worker_id = $3, acquire_token = $4, lease_until = $5
WHERE id = $6;"#,
        )
        .bind(JobStatus::Started)
        .bind(now)
        .bind(worker_id)
        .bind(token)
        .bind(now + lease_micros)
        .bind(&row.id)
        .execute(&*client)
        .await?;

        let mut job = row.into_job()?;
        job.status = JobStatus::Started;
        job.started_at = Some(now);
        job.worker_id = Some(worker_id.to_string());
        job.acquire_token = Some(token.to_string());
        job.lease_until = Some(now + lease_micros);
        Ok(Some(job))
    }

    async fn complete_job(&self, id: &str, result: json::Value) -> Result<Job> {
        let now = now_micros();
        let client = self.rw.lock().await;

        let row = sqlx::query_as::<_, JobRow>(r#"SELECT * FROM jobs WHERE id = $1;"#)
            .bind(id)
            .fetch_optional(&*client)
            .await?;
        let Some(row) = row else {
            return Err(Error::NotFound(id.to_string()));
        };
        let mut job = row.into_job()?;
        check_transition(id, job.status, JobStatus::Finished)?;

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
        sqlx::query(
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
        .execute(&*client)
        .await?;
        Ok(job)
    }

    async fn fail_job(&self, id: &str, failure: &str) -> Result<Job> {
        let now = now_micros();
        let client = self.rw.lock().await;

        let row = sqlx::query_as::<_, JobRow>(r#"SELECT * FROM jobs WHERE id = $1;"#)
            .bind(id)
            .fetch_optional(&*client)
            .await?;
        let Some(row) = row else {
            return Err(Error::NotFound(id.to_string()));
        };
        let mut job = row.into_job()?;
        check_transition(id, job.status, JobStatus::Failed)?;

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

        sqlx::query(
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
        .execute(&*client)
        .await?;
        Ok(job)
    }

    async fn cancel_job(&self, id: &str) -> Result<CancelOutcome> {
        let client = self.rw.lock().await;
        let ret = sqlx::query(
            r#"UPDATE jobs SET status = $1, finished_at = $2 WHERE id = $3 AND status IN ($4, $5);"#,
        )
        .bind(JobStatus::Canceled)
        .bind(now_micros())
        .bind(id)
        .bind(JobStatus::Queued)
        .bind(JobStatus::Deferred)
        .execute(&*client)
        .await?;
        if ret.rows_affected() > 0 {
            return Ok(CancelOutcome::Canceled);
        }
        let status: Option<JobStatus> =
            sqlx::query_scalar(r#"SELECT status FROM jobs WHERE id = $1;"#)
                .bind(id)
                .fetch_optional(&*client)
                .await?;
        Ok(match status {
            None => CancelOutcome::NotFound,
            Some(JobStatus::Started) => CancelOutcome::Running,
            Some(_) => CancelOutcome::Terminal,
        })
    }

    async fn force_cancel(&self, id: &str) -> Result<()> {
        let client = self.rw.lock().await;
        let ret = sqlx::query(
            r#"UPDATE jobs
SET status = $1, finished_at = $2, worker_id = NULL, lease_until = NULL
WHERE id = $3 AND status = $4;"#,
        )
        .bind(JobStatus::Canceled)
        .bind(now_micros())
        .bind(id)
        .bind(JobStatus::Started)
        .execute(&*client)
        .await?;
        if ret.rows_affected() == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn delete_job(&self, id: &str, ttl_micros: i64) -> Result<bool> {
        let client = self.rw.lock().await;
        let ret = if ttl_micros <= 0 {
            sqlx::query(r#"DELETE FROM jobs WHERE id = $1;"#)
                .bind(id)
                .execute(&*client)
                .await?
        } else {
            sqlx::query(r#"UPDATE jobs SET purge_at = $1 WHERE id = $2;"#)
                .bind(now_micros() + ttl_micros)
                .bind(id)
                .execute(&*client)
                .await?
        };
        Ok(ret.rows_affected() > 0)
    }

    async fn get_result(&self, id: &str) -> Result<Option<json::Value>> {
        let pool = self.ro.clone();
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
        let client = self.rw.lock().await;
        let ret = sqlx::query(
            r#"UPDATE jobs SET result = NULL, result_expires_at = NULL
WHERE id = $1 AND result IS NOT NULL;"#,
        )
        .bind(id)
        .execute(&*client)
        .await?;
        Ok(ret.rows_affected() > 0)
    }

    async fn put_schedule(
        &self,
        schedule: &Schedule,
        conflict: ConflictPolicy,
    ) -> Result<String> {
        let body = json::to_vec(&ScheduleBody::from(schedule))?;
        let trigger = json::to_vec(&schedule.trigger)?;
        let client = self.rw.lock().await;

        let existing = sqlx::query_as::<_, ScheduleRow>(
            r#"SELECT * FROM schedules WHERE id = $1;"#,
        )
        .bind(&schedule.id)
        .fetch_optional(&*client)
        .await?;

        match existing {
            Some(_) if conflict == ConflictPolicy::DoNothing => {
                log::info!(
                    "[SQLITE] schedule {} exists, conflict policy keeps the old one",
                    schedule.id
                );
            }
            Some(old) => {
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
                .execute(&*client)
                .await?;
            }
            None => {
                sqlx::query(
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
                .execute(&*client)
                .await?;
            }
        }
        Ok(schedule.id.clone())
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<Schedule>> {
        let pool = self.ro.clone();
        let row = sqlx::query_as::<_, ScheduleRow>(r#"SELECT * FROM schedules WHERE id = $1;"#)
            .bind(id)
            .fetch_optional(&pool)
            .await?;
        row.map(|r| r.into_schedule()).transpose()
    }

    async fn list_schedules(&self, queue: Option<&str>) -> Result<Vec<Schedule>> {
        let pool = self.ro.clone();
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
        let client = self.rw.lock().await;
        let ret = sqlx::query(r#"DELETE FROM schedules WHERE id = $1;"#)
            .bind(id)
            .execute(&*client)
            .await?;
        Ok(ret.rows_affected() > 0)
    }

    async fn set_schedule_paused(&self, id: &str, paused: bool) -> Result<bool> {
        let client = self.rw.lock().await;
        let ret = sqlx::query(r#"UPDATE schedules SET paused = $1 WHERE id = $2;"#)
            .bind(paused)
            .bind(id)
            .execute(&*client)
            .await?;
        Ok(ret.rows_affected() > 0)
    }

    async fn due_schedules(&self, now: i64) -> Result<Vec<Schedule>> {
        let pool = self.ro.clone();
        let rows = sqlx::query_as::<_, ScheduleRow>(
            r#"SELECT * FROM schedules
WHERE paused = FALSE AND next_fire_at IS NOT NULL AND next_fire_at <= $1
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
        let client = self.rw.lock().await;
        let ret = sqlx::query(
            r#"UPDATE schedules SET last_fire_at = $1, next_fire_at = $2 WHERE id = $3;"#,
        )
        .bind(last_fire_at)
        .bind(next_fire_at)
        .bind(id)
        .execute(&*client)
        .await?;
        if ret.rows_affected() == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn running_jobs_for_schedule(&self, schedule_id: &str) -> Result<u32> {
        let pool = self.ro.clone();
        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM jobs WHERE schedule_id = $1 AND status IN ($2, $3, $4);"#,
        )
        .bind(schedule_id)
        .bind(JobStatus::Queued)
        .bind(JobStatus::Deferred)
        .bind(JobStatus::Started)
        .fetch_one(&pool)
        .await?;
        Ok(count as u32)
    }

    async fn sweep(&self, now: i64) -> Result<()> {
        let client = self.rw.lock().await;
        sqlx::query(r#"UPDATE jobs SET status = $1 WHERE status = $2 AND scheduled_at <= $3;"#)
            .bind(JobStatus::Queued)
            .bind(JobStatus::Deferred)
            .bind(now)
            .execute(&*client)
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
        .execute(&*client)
        .await?;
        if ret.rows_affected() > 0 {
            log::warn!(
                "[SQLITE] requeued {} jobs with expired leases",
                ret.rows_affected()
            );
        }

        sqlx::query(
            r#"UPDATE jobs SET result = NULL, result_expires_at = NULL
WHERE result_expires_at IS NOT NULL AND result_expires_at <= $1;"#,
        )
        .bind(now)
        .execute(&*client)
        .await?;

        sqlx::query(
            r#"DELETE FROM jobs
WHERE (purge_at IS NOT NULL AND purge_at <= $1)
   OR (ttl_expires_at IS NOT NULL AND ttl_expires_at <= $1);"#,
        )
        .bind(now)
        .execute(&*client)
        .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let client = self.rw.lock().await;
        client.close().await;
        self.ro.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use config::meta::backend::BackendKind;

    use super::*;
    use crate::{
        backend::{Backend, BackendOptions},
        store::FunctionRef,
    };

    async fn temp_store() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.sqlite");
        let backend = Backend::for_data_store(
            BackendKind::Sqlite,
            BackendOptions {
                uri: Some(format!("sqlite://{}?mode=rwc", path.display())),
                schema: Some(String::new()),
                ..Default::default()
            },
        )
        .unwrap();
        let store = SqliteStore::new(&backend).unwrap();
        store.create_table().await.unwrap();
        store.create_table_index().await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_sqlite_job_lifecycle() {
        let (store, _dir) = temp_store().await;
        let mut job = Job::new(FunctionRef::new("math", "add"), "default");
        job.args = vec![json::json!(2), json::json!(3)];
        job.result_ttl = 60_000_000;

        store.put_job(&job, false).await.unwrap();
        assert!(matches!(
            store.put_job(&job, false).await,
            Err(Error::DuplicateId(_))
        ));

        let claimed = store
            .acquire_next("default", "w1", "t1", 60_000_000)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Started);
        assert_eq!(claimed.args, job.args);

        let done = store.complete_job(&job.id, json::json!(5)).await.unwrap();
        assert_eq!(done.status, JobStatus::Finished);
        assert_eq!(store.get_result(&job.id).await.unwrap(), Some(json::json!(5)));
    }

    #[tokio::test]
    async fn test_sqlite_cancel_and_delete() {
        let (store, _dir) = temp_store().await;
        let job = Job::new(FunctionRef::new("m", "f"), "default");
        store.put_job(&job, false).await.unwrap();
        assert_eq!(
            store.cancel_job(&job.id).await.unwrap(),
            CancelOutcome::Canceled
        );
        assert!(store
            .acquire_next("default", "w", "t", 1_000_000)
            .await
            .unwrap()
            .is_none());
        assert!(store.delete_job(&job.id, 0).await.unwrap());
        assert!(!store.delete_job(&job.id, 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_schedule_roundtrip() {
        let (store, _dir) = temp_store().await;
        let trigger = crate::trigger::Trigger::cron("*/5 * * * *", None, None, None).unwrap();
        let schedule = Schedule::new(FunctionRef::new("m", "f"), trigger, "default");
        store
            .put_schedule(&schedule, ConflictPolicy::DoNothing)
            .await
            .unwrap();
        let loaded = store.get_schedule(&schedule.id).await.unwrap().unwrap();
        assert_eq!(loaded.trigger, schedule.trigger);
        assert_eq!(loaded.queue, "default");
        assert!(store.set_schedule_paused(&schedule.id, true).await.unwrap());
        assert!(store
            .due_schedules(now_micros() + 600_000_000)
            .await
            .unwrap()
            .is_empty());
    }
}

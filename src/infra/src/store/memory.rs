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
use hashbrown::HashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use super::{
    check_transition, CancelOutcome, ConflictPolicy, DataStore, Job, JobStatus, Schedule,
};
use crate::errors::{Error, Result};

// one map per process: every client of the memory backend sees the same state
static GLOBAL: Lazy<Arc<Mutex<Inner>>> = Lazy::new(|| Arc::new(Mutex::new(Inner::default())));

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, Job>,
    schedules: HashMap<String, Schedule>,
}

/// Process-local store for tests and single-process deployments. One mutex
/// guards both maps, which also makes cancel-vs-acquire races trivially
/// atomic.
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: GLOBAL.clone(),
        }
    }

    /// Private map, detached from the process-wide one.
    pub fn isolated() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn create_table(&self) -> Result<()> {
        Ok(())
    }

    async fn create_table_index(&self) -> Result<()> {
        Ok(())
    }

    async fn put_job(&self, job: &Job, overwrite: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if !overwrite && inner.jobs.contains_key(&job.id) {
            return Err(Error::DuplicateId(job.id.clone()));
        }
        let mut job = job.clone();
        job.status = job.initial_status();
        inner.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.inner.lock().jobs.get(id).cloned())
    }

    async fn list_jobs(&self, queue: Option<&str>) -> Result<Vec<Job>> {
        let inner = self.inner.lock();
        Ok(inner
            .jobs
            .values()
            .filter(|j| queue.is_none_or(|q| j.queue == q))
            .cloned()
            .collect())
    }

    async fn acquire_next(
        &self,
        queue: &str,
        worker_id: &str,
        token: &str,
        lease_micros: i64,
    ) -> Result<Option<Job>> {
        let now = now_micros();
        let mut inner = self.inner.lock();

        // idempotent re-issue with the same acquisition token
        if let Some(job) = inner.jobs.values().find(|j| {
            j.status == JobStatus::Started
                && j.acquire_token.as_deref() == Some(token)
                && j.lease_until.is_some_and(|l| l > now)
        }) {
            return Ok(Some(job.clone()));
        }

        let candidate = inner
            .jobs
            .values()
            .filter(|j| {
                j.queue == queue
                    && match j.status {
                        JobStatus::Queued => j.scheduled_at.is_none_or(|at| at <= now),
                        JobStatus::Deferred => j.scheduled_at.is_some_and(|at| at <= now),
                        _ => false,
                    }
            })
            .min_by_key(|j| (j.scheduled_at.unwrap_or(j.enqueued_at), j.enqueued_at))
            .map(|j| j.id.clone());

        let Some(id) = candidate else {
            return Ok(None);
        };
        let job = inner.jobs.get_mut(&id).unwrap();
        job.status = JobStatus::Started;
        job.started_at = Some(now);
        job.worker_id = Some(worker_id.to_string());
        job.acquire_token = Some(token.to_string());
        job.lease_until = Some(now + lease_micros);
        Ok(Some(job.clone()))
    }

    async fn complete_job(&self, id: &str, result: json::Value) -> Result<Job> {
        let now = now_micros();
        let mut inner = self.inner.lock();
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
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
        Ok(job.clone())
    }

    async fn fail_job(&self, id: &str, failure: &str) -> Result<Job> {
        let now = now_micros();
        let mut inner = self.inner.lock();
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
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
        Ok(job.clone())
    }

    async fn cancel_job(&self, id: &str) -> Result<CancelOutcome> {
        let mut inner = self.inner.lock();
        let Some(job) = inner.jobs.get_mut(id) else {
            return Ok(CancelOutcome::NotFound);
        };
        match job.status {
            JobStatus::Queued | JobStatus::Deferred => {
                job.status = JobStatus::Canceled;
                job.finished_at = Some(now_micros());
                Ok(CancelOutcome::Canceled)
            }
            JobStatus::Started => Ok(CancelOutcome::Running),
            _ => Ok(CancelOutcome::Terminal),
        }
    }

    async fn force_cancel(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        check_transition(id, job.status, JobStatus::Canceled)?;
        job.status = JobStatus::Canceled;
        job.finished_at = Some(now_micros());
        job.worker_id = None;
        job.lease_until = None;
        Ok(())
    }

    async fn delete_job(&self, id: &str, ttl_micros: i64) -> Result<bool> {
        let mut inner = self.inner.lock();
        if ttl_micros <= 0 {
            return Ok(inner.jobs.remove(id).is_some());
        }
        match inner.jobs.get_mut(id) {
            Some(job) => {
                job.purge_at = Some(now_micros() + ttl_micros);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_result(&self, id: &str) -> Result<Option<json::Value>> {
        let inner = self.inner.lock();
        let job = inner
            .jobs
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if let Some(expires) = job.result_expires_at {
            if expires <= now_micros() {
                return Ok(None);
            }
        }
        Ok(job.result.clone())
    }

    async fn delete_result(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.jobs.get_mut(id) {
            Some(job) => {
                let had = job.result.is_some();
                job.result = None;
                job.result_expires_at = None;
                Ok(had)
            }
            None => Ok(false),
        }
    }

    async fn put_schedule(
        &self,
        schedule: &Schedule,
        conflict: ConflictPolicy,
    ) -> Result<String> {
        let mut inner = self.inner.lock();
        match inner.schedules.get(&schedule.id) {
            None => {
                inner
                    .schedules
                    .insert(schedule.id.clone(), schedule.clone());
            }
            Some(old) => match conflict {
                ConflictPolicy::DoNothing => {
                    log::info!(
                        "[MEMORY] schedule {} exists, conflict policy keeps the old one",
                        schedule.id
                    );
                }
                ConflictPolicy::Replace => {
                    inner
                        .schedules
                        .insert(schedule.id.clone(), schedule.clone());
                }
                ConflictPolicy::Update => {
                    let mut merged = schedule.clone();
                    merged.next_fire_at = old.next_fire_at;
                    merged.last_fire_at = old.last_fire_at;
                    merged.paused = old.paused;
                    merged.created_at = old.created_at;
                    inner.schedules.insert(schedule.id.clone(), merged);
                }
            },
        }
        Ok(schedule.id.clone())
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<Schedule>> {
        Ok(self.inner.lock().schedules.get(id).cloned())
    }

    async fn list_schedules(&self, queue: Option<&str>) -> Result<Vec<Schedule>> {
        let inner = self.inner.lock();
        Ok(inner
            .schedules
            .values()
            .filter(|s| queue.is_none_or(|q| s.queue == q))
            .cloned()
            .collect())
    }

    async fn delete_schedule(&self, id: &str) -> Result<bool> {
        Ok(self.inner.lock().schedules.remove(id).is_some())
    }

    async fn set_schedule_paused(&self, id: &str, paused: bool) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.schedules.get_mut(id) {
            Some(s) => {
                s.paused = paused;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn due_schedules(&self, now_micros: i64) -> Result<Vec<Schedule>> {
        let inner = self.inner.lock();
        Ok(inner
            .schedules
            .values()
            .filter(|s| !s.paused && s.next_fire_at.is_some_and(|t| t <= now_micros))
            .cloned()
            .collect())
    }

    async fn record_schedule_fired(
        &self,
        id: &str,
        last_fire_at: i64,
        next_fire_at: Option<i64>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let schedule = inner
            .schedules
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        schedule.last_fire_at = Some(last_fire_at);
        schedule.next_fire_at = next_fire_at;
        Ok(())
    }

    async fn running_jobs_for_schedule(&self, schedule_id: &str) -> Result<u32> {
        let inner = self.inner.lock();
        Ok(inner
            .jobs
            .values()
            .filter(|j| {
                j.schedule_id.as_deref() == Some(schedule_id) && !j.status.is_terminal()
            })
            .count() as u32)
    }

    async fn sweep(&self, now: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        for job in inner.jobs.values_mut() {
            // promote due deferred jobs
            if job.status == JobStatus::Deferred && job.scheduled_at.is_some_and(|at| at <= now)
            {
                job.status = JobStatus::Queued;
            }
            // expired leases go back to the queue
            if job.status == JobStatus::Started && job.lease_until.is_some_and(|l| l <= now) {
                log::warn!("[MEMORY] job {} lease expired, requeueing", job.id);
                job.status = JobStatus::Queued;
                job.worker_id = None;
                job.acquire_token = None;
                job.lease_until = None;
                job.attempts += 1;
            }
            if job.result_expires_at.is_some_and(|e| e <= now) {
                job.result = None;
                job.result_expires_at = None;
            }
        }
        inner.jobs.retain(|_, job| {
            job.purge_at.is_none_or(|p| p > now)
                && job.ttl_expires_at().is_none_or(|t| t > now)
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use config::utils::time::now_micros;

    use super::*;
    use crate::store::{FunctionRef, RepeatPolicy, RetryPolicy};

    fn job(queue: &str) -> Job {
        Job::new(FunctionRef::new("math", "add"), queue)
    }

    #[tokio::test]
    async fn test_put_get_duplicate() {
        let store = MemoryStore::isolated();
        let j = job("default");
        store.put_job(&j, false).await.unwrap();
        assert!(store.get_job(&j.id).await.unwrap().is_some());
        let err = store.put_job(&j, false).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateId(_)));
        store.put_job(&j, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_fifo_and_lease() {
        let store = MemoryStore::isolated();
        let j1 = job("q");
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let j2 = job("q");
        store.put_job(&j2, false).await.unwrap();
        store.put_job(&j1, false).await.unwrap();

        let got = store
            .acquire_next("q", "w1", "t1", 60_000_000)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.id, j1.id);
        assert_eq!(got.status, JobStatus::Started);
        assert_eq!(got.worker_id.as_deref(), Some("w1"));

        // same token returns the same job
        let again = store
            .acquire_next("q", "w1", "t1", 60_000_000)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, j1.id);

        // a different token gets the next one
        let other = store
            .acquire_next("q", "w1", "t2", 60_000_000)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(other.id, j2.id);
    }

    #[tokio::test]
    async fn test_deferred_not_acquired_until_due() {
        let store = MemoryStore::isolated();
        let mut j = job("q");
        j.scheduled_at = Some(now_micros() + 60_000_000);
        store.put_job(&j, false).await.unwrap();
        assert_eq!(
            store.get_job(&j.id).await.unwrap().unwrap().status,
            JobStatus::Deferred
        );
        assert!(store
            .acquire_next("q", "w", "t", 60_000_000)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_complete_persists_result_with_ttl() {
        let store = MemoryStore::isolated();
        let mut j = job("q");
        j.result_ttl = 60_000_000;
        store.put_job(&j, false).await.unwrap();
        store
            .acquire_next("q", "w", "t", 60_000_000)
            .await
            .unwrap()
            .unwrap();
        store.complete_job(&j.id, json::json!(5)).await.unwrap();
        assert_eq!(store.get_result(&j.id).await.unwrap(), Some(json::json!(5)));
    }

    #[tokio::test]
    async fn test_zero_result_ttl_keeps_nothing() {
        let store = MemoryStore::isolated();
        let j = job("q");
        store.put_job(&j, false).await.unwrap();
        store.acquire_next("q", "w", "t", 1_000_000).await.unwrap();
        store.complete_job(&j.id, json::json!(5)).await.unwrap();
        assert_eq!(store.get_result(&j.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_result_unknown_id_is_not_found() {
        let store = MemoryStore::isolated();
        assert!(matches!(
            store.get_result("nope").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_then_fail() {
        let store = MemoryStore::isolated();
        let mut j = job("q");
        j.retry = RetryPolicy { max: 1, delay: 0 };
        store.put_job(&j, false).await.unwrap();

        store.acquire_next("q", "w", "t1", 1_000_000).await.unwrap();
        let after_first = store.fail_job(&j.id, "boom").await.unwrap();
        assert_eq!(after_first.status, JobStatus::Queued);
        assert_eq!(after_first.attempts, 1);

        store.acquire_next("q", "w", "t2", 1_000_000).await.unwrap();
        let after_second = store.fail_job(&j.id, "boom again").await.unwrap();
        assert_eq!(after_second.status, JobStatus::Failed);
        assert_eq!(after_second.failure.as_deref(), Some("boom again"));
    }

    #[tokio::test]
    async fn test_repeat_requeues_after_success() {
        let store = MemoryStore::isolated();
        let mut j = job("q");
        j.repeat = RepeatPolicy { max: 1, delay: 0 };
        j.result_ttl = 60_000_000;
        store.put_job(&j, false).await.unwrap();

        store.acquire_next("q", "w", "t1", 1_000_000).await.unwrap();
        let first = store.complete_job(&j.id, json::json!(1)).await.unwrap();
        assert_eq!(first.status, JobStatus::Queued);
        assert_eq!(first.repeats_done, 1);

        store.acquire_next("q", "w", "t2", 1_000_000).await.unwrap();
        let second = store.complete_job(&j.id, json::json!(2)).await.unwrap();
        assert_eq!(second.status, JobStatus::Finished);
    }

    #[tokio::test]
    async fn test_cancel_outcomes() {
        let store = MemoryStore::isolated();
        let j = job("q");
        store.put_job(&j, false).await.unwrap();
        assert_eq!(
            store.cancel_job(&j.id).await.unwrap(),
            CancelOutcome::Canceled
        );
        // canceled job is never handed to a worker
        assert!(store
            .acquire_next("q", "w", "t", 1_000_000)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            store.cancel_job(&j.id).await.unwrap(),
            CancelOutcome::Terminal
        );
        assert_eq!(
            store.cancel_job("missing").await.unwrap(),
            CancelOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_sweep_requeues_expired_lease() {
        let store = MemoryStore::isolated();
        let j = job("q");
        store.put_job(&j, false).await.unwrap();
        store.acquire_next("q", "w", "t", 1).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        store.sweep(now_micros()).await.unwrap();
        let job = store.get_job(&j.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn test_sweep_purges_expired_results_and_jobs() {
        let store = MemoryStore::isolated();
        let mut j = job("q");
        j.result_ttl = 1;
        store.put_job(&j, false).await.unwrap();
        store.acquire_next("q", "w", "t", 60_000_000).await.unwrap();
        store.complete_job(&j.id, json::json!(5)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        store.sweep(now_micros()).await.unwrap();
        assert_eq!(store.get_result(&j.id).await.unwrap(), None);

        store.delete_job(&j.id, 1).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        store.sweep(now_micros()).await.unwrap();
        assert!(store.get_job(&j.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_schedule_conflict_policies() {
        let store = MemoryStore::isolated();
        let trigger = crate::trigger::Trigger::cron("*/5 * * * *", None, None, None).unwrap();
        let mut s = Schedule::new(FunctionRef::new("m", "f"), trigger.clone(), "q");
        s.id = "sched-1".to_string();
        store
            .put_schedule(&s, ConflictPolicy::DoNothing)
            .await
            .unwrap();

        let mut replacement = s.clone();
        replacement.max_jitter = 99;
        // do-nothing keeps the original
        store
            .put_schedule(&replacement, ConflictPolicy::DoNothing)
            .await
            .unwrap();
        assert_eq!(
            store.get_schedule("sched-1").await.unwrap().unwrap().max_jitter,
            0
        );
        // replace swaps it wholesale
        store
            .put_schedule(&replacement, ConflictPolicy::Replace)
            .await
            .unwrap();
        assert_eq!(
            store.get_schedule("sched-1").await.unwrap().unwrap().max_jitter,
            99
        );
        // update keeps runtime state
        store
            .set_schedule_paused("sched-1", true)
            .await
            .unwrap();
        let mut updated = replacement.clone();
        updated.max_jitter = 7;
        store
            .put_schedule(&updated, ConflictPolicy::Update)
            .await
            .unwrap();
        let merged = store.get_schedule("sched-1").await.unwrap().unwrap();
        assert_eq!(merged.max_jitter, 7);
        assert!(merged.paused);
    }

    #[tokio::test]
    async fn test_due_schedules_skip_paused() {
        let store = MemoryStore::isolated();
        let trigger = crate::trigger::Trigger::cron("*/1 * * * *", None, None, None).unwrap();
        let mut s = Schedule::new(FunctionRef::new("m", "f"), trigger, "q");
        s.next_fire_at = Some(now_micros() - 1);
        store
            .put_schedule(&s, ConflictPolicy::DoNothing)
            .await
            .unwrap();
        assert_eq!(store.due_schedules(now_micros()).await.unwrap().len(), 1);
        store.set_schedule_paused(&s.id, true).await.unwrap();
        assert!(store.due_schedules(now_micros()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_schedule_advancement() {
        let store = MemoryStore::isolated();
        let trigger = crate::trigger::Trigger::cron("*/1 * * * *", None, None, None).unwrap();
        let s = Schedule::new(FunctionRef::new("m", "f"), trigger, "q");
        store
            .put_schedule(&s, ConflictPolicy::DoNothing)
            .await
            .unwrap();
        let now = now_micros();
        store
            .record_schedule_fired(&s.id, now, Some(now + 60_000_000))
            .await
            .unwrap();
        let s = store.get_schedule(&s.id).await.unwrap().unwrap();
        assert!(s.next_fire_at.unwrap() > s.last_fire_at.unwrap());
    }
}

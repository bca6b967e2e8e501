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
use futures::TryStreamExt;
use mongodb::{
    bson::{doc, Bson, Document},
    options::{FindOneAndUpdateOptions, IndexOptions, ReturnDocument},
    Client, Collection, IndexModel,
};

use super::{
    check_transition, CancelOutcome, ConflictPolicy, DataStore, Job, JobStatus, Schedule,
};
use crate::{
    backend::Backend,
    errors::{Error, Result},
};

pub struct MongoStore {
    jobs: Collection<Document>,
    schedules: Collection<Document>,
}

impl MongoStore {
    pub async fn connect(backend: &Backend) -> Result<Self> {
        let client = Client::with_uri_str(&backend.uri).await?;
        let db = client.database(&backend.schema);
        Ok(Self {
            jobs: db.collection::<Document>("jobs"),
            schedules: db.collection::<Document>("schedules"),
        })
    }

    fn job_doc(job: &Job) -> Result<Document> {
        let mut doc = mongodb::bson::to_document(job)
            .map_err(|e| Error::Message(format!("bson encode job error: {e}")))?;
        // acquisition order key, scheduled jobs enter the queue at fire time
        doc.insert(
            "sort_at",
            Bson::Int64(job.scheduled_at.unwrap_or(job.enqueued_at)),
        );
        doc.insert(
            "ttl_expires_at",
            job.ttl_expires_at().map(Bson::Int64).unwrap_or(Bson::Null),
        );
        Ok(doc)
    }

    fn doc_job(doc: Document) -> Result<Job> {
        mongodb::bson::from_document(doc)
            .map_err(|e| Error::Message(format!("bson decode job error: {e}")))
    }

    fn doc_schedule(doc: Document) -> Result<Schedule> {
        mongodb::bson::from_document(doc)
            .map_err(|e| Error::Message(format!("bson decode schedule error: {e}")))
    }

    async fn load_job(&self, id: &str) -> Result<Option<Job>> {
        let doc = self.jobs.find_one(doc! {"id": id}, None).await?;
        doc.map(Self::doc_job).transpose()
    }

    async fn replace_job(&self, job: &Job) -> Result<()> {
        let doc = Self::job_doc(job)?;
        self.jobs
            .replace_one(doc! {"id": &job.id}, doc, None)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DataStore for MongoStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Mongodb
    }

    async fn create_table(&self) -> Result<()> {
        // collections appear on first insert
        Ok(())
    }

    async fn create_table_index(&self) -> Result<()> {
        let unique = IndexOptions::builder().unique(true).build();
        self.jobs
            .create_index(
                IndexModel::builder()
                    .keys(doc! {"id": 1})
                    .options(unique.clone())
                    .build(),
                None,
            )
            .await?;
        self.jobs
            .create_index(
                IndexModel::builder()
                    .keys(doc! {"queue": 1, "status": 1, "sort_at": 1})
                    .build(),
                None,
            )
            .await?;
        self.schedules
            .create_index(
                IndexModel::builder()
                    .keys(doc! {"id": 1})
                    .options(unique)
                    .build(),
                None,
            )
            .await?;
        self.schedules
            .create_index(
                IndexModel::builder()
                    .keys(doc! {"next_fire_at": 1, "paused": 1})
                    .build(),
                None,
            )
            .await?;
        Ok(())
    }

    async fn put_job(&self, job: &Job, overwrite: bool) -> Result<()> {
        let mut job = job.clone();
        job.status = job.initial_status();
        let doc = Self::job_doc(&job)?;
        if overwrite {
            self.jobs
                .replace_one(
                    doc! {"id": &job.id},
                    doc,
                    mongodb::options::ReplaceOptions::builder()
                        .upsert(true)
                        .build(),
                )
                .await?;
            return Ok(());
        }
        if self
            .jobs
            .find_one(doc! {"id": &job.id}, None)
            .await?
            .is_some()
        {
            return Err(Error::DuplicateId(job.id.clone()));
        }
        self.jobs.insert_one(doc, None).await?;
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        self.load_job(id).await
    }

    async fn list_jobs(&self, queue: Option<&str>) -> Result<Vec<Job>> {
        let filter = match queue {
            Some(q) => doc! {"queue": q},
            None => doc! {},
        };
        let docs: Vec<Document> = self.jobs.find(filter, None).await?.try_collect().await?;
        docs.into_iter().map(Self::doc_job).collect()
    }

    /// findAndModify claim: one atomic document update filtered on status and
    /// fire time, setting the lease deadline.
    async fn acquire_next(
        &self,
        queue: &str,
        worker_id: &str,
        token: &str,
        lease_micros: i64,
    ) -> Result<Option<Job>> {
        let now = now_micros();

        let held = self
            .jobs
            .find_one(
                doc! {"acquire_token": token, "status": "started", "lease_until": {"$gt": now}},
                None,
            )
            .await?;
        if let Some(doc) = held {
            return Ok(Some(Self::doc_job(doc)?));
        }

        let filter = doc! {
            "queue": queue,
            "$or": [
                {"status": "queued", "$or": [
                    {"scheduled_at": Bson::Null},
                    {"scheduled_at": {"$exists": false}},
                    {"scheduled_at": {"$lte": now}},
                ]},
                {"status": "deferred", "scheduled_at": {"$lte": now}},
            ],
        };
        let update = doc! {"$set": {
            "status": "started",
            "started_at": now,
            "worker_id": worker_id,
            "acquire_token": token,
            "lease_until": now + lease_micros,
        }};
        let options = FindOneAndUpdateOptions::builder()
            .sort(doc! {"sort_at": 1, "enqueued_at": 1})
            .return_document(ReturnDocument::After)
            .build();
        let doc = self
            .jobs
            .find_one_and_update(filter, update, options)
            .await?;
        doc.map(Self::doc_job).transpose()
    }

    async fn complete_job(&self, id: &str, result: json::Value) -> Result<Job> {
        let now = now_micros();
        let mut job = self
            .load_job(id)
            .await?
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
        self.replace_job(&job).await?;
        Ok(job)
    }

    async fn fail_job(&self, id: &str, failure: &str) -> Result<Job> {
        let now = now_micros();
        let mut job = self
            .load_job(id)
            .await?
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
        self.replace_job(&job).await?;
        Ok(job)
    }

    async fn cancel_job(&self, id: &str) -> Result<CancelOutcome> {
        let ret = self
            .jobs
            .find_one_and_update(
                doc! {"id": id, "status": {"$in": ["queued", "deferred"]}},
                doc! {"$set": {"status": "canceled", "finished_at": now_micros()}},
                None,
            )
            .await?;
        if ret.is_some() {
            return Ok(CancelOutcome::Canceled);
        }
        match self.load_job(id).await? {
            None => Ok(CancelOutcome::NotFound),
            Some(job) if job.status == JobStatus::Started => Ok(CancelOutcome::Running),
            Some(_) => Ok(CancelOutcome::Terminal),
        }
    }

    async fn force_cancel(&self, id: &str) -> Result<()> {
        let ret = self
            .jobs
            .update_one(
                doc! {"id": id, "status": "started"},
                doc! {"$set": {
                    "status": "canceled",
                    "finished_at": now_micros(),
                    "worker_id": Bson::Null,
                    "lease_until": Bson::Null,
                }},
                None,
            )
            .await?;
        if ret.matched_count == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn delete_job(&self, id: &str, ttl_micros: i64) -> Result<bool> {
        if ttl_micros <= 0 {
            let ret = self.jobs.delete_one(doc! {"id": id}, None).await?;
            return Ok(ret.deleted_count > 0);
        }
        let ret = self
            .jobs
            .update_one(
                doc! {"id": id},
                doc! {"$set": {"purge_at": now_micros() + ttl_micros}},
                None,
            )
            .await?;
        Ok(ret.matched_count > 0)
    }

    async fn get_result(&self, id: &str) -> Result<Option<json::Value>> {
        let job = self
            .load_job(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if job.result_expires_at.is_some_and(|e| e <= now_micros()) {
            return Ok(None);
        }
        Ok(job.result)
    }

    async fn delete_result(&self, id: &str) -> Result<bool> {
        let ret = self
            .jobs
            .update_one(
                doc! {"id": id, "result": {"$ne": Bson::Null}},
                doc! {"$unset": {"result": "", "result_expires_at": ""}},
                None,
            )
            .await?;
        Ok(ret.modified_count > 0)
    }

    async fn put_schedule(
        &self,
        schedule: &Schedule,
        conflict: ConflictPolicy,
    ) -> Result<String> {
        let existing = self
            .schedules
            .find_one(doc! {"id": &schedule.id}, None)
            .await?;
        let doc = mongodb::bson::to_document(schedule)
            .map_err(|e| Error::Message(format!("bson encode schedule error: {e}")))?;
        match existing {
            None => {
                self.schedules.insert_one(doc, None).await?;
            }
            Some(_) if conflict == ConflictPolicy::DoNothing => {
                log::info!(
                    "[MONGODB] schedule {} exists, conflict policy keeps the old one",
                    schedule.id
                );
            }
            Some(old) => {
                let mut doc = doc;
                if conflict == ConflictPolicy::Update {
                    let old = Self::doc_schedule(old)?;
                    doc.insert(
                        "next_fire_at",
                        old.next_fire_at.map(Bson::Int64).unwrap_or(Bson::Null),
                    );
                    doc.insert(
                        "last_fire_at",
                        old.last_fire_at.map(Bson::Int64).unwrap_or(Bson::Null),
                    );
                    doc.insert("paused", old.paused);
                    doc.insert("created_at", old.created_at);
                }
                self.schedules
                    .replace_one(doc! {"id": &schedule.id}, doc, None)
                    .await?;
            }
        }
        Ok(schedule.id.clone())
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<Schedule>> {
        let doc = self.schedules.find_one(doc! {"id": id}, None).await?;
        doc.map(Self::doc_schedule).transpose()
    }

    async fn list_schedules(&self, queue: Option<&str>) -> Result<Vec<Schedule>> {
        let filter = match queue {
            Some(q) => doc! {"queue": q},
            None => doc! {},
        };
        let docs: Vec<Document> = self
            .schedules
            .find(filter, None)
            .await?
            .try_collect()
            .await?;
        docs.into_iter().map(Self::doc_schedule).collect()
    }

    async fn delete_schedule(&self, id: &str) -> Result<bool> {
        let ret = self.schedules.delete_one(doc! {"id": id}, None).await?;
        Ok(ret.deleted_count > 0)
    }

    async fn set_schedule_paused(&self, id: &str, paused: bool) -> Result<bool> {
        let ret = self
            .schedules
            .update_one(doc! {"id": id}, doc! {"$set": {"paused": paused}}, None)
            .await?;
        Ok(ret.matched_count > 0)
    }

    async fn due_schedules(&self, now: i64) -> Result<Vec<Schedule>> {
        let docs: Vec<Document> = self
            .schedules
            .find(
                doc! {"paused": false, "next_fire_at": {"$ne": Bson::Null, "$lte": now}},
                None,
            )
            .await?
            .try_collect()
            .await?;
        docs.into_iter().map(Self::doc_schedule).collect()
    }

    async fn record_schedule_fired(
        &self,
        id: &str,
        last_fire_at: i64,
        next_fire_at: Option<i64>,
    ) -> Result<()> {
        let next = next_fire_at.map(Bson::Int64).unwrap_or(Bson::Null);
        let ret = self
            .schedules
            .update_one(
                doc! {"id": id},
                doc! {"$set": {"last_fire_at": last_fire_at, "next_fire_at": next}},
                None,
            )
            .await?;
        if ret.matched_count == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn running_jobs_for_schedule(&self, schedule_id: &str) -> Result<u32> {
        let count = self
            .jobs
            .count_documents(
                doc! {"schedule_id": schedule_id, "status": {"$in": ["queued", "deferred", "started"]}},
                None,
            )
            .await?;
        Ok(count as u32)
    }

    async fn sweep(&self, now: i64) -> Result<()> {
        self.jobs
            .update_many(
                doc! {"status": "deferred", "scheduled_at": {"$lte": now}},
                doc! {"$set": {"status": "queued"}},
                None,
            )
            .await?;

        let ret = self
            .jobs
            .update_many(
                doc! {"status": "started", "lease_until": {"$lte": now}},
                doc! {
                    "$set": {"status": "queued", "worker_id": Bson::Null, "acquire_token": Bson::Null, "lease_until": Bson::Null},
                    "$inc": {"attempts": 1},
                },
                None,
            )
            .await?;
        if ret.modified_count > 0 {
            log::warn!(
                "[MONGODB] requeued {} jobs with expired leases",
                ret.modified_count
            );
        }

        self.jobs
            .update_many(
                doc! {"result_expires_at": {"$ne": Bson::Null, "$lte": now}},
                doc! {"$unset": {"result": "", "result_expires_at": ""}},
                None,
            )
            .await?;

        self.jobs
            .delete_many(
                doc! {"$or": [
                    {"purge_at": {"$ne": Bson::Null, "$lte": now}},
                    {"ttl_expires_at": {"$ne": Bson::Null, "$lte": now}},
                ]},
                None,
            )
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

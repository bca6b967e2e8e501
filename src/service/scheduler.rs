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

use config::utils::{
    json,
    time::{micros_to_datetime, now_micros},
};
use infra::{
    broker::{Event, EventBroker, EventType},
    errors::Result,
    store::{CoalescePolicy, DataStore, Job, Schedule},
};
use rand::Rng;
use tokio_util::sync::CancellationToken;

/// Scheduler loop: wakes every `interval` seconds, sweeps the store and
/// materializes jobs for due schedules.
pub async fn run(
    store: Arc<dyn DataStore>,
    broker: Arc<dyn EventBroker>,
    interval: u64,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("[SCHEDULER] loop exit");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = tick(&store, &broker).await {
                    log::error!("[SCHEDULER] tick error: {}", e);
                }
            }
        }
    }
}

/// One pass: sweep, then fire every due schedule once according to its
/// coalesce policy.
pub async fn tick(store: &Arc<dyn DataStore>, broker: &Arc<dyn EventBroker>) -> Result<()> {
    let now = now_micros();
    store.sweep(now).await?;

    for schedule in store.due_schedules(now).await? {
        if let Err(e) = fire_schedule(store, broker, &schedule, now).await {
            log::error!("[SCHEDULER] firing schedule {} error: {}", schedule.id, e);
        }
    }
    Ok(())
}

async fn fire_schedule(
    store: &Arc<dyn DataStore>,
    broker: &Arc<dyn EventBroker>,
    schedule: &Schedule,
    now: i64,
) -> Result<()> {
    // walk the trigger over every fire that came due since the last pass
    let mut missed = Vec::new();
    let mut next = schedule.next_fire_at;
    while let Some(at) = next {
        if at > now {
            break;
        }
        missed.push(at);
        next = schedule
            .trigger
            .compute_next(micros_to_datetime(at))
            .map(|t| t.timestamp_micros());
    }

    // fires older than the grace window are discarded
    let eligible: Vec<i64> = missed
        .iter()
        .copied()
        .filter(|at| schedule.misfire_grace == 0 || now - at <= schedule.misfire_grace)
        .collect();

    let fire_times: Vec<i64> = if eligible.is_empty() {
        Vec::new()
    } else {
        match schedule.coalesce {
            // all overdue fires collapse into one job, right now
            CoalescePolicy::Latest => vec![now],
            CoalescePolicy::Earliest => vec![eligible[0]],
            CoalescePolicy::All => eligible,
        }
    };

    let mut allowed = fire_times.len() as i64;
    if schedule.max_running_jobs > 0 {
        let running = store.running_jobs_for_schedule(&schedule.id).await? as i64;
        allowed = (schedule.max_running_jobs as i64 - running).clamp(0, allowed);
        if allowed < fire_times.len() as i64 {
            log::info!(
                "[SCHEDULER] schedule {} at its concurrency cap, skipping {} fires",
                schedule.id,
                fire_times.len() as i64 - allowed
            );
        }
    }

    for &at in fire_times.iter().take(allowed as usize) {
        let jitter = if schedule.max_jitter > 0 {
            rand::thread_rng().gen_range(0..=schedule.max_jitter)
        } else {
            0
        };
        let mut job = Job::new(schedule.func.clone(), &schedule.queue);
        job.args = schedule.args.clone();
        job.kwargs = schedule.kwargs.clone();
        job.result_ttl = schedule.result_ttl;
        job.executor = schedule.executor;
        job.schedule_id = Some(schedule.id.clone());
        let fire_at = at + jitter;
        job.scheduled_at = (fire_at > now).then_some(fire_at);
        store.put_job(&job, false).await?;

        let mut payload = json::Map::new();
        payload.insert("job_id".to_string(), json::Value::from(job.id.as_str()));
        payload.insert("queue".to_string(), json::Value::from(schedule.queue.as_str()));
        if let Err(e) = broker
            .publish(&Event::new(EventType::ScheduleFired, &schedule.id).with_payload(payload))
            .await
        {
            log::error!("[SCHEDULER] publish schedule_fired error: {}", e);
        }
        log::debug!(
            "[SCHEDULER] schedule {} fired job {} on '{}'",
            schedule.id,
            job.id,
            schedule.queue
        );
    }

    store.record_schedule_fired(&schedule.id, now, next).await?;
    if next.is_none() {
        log::info!("[SCHEDULER] schedule {} exhausted, removing", schedule.id);
        store.delete_schedule(&schedule.id).await?;
        if let Err(e) = broker
            .publish(&Event::new(EventType::ScheduleRemoved, &schedule.id))
            .await
        {
            log::error!("[SCHEDULER] publish schedule_removed error: {}", e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use infra::{
        broker::local::LocalBroker,
        store::{ConflictPolicy, FunctionRef, JobStatus},
        trigger::{IntervalTrigger, Trigger},
    };

    use super::*;

    async fn setup() -> (Arc<dyn DataStore>, Arc<dyn EventBroker>) {
        let store: Arc<dyn DataStore> =
            Arc::new(infra::store::memory::MemoryStore::isolated());
        let broker: Arc<dyn EventBroker> = Arc::new(LocalBroker::new());
        (store, broker)
    }

    fn interval_schedule(seconds: i64, start: i64) -> Schedule {
        let trigger = Trigger::interval(IntervalTrigger {
            seconds,
            start,
            ..Default::default()
        })
        .unwrap();
        let mut schedule = Schedule::new(FunctionRef::new("flowerpower", "noop"), trigger, "default");
        // anchor the series in the past so the schedule is due
        schedule.next_fire_at = Some(start);
        schedule
    }

    #[tokio::test]
    async fn test_due_schedule_produces_job() {
        let (store, broker) = setup().await;
        let schedule = interval_schedule(60, now_micros() - 1_000_000);
        store
            .put_schedule(&schedule, ConflictPolicy::DoNothing)
            .await
            .unwrap();

        tick(&store, &broker).await.unwrap();

        let jobs = store.list_jobs(Some("default")).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].schedule_id.as_deref(), Some(schedule.id.as_str()));

        let advanced = store.get_schedule(&schedule.id).await.unwrap().unwrap();
        assert!(advanced.next_fire_at.unwrap() > advanced.last_fire_at.unwrap());
    }

    #[tokio::test]
    async fn test_coalesce_latest_collapses_missed_fires() {
        let (store, broker) = setup().await;
        // fires every 500ms, the scheduler was "down" for three seconds
        let start = now_micros() - 3_000_000;
        let trigger = Trigger::interval(IntervalTrigger {
            microseconds: 500_000,
            start,
            ..Default::default()
        })
        .unwrap();
        let mut schedule =
            Schedule::new(FunctionRef::new("flowerpower", "noop"), trigger, "default");
        schedule.next_fire_at = Some(start);
        schedule.coalesce = CoalescePolicy::Latest;
        store
            .put_schedule(&schedule, ConflictPolicy::DoNothing)
            .await
            .unwrap();

        tick(&store, &broker).await.unwrap();

        // one catch-up job, not six
        let jobs = store.list_jobs(Some("default")).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_coalesce_all_replays_each_fire() {
        let (store, broker) = setup().await;
        let start = now_micros() - 2_500_000;
        let trigger = Trigger::interval(IntervalTrigger {
            seconds: 1,
            start,
            ..Default::default()
        })
        .unwrap();
        let mut schedule =
            Schedule::new(FunctionRef::new("flowerpower", "noop"), trigger, "default");
        schedule.next_fire_at = Some(start);
        schedule.coalesce = CoalescePolicy::All;
        store
            .put_schedule(&schedule, ConflictPolicy::DoNothing)
            .await
            .unwrap();

        tick(&store, &broker).await.unwrap();

        // fires at start, +1s, +2s are all overdue
        let jobs = store.list_jobs(Some("default")).await.unwrap();
        assert_eq!(jobs.len(), 3);
    }

    #[tokio::test]
    async fn test_paused_schedule_never_fires() {
        let (store, broker) = setup().await;
        let mut schedule = interval_schedule(1, now_micros() - 5_000_000);
        schedule.paused = true;
        store
            .put_schedule(&schedule, ConflictPolicy::DoNothing)
            .await
            .unwrap();

        tick(&store, &broker).await.unwrap();
        assert!(store.list_jobs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_date_trigger_fires_once_and_schedule_is_removed() {
        let (store, broker) = setup().await;
        let run_at = now_micros() - 1_000;
        let trigger = Trigger::date(run_at);
        let mut schedule =
            Schedule::new(FunctionRef::new("flowerpower", "noop"), trigger, "default");
        schedule.next_fire_at = Some(run_at);
        store
            .put_schedule(&schedule, ConflictPolicy::DoNothing)
            .await
            .unwrap();

        tick(&store, &broker).await.unwrap();

        assert_eq!(store.list_jobs(None).await.unwrap().len(), 1);
        assert!(store.get_schedule(&schedule.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_misfire_grace_discards_stale_fires() {
        let (store, broker) = setup().await;
        let start = now_micros() - 10_000_000;
        let trigger = Trigger::interval(IntervalTrigger {
            seconds: 1,
            start,
            ..Default::default()
        })
        .unwrap();
        let mut schedule =
            Schedule::new(FunctionRef::new("flowerpower", "noop"), trigger, "default");
        schedule.next_fire_at = Some(start);
        schedule.coalesce = CoalescePolicy::All;
        // only fires from the last ~1.5 seconds may still run
        schedule.misfire_grace = 1_500_000;
        store
            .put_schedule(&schedule, ConflictPolicy::DoNothing)
            .await
            .unwrap();

        tick(&store, &broker).await.unwrap();

        let jobs = store.list_jobs(None).await.unwrap();
        assert!(jobs.len() <= 2, "expected stale fires dropped, got {}", jobs.len());
        assert!(!jobs.is_empty());
    }

    #[tokio::test]
    async fn test_max_running_jobs_cap() {
        let (store, broker) = setup().await;
        let start = now_micros() - 5_000_000;
        let trigger = Trigger::interval(IntervalTrigger {
            seconds: 1,
            start,
            ..Default::default()
        })
        .unwrap();
        let mut schedule =
            Schedule::new(FunctionRef::new("flowerpower", "noop"), trigger, "default");
        schedule.next_fire_at = Some(start);
        schedule.coalesce = CoalescePolicy::All;
        schedule.max_running_jobs = 2;
        store
            .put_schedule(&schedule, ConflictPolicy::DoNothing)
            .await
            .unwrap();

        tick(&store, &broker).await.unwrap();
        assert_eq!(store.list_jobs(None).await.unwrap().len(), 2);
    }
}

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

use config::utils::json;
use infra::store::{FunctionRef, RetryPolicy};

use crate::service::{
    queue::{AddJobOptions, AddScheduleOptions, QueueManager, ResultSelector, TriggerSpec},
    worker,
};

pub async fn cli() -> Result<bool, anyhow::Error> {
    let app = clap::Command::new("flowerpower")
        .version(clap::crate_version!())
        .about(clap::crate_description!())
        .subcommands(&[
            clap::Command::new("start-worker")
                .about("start a worker processing jobs from the configured queues")
                .arg(
                    clap::Arg::new("queues")
                        .short('q')
                        .long("queues")
                        .help("comma separated queue names, default is all"),
                ),
            clap::Command::new("start-worker-pool")
                .about("start a pool of workers")
                .arg(
                    clap::Arg::new("num-workers")
                        .short('n')
                        .long("num-workers")
                        .help("number of workers, default is the configured value or the cpu count"),
                )
                .arg(
                    clap::Arg::new("queues")
                        .short('q')
                        .long("queues")
                        .help("comma separated queue names, default is all"),
                ),
            clap::Command::new("start-scheduler")
                .about("run the schedule firing loop"),
            clap::Command::new("add-job")
                .about("enqueue a job")
                .args(job_args()),
            clap::Command::new("run-job")
                .about("enqueue a job and wait for its result")
                .args(job_args()),
            clap::Command::new("add-schedule")
                .about("add a recurring or future dated schedule")
                .arg(
                    clap::Arg::new("func")
                        .short('f')
                        .long("func")
                        .required(true)
                        .help("function reference, module:name"),
                )
                .arg(clap::Arg::new("cron").long("cron").help("cron expression"))
                .arg(
                    clap::Arg::new("interval")
                        .long("interval")
                        .help("interval in seconds"),
                )
                .arg(
                    clap::Arg::new("date")
                        .long("date")
                        .help("single fire time as a unix timestamp in seconds"),
                )
                .arg(clap::Arg::new("id").long("id").help("schedule id"))
                .arg(clap::Arg::new("queue").long("queue").help("queue name"))
                .arg(
                    clap::Arg::new("coalesce")
                        .long("coalesce")
                        .help("latest, earliest or all"),
                ),
            clap::Command::new("show-job-result")
                .about("show the result of a job")
                .arg(clap::Arg::new("id").required(true))
                .arg(
                    clap::Arg::new("wait")
                        .long("wait")
                        .action(clap::ArgAction::SetTrue)
                        .help("block until the job finishes"),
                ),
            clap::Command::new("show-schedule-results")
                .about("show the results a schedule has produced")
                .arg(clap::Arg::new("id").required(true))
                .arg(
                    clap::Arg::new("selector")
                        .long("selector")
                        .default_value("all")
                        .help("index, start:end, list of indices, all, latest or earliest"),
                ),
            clap::Command::new("cancel-job")
                .about("cancel a job")
                .arg(clap::Arg::new("id").required(true)),
            clap::Command::new("cancel-all-jobs")
                .about("cancel every job")
                .arg(clap::Arg::new("queue").long("queue")),
            clap::Command::new("delete-job")
                .about("delete a job")
                .arg(clap::Arg::new("id").required(true)),
            clap::Command::new("delete-all-jobs")
                .about("delete every job")
                .arg(clap::Arg::new("queue").long("queue")),
            clap::Command::new("pause-schedule")
                .about("pause a schedule")
                .arg(clap::Arg::new("id").required(true)),
            clap::Command::new("resume-schedule")
                .about("resume a paused schedule")
                .arg(clap::Arg::new("id").required(true)),
            clap::Command::new("cancel-schedule")
                .about("remove a schedule")
                .arg(clap::Arg::new("id").required(true)),
            clap::Command::new("delete-schedule")
                .about("remove a schedule")
                .arg(clap::Arg::new("id").required(true)),
            clap::Command::new("show-jobs")
                .about("list jobs")
                .arg(clap::Arg::new("queue").long("queue")),
            clap::Command::new("show-schedules").about("list schedules"),
            clap::Command::new("show-job-ids")
                .about("list job ids")
                .arg(clap::Arg::new("queue").long("queue")),
            clap::Command::new("show-schedule-ids").about("list schedule ids"),
            clap::Command::new("exec-job")
                .hide(true)
                .about("run one claimed job in this process")
                .arg(clap::Arg::new("id").long("id").required(true)),
        ])
        .get_matches();

    let Some((name, command)) = app.subcommand() else {
        return Ok(false);
    };

    let manager = QueueManager::from_config().await?;
    match name {
        "start-worker" | "start-worker-pool" => {
            let queues = command
                .get_one::<String>("queues")
                .map(|q| q.split(',').map(|s| s.trim().to_string()).collect());
            let num_workers = if name == "start-worker" {
                Some(1)
            } else {
                command
                    .get_one::<String>("num-workers")
                    .map(|n| n.parse())
                    .transpose()?
            };
            manager.start_worker_pool(num_workers, true, queues).await?;
            tokio::signal::ctrl_c().await?;
            log::info!("[CLI] shutting down");
            manager.close().await?;
        }
        "start-scheduler" => {
            manager.start_scheduler().await?;
            log::info!("[CLI] scheduler running");
            tokio::signal::ctrl_c().await?;
            manager.close().await?;
        }
        "add-job" => {
            let (func, opts) = parse_job(command)?;
            let id = manager.add_job(func, opts).await?;
            println!("{id}");
        }
        "run-job" => {
            let (func, opts) = parse_job(command)?;
            manager.start_worker_pool(Some(1), true, None).await?;
            let result = manager.run_job(func, opts).await?;
            manager.close().await?;
            println!("{}", json::to_string(&result)?);
        }
        "add-schedule" => {
            let func: FunctionRef = command
                .get_one::<String>("func")
                .expect("required")
                .parse()?;
            let trigger = match (
                command.get_one::<String>("cron"),
                command.get_one::<String>("interval"),
                command.get_one::<String>("date"),
            ) {
                (Some(cron), None, None) => TriggerSpec::Cron(cron.clone()),
                (None, Some(secs), None) => {
                    TriggerSpec::Interval(Duration::from_secs(secs.parse()?))
                }
                (None, None, Some(at)) => TriggerSpec::Date(at.parse::<i64>()? * 1_000_000),
                _ => {
                    return Err(anyhow::anyhow!(
                        "exactly one of --cron, --interval or --date is required"
                    ));
                }
            };
            let opts = AddScheduleOptions {
                schedule_id: command.get_one::<String>("id").cloned(),
                queue: command.get_one::<String>("queue").cloned(),
                coalesce: command
                    .get_one::<String>("coalesce")
                    .map(|c| c.as_str().into()),
                ..Default::default()
            };
            let id = manager.add_schedule(func, trigger, opts).await?;
            println!("{id}");
        }
        "show-job-result" => {
            let id = command.get_one::<String>("id").expect("required");
            let wait = command
                .get_flag("wait")
                .then(|| Duration::from_secs(config::get_config().limit.job_timeout));
            match manager.get_job_result(id, wait, false).await? {
                Some(value) => println!("{}", json::to_string(&value)?),
                None => println!("job {id} has no result yet"),
            }
        }
        "show-schedule-results" => {
            let id = command.get_one::<String>("id").expect("required");
            let selector: ResultSelector = command
                .get_one::<String>("selector")
                .expect("defaulted")
                .parse()?;
            for result in manager.schedule_results(id, selector).await? {
                println!("{}", json::to_string(&result)?);
            }
        }
        "cancel-job" => {
            let id = command.get_one::<String>("id").expect("required");
            println!("{}", manager.cancel_job(id).await?);
        }
        "cancel-all-jobs" => {
            let queue = command.get_one::<String>("queue").map(|q| q.as_str());
            println!("canceled {} jobs", manager.cancel_all_jobs(queue).await?);
        }
        "delete-job" => {
            let id = command.get_one::<String>("id").expect("required");
            println!("{}", manager.delete_job(id, None).await?);
        }
        "delete-all-jobs" => {
            let queue = command.get_one::<String>("queue").map(|q| q.as_str());
            println!("deleted {} jobs", manager.delete_all_jobs(queue).await?);
        }
        "pause-schedule" => {
            let id = command.get_one::<String>("id").expect("required");
            println!("{}", manager.pause_schedule(id).await?);
        }
        "resume-schedule" => {
            let id = command.get_one::<String>("id").expect("required");
            println!("{}", manager.resume_schedule(id).await?);
        }
        "cancel-schedule" | "delete-schedule" => {
            let id = command.get_one::<String>("id").expect("required");
            println!("{}", manager.cancel_schedule(id).await?);
        }
        "show-jobs" => {
            let queue = command.get_one::<String>("queue").map(|q| q.as_str());
            for job in manager.get_jobs(queue).await? {
                println!("{}\t{}\t{}\t{}", job.id, job.queue, job.status, job.func);
            }
        }
        "show-schedules" => {
            for schedule in manager.get_schedules(None).await? {
                println!(
                    "{}\t{}\t{}\t{}\tpaused={}",
                    schedule.id,
                    schedule.queue,
                    schedule.trigger.kind_str(),
                    schedule.func,
                    schedule.paused
                );
            }
        }
        "show-job-ids" => {
            let queue = command.get_one::<String>("queue").map(|q| q.as_str());
            for id in manager.job_ids(queue).await? {
                println!("{id}");
            }
        }
        "show-schedule-ids" => {
            for id in manager.schedule_ids(None).await? {
                println!("{id}");
            }
        }
        "exec-job" => {
            let id = command.get_one::<String>("id").expect("required");
            worker::execute_single(id).await?;
        }
        _ => {
            return Err(anyhow::anyhow!("unknown command: {name}"));
        }
    }
    Ok(true)
}

fn job_args() -> Vec<clap::Arg> {
    vec![
        clap::Arg::new("func")
            .short('f')
            .long("func")
            .required(true)
            .help("function reference, module:name"),
        clap::Arg::new("args")
            .long("args")
            .help("positional arguments as a JSON array"),
        clap::Arg::new("kwargs")
            .long("kwargs")
            .help("keyword arguments as a JSON object"),
        clap::Arg::new("queue").long("queue").help("queue name"),
        clap::Arg::new("run-in")
            .long("run-in")
            .help("delay in seconds before the job becomes eligible"),
        clap::Arg::new("retry")
            .long("retry")
            .help("maximum retry attempts"),
        clap::Arg::new("result-ttl")
            .long("result-ttl")
            .help("seconds to keep the result"),
    ]
}

fn parse_job(command: &clap::ArgMatches) -> Result<(FunctionRef, AddJobOptions), anyhow::Error> {
    let func: FunctionRef = command
        .get_one::<String>("func")
        .expect("required")
        .parse()?;
    let args = match command.get_one::<String>("args") {
        Some(raw) => json::from_str(raw)?,
        None => Vec::new(),
    };
    let kwargs = match command.get_one::<String>("kwargs") {
        Some(raw) => json::from_str(raw)?,
        None => json::Map::new(),
    };
    let opts = AddJobOptions {
        args,
        kwargs,
        queue: command.get_one::<String>("queue").cloned(),
        run_in: command
            .get_one::<String>("run-in")
            .map(|s| s.parse::<u64>().map(Duration::from_secs))
            .transpose()?,
        retry: command
            .get_one::<String>("retry")
            .map(|s| s.parse::<u32>())
            .transpose()?
            .map(|max| RetryPolicy { max, delay: 0 }),
        result_ttl: command
            .get_one::<String>("result-ttl")
            .map(|s| s.parse::<u64>().map(Duration::from_secs))
            .transpose()?,
        ..Default::default()
    };
    Ok((func, opts))
}

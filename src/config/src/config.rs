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

use arc_swap::ArcSwap;
use dotenv_config::EnvConfig;
use dotenvy::dotenv_override;
use hashbrown::HashMap;
use once_cell::sync::Lazy;

use crate::utils::json;

pub const EVENT_CHANNEL: &str = "flowerpower_events";
pub const EVENT_TOPIC: &str = "flowerpower/worker";
pub const DEFAULT_QUEUE: &str = "default";

static CONFIG: Lazy<ArcSwap<Config>> = Lazy::new(|| ArcSwap::from(Arc::new(init())));

pub fn get_config() -> Arc<Config> {
    CONFIG.load().clone()
}

pub fn refresh_config() -> Result<(), anyhow::Error> {
    CONFIG.store(Arc::new(init()));
    Ok(())
}

fn init() -> Config {
    dotenv_override().ok();
    let mut cfg = Config::init().expect("config load error");
    if let Err(e) = check_config(&mut cfg) {
        panic!("config check error: {e}");
    }
    cfg
}

#[derive(EnvConfig)]
pub struct Config {
    pub common: Common,
    pub limit: Limit,
    pub backend: BackendEnv,
    pub worker: WorkerEnv,
}

#[derive(EnvConfig)]
pub struct Common {
    #[env_config(name = "FP_APP_NAME", default = "flowerpower")]
    pub app_name: String,
    #[env_config(name = "FLOWERPOWER_BASE_DIR", default = "./")]
    pub base_dir: String,
    // JSON map of filesystem storage options, passed through to the
    // filesystem collaborator untouched
    #[env_config(name = "FLOWERPOWER_STORAGE_OPTIONS", default = "")]
    pub storage_options: String,
    #[env_config(name = "FP_DATA_DIR", default = "./data/flowerpower/")]
    pub data_dir: String,
    // comma separated queue names served by this deployment
    #[env_config(name = "FP_QUEUES", default = "default")]
    pub queues: String,
}

#[derive(EnvConfig)]
pub struct Limit {
    #[env_config(name = "FP_SQL_MIN_DB_CONNECTIONS", default = 2)]
    pub sql_min_db_connections: u32,
    #[env_config(name = "FP_SQL_MAX_DB_CONNECTIONS", default = 20)]
    pub sql_max_db_connections: u32,
    // seconds between scheduler wake-ups and store sweeps
    #[env_config(name = "FP_CLEANUP_INTERVAL", default = 1)]
    pub cleanup_interval: u64,
    #[env_config(name = "FP_WORKER_POLL_INTERVAL_MS", default = 200)]
    pub worker_poll_interval_ms: u64,
    // seconds a worker may hold an acquired job before the sweeper
    // returns it to the queue
    #[env_config(name = "FP_JOB_LEASE_TIMEOUT", default = 300)]
    pub job_lease_timeout: u64,
    // default bound, in seconds, for synchronous waits (run_job,
    // get_job_result with wait)
    #[env_config(name = "FP_JOB_TIMEOUT", default = 300)]
    pub job_timeout: u64,
    #[env_config(name = "FP_MAX_CONCURRENT_JOBS", default = 100)]
    pub max_concurrent_jobs: usize,
}

#[derive(EnvConfig)]
pub struct BackendEnv {
    // memory, sqlite, postgresql, mysql, mongodb, redis, mqtt, nats-kv
    #[env_config(name = "FP_BACKEND_TYPE", default = "memory")]
    pub backend_type: String,
    #[env_config(name = "FP_BACKEND_URI", default = "")]
    pub backend_uri: String,
    #[env_config(name = "FP_BACKEND_SCHEMA", default = "flowerpower")]
    pub schema: String,
    #[env_config(name = "FP_EVENT_BROKER_TYPE", default = "")]
    pub event_broker_type: String,
    #[env_config(name = "FP_EVENT_BROKER_URI", default = "")]
    pub event_broker_uri: String,
    #[env_config(name = "FP_BACKEND_SSL", default = false)]
    pub ssl: bool,
}

#[derive(EnvConfig)]
pub struct WorkerEnv {
    // 0 means number of cpu cores
    #[env_config(name = "FP_WORKER_NUM_WORKERS", default = 0)]
    pub num_workers: usize,
    // async, thread-pool or process-pool
    #[env_config(name = "FP_JOB_EXECUTOR", default = "async")]
    pub job_executor: String,
    // seconds to wait for cooperative shutdown before killing workers
    #[env_config(name = "FP_WORKER_SHUTDOWN_TIMEOUT", default = 10)]
    pub shutdown_timeout: u64,
    // default seconds a finished job result is retained, 0 keeps nothing
    #[env_config(name = "FP_RESULT_TTL", default = 600)]
    pub result_ttl: u64,
}

fn check_config(cfg: &mut Config) -> Result<(), anyhow::Error> {
    if cfg.common.queues.trim().is_empty() {
        cfg.common.queues = DEFAULT_QUEUE.to_string();
    }
    if !cfg.common.data_dir.ends_with('/') {
        cfg.common.data_dir = format!("{}/", cfg.common.data_dir);
    }
    if !cfg.common.storage_options.is_empty() {
        // must be a JSON object when set
        let parsed: Result<HashMap<String, json::Value>, _> =
            json::from_str(&cfg.common.storage_options);
        if parsed.is_err() {
            return Err(anyhow::anyhow!(
                "FLOWERPOWER_STORAGE_OPTIONS must be a JSON object"
            ));
        }
    }
    if cfg.limit.cleanup_interval == 0 {
        cfg.limit.cleanup_interval = 1;
    }
    if cfg.limit.sql_min_db_connections > cfg.limit.sql_max_db_connections {
        cfg.limit.sql_max_db_connections = cfg.limit.sql_min_db_connections;
    }
    match cfg.worker.job_executor.as_str() {
        "async" | "thread-pool" | "process-pool" => {}
        _ => {
            return Err(anyhow::anyhow!(
                "FP_JOB_EXECUTOR must be one of async, thread-pool, process-pool"
            ));
        }
    }
    Ok(())
}

pub fn queue_names() -> Vec<String> {
    get_config()
        .common
        .queues
        .split(',')
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = get_config();
        assert_eq!(cfg.common.app_name, "flowerpower");
        assert!(!queue_names().is_empty());
        assert!(cfg.limit.cleanup_interval >= 1);
    }
}

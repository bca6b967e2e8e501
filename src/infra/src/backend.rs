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

use config::meta::backend::BackendKind;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Where a worker runs the job body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum JobExecutor {
    #[default]
    Async,
    ThreadPool,
    ProcessPool,
}

impl From<&str> for JobExecutor {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "thread-pool" | "thread_pool" | "thread" => JobExecutor::ThreadPool,
            "process-pool" | "process_pool" | "process" => JobExecutor::ProcessPool,
            _ => JobExecutor::Async,
        }
    }
}

impl std::fmt::Display for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            JobExecutor::Async => write!(f, "async"),
            JobExecutor::ThreadPool => write!(f, "thread-pool"),
            JobExecutor::ProcessPool => write!(f, "process-pool"),
        }
    }
}

/// Backend kinds a queue style deployment accepts.
pub const QUEUE_KINDS: &[BackendKind] = &[BackendKind::Redis, BackendKind::Memory];

/// Backend kinds a scheduler data store accepts.
pub const DATA_STORE_KINDS: &[BackendKind] = &[
    BackendKind::Postgres,
    BackendKind::Mysql,
    BackendKind::Sqlite,
    BackendKind::Mongodb,
    BackendKind::Memory,
];

/// Backend kinds an event broker accepts.
pub const EVENT_BROKER_KINDS: &[BackendKind] = &[
    BackendKind::Postgres,
    BackendKind::Mqtt,
    BackendKind::Redis,
    BackendKind::Memory,
];

/// Connection parts a caller may supply; everything is optional, missing
/// parts fall back to environment variables and kind defaults.
#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
    pub uri: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub schema: Option<String>,
    pub ssl: bool,
}

/// Immutable descriptor of a configured backend. Built once, then handed to
/// data store / event broker constructors; never mutated afterwards.
#[derive(Debug, Clone)]
pub struct Backend {
    pub kind: BackendKind,
    pub uri: String,
    pub schema: String,
    pub queues: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub ssl: bool,
    // tuning, excluded from equality
    pub cleanup_interval: u64,
    pub max_concurrent_jobs: usize,
    pub default_job_executor: JobExecutor,
}

impl PartialEq for Backend {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.uri == other.uri
            && self.schema == other.schema
            && self.queues == other.queues
            && self.username == other.username
            && self.password == other.password
            && self.host == other.host
            && self.port == other.port
            && self.database == other.database
            && self.ssl == other.ssl
    }
}

impl Backend {
    pub fn new(kind: BackendKind, opts: BackendOptions, accepted: &[BackendKind]) -> Result<Self> {
        if !accepted.contains(&kind) {
            return Err(Error::InvalidBackendKind(format!(
                "{kind}, valid kinds: {}",
                accepted
                    .iter()
                    .map(|k| k.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        let cfg = config::get_config();
        let host = opts.host.or_else(|| env_part(kind, "HOST"));
        let port = opts
            .port
            .or_else(|| env_part(kind, "PORT").and_then(|v: String| v.parse().ok()));
        let username = opts.username.or_else(|| env_part(kind, "USER"));
        let password = opts.password.or_else(|| env_part(kind, "PASSWORD"));
        let database = opts.database.or_else(|| env_part(kind, "DATABASE"));
        let ssl = opts.ssl;

        let uri = match opts.uri {
            Some(uri) if !uri.is_empty() => uri,
            _ => kind.build_uri(
                host.as_deref(),
                port,
                username.as_deref(),
                password.as_deref(),
                database.as_deref(),
                ssl,
            ),
        };

        Ok(Self {
            kind,
            uri,
            schema: opts
                .schema
                .unwrap_or_else(|| cfg.backend.schema.clone()),
            queues: config::queue_names(),
            username,
            password,
            host,
            port,
            database,
            ssl,
            cleanup_interval: cfg.limit.cleanup_interval,
            max_concurrent_jobs: cfg.limit.max_concurrent_jobs,
            default_job_executor: JobExecutor::from(cfg.worker.job_executor.as_str()),
        })
    }

    /// Descriptor for the redis style queue broker.
    pub fn for_queue(kind: BackendKind, opts: BackendOptions) -> Result<Self> {
        Self::new(kind, opts, QUEUE_KINDS)
    }

    /// Descriptor for the scheduler data store.
    pub fn for_data_store(kind: BackendKind, opts: BackendOptions) -> Result<Self> {
        Self::new(kind, opts, DATA_STORE_KINDS)
    }

    /// Descriptor for the event broker.
    pub fn for_event_broker(kind: BackendKind, opts: BackendOptions) -> Result<Self> {
        Self::new(kind, opts, EVENT_BROKER_KINDS)
    }

    /// Descriptor built from the process configuration.
    pub fn from_config() -> Result<Self> {
        let cfg = config::get_config();
        let kind = BackendKind::from(cfg.backend.backend_type.as_str());
        let opts = BackendOptions {
            uri: if cfg.backend.backend_uri.is_empty() {
                None
            } else {
                Some(cfg.backend.backend_uri.clone())
            },
            ssl: cfg.backend.ssl,
            ..Default::default()
        };
        let accepted: Vec<BackendKind> = DATA_STORE_KINDS
            .iter()
            .chain(QUEUE_KINDS.iter())
            .copied()
            .collect();
        Self::new(kind, opts, &accepted)
    }
}

fn env_part(kind: BackendKind, part: &str) -> Option<String> {
    let prefix = match kind {
        BackendKind::Postgres => "POSTGRES",
        BackendKind::Mysql => "MYSQL",
        BackendKind::Mongodb => "MONGODB",
        BackendKind::Redis => "REDIS",
        BackendKind::Mqtt => "MQTT",
        BackendKind::NatsKv => "NATS",
        BackendKind::Sqlite | BackendKind::Memory => return None,
    };
    std::env::var(format!("{prefix}_{part}")).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepted_set_enforced() {
        let err = Backend::for_queue(BackendKind::Postgres, BackendOptions::default());
        assert!(matches!(err, Err(Error::InvalidBackendKind(_))));
        let ok = Backend::for_queue(BackendKind::Memory, BackendOptions::default());
        assert!(ok.is_ok());
    }

    #[test]
    fn test_uri_computed_when_absent() {
        let b = Backend::for_data_store(
            BackendKind::Postgres,
            BackendOptions {
                host: Some("db1".to_string()),
                database: Some("flower".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(b.uri, "postgresql://db1:5432/flower");
    }

    #[test]
    fn test_explicit_uri_wins() {
        let b = Backend::for_event_broker(
            BackendKind::Redis,
            BackendOptions {
                uri: Some("redis://cache:6380/2".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(b.uri, "redis://cache:6380/2");
    }

    #[test]
    fn test_equality_ignores_tuning() {
        let a = Backend::for_data_store(BackendKind::Memory, BackendOptions::default()).unwrap();
        let mut b = a.clone();
        b.cleanup_interval += 100;
        b.max_concurrent_jobs += 7;
        assert_eq!(a, b);
    }

    #[test]
    fn test_executor_from_str() {
        assert_eq!(JobExecutor::from("thread-pool"), JobExecutor::ThreadPool);
        assert_eq!(JobExecutor::from("process"), JobExecutor::ProcessPool);
        assert_eq!(JobExecutor::from("whatever"), JobExecutor::Async);
    }
}

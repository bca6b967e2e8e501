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
use config::{meta::backend::BackendKind, utils::json};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};

use crate::{
    backend::Backend,
    errors::{Error, Result},
};

pub mod local;
pub mod mqtt;
pub mod postgres;
pub mod redis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    JobEnqueued,
    JobAcquired,
    JobCompleted,
    JobFailed,
    JobCanceled,
    ScheduleAdded,
    ScheduleFired,
    ScheduleRemoved,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            EventType::JobEnqueued => write!(f, "job_enqueued"),
            EventType::JobAcquired => write!(f, "job_acquired"),
            EventType::JobCompleted => write!(f, "job_completed"),
            EventType::JobFailed => write!(f, "job_failed"),
            EventType::JobCanceled => write!(f, "job_canceled"),
            EventType::ScheduleAdded => write!(f, "schedule_added"),
            EventType::ScheduleFired => write!(f, "schedule_fired"),
            EventType::ScheduleRemoved => write!(f, "schedule_removed"),
        }
    }
}

/// Wire envelope. Events for one entity id are delivered in publish order;
/// delivery is at least once, so handlers must be idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub entity_id: String,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub payload: json::Map<String, json::Value>,
}

impl Event {
    pub fn new(event_type: EventType, entity_id: &str) -> Self {
        Self {
            event_type,
            entity_id: entity_id.to_string(),
            timestamp_ms: config::utils::time::now_millis(),
            payload: json::Map::new(),
        }
    }

    pub fn with_payload(mut self, payload: json::Map<String, json::Value>) -> Self {
        self.payload = payload;
        self
    }
}

/// Handle returned by subscribe; dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait EventBroker: Sync + Send + 'static {
    /// Fire and forget: returns once the broker acknowledged the event.
    async fn publish(&self, event: &Event) -> Result<()>;

    /// Register a receiver for all events, or only one type.
    async fn subscribe(&self, event_type: Option<EventType>) -> Result<Subscription>;

    async fn close(&self) -> Result<()>;
}

pub async fn connect(backend: &Backend) -> Result<Box<dyn EventBroker>> {
    let broker: Box<dyn EventBroker> = match backend.kind {
        BackendKind::Postgres => Box::new(postgres::PostgresBroker::connect(backend).await?),
        BackendKind::Redis => Box::new(redis::RedisBroker::connect(backend).await?),
        BackendKind::Mqtt => Box::new(mqtt::MqttBroker::connect(backend).await?),
        BackendKind::Memory => Box::new(local::LocalBroker::new()),
        kind => return Err(Error::InvalidBackendKind(kind.to_string())),
    };
    Ok(broker)
}

/// Subscriber registry shared by every realization; closed receivers are
/// dropped on the next publish.
pub(crate) type Subscribers = Arc<RwLock<Vec<(Option<EventType>, mpsc::Sender<Event>)>>>;

pub(crate) fn new_subscribers() -> Subscribers {
    Arc::new(RwLock::new(Vec::new()))
}

pub(crate) async fn add_subscriber(
    subscribers: &Subscribers,
    event_type: Option<EventType>,
) -> Subscription {
    let (tx, rx) = mpsc::channel(1024);
    subscribers.write().await.push((event_type, tx));
    Subscription { rx }
}

pub(crate) async fn fan_out(subscribers: &Subscribers, event: &Event) {
    let mut closed = false;
    {
        let subs = subscribers.read().await;
        for (filter, tx) in subs.iter() {
            if filter.is_none_or(|t| t == event.event_type) {
                if tx.send(event.clone()).await.is_err() {
                    closed = true;
                }
            }
        }
    }
    if closed {
        subscribers.write().await.retain(|(_, tx)| !tx.is_closed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_envelope_roundtrip() {
        let mut payload = json::Map::new();
        payload.insert("queue".to_string(), json::Value::from("fast"));
        let event = Event::new(EventType::JobEnqueued, "job-1").with_payload(payload);
        let s = json::to_string(&event).unwrap();
        let back: Event = json::from_str(&s).unwrap();
        assert_eq!(event, back);
        assert!(back.timestamp_ms > 0);
    }
}

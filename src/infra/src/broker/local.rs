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
use once_cell::sync::Lazy;

use super::{add_subscriber, fan_out, new_subscribers, Event, EventBroker, EventType,
    Subscribers, Subscription};
use crate::errors::Result;

// one registry per process, so every in-process client sees the same events
static GLOBAL: Lazy<Subscribers> = Lazy::new(new_subscribers);

/// In-process channel fan-out, used by the memory backend and in tests.
pub struct LocalBroker {
    subscribers: Subscribers,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self {
            subscribers: GLOBAL.clone(),
        }
    }

    /// Private registry, detached from the process-wide one.
    pub fn isolated() -> Self {
        Self {
            subscribers: new_subscribers(),
        }
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBroker for LocalBroker {
    async fn publish(&self, event: &Event) -> Result<()> {
        fan_out(&self.subscribers, event).await;
        Ok(())
    }

    async fn subscribe(&self, event_type: Option<EventType>) -> Result<Subscription> {
        Ok(add_subscriber(&self.subscribers, event_type).await)
    }

    async fn close(&self) -> Result<()> {
        // nothing to release; the registry may be shared process-wide
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let broker = LocalBroker::isolated();
        let mut sub = broker.subscribe(None).await.unwrap();
        broker
            .publish(&Event::new(EventType::JobEnqueued, "j1"))
            .await
            .unwrap();
        let event = sub.recv().await.unwrap();
        assert_eq!(event.entity_id, "j1");
        assert_eq!(event.event_type, EventType::JobEnqueued);
    }

    #[tokio::test]
    async fn test_type_filter() {
        let broker = LocalBroker::isolated();
        let mut sub = broker
            .subscribe(Some(EventType::JobCompleted))
            .await
            .unwrap();
        broker
            .publish(&Event::new(EventType::JobEnqueued, "j1"))
            .await
            .unwrap();
        broker
            .publish(&Event::new(EventType::JobCompleted, "j1"))
            .await
            .unwrap();
        let event = sub.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::JobCompleted);
    }

    #[tokio::test]
    async fn test_per_id_ordering() {
        let broker = LocalBroker::isolated();
        let mut sub = broker.subscribe(None).await.unwrap();
        broker
            .publish(&Event::new(EventType::JobEnqueued, "j1"))
            .await
            .unwrap();
        broker
            .publish(&Event::new(EventType::JobAcquired, "j1"))
            .await
            .unwrap();
        broker
            .publish(&Event::new(EventType::JobCompleted, "j1"))
            .await
            .unwrap();
        assert_eq!(sub.recv().await.unwrap().event_type, EventType::JobEnqueued);
        assert_eq!(sub.recv().await.unwrap().event_type, EventType::JobAcquired);
        assert_eq!(sub.recv().await.unwrap().event_type, EventType::JobCompleted);
    }
}

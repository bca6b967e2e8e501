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
use config::utils::json;
use futures::StreamExt;
use redis::aio::ConnectionManager;

use super::{
    add_subscriber, fan_out, new_subscribers, Event, EventBroker, EventType, Subscribers,
    Subscription,
};
use crate::{backend::Backend, errors::Result};

const EVENT_CHANNEL: &str = "flowerpower:events";

/// Redis pub/sub broker. For queue deployments it is fused with the data
/// store and shares its multiplexed connection for publishing; subscribing
/// always opens a dedicated connection, pub/sub takes the socket over.
pub struct RedisBroker {
    conn: ConnectionManager,
    subscribers: Subscribers,
}

impl RedisBroker {
    pub async fn connect(backend: &Backend) -> Result<Self> {
        let client = redis::Client::open(backend.uri.as_str())?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Self::from_parts(client, conn).await
    }

    /// Fused with the redis data store: publish on its connection.
    pub async fn from_store(backend: &Backend, conn: ConnectionManager) -> Result<Self> {
        let client = redis::Client::open(backend.uri.as_str())?;
        Self::from_parts(client, conn).await
    }

    pub async fn from_parts(client: redis::Client, conn: ConnectionManager) -> Result<Self> {
        let subscribers = new_subscribers();

        let pubsub_conn = client.get_async_connection().await?;
        let mut pubsub = pubsub_conn.into_pubsub();
        pubsub.subscribe(EVENT_CHANNEL).await?;

        let subs = subscribers.clone();
        tokio::task::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        log::error!("[REDIS] broker payload error: {}", e);
                        continue;
                    }
                };
                match json::from_str::<Event>(&payload) {
                    Ok(event) => fan_out(&subs, &event).await,
                    Err(e) => log::error!("[REDIS] broker decode event error: {}", e),
                }
            }
            log::info!("[REDIS] broker subscription stream closed");
        });

        Ok(Self { conn, subscribers })
    }
}

#[async_trait]
impl EventBroker for RedisBroker {
    async fn publish(&self, event: &Event) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i32 = redis::cmd("PUBLISH")
            .arg(EVENT_CHANNEL)
            .arg(json::to_string(event)?)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, event_type: Option<EventType>) -> Result<Subscription> {
        Ok(add_subscriber(&self.subscribers, event_type).await)
    }

    async fn close(&self) -> Result<()> {
        self.subscribers.write().await.clear();
        Ok(())
    }
}

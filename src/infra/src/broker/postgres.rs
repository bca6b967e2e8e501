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
use config::{utils::json, EVENT_CHANNEL};
use sqlx::{postgres::PgListener, Pool, Postgres};

use super::{
    add_subscriber, fan_out, new_subscribers, Event, EventBroker, EventType, Subscribers,
    Subscription,
};
use crate::{backend::Backend, db, errors::Result};

/// LISTEN/NOTIFY broker. With `from_pool` it shares the data store's
/// connection pool instead of opening its own.
pub struct PostgresBroker {
    pool: Pool<Postgres>,
    subscribers: Subscribers,
}

impl PostgresBroker {
    pub async fn connect(backend: &Backend) -> Result<Self> {
        Self::from_pool(db::postgres::connect(&backend.uri, None)?).await
    }

    pub async fn from_pool(pool: Pool<Postgres>) -> Result<Self> {
        let subscribers = new_subscribers();
        let mut listener = PgListener::connect_with(&pool).await?;
        listener.listen(EVENT_CHANNEL).await?;

        let subs = subscribers.clone();
        tokio::task::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        match json::from_str::<Event>(notification.payload()) {
                            Ok(event) => fan_out(&subs, &event).await,
                            Err(e) => {
                                log::error!("[POSTGRES] broker decode event error: {}", e);
                            }
                        }
                    }
                    Err(e) => {
                        log::error!("[POSTGRES] broker listen error: {}", e);
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Self { pool, subscribers })
    }
}

#[async_trait]
impl EventBroker for PostgresBroker {
    async fn publish(&self, event: &Event) -> Result<()> {
        let pool = self.pool.clone();
        sqlx::query(r#"SELECT pg_notify($1, $2);"#)
            .bind(EVENT_CHANNEL)
            .bind(json::to_string(event)?)
            .execute(&pool)
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

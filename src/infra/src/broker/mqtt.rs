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
use config::{utils::json, EVENT_TOPIC};
use rumqttc::{AsyncClient, MqttOptions, Packet, QoS, Transport};

use super::{
    add_subscriber, fan_out, new_subscribers, Event, EventBroker, EventType, Subscribers,
    Subscription,
};
use crate::{backend::Backend, errors::Result};

/// MQTT broker on topic `flowerpower/worker`.
pub struct MqttBroker {
    client: AsyncClient,
    subscribers: Subscribers,
}

impl MqttBroker {
    pub async fn connect(backend: &Backend) -> Result<Self> {
        let host = backend.host.clone().unwrap_or_else(|| "localhost".to_string());
        let port = backend
            .port
            .unwrap_or(if backend.ssl { 8883 } else { 1883 });
        let client_id = format!(
            "flowerpower-{}",
            config::utils::rand::generate_random_string(8)
        );
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(std::time::Duration::from_secs(30));
        if backend.ssl {
            options.set_transport(Transport::tls_with_default_config());
        }
        if let (Some(user), Some(pass)) = (&backend.username, &backend.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let subscribers = new_subscribers();

        let subs = subscribers.clone();
        tokio::task::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(rumqttc::Event::Incoming(Packet::Publish(publish))) => {
                        match json::from_slice::<Event>(&publish.payload) {
                            Ok(event) => fan_out(&subs, &event).await,
                            Err(e) => log::error!("[MQTT] broker decode event error: {}", e),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::error!("[MQTT] broker connection error: {}", e);
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        });

        client
            .subscribe(EVENT_TOPIC, QoS::AtLeastOnce)
            .await
            .map_err(|e| crate::errors::Error::Message(format!("mqtt subscribe error: {e}")))?;

        Ok(Self {
            client,
            subscribers,
        })
    }
}

#[async_trait]
impl EventBroker for MqttBroker {
    async fn publish(&self, event: &Event) -> Result<()> {
        self.client
            .publish(
                EVENT_TOPIC,
                QoS::AtLeastOnce,
                false,
                json::to_vec(event)?,
            )
            .await
            .map_err(|e| crate::errors::Error::Message(format!("mqtt publish error: {e}")))?;
        Ok(())
    }

    async fn subscribe(&self, event_type: Option<EventType>) -> Result<Subscription> {
        Ok(add_subscriber(&self.subscribers, event_type).await)
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self.client.disconnect().await {
            log::warn!("[MQTT] broker disconnect error: {}", e);
        }
        self.subscribers.write().await.clear();
        Ok(())
    }
}

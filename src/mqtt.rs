use std::time::Duration;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use log::{debug, error, info};
use rumqttc::{MqttOptions, QoS, SubscribeFilter};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::config;
use crate::dispatcher::EventConsumer;
use crate::events::{Event, EventName};

#[derive(Clone, Debug)]
pub enum MqttAnnouncement {
    ScanRequested,
}

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
}

#[derive(Debug, Serialize)]
struct DeviceMqttMessage<'a> {
    name: &'a str,
    #[serde(rename = "id")]
    device_id: &'a str,
    confidence: u8,
    present: bool,
    retained: bool,
}

#[derive(Debug, Serialize)]
struct EventMqttMessage<'a> {
    event: &'a str,
    who: &'a str,
    device: &'a str,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .clone()
            .unwrap_or_else(|| "presence-rs".to_string());

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                publisher_id,
                topic_path: config
                    .topic_path
                    .clone()
                    .unwrap_or_else(|| "presence".to_string()),
            },
            eventloop,
        )
    }

    fn scan_topic(&self) -> String {
        format!("{}/scan", self.topic_path)
    }

    fn event_topic(&self, name: EventName) -> String {
        format!("{}/{}/events/{}", self.topic_path, self.publisher_id, name)
    }

    fn device_topic(&self, name: &str) -> String {
        format!("{}/{}/{}", self.topic_path, self.publisher_id, sanitize_name(name))
    }

    pub async fn subscribe(&self) -> Result<(), rumqttc::ClientError> {
        self.client
            .subscribe_many(vec![SubscribeFilter::new(
                self.scan_topic(),
                QoS::AtMostOnce,
            )])
            .await?;

        Ok(())
    }

    /// Drives the connection, forwarding scan requests to `tx`. Returns once a
    /// disconnect has been sent.
    pub async fn event_loop(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        tx: broadcast::Sender<MqttAnnouncement>,
    ) {
        let scan_topic = self.scan_topic();
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);

                        if p.topic != scan_topic {
                            continue;
                        }
                        if let Err(err) = tx.send(MqttAnnouncement::ScanRequested) {
                            error!("Error announcing scan request: {:?}", err);
                        }
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Outgoing(rumqttc::Outgoing::Disconnect) => {
                        debug!("Disconnect sent, leaving MQTT event loop");
                        break;
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        debug!("Connection acknowledged");
                        if let Err(err) = self.subscribe().await {
                            error!("Error subscribing to MQTT topics: {:?}", err);
                        }
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    pub async fn announce_device(
        &self,
        name: &str,
        device_id: &str,
        present: bool,
    ) -> anyhow::Result<()> {
        info!("Announcing device {} (present: {}) on MQTT", name, present);
        let message = DeviceMqttMessage {
            name,
            device_id,
            confidence: if present { 100 } else { 0 },
            present,
            retained: false,
        };
        self.client
            .publish(
                self.device_topic(name),
                QoS::AtMostOnce,
                false,
                serde_json::to_string(&message)?,
            )
            .await?;
        Ok(())
    }

    pub async fn publish_event(&self, event: &Event) -> anyhow::Result<()> {
        let message = EventMqttMessage {
            event: event.name.as_str(),
            who: &event.tokens.who,
            device: event.device.as_str(),
        };
        self.client
            .publish(
                self.event_topic(event.name),
                QoS::AtLeastOnce,
                false,
                serde_json::to_string(&message)?,
            )
            .await?;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

impl EventConsumer for MqttClient {
    fn name(&self) -> &str {
        "mqtt"
    }

    fn deliver(&self, event: Event) -> BoxFuture<'_, anyhow::Result<()>> {
        async move {
            self.publish_event(&event).await?;
            match event.name {
                EventName::UserEntered => {
                    self.announce_device(&event.tokens.who, event.device.as_str(), true)
                        .await?;
                }
                EventName::UserLeft => {
                    self.announce_device(&event.tokens.who, event.device.as_str(), false)
                        .await?;
                }
                _ => {}
            }
            Ok(())
        }
        .boxed()
    }
}

fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}

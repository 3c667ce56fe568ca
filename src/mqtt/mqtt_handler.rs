use std::time::Duration;

use chrono::{DateTime, Local};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::config::MqttConfig;
use crate::controller::{FeedbackArray, JoyMessage};
use crate::shutdown::ShutdownContext;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Client error: {0}")]
    ClientError(#[from] rumqttc::ClientError),
}

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
    Reconnecting,
}

#[derive(Clone, Debug, Default)]
pub struct MqttStatus {
    pub connection_state: ConnectionState,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<DateTime<Local>>,
}

pub fn encode_snapshot(message: &JoyMessage) -> Result<Vec<u8>, MqttError> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode_feedback(payload: &[u8]) -> Result<FeedbackArray, MqttError> {
    Ok(serde_json::from_slice(payload)?)
}

pub struct MqttHandler {
    status: MqttStatus,
    client: AsyncClient,
    eventloop: EventLoop,
    config: MqttConfig,
}

impl MqttHandler {
    pub fn new(config: MqttConfig) -> Self {
        let mut mqtt_options = MqttOptions::new(&config.client_id, &config.host, config.port);
        mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        if let Some(user) = &config.user {
            mqtt_options.set_credentials(user.clone(), config.password.clone().unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);

        MqttHandler {
            status: MqttStatus::default(),
            client,
            eventloop,
            config,
        }
    }

    pub fn status(&self) -> &MqttStatus {
        &self.status
    }

    /// Publishes snapshots and forwards feedback batches until shutdown.
    pub async fn run(
        &mut self,
        mut snapshots: mpsc::Receiver<JoyMessage>,
        feedback: mpsc::Sender<FeedbackArray>,
        shutdown: ShutdownContext,
    ) {
        info!(
            "Connecting to MQTT broker {}:{}",
            self.config.host, self.config.port
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                message = snapshots.recv() => {
                    let Some(message) = message else {
                        debug!("Snapshot channel closed");
                        break;
                    };
                    self.publish_snapshot(&message);
                }
                event = self.eventloop.poll() => match event {
                    Ok(event) => self.handle_event(event, &feedback),
                    Err(e) => {
                        error!("MQTT connection error: {}", e);
                        self.status.connection_state = ConnectionState::Reconnecting;
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        }
                    }
                },
            }
        }

        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request not sent: {}", e);
        }
        self.status.connection_state = ConnectionState::Disconnected;
        info!(
            "MQTT handler stopped ({} sent, {} received)",
            self.status.messages_sent, self.status.messages_received
        );
    }

    fn publish_snapshot(&mut self, message: &JoyMessage) {
        let payload = match encode_snapshot(message) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode snapshot: {}", e);
                return;
            }
        };

        match self
            .client
            .try_publish(&self.config.joy_topic, QoS::AtMostOnce, false, payload)
        {
            Ok(()) => {
                self.status.messages_sent += 1;
                self.status.last_activity = Some(Local::now());
            }
            Err(e) => warn!("Failed to publish snapshot: {}", e),
        }
    }

    fn handle_event(&mut self, event: Event, feedback: &mpsc::Sender<FeedbackArray>) {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                info!("Connected to MQTT broker");
                self.status.connection_state = ConnectionState::Connected;
                if let Err(e) = self
                    .client
                    .try_subscribe(&self.config.feedback_topic, QoS::AtMostOnce)
                {
                    error!(
                        "Failed to subscribe to {}: {}",
                        self.config.feedback_topic, e
                    );
                }
            }
            Event::Incoming(Packet::Publish(publish)) => {
                self.status.messages_received += 1;
                self.status.last_activity = Some(Local::now());
                if publish.topic != self.config.feedback_topic {
                    debug!("Ignoring message on {}", publish.topic);
                    return;
                }
                match decode_feedback(&publish.payload) {
                    Ok(batch) => {
                        debug!("Feedback batch with {} entries", batch.array.len());
                        if let Err(e) = feedback.try_send(batch) {
                            warn!("Failed to forward feedback: {}", e);
                        }
                    }
                    Err(e) => warn!("Invalid feedback payload: {}", e),
                }
            }
            other => debug!("MQTT event: {:?}", other),
        }
    }
}

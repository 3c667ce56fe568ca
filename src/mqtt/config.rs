use serde::{Deserialize, Serialize};

/// Broker connection and topic settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Snapshots are published here.
    pub joy_topic: String,
    /// Feedback batches are received here.
    pub feedback_topic: String,
    pub keep_alive_secs: u64,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "evdev_joy".to_string(),
            joy_topic: "evdev_joy/joy".to_string(),
            feedback_topic: "evdev_joy/set_feedback".to_string(),
            keep_alive_secs: 5,
            user: None,
            password: None,
        }
    }
}

//! # MQTT transport
//!
//! Carries joystick snapshots out and feedback batches in. The joystick
//! node only sees tokio channels; this module owns the broker connection.
//!
//! ```text
//! mqtt/
//! ├── config.rs        - broker and topic settings
//! └── mqtt_handler.rs  - event loop, JSON encoding, status tracking
//! ```
//!
//! ```text
//! JoyMessage channel ──► MqttHandler ──► <joy_topic>
//! <feedback_topic>   ──► MqttHandler ──► FeedbackArray channel
//! ```
//!
//! Connection errors are logged and the event loop is polled again after a
//! short delay; rumqttc reconnects on the next poll.

pub mod config;
pub mod mqtt_handler;

//! Joystick subsystem: evdev events in, coalesced snapshots out
//!
//! Split into leaf components that are wired together by the handle:
//!
//! 1. [`mapping`] - code name resolution and axis normalization
//! 2. [`connection`] - device open/retry/reconnect and the reader wake-up
//! 3. [`event_reader`] - one blocking read with resync and fail-safe recovery
//! 4. [`snapshot`] - shared axes/buttons state and the published message
//! 5. [`publish_scheduler`] - immediate button publishes, coalesced axis publishes
//! 6. [`feedback`] - force-feedback slot table
//! 7. [`controller_handle`] - node state machine and task lifecycle
//!
//! # Architecture
//!
//! ```text
//! Device ──► EventReader ──► SnapshotState ──► PublishScheduler ──► SnapshotPublisher
//!              │   ▲                                                      (MQTT)
//!              ▼   │
//!        ConnectionManager ◄── FeedbackEffectManager ◄── FeedbackArray (MQTT)
//! ```
//!
//! Reads run on a blocking thread; the coalescing timer and the feedback
//! intake run as tokio tasks. Both the reader and the feedback manager use
//! the same device descriptor.

pub mod connection;
pub mod controller_handle;
pub mod event_reader;
pub mod feedback;
pub mod mapping;
pub mod publish_scheduler;
pub mod snapshot;

pub use connection::{ConnectionError, ConnectionManager};
pub use controller_handle::{JoystickError, JoystickHandle, JoystickNode, JoystickSettings};
pub use event_reader::{EventClass, EventReader};
pub use feedback::{FeedbackArray, FeedbackCommand, FeedbackEffectManager};
pub use mapping::CodeMapper;
pub use publish_scheduler::PublishScheduler;
pub use snapshot::{ChannelPublisher, JoyMessage, SharedSnapshot, Snapshot, SnapshotPublisher};

//! Shared joystick snapshot and the published message
//!
//! The snapshot and the pending coalescing deadline live behind one mutex so
//! that "cancel the timer, then publish" is a single critical section.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::mapping::{CodeMapper, MappedValue};
use crate::device::InputEvent;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub axes: Vec<f32>,
    pub buttons: Vec<i32>,
}

impl Snapshot {
    /// Sized once; never resized afterwards.
    pub fn sized(axes: usize, buttons: usize) -> Self {
        Self {
            axes: vec![0.0; axes],
            buttons: vec![0; buttons],
        }
    }

    pub fn is_zeroed(&self) -> bool {
        self.axes.iter().all(|axis| *axis == 0.0) && self.buttons.iter().all(|button| *button == 0)
    }
}

#[derive(Debug, Default)]
pub struct SnapshotState {
    pub snapshot: Snapshot,
    /// Set while a coalesced publish is pending.
    pub publish_deadline: Option<Instant>,
}

impl SnapshotState {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            snapshot,
            publish_deadline: None,
        }
    }

    /// Writes a mapped event into the snapshot. Returns false for unmapped events.
    pub fn apply(&mut self, mapper: &CodeMapper, event: &InputEvent) -> bool {
        match mapper.map(event) {
            Some(MappedValue::Axis { index, value }) => {
                let Some(slot) = self.snapshot.axes.get_mut(index) else {
                    warn!("Axis index {} outside snapshot of {}", index, self.snapshot.axes.len());
                    return false;
                };
                *slot = value;
                true
            }
            Some(MappedValue::Button { index, value }) => {
                let Some(slot) = self.snapshot.buttons.get_mut(index) else {
                    warn!(
                        "Button index {} outside snapshot of {}",
                        index,
                        self.snapshot.buttons.len()
                    );
                    return false;
                };
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn zero(&mut self) {
        self.snapshot.axes.fill(0.0);
        self.snapshot.buttons.fill(0);
    }
}

#[derive(Clone, Debug, Default)]
pub struct SharedSnapshot(Arc<Mutex<SnapshotState>>);

impl SharedSnapshot {
    pub fn new(snapshot: Snapshot) -> Self {
        Self(Arc::new(Mutex::new(SnapshotState::new(snapshot))))
    }

    /// A panicked holder leaves plain data behind, so poisoning is ignored.
    pub fn lock(&self) -> MutexGuard<'_, SnapshotState> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> Snapshot {
        self.lock().snapshot.clone()
    }

    /// Replaces the snapshot with a zeroed one of the given shape.
    pub fn resize(&self, axes: usize, buttons: usize) {
        self.lock().snapshot = Snapshot::sized(axes, buttons);
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub stamp: DateTime<Utc>,
    pub frame_id: String,
}

/// One published snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JoyMessage {
    pub header: Header,
    pub axes: Vec<f32>,
    pub buttons: Vec<i32>,
}

impl JoyMessage {
    pub fn stamped(snapshot: &Snapshot, frame_id: &str) -> Self {
        Self {
            header: Header {
                stamp: Utc::now(),
                frame_id: frame_id.to_string(),
            },
            axes: snapshot.axes.clone(),
            buttons: snapshot.buttons.clone(),
        }
    }
}

impl fmt::Display for JoyMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} [{}] axes={:?} buttons={:?}",
            self.header.stamp.format("%H:%M:%S%.3f"),
            self.header.frame_id,
            self.axes,
            self.buttons
        )
    }
}

/// Sink for published snapshots.
///
/// Called with the snapshot lock held, so implementations must not block.
pub trait SnapshotPublisher: Send + Sync + fmt::Debug {
    fn publish(&self, message: &JoyMessage);
}

/// Forwards messages into a bounded tokio channel, dropping on overflow.
#[derive(Clone, Debug)]
pub struct ChannelPublisher {
    sender: mpsc::Sender<JoyMessage>,
}

impl ChannelPublisher {
    pub fn new(sender: mpsc::Sender<JoyMessage>) -> Self {
        Self { sender }
    }
}

impl SnapshotPublisher for ChannelPublisher {
    fn publish(&self, message: &JoyMessage) {
        match self.sender.try_send(message.clone()) {
            Ok(_) => debug!("Snapshot queued for transport"),
            Err(e) => warn!("Failed to queue snapshot: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::codes::{ABS_X, BTN_SOUTH, EV_ABS, EV_KEY, EV_MSC};
    use crate::device::{AbsInfo, Capabilities};

    fn mapper() -> CodeMapper {
        let mut caps = Capabilities::default();
        caps.event_types.extend([EV_ABS, EV_KEY]);
        caps.axes.insert(ABS_X, AbsInfo::with_range(-100, 100));
        caps.keys.insert(BTN_SOUTH);
        CodeMapper::build(
            &["ABS_Y".to_string(), "ABS_X".to_string()],
            &["BTN_SOUTH".to_string()],
            &caps,
        )
    }

    #[test]
    fn apply_updates_the_mapped_slot_only() {
        let mapper = mapper();
        let mut state = SnapshotState::new(Snapshot::sized(2, 1));

        assert!(state.apply(&mapper, &InputEvent::new(EV_ABS, ABS_X, -50)));
        assert!(state.apply(&mapper, &InputEvent::new(EV_KEY, BTN_SOUTH, 1)));
        assert!(!state.apply(&mapper, &InputEvent::new(EV_MSC, 4, 9)));

        assert_eq!(state.snapshot.axes, vec![0.0, -0.5]);
        assert_eq!(state.snapshot.buttons, vec![1]);

        state.zero();
        assert!(state.snapshot.is_zeroed());
        assert_eq!(state.snapshot.axes.len(), 2);
    }

    #[test]
    fn joy_message_json_layout() {
        let snapshot = Snapshot {
            axes: vec![0.5, -1.0],
            buttons: vec![0, 1],
        };
        let message = JoyMessage::stamped(&snapshot, "joy_link");
        let json: serde_json::Value = serde_json::to_value(&message).unwrap();

        assert_eq!(json["header"]["frame_id"], "joy_link");
        assert!(json["header"]["stamp"].is_string());
        assert_eq!(json["axes"], serde_json::json!([0.5, -1.0]));
        assert_eq!(json["buttons"], serde_json::json!([0, 1]));
    }

    #[tokio::test]
    async fn channel_publisher_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let publisher = ChannelPublisher::new(tx);
        let message = JoyMessage::stamped(&Snapshot::sized(1, 1), "joy_link");

        publisher.publish(&message);
        publisher.publish(&message);

        assert_eq!(rx.recv().await.unwrap(), message);
        assert!(rx.try_recv().is_err());
    }
}

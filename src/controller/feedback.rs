//! Force-feedback effect slots
//!
//! Each position in an incoming feedback array is a logical slot. A slot
//! holds at most one device effect; a new rumble for the same slot replaces
//! the old effect with stop, remove, upload, play.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::connection::ConnectionManager;
use crate::device::{EffectDescriptor, EffectId, EventDevice};

pub const TYPE_LED: u8 = 0;
pub const TYPE_RUMBLE: u8 = 1;
pub const TYPE_BUZZER: u8 = 2;

/// Rumble on the strong (low frequency) motor.
pub const RUMBLE_HEAVY: u8 = 0;
/// Rumble on the weak (high frequency) motor.
pub const RUMBLE_LIGHT: u8 = 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackCommand {
    #[serde(rename = "type")]
    pub kind: u8,
    pub id: u8,
    pub intensity: f32,
}

impl FeedbackCommand {
    pub fn rumble(id: u8, intensity: f32) -> Self {
        Self {
            kind: TYPE_RUMBLE,
            id,
            intensity,
        }
    }

    pub fn request(&self) -> FeedbackRequest {
        if self.kind != TYPE_RUMBLE {
            return FeedbackRequest::Ignored;
        }
        let magnitude = magnitude(self.intensity);
        match self.id {
            RUMBLE_HEAVY => FeedbackRequest::Rumble(EffectDescriptor::rumble(magnitude, 0)),
            RUMBLE_LIGHT => FeedbackRequest::Rumble(EffectDescriptor::rumble(0, magnitude)),
            other => FeedbackRequest::UnsupportedEffect(other),
        }
    }
}

/// A batch of feedback commands; the position is the slot index.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackArray {
    pub array: Vec<FeedbackCommand>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedbackRequest {
    Rumble(EffectDescriptor),
    /// LED, buzzer, empty entries and unknown types.
    Ignored,
    UnsupportedEffect(u8),
}

/// `intensity` clamped to [0, 1], scaled onto the full `u16` range.
pub fn magnitude(intensity: f32) -> u16 {
    let intensity = if intensity.is_nan() {
        0.0
    } else {
        intensity.clamp(0.0, 1.0)
    };
    (f32::from(u16::MAX) * intensity) as u16
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ActiveEffect {
    id: EffectId,
    generation: u64,
}

#[derive(Debug)]
pub struct FeedbackEffectManager {
    connection: Arc<ConnectionManager>,
    slots: Mutex<BTreeMap<usize, ActiveEffect>>,
}

impl FeedbackEffectManager {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            slots: Mutex::new(BTreeMap::new()),
        }
    }

    /// Effect id currently held by `slot` on the live connection.
    pub fn active_effect(&self, slot: usize) -> Option<EffectId> {
        let generation = self.connection.generation();
        self.lock_slots()
            .get(&slot)
            .filter(|active| active.generation == generation)
            .map(|active| active.id)
    }

    /// Applies one batch. Device errors are logged, never returned.
    pub fn apply(&self, commands: &[FeedbackCommand]) {
        let Some((device, generation)) = self.connection.current() else {
            warn!("Feedback for {} slots dropped: no device open", commands.len());
            return;
        };
        if !device.capabilities().supports_rumble() {
            warn!(
                "Feedback dropped: {} has no rumble support",
                device.capabilities().name
            );
            return;
        }

        let mut slots = self.lock_slots();

        for (slot, command) in commands.iter().enumerate() {
            match command.request() {
                FeedbackRequest::Ignored => {
                    debug!("Slot {}: feedback type {} not handled", slot, command.kind)
                }
                FeedbackRequest::UnsupportedEffect(id) => {
                    warn!("Slot {}: unsupported rumble id {}, skipping", slot, id)
                }
                FeedbackRequest::Rumble(effect) => {
                    let previous = slots
                        .get(&slot)
                        .filter(|active| active.generation == generation)
                        .map(|active| active.id);

                    match replace_effect(device.as_ref(), slot, previous, &effect) {
                        Some(id) => {
                            slots.insert(slot, ActiveEffect { id, generation });
                        }
                        None => {
                            slots.remove(&slot);
                        }
                    }
                }
            }
        }
    }

    fn lock_slots(&self) -> MutexGuard<'_, BTreeMap<usize, ActiveEffect>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Returns the id now occupying the slot, if the upload succeeded.
fn replace_effect(
    device: &dyn EventDevice,
    slot: usize,
    previous: Option<EffectId>,
    effect: &EffectDescriptor,
) -> Option<EffectId> {
    if let Some(old) = previous {
        if let Err(e) = device.stop_effect(old) {
            error!("Slot {}: failed to stop effect {}: {}", slot, old, e);
        }
        if let Err(e) = device.remove_effect(old) {
            error!("Slot {}: failed to remove effect {}: {}", slot, old, e);
        }
    }

    let id = match device.upload_effect(effect) {
        Ok(id) => id,
        Err(e) => {
            error!("Slot {}: failed to upload effect: {}", slot, e);
            return None;
        }
    };
    if let Err(e) = device.play_effect(id) {
        error!("Slot {}: failed to play effect {}: {}", slot, id, e);
    }

    info!("Slot {}: playing effect {} ({:?})", slot, id, effect.kind);
    Some(id)
}

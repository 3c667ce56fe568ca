//! Device control surface for evdev input devices
//!
//! Everything above this module talks to a device through two traits:
//!
//! 1. [`DeviceOpener`] - turns a device path into an open handle
//! 2. [`EventDevice`] - the open handle: blocking reads, resync drain,
//!    force-feedback uploads and raw event writes
//!
//! # Implementations
//!
//! ```text
//! linux.rs  - /dev/input/event* through the evdev crate (production)
//! mock.rs   - scripted reads and recorded effect calls (tests)
//! ```

pub mod codes;
pub mod linux;
pub mod mock;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;

use codes::{EV_ABS, EV_FF, EV_KEY, FF_RUMBLE};

/// Device-level force-feedback effect identifier as assigned by the kernel.
pub type EffectId = u16;

/// `EV_FF` event value that starts playback of an uploaded effect.
pub const FF_PLAY: i32 = 1;
/// `EV_FF` event value that stops playback of an uploaded effect.
pub const FF_STOP: i32 = 0;

/// One decoded `struct input_event`, without the kernel timestamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputEvent {
    pub kind: u16,
    pub code: u16,
    pub value: i32,
}

impl InputEvent {
    pub fn new(kind: u16, code: u16, value: i32) -> Self {
        Self { kind, code, value }
    }
}

impl fmt::Display for InputEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match codes::code_name(self.kind, self.code) {
            Some(name) => write!(f, "{} = {}", name, self.value),
            None => write!(
                f,
                "type {:#04x} code {:#05x} = {}",
                self.kind, self.code, self.value
            ),
        }
    }
}

/// Range and current value of one absolute axis (`struct input_absinfo`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AbsInfo {
    pub value: i32,
    pub minimum: i32,
    pub maximum: i32,
    pub fuzz: i32,
    pub flat: i32,
    pub resolution: i32,
}

impl AbsInfo {
    pub fn with_range(minimum: i32, maximum: i32) -> Self {
        Self {
            minimum,
            maximum,
            ..Self::default()
        }
    }
}

/// Capability descriptor parsed once when a device is opened.
#[derive(Clone, Debug, Default)]
pub struct Capabilities {
    pub name: String,
    pub event_types: BTreeSet<u16>,
    pub keys: BTreeSet<u16>,
    pub axes: BTreeMap<u16, AbsInfo>,
    pub ff_features: BTreeSet<u16>,
    pub ff_effects_max: u32,
}

impl Capabilities {
    pub fn has_event_type(&self, kind: u16) -> bool {
        self.event_types.contains(&kind)
    }

    pub fn has_axes(&self) -> bool {
        self.has_event_type(EV_ABS)
    }

    pub fn has_buttons(&self) -> bool {
        self.has_event_type(EV_KEY)
    }

    pub fn has_force_feedback(&self) -> bool {
        self.has_event_type(EV_FF)
    }

    pub fn supports_rumble(&self) -> bool {
        self.has_force_feedback() && self.ff_features.contains(&FF_RUMBLE)
    }

    pub fn abs_info(&self, code: u16) -> Option<&AbsInfo> {
        self.axes.get(&code)
    }

    pub fn has_key(&self, code: u16) -> bool {
        self.keys.contains(&code)
    }
}

/// Result of one blocking read or one resync drain step.
#[derive(Debug)]
pub enum ReadStatus {
    /// A regular event was decoded.
    Event(InputEvent),
    /// From `next_event`: the kernel dropped events (`SYN_DROPPED`), a resync is
    /// pending. From `next_sync_event`: one synthetic event of the resync.
    Sync(InputEvent),
    /// No data available (`EAGAIN`). During a resync this means sync-complete.
    Empty,
    /// Any other I/O failure.
    Error(io::Error),
}

/// Force-feedback effect kinds this crate can submit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EffectKind {
    Rumble {
        strong_magnitude: u16,
        weak_magnitude: u16,
    },
}

/// Force-feedback effect request; consumed by [`EventDevice::upload_effect`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EffectDescriptor {
    pub kind: EffectKind,
    /// Replay length in milliseconds, 0 plays until stopped.
    pub length_ms: u16,
    pub direction: u16,
}

impl EffectDescriptor {
    pub fn rumble(strong_magnitude: u16, weak_magnitude: u16) -> Self {
        Self {
            kind: EffectKind::Rumble {
                strong_magnitude,
                weak_magnitude,
            },
            length_ms: 0,
            direction: 0,
        }
    }
}

/// An open input device.
///
/// All methods take `&self`: the blocking read runs on the reader thread
/// while effect uploads and the wake-up write come from other threads.
/// Dropping the last `Arc` to a device closes it.
pub trait EventDevice: Send + Sync + fmt::Debug {
    fn capabilities(&self) -> &Capabilities;

    /// Blocks until the next event, a sync fault or an error.
    fn next_event(&self) -> ReadStatus;

    /// Drains one step of a pending resync.
    fn next_sync_event(&self) -> ReadStatus;

    /// Uploads a new effect and returns the identifier the kernel assigned.
    fn upload_effect(&self, effect: &EffectDescriptor) -> io::Result<EffectId>;

    fn remove_effect(&self, id: EffectId) -> io::Result<()>;

    /// Writes one raw event to the device.
    ///
    /// Readers only see written events once a `SYN_REPORT` completes the
    /// packet, and never see `EV_FF` events.
    fn write_event(&self, event: InputEvent) -> io::Result<()>;

    fn play_effect(&self, id: EffectId) -> io::Result<()> {
        self.write_event(InputEvent::new(EV_FF, id, FF_PLAY))
    }

    fn stop_effect(&self, id: EffectId) -> io::Result<()> {
        self.write_event(InputEvent::new(EV_FF, id, FF_STOP))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    /// The device file could not be opened; worth retrying.
    #[error("Failed to open device: {0}")]
    Unavailable(#[source] io::Error),

    /// The file opened but does not behave like an evdev device.
    #[error("Failed to initialize device: {0}")]
    Incompatible(#[source] io::Error),
}

pub trait DeviceOpener: Send + Sync + fmt::Debug {
    fn open(&self, path: &Path) -> Result<Arc<dyn EventDevice>, OpenError>;
}

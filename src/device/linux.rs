//! evdev backend for `/dev/input/event*` character devices
//!
//! Built on the `evdev` crate's raw stream, which hands out events exactly as
//! the kernel delivers them, `SYN_DROPPED` included. The device is opened
//! twice: one handle is owned by the blocking reader, the other carries
//! effect uploads and event writes so feedback never waits on a parked read.
//! Effects belong to the handle that uploaded them, so play, stop and erase
//! all go through the second handle.
//!
//! # Resync
//!
//! When the kernel ring buffer overflows it replaces the buffered events with
//! a single `SYN_DROPPED`. The device then:
//!
//! 1. throws away the rest of the stale frame, up to and including its
//!    `SYN_REPORT` (which may still sit in the kernel if not yet read),
//! 2. re-reads key and axis state from the kernel and queues one synthetic
//!    event per value that changed since the last delivered event.
//!
//! The queued events are handed out by `next_sync_event`; an empty queue
//! reports [`ReadStatus::Empty`], i.e. sync complete.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use evdev::raw_stream::RawDevice;
use evdev::{FFEffect, FFEffectData, FFEffectKind, FFReplay, FFTrigger, KeyCode};
use tracing::{debug, info, warn};

use super::codes::{EV_ABS, EV_KEY, EV_SYN, SYN_DROPPED, SYN_REPORT};
use super::{
    AbsInfo, Capabilities, DeviceOpener, EffectDescriptor, EffectId, EffectKind, EventDevice,
    InputEvent, OpenError, ReadStatus,
};

impl From<evdev::InputEvent> for InputEvent {
    fn from(event: evdev::InputEvent) -> Self {
        Self::new(event.event_type().0, event.code(), event.value())
    }
}

impl From<InputEvent> for evdev::InputEvent {
    fn from(event: InputEvent) -> Self {
        evdev::InputEvent::new(event.kind, event.code, event.value)
    }
}

impl From<&libc::input_absinfo> for AbsInfo {
    fn from(raw: &libc::input_absinfo) -> Self {
        Self {
            value: raw.value,
            minimum: raw.minimum,
            maximum: raw.maximum,
            fuzz: raw.fuzz,
            flat: raw.flat,
            resolution: raw.resolution,
        }
    }
}

fn effect_data(effect: &EffectDescriptor) -> FFEffectData {
    let kind = match effect.kind {
        EffectKind::Rumble {
            strong_magnitude,
            weak_magnitude,
        } => FFEffectKind::Rumble {
            strong_magnitude,
            weak_magnitude,
        },
    };
    FFEffectData {
        direction: effect.direction,
        trigger: FFTrigger {
            button: 0,
            interval: 0,
        },
        replay: FFReplay {
            length: effect.length_ms,
            delay: 0,
        },
        kind,
    }
}

fn is_report(event: &InputEvent) -> bool {
    event.kind == EV_SYN && event.code == SYN_REPORT
}

fn is_dropped(event: &InputEvent) -> bool {
    event.kind == EV_SYN && event.code == SYN_DROPPED
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Open failures that mean "not an evdev node" rather than "not there yet".
fn classify_open_error(err: io::Error) -> OpenError {
    match err.raw_os_error() {
        Some(libc::ENOTTY) | Some(libc::EINVAL) => OpenError::Incompatible(err),
        _ => OpenError::Unavailable(err),
    }
}

fn capabilities_of(device: &RawDevice) -> io::Result<Capabilities> {
    let mut caps = Capabilities {
        name: device.name().unwrap_or("Unknown device").to_string(),
        event_types: device.supported_events().iter().map(|kind| kind.0).collect(),
        ..Capabilities::default()
    };

    if let Some(keys) = device.supported_keys() {
        caps.keys = keys.iter().map(|key| key.0).collect();
    }

    if let Some(axes) = device.supported_absolute_axes() {
        let state = device.get_abs_state()?;
        caps.axes = axes
            .iter()
            .filter_map(|axis| {
                state
                    .get(usize::from(axis.0))
                    .map(|raw| (axis.0, AbsInfo::from(raw)))
            })
            .collect();
    }

    if let Some(features) = device.supported_ff() {
        caps.ff_features = features.iter().map(|feature| feature.0).collect();
        caps.ff_effects_max = device.max_ff_effects() as u32;
    }

    Ok(caps)
}

/// What the buffered stream yields next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Buffered {
    Event(InputEvent),
    /// `SYN_DROPPED` was seen; the caller must queue a resync.
    Dropped(InputEvent),
}

/// Buffering and resync bookkeeping of the reader, independent of the descriptor.
#[derive(Debug, Default)]
struct SyncState {
    pending: VecDeque<InputEvent>,
    sync_queue: VecDeque<InputEvent>,
    keys_down: BTreeSet<u16>,
    abs_values: BTreeMap<u16, i32>,
    /// The stale frame's `SYN_REPORT` has not been read yet.
    discard_until_report: bool,
}

impl SyncState {
    fn new(keys_down: BTreeSet<u16>, abs_values: BTreeMap<u16, i32>) -> Self {
        Self {
            keys_down,
            abs_values,
            ..Self::default()
        }
    }

    /// Appends one kernel batch, returns how many events it held.
    fn push_batch(&mut self, events: impl IntoIterator<Item = InputEvent>) -> usize {
        let before = self.pending.len();
        self.pending.extend(events);
        self.pending.len() - before
    }

    fn pop(&mut self) -> Option<Buffered> {
        while let Some(event) = self.pending.pop_front() {
            if is_dropped(&event) {
                self.drop_stale_frame();
                return Some(Buffered::Dropped(event));
            }

            if self.discard_until_report {
                if is_report(&event) {
                    self.discard_until_report = false;
                }
                continue;
            }

            self.record(&event);
            return Some(Buffered::Event(event));
        }
        None
    }

    fn drop_stale_frame(&mut self) {
        self.sync_queue.clear();
        match self.pending.iter().position(is_report) {
            Some(end) => {
                self.pending.drain(..=end);
                self.discard_until_report = false;
            }
            None => {
                self.pending.clear();
                self.discard_until_report = true;
            }
        }
    }

    /// Queues one event per key or axis whose kernel state differs from what
    /// was last delivered.
    fn queue_resync(&mut self, keys: &[(u16, bool)], axes: &[(u16, i32)]) {
        for &(code, down) in keys {
            if self.keys_down.contains(&code) != down {
                self.sync_queue
                    .push_back(InputEvent::new(EV_KEY, code, i32::from(down)));
            }
        }
        for &(code, value) in axes {
            if self.abs_values.get(&code) != Some(&value) {
                self.sync_queue
                    .push_back(InputEvent::new(EV_ABS, code, value));
            }
        }
    }

    fn next_sync(&mut self) -> Option<InputEvent> {
        let event = self.sync_queue.pop_front()?;
        self.record(&event);
        Some(event)
    }

    fn record(&mut self, event: &InputEvent) {
        match event.kind {
            EV_KEY if event.value != 0 => {
                self.keys_down.insert(event.code);
            }
            EV_KEY => {
                self.keys_down.remove(&event.code);
            }
            EV_ABS => {
                self.abs_values.insert(event.code, event.value);
            }
            _ => {}
        }
    }
}

struct EventStream {
    device: RawDevice,
    state: SyncState,
}

pub struct LinuxDevice {
    path: PathBuf,
    capabilities: Capabilities,
    stream: Mutex<EventStream>,
    control: Mutex<RawDevice>,
    effects: Mutex<BTreeMap<EffectId, FFEffect>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl LinuxDevice {
    pub fn open(path: &Path) -> Result<Self, OpenError> {
        debug!("Opening {}", path.display());
        let device = RawDevice::open(path).map_err(classify_open_error)?;
        let control = RawDevice::open(path).map_err(classify_open_error)?;

        let capabilities = capabilities_of(&device).map_err(OpenError::Incompatible)?;
        let keys_down = if capabilities.has_buttons() {
            device
                .get_key_state()
                .map_err(OpenError::Incompatible)?
                .iter()
                .map(|key| key.0)
                .collect()
        } else {
            BTreeSet::new()
        };
        let abs_values = capabilities
            .axes
            .iter()
            .map(|(code, info)| (*code, info.value))
            .collect();

        info!(
            "Opened {} ({}): {} keys, {} axes, force feedback: {}",
            path.display(),
            capabilities.name,
            capabilities.keys.len(),
            capabilities.axes.len(),
            capabilities.has_force_feedback()
        );

        Ok(Self {
            path: path.to_path_buf(),
            capabilities,
            stream: Mutex::new(EventStream {
                device,
                state: SyncState::new(keys_down, abs_values),
            }),
            control: Mutex::new(control),
            effects: Mutex::new(BTreeMap::new()),
        })
    }

    fn queue_resync(&self, stream: &mut EventStream) -> io::Result<()> {
        let keys: Vec<(u16, bool)> = if self.capabilities.has_buttons() {
            let down = stream.device.get_key_state()?;
            self.capabilities
                .keys
                .iter()
                .map(|code| (*code, down.contains(KeyCode(*code))))
                .collect()
        } else {
            Vec::new()
        };

        let axes: Vec<(u16, i32)> = if self.capabilities.has_axes() {
            let state = stream.device.get_abs_state()?;
            self.capabilities
                .axes
                .keys()
                .filter_map(|code| state.get(usize::from(*code)).map(|raw| (*code, raw.value)))
                .collect()
        } else {
            Vec::new()
        };

        stream.state.queue_resync(&keys, &axes);
        debug!(
            "Resync of {} queued {} events",
            self.path.display(),
            stream.state.sync_queue.len()
        );
        Ok(())
    }

    fn with_effect(
        &self,
        id: EffectId,
        action: impl FnOnce(&mut FFEffect) -> io::Result<()>,
    ) -> io::Result<()> {
        let mut effects = lock(&self.effects);
        let effect = effects.get_mut(&id).ok_or_else(|| unknown_effect(id))?;
        action(effect)
    }
}

fn unknown_effect(id: EffectId) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no uploaded effect {}", id))
}

impl fmt::Debug for LinuxDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinuxDevice")
            .field("path", &self.path)
            .field("name", &self.capabilities.name)
            .field("effects", &lock(&self.effects).len())
            .finish()
    }
}

impl EventDevice for LinuxDevice {
    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn next_event(&self) -> ReadStatus {
        let mut guard = lock(&self.stream);
        let stream = &mut *guard;
        loop {
            match stream.state.pop() {
                Some(Buffered::Event(event)) => return ReadStatus::Event(event),
                Some(Buffered::Dropped(event)) => {
                    return match self.queue_resync(stream) {
                        Ok(()) => ReadStatus::Sync(event),
                        Err(e) => ReadStatus::Error(e),
                    };
                }
                None => {}
            }

            let read = match stream.device.fetch_events() {
                Ok(events) => stream.state.push_batch(events.map(InputEvent::from)),
                Err(e) if is_transient(&e) => return ReadStatus::Empty,
                Err(e) => return ReadStatus::Error(e),
            };
            if read == 0 {
                return ReadStatus::Error(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "device returned end of file",
                ));
            }
        }
    }

    fn next_sync_event(&self) -> ReadStatus {
        match lock(&self.stream).state.next_sync() {
            Some(event) => ReadStatus::Sync(event),
            None => ReadStatus::Empty,
        }
    }

    fn upload_effect(&self, effect: &EffectDescriptor) -> io::Result<EffectId> {
        let handle = lock(&self.control).upload_ff_effect(effect_data(effect))?;
        let id = handle.id();
        lock(&self.effects).insert(id, handle);
        Ok(id)
    }

    /// Dropping the effect handle erases it from the device.
    fn remove_effect(&self, id: EffectId) -> io::Result<()> {
        let effect = lock(&self.effects)
            .remove(&id)
            .ok_or_else(|| unknown_effect(id))?;
        drop(effect);
        Ok(())
    }

    fn write_event(&self, event: InputEvent) -> io::Result<()> {
        lock(&self.control).send_events(&[event.into()])
    }

    fn play_effect(&self, id: EffectId) -> io::Result<()> {
        self.with_effect(id, |effect| effect.play(1))
    }

    fn stop_effect(&self, id: EffectId) -> io::Result<()> {
        self.with_effect(id, |effect| effect.stop())
    }
}

/// Opens real evdev nodes.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinuxDeviceOpener;

impl DeviceOpener for LinuxDeviceOpener {
    fn open(&self, path: &Path) -> Result<Arc<dyn EventDevice>, OpenError> {
        match LinuxDevice::open(path) {
            Ok(device) => Ok(Arc::new(device)),
            Err(e) => {
                warn!("Opening {} failed: {}", path.display(), e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::codes::{ABS_X, ABS_Y, BTN_EAST, BTN_SOUTH};

    fn ev(kind: u16, code: u16, value: i32) -> InputEvent {
        InputEvent::new(kind, code, value)
    }

    fn report() -> InputEvent {
        ev(EV_SYN, SYN_REPORT, 0)
    }

    fn dropped() -> InputEvent {
        ev(EV_SYN, SYN_DROPPED, 0)
    }

    fn drain(state: &mut SyncState) -> Vec<InputEvent> {
        std::iter::from_fn(|| match state.pop() {
            Some(Buffered::Event(event)) => Some(event),
            Some(other) => panic!("unexpected {:?}", other),
            None => None,
        })
        .collect()
    }

    #[test]
    fn first_frame_after_a_buffered_stale_report_is_kept() {
        let mut state = SyncState::default();
        state.push_batch([dropped(), ev(EV_ABS, ABS_X, 5), report()]);

        assert_eq!(state.pop(), Some(Buffered::Dropped(dropped())));
        state.queue_resync(&[], &[]);
        assert_eq!(state.pop(), None);

        state.push_batch([
            ev(EV_KEY, BTN_SOUTH, 1),
            report(),
            ev(EV_KEY, BTN_EAST, 1),
            report(),
        ]);
        assert_eq!(
            drain(&mut state),
            vec![
                ev(EV_KEY, BTN_SOUTH, 1),
                report(),
                ev(EV_KEY, BTN_EAST, 1),
                report()
            ]
        );
        assert!(state.keys_down.contains(&BTN_SOUTH));
    }

    #[test]
    fn stale_frame_split_across_reads_is_discarded_up_to_its_report() {
        let mut state = SyncState::default();
        state.push_batch([dropped(), ev(EV_ABS, ABS_X, 5)]);
        assert!(matches!(state.pop(), Some(Buffered::Dropped(_))));
        assert_eq!(state.pop(), None);

        state.push_batch([
            ev(EV_ABS, ABS_Y, 3),
            report(),
            ev(EV_KEY, BTN_SOUTH, 1),
            report(),
        ]);
        assert_eq!(drain(&mut state), vec![ev(EV_KEY, BTN_SOUTH, 1), report()]);
        assert_eq!(state.abs_values.get(&ABS_Y), None);
    }

    #[test]
    fn resync_queues_only_changed_state() {
        let mut state = SyncState::new(
            BTreeSet::from([BTN_SOUTH]),
            BTreeMap::from([(ABS_X, 10), (ABS_Y, -4)]),
        );
        state.push_batch([dropped()]);
        assert!(matches!(state.pop(), Some(Buffered::Dropped(_))));

        state.queue_resync(
            &[(BTN_SOUTH, false), (BTN_EAST, true)],
            &[(ABS_X, 10), (ABS_Y, 7)],
        );

        let synced: Vec<_> = std::iter::from_fn(|| state.next_sync()).collect();
        assert_eq!(
            synced,
            vec![
                ev(EV_KEY, BTN_SOUTH, 0),
                ev(EV_KEY, BTN_EAST, 1),
                ev(EV_ABS, ABS_Y, 7)
            ]
        );
        assert_eq!(state.keys_down, BTreeSet::from([BTN_EAST]));
        assert_eq!(state.abs_values[&ABS_Y], 7);
    }

    #[test]
    fn second_drop_replaces_the_pending_resync() {
        let mut state = SyncState::default();
        state.push_batch([dropped(), report()]);
        state.pop();
        state.queue_resync(&[(BTN_SOUTH, true)], &[]);

        state.push_batch([dropped(), report()]);
        assert!(matches!(state.pop(), Some(Buffered::Dropped(_))));
        assert_eq!(state.next_sync(), None);
    }

    #[test]
    fn rumble_descriptor_maps_to_effect_data() {
        let data = effect_data(&EffectDescriptor::rumble(32767, 0));
        assert_eq!(data.replay.length, 0);
        assert_eq!(data.direction, 0);
        assert!(matches!(
            data.kind,
            FFEffectKind::Rumble {
                strong_magnitude: 32767,
                weak_magnitude: 0
            }
        ));
    }

    #[test]
    fn events_convert_both_ways() {
        let event = ev(EV_KEY, BTN_SOUTH, 1);
        let raw: evdev::InputEvent = event.into();
        assert_eq!(raw.code(), BTN_SOUTH);
        assert_eq!(InputEvent::from(raw), event);
    }

    #[test]
    fn missing_device_is_unavailable_not_incompatible() {
        let err = LinuxDevice::open(Path::new("/nonexistent/input/event99")).unwrap_err();
        assert!(matches!(err, OpenError::Unavailable(_)));
    }

    #[test]
    fn non_input_node_is_incompatible() {
        let err = LinuxDevice::open(Path::new("/dev/null")).unwrap_err();
        assert!(matches!(err, OpenError::Incompatible(_)));
    }
}

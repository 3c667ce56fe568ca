//! Blocking read protocol
//!
//! One [`EventReader::read_once`] call performs exactly one blocking read and
//! handles whatever comes back:
//!
//! ```text
//! Event         ──► apply to snapshot ──► Button | Axis | Other
//! Sync          ──► drain resync, apply last drained event ──► None
//! Empty         ──► None
//! Error         ──► fail-safe publish ──► reconnect ──► None
//! ```
//!
//! On `Error` the reader's own handle is released before reconnecting, so
//! the faulted device is closed while the new one is being opened.

use std::sync::Arc;

use tracing::{debug, error, warn};

use super::connection::{ConnectionError, ConnectionManager};
use super::mapping::CodeMapper;
use super::publish_scheduler::PublishScheduler;
use crate::device::codes::{EV_ABS, EV_KEY};
use crate::device::{EventDevice, InputEvent, ReadStatus};

/// What a single read produced, as far as publishing is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventClass {
    Button,
    Axis,
    Other,
    None,
}

impl EventClass {
    pub fn of(event: &InputEvent) -> Self {
        match event.kind {
            EV_KEY => Self::Button,
            EV_ABS => Self::Axis,
            _ => Self::Other,
        }
    }
}

#[derive(Debug)]
pub struct EventReader {
    connection: Arc<ConnectionManager>,
    scheduler: Arc<PublishScheduler>,
    fail_safe: bool,
}

impl EventReader {
    pub fn new(
        connection: Arc<ConnectionManager>,
        scheduler: Arc<PublishScheduler>,
        fail_safe: bool,
    ) -> Self {
        Self {
            connection,
            scheduler,
            fail_safe,
        }
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn scheduler(&self) -> &Arc<PublishScheduler> {
        &self.scheduler
    }

    /// Reads and applies one event. Only fails if the device cannot be reopened.
    pub fn read_once(&self, mapper: &CodeMapper) -> Result<EventClass, ConnectionError> {
        let Some(device) = self.connection.device() else {
            warn!("No device open, connecting");
            self.connection.open()?;
            return Ok(EventClass::None);
        };

        match device.next_event() {
            ReadStatus::Event(event) => {
                debug!("Event: {}", event);
                self.scheduler.state().lock().apply(mapper, &event);
                Ok(EventClass::of(&event))
            }
            ReadStatus::Sync(event) => {
                warn!("Controller out of sync ({})", event);
                self.resync(device.as_ref(), mapper);
                Ok(EventClass::None)
            }
            ReadStatus::Empty => Ok(EventClass::None),
            ReadStatus::Error(e) => {
                error!(
                    "Failed to read from '{}': {}",
                    self.connection.path().display(),
                    e
                );
                drop(device);
                self.recover()?;
                Ok(EventClass::None)
            }
        }
    }

    /// Drains the pending resync. Only the last drained event is applied.
    fn resync(&self, device: &dyn EventDevice, mapper: &CodeMapper) {
        warn!("Resyncing controller...");
        let mut last = None;

        loop {
            match device.next_sync_event() {
                ReadStatus::Sync(event) | ReadStatus::Event(event) => {
                    debug!("Dropped during resync: {}", event);
                    last = Some(event);
                }
                ReadStatus::Empty => break,
                ReadStatus::Error(e) => {
                    error!("Error while resyncing controller: {}", e);
                    return;
                }
            }
        }

        if let Some(event) = last {
            self.scheduler.state().lock().apply(mapper, &event);
        }
        warn!("Controller resynced, some messages may have been lost");
    }

    fn recover(&self) -> Result<(), ConnectionError> {
        if self.fail_safe {
            warn!("Fail-safe active, setting all outputs to zero");
        }
        self.scheduler.publish_fail_safe(self.fail_safe);
        error!("Trying to reconnect controller");
        self.connection.reconnect()
    }
}

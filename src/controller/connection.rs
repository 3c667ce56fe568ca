//! Device connection lifecycle
//!
//! Owns the open device handle and replaces it on reconnect. Readers clone
//! the `Arc` out of the lock and never hold it across a blocking read. The
//! device closes when its last clone is dropped, so callers drop their clone
//! before asking for a reconnect.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::device::codes::{EV_FF, EV_SYN, SYN_MT_REPORT, SYN_REPORT};
use crate::device::{Capabilities, DeviceOpener, EventDevice, InputEvent, OpenError, FF_STOP};
use crate::shutdown::ShutdownContext;

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Shutdown requested before the device could be opened")]
    ShutdownRequested,

    #[error("Incompatible device {}: {source}", path.display())]
    IncompatibleDevice {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The open device together with the connection it belongs to.
#[derive(Debug, Default)]
struct Slot {
    device: Option<Arc<dyn EventDevice>>,
    /// Incremented on every successful open.
    generation: u64,
}

#[derive(Debug)]
pub struct ConnectionManager {
    path: PathBuf,
    opener: Arc<dyn DeviceOpener>,
    slot: RwLock<Slot>,
    retry_delay: Duration,
    shutdown: ShutdownContext,
}

impl ConnectionManager {
    pub fn new(
        path: impl Into<PathBuf>,
        opener: Arc<dyn DeviceOpener>,
        shutdown: ShutdownContext,
    ) -> Self {
        Self {
            path: path.into(),
            opener,
            slot: RwLock::new(Slot::default()),
            retry_delay: DEFAULT_RETRY_DELAY,
            shutdown,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the device, retrying every `retry_delay` until it succeeds.
    ///
    /// An incompatible device is not retried: shutdown is requested and the
    /// error returned.
    pub fn open(&self) -> Result<(), ConnectionError> {
        loop {
            if self.shutdown.is_requested() {
                return Err(ConnectionError::ShutdownRequested);
            }

            match self.opener.open(&self.path) {
                Ok(device) => {
                    info!("Connected to {}", device.capabilities().name);
                    let mut slot = self.write_slot();
                    slot.device = Some(device);
                    slot.generation += 1;
                    debug!("Connection generation {}", slot.generation);
                    return Ok(());
                }
                Err(OpenError::Unavailable(e)) => {
                    error!(
                        "Failed to open device '{}': {}. Retrying in {:?}",
                        self.path.display(),
                        e,
                        self.retry_delay
                    );
                    if self.shutdown.sleep(self.retry_delay) {
                        return Err(ConnectionError::ShutdownRequested);
                    }
                }
                Err(OpenError::Incompatible(source)) => {
                    error!(
                        "Failed to initialize device '{}': {}",
                        self.path.display(),
                        source
                    );
                    self.shutdown.request();
                    return Err(ConnectionError::IncompatibleDevice {
                        path: self.path.clone(),
                        source,
                    });
                }
            }
        }
    }

    pub fn reconnect(&self) -> Result<(), ConnectionError> {
        info!("Reconnecting to '{}'", self.path.display());
        self.close();
        self.open()
    }

    /// Releases the manager's handle. The device closes once clones held
    /// elsewhere are dropped too.
    pub fn close(&self) {
        let Some(device) = self.write_slot().device.take() else {
            debug!("Close requested but no device is open");
            return;
        };
        info!("Closing {}", device.capabilities().name);
        let others = Arc::strong_count(&device) - 1;
        if others > 0 {
            debug!("{} other handles still hold the device", others);
        }
    }

    pub fn device(&self) -> Option<Arc<dyn EventDevice>> {
        self.read_slot().device.clone()
    }

    /// The open device and its generation, read together.
    pub fn current(&self) -> Option<(Arc<dyn EventDevice>, u64)> {
        let slot = self.read_slot();
        slot.device
            .as_ref()
            .map(|device| (device.clone(), slot.generation))
    }

    pub fn is_up(&self) -> bool {
        self.read_slot().device.is_some()
    }

    /// Incremented on every successful open.
    pub fn generation(&self) -> u64 {
        self.read_slot().generation
    }

    pub fn has_axes(&self) -> bool {
        self.capability(|caps| caps.has_axes())
    }

    pub fn has_buttons(&self) -> bool {
        self.capability(|caps| caps.has_buttons())
    }

    pub fn has_force_feedback(&self) -> bool {
        self.capability(|caps| caps.has_force_feedback())
    }

    /// Writes a harmless packet so that a read blocked in the kernel returns.
    ///
    /// Force-feedback devices get a stop for effect 0, everything else an
    /// empty multitouch report. Either way a `SYN_REPORT` follows: the kernel
    /// only wakes readers once a report completes the packet.
    pub fn wake_reader(&self) {
        let Some(device) = self.device() else {
            debug!("No device open, nothing to wake");
            return;
        };

        let first = if device.capabilities().has_force_feedback() {
            InputEvent::new(EV_FF, 0, FF_STOP)
        } else {
            InputEvent::new(EV_SYN, SYN_MT_REPORT, 0)
        };
        let result = device
            .write_event(first)
            .and_then(|()| device.write_event(InputEvent::new(EV_SYN, SYN_REPORT, 0)));

        match result {
            Ok(()) => debug!("Wake-up packet written"),
            Err(e) => warn!("Failed to write wake-up packet: {}", e),
        }
    }

    fn capability(&self, query: impl FnOnce(&Capabilities) -> bool) -> bool {
        self.read_slot()
            .device
            .as_ref()
            .is_some_and(|device| query(device.capabilities()))
    }

    fn read_slot(&self) -> RwLockReadGuard<'_, Slot> {
        self.slot.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_slot(&self) -> RwLockWriteGuard<'_, Slot> {
        self.slot.write().unwrap_or_else(|e| e.into_inner())
    }
}

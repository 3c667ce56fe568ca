//! Scripted in-memory device for tests
//!
//! Reads are served from a script; once it runs dry `next_event` reports
//! [`ReadStatus::Empty`], or parks until more data arrives when the device is
//! in blocking mode. Every effect call and raw write is recorded in order so
//! tests can assert on the exact ioctl sequence.
//!
//! In blocking mode raw writes are delivered back to the reader the way the
//! kernel does it: written events collect in a packet that only becomes
//! readable once a `SYN_REPORT` completes it, and `EV_FF` writes go to the
//! device only.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tracing::debug;

use super::codes::{EV_FF, EV_SYN, SYN_REPORT};
use super::{
    Capabilities, DeviceOpener, EffectDescriptor, EffectId, EventDevice, InputEvent, OpenError,
    ReadStatus, FF_PLAY, FF_STOP,
};

/// One observed call on a [`MockDevice`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceCall {
    Upload(EffectDescriptor, EffectId),
    Remove(EffectId),
    Play(EffectId),
    Stop(EffectId),
    Write(InputEvent),
}

#[derive(Debug)]
pub struct MockDevice {
    capabilities: Capabilities,
    reads: Mutex<VecDeque<ReadStatus>>,
    readable: Condvar,
    blocking: AtomicBool,
    packet: Mutex<Vec<InputEvent>>,
    sync_reads: Mutex<VecDeque<ReadStatus>>,
    calls: Mutex<Vec<DeviceCall>>,
    next_effect_id: AtomicU16,
    fail_effects: AtomicBool,
}

impl MockDevice {
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            reads: Mutex::new(VecDeque::new()),
            readable: Condvar::new(),
            blocking: AtomicBool::new(false),
            packet: Mutex::new(Vec::new()),
            sync_reads: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            next_effect_id: AtomicU16::new(0),
            fail_effects: AtomicBool::new(false),
        }
    }

    /// Queues a result for `next_event`.
    pub fn push_read(&self, status: ReadStatus) {
        self.reads.lock().unwrap().push_back(status);
        self.readable.notify_all();
    }

    /// In blocking mode `next_event` waits for data instead of reporting
    /// `Empty`, and written packets are delivered back to the reader.
    pub fn set_blocking(&self, blocking: bool) {
        let _reads = self.reads.lock().unwrap();
        self.blocking.store(blocking, Ordering::SeqCst);
        self.readable.notify_all();
    }

    pub fn push_event(&self, event: InputEvent) {
        self.push_read(ReadStatus::Event(event));
    }

    /// Queues a result for `next_sync_event`.
    pub fn push_sync_read(&self, status: ReadStatus) {
        self.sync_reads.lock().unwrap().push_back(status);
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Makes every later upload, remove and write fail.
    pub fn fail_effects(&self, fail: bool) {
        self.fail_effects.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: DeviceCall) {
        debug!("Mock device call: {:?}", call);
        self.calls.lock().unwrap().push(call);
    }

    fn check_failure(&self) -> io::Result<()> {
        if self.fail_effects.load(Ordering::SeqCst) {
            Err(io::Error::from_raw_os_error(libc::EINVAL))
        } else {
            Ok(())
        }
    }

    fn deliver(&self, event: InputEvent) {
        if event.kind == EV_FF {
            return;
        }
        let mut packet = self.packet.lock().unwrap();
        packet.push(event);
        if event.kind == EV_SYN && event.code == SYN_REPORT {
            let mut reads = self.reads.lock().unwrap();
            reads.extend(packet.drain(..).map(ReadStatus::Event));
            self.readable.notify_all();
        }
    }
}

impl EventDevice for MockDevice {
    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn next_event(&self) -> ReadStatus {
        let mut reads = self.reads.lock().unwrap();
        while reads.is_empty() && self.blocking.load(Ordering::SeqCst) {
            reads = self.readable.wait(reads).unwrap();
        }
        reads.pop_front().unwrap_or(ReadStatus::Empty)
    }

    fn next_sync_event(&self) -> ReadStatus {
        self.sync_reads
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ReadStatus::Empty)
    }

    fn upload_effect(&self, effect: &EffectDescriptor) -> io::Result<EffectId> {
        self.check_failure()?;
        let id = self.next_effect_id.fetch_add(1, Ordering::SeqCst);
        self.record(DeviceCall::Upload(*effect, id));
        Ok(id)
    }

    fn remove_effect(&self, id: EffectId) -> io::Result<()> {
        self.record(DeviceCall::Remove(id));
        self.check_failure()
    }

    fn write_event(&self, event: InputEvent) -> io::Result<()> {
        let call = match (event.kind, event.value) {
            (EV_FF, FF_PLAY) => DeviceCall::Play(event.code),
            (EV_FF, FF_STOP) => DeviceCall::Stop(event.code),
            _ => DeviceCall::Write(event),
        };
        self.record(call);
        self.check_failure()?;
        if self.blocking.load(Ordering::SeqCst) {
            self.deliver(event);
        }
        Ok(())
    }
}

/// Hands out queued open results and remembers which paths were requested.
#[derive(Debug, Default)]
pub struct MockOpener {
    results: Mutex<VecDeque<Result<Arc<MockDevice>, OpenError>>>,
    opened: Mutex<Vec<PathBuf>>,
    attempts: AtomicUsize,
}

impl MockOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_device(&self, device: Arc<MockDevice>) {
        self.results.lock().unwrap().push_back(Ok(device));
    }

    pub fn push_error(&self, error: OpenError) {
        self.results.lock().unwrap().push_back(Err(error));
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn opened_paths(&self) -> Vec<PathBuf> {
        self.opened.lock().unwrap().clone()
    }
}

impl DeviceOpener for MockOpener {
    fn open(&self, path: &Path) -> Result<Arc<dyn EventDevice>, OpenError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let next = self.results.lock().unwrap().pop_front().unwrap_or_else(|| {
            Err(OpenError::Unavailable(io::Error::from_raw_os_error(
                libc::ENOENT,
            )))
        });
        let device = next?;
        self.opened.lock().unwrap().push(path.to_path_buf());
        Ok(device)
    }
}

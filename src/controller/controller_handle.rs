//! Joystick Handle - lifecycle of the evdev joystick node
//!
//! Wires the connection, reader, publish scheduler and feedback manager
//! together and owns the tasks they run on.
//!
//! # Threading Model
//!
//! ```text
//! reader thread:   JoystickNode<Running>::run ── read_once ──► PublishScheduler
//! tokio task:      publish timer (inside PublishScheduler)
//! tokio task:      feedback intake ── spawn_blocking ──► FeedbackEffectManager
//! tokio task:      waker ── on shutdown ──► ConnectionManager::wake_reader
//! ```
//!
//! The read loop checks the shutdown flag after every read. Because the read
//! blocks in the kernel, the waker writes a synthetic packet to the device so
//! the pending read returns. The loop runs on its own OS thread rather than
//! the runtime's blocking pool, so a reader that never wakes is left behind
//! without holding up runtime shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use statum::{machine, state};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::connection::{ConnectionError, ConnectionManager, DEFAULT_RETRY_DELAY};
use super::event_reader::{EventClass, EventReader};
use super::feedback::{FeedbackArray, FeedbackEffectManager};
use super::mapping::CodeMapper;
use super::publish_scheduler::{interval_for, PublishScheduler};
use super::snapshot::{SharedSnapshot, Snapshot, SnapshotPublisher};
use crate::device::DeviceOpener;
use crate::shutdown::ShutdownContext;

/// Settings for one joystick node
///
/// `axes_mapping` and `buttons_mapping` are kernel code names; their order
/// defines the order of the published `axes` and `buttons` arrays.
#[derive(Clone, Debug, PartialEq)]
pub struct JoystickSettings {
    pub device_file_path: PathBuf,
    pub axes_mapping: Vec<String>,
    pub buttons_mapping: Vec<String>,
    /// Upper bound for coalesced axis publishes, in Hz.
    pub max_send_frequency: f64,
    /// Zero every output when the device fails.
    pub fail_safe: bool,
    pub frame_id: String,
    /// Delay between failed open attempts.
    pub retry_delay: Duration,
}

impl Default for JoystickSettings {
    fn default() -> Self {
        Self {
            device_file_path: PathBuf::from("/dev/input/event0"),
            axes_mapping: Vec::new(),
            buttons_mapping: Vec::new(),
            max_send_frequency: 100.0,
            fail_safe: true,
            frame_id: "joy_link".to_string(),
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JoystickError {
    #[error("Connection error: {0}")]
    ConnectionError(#[from] ConnectionError),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Task error: {0}")]
    TaskError(String),
}

#[state]
#[derive(Debug, Clone)]
pub enum NodeState {
    Configured, // Components wired, device not yet opened
    Running,    // Device open, mapping built
}

#[machine]
#[derive(Debug)]
pub struct JoystickNode<S: NodeState> {
    settings: JoystickSettings,
    reader: EventReader,
    mapper: CodeMapper,
    shutdown: ShutdownContext,
}

impl<S: NodeState> JoystickNode<S> {
    pub fn settings(&self) -> &JoystickSettings {
        &self.settings
    }

    pub fn reader(&self) -> &EventReader {
        &self.reader
    }
}

impl JoystickNode<Configured> {
    pub fn create(
        settings: JoystickSettings,
        connection: Arc<ConnectionManager>,
        scheduler: Arc<PublishScheduler>,
        shutdown: ShutdownContext,
    ) -> Self {
        debug!("Creating joystick node with settings: {:?}", settings);
        let reader = EventReader::new(connection, scheduler, settings.fail_safe);
        Self::new(settings, reader, CodeMapper::default(), shutdown)
    }

    /// Opens the device, builds the code mapping and sizes the snapshot.
    pub fn connect(mut self) -> Result<JoystickNode<Running>, JoystickError> {
        let connection = self.reader.connection().clone();
        info!(
            "Connecting to joystick at '{}'",
            self.settings.device_file_path.display()
        );
        connection.open()?;

        let Some(device) = connection.device() else {
            return Err(ConnectionError::ShutdownRequested.into());
        };
        self.mapper = CodeMapper::build(
            &self.settings.axes_mapping,
            &self.settings.buttons_mapping,
            device.capabilities(),
        );
        if device.capabilities().has_force_feedback() {
            info!(
                "Force feedback available ({} effects)",
                device.capabilities().ff_effects_max
            );
        }

        self.reader
            .scheduler()
            .state()
            .resize(self.mapper.axes.len(), self.mapper.buttons.len());

        info!("Joystick node running");
        Ok(self.transition())
    }
}

impl JoystickNode<Running> {
    pub fn mapper(&self) -> &CodeMapper {
        &self.mapper
    }

    /// One read followed by the matching scheduler decision.
    pub fn run_once(&self) -> Result<EventClass, JoystickError> {
        let class = self.reader.read_once(&self.mapper)?;
        self.reader.scheduler().on_event(class);
        Ok(class)
    }

    /// Reads until shutdown is requested, then closes the device.
    pub fn run(self) -> Result<(), JoystickError> {
        info!("Starting read loop");
        let mut events: u64 = 0;

        while !self.shutdown.is_requested() {
            match self.run_once() {
                Ok(EventClass::None) => {}
                Ok(_) => events += 1,
                Err(JoystickError::ConnectionError(ConnectionError::ShutdownRequested)) => break,
                Err(e) => {
                    error!("Read loop terminated: {}", e);
                    self.reader.connection().close();
                    return Err(e);
                }
            }
        }

        info!("Read loop stopped after {} events", events);
        self.reader.connection().close();
        Ok(())
    }
}

/// Handle for the running joystick node and its helper tasks
pub struct JoystickHandle {
    reader_done: oneshot::Receiver<Result<(), JoystickError>>,
    feedback_task: JoinHandle<()>,
    waker_task: JoinHandle<()>,
    feedback_sender: mpsc::Sender<FeedbackArray>,
    connection: Arc<ConnectionManager>,
    scheduler: Arc<PublishScheduler>,
    shutdown: ShutdownContext,
}

impl JoystickHandle {
    /// Spawns the node on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// * [`JoystickError::InvalidSettings`] - `max_send_frequency` is not a positive number
    pub fn spawn(
        settings: JoystickSettings,
        opener: Arc<dyn DeviceOpener>,
        publisher: Arc<dyn SnapshotPublisher>,
        shutdown: ShutdownContext,
    ) -> Result<Self, JoystickError> {
        info!("Initializing joystick node with settings: {:?}", settings);

        if !(settings.max_send_frequency.is_finite() && settings.max_send_frequency > 0.0) {
            return Err(JoystickError::InvalidSettings(format!(
                "max_send_frequency must be > 0, got {}",
                settings.max_send_frequency
            )));
        }

        let scheduler = PublishScheduler::spawn(
            SharedSnapshot::new(Snapshot::default()),
            publisher,
            interval_for(settings.max_send_frequency),
            settings.frame_id.clone(),
            shutdown.clone(),
        );
        let connection = Arc::new(
            ConnectionManager::new(
                settings.device_file_path.clone(),
                opener,
                shutdown.clone(),
            )
            .with_retry_delay(settings.retry_delay),
        );

        let node = JoystickNode::create(
            settings,
            connection.clone(),
            scheduler.clone(),
            shutdown.clone(),
        );
        let (done_tx, reader_done) = oneshot::channel();
        thread::Builder::new()
            .name("joystick-reader".to_string())
            .spawn(move || {
                let result = match node.connect() {
                    Ok(running) => running.run(),
                    Err(JoystickError::ConnectionError(ConnectionError::ShutdownRequested)) => {
                        info!("Shutdown before the device was connected");
                        Ok(())
                    }
                    Err(e) => {
                        error!("Failed to connect joystick: {}", e);
                        Err(e)
                    }
                };
                if done_tx.send(result).is_err() {
                    debug!("Reader finished after the handle was dropped");
                }
            })
            .map_err(|e| {
                JoystickError::TaskError(format!("Failed to start reader thread: {}", e))
            })?;

        let (feedback_sender, feedback_receiver) = mpsc::channel(100);
        let feedback = Arc::new(FeedbackEffectManager::new(connection.clone()));
        let feedback_task = tokio::spawn(run_feedback_intake(
            feedback,
            feedback_receiver,
            shutdown.clone(),
        ));

        let waker_connection = connection.clone();
        let waker_shutdown = shutdown.clone();
        let waker_task = tokio::spawn(async move {
            waker_shutdown.cancelled().await;
            debug!("Waking blocked reader");
            waker_connection.wake_reader();
        });

        info!("Joystick node spawned");
        Ok(Self {
            reader_done,
            feedback_task,
            waker_task,
            feedback_sender,
            connection,
            scheduler,
            shutdown,
        })
    }

    /// Sender for incoming feedback batches.
    pub fn feedback_sender(&self) -> mpsc::Sender<FeedbackArray> {
        self.feedback_sender.clone()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn scheduler(&self) -> &Arc<PublishScheduler> {
        &self.scheduler
    }

    /// Requests shutdown and waits up to `grace` for the read loop to exit.
    ///
    /// A reader still blocked after `grace` is detached and left behind.
    pub async fn join(self, grace: Duration) -> Result<(), JoystickError> {
        self.shutdown.request();

        let result = match tokio::time::timeout(grace, self.reader_done).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(JoystickError::TaskError(
                "Reader thread exited without a result".to_string(),
            )),
            Err(_) => {
                warn!("Reader did not stop within {:?}, abandoning it", grace);
                Ok(())
            }
        };

        if let Err(e) = self.feedback_task.await {
            warn!("Feedback task ended abnormally: {}", e);
        }
        if let Err(e) = self.waker_task.await {
            warn!("Waker task ended abnormally: {}", e);
        }

        info!("Joystick node stopped");
        result
    }
}

async fn run_feedback_intake(
    manager: Arc<FeedbackEffectManager>,
    mut receiver: mpsc::Receiver<FeedbackArray>,
    shutdown: ShutdownContext,
) {
    info!("Feedback intake started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            batch = receiver.recv() => {
                let Some(batch) = batch else {
                    debug!("Feedback channel closed");
                    break;
                };
                let manager = manager.clone();
                if let Err(e) =
                    tokio::task::spawn_blocking(move || manager.apply(&batch.array)).await
                {
                    error!("Feedback worker failed: {}", e);
                }
            }
        }
    }

    info!("Feedback intake stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::snapshot::{ChannelPublisher, JoyMessage};
    use crate::device::codes::{ABS_X, BTN_SOUTH, EV_ABS, EV_KEY};
    use crate::device::mock::{MockDevice, MockOpener};
    use crate::device::{AbsInfo, Capabilities, InputEvent};

    fn settings() -> JoystickSettings {
        JoystickSettings {
            device_file_path: PathBuf::from("/dev/input/event9"),
            axes_mapping: vec!["ABS_X".into(), "ABS_Z".into()],
            buttons_mapping: vec!["BTN_SOUTH".into()],
            retry_delay: Duration::from_millis(1),
            ..JoystickSettings::default()
        }
    }

    fn pad() -> Arc<MockDevice> {
        let mut caps = Capabilities {
            name: "Node Pad".into(),
            ..Capabilities::default()
        };
        caps.event_types.extend([EV_ABS, EV_KEY]);
        caps.axes.insert(ABS_X, AbsInfo::with_range(-10, 10));
        caps.keys.insert(BTN_SOUTH);
        Arc::new(MockDevice::new(caps))
    }

    #[tokio::test]
    async fn connect_sizes_snapshot_to_configured_names() {
        let device = pad();
        let opener = Arc::new(MockOpener::new());
        opener.push_device(device.clone());
        let (tx, mut rx) = mpsc::channel::<JoyMessage>(8);
        let shutdown = ShutdownContext::new();

        let scheduler = PublishScheduler::spawn(
            SharedSnapshot::default(),
            Arc::new(ChannelPublisher::new(tx)),
            Duration::from_millis(10),
            "joy_link".into(),
            shutdown.clone(),
        );
        let connection = Arc::new(
            ConnectionManager::new("/dev/input/event9", opener, shutdown.clone())
                .with_retry_delay(Duration::from_millis(1)),
        );
        let node = JoystickNode::create(settings(), connection, scheduler.clone(), shutdown)
            .connect()
            .unwrap();

        assert_eq!(node.mapper().axes.len(), 2);
        assert_eq!(scheduler.state().snapshot(), Snapshot::sized(2, 1));

        device.push_event(InputEvent::new(EV_KEY, BTN_SOUTH, 1));
        assert_eq!(node.run_once().unwrap(), EventClass::Button);
        let message = rx.recv().await.unwrap();
        assert_eq!(message.buttons, vec![1]);
        assert_eq!(message.axes, vec![0.0, 0.0]);
    }

    #[tokio::test]
    async fn zero_frequency_is_rejected() {
        let (tx, _rx) = mpsc::channel::<JoyMessage>(1);
        let result = JoystickHandle::spawn(
            JoystickSettings {
                max_send_frequency: 0.0,
                ..settings()
            },
            Arc::new(MockOpener::new()),
            Arc::new(ChannelPublisher::new(tx)),
            ShutdownContext::new(),
        );
        assert!(matches!(result, Err(JoystickError::InvalidSettings(_))));
    }
}

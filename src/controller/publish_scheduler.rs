//! Publish coalescing
//!
//! Button transitions are published immediately. Axis changes (re)arm a
//! one-shot deadline `interval` in the future; a burst of axis events
//! therefore produces a single publish `interval` after the last one.
//!
//! ```text
//! reader thread ──on_event──► SnapshotState.publish_deadline ──watch──► timer task
//!                   │                                                    │
//!                   └──── publish_now ──► SnapshotPublisher ◄──── fire ──┘
//! ```
//!
//! The deadline is stored next to the snapshot under the same mutex, and the
//! timer only publishes if the deadline it slept on is still the current one.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use super::event_reader::EventClass;
use super::snapshot::{JoyMessage, SharedSnapshot, SnapshotPublisher, SnapshotState};
use crate::shutdown::ShutdownContext;

/// Coalescing interval for a maximum publish rate in Hz.
pub fn interval_for(max_send_frequency: f64) -> Duration {
    Duration::from_secs_f64(1.0 / max_send_frequency)
}

#[derive(Debug)]
pub struct PublishScheduler {
    state: SharedSnapshot,
    publisher: Arc<dyn SnapshotPublisher>,
    interval: Duration,
    frame_id: String,
    deadline_tx: watch::Sender<Option<Instant>>,
}

impl PublishScheduler {
    /// Creates the scheduler and spawns its timer task on the current runtime.
    pub fn spawn(
        state: SharedSnapshot,
        publisher: Arc<dyn SnapshotPublisher>,
        interval: Duration,
        frame_id: String,
        shutdown: ShutdownContext,
    ) -> Arc<Self> {
        let (deadline_tx, deadline_rx) = watch::channel(None);
        let scheduler = Arc::new(Self {
            state,
            publisher,
            interval,
            frame_id,
            deadline_tx,
        });

        info!("Spawning publish timer with interval {:?}", interval);
        tokio::spawn(run_timer(Arc::downgrade(&scheduler), deadline_rx, shutdown));

        scheduler
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> &SharedSnapshot {
        &self.state
    }

    pub fn on_event(&self, class: EventClass) {
        match class {
            EventClass::Button => self.publish_now(),
            EventClass::Axis => self.arm(),
            EventClass::Other | EventClass::None => {}
        }
    }

    /// Stops any pending deadline and publishes, in one critical section.
    pub fn publish_now(&self) {
        let mut state = self.state.lock();
        self.disarm(&mut state);
        self.emit(&state);
    }

    /// Zeroes the snapshot if `zero` is set, then publishes it immediately.
    pub fn publish_fail_safe(&self, zero: bool) {
        let mut state = self.state.lock();
        if zero {
            info!("Fail-safe: zeroing all axes and buttons");
            state.zero();
        }
        self.disarm(&mut state);
        self.emit(&state);
    }

    /// Moves the deadline to `now + interval`.
    pub fn arm(&self) {
        let mut state = self.state.lock();
        let deadline = Instant::now() + self.interval;
        state.publish_deadline = Some(deadline);
        self.deadline_tx.send_replace(Some(deadline));
        trace!("Publish deadline moved to {:?}", deadline);
    }

    pub fn is_armed(&self) -> bool {
        self.state.lock().publish_deadline.is_some()
    }

    /// Timer expiry. Publishes only if `deadline` is still the pending one.
    pub fn fire(&self, deadline: Instant) -> bool {
        let mut state = self.state.lock();
        if state.publish_deadline != Some(deadline) {
            trace!("Stale publish deadline ignored");
            return false;
        }
        state.publish_deadline = None;
        self.emit(&state);
        true
    }

    fn disarm(&self, state: &mut SnapshotState) {
        if state.publish_deadline.take().is_some() {
            self.deadline_tx.send_replace(None);
        }
    }

    fn emit(&self, state: &SnapshotState) {
        let message = JoyMessage::stamped(&state.snapshot, &self.frame_id);
        debug!("Publishing {}", message);
        self.publisher.publish(&message);
    }
}

async fn run_timer(
    scheduler: Weak<PublishScheduler>,
    mut deadline_rx: watch::Receiver<Option<Instant>>,
    shutdown: ShutdownContext,
) {
    loop {
        let deadline = *deadline_rx.borrow_and_update();

        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = deadline_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        let Some(scheduler) = scheduler.upgrade() else {
                            break;
                        };
                        scheduler.fire(deadline);
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = deadline_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    debug!("Publish timer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::snapshot::Snapshot;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Recorder {
        published: Mutex<Vec<(Instant, JoyMessage)>>,
    }

    impl Recorder {
        fn count(&self) -> usize {
            self.published.lock().unwrap().len()
        }

        fn times(&self) -> Vec<Instant> {
            self.published.lock().unwrap().iter().map(|(at, _)| *at).collect()
        }

        fn last(&self) -> JoyMessage {
            self.published.lock().unwrap().last().unwrap().1.clone()
        }
    }

    impl SnapshotPublisher for Recorder {
        fn publish(&self, message: &JoyMessage) {
            self.published
                .lock()
                .unwrap()
                .push((Instant::now(), message.clone()));
        }
    }

    const INTERVAL: Duration = Duration::from_millis(10);

    fn scheduler() -> (Arc<PublishScheduler>, Arc<Recorder>, ShutdownContext) {
        let recorder = Arc::new(Recorder::default());
        let shutdown = ShutdownContext::new();
        let scheduler = PublishScheduler::spawn(
            SharedSnapshot::new(Snapshot::sized(2, 2)),
            recorder.clone(),
            INTERVAL,
            "joy_link".to_string(),
            shutdown.clone(),
        );
        (scheduler, recorder, shutdown)
    }

    #[test]
    fn interval_is_the_inverse_frequency() {
        assert_eq!(interval_for(100.0), Duration::from_millis(10));
        assert_eq!(interval_for(4.0), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn axis_burst_publishes_once_after_the_last_event() {
        let (scheduler, recorder, _shutdown) = scheduler();

        for _ in 0..5 {
            scheduler.on_event(EventClass::Axis);
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
        let last_event = Instant::now() - Duration::from_millis(3);
        assert_eq!(recorder.count(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(recorder.count(), 1);
        assert_eq!(recorder.times()[0], last_event + INTERVAL);
        assert!(!scheduler.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn button_publishes_immediately_and_disarms() {
        let (scheduler, recorder, _shutdown) = scheduler();

        scheduler.on_event(EventClass::Axis);
        assert!(scheduler.is_armed());

        scheduler.on_event(EventClass::Button);
        assert_eq!(recorder.count(), 1);
        assert!(!scheduler.is_armed());

        tokio::time::sleep(INTERVAL * 5).await;
        assert_eq!(recorder.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn other_events_do_not_schedule() {
        let (scheduler, recorder, _shutdown) = scheduler();

        scheduler.on_event(EventClass::Other);
        scheduler.on_event(EventClass::None);
        tokio::time::sleep(INTERVAL * 5).await;

        assert_eq!(recorder.count(), 0);
        assert!(!scheduler.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_deadline_is_ignored() {
        let (scheduler, recorder, _shutdown) = scheduler();

        scheduler.arm();
        let stale = scheduler.state().lock().publish_deadline.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        scheduler.arm();

        assert!(!scheduler.fire(stale));
        assert_eq!(recorder.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fail_safe_publishes_zeroes() {
        let (scheduler, recorder, _shutdown) = scheduler();
        {
            let mut state = scheduler.state().lock();
            state.snapshot.axes[0] = 0.7;
            state.snapshot.buttons[1] = 1;
        }
        scheduler.arm();

        scheduler.publish_fail_safe(true);

        assert_eq!(recorder.count(), 1);
        assert!(Snapshot {
            axes: recorder.last().axes,
            buttons: recorder.last().buttons
        }
        .is_zeroed());
        assert!(!scheduler.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_stops_on_shutdown() {
        let (scheduler, recorder, shutdown) = scheduler();

        shutdown.request();
        tokio::task::yield_now().await;
        scheduler.arm();
        tokio::time::sleep(INTERVAL * 5).await;

        assert_eq!(recorder.count(), 0);
    }
}

//! Integration tests for the joystick node against the mock device backend

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use evdev_joy::controller::{
    ChannelPublisher, ConnectionError, JoyMessage, JoystickError, JoystickHandle, JoystickSettings,
};
use evdev_joy::device::codes::{
    ABS_X, ABS_Y, BTN_EAST, BTN_SOUTH, EV_ABS, EV_FF, EV_KEY, EV_SYN, SYN_REPORT,
};
use evdev_joy::device::mock::{DeviceCall, MockDevice, MockOpener};
use evdev_joy::device::{AbsInfo, Capabilities, InputEvent, OpenError, ReadStatus};
use evdev_joy::shutdown::ShutdownContext;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

fn gamepad(force_feedback: bool) -> Capabilities {
    let mut caps = Capabilities {
        name: "Integration Pad".into(),
        ..Capabilities::default()
    };
    caps.event_types.extend([EV_ABS, EV_KEY]);
    if force_feedback {
        caps.event_types.insert(EV_FF);
    }
    caps.axes.insert(ABS_X, AbsInfo::with_range(-1000, 1000));
    caps.axes.insert(ABS_Y, AbsInfo::with_range(-1000, 1000));
    caps.keys.extend([BTN_SOUTH, BTN_EAST]);
    caps
}

fn settings() -> JoystickSettings {
    JoystickSettings {
        device_file_path: PathBuf::from("/dev/input/event2"),
        axes_mapping: vec!["ABS_X".into(), "ABS_Y".into()],
        buttons_mapping: vec!["BTN_SOUTH".into(), "BTN_EAST".into()],
        max_send_frequency: 20.0,
        retry_delay: Duration::from_millis(20),
        ..JoystickSettings::default()
    }
}

fn spawn(
    opener: Arc<MockOpener>,
    shutdown: ShutdownContext,
) -> (JoystickHandle, mpsc::Receiver<JoyMessage>) {
    let (tx, rx) = mpsc::channel(100);
    let handle = JoystickHandle::spawn(
        settings(),
        opener,
        Arc::new(ChannelPublisher::new(tx)),
        shutdown,
    )
    .unwrap();
    (handle, rx)
}

async fn next_message(rx: &mut mpsc::Receiver<JoyMessage>) -> JoyMessage {
    timeout(WAIT, rx.recv())
        .await
        .expect("no snapshot published in time")
        .expect("snapshot channel closed")
}

#[tokio::test]
async fn test_buttons_publish_immediately_and_axes_coalesce() {
    let device = Arc::new(MockDevice::new(gamepad(true)));
    device.set_blocking(true);
    let opener = Arc::new(MockOpener::new());
    opener.push_device(device.clone());
    let (handle, mut rx) = spawn(opener, ShutdownContext::new());

    device.push_event(InputEvent::new(EV_KEY, BTN_SOUTH, 1));
    let message = next_message(&mut rx).await;
    assert_eq!(message.buttons, vec![1, 0]);
    assert_eq!(message.axes, vec![0.0, 0.0]);
    assert_eq!(message.header.frame_id, "joy_link");

    for value in [100, 200, 300] {
        device.push_event(InputEvent::new(EV_ABS, ABS_X, value));
    }
    let message = next_message(&mut rx).await;
    assert!((message.axes[0] - 0.3).abs() < 1e-6);
    assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());

    handle.join(WAIT).await.unwrap();
    assert_eq!(
        device.calls(),
        vec![
            DeviceCall::Stop(0),
            DeviceCall::Write(InputEvent::new(EV_SYN, SYN_REPORT, 0)),
        ]
    );
}

#[tokio::test]
async fn test_shutdown_wakes_reader_without_force_feedback() {
    let device = Arc::new(MockDevice::new(gamepad(false)));
    device.set_blocking(true);
    let opener = Arc::new(MockOpener::new());
    opener.push_device(device.clone());
    let (handle, mut rx) = spawn(opener, ShutdownContext::new());

    device.push_event(InputEvent::new(EV_KEY, BTN_EAST, 1));
    next_message(&mut rx).await;

    handle.join(WAIT).await.unwrap();
    assert!(matches!(device.calls()[0], DeviceCall::Write(_)));
    assert_eq!(device.calls().len(), 2);
}

#[tokio::test]
async fn test_hard_fault_publishes_zeroes_and_reconnects() {
    let failing = Arc::new(MockDevice::new(gamepad(false)));
    failing.push_event(InputEvent::new(EV_ABS, ABS_Y, -1000));
    failing.push_event(InputEvent::new(EV_KEY, BTN_SOUTH, 1));
    failing.push_read(ReadStatus::Error(io::Error::from_raw_os_error(libc::ENODEV)));

    let replacement = Arc::new(MockDevice::new(gamepad(false)));
    replacement.set_blocking(true);

    let opener = Arc::new(MockOpener::new());
    opener.push_device(failing);
    opener.push_error(OpenError::Unavailable(io::Error::from_raw_os_error(
        libc::ENOENT,
    )));
    opener.push_device(replacement.clone());
    let (handle, mut rx) = spawn(opener.clone(), ShutdownContext::new());

    let before = next_message(&mut rx).await;
    assert_eq!(before.axes, vec![0.0, -1.0]);
    assert_eq!(before.buttons, vec![1, 0]);

    let fail_safe = next_message(&mut rx).await;
    assert_eq!(fail_safe.axes, vec![0.0, 0.0]);
    assert_eq!(fail_safe.buttons, vec![0, 0]);

    replacement.push_event(InputEvent::new(EV_KEY, BTN_EAST, 1));
    let after = next_message(&mut rx).await;
    assert_eq!(after.buttons, vec![0, 1]);
    assert_eq!(opener.attempts(), 3);
    assert_eq!(handle.connection().generation(), 2);

    handle.join(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_incompatible_device_shuts_down() {
    let opener = Arc::new(MockOpener::new());
    opener.push_error(OpenError::Incompatible(io::Error::from_raw_os_error(
        libc::ENOTTY,
    )));
    let shutdown = ShutdownContext::new();
    let (handle, _rx) = spawn(opener, shutdown.clone());

    timeout(WAIT, shutdown.cancelled()).await.unwrap();
    let result = handle.join(WAIT).await;
    assert!(matches!(
        result,
        Err(JoystickError::ConnectionError(
            ConnectionError::IncompatibleDevice { .. }
        ))
    ));
}

#[tokio::test]
async fn test_join_leaves_a_reader_that_never_wakes_behind() {
    let device = Arc::new(MockDevice::new(gamepad(true)));
    device.set_blocking(true);
    device.fail_effects(true);
    let opener = Arc::new(MockOpener::new());
    opener.push_device(device.clone());
    let (handle, _rx) = spawn(opener, ShutdownContext::new());

    for _ in 0..200 {
        if handle.connection().is_up() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(handle.connection().is_up());

    let result = timeout(WAIT, handle.join(Duration::from_millis(100))).await;
    assert!(matches!(result, Ok(Ok(()))));
    assert_eq!(device.calls().len(), 1);
}

#[tokio::test]
async fn test_shutdown_interrupts_open_retries() {
    let opener = Arc::new(MockOpener::new());
    let (handle, _rx) = spawn(opener.clone(), ShutdownContext::new());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(opener.attempts() >= 2);
    assert!(!handle.connection().is_up());

    timeout(WAIT, handle.join(WAIT)).await.unwrap().unwrap();
}

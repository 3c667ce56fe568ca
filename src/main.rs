use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use evdev_joy::config::{self, JoyConfig};
use evdev_joy::controller::{ChannelPublisher, JoystickHandle};
use evdev_joy::device::linux::LinuxDeviceOpener;
use evdev_joy::mqtt::mqtt_handler::MqttHandler;
use evdev_joy::shutdown::ShutdownContext;
use tokio::sync::mpsc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = config::resolve_path(
        std::env::args().nth(1),
        std::env::var(config::CONFIG_ENV).ok(),
    );
    let config = JoyConfig::load(&config_path).await?;

    let shutdown = ShutdownContext::new();
    spawn_signal_handler(shutdown.clone());

    let (snapshot_tx, snapshot_rx) = mpsc::channel(1000);
    let joystick = JoystickHandle::spawn(
        config.joystick_settings(),
        Arc::new(LinuxDeviceOpener),
        Arc::new(ChannelPublisher::new(snapshot_tx)),
        shutdown.clone(),
    )
    .map_err(|e| eyre!("Failed to spawn joystick node: {}", e))?;

    let feedback_tx = joystick.feedback_sender();
    let mqtt_shutdown = shutdown.clone();
    let mqtt_config = config.mqtt.clone();
    let mqtt_task = tokio::spawn(async move {
        let mut handler = MqttHandler::new(mqtt_config);
        handler.run(snapshot_rx, feedback_tx, mqtt_shutdown).await;
    });

    shutdown.cancelled().await;
    info!("Shutting down");

    let result = joystick.join(SHUTDOWN_GRACE).await;
    if let Err(e) = mqtt_task.await {
        error!("MQTT task failed: {}", e);
    }

    result.map_err(|e| eyre!("Joystick node failed: {}", e))
}

fn spawn_signal_handler(shutdown: ShutdownContext) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C");
                shutdown.request();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

use roboroach_session::domain::settings::{Settings, SettingsService};
use roboroach_session::infrastructure::logging;
use roboroach_session::{
    link_channel, ConnectionConfig, ConnectionState, DeviceId, DragSample, GestureInput,
    GestureTranslator, SessionEvent, SessionHandle, SessionService, SettingField,
    SimulatedDevice,
};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

const READY_TIMEOUT: Duration = Duration::from_secs(20);
const SAMPLE_INTERVAL: Duration = Duration::from_millis(50);

fn load_settings() -> SettingsService {
    match SettingsService::new() {
        Ok(service) => service,
        Err(e) => {
            eprintln!("Could not load settings, using defaults: {e:#}");
            let path = std::env::temp_dir().join("roboroach-settings.json");
            SettingsService::at_path(path)
        }
    }
}

/// Print every session event until the channel closes.
fn spawn_event_printer(mut events: broadcast::Receiver<SessionEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("{event:?}"),
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("Missed {} events", n),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Wait until the post-connect read finished, or the connection failed.
async fn initialized(events: &mut broadcast::Receiver<SessionEvent>) -> anyhow::Result<()> {
    loop {
        match events.recv().await? {
            SessionEvent::SettingsReadComplete => return Ok(()),
            SessionEvent::ConnectionStateChanged(ConnectionState::Failed(reason)) => {
                anyhow::bail!("connection failed: {reason}")
            }
            _ => {}
        }
    }
}

async fn start_session(handle: &SessionHandle, settings: &Settings) -> anyhow::Result<()> {
    let mut events = handle.subscribe();

    let state = match &settings.last_connected_device {
        Some(id) => {
            info!("Reconnecting to last device {}", id);
            match handle.connect(id.clone()).await {
                Ok(state) => state,
                Err(e) => {
                    warn!("Reconnect failed ({}), scanning instead", e);
                    handle.scan().await?
                }
            }
        }
        None => handle.scan().await?,
    };
    info!("Session started in state {}", state);

    tokio::time::timeout(READY_TIMEOUT, initialized(&mut events)).await?
}

/// A short rightward drag, a pause, then a leftward flick.
fn demo_gesture() -> Vec<GestureInput> {
    let mut inputs = Vec::new();
    let mut at = Duration::ZERO;
    for step in 0..20u32 {
        at += SAMPLE_INTERVAL;
        let dx = (f64::from(step) * 15.0).min(240.0);
        inputs.push(GestureInput::Drag(DragSample::new(at, dx, 4.0)));
    }
    inputs.push(GestureInput::Release);
    for step in 0..4u32 {
        at += SAMPLE_INTERVAL;
        inputs.push(GestureInput::Drag(DragSample::new(at, -90.0 * f64::from(step + 1), 0.0)));
    }
    inputs.push(GestureInput::Release);
    inputs
}

async fn run_demo(handle: &SessionHandle, settings: &Settings) -> anyhow::Result<()> {
    handle.apply_local_edit(SettingField::Frequency, 60).await?;
    handle.apply_local_edit(SettingField::Gain, 70).await?;
    if let Err(e) = handle.apply_local_edit(SettingField::PulseWidth, 90_000).await {
        info!("Edit rejected as expected: {}", e);
    }
    handle.commit().await?;

    let mut translator = GestureTranslator::new(settings.gesture);
    for input in demo_gesture() {
        if let Some(command) = translator.process(input) {
            if let Err(e) = handle.send_command(command).await {
                warn!("Movement {:?} not sent: {}", command, e);
            }
        }
        tokio::time::sleep(SAMPLE_INTERVAL).await;
    }

    handle.refresh().await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let snapshot = handle.snapshot().await?;
    info!(
        "Device {:?} confirmed {:?}, battery {:?}",
        snapshot.device,
        snapshot.confirmed.map(|s| s.describe()),
        snapshot.device_info.battery_percent
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut settings_service = load_settings();
    let settings = settings_service.get().clone();
    let _guard = logging::init_logger(&settings.log_settings)?;

    info!("Starting RoboRoach session controller");
    info!("Settings file: {}", settings_service.path().display());

    let (link_tx, link_rx) = link_channel();
    let device = SimulatedDevice::new(link_tx);
    let (handle, task) =
        SessionService::spawn(device, link_rx, ConnectionConfig::from(&settings));
    spawn_event_printer(handle.subscribe());

    match start_session(&handle, &settings).await {
        Ok(()) => {
            if let Some(id) = handle.snapshot().await?.device {
                remember(&mut settings_service, &id);
            }
            if let Err(e) = run_demo(&handle, &settings).await {
                error!("Demo session failed: {:#}", e);
            }
        }
        Err(e) => error!("Could not start session: {:#}", e),
    }

    handle.disconnect().await?;
    handle.shutdown().await?;
    task.await?;
    info!("Goodbye");
    Ok(())
}

fn remember(settings_service: &mut SettingsService, id: &DeviceId) {
    if let Err(e) = settings_service.remember_device(id) {
        warn!("Could not save device {}: {:#}", id, e);
    }
}

use std::{sync::Arc, time::Duration};
use tracing::{error, info, warn};
use sabers::{
    BtleplugRadio, ColorDispatch, ManagerConfig, Platform, RadioStatus, Result, SaberError,
    SaberManager,
};

static COLORS: [&str; 6] = [
    "#ff0000", "#ff8000", "#ffff00", "#00ff00", "#0000ff", "#8000ff",
];

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🌈 Sabers Color Cycle Example");

    let radio = Arc::new(BtleplugRadio::new(Platform::current()).await?);
    let manager = Arc::new(SaberManager::new(radio, ManagerConfig::default()));
    let _active = manager.activate();

    let mut status = manager.watch_radio_status();
    while *status.borrow_and_update() != RadioStatus::On {
        if status.changed().await.is_err() {
            return Err(SaberError::AdapterUnavailable {
                status: manager.radio_status(),
            });
        }
    }

    manager.start_scan().await?;
    let mut scanning = manager.watch_scanning();
    while *scanning.borrow_and_update() {
        if scanning.changed().await.is_err() {
            break;
        }
    }

    let Some(stand) = manager.peripherals().await.into_iter().next() else {
        warn!("⚠️ No saber stand found");
        return Ok(());
    };
    info!("✅ Using {} ({})", stand.name, stand.id);

    // Colours sent faster than the stand accepts them are coalesced
    let mut sends = Vec::new();
    for color in COLORS.iter().cycle().take(COLORS.len() * 3) {
        let manager = Arc::clone(&manager);
        let id = stand.id.clone();
        sends.push(tokio::spawn(async move {
            manager.set_color(&id, color).await
        }));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let mut sent = 0;
    let mut coalesced = 0;
    for send in sends {
        match send.await {
            Ok(Ok(ColorDispatch::Sent)) => sent += 1,
            Ok(Ok(ColorDispatch::Coalesced)) => coalesced += 1,
            Ok(Ok(ColorDispatch::Rejected)) => {}
            Ok(Err(e)) if e.is_recoverable() => warn!("⚠️ Color command failed: {}", e),
            Ok(Err(e)) => {
                error!("❌ Color command failed: {}", e);
                return Err(e);
            }
            Err(e) => error!("❌ Color task panicked: {}", e),
        }
    }
    info!("Sent {} commands, coalesced {} colors", sent, coalesced);

    if let Some(stand) = manager.peripheral(&stand.id).await {
        info!("Final color {}, power {}", stand.color, stand.power);
    }

    manager.set_power(&stand.id, false).await?;
    info!("🔌 Stand switched off");
    Ok(())
}

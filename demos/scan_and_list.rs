use std::sync::Arc;
use tracing::{error, info, warn};
use sabers::{BtleplugRadio, ManagerConfig, Platform, RadioStatus, Result, SaberManager};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🔍 Sabers Scan Example");

    let radio = Arc::new(BtleplugRadio::new(Platform::current()).await?);
    let manager = Arc::new(SaberManager::new(radio, ManagerConfig::default()));
    let _active = manager.activate();

    // Wait for the adapter to report its state
    let mut status = manager.watch_radio_status();
    while *status.borrow_and_update() == RadioStatus::Unknown {
        if status.changed().await.is_err() {
            break;
        }
    }
    if !manager.radio_status().is_on() {
        warn!("⚠️ Bluetooth is {}, nothing to scan", manager.radio_status());
        return Ok(());
    }

    if let Err(e) = manager.start_scan().await {
        error!("❌ Failed to start scan: {}", e);
        return Err(e);
    }

    let mut scanning = manager.watch_scanning();
    while *scanning.borrow_and_update() {
        if scanning.changed().await.is_err() {
            break;
        }
    }
    info!("Scan finished ({:?})", manager.scan_outcome());

    let stands = manager.peripherals().await;
    if stands.is_empty() {
        println!("No saber stands found");
        return Ok(());
    }

    println!("\n{:<40} {:>5} {:>5} {:>8}", "Stand", "RSSI", "Power", "Color");
    for stand in stands {
        println!(
            "{:<40} {:>5} {:>5} {:>8}",
            format!("{} ({})", stand.name, stand.id),
            stand.rssi,
            if stand.power { "ON" } else { "OFF" },
            stand.color
        );
    }

    Ok(())
}

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;
use sabers::{
    BtleplugRadio, ManagerConfig, Platform, Prompter, Result, SaberManager, SettingsPrompt,
    RadioStatus,
};

/// Answers every prompt on the terminal
struct ConsolePrompter;

#[async_trait]
impl Prompter for ConsolePrompter {
    async fn confirm(&self, prompt: &SettingsPrompt) -> bool {
        println!("\n⚠️  {}\n{}", prompt.title, prompt.message);
        println!("(no settings app on this host, dismissing)");
        false
    }

    async fn open_settings(&self, status: RadioStatus) -> Result<()> {
        info!("Would open Bluetooth settings for {}", status);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("📡 Sabers Radio Status Example");
    info!("Toggle Bluetooth to see transitions, Ctrl+C to stop");

    let radio = Arc::new(BtleplugRadio::new(Platform::current()).await?);
    let manager = Arc::new(
        SaberManager::new(radio, ManagerConfig::default())
            .with_prompter(Arc::new(ConsolePrompter)),
    );
    let _active = manager.activate();

    let mut status = manager.watch_radio_status();
    loop {
        let current = *status.borrow_and_update();
        println!("Bluetooth: {current}");
        if current.is_on() {
            manager.start_scan().await?;
            info!("Scanning while the radio is on");
        }

        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    Ok(())
}

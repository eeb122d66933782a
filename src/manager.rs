use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    error::Result,
    monitor::{resolve_prompt, Prompter, RadioMonitor, SettingsPrompt},
    radio::{EventKind, Radio, RadioEvent},
    registry::{PeripheralRegistry, SharedRegistry},
    scan::ScanController,
    sequencer::{ColorDispatch, CommandSequencer},
    types::{
        CommandPhase, Peripheral, PeripheralId, Platform, RadioStatus, ScanOutcome, ScanParams,
        TimeoutConfig,
    },
};

/// Configuration for [`SaberManager`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Platform family whose offsets and indices apply
    pub platform: Platform,
    /// Scan parameters
    pub scan: ScanParams,
    /// Radio call timeouts
    pub timeouts: TimeoutConfig,
}

/// Entry point for a saber stand UI
///
/// Owns the peripheral registry and wires the scan controller, the command
/// sequencer and the radio monitor to one [`Radio`]. Radio events reach
/// the components through [`SaberManager::handle_event`], which
/// [`SaberManager::activate`] drives from a background task.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use sabers::{BtleplugRadio, ManagerConfig, Platform, SaberManager};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let radio = Arc::new(BtleplugRadio::new(Platform::current()).await?);
///     let manager = Arc::new(SaberManager::new(radio, ManagerConfig::default()));
///     let _active = manager.activate();
///
///     manager.start_scan().await?;
///     tokio::time::sleep(std::time::Duration::from_secs(3)).await;
///
///     for stand in manager.peripherals().await {
///         manager.set_color(&stand.id, "#00ff00").await?;
///     }
///     Ok(())
/// }
/// ```
pub struct SaberManager<R: Radio + ?Sized> {
    radio: Arc<R>,
    registry: SharedRegistry,
    monitor: RadioMonitor,
    scanner: ScanController<R>,
    sequencer: CommandSequencer<R>,
    prompter: Option<Arc<dyn Prompter>>,
    color_inputs: Mutex<HashMap<PeripheralId, String>>,
}

impl<R: Radio + ?Sized + 'static> SaberManager<R> {
    /// Create a manager on top of a radio
    #[must_use]
    pub fn new(radio: Arc<R>, config: ManagerConfig) -> Self {
        let registry = PeripheralRegistry::shared();
        let monitor = RadioMonitor::new();
        let scanner = ScanController::new(
            Arc::clone(&radio),
            Arc::clone(&registry),
            monitor.subscribe(),
            config.scan,
            config.platform,
        );
        let sequencer = CommandSequencer::new(
            Arc::clone(&radio),
            Arc::clone(&registry),
            config.platform,
            config.timeouts,
        );

        Self {
            radio,
            registry,
            monitor,
            scanner,
            sequencer,
            prompter: None,
            color_inputs: Mutex::new(HashMap::new()),
        }
    }

    /// Show settings prompts through `prompter`
    #[must_use]
    pub fn with_prompter(mut self, prompter: Arc<dyn Prompter>) -> Self {
        self.prompter = Some(prompter);
        self
    }

    /// Start feeding radio events into the manager
    ///
    /// Asks the radio for its current state once subscribed. Events are
    /// processed until the returned [`Activation`] is dropped.
    #[must_use]
    pub fn activate(self: &Arc<Self>) -> Activation {
        let mut events = self.radio.subscribe(&EventKind::ALL);
        let manager = Arc::clone(self);

        let pump = tokio::spawn(async move {
            if let Err(e) = manager.radio.check_state().await {
                warn!("Failed to query Bluetooth state: {}", e);
            }
            while let Some(event) = events.recv().await {
                manager.handle_event(event).await;
            }
            debug!("Radio event stream closed");
        });

        info!("Saber manager activated");
        Activation { pump }
    }

    /// Route one radio event to the component that owns it
    pub async fn handle_event(&self, event: RadioEvent) {
        match event {
            RadioEvent::Discovered(discovery) => {
                self.scanner.handle_discovery(discovery).await;
            }
            RadioEvent::ScanStopped => self.scanner.handle_scan_stopped(),
            RadioEvent::Disconnected(id) => self.sequencer.handle_disconnect(&id).await,
            RadioEvent::StateChanged(raw) => {
                if let Some(prompt) = self.monitor.record(&raw) {
                    self.show_prompt(prompt);
                }
            }
        }
    }

    fn show_prompt(&self, prompt: SettingsPrompt) {
        let Some(prompter) = self.prompter.clone() else {
            info!("{}: {}", prompt.title, prompt.message);
            return;
        };

        tokio::spawn(async move {
            if let Err(e) = resolve_prompt(prompter.as_ref(), &prompt).await {
                warn!("Failed to open Bluetooth settings: {}", e);
            }
        });
    }

    /// Start a fresh scan session
    ///
    /// Disconnects connected stands and clears the registry first.
    ///
    /// # Errors
    ///
    /// See [`ScanController::start_scan`].
    pub async fn start_scan(&self) -> Result<()> {
        self.sequencer.forget_connections();
        self.color_inputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.scanner.start_scan().await
    }

    /// Ask the radio to report its adapter state again
    ///
    /// # Errors
    ///
    /// Returns the radio's error if the state cannot be queried.
    pub async fn check_state(&self) -> Result<()> {
        self.radio.check_state().await
    }

    /// Switch a stand on or off
    ///
    /// # Errors
    ///
    /// See [`CommandSequencer::set_power`].
    pub async fn set_power(&self, id: &PeripheralId, on: bool) -> Result<()> {
        self.sequencer.set_power(id, on).await
    }

    /// Flip a stand's power state as read from the stand
    ///
    /// # Errors
    ///
    /// See [`CommandSequencer::toggle_power`].
    pub async fn toggle_power(&self, id: &PeripheralId) -> Result<bool> {
        self.sequencer.toggle_power(id).await
    }

    /// Send a colour to a stand
    ///
    /// # Errors
    ///
    /// See [`CommandSequencer::set_color`].
    pub async fn set_color(&self, id: &PeripheralId, color: &str) -> Result<ColorDispatch> {
        self.sequencer.set_color(id, color).await
    }

    /// Record free-text colour input and send it if it is a valid colour
    ///
    /// The text is kept as the display value either way; see
    /// [`SaberManager::color_input`].
    ///
    /// # Errors
    ///
    /// See [`CommandSequencer::set_color`].
    pub async fn set_color_input(&self, id: &PeripheralId, text: &str) -> Result<ColorDispatch> {
        self.color_inputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), text.to_string());
        self.sequencer.set_color(id, text).await
    }

    /// Text to show in a stand's colour field
    ///
    /// Falls back to the stand's recorded colour when nothing was typed.
    pub async fn color_input(&self, id: &PeripheralId) -> Option<String> {
        let typed = self
            .color_inputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned();
        match typed {
            Some(text) => Some(text),
            None => self.registry.read().await.get(id).map(|p| p.color.clone()),
        }
    }

    /// Open a link to a stand ahead of a burst of commands
    ///
    /// # Errors
    ///
    /// See [`CommandSequencer::connect`].
    pub async fn connect(&self, id: &PeripheralId) -> Result<()> {
        self.sequencer.connect(id).await
    }

    /// Close a link to a stand
    ///
    /// # Errors
    ///
    /// See [`CommandSequencer::disconnect`].
    pub async fn disconnect(&self, id: &PeripheralId) -> Result<()> {
        self.sequencer.disconnect(id).await
    }

    /// Discovered stands in first-seen order
    pub async fn peripherals(&self) -> Vec<Peripheral> {
        self.registry.read().await.snapshot()
    }

    /// Look up one stand
    pub async fn peripheral(&self, id: &PeripheralId) -> Option<Peripheral> {
        self.registry.read().await.get(id).cloned()
    }

    /// Shared registry handle
    #[must_use]
    pub fn registry(&self) -> SharedRegistry {
        Arc::clone(&self.registry)
    }

    /// Whether a scan session is running
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    /// Watch the scanning flag
    #[must_use]
    pub fn watch_scanning(&self) -> watch::Receiver<bool> {
        self.scanner.watch_scanning()
    }

    /// How the last scan session ended
    #[must_use]
    pub fn scan_outcome(&self) -> Option<ScanOutcome> {
        self.scanner.last_outcome()
    }

    /// Current radio status
    #[must_use]
    pub fn radio_status(&self) -> RadioStatus {
        self.monitor.status()
    }

    /// Watch the radio status
    #[must_use]
    pub fn watch_radio_status(&self) -> watch::Receiver<RadioStatus> {
        self.monitor.subscribe()
    }

    /// Phase of the latest command for a stand
    #[must_use]
    pub fn command_phase(&self, id: &PeripheralId) -> CommandPhase {
        self.sequencer.phase(id)
    }
}

/// Running event pump of a [`SaberManager`]
///
/// Dropping the activation stops the pump and releases its radio
/// subscription.
#[derive(Debug)]
pub struct Activation {
    pump: JoinHandle<()>,
}

impl Activation {
    /// Whether the pump is still running
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.pump.is_finished()
    }

    /// Stop the pump
    pub fn deactivate(self) {}
}

impl Drop for Activation {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::SaberError,
        fake::{FakeCall, FakeRadio},
        DEFAULT_PERIPHERAL_NAME,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::task::yield_now;
    use tokio_test::assert_ok;

    fn manager(radio: &Arc<FakeRadio>) -> Arc<SaberManager<FakeRadio>> {
        let config = ManagerConfig {
            platform: Platform::Android,
            ..ManagerConfig::default()
        };
        Arc::new(SaberManager::new(Arc::clone(radio), config))
    }

    async fn settle(mut done: impl FnMut() -> bool) {
        for _ in 0..100 {
            if done() {
                return;
            }
            yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_activation_pumps_radio_events() {
        let radio = Arc::new(FakeRadio::new());
        let manager = manager(&radio);
        let activation = manager.activate();
        assert!(activation.is_active());

        settle(|| manager.radio_status() == RadioStatus::On).await;
        assert_eq!(manager.radio_status(), RadioStatus::On);

        assert_ok!(manager.start_scan().await);
        radio.advertise("a", Some("Saber"), &[0x01, 0xff, 0x00, 0x00]);
        radio.advertise("b", None, &[0x00, 0x00, 0x00, 0xff]);
        radio.advertise("a", Some("Saber"), &[0x00, 0x00, 0xff, 0x00]);

        let mut peripherals = Vec::new();
        for _ in 0..100 {
            peripherals = manager.peripherals().await;
            if peripherals.len() == 2 {
                break;
            }
            yield_now().await;
        }
        assert_eq!(peripherals.len(), 2);
        assert_eq!(peripherals[0].name, "Saber");
        assert_eq!(peripherals[0].color, "#ff0000");
        assert_eq!(peripherals[1].name, DEFAULT_PERIPHERAL_NAME);

        radio.emit(RadioEvent::ScanStopped);
        settle(|| !manager.is_scanning()).await;
        assert!(!manager.is_scanning());
        assert_eq!(manager.scan_outcome(), Some(ScanOutcome::Stopped));
    }

    #[tokio::test]
    async fn test_dropping_activation_releases_subscription() {
        let radio = Arc::new(FakeRadio::new());
        let manager = manager(&radio);

        let activation = manager.activate();
        assert_eq!(radio.subscriber_count(), 1);

        activation.deactivate();
        settle(|| radio.subscriber_count() == 0).await;
        assert_eq!(radio.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_scan_refused_until_radio_on() {
        let radio = Arc::new(FakeRadio::new());
        let manager = manager(&radio);

        assert!(matches!(
            manager.start_scan().await,
            Err(SaberError::AdapterUnavailable {
                status: RadioStatus::Unknown
            })
        ));

        manager
            .handle_event(RadioEvent::StateChanged("STATE_ON".to_string()))
            .await;
        assert_ok!(manager.start_scan().await);
        assert!(manager.is_scanning());
    }

    #[tokio::test]
    async fn test_disconnect_event_invalidates_link() {
        let radio = Arc::new(FakeRadio::new());
        let manager = manager(&radio);
        manager
            .handle_event(RadioEvent::StateChanged("on".to_string()))
            .await;
        assert_ok!(manager.start_scan().await);
        manager
            .handle_event(RadioEvent::Discovered(crate::radio::Discovery {
                id: "a".into(),
                name: Some("Saber".to_string()),
                rssi: Some(-70),
                manufacturer_data: Some(vec![0x01, 0x10, 0x20, 0x30]),
            }))
            .await;

        let id = PeripheralId::from("a");
        assert_ok!(manager.connect(&id).await);
        assert!(manager.peripheral(&id).await.unwrap().connected);

        radio.drop_link("a");
        manager.handle_event(RadioEvent::Disconnected(id.clone())).await;
        assert!(!manager.peripheral(&id).await.unwrap().connected);

        // The next command opens a fresh link
        assert_ok!(manager.set_power(&id, false).await);
        assert_eq!(radio.count(|c| matches!(c, FakeCall::Connect(_))), 2);
        assert_eq!(manager.command_phase(&id), CommandPhase::Idle);
    }

    #[tokio::test]
    async fn test_free_text_color_input() {
        let radio = Arc::new(FakeRadio::new());
        let manager = manager(&radio);
        manager
            .handle_event(RadioEvent::StateChanged("PoweredOn".to_string()))
            .await;
        assert_ok!(manager.start_scan().await);
        manager
            .handle_event(RadioEvent::Discovered(crate::radio::Discovery {
                id: "a".into(),
                name: None,
                rssi: None,
                manufacturer_data: Some(vec![0x00, 0x00, 0x00, 0x00]),
            }))
            .await;
        let id = PeripheralId::from("a");
        assert_eq!(manager.color_input(&id).await.as_deref(), Some("#000000"));

        let dispatch = manager.set_color_input(&id, "#1a2b3").await.unwrap();
        assert_eq!(dispatch, ColorDispatch::Rejected);
        assert_eq!(manager.color_input(&id).await.as_deref(), Some("#1a2b3"));
        assert!(radio.writes().is_empty());

        let dispatch = manager.set_color_input(&id, "#1a2b3c").await.unwrap();
        assert_eq!(dispatch, ColorDispatch::Sent);
        assert_eq!(radio.writes(), vec![vec![0x1a, 0x2b, 0x3c]]);
        let stand = manager.peripheral(&id).await.unwrap();
        assert_eq!(stand.color, "#1a2b3c");
        assert!(stand.power);
    }

    struct CountingPrompter {
        confirms: AtomicUsize,
        opened: AtomicUsize,
    }

    #[async_trait]
    impl Prompter for CountingPrompter {
        async fn confirm(&self, _: &SettingsPrompt) -> bool {
            self.confirms.fetch_add(1, Ordering::SeqCst);
            true
        }

        async fn open_settings(&self, _: RadioStatus) -> Result<()> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_blocking_state_prompts_once() {
        let radio = Arc::new(FakeRadio::new());
        let prompter = Arc::new(CountingPrompter {
            confirms: AtomicUsize::new(0),
            opened: AtomicUsize::new(0),
        });
        let manager = SaberManager::new(Arc::clone(&radio), ManagerConfig::default())
            .with_prompter(Arc::clone(&prompter) as Arc<dyn Prompter>);

        manager
            .handle_event(RadioEvent::StateChanged("poweredOff".to_string()))
            .await;
        manager
            .handle_event(RadioEvent::StateChanged("poweredOff".to_string()))
            .await;
        assert_eq!(manager.radio_status(), RadioStatus::Off);

        settle(|| prompter.opened.load(Ordering::SeqCst) == 1).await;
        assert_eq!(prompter.confirms.load(Ordering::SeqCst), 1);
        assert_eq!(prompter.opened.load(Ordering::SeqCst), 1);

        manager
            .handle_event(RadioEvent::StateChanged("PoweredOn".to_string()))
            .await;
        assert_eq!(manager.radio_status(), RadioStatus::On);
    }

    #[tokio::test]
    async fn test_check_state_reports_adapter_state() {
        let radio = Arc::new(FakeRadio::new());
        radio.set_adapter_state("unauthorized");
        let manager = manager(&radio);
        let _activation = manager.activate();

        settle(|| manager.radio_status() == RadioStatus::Unauthorized).await;
        assert_eq!(manager.radio_status(), RadioStatus::Unauthorized);
        assert_eq!(radio.count(|c| *c == FakeCall::CheckState), 1);
    }
}

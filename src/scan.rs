use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    error::{Result, SaberError},
    protocol::parse_advertisement,
    radio::{Discovery, Radio},
    registry::SharedRegistry,
    types::{Peripheral, PeripheralId, Platform, RadioStatus, ScanOutcome, ScanParams, ScanState},
};

struct ScanSession {
    state: ScanState,
    generation: u64,
    timer: Option<JoinHandle<()>>,
    last_outcome: Option<ScanOutcome>,
    scanning: watch::Sender<bool>,
}

impl ScanSession {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn begin(&mut self) -> u64 {
        self.cancel_timer();
        self.generation += 1;
        self.state = ScanState::Scanning;
        self.last_outcome = None;
        self.scanning.send_replace(true);
        self.generation
    }

    fn finish(&mut self, outcome: ScanOutcome) {
        self.cancel_timer();
        self.state = ScanState::Idle;
        self.last_outcome = Some(outcome);
        self.scanning.send_replace(false);
    }
}

/// Drives scan sessions against the radio
///
/// At most one session runs at a time. Starting a session disconnects
/// connected stands, clears the registry together with its known ids and
/// arms a safety timeout that ends the session even if the radio never
/// reports the end of the scan.
pub struct ScanController<R: Radio + ?Sized> {
    radio: Arc<R>,
    registry: SharedRegistry,
    status: watch::Receiver<RadioStatus>,
    params: ScanParams,
    platform: Platform,
    session: Arc<Mutex<ScanSession>>,
}

impl<R: Radio + ?Sized + 'static> ScanController<R> {
    /// Create an idle scan controller
    #[must_use]
    pub fn new(
        radio: Arc<R>,
        registry: SharedRegistry,
        status: watch::Receiver<RadioStatus>,
        params: ScanParams,
        platform: Platform,
    ) -> Self {
        let (scanning, _) = watch::channel(false);
        Self {
            radio,
            registry,
            status,
            params,
            platform,
            session: Arc::new(Mutex::new(ScanSession {
                state: ScanState::Idle,
                generation: 0,
                timer: None,
                last_outcome: None,
                scanning,
            })),
        }
    }

    fn session(&self) -> MutexGuard<'_, ScanSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a new scan session
    ///
    /// Calling this while a session is running restarts it: the running
    /// scan is stopped and all session state is discarded first.
    ///
    /// # Errors
    ///
    /// Returns [`SaberError::AdapterUnavailable`] unless the radio status is
    /// [`RadioStatus::On`], or the radio's error if the scan cannot start.
    pub async fn start_scan(&self) -> Result<()> {
        let status = *self.status.borrow();
        if !status.is_on() {
            warn!("Refusing to scan while Bluetooth is {}", status);
            return Err(SaberError::AdapterUnavailable { status });
        }

        let restarting = {
            let mut session = self.session();
            session.cancel_timer();
            session.state == ScanState::Scanning
        };
        if restarting {
            info!("Restarting scan session");
            if let Err(e) = self.radio.stop_scan().await {
                warn!("Failed to stop running scan: {}", e);
            }
        }

        self.disconnect_connected().await;
        self.registry.write().await.reset_session();

        let generation = self.session().begin();
        self.arm_timeout(generation);

        info!(
            "Scanning for saber stands ({}s, generation {})",
            self.params.scan_duration_secs, generation
        );
        let started = self
            .radio
            .scan(
                &self.params.service_uuids,
                self.params.scan_duration(),
                self.params.allow_duplicates,
            )
            .await;

        if let Err(e) = started {
            warn!("Failed to start scan: {}", e);
            let mut session = self.session();
            if session.generation == generation {
                session.finish(ScanOutcome::Stopped);
            }
            return Err(e);
        }

        Ok(())
    }

    fn arm_timeout(&self, generation: u64) {
        let session = Arc::clone(&self.session);
        let radio = Arc::clone(&self.radio);
        let timeout = self.params.scan_timeout();

        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            {
                let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);
                if session.generation != generation || session.state != ScanState::Scanning {
                    return;
                }
                // Dropping our own handle first keeps finish() from aborting this task
                session.timer = None;
                session.finish(ScanOutcome::TimedOut);
            }

            warn!("Scan timed out after {}ms", timeout.as_millis());
            if let Err(e) = radio.stop_scan().await {
                debug!("Failed to stop timed out scan: {}", e);
            }
        });

        self.session().timer = Some(timer);
    }

    async fn disconnect_connected(&self) {
        let connected = match self
            .radio
            .connected_peripherals(&self.params.service_uuids)
            .await
        {
            Ok(connected) => connected,
            Err(e) => {
                warn!("Failed to list connected peripherals: {}", e);
                return;
            }
        };

        for id in connected {
            info!("Disconnecting {} before scanning", id);
            if let Err(e) = self.radio.disconnect(&id).await {
                warn!("Failed to disconnect {}: {}", id, e);
            }
        }
    }

    /// Handle the radio's end-of-scan event
    pub fn handle_scan_stopped(&self) {
        let mut session = self.session();
        if session.state == ScanState::Scanning {
            session.finish(ScanOutcome::Stopped);
            info!("Scan stopped");
        } else {
            debug!("Ignoring stop event outside a scan session");
        }
    }

    /// Handle a discovery event
    ///
    /// Known ids are ignored. Adverts without usable manufacturer data are
    /// dropped for this event only, the id stays unknown. Returns the id of
    /// a newly registered peripheral.
    pub async fn handle_discovery(&self, discovery: Discovery) -> Option<PeripheralId> {
        let mut registry = self.registry.write().await;
        if registry.is_known(&discovery.id) {
            debug!("Ignoring duplicate advert from {}", discovery.id);
            return None;
        }

        let state = match parse_advertisement(discovery.manufacturer_data.as_deref(), self.platform) {
            Ok(state) => state,
            Err(e) => {
                debug!("Dropping advert from {}: {}", discovery.id, e);
                return None;
            }
        };

        let peripheral = Peripheral::discovered(
            discovery.id,
            discovery.name.as_deref(),
            discovery.rssi.unwrap_or_default(),
            state,
        );
        info!(
            "Found saber stand {} ({}), power {}, color {}",
            peripheral.name, peripheral.id, peripheral.power, peripheral.color
        );

        let id = peripheral.id.clone();
        registry.mark_known(&id);
        registry.upsert(peripheral);
        Some(id)
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ScanState {
        self.session().state
    }

    /// Whether a session is running
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.state() == ScanState::Scanning
    }

    /// How the last finished session ended
    #[must_use]
    pub fn last_outcome(&self) -> Option<ScanOutcome> {
        self.session().last_outcome
    }

    /// Watch the scanning flag
    #[must_use]
    pub fn watch_scanning(&self) -> watch::Receiver<bool> {
        self.session().scanning.subscribe()
    }

    /// Scan parameters
    #[must_use]
    pub const fn params(&self) -> &ScanParams {
        &self.params
    }
}

impl<R: Radio + ?Sized> Drop for ScanController<R> {
    fn drop(&mut self) {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        session.cancel_timer();
    }
}

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tracing::{debug, info, warn};

use crate::{
    error::{Result, SaberError},
    protocol::{color_payload, normalize_color, parse_power, power_payload, PlatformProfile},
    radio::{CharacteristicTarget, Radio, ServiceMap},
    registry::SharedRegistry,
    types::{CommandPhase, PeripheralId, PeripheralPatch, Platform, TimeoutConfig},
};

/// What happened to a requested colour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorDispatch {
    /// This call transmitted the colour, or a newer one that replaced it
    Sent,
    /// A write was already pending; the in-flight command will send this colour
    Coalesced,
    /// The string is not a `#rrggbb` colour and was not forwarded
    Rejected,
}

#[derive(Default)]
struct Link {
    lock: Arc<tokio::sync::Mutex<()>>,
    phase: CommandPhase,
    services: Option<ServiceMap>,
    pending_color: Option<String>,
    color_writer: Option<u64>,
    next_ticket: u64,
    generation: u64,
}

impl Link {
    fn is_idle(&self) -> bool {
        Arc::strong_count(&self.lock) == 1 && self.color_writer.is_none()
    }
}

type Links = Arc<Mutex<HashMap<PeripheralId, Link>>>;

fn lock_links(links: &Mutex<HashMap<PeripheralId, Link>>) -> MutexGuard<'_, HashMap<PeripheralId, Link>> {
    links.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn guarded<T>(
    operation: &'static str,
    timeout_ms: u64,
    call: impl Future<Output = Result<T>> + Send,
) -> Result<T> {
    match tokio::time::timeout(Duration::from_millis(timeout_ms), call).await {
        Ok(result) => result,
        Err(_) => {
            warn!("{} timed out after {}ms", operation, timeout_ms);
            Err(SaberError::Timeout {
                operation,
                timeout_ms,
            })
        }
    }
}

/// Runs connect, act, disconnect command sequences against saber stands
///
/// Sequences for one peripheral are mutually exclusive and run in the
/// order they were issued; sequences for different peripherals are
/// independent. The peripheral's `updating`, `connecting` and `connected`
/// flags are kept in the registry for the duration and are cleared on
/// every exit path, including when the caller drops the future.
///
/// The service map retrieved on connect is cached per peripheral until the
/// link closes. A disconnect event invalidates it, so a write issued over
/// a dead link reports [`SaberError::LostConnection`].
pub struct CommandSequencer<R: Radio + ?Sized> {
    radio: Arc<R>,
    registry: SharedRegistry,
    profile: &'static PlatformProfile,
    timeouts: TimeoutConfig,
    links: Links,
}

impl<R: Radio + ?Sized + 'static> CommandSequencer<R> {
    /// Create a sequencer for the given platform family
    #[must_use]
    pub fn new(
        radio: Arc<R>,
        registry: SharedRegistry,
        platform: Platform,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            radio,
            registry,
            profile: PlatformProfile::for_platform(platform),
            timeouts,
            links: Arc::default(),
        }
    }

    fn links(&self) -> MutexGuard<'_, HashMap<PeripheralId, Link>> {
        lock_links(&self.links)
    }

    fn lock_for(&self, id: &PeripheralId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(&self.links().entry(id.clone()).or_default().lock)
    }

    fn set_phase(&self, id: &PeripheralId, phase: CommandPhase) {
        debug!("Command phase of {} -> {}", id, phase);
        self.links().entry(id.clone()).or_default().phase = phase;
    }

    async fn patch(&self, id: &PeripheralId, patch: PeripheralPatch) {
        self.registry.write().await.update(id, &patch);
    }

    /// Phase of the latest command for a peripheral
    #[must_use]
    pub fn phase(&self, id: &PeripheralId) -> CommandPhase {
        self.links().get(id).map(|link| link.phase).unwrap_or_default()
    }

    /// Whether a link is open and its services are cached
    #[must_use]
    pub fn is_connected(&self, id: &PeripheralId) -> bool {
        self.links().get(id).is_some_and(|link| link.services.is_some())
    }

    /// Timeouts applied to radio calls
    #[must_use]
    pub const fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }

    /// Open a link and cache its services
    ///
    /// Returns immediately if the link is already open. Waits for any
    /// command in flight for the same peripheral.
    ///
    /// # Errors
    ///
    /// Returns [`SaberError::Timeout`] if the radio does not connect within
    /// the connect timeout, or the radio's error. The `connecting` and
    /// `connected` flags are reset in both cases.
    pub async fn connect(&self, id: &PeripheralId) -> Result<()> {
        let lock = self.lock_for(id);
        let _exclusive = lock.lock().await;
        self.open_link(id).await
    }

    /// Close a link
    ///
    /// # Errors
    ///
    /// Returns the radio's error if the disconnect fails or times out; the
    /// link is considered closed either way.
    pub async fn disconnect(&self, id: &PeripheralId) -> Result<()> {
        let lock = self.lock_for(id);
        let _exclusive = lock.lock().await;
        self.close_link(id).await
    }

    async fn open_link(&self, id: &PeripheralId) -> Result<()> {
        if self.is_connected(id) {
            debug!("Already connected to {}", id);
            return Ok(());
        }

        info!("Connecting to {}", id);
        self.patch(id, PeripheralPatch::default().connecting(true)).await;

        let connected = guarded(
            "connect",
            self.timeouts.connect_timeout_ms,
            self.radio.connect(id),
        )
        .await;
        let services = match connected {
            Ok(()) => {
                let services = guarded(
                    "retrieve services",
                    self.timeouts.operation_timeout_ms,
                    self.radio.retrieve_services(id),
                )
                .await;
                if services.is_err() {
                    if let Err(e) = self.close_link(id).await {
                        debug!("Failed to close half-open link to {}: {}", id, e);
                    }
                }
                services
            }
            Err(e) => Err(e),
        };

        match services {
            Ok(services) => {
                debug!(
                    "Retrieved {} services and {} characteristics from {}",
                    services.services.len(),
                    services.characteristics.len(),
                    id
                );
                {
                    let mut links = self.links();
                    let link = links.entry(id.clone()).or_default();
                    link.services = Some(services);
                    link.generation += 1;
                }
                self.patch(
                    id,
                    PeripheralPatch::default().connecting(false).connected(true),
                )
                .await;
                info!("Connected to {}", id);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to connect to {}: {}", id, e);
                self.patch(
                    id,
                    PeripheralPatch::default().connecting(false).connected(false),
                )
                .await;
                Err(e)
            }
        }
    }

    async fn close_link(&self, id: &PeripheralId) -> Result<()> {
        if let Some(link) = self.links().get_mut(id) {
            link.services = None;
        }

        debug!("Disconnecting from {}", id);
        let result = guarded(
            "disconnect",
            self.timeouts.operation_timeout_ms,
            self.radio.disconnect(id),
        )
        .await;
        self.patch(
            id,
            PeripheralPatch::default().connecting(false).connected(false),
        )
        .await;
        result
    }

    fn target(
        &self,
        id: &PeripheralId,
        pick: fn(&PlatformProfile, &ServiceMap) -> Result<CharacteristicTarget>,
    ) -> Result<CharacteristicTarget> {
        let links = self.links();
        let services = links
            .get(id)
            .and_then(|link| link.services.as_ref())
            .ok_or(SaberError::LostConnection)?;
        pick(self.profile, services)
    }

    async fn write(&self, id: &PeripheralId, target: &CharacteristicTarget, data: &[u8]) -> Result<()> {
        guarded(
            "write",
            self.timeouts.operation_timeout_ms,
            self.radio.write(id, target, data),
        )
        .await
        .map_err(|e| match e {
            SaberError::WriteRejected(_) | SaberError::Timeout { .. } => e,
            e if e.is_connection_error() => e,
            other => SaberError::WriteRejected(other.to_string()),
        })
    }

    async fn read(&self, id: &PeripheralId, target: &CharacteristicTarget) -> Result<Vec<u8>> {
        guarded(
            "read",
            self.timeouts.operation_timeout_ms,
            self.radio.read(id, target),
        )
        .await
    }

    async fn run_sequence<T, F, Fut>(&self, id: &PeripheralId, act: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lock = self.lock_for(id);
        let _exclusive = lock.lock().await;
        let guard = SequenceGuard {
            radio: Arc::clone(&self.radio),
            registry: Arc::clone(&self.registry),
            links: Arc::clone(&self.links),
            id: id.clone(),
            armed: true,
        };

        self.patch(id, PeripheralPatch::default().updating(true)).await;
        self.set_phase(id, CommandPhase::Connecting);

        let result = match self.open_link(id).await {
            Ok(()) => {
                self.set_phase(id, CommandPhase::Acting);
                act().await
            }
            Err(e) => Err(e),
        };

        self.set_phase(id, CommandPhase::Disconnecting);
        if let Err(e) = self.close_link(id).await {
            warn!("Failed to disconnect from {}: {}", id, e);
        }
        self.patch(id, PeripheralPatch::default().updating(false)).await;
        guard.disarm();

        match &result {
            Ok(_) => self.set_phase(id, CommandPhase::Idle),
            Err(e) => {
                warn!("Command for {} failed: {}", id, e);
                self.set_phase(id, CommandPhase::Failed);
            }
        }
        result
    }

    /// Switch a stand on or off
    ///
    /// The registry's `power` field changes only after the write succeeded.
    /// Failed commands are not retried.
    ///
    /// # Errors
    ///
    /// Returns the connect, write or timeout error that aborted the sequence,
    /// or [`SaberError::LostConnection`] if the link dropped before the write.
    pub async fn set_power(&self, id: &PeripheralId, on: bool) -> Result<()> {
        info!("Setting power of {} to {}", id, if on { "on" } else { "off" });
        self.run_sequence(id, || async move {
            let target = self.target(id, PlatformProfile::power_target)?;
            self.write(id, &target, &power_payload(on)).await?;
            self.patch(id, PeripheralPatch::default().power(on)).await;
            Ok(())
        })
        .await
    }

    /// Read the power characteristic and write its inverse
    ///
    /// Returns the new power state.
    ///
    /// # Errors
    ///
    /// As [`CommandSequencer::set_power`], plus [`SaberError::ReadFailed`]
    /// if the current value cannot be read.
    pub async fn toggle_power(&self, id: &PeripheralId) -> Result<bool> {
        info!("Toggling power of {}", id);
        self.run_sequence(id, || async move {
            let target = self.target(id, PlatformProfile::power_target)?;
            let current = parse_power(&self.read(id, &target).await?)?;
            let next = !current;
            self.write(id, &target, &power_payload(next)).await?;
            self.patch(id, PeripheralPatch::default().power(next)).await;
            Ok(next)
        })
        .await
    }

    /// Read the power characteristic into the registry
    ///
    /// # Errors
    ///
    /// Returns the connect, read or timeout error that aborted the sequence.
    pub async fn read_power(&self, id: &PeripheralId) -> Result<bool> {
        self.run_sequence(id, || async move {
            let target = self.target(id, PlatformProfile::power_target)?;
            let power = parse_power(&self.read(id, &target).await?)?;
            self.patch(id, PeripheralPatch::default().power(power)).await;
            Ok(power)
        })
        .await
    }

    /// Send a colour to a stand
    ///
    /// Invalid strings are never transmitted. While a colour command for
    /// the peripheral is pending, further colours only replace the pending
    /// value: the pending command sends the latest one once its current
    /// write completes. A successful write records the colour and marks the
    /// stand as powered on.
    ///
    /// # Errors
    ///
    /// Returns the connect, write or timeout error that aborted the
    /// sequence, or [`SaberError::LostConnection`] if the link dropped
    /// between writes. Colours coalesced into a failed command are dropped.
    pub async fn set_color(&self, id: &PeripheralId, color: &str) -> Result<ColorDispatch> {
        let Ok(color) = normalize_color(color) else {
            debug!("Not sending invalid color {:?} to {}", color, id);
            return Ok(ColorDispatch::Rejected);
        };

        let ticket = {
            let mut links = self.links();
            let link = links.entry(id.clone()).or_default();
            link.pending_color = Some(color);
            if link.color_writer.is_some() {
                debug!("Coalescing color for {} into pending write", id);
                return Ok(ColorDispatch::Coalesced);
            }
            let ticket = link.next_ticket;
            link.next_ticket += 1;
            link.color_writer = Some(ticket);
            ticket
        };
        let _writer = ColorWriter {
            links: &self.links,
            id,
            ticket,
        };

        self.run_sequence(id, || self.drain_colors(id)).await?;
        Ok(ColorDispatch::Sent)
    }

    fn next_color(&self, id: &PeripheralId) -> Option<String> {
        let mut links = self.links();
        let link = links.get_mut(id)?;
        let next = link.pending_color.take();
        if next.is_none() {
            link.color_writer = None;
        }
        next
    }

    async fn drain_colors(&self, id: &PeripheralId) -> Result<()> {
        while let Some(color) = self.next_color(id) {
            let target = self.target(id, PlatformProfile::color_target)?;
            info!("Writing color {} to {}", color, id);
            self.write(id, &target, &color_payload(&color)?).await?;
            self.patch(id, PeripheralPatch::default().color(color).power(true))
                .await;
        }
        Ok(())
    }

    /// Record that the radio dropped a link
    ///
    /// The event may be the late echo of a link this sequencer closed
    /// itself. It is ignored if the radio still lists the peripheral as
    /// connected, or if a new link was opened while that was checked.
    pub async fn handle_disconnect(&self, id: &PeripheralId) {
        let generation = self.links().get(id).map(|link| link.generation);
        let still_connected = guarded(
            "list connected peripherals",
            self.timeouts.operation_timeout_ms,
            self.radio.connected_peripherals(&[]),
        )
        .await
        .is_ok_and(|connected| connected.contains(id));
        if still_connected {
            debug!("Ignoring stale disconnect of {}", id);
            return;
        }

        let had_link = {
            let mut links = self.links();
            match links.get_mut(id) {
                Some(link) if Some(link.generation) != generation => {
                    debug!("Ignoring disconnect of {} from before the current link", id);
                    return;
                }
                Some(link) => link.services.take().is_some(),
                None => false,
            }
        };
        if had_link {
            warn!("Lost connection to {}", id);
        } else {
            debug!("Disconnected from {}", id);
        }
        self.patch(
            id,
            PeripheralPatch::default().connecting(false).connected(false),
        )
        .await;
    }

    /// Drop every cached service map and the state of idle peripherals
    pub fn forget_connections(&self) {
        let mut links = self.links();
        links.retain(|_, link| !link.is_idle());
        for link in links.values_mut() {
            link.services = None;
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.links().len()
    }
}

struct SequenceGuard<R: Radio + ?Sized + 'static> {
    radio: Arc<R>,
    registry: SharedRegistry,
    links: Links,
    id: PeripheralId,
    armed: bool,
}

impl<R: Radio + ?Sized + 'static> SequenceGuard<R> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<R: Radio + ?Sized + 'static> Drop for SequenceGuard<R> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        warn!("Command for {} abandoned, cleaning up", self.id);
        {
            let mut links = lock_links(&self.links);
            let link = links.entry(self.id.clone()).or_default();
            link.phase = CommandPhase::Failed;
            link.services = None;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let radio = Arc::clone(&self.radio);
        let registry = Arc::clone(&self.registry);
        let id = self.id.clone();
        runtime.spawn(async move {
            registry.write().await.update(
                &id,
                &PeripheralPatch::default()
                    .updating(false)
                    .connecting(false)
                    .connected(false),
            );
            if let Err(e) = radio.disconnect(&id).await {
                debug!("Failed to disconnect abandoned link to {}: {}", id, e);
            }
        });
    }
}

struct ColorWriter<'a> {
    links: &'a Mutex<HashMap<PeripheralId, Link>>,
    id: &'a PeripheralId,
    ticket: u64,
}

impl Drop for ColorWriter<'_> {
    fn drop(&mut self) {
        let mut links = lock_links(self.links);
        if let Some(link) = links.get_mut(self.id) {
            // Still registered means the drain never finished
            if link.color_writer == Some(self.ticket) {
                link.color_writer = None;
                link.pending_color = None;
            }
        }
    }
}

use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        Service, WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use futures::stream::{Stream, StreamExt};
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    error::{Result, SaberError},
    protocol::{frame_manufacturer_data, PlatformProfile},
    radio::{
        CharacteristicRef, CharacteristicTarget, Discovery, EventBus, EventKind, Radio,
        RadioEvent, ServiceMap, Subscription,
    },
    types::{PeripheralId, Platform},
    SABER_SERVICE_UUID,
};

const GENERIC_ACCESS: Uuid = Uuid::from_u128(0x0000_1800_0000_1000_8000_0080_5f9b_34fb);
const GENERIC_ATTRIBUTE: Uuid = Uuid::from_u128(0x0000_1801_0000_1000_8000_0080_5f9b_34fb);

/// Generic characteristics Android lists ahead of the stand's own
const GENERIC_CHARACTERISTICS: [(Uuid, Uuid); 4] = [
    (GENERIC_ACCESS, Uuid::from_u128(0x0000_2a00_0000_1000_8000_0080_5f9b_34fb)),
    (GENERIC_ACCESS, Uuid::from_u128(0x0000_2a01_0000_1000_8000_0080_5f9b_34fb)),
    (GENERIC_ACCESS, Uuid::from_u128(0x0000_2a04_0000_1000_8000_0080_5f9b_34fb)),
    (GENERIC_ATTRIBUTE, Uuid::from_u128(0x0000_2a05_0000_1000_8000_0080_5f9b_34fb)),
];

type CentralEvents = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

#[derive(Default)]
struct ScanFlags {
    scanning: AtomicBool,
    allow_duplicates: AtomicBool,
}

/// [`Radio`] backed by the host Bluetooth stack through `btleplug`
///
/// Uses the first adapter reported by the system. Adapter events are
/// pumped into an [`EventBus`] by a background task that lives as long as
/// the radio.
///
/// `btleplug` reports services and characteristics ordered by UUID and
/// BlueZ hides the generic services altogether, so
/// [`Radio::retrieve_services`] rebuilds the service map in the layout of
/// the configured platform around the stand service.
pub struct BtleplugRadio {
    adapter: Adapter,
    profile: &'static PlatformProfile,
    bus: EventBus,
    peripherals: Arc<Mutex<HashMap<PeripheralId, Peripheral>>>,
    flags: Arc<ScanFlags>,
    seen: Arc<Mutex<HashSet<PeripheralId>>>,
    stopper: Mutex<Option<JoinHandle<()>>>,
    pump: JoinHandle<()>,
}

impl BtleplugRadio {
    /// Open the first Bluetooth adapter
    ///
    /// Manufacturer data is framed for `platform` before it is published,
    /// see [`frame_manufacturer_data`].
    ///
    /// # Errors
    ///
    /// Returns [`SaberError::Ble`] if the Bluetooth stack cannot be
    /// initialized, or [`SaberError::AdapterNotFound`] if the host has no
    /// adapter.
    pub async fn new(platform: Platform) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(SaberError::AdapterNotFound)?;

        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter {}", info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }

        let events = adapter.events().await?;
        let bus = EventBus::new();
        let peripherals = Arc::new(Mutex::new(HashMap::new()));
        let flags = Arc::new(ScanFlags::default());
        let seen = Arc::new(Mutex::new(HashSet::new()));

        let pump = tokio::spawn(pump_events(
            events,
            EventPump {
                adapter: adapter.clone(),
                bus: bus.clone(),
                peripherals: Arc::clone(&peripherals),
                flags: Arc::clone(&flags),
                seen: Arc::clone(&seen),
                platform,
            },
        ));

        Ok(Self {
            adapter,
            profile: PlatformProfile::for_platform(platform),
            bus,
            peripherals,
            flags,
            seen,
            stopper: Mutex::new(None),
            pump,
        })
    }

    async fn peripheral(&self, id: &PeripheralId) -> Result<Peripheral> {
        if let Some(peripheral) = self.peripherals.lock().await.get(id) {
            return Ok(peripheral.clone());
        }

        let peripheral = self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == id.as_str())
            .ok_or_else(|| SaberError::PeripheralNotFound(id.clone()))?;
        self.peripherals
            .lock()
            .await
            .insert(id.clone(), peripheral.clone());
        Ok(peripheral)
    }

    async fn characteristic(
        &self,
        id: &PeripheralId,
        target: &CharacteristicTarget,
    ) -> Result<(Peripheral, Characteristic)> {
        let peripheral = self.peripheral(id).await?;
        let characteristics = peripheral.characteristics();
        let characteristic = characteristics
            .iter()
            .find(|c| c.uuid == target.characteristic && c.service_uuid == target.service)
            .cloned()
            .ok_or(SaberError::LostConnection)?;
        Ok((peripheral, characteristic))
    }

    async fn cancel_stopper(&self) {
        if let Some(stopper) = self.stopper.lock().await.take() {
            stopper.abort();
        }
    }
}

#[async_trait]
impl Radio for BtleplugRadio {
    async fn scan(
        &self,
        services: &[Uuid],
        duration: Duration,
        allow_duplicates: bool,
    ) -> Result<()> {
        self.cancel_stopper().await;
        self.seen.lock().await.clear();
        self.flags
            .allow_duplicates
            .store(allow_duplicates, Ordering::SeqCst);
        self.flags.scanning.store(true, Ordering::SeqCst);

        let filter = ScanFilter {
            services: services.to_vec(),
        };
        if let Err(e) = self.adapter.start_scan(filter).await {
            self.flags.scanning.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        debug!("Scan started for {:?}", duration);

        let adapter = self.adapter.clone();
        let bus = self.bus.clone();
        let flags = Arc::clone(&self.flags);
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Err(e) = adapter.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
            flags.scanning.store(false, Ordering::SeqCst);
            bus.publish(&RadioEvent::ScanStopped);
        });
        *self.stopper.lock().await = Some(stopper);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.cancel_stopper().await;
        self.flags.scanning.store(false, Ordering::SeqCst);
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, id: &PeripheralId) -> Result<()> {
        let peripheral = self.peripheral(id).await?;
        peripheral
            .connect()
            .await
            .map_err(|e| SaberError::ConnectionFailed(e.to_string()))
    }

    async fn disconnect(&self, id: &PeripheralId) -> Result<()> {
        let peripheral = self.peripheral(id).await?;
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn retrieve_services(&self, id: &PeripheralId) -> Result<ServiceMap> {
        let peripheral = self.peripheral(id).await?;
        peripheral.discover_services().await?;
        service_map(&peripheral.services(), self.profile)
    }

    async fn read(&self, id: &PeripheralId, target: &CharacteristicTarget) -> Result<Vec<u8>> {
        let (peripheral, characteristic) = self.characteristic(id, target).await?;
        let value = peripheral
            .read(&characteristic)
            .await
            .map_err(|e| SaberError::ReadFailed(e.to_string()))?;
        trace!("Read {:02X?} from {}", value, characteristic.uuid);
        Ok(value)
    }

    async fn write(
        &self,
        id: &PeripheralId,
        target: &CharacteristicTarget,
        data: &[u8],
    ) -> Result<()> {
        let (peripheral, characteristic) = self.characteristic(id, target).await?;
        debug!("Writing {:02X?} to {}", data, characteristic.uuid);
        peripheral
            .write(&characteristic, data, WriteType::WithResponse)
            .await
            .map_err(|e| SaberError::WriteRejected(e.to_string()))
    }

    async fn connected_peripherals(&self, services: &[Uuid]) -> Result<Vec<PeripheralId>> {
        let mut connected = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            if !peripheral.is_connected().await.unwrap_or(false) {
                continue;
            }
            let advertised = peripheral
                .properties()
                .await
                .ok()
                .flatten()
                .map(|properties| properties.services)
                .unwrap_or_default();
            if services.is_empty() || advertised.iter().any(|uuid| services.contains(uuid)) {
                let id = PeripheralId::new(peripheral.id().to_string());
                self.peripherals
                    .lock()
                    .await
                    .insert(id.clone(), peripheral);
                connected.push(id);
            }
        }
        Ok(connected)
    }

    async fn check_state(&self) -> Result<()> {
        let state = self.adapter.adapter_state().await?;
        self.bus
            .publish(&RadioEvent::StateChanged(format!("{state:?}")));
        Ok(())
    }

    fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        self.bus.subscribe(kinds)
    }
}

impl Drop for BtleplugRadio {
    fn drop(&mut self) {
        self.pump.abort();
        if let Ok(mut stopper) = self.stopper.try_lock() {
            if let Some(stopper) = stopper.take() {
                stopper.abort();
            }
        }
    }
}

struct EventPump {
    adapter: Adapter,
    bus: EventBus,
    peripherals: Arc<Mutex<HashMap<PeripheralId, Peripheral>>>,
    flags: Arc<ScanFlags>,
    seen: Arc<Mutex<HashSet<PeripheralId>>>,
    platform: Platform,
}

impl EventPump {
    async fn discovered(&self, id: &btleplug::platform::PeripheralId, update: bool) {
        if !self.flags.scanning.load(Ordering::SeqCst) {
            return;
        }

        let peripheral = match self.adapter.peripheral(id).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                debug!("Discovered peripheral vanished: {}", e);
                return;
            }
        };
        let properties = match peripheral.properties().await {
            Ok(Some(properties)) => properties,
            Ok(None) => return,
            Err(e) => {
                debug!("No properties for {}: {}", peripheral.id(), e);
                return;
            }
        };

        let key = PeripheralId::new(peripheral.id().to_string());
        let manufacturer_data = manufacturer_payload(&properties.manufacturer_data, self.platform);
        if manufacturer_data.is_some() {
            let first = self.seen.lock().await.insert(key.clone());
            if !first && update && !self.flags.allow_duplicates.load(Ordering::SeqCst) {
                trace!("Suppressing repeated advert from {}", key);
                return;
            }
        }

        self.peripherals
            .lock()
            .await
            .insert(key.clone(), peripheral);
        self.bus.publish(&RadioEvent::Discovered(Discovery {
            id: key,
            name: properties.local_name,
            rssi: properties.rssi,
            manufacturer_data,
        }));
    }
}

async fn pump_events(mut events: CentralEvents, pump: EventPump) {
    while let Some(event) = events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) => pump.discovered(&id, false).await,
            CentralEvent::DeviceUpdated(id) => pump.discovered(&id, true).await,
            CentralEvent::DeviceDisconnected(id) => {
                debug!("Peripheral {} disconnected", id);
                pump.bus
                    .publish(&RadioEvent::Disconnected(PeripheralId::new(id.to_string())));
            }
            CentralEvent::StateUpdate(state) => {
                pump.bus
                    .publish(&RadioEvent::StateChanged(format!("{state:?}")));
            }
            _ => {}
        }
    }
    warn!("Adapter event stream ended");
}

/// Pick the manufacturer data entry with the lowest company id and frame it
fn manufacturer_payload(entries: &HashMap<u16, Vec<u8>>, platform: Platform) -> Option<Vec<u8>> {
    entries
        .iter()
        .min_by_key(|(company_id, _)| **company_id)
        .map(|(company_id, payload)| frame_manufacturer_data(platform, *company_id, payload))
}

fn characteristic_refs(service: &Service) -> impl Iterator<Item = CharacteristicRef> + '_ {
    service.characteristics.iter().map(|c| CharacteristicRef {
        service: c.service_uuid,
        characteristic: c.uuid,
    })
}

/// Lay out discovered services the way `profile` indexes them
///
/// The stand service lands at the profile's service index and its
/// characteristics, colour before power in UUID order, at the profile's
/// characteristic indices. Other services fill the slots ahead of it;
/// generic services the host stack did not report pad any gap, and the
/// rest follow the stand service.
fn service_map(services: &BTreeSet<Service>, profile: &PlatformProfile) -> Result<ServiceMap> {
    let stand = services
        .iter()
        .find(|s| s.uuid == SABER_SERVICE_UUID)
        .ok_or(SaberError::ServiceNotFound(SABER_SERVICE_UUID))?;
    let others = services.iter().filter(|s| s.uuid != SABER_SERVICE_UUID);

    let mut leading: Vec<Uuid> = others.clone().map(|s| s.uuid).collect();
    for generic in [GENERIC_ACCESS, GENERIC_ATTRIBUTE] {
        if leading.len() < profile.service_index && !leading.contains(&generic) {
            leading.push(generic);
        }
    }
    let mut leading_characteristics: Vec<CharacteristicRef> =
        others.flat_map(characteristic_refs).collect();
    let first = profile
        .color_characteristic_index
        .min(profile.power_characteristic_index);
    for (service, characteristic) in GENERIC_CHARACTERISTICS {
        if leading_characteristics.len() < first
            && !leading_characteristics
                .iter()
                .any(|c| c.characteristic == characteristic)
        {
            leading_characteristics.push(CharacteristicRef {
                service,
                characteristic,
            });
        }
    }

    let mut map = ServiceMap::default();
    let (ahead, behind) = leading.split_at(profile.service_index.min(leading.len()));
    map.services.extend_from_slice(ahead);
    map.services.push(stand.uuid);
    map.services.extend_from_slice(behind);

    let (ahead, behind) =
        leading_characteristics.split_at(first.min(leading_characteristics.len()));
    map.characteristics.extend_from_slice(ahead);
    map.characteristics.extend(characteristic_refs(stand));
    map.characteristics.extend_from_slice(behind);
    Ok(map)
}

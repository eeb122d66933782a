//! Scripted in-memory radio used by the unit tests.

use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::{
    error::{Result, SaberError},
    radio::{
        CharacteristicRef, CharacteristicTarget, Discovery, EventBus, EventKind, Radio,
        RadioEvent, ServiceMap, Subscription,
    },
    types::PeripheralId,
};

pub(crate) const STAND_SERVICE: Uuid = Uuid::from_u128(0x4a);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FakeCall {
    Scan,
    StopScan,
    Connect(PeripheralId),
    Disconnect(PeripheralId),
    RetrieveServices(PeripheralId),
    Read(PeripheralId, Uuid),
    Write(PeripheralId, Uuid, Vec<u8>),
    ConnectedPeripherals,
    CheckState,
}

pub(crate) struct Gate {
    held: AtomicBool,
    permits: Semaphore,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            held: AtomicBool::new(false),
            permits: Semaphore::new(0),
        }
    }
}

impl Gate {
    pub(crate) fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub(crate) fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.permits.add_permits(1024);
    }

    async fn pass(&self) {
        if self.held.load(Ordering::SeqCst) {
            let _permit = self.permits.acquire().await;
        }
    }
}

#[derive(Default)]
struct Script {
    calls: Vec<FakeCall>,
    connected: HashSet<PeripheralId>,
    reads: HashMap<Uuid, Vec<u8>>,
    fail_connect: bool,
    hang_connect: bool,
    fail_services: bool,
    fail_write: bool,
    lose_link_on_write: bool,
    hang_write: bool,
    adapter_state: String,
}

pub(crate) struct FakeRadio {
    bus: EventBus,
    script: Mutex<Script>,
    services: ServiceMap,
    pub(crate) connect_gate: Gate,
    pub(crate) write_gate: Gate,
}

impl FakeRadio {
    pub(crate) fn new() -> Self {
        let services = vec![Uuid::from_u128(0x1800), Uuid::from_u128(0x1801), STAND_SERVICE];
        let characteristics = (0u128..6)
            .map(|i| CharacteristicRef {
                service: services[usize::try_from(i / 2).unwrap_or_default()],
                characteristic: characteristic(i),
            })
            .collect();

        Self {
            bus: EventBus::new(),
            script: Mutex::new(Script {
                adapter_state: "PoweredOn".to_string(),
                ..Script::default()
            }),
            services: ServiceMap {
                services,
                characteristics,
            },
            connect_gate: Gate::default(),
            write_gate: Gate::default(),
        }
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn emit(&self, event: RadioEvent) {
        self.bus.publish(&event);
    }

    pub(crate) fn advertise(&self, id: &str, name: Option<&str>, data: &[u8]) {
        self.emit(RadioEvent::Discovered(Discovery {
            id: id.into(),
            name: name.map(str::to_string),
            rssi: Some(-55),
            manufacturer_data: Some(data.to_vec()),
        }));
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.bus.subscriber_count()
    }

    pub(crate) fn calls(&self) -> Vec<FakeCall> {
        self.script().calls.clone()
    }

    pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
        self.script()
            .calls
            .iter()
            .filter_map(|call| match call {
                FakeCall::Write(_, _, data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn count(&self, matches: impl Fn(&FakeCall) -> bool) -> usize {
        self.script().calls.iter().filter(|call| matches(call)).count()
    }

    pub(crate) fn set_connected(&self, id: &str) {
        self.script().connected.insert(id.into());
    }

    pub(crate) fn drop_link(&self, id: &str) {
        self.script().connected.remove(&PeripheralId::from(id));
    }

    pub(crate) fn set_read(&self, characteristic: Uuid, value: &[u8]) {
        self.script().reads.insert(characteristic, value.to_vec());
    }

    pub(crate) fn fail_connect(&self, fail: bool) {
        self.script().fail_connect = fail;
    }

    pub(crate) fn hang_connect(&self, hang: bool) {
        self.script().hang_connect = hang;
    }

    pub(crate) fn fail_services(&self, fail: bool) {
        self.script().fail_services = fail;
    }

    pub(crate) fn fail_write(&self, fail: bool) {
        self.script().fail_write = fail;
    }

    pub(crate) fn lose_link_on_write(&self, lose: bool) {
        self.script().lose_link_on_write = lose;
    }

    pub(crate) fn hang_write(&self, hang: bool) {
        self.script().hang_write = hang;
    }

    pub(crate) fn set_adapter_state(&self, state: &str) {
        self.script().adapter_state = state.to_string();
    }
}

pub(crate) fn characteristic(index: u128) -> Uuid {
    Uuid::from_u128(0x100 + index)
}

#[async_trait]
impl Radio for FakeRadio {
    async fn scan(&self, _: &[Uuid], _: Duration, _: bool) -> Result<()> {
        self.script().calls.push(FakeCall::Scan);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.script().calls.push(FakeCall::StopScan);
        Ok(())
    }

    async fn connect(&self, id: &PeripheralId) -> Result<()> {
        let (fail, hang) = {
            let mut script = self.script();
            script.calls.push(FakeCall::Connect(id.clone()));
            (script.fail_connect, script.hang_connect)
        };
        self.connect_gate.pass().await;
        if hang {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(SaberError::ConnectionFailed("scripted failure".to_string()));
        }
        self.script().connected.insert(id.clone());
        Ok(())
    }

    async fn disconnect(&self, id: &PeripheralId) -> Result<()> {
        let mut script = self.script();
        script.calls.push(FakeCall::Disconnect(id.clone()));
        script.connected.remove(id);
        Ok(())
    }

    async fn retrieve_services(&self, id: &PeripheralId) -> Result<ServiceMap> {
        let mut script = self.script();
        script.calls.push(FakeCall::RetrieveServices(id.clone()));
        if script.fail_services {
            return Err(SaberError::ServiceNotFound(STAND_SERVICE));
        }
        Ok(self.services.clone())
    }

    async fn read(&self, id: &PeripheralId, target: &CharacteristicTarget) -> Result<Vec<u8>> {
        let mut script = self.script();
        script
            .calls
            .push(FakeCall::Read(id.clone(), target.characteristic));
        script
            .reads
            .get(&target.characteristic)
            .cloned()
            .ok_or_else(|| SaberError::ReadFailed("nothing scripted".to_string()))
    }

    async fn write(&self, id: &PeripheralId, target: &CharacteristicTarget, data: &[u8]) -> Result<()> {
        self.write_gate.pass().await;
        let (fail, lost, hang) = {
            let mut script = self.script();
            script
                .calls
                .push(FakeCall::Write(id.clone(), target.characteristic, data.to_vec()));
            (script.fail_write, script.lose_link_on_write, script.hang_write)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if lost {
            return Err(SaberError::LostConnection);
        }
        if fail {
            return Err(SaberError::WriteRejected("scripted failure".to_string()));
        }
        Ok(())
    }

    async fn connected_peripherals(&self, _: &[Uuid]) -> Result<Vec<PeripheralId>> {
        let mut script = self.script();
        script.calls.push(FakeCall::ConnectedPeripherals);
        let mut connected: Vec<_> = script.connected.iter().cloned().collect();
        connected.sort();
        Ok(connected)
    }

    async fn check_state(&self) -> Result<()> {
        let state = {
            let mut script = self.script();
            script.calls.push(FakeCall::CheckState);
            script.adapter_state.clone()
        };
        self.emit(RadioEvent::StateChanged(state));
        Ok(())
    }

    fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        self.bus.subscribe(kinds)
    }
}

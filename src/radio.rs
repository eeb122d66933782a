//! Capability boundary between the saber logic and a host radio stack.
//!
//! Everything above this module talks to the radio through [`Radio`], so
//! the scan and command logic can run against `btleplug` in production and
//! against a scripted radio in tests.

use async_trait::async_trait;
use std::{
    sync::{Arc, Mutex, PoisonError, Weak},
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::{
    error::{Result, SaberError},
    types::PeripheralId,
};

/// Advertisement payload delivered with a discovery event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    /// Peripheral identifier
    pub id: PeripheralId,
    /// Advertised local name
    pub name: Option<String>,
    /// Signal strength
    pub rssi: Option<i16>,
    /// Manufacturer data as framed by the platform
    pub manufacturer_data: Option<Vec<u8>>,
}

/// Events emitted by the radio stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// A peripheral advertised
    Discovered(Discovery),
    /// The radio stack ended the scan
    ScanStopped,
    /// A peripheral link dropped
    Disconnected(PeripheralId),
    /// The adapter reported a new state, in the stack's own vocabulary
    StateChanged(String),
}

impl RadioEvent {
    /// Kind of this event, used for subscription filtering
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Discovered(_) => EventKind::Discovered,
            Self::ScanStopped => EventKind::ScanStopped,
            Self::Disconnected(_) => EventKind::Disconnected,
            Self::StateChanged(_) => EventKind::StateChanged,
        }
    }
}

/// Event kinds a subscriber can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`RadioEvent::Discovered`]
    Discovered,
    /// [`RadioEvent::ScanStopped`]
    ScanStopped,
    /// [`RadioEvent::Disconnected`]
    Disconnected,
    /// [`RadioEvent::StateChanged`]
    StateChanged,
}

impl EventKind {
    /// Every event kind
    pub const ALL: [Self; 4] = [
        Self::Discovered,
        Self::ScanStopped,
        Self::Disconnected,
        Self::StateChanged,
    ];
}

/// One characteristic in a retrieved service map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicRef {
    /// Owning service
    pub service: Uuid,
    /// Characteristic UUID
    pub characteristic: Uuid,
}

/// Address of a characteristic to read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicTarget {
    /// Service UUID
    pub service: Uuid,
    /// Characteristic UUID
    pub characteristic: Uuid,
}

/// Services and characteristics of a connected peripheral, in stack order
///
/// Characteristics are flattened across all services.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceMap {
    /// Service UUIDs
    pub services: Vec<Uuid>,
    /// Characteristics of all services
    pub characteristics: Vec<CharacteristicRef>,
}

impl ServiceMap {
    /// Resolve a service/characteristic index pair
    ///
    /// # Errors
    ///
    /// Returns [`SaberError::MissingCharacteristic`] if either index is out of range.
    pub fn target(
        &self,
        service_index: usize,
        characteristic_index: usize,
    ) -> Result<CharacteristicTarget> {
        let missing = || SaberError::MissingCharacteristic {
            service_index,
            characteristic_index,
        };
        let service = *self.services.get(service_index).ok_or_else(missing)?;
        let characteristic = self
            .characteristics
            .get(characteristic_index)
            .ok_or_else(missing)?
            .characteristic;

        Ok(CharacteristicTarget {
            service,
            characteristic,
        })
    }
}

/// Host radio stack capability
///
/// All calls may suspend for an unbounded time; callers guard them with
/// timeouts.
#[async_trait]
pub trait Radio: Send + Sync {
    /// Start scanning for peripherals advertising one of `services`
    ///
    /// The stack emits [`RadioEvent::ScanStopped`] once `duration` elapsed.
    async fn scan(&self, services: &[Uuid], duration: Duration, allow_duplicates: bool)
        -> Result<()>;

    /// Stop a running scan
    async fn stop_scan(&self) -> Result<()>;

    /// Open a link to a peripheral
    async fn connect(&self, id: &PeripheralId) -> Result<()>;

    /// Close a link to a peripheral
    async fn disconnect(&self, id: &PeripheralId) -> Result<()>;

    /// Discover services and characteristics of a connected peripheral
    async fn retrieve_services(&self, id: &PeripheralId) -> Result<ServiceMap>;

    /// Read a characteristic value
    async fn read(&self, id: &PeripheralId, target: &CharacteristicTarget) -> Result<Vec<u8>>;

    /// Write a characteristic value
    async fn write(&self, id: &PeripheralId, target: &CharacteristicTarget, data: &[u8])
        -> Result<()>;

    /// Peripherals with an open link that advertise one of `services`
    async fn connected_peripherals(&self, services: &[Uuid]) -> Result<Vec<PeripheralId>>;

    /// Ask the stack to emit a [`RadioEvent::StateChanged`] with the current adapter state
    async fn check_state(&self) -> Result<()>;

    /// Subscribe to events of the given kinds
    fn subscribe(&self, kinds: &[EventKind]) -> Subscription;
}

struct Subscriber {
    id: u64,
    kinds: Vec<EventKind>,
    sender: mpsc::UnboundedSender<RadioEvent>,
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

/// Fan-out of radio events to subscriptions
///
/// Radio implementations own one bus and publish every event into it.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    /// Create an empty bus
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for the given kinds
    #[must_use]
    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push(Subscriber {
            id,
            kinds: kinds.to_vec(),
            sender,
        });

        Subscription {
            id,
            receiver,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver an event to every matching subscriber
    pub fn publish(&self, event: &RadioEvent) {
        let kind = event.kind();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.subscribers.retain(|subscriber| !subscriber.sender.is_closed());
        for subscriber in inner.subscribers.iter().filter(|s| s.kinds.contains(&kind)) {
            if subscriber.sender.send(event.clone()).is_err() {
                trace!("Subscriber {} went away before delivery", subscriber.id);
            }
        }
    }

    /// Number of live subscriptions
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .subscribers
            .iter()
            .filter(|subscriber| !subscriber.sender.is_closed())
            .count()
    }
}

/// Handle to a live event subscription
///
/// The subscription is released when the handle is cancelled or dropped,
/// whichever happens first.
pub struct Subscription {
    id: u64,
    receiver: mpsc::UnboundedReceiver<RadioEvent>,
    bus: Weak<Mutex<BusInner>>,
}

impl Subscription {
    /// Wait for the next event
    ///
    /// Returns `None` once the radio is gone.
    pub async fn recv(&mut self) -> Option<RadioEvent> {
        self.receiver.recv().await
    }

    /// Take an already delivered event without waiting
    pub fn try_recv(&mut self) -> Option<RadioEvent> {
        self.receiver.try_recv().ok()
    }

    /// Release the subscription
    pub fn cancel(self) {}

    fn release(&mut self) {
        self.receiver.close();
        if let Some(bus) = self.bus.upgrade() {
            let mut inner = bus.lock().unwrap_or_else(PoisonError::into_inner);
            inner.subscribers.retain(|subscriber| subscriber.id != self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bus_filters_by_kind() {
        let bus = EventBus::new();
        let mut disconnects = bus.subscribe(&[EventKind::Disconnected]);
        let mut everything = bus.subscribe(&EventKind::ALL);

        bus.publish(&RadioEvent::ScanStopped);
        bus.publish(&RadioEvent::Disconnected("a".into()));

        assert_eq!(
            disconnects.recv().await,
            Some(RadioEvent::Disconnected("a".into()))
        );
        assert!(disconnects.try_recv().is_none());
        assert_eq!(everything.recv().await, Some(RadioEvent::ScanStopped));
        assert_eq!(
            everything.recv().await,
            Some(RadioEvent::Disconnected("a".into()))
        );
    }

    #[test]
    fn test_subscription_released_on_cancel_and_drop() {
        let bus = EventBus::new();
        let first = bus.subscribe(&EventKind::ALL);
        let second = bus.subscribe(&[EventKind::StateChanged]);
        assert_eq!(bus.subscriber_count(), 2);

        first.cancel();
        assert_eq!(bus.subscriber_count(), 1);

        drop(second);
        assert_eq!(bus.subscriber_count(), 0);

        bus.publish(&RadioEvent::StateChanged("on".to_string()));
    }

    #[test]
    fn test_service_map_target() {
        let map = ServiceMap {
            services: vec![Uuid::from_u128(1)],
            characteristics: vec![CharacteristicRef {
                service: Uuid::from_u128(1),
                characteristic: Uuid::from_u128(2),
            }],
        };

        let target = map.target(0, 0).unwrap();
        assert_eq!(target.service, Uuid::from_u128(1));
        assert_eq!(target.characteristic, Uuid::from_u128(2));
        assert!(map.target(1, 0).is_err());
        assert!(map.target(0, 1).is_err());
    }
}

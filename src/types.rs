use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use uuid::Uuid;

use crate::{DEFAULT_PERIPHERAL_NAME, SABER_SERVICE_UUID};

/// Opaque, platform-assigned peripheral identifier
///
/// Stable for the life of one scan session. On Apple hosts this is a
/// CoreBluetooth UUID, elsewhere usually the MAC address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeripheralId(String);

impl PeripheralId {
    /// Create an identifier from its string form
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// String form of the identifier
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PeripheralId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Host platform family
///
/// The two families frame manufacturer data differently and enumerate
/// GATT services in a different order, so offsets and indices are
/// resolved per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    /// CoreBluetooth hosts (iOS, macOS)
    Ios,
    /// Android and other hosts
    Android,
}

impl Platform {
    /// Platform family of the compile target
    #[must_use]
    pub const fn current() -> Self {
        if cfg!(any(target_os = "ios", target_os = "macos")) {
            Self::Ios
        } else {
            Self::Android
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::current()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ios => write!(f, "ios"),
            Self::Android => write!(f, "android"),
        }
    }
}

/// Bluetooth adapter status as seen by the UI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadioStatus {
    /// Adapter powered on and usable
    On,
    /// Adapter powered off
    Off,
    /// Adapter is powering up
    TurningOn,
    /// Adapter is powering down
    TurningOff,
    /// The app is not allowed to use the adapter
    Unauthorized,
    /// State not yet reported or not recognised
    #[default]
    Unknown,
}

impl RadioStatus {
    /// Whether scans and commands may be issued
    #[must_use]
    pub const fn is_on(self) -> bool {
        matches!(self, Self::On)
    }

    /// Whether entering this status should ask the user to open settings
    #[must_use]
    pub const fn needs_prompt(self) -> bool {
        matches!(self, Self::Off | Self::Unauthorized)
    }
}

impl fmt::Display for RadioStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On => write!(f, "on"),
            Self::Off => write!(f, "off"),
            Self::TurningOn => write!(f, "turning_on"),
            Self::TurningOff => write!(f, "turning_off"),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Scan controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanState {
    /// No scan session running
    Idle,
    /// A scan session is running
    Scanning,
}

/// How the last scan session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanOutcome {
    /// The radio stack reported the end of the scan
    Stopped,
    /// The safety timeout fired first
    TimedOut,
}

/// Phase of the command sequence running against one peripheral
///
/// `Failed` is terminal for the sequence that produced it and is replaced
/// by `Connecting` when the next command starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandPhase {
    /// No command in flight
    #[default]
    Idle,
    /// Connecting and discovering services
    Connecting,
    /// Reading or writing characteristics
    Acting,
    /// Tearing the link down
    Disconnecting,
    /// Last command sequence failed
    Failed,
}

impl CommandPhase {
    /// Whether a command sequence is currently running
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Connecting | Self::Acting | Self::Disconnecting)
    }
}

impl fmt::Display for CommandPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Acting => write!(f, "Acting"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Power and colour advertised by a saber stand
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisedState {
    /// Blade power
    pub power: bool,
    /// Blade colour as `#rrggbb`
    pub color: String,
}

/// One discovered saber stand
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peripheral {
    /// Platform identifier, primary key
    pub id: PeripheralId,
    /// Advertised name or [`DEFAULT_PERIPHERAL_NAME`]
    pub name: String,
    /// Signal strength at the last discovery event
    pub rssi: i16,
    /// Blade power
    pub power: bool,
    /// Blade colour as `#rrggbb`
    pub color: String,
    /// Link currently established
    pub connected: bool,
    /// Connection attempt in flight
    pub connecting: bool,
    /// Command sequence in flight
    pub updating: bool,
}

impl Peripheral {
    /// Create a peripheral from a discovery event
    ///
    /// An empty or missing name falls back to [`DEFAULT_PERIPHERAL_NAME`].
    #[must_use]
    pub fn discovered(
        id: PeripheralId,
        name: Option<&str>,
        rssi: i16,
        state: AdvertisedState,
    ) -> Self {
        let name = name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_PERIPHERAL_NAME)
            .to_string();

        Self {
            id,
            name,
            rssi,
            power: state.power,
            color: state.color,
            connected: false,
            connecting: false,
            updating: false,
        }
    }

    /// Whether a transient flag is raised
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        self.connecting || self.updating
    }
}

/// Partial update merged into a registry entry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeripheralPatch {
    /// New signal strength
    pub rssi: Option<i16>,
    /// New power state
    pub power: Option<bool>,
    /// New colour
    pub color: Option<String>,
    /// New link state
    pub connected: Option<bool>,
    /// New connecting flag
    pub connecting: Option<bool>,
    /// New updating flag
    pub updating: Option<bool>,
}

impl PeripheralPatch {
    /// Set the power field
    #[must_use]
    pub const fn power(mut self, power: bool) -> Self {
        self.power = Some(power);
        self
    }

    /// Set the colour field
    #[must_use]
    pub fn color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    /// Set the link state
    #[must_use]
    pub const fn connected(mut self, connected: bool) -> Self {
        self.connected = Some(connected);
        self
    }

    /// Set the connecting flag
    #[must_use]
    pub const fn connecting(mut self, connecting: bool) -> Self {
        self.connecting = Some(connecting);
        self
    }

    /// Set the updating flag
    #[must_use]
    pub const fn updating(mut self, updating: bool) -> Self {
        self.updating = Some(updating);
        self
    }

    /// Merge the set fields into `peripheral`
    pub fn apply(&self, peripheral: &mut Peripheral) {
        if let Some(rssi) = self.rssi {
            peripheral.rssi = rssi;
        }
        if let Some(power) = self.power {
            peripheral.power = power;
        }
        if let Some(color) = &self.color {
            peripheral.color.clone_from(color);
        }
        if let Some(connected) = self.connected {
            peripheral.connected = connected;
        }
        if let Some(connecting) = self.connecting {
            peripheral.connecting = connecting;
        }
        if let Some(updating) = self.updating {
            peripheral.updating = updating;
        }
    }
}

/// Scan parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanParams {
    /// Service UUIDs a peripheral must advertise
    pub service_uuids: Vec<Uuid>,
    /// Scan duration requested from the radio stack, in seconds
    pub scan_duration_secs: u64,
    /// Safety timeout after which the session ends regardless, in milliseconds
    pub scan_timeout_ms: u64,
    /// Ask the radio stack to report every advertisement
    pub allow_duplicates: bool,
}

impl ScanParams {
    /// Scan duration as a [`Duration`]
    #[must_use]
    pub const fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_secs)
    }

    /// Safety timeout as a [`Duration`]
    #[must_use]
    pub const fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            service_uuids: vec![SABER_SERVICE_UUID],
            scan_duration_secs: 3,
            scan_timeout_ms: 7_000,
            allow_duplicates: false,
        }
    }
}

/// Radio call timeout configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Timeout for service discovery, reads, writes and disconnects in milliseconds
    pub operation_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            operation_timeout_ms: 3_000,
        }
    }
}

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, time::Duration};
use uuid::Uuid;

use crate::{
    error::{RelayError, Result},
    GEN1_COMMAND_IN_UUID, GEN1_DATA_IN_UUID, GEN1_DATA_OUT_UUID, GEN1_SERVICE_UUID,
    GEN1_STATUS_OUT_UUID, GEN2_COMMAND_IN_UUID, GEN2_DATA_IN_UUID, GEN2_DATA_OUT_UUID,
    GEN2_SERVICE_UUID,
};

/// Logical role a GATT characteristic plays in the relay protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CharacteristicRole {
    /// Client to device control words
    CommandIn,
    /// Client to device payloads (SSID, password, settings)
    DataIn,
    /// Device to client payloads (scan, settings, saved network results)
    DataOut,
    /// Device to client status and command results
    StatusOut,
}

impl CharacteristicRole {
    /// Roles every device generation must expose
    pub const REQUIRED: [Self; 3] = [Self::CommandIn, Self::DataIn, Self::DataOut];

    /// Whether the device pushes values on this role
    #[must_use]
    pub const fn is_outbound(self) -> bool {
        matches!(self, Self::DataOut | Self::StatusOut)
    }
}

impl fmt::Display for CharacteristicRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CommandIn => write!(f, "CommandIn"),
            Self::DataIn => write!(f, "DataIn"),
            Self::DataOut => write!(f, "DataOut"),
            Self::StatusOut => write!(f, "StatusOut"),
        }
    }
}

/// Mapping from GATT characteristic UUIDs to protocol roles
///
/// Device generations differ only in this table, so the engine takes it as
/// configuration. Use [`RoleMap::generation_one`] or [`RoleMap::generation_two`]
/// for known hardware, or deserialize a custom map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleMap {
    /// Primary service advertised by the device
    pub service: Uuid,
    /// Characteristic UUID for each role the device exposes
    pub characteristics: BTreeMap<CharacteristicRole, Uuid>,
}

impl RoleMap {
    /// Four-characteristic layout with a dedicated status characteristic
    #[must_use]
    pub fn generation_one() -> Self {
        Self {
            service: GEN1_SERVICE_UUID,
            characteristics: BTreeMap::from([
                (CharacteristicRole::CommandIn, GEN1_COMMAND_IN_UUID),
                (CharacteristicRole::DataIn, GEN1_DATA_IN_UUID),
                (CharacteristicRole::DataOut, GEN1_DATA_OUT_UUID),
                (CharacteristicRole::StatusOut, GEN1_STATUS_OUT_UUID),
            ]),
        }
    }

    /// Assumed layout for second-generation firmware
    ///
    /// The exact characteristic split of this generation is not published.
    /// This preset assumes three characteristics with status reported on
    /// `DataOut`; hardware that exposes a fourth characteristic, or assigns
    /// roles differently, needs its own [`RoleMap`].
    #[must_use]
    pub fn generation_two() -> Self {
        Self {
            service: GEN2_SERVICE_UUID,
            characteristics: BTreeMap::from([
                (CharacteristicRole::CommandIn, GEN2_COMMAND_IN_UUID),
                (CharacteristicRole::DataIn, GEN2_DATA_IN_UUID),
                (CharacteristicRole::DataOut, GEN2_DATA_OUT_UUID),
            ]),
        }
    }

    /// UUID of the characteristic backing `role`, if the map has one
    #[must_use]
    pub fn uuid_for(&self, role: CharacteristicRole) -> Option<Uuid> {
        self.characteristics.get(&role).copied()
    }

    /// Role assigned to a characteristic UUID
    #[must_use]
    pub fn role_for(&self, uuid: Uuid) -> Option<CharacteristicRole> {
        self.characteristics
            .iter()
            .find_map(|(role, candidate)| (*candidate == uuid).then_some(*role))
    }

    /// Role that actually carries traffic for `role`
    ///
    /// Devices without a status characteristic answer status requests on `DataOut`.
    #[must_use]
    pub fn route(&self, role: CharacteristicRole) -> CharacteristicRole {
        if role == CharacteristicRole::StatusOut && !self.characteristics.contains_key(&role) {
            CharacteristicRole::DataOut
        } else {
            role
        }
    }

    /// Check the map has every required role and no UUID is shared between roles
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidConfiguration`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        for role in CharacteristicRole::REQUIRED {
            if !self.characteristics.contains_key(&role) {
                return Err(RelayError::InvalidConfiguration(format!(
                    "role map has no characteristic for {role}"
                )));
            }
        }

        let mut seen = Vec::with_capacity(self.characteristics.len());
        for (role, uuid) in &self.characteristics {
            if seen.contains(uuid) {
                return Err(RelayError::InvalidConfiguration(format!(
                    "characteristic {uuid} is mapped to more than one role ({role})"
                )));
            }
            seen.push(*uuid);
        }

        Ok(())
    }
}

impl Default for RoleMap {
    fn default() -> Self {
        Self::generation_one()
    }
}

/// Lifecycle state of the BLE session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No link to a device
    Disconnected,
    /// Link establishment in progress
    Connecting,
    /// Connected, resolving characteristics
    ServiceDiscovery,
    /// All required roles resolved; operations are accepted
    Ready,
}

impl SessionState {
    /// Whether the transport link is up (resolved or not)
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::ServiceDiscovery | Self::Ready)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::ServiceDiscovery => write!(f, "Service Discovery"),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

/// A WiFi network seen by the device during a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedNetwork {
    /// Network name
    pub ssid: String,
    /// Received signal strength in dBm
    pub signal_strength_dbm: i32,
    /// Primary WiFi channel
    pub primary_channel: i32,
}

/// Access point configuration of the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Name of the access point the relay hosts
    pub ap_name: String,
    /// Password of the hosted access point
    pub ap_password: String,
    /// WiFi channel, 1 to 11
    pub wifi_channel: u8,
    /// Transmit power level, 0 to 4
    pub transmit_power: u8,
    /// Firmware version reported by the device (read-only)
    pub firmware_version: String,
    /// Device identifier reported by the device (read-only)
    pub device_id: String,
}

impl DeviceSettings {
    /// Channel used when the device reports an unusable value
    pub const DEFAULT_CHANNEL: u8 = 8;
    /// Transmit power used when the device reports an unusable value
    pub const DEFAULT_POWER: u8 = 3;
    /// Placeholder for read-only fields the device did not report
    pub const UNKNOWN: &'static str = "unknown";

    /// Create settings for writing; read-only fields are left as placeholders
    #[must_use]
    pub fn new(
        ap_name: impl Into<String>,
        ap_password: impl Into<String>,
        wifi_channel: u8,
        transmit_power: u8,
    ) -> Self {
        Self {
            ap_name: ap_name.into(),
            ap_password: ap_password.into(),
            wifi_channel,
            transmit_power,
            firmware_version: Self::UNKNOWN.to_string(),
            device_id: Self::UNKNOWN.to_string(),
        }
    }
}

/// Result of a WiFi connection attempt as reported by the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOutcome {
    /// Whether the device reported a successful connection
    pub connected: bool,
    /// Raw status text sent by the device
    pub status: String,
}

/// A relay discovered during a BLE scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Advertised device name
    pub name: String,
    /// Platform peripheral identifier
    pub id: String,
    /// Device MAC address
    pub address: String,
    /// Signal strength (RSSI)
    pub rssi: i16,
}

impl DeviceInfo {
    /// Create new device info
    #[must_use]
    pub const fn new(name: String, id: String, address: String, rssi: i16) -> Self {
        Self {
            name,
            id,
            address,
            rssi,
        }
    }
}

/// Everything the engine reports to its single external subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A relay was seen during a BLE scan
    DeviceDiscovered(DeviceInfo),
    /// The session moved to a new lifecycle state
    ConnectionStateChanged(SessionState),
    /// Networks reported by a WiFi scan, requested or pushed
    ScanResults(Vec<ScannedNetwork>),
    /// Settings read from the device
    Settings(DeviceSettings),
    /// Networks the device firmware remembers
    SavedNetworks(Vec<String>),
    /// Raw status text pushed or returned by the device
    StatusChanged(String),
}

/// Connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Connection timeout in milliseconds
    pub timeout_ms: u64,
    /// Scan duration in milliseconds
    pub scan_timeout_ms: u64,
    /// Only accept devices whose advertised name contains this text
    pub name_filter: Option<String>,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            scan_timeout_ms: 10_000,
            name_filter: None,
        }
    }
}

/// Fixed delays between protocol steps
///
/// The firmware sends no acknowledgement for a write, so the client waits
/// for a fixed time after each write before issuing the next one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Delay after each chained write in a multi-write sequence
    pub chained_write_delay_ms: u64,
    /// Delay between `GETSSIDLIST` and reading the scan results
    pub scan_read_delay_ms: u64,
    /// Delay between `READSETTINGS`/`GETNETWORKS` and reading the result
    pub result_read_delay_ms: u64,
    /// Delay between `CONNECTWIFI` and reading the connection status
    pub status_read_delay_ms: u64,
    /// Delay between `CLOSEBTTASK` and dropping the link
    pub shutdown_delay_ms: u64,
    /// Longest time to wait for a requested value to arrive
    pub response_timeout_ms: u64,
}

impl PacingConfig {
    /// Pacing with every delay set to zero, for transports that acknowledge writes
    #[must_use]
    pub const fn immediate(response_timeout_ms: u64) -> Self {
        Self {
            chained_write_delay_ms: 0,
            scan_read_delay_ms: 0,
            result_read_delay_ms: 0,
            status_read_delay_ms: 0,
            shutdown_delay_ms: 0,
            response_timeout_ms,
        }
    }

    /// Delay after each chained write
    #[must_use]
    pub const fn chained_write_delay(&self) -> Duration {
        Duration::from_millis(self.chained_write_delay_ms)
    }

    /// Delay before reading scan results
    #[must_use]
    pub const fn scan_read_delay(&self) -> Duration {
        Duration::from_millis(self.scan_read_delay_ms)
    }

    /// Delay before reading a command result
    #[must_use]
    pub const fn result_read_delay(&self) -> Duration {
        Duration::from_millis(self.result_read_delay_ms)
    }

    /// Delay before reading connection status
    #[must_use]
    pub const fn status_read_delay(&self) -> Duration {
        Duration::from_millis(self.status_read_delay_ms)
    }

    /// Delay before dropping the link on shutdown
    #[must_use]
    pub const fn shutdown_delay(&self) -> Duration {
        Duration::from_millis(self.shutdown_delay_ms)
    }

    /// Response timeout
    #[must_use]
    pub const fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            chained_write_delay_ms: 100,
            scan_read_delay_ms: 1_000,
            result_read_delay_ms: 500,
            status_read_delay_ms: 1_000,
            shutdown_delay_ms: 500,
            response_timeout_ms: 5_000,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Characteristic layout of the target device generation
    pub role_map: RoleMap,
    /// Delays between protocol steps
    pub pacing: PacingConfig,
    /// Scan and connect parameters
    pub connection: ConnectionParams,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pacing_defaults() {
        let pacing = PacingConfig::default();

        assert_eq!(pacing.chained_write_delay(), Duration::from_millis(100));
        assert_eq!(pacing.scan_read_delay(), Duration::from_secs(1));
        assert_eq!(pacing.result_read_delay(), Duration::from_millis(500));
        assert_eq!(pacing.status_read_delay(), Duration::from_secs(1));
        assert_eq!(pacing.shutdown_delay(), Duration::from_millis(500));
        assert_eq!(pacing.response_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_connection_params_default() {
        let params = ConnectionParams::default();
        assert_eq!(params.timeout_ms, 30_000);
        assert_eq!(params.scan_timeout_ms, 10_000);
        assert!(params.name_filter.is_none());
    }

    #[test]
    fn test_generation_maps_are_valid() {
        assert!(RoleMap::generation_one().validate().is_ok());
        assert!(RoleMap::generation_two().validate().is_ok());
        assert_ne!(
            RoleMap::generation_one().service,
            RoleMap::generation_two().service
        );
    }

    #[test]
    fn test_status_routing() {
        let gen1 = RoleMap::generation_one();
        assert_eq!(
            gen1.route(CharacteristicRole::StatusOut),
            CharacteristicRole::StatusOut
        );

        let gen2 = RoleMap::generation_two();
        assert_eq!(
            gen2.route(CharacteristicRole::StatusOut),
            CharacteristicRole::DataOut
        );
        assert_eq!(
            gen2.route(CharacteristicRole::CommandIn),
            CharacteristicRole::CommandIn
        );
    }

    #[test]
    fn test_role_lookup() {
        let map = RoleMap::generation_one();
        assert_eq!(
            map.role_for(GEN1_DATA_OUT_UUID),
            Some(CharacteristicRole::DataOut)
        );
        assert_eq!(map.role_for(Uuid::nil()), None);
        assert_eq!(
            map.uuid_for(CharacteristicRole::CommandIn),
            Some(GEN1_COMMAND_IN_UUID)
        );
    }

    #[test]
    fn test_invalid_role_maps() {
        let mut missing = RoleMap::generation_one();
        missing.characteristics.remove(&CharacteristicRole::DataIn);
        assert!(matches!(
            missing.validate(),
            Err(RelayError::InvalidConfiguration(_))
        ));

        let mut shared = RoleMap::generation_one();
        shared
            .characteristics
            .insert(CharacteristicRole::StatusOut, GEN1_DATA_OUT_UUID);
        assert!(matches!(
            shared.validate(),
            Err(RelayError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_session_state_connectivity() {
        assert!(SessionState::Ready.is_connected());
        assert!(SessionState::ServiceDiscovery.is_connected());
        assert!(!SessionState::Connecting.is_connected());
        assert!(!SessionState::Disconnected.is_connected());
    }

    #[test]
    fn test_settings_for_write_have_placeholders() {
        let settings = DeviceSettings::new("Relay", "secret123", 6, 2);
        assert_eq!(settings.firmware_version, DeviceSettings::UNKNOWN);
        assert_eq!(settings.device_id, DeviceSettings::UNKNOWN);
    }
}

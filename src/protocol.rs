use crate::{
    error::{RelayError, Result},
    types::{ConnectionOutcome, DeviceSettings, ScannedNetwork},
};
use bytes::Bytes;
use std::{fmt, str::FromStr};
use tracing::{debug, warn};

/// Separates fields inside a record
pub const FIELD_DELIMITER: char = '|';

/// Separates records in list payloads
pub const RECORD_DELIMITER: char = ';';

/// Substring the firmware includes in a status when WiFi is connected
pub const CONNECTED_MARKER: &str = "Connected";

/// Payload the firmware sends when it remembers no networks
pub const NO_SAVED_NETWORKS: &str = "No saved networks";

/// Longest SSID allowed by 802.11
pub const MAX_SSID_LEN: usize = 32;

/// Longest WPA passphrase
pub const MAX_PASSWORD_LEN: usize = 63;

/// Shortest WPA passphrase the relay accepts for its own access point
pub const MIN_AP_PASSWORD_LEN: usize = 8;

/// Highest WiFi channel the relay can host on
pub const MAX_WIFI_CHANNEL: u8 = 11;

/// Highest transmit power level
pub const MAX_TRANSMIT_POWER: u8 = 4;

/// Control words understood by the relay firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Start a WiFi scan; results are read from `DataOut`
    GetSsidList,
    /// Select the SSID previously written to `DataIn`
    SetSelSsid,
    /// Store the password previously written to `DataIn`
    StorePword,
    /// Connect to the selected network
    ConnectWifi,
    /// Put current settings on `DataOut`
    ReadSettings,
    /// Apply the settings previously written to `DataIn`
    WriteSettings,
    /// Put the saved network list on `DataOut`
    GetNetworks,
    /// Forget the SSID previously written to `DataIn`
    ForgetNetwork,
    /// Disconnect from the upstream WiFi network
    Disconnect,
    /// Disconnect and stop every radio service
    ShutdownAll,
    /// Stop the firmware's Bluetooth task
    CloseBtTask,
}

impl Command {
    /// Every command in the vocabulary
    pub const ALL: [Self; 11] = [
        Self::GetSsidList,
        Self::SetSelSsid,
        Self::StorePword,
        Self::ConnectWifi,
        Self::ReadSettings,
        Self::WriteSettings,
        Self::GetNetworks,
        Self::ForgetNetwork,
        Self::Disconnect,
        Self::ShutdownAll,
        Self::CloseBtTask,
    ];

    /// Exact token sent on the wire
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GetSsidList => "GETSSIDLIST",
            Self::SetSelSsid => "SETSELSSID",
            Self::StorePword => "STOREPWORD",
            Self::ConnectWifi => "CONNECTWIFI",
            Self::ReadSettings => "READSETTINGS",
            Self::WriteSettings => "WRITESETTINGS",
            Self::GetNetworks => "GETNETWORKS",
            Self::ForgetNetwork => "FORGETNETWORK",
            Self::Disconnect => "DISCONNECT",
            Self::ShutdownAll => "SHUTDOWNALL",
            Self::CloseBtTask => "CLOSEBTTASK",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|command| command.as_str() == s)
            .ok_or_else(|| RelayError::ValidationFailed(format!("unknown command: {s}")))
    }
}

/// Encode a control word for `CommandIn`
#[must_use]
pub fn encode_command(command: Command) -> Bytes {
    Bytes::from_static(command.as_str().as_bytes())
}

/// Encode a text value for `DataIn`
///
/// No escaping is applied; validate the value first.
#[must_use]
pub fn encode_text(value: &str) -> Bytes {
    Bytes::copy_from_slice(value.as_bytes())
}

/// Encode writable settings as `apName|apPassword|channel|power`
///
/// Firmware version and device id are read-only and never sent.
#[must_use]
pub fn encode_settings(settings: &DeviceSettings) -> Bytes {
    Bytes::from(format!(
        "{}{FIELD_DELIMITER}{}{FIELD_DELIMITER}{}{FIELD_DELIMITER}{}",
        settings.ap_name, settings.ap_password, settings.wifi_channel, settings.transmit_power
    ))
}

/// Decode `ssid|rssi|channel;...` into the networks it lists
///
/// Records with fewer than three fields or non-numeric signal/channel are
/// skipped; the rest are returned in input order.
#[must_use]
pub fn decode_scan_results(data: &[u8]) -> Vec<ScannedNetwork> {
    let text = payload_text(data);

    text.split(RECORD_DELIMITER)
        .filter(|record| !record.trim().is_empty())
        .filter_map(|record| {
            let network = parse_scan_record(record);
            if network.is_none() {
                debug!("Dropping malformed scan record: {record:?}");
            }
            network
        })
        .collect()
}

fn parse_scan_record(record: &str) -> Option<ScannedNetwork> {
    let mut fields = record.split(FIELD_DELIMITER);
    let ssid = fields.next()?;
    let signal_strength_dbm = fields.next()?.trim().parse::<i32>().ok()?;
    let primary_channel = fields.next()?.trim().parse::<i32>().ok()?;

    Some(ScannedNetwork {
        ssid: ssid.to_string(),
        signal_strength_dbm,
        primary_channel,
    })
}

/// Decode `apName|apPassword|channel|power[|firmware[|deviceId]]`
///
/// A channel or power value that does not parse, or is out of range, falls
/// back to its default instead of failing the decode.
///
/// # Errors
///
/// Returns [`RelayError::InvalidResponse`] if fewer than four fields are present.
pub fn decode_settings(data: &[u8]) -> Result<DeviceSettings> {
    let text = payload_text(data);
    let fields: Vec<&str> = text.split(FIELD_DELIMITER).collect();

    if fields.len() < 4 {
        return Err(RelayError::InvalidResponse(format!(
            "settings payload has {} field(s), expected at least 4",
            fields.len()
        )));
    }

    let wifi_channel = parse_bounded(
        fields[2],
        1..=MAX_WIFI_CHANNEL,
        DeviceSettings::DEFAULT_CHANNEL,
        "channel",
    );
    let transmit_power = parse_bounded(
        fields[3],
        0..=MAX_TRANSMIT_POWER,
        DeviceSettings::DEFAULT_POWER,
        "transmit power",
    );

    let optional = |index: usize| {
        fields
            .get(index)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .unwrap_or(DeviceSettings::UNKNOWN)
            .to_string()
    };

    Ok(DeviceSettings {
        ap_name: fields[0].to_string(),
        ap_password: fields[1].to_string(),
        wifi_channel,
        transmit_power,
        firmware_version: optional(4),
        device_id: optional(5),
    })
}

fn parse_bounded(
    field: &str,
    range: std::ops::RangeInclusive<u8>,
    default: u8,
    name: &str,
) -> u8 {
    match field.trim().parse::<u8>() {
        Ok(value) if range.contains(&value) => value,
        _ => {
            warn!("Unusable {name} value {field:?} in settings, using default {default}");
            default
        }
    }
}

/// Decode `ssid;ssid;...` into the saved network names
#[must_use]
pub fn decode_saved_networks(data: &[u8]) -> Vec<String> {
    let text = payload_text(data);
    if text.trim() == NO_SAVED_NETWORKS {
        return Vec::new();
    }

    text.split(RECORD_DELIMITER)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Interpret a status payload
///
/// Connected if and only if the text contains [`CONNECTED_MARKER`].
#[must_use]
pub fn decode_status(data: &[u8]) -> ConnectionOutcome {
    let status = payload_text(data);

    ConnectionOutcome {
        connected: status.contains(CONNECTED_MARKER),
        status,
    }
}

/// Lossy UTF-8 text with trailing NULs and line endings removed
fn payload_text(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .trim_end_matches(['\0', '\r', '\n'])
        .to_string()
}

fn check_delimiters(value: &str, what: &str) -> Result<()> {
    if value.contains([FIELD_DELIMITER, RECORD_DELIMITER]) {
        return Err(RelayError::ValidationFailed(format!(
            "{what} must not contain '{FIELD_DELIMITER}' or '{RECORD_DELIMITER}'"
        )));
    }
    Ok(())
}

fn check_length(value: &str, range: std::ops::RangeInclusive<usize>, what: &str) -> Result<()> {
    if !range.contains(&value.len()) {
        return Err(RelayError::ValidationFailed(format!(
            "{what} must be {} to {} bytes long, got {}",
            range.start(),
            range.end(),
            value.len()
        )));
    }
    Ok(())
}

/// Check an SSID before it is sent to the device
///
/// # Errors
///
/// Returns [`RelayError::ValidationFailed`] if the SSID is empty, too long, or
/// contains a delimiter.
pub fn validate_ssid(ssid: &str) -> Result<()> {
    check_length(ssid, 1..=MAX_SSID_LEN, "SSID")?;
    check_delimiters(ssid, "SSID")
}

/// Check a WiFi password before it is sent to the device
///
/// An empty password is allowed for open networks.
///
/// # Errors
///
/// Returns [`RelayError::ValidationFailed`] if the password is too long or
/// contains a delimiter.
pub fn validate_wifi_password(password: &str) -> Result<()> {
    check_length(password, 0..=MAX_PASSWORD_LEN, "WiFi password")?;
    check_delimiters(password, "WiFi password")
}

/// Check writable settings before they are encoded
///
/// # Errors
///
/// Returns [`RelayError::ValidationFailed`] for the first field that is out of
/// range or contains a delimiter.
pub fn validate_settings(settings: &DeviceSettings) -> Result<()> {
    check_length(&settings.ap_name, 1..=MAX_SSID_LEN, "AP name")?;
    check_delimiters(&settings.ap_name, "AP name")?;
    check_length(
        &settings.ap_password,
        MIN_AP_PASSWORD_LEN..=MAX_PASSWORD_LEN,
        "AP password",
    )?;
    check_delimiters(&settings.ap_password, "AP password")?;

    if !(1..=MAX_WIFI_CHANNEL).contains(&settings.wifi_channel) {
        return Err(RelayError::ValidationFailed(format!(
            "WiFi channel must be 1 to {MAX_WIFI_CHANNEL}, got {}",
            settings.wifi_channel
        )));
    }
    if settings.transmit_power > MAX_TRANSMIT_POWER {
        return Err(RelayError::ValidationFailed(format!(
            "transmit power must be 0 to {MAX_TRANSMIT_POWER}, got {}",
            settings.transmit_power
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_tokens() {
        assert_eq!(&encode_command(Command::GetSsidList)[..], b"GETSSIDLIST");
        assert_eq!(&encode_command(Command::SetSelSsid)[..], b"SETSELSSID");
        assert_eq!(&encode_command(Command::CloseBtTask)[..], b"CLOSEBTTASK");

        for command in Command::ALL {
            assert_eq!(command.as_str().parse::<Command>().unwrap(), command);
        }
        assert!("getssidlist".parse::<Command>().is_err());
    }

    #[test]
    fn test_scan_results_skip_malformed_records() {
        let networks = decode_scan_results(b"Home|-55|6;Bad;Office|-70|11");

        assert_eq!(
            networks,
            vec![
                ScannedNetwork {
                    ssid: "Home".to_string(),
                    signal_strength_dbm: -55,
                    primary_channel: 6,
                },
                ScannedNetwork {
                    ssid: "Office".to_string(),
                    signal_strength_dbm: -70,
                    primary_channel: 11,
                },
            ]
        );
    }

    #[test]
    fn test_scan_results_edge_cases() {
        assert!(decode_scan_results(b"").is_empty());
        assert!(decode_scan_results(b"Cafe|strong|6").is_empty());
        assert!(decode_scan_results(b"Cafe|-40").is_empty());

        let networks = decode_scan_results(b"Cafe|-40|1|extra;Lab|-80|3;\0");
        assert_eq!(networks.len(), 2);
        assert_eq!(networks[0].ssid, "Cafe");
        assert_eq!(networks[1].primary_channel, 3);
    }

    #[test]
    fn test_scan_results_keep_ssid_spacing() {
        let networks = decode_scan_results(b" Guest Net | -48 | 6 ;Lab|-300|165");

        assert_eq!(networks.len(), 2);
        assert_eq!(networks[0].ssid, " Guest Net ");
        assert_eq!(networks[0].signal_strength_dbm, -48);
        assert_eq!(networks[0].primary_channel, 6);
        assert_eq!(networks[1].signal_strength_dbm, -300);
        assert_eq!(networks[1].primary_channel, 165);
    }

    #[test]
    fn test_settings_encode_decode() {
        let settings = DeviceSettings::new("X", "Y", 3, 2);
        let encoded = encode_settings(&settings);
        assert_eq!(&encoded[..], b"X|Y|3|2");

        let decoded = decode_settings(&encoded).unwrap();
        assert_eq!(decoded.ap_name, "X");
        assert_eq!(decoded.ap_password, "Y");
        assert_eq!(decoded.wifi_channel, 3);
        assert_eq!(decoded.transmit_power, 2);
        assert_eq!(decoded.firmware_version, DeviceSettings::UNKNOWN);
        assert_eq!(decoded.device_id, DeviceSettings::UNKNOWN);
    }

    #[test]
    fn test_settings_numeric_fallback_is_per_field() {
        let decoded = decode_settings(b"A|B|notanumber|2").unwrap();
        assert_eq!(decoded.wifi_channel, DeviceSettings::DEFAULT_CHANNEL);
        assert_eq!(decoded.transmit_power, 2);

        let decoded = decode_settings(b"A|B|4|9").unwrap();
        assert_eq!(decoded.wifi_channel, 4);
        assert_eq!(decoded.transmit_power, DeviceSettings::DEFAULT_POWER);
    }

    #[test]
    fn test_settings_optional_fields() {
        let decoded = decode_settings(b"Relay|pass1234|6|1|2.4.1|RL-00A1\r\n").unwrap();
        assert_eq!(decoded.firmware_version, "2.4.1");
        assert_eq!(decoded.device_id, "RL-00A1");
    }

    #[test]
    fn test_settings_too_few_fields() {
        assert!(matches!(
            decode_settings(b"A|B|3"),
            Err(RelayError::InvalidResponse(_))
        ));
        assert!(matches!(
            decode_settings(b""),
            Err(RelayError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_saved_networks() {
        assert!(decode_saved_networks(b"").is_empty());
        assert!(decode_saved_networks(NO_SAVED_NETWORKS.as_bytes()).is_empty());
        assert_eq!(decode_saved_networks(b"A; B ;C"), vec!["A", "B", "C"]);
        assert_eq!(decode_saved_networks(b"Home;;"), vec!["Home"]);
    }

    #[test]
    fn test_status_marker() {
        assert!(decode_status(b"Connected to Home").connected);
        assert!(!decode_status(b"Connecting...").connected);
        assert!(!decode_status(b"Disconnected").connected);
        assert!(!decode_status(b"").connected);

        let outcome = decode_status(b"Connected to Home\n");
        assert_eq!(outcome.status, "Connected to Home");
    }

    #[test]
    fn test_ssid_validation() {
        assert!(validate_ssid("Home").is_ok());
        assert!(validate_ssid("").is_err());
        assert!(validate_ssid(&"x".repeat(MAX_SSID_LEN + 1)).is_err());
        assert!(validate_ssid("Bad|Name").is_err());
        assert!(validate_ssid("Bad;Name").is_err());
    }

    #[test]
    fn test_password_validation() {
        assert!(validate_wifi_password("").is_ok());
        assert!(validate_wifi_password("hunter22").is_ok());
        assert!(validate_wifi_password("pa|ss").is_err());
        assert!(validate_wifi_password(&"p".repeat(MAX_PASSWORD_LEN + 1)).is_err());
    }

    #[test]
    fn test_settings_validation() {
        assert!(validate_settings(&DeviceSettings::new("Relay", "password1", 6, 2)).is_ok());

        let invalid = vec![
            DeviceSettings::new("", "password1", 6, 2),
            DeviceSettings::new("Re|ay", "password1", 6, 2),
            DeviceSettings::new("Relay", "short", 6, 2),
            DeviceSettings::new("Relay", "pass;word", 6, 2),
            DeviceSettings::new("Relay", "password1", 0, 2),
            DeviceSettings::new("Relay", "password1", 12, 2),
            DeviceSettings::new("Relay", "password1", 6, 5),
        ];

        for settings in invalid {
            assert!(
                matches!(
                    validate_settings(&settings),
                    Err(RelayError::ValidationFailed(_))
                ),
                "settings should be rejected: {settings:?}"
            );
        }
    }
}

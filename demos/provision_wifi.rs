use std::env;
use tracing::{error, info, warn};
use relaylink::{BleManager, DeviceEvent, RelayConfig, RelayDevice, RelayError, Result, RoleMap};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let mut args = env::args().skip(1);
    let ssid = args.next().unwrap_or_else(|| "Home".to_string());
    let password = args.next().unwrap_or_default();
    let role_map = match env::var("RELAY_GENERATION").as_deref() {
        Ok("2") => RoleMap::generation_two(),
        _ => RoleMap::generation_one(),
    };

    info!("Relaylink {} provisioning example", relaylink::VERSION);
    info!("Searching for relay devices...");

    let config = RelayConfig {
        role_map,
        ..Default::default()
    };
    let manager = BleManager::new().await?;
    let mut discovered = manager.discover(&config.connection, &config.role_map).await?;
    let device_info = loop {
        match discovered.recv().await {
            Some(DeviceEvent::DeviceDiscovered(info)) => break info,
            Some(_) => {}
            None => {
                error!("No relay found");
                return Err(RelayError::DeviceNotFound);
            }
        }
    };
    info!("Found {} ({} dBm)", device_info.name, device_info.rssi);

    let mut relay = match RelayDevice::connect_to_device(&manager, device_info, config).await {
        Ok(device) => device,
        Err(e) => {
            error!("Failed to connect to device: {}", e);
            return Err(e);
        }
    };
    if let Some(device_info) = relay.device_info() {
        info!("Connected to: {} ({})", device_info.name, device_info.address);
    }

    // Log pushed status changes while the example runs
    if let Some(mut events) = relay.take_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    DeviceEvent::StatusChanged(status) => info!("Status: {}", status),
                    DeviceEvent::ConnectionStateChanged(state) => info!("Session: {}", state),
                    _ => {}
                }
            }
        });
    }

    let networks = match relay.scan_wifi().await {
        Err(e) if e.is_recoverable() => {
            warn!("Scan failed ({}), retrying once", e);
            relay.scan_wifi().await?
        }
        result => result?,
    };
    info!("Networks in range:");
    for network in &networks {
        info!(
            "  {:32} {:4} dBm  channel {}",
            network.ssid, network.signal_strength_dbm, network.primary_channel
        );
    }
    if !networks.iter().any(|network| network.ssid == ssid) {
        warn!("{} was not seen in the scan, trying anyway", ssid);
    }

    let outcome = relay.connect_wifi(&ssid, &password).await?;
    if outcome.connected {
        info!("Relay connected to {}", ssid);
    } else {
        warn!("Relay did not connect: {}", outcome.status);
    }

    let settings = relay.read_settings().await?;
    info!("Access point: {}", settings.ap_name);
    info!("  Channel: {}", settings.wifi_channel);
    info!("  Transmit power: {}", settings.transmit_power);
    info!("  Firmware: {}", settings.firmware_version);
    info!("  Device id: {}", settings.device_id);

    let saved = relay.list_saved_networks().await?;
    info!("Saved networks: {}", saved.join(", "));

    relay.shutdown_link().await?;
    info!("Done");

    Ok(())
}

use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
        PeripheralProperties, ScanFilter, WriteType,
    },
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{RelayError, Result},
    link::{Link, LinkEvent},
    types::{CharacteristicRole, ConnectionParams, DeviceEvent, DeviceInfo, RoleMap},
};

/// BLE manager for relay discovery and connection
pub struct BleManager {
    manager: Manager,
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
}

impl BleManager {
    /// Create a new BLE manager
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Ble`] if the Bluetooth stack cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;

        Ok(Self {
            manager,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn adapter(&self) -> Result<Adapter> {
        self.manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(RelayError::DeviceNotFound)
    }

    /// Scan for relays advertising the service in `role_map`
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::DeviceNotFound`] if no Bluetooth adapter is available,
    /// or [`RelayError::Ble`] for other Bluetooth errors.
    pub async fn scan_for_devices(
        &self,
        params: &ConnectionParams,
        role_map: &RoleMap,
    ) -> Result<Vec<DeviceInfo>> {
        info!("Starting scan for relay devices...");
        let central = self.adapter().await?;

        central
            .start_scan(ScanFilter {
                services: vec![role_map.service],
            })
            .await?;
        tokio::time::sleep(Duration::from_millis(params.scan_timeout_ms)).await;
        central.stop_scan().await?;

        let mut devices = Vec::new();
        for peripheral in central.peripherals().await? {
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };
            if !is_relay_device(&properties, params, role_map) {
                continue;
            }

            let device_info = device_info(&peripheral, &properties);
            info!("Found relay device: {}", device_info.name);
            self.peripherals
                .lock()
                .await
                .insert(device_info.id.clone(), peripheral);
            devices.push(device_info);
        }

        info!("Scan completed. Found {} relay device(s)", devices.len());
        Ok(devices)
    }

    /// Stream relays as they are discovered, for `params.scan_timeout_ms`
    ///
    /// Each match is reported as [`DeviceEvent::DeviceDiscovered`]; the channel
    /// closes when the scan stops.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::DeviceNotFound`] if no Bluetooth adapter is available,
    /// or [`RelayError::Ble`] if the scan cannot be started.
    pub async fn discover(
        &self,
        params: &ConnectionParams,
        role_map: &RoleMap,
    ) -> Result<mpsc::UnboundedReceiver<DeviceEvent>> {
        let central = self.adapter().await?;
        let mut central_events = central.events().await?;
        central
            .start_scan(ScanFilter {
                services: vec![role_map.service],
            })
            .await?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let peripherals = self.peripherals.clone();
        let params = params.clone();
        let role_map = role_map.clone();

        tokio::spawn(async move {
            let deadline = tokio::time::sleep(Duration::from_millis(params.scan_timeout_ms));
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    () = &mut deadline => break,
                    event = central_events.next() => {
                        let id = match event {
                            Some(CentralEvent::DeviceDiscovered(id)) => id,
                            Some(_) => continue,
                            None => break,
                        };
                        let Ok(peripheral) = central.peripheral(&id).await else {
                            continue;
                        };
                        let Ok(Some(properties)) = peripheral.properties().await else {
                            continue;
                        };
                        if !is_relay_device(&properties, &params, &role_map) {
                            continue;
                        }
                        let info = device_info(&peripheral, &properties);
                        debug!("Discovered relay device: {}", info.name);
                        peripherals.lock().await.insert(info.id.clone(), peripheral);
                        if sender.send(DeviceEvent::DeviceDiscovered(info)).is_err() {
                            break;
                        }
                    }
                }
            }

            if let Err(e) = central.stop_scan().await {
                warn!("Failed to stop scan: {e}");
            }
        });

        Ok(receiver)
    }

    /// Establish the transport connection to a previously discovered device
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::DeviceNotFound`] if the device was not seen by a scan,
    /// [`RelayError::Timeout`] if connecting takes longer than `params.timeout_ms`,
    /// or [`RelayError::ConnectionFailed`] if the stack refuses the connection.
    pub async fn connect(
        &self,
        device_info: &DeviceInfo,
        params: &ConnectionParams,
    ) -> Result<Peripheral> {
        info!("Connecting to device: {}", device_info.name);

        let peripheral = self
            .peripherals
            .lock()
            .await
            .get(&device_info.id)
            .cloned()
            .ok_or(RelayError::DeviceNotFound)?;

        timeout(Duration::from_millis(params.timeout_ms), peripheral.connect())
            .await
            .map_err(|_| RelayError::Timeout {
                timeout_ms: params.timeout_ms,
            })?
            .map_err(|e| RelayError::ConnectionFailed(e.to_string()))?;

        Ok(peripheral)
    }

    /// Resolve roles on a connected peripheral and start delivering its events
    ///
    /// Output roles that support notify or indicate are subscribed. Roles the
    /// device lacks are left unresolved; the session decides whether that is fatal.
    /// If the link cannot be opened the peripheral is disconnected.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Ble`] if service discovery or subscription fails, or
    /// [`RelayError::ConnectionFailed`] if the relay service is not present.
    pub async fn open_link(
        &self,
        peripheral: Peripheral,
        role_map: &RoleMap,
    ) -> Result<(BleLink, mpsc::UnboundedReceiver<LinkEvent>)> {
        let result = self.establish_link(peripheral.clone(), role_map).await;
        release_on_error(result, || peripheral.disconnect()).await
    }

    async fn establish_link(
        &self,
        peripheral: Peripheral,
        role_map: &RoleMap,
    ) -> Result<(BleLink, mpsc::UnboundedReceiver<LinkEvent>)> {
        peripheral.discover_services().await?;

        let service = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == role_map.service)
            .ok_or_else(|| {
                RelayError::ConnectionFailed(format!("service {} not found", role_map.service))
            })?;

        let mut characteristics = HashMap::new();
        for characteristic in service.characteristics {
            if let Some(role) = role_map.role_for(characteristic.uuid) {
                debug!("Resolved {role} -> {}", characteristic.uuid);
                characteristics.insert(role, characteristic);
            }
        }

        for (role, characteristic) in &characteristics {
            if role.is_outbound()
                && characteristic
                    .properties
                    .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
            {
                peripheral.subscribe(characteristic).await?;
                debug!("Subscribed to {role}");
            }
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let central = self.adapter().await?;
        let tasks = vec![
            tokio::spawn(pump_notifications(
                peripheral.clone(),
                role_map.clone(),
                sender.clone(),
            )),
            tokio::spawn(watch_disconnect(central, peripheral.id(), sender.clone())),
        ];

        info!("Link open with {} resolved characteristic(s)", characteristics.len());

        Ok((
            BleLink {
                peripheral,
                characteristics,
                events: sender,
                tasks,
            },
            receiver,
        ))
    }
}

/// Run `release` when `result` is an error, keeping the original error
async fn release_on_error<T, E, F, Fut>(result: Result<T>, release: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<(), E>>,
    E: std::fmt::Display,
{
    if let Err(e) = &result {
        warn!("Link setup failed, disconnecting peripheral: {e}");
        if let Err(release_error) = release().await {
            warn!("Failed to disconnect peripheral: {release_error}");
        }
    }
    result
}

fn is_relay_device(
    properties: &PeripheralProperties,
    params: &ConnectionParams,
    role_map: &RoleMap,
) -> bool {
    // Some platforms omit advertised services; the scan filter already applied.
    let advertises_service =
        properties.services.is_empty() || properties.services.contains(&role_map.service);

    let name_matches = params.name_filter.as_deref().map_or(true, |filter| {
        properties
            .local_name
            .as_deref()
            .is_some_and(|name| name.contains(filter))
    });

    advertises_service && name_matches
}

fn device_info(peripheral: &Peripheral, properties: &PeripheralProperties) -> DeviceInfo {
    DeviceInfo::new(
        properties
            .local_name
            .clone()
            .unwrap_or_else(|| "Unknown Relay".to_string()),
        peripheral_key(&peripheral.id()),
        properties.address.to_string(),
        properties.rssi.unwrap_or(0),
    )
}

fn peripheral_key(id: &PeripheralId) -> String {
    format!("{id:?}")
}

async fn pump_notifications(
    peripheral: Peripheral,
    role_map: RoleMap,
    sender: mpsc::UnboundedSender<LinkEvent>,
) {
    let mut notifications = match peripheral.notifications().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Notification stream unavailable: {e}");
            let _ = sender.send(LinkEvent::Disconnected);
            return;
        }
    };

    while let Some(notification) = notifications.next().await {
        let Some(role) = role_map.role_for(notification.uuid) else {
            debug!("Ignoring notification from {}", notification.uuid);
            continue;
        };
        let event = LinkEvent::ValueUpdated {
            role,
            value: Ok(Bytes::from(notification.value)),
        };
        if sender.send(event).is_err() {
            return;
        }
    }

    debug!("Notification stream ended");
    let _ = sender.send(LinkEvent::Disconnected);
}

async fn watch_disconnect(
    central: Adapter,
    peripheral_id: PeripheralId,
    sender: mpsc::UnboundedSender<LinkEvent>,
) {
    let mut events = match central.events().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Adapter event stream unavailable: {e}");
            return;
        }
    };

    while let Some(event) = events.next().await {
        if matches!(&event, CentralEvent::DeviceDisconnected(id) if *id == peripheral_id) {
            info!("Device disconnected");
            let _ = sender.send(LinkEvent::Disconnected);
            return;
        }
    }
}

/// Active link to a relay device over btleplug
pub struct BleLink {
    peripheral: Peripheral,
    characteristics: HashMap<CharacteristicRole, Characteristic>,
    events: mpsc::UnboundedSender<LinkEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl BleLink {
    fn characteristic(&self, role: CharacteristicRole) -> Result<&Characteristic> {
        self.characteristics
            .get(&role)
            .ok_or(RelayError::CharacteristicsNotResolved { role })
    }

    /// Check if the device is still connected
    pub async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }
}

#[async_trait]
impl Link for BleLink {
    async fn write_characteristic(&self, role: CharacteristicRole, payload: &[u8]) -> Result<()> {
        let characteristic = self.characteristic(role)?;
        let write_type = if characteristic.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        debug!("Writing to {role}: {:?}", String::from_utf8_lossy(payload));
        self.peripheral
            .write(characteristic, payload, write_type)
            .await
            .map_err(|e| RelayError::TransportWriteFailed(format!("{role}: {e}")))
    }

    async fn request_read(&self, role: CharacteristicRole) -> Result<()> {
        let characteristic = self.characteristic(role)?.clone();
        if !characteristic.properties.contains(CharPropFlags::READ) {
            return Err(RelayError::TransportReadFailed(format!(
                "{role} is not readable"
            )));
        }

        let peripheral = self.peripheral.clone();
        let sender = self.events.clone();
        tokio::spawn(async move {
            let value = peripheral
                .read(&characteristic)
                .await
                .map(Bytes::from)
                .map_err(|e| RelayError::TransportReadFailed(format!("{role}: {e}")));
            let _ = sender.send(LinkEvent::ValueUpdated { role, value });
        });

        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }

    fn resolved_roles(&self) -> HashMap<CharacteristicRole, Uuid> {
        self.characteristics
            .iter()
            .map(|(role, characteristic)| (*role, characteristic.uuid))
            .collect()
    }
}

impl Drop for BleLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

use crate::{
    ble::{BleLink, BleManager},
    correlator::{Correlator, PassiveSubscriber},
    error::{RelayError, Result},
    link::{Link, LinkEvent},
    protocol::{
        decode_saved_networks, decode_scan_results, decode_settings, decode_status,
        validate_settings, validate_ssid, validate_wifi_password,
    },
    sequencer::{Plan, Sequencer},
    session::Session,
    types::{
        CharacteristicRole, ConnectionOutcome, DeviceEvent, DeviceInfo, DeviceSettings,
        RelayConfig, RoleMap, ScannedNetwork, SessionState,
    },
};
use bytes::Bytes;
use std::sync::Arc;
use tokio::{
    sync::{mpsc, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// Main interface for configuring a WiFi relay over BLE
///
/// `RelayDevice` owns one BLE session. Each method runs one logical protocol
/// operation: it writes the command sequence the firmware expects, waits for
/// the correlated response where there is one, and decodes it.
///
/// Operations run one at a time. Every state change and decoded result is also
/// published on the event channel returned by [`RelayDevice::take_events`].
///
/// # Examples
///
/// ```no_run
/// use relaylink::RelayDevice;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let relay = RelayDevice::connect_first().await?;
///
///     for network in relay.scan_wifi().await? {
///         println!("{} ({} dBm)", network.ssid, network.signal_strength_dbm);
///     }
///
///     let outcome = relay.connect_wifi("Home", "correct horse").await?;
///     println!("Connected: {}", outcome.connected);
///
///     relay.shutdown_link().await?;
///     Ok(())
/// }
/// ```
pub struct RelayDevice<L: Link = BleLink> {
    link: Arc<L>,
    session: Arc<RwLock<Session>>,
    correlator: Arc<Correlator>,
    sequencer: Sequencer<L>,
    config: RelayConfig,
    device_info: Option<DeviceInfo>,
    events: mpsc::UnboundedSender<DeviceEvent>,
    event_receiver: Option<mpsc::UnboundedReceiver<DeviceEvent>>,
    operation_lock: Mutex<()>,
    dispatcher: JoinHandle<()>,
}

impl RelayDevice<BleLink> {
    /// Connect to the strongest relay in range with default settings
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::DeviceNotFound`] if no relay is found during the
    /// scan, or any connection error from [`RelayDevice::connect_to_device`].
    pub async fn connect_first() -> Result<Self> {
        Self::connect_first_with_config(RelayConfig::default()).await
    }

    /// Connect to the strongest relay in range
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use relaylink::{RelayConfig, RelayDevice, RoleMap};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let config = RelayConfig {
    ///         role_map: RoleMap::generation_two(),
    ///         ..Default::default()
    ///     };
    ///     let relay = RelayDevice::connect_first_with_config(config).await?;
    ///     println!("Saved: {:?}", relay.list_saved_networks().await?);
    ///     Ok(())
    /// }
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidConfiguration`] for an unusable role map,
    /// [`RelayError::DeviceNotFound`] if no relay is found, or any connection error.
    pub async fn connect_first_with_config(config: RelayConfig) -> Result<Self> {
        config.role_map.validate()?;

        let manager = BleManager::new().await?;
        let devices = manager
            .scan_for_devices(&config.connection, &config.role_map)
            .await?;

        let device_info = devices
            .into_iter()
            .max_by_key(|device| device.rssi)
            .ok_or(RelayError::DeviceNotFound)?;

        Self::connect_to_device(&manager, device_info, config).await
    }

    /// Connect to a relay previously found by `manager`
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidConfiguration`] for an unusable role map,
    /// [`RelayError::Timeout`] or [`RelayError::ConnectionFailed`] if the link
    /// cannot be established, or [`RelayError::CharacteristicsNotResolved`] if
    /// the device lacks a required characteristic.
    pub async fn connect_to_device(
        manager: &BleManager,
        device_info: DeviceInfo,
        config: RelayConfig,
    ) -> Result<Self> {
        config.role_map.validate()?;

        let (events, event_receiver) = mpsc::unbounded_channel();
        let mut session = Session::new(events.clone());
        session.begin_connect();

        let peripheral = match manager.connect(&device_info, &config.connection).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                session.handle_disconnect();
                return Err(e);
            }
        };

        session.begin_discovery();
        let (link, link_events) = match manager.open_link(peripheral, &config.role_map).await {
            Ok(opened) => opened,
            Err(e) => {
                session.handle_disconnect();
                return Err(e);
            }
        };

        let mut device = Self::assemble(link, link_events, config, session, events, event_receiver);
        device.device_info = Some(device_info);

        if let Err(e) = device.resolve().await {
            device.disconnect().await?;
            return Err(e);
        }

        info!("Relay ready");
        Ok(device)
    }
}

impl<L: Link> RelayDevice<L> {
    /// Drive the engine over an already connected link
    ///
    /// `link_events` must carry the link's value updates and disconnects. If a
    /// required role is missing the device stays in
    /// [`SessionState::ServiceDiscovery`] and every operation fails with
    /// [`RelayError::CharacteristicsNotResolved`].
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidConfiguration`] for an unusable role map.
    pub async fn attach(
        link: L,
        link_events: mpsc::UnboundedReceiver<LinkEvent>,
        config: RelayConfig,
    ) -> Result<Self> {
        config.role_map.validate()?;

        let (events, event_receiver) = mpsc::unbounded_channel();
        let mut session = Session::new(events.clone());
        session.begin_connect();
        session.begin_discovery();

        let device = Self::assemble(link, link_events, config, session, events, event_receiver);
        if let Err(e) = device.resolve().await {
            warn!("Link attached without required characteristics: {e}");
        }

        Ok(device)
    }

    fn assemble(
        link: L,
        link_events: mpsc::UnboundedReceiver<LinkEvent>,
        config: RelayConfig,
        session: Session,
        events: mpsc::UnboundedSender<DeviceEvent>,
        event_receiver: mpsc::UnboundedReceiver<DeviceEvent>,
    ) -> Self {
        let link = Arc::new(link);
        let session = Arc::new(RwLock::new(session));
        let correlator = Arc::new(Correlator::new(passive_subscriber(
            events.clone(),
            config.role_map.clone(),
        )));
        let sequencer = Sequencer::new(
            link.clone(),
            correlator.clone(),
            session.clone(),
            config.pacing.response_timeout(),
        );
        let dispatcher = tokio::spawn(dispatch(link_events, session.clone(), correlator.clone()));

        Self {
            link,
            session,
            correlator,
            sequencer,
            config,
            device_info: None,
            events,
            event_receiver: Some(event_receiver),
            operation_lock: Mutex::new(()),
            dispatcher,
        }
    }

    async fn resolve(&self) -> Result<()> {
        let found = self.link.resolved_roles();
        self.session
            .write()
            .await
            .resolve(&found, &self.config.role_map)
    }

    /// Take the event stream; only the first call returns it
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<DeviceEvent>> {
        self.event_receiver.take()
    }

    /// Information about the connected device, when connected over BLE
    #[must_use]
    pub const fn device_info(&self) -> Option<&DeviceInfo> {
        self.device_info.as_ref()
    }

    /// Engine configuration
    #[must_use]
    pub const fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Current session state
    pub async fn state(&self) -> SessionState {
        self.session.read().await.state()
    }

    /// Whether operations are accepted
    pub async fn is_ready(&self) -> bool {
        self.state().await == SessionState::Ready
    }

    fn emit(&self, event: DeviceEvent) {
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }

    async fn run(&self, plan: Plan) -> Result<Option<Bytes>> {
        let _operation = self.operation_lock.lock().await;
        self.sequencer.run(&plan).await
    }

    async fn run_for_response(&self, plan: Plan) -> Result<Bytes> {
        let name = plan.name();
        self.run(plan)
            .await?
            .ok_or_else(|| RelayError::InvalidResponse(format!("{name} produced no response")))
    }

    /// Ask the relay to scan for WiFi networks
    ///
    /// Malformed records in the device's answer are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::CharacteristicsNotResolved`] before the session is
    /// ready, transport errors, [`RelayError::Timeout`] if the device stays
    /// silent, or [`RelayError::Cancelled`] if the link drops.
    pub async fn scan_wifi(&self) -> Result<Vec<ScannedNetwork>> {
        let payload = self
            .run_for_response(Plan::scan_wifi(&self.config.pacing))
            .await?;
        let networks = decode_scan_results(&payload);

        info!("WiFi scan found {} network(s)", networks.len());
        self.emit(DeviceEvent::ScanResults(networks.clone()));
        Ok(networks)
    }

    /// Connect the relay to a WiFi network and report the outcome
    ///
    /// The SSID is selected and committed before the password is sent. An
    /// empty password is accepted for open networks.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ValidationFailed`] for an unusable SSID or password
    /// (nothing is written), or any error described for [`RelayDevice::scan_wifi`].
    pub async fn connect_wifi(&self, ssid: &str, password: &str) -> Result<ConnectionOutcome> {
        validate_ssid(ssid)?;
        validate_wifi_password(password)?;

        info!("Connecting relay to WiFi network {ssid:?}");
        let plan = Plan::connect_wifi(ssid, password, &self.config.pacing, &self.config.role_map);
        let payload = self.run_for_response(plan).await?;
        let outcome = decode_status(&payload);

        if outcome.connected {
            info!("Relay connected: {}", outcome.status);
        } else {
            warn!("Relay not connected: {:?}", outcome.status);
        }
        self.emit(DeviceEvent::StatusChanged(outcome.status.clone()));
        Ok(outcome)
    }

    /// Read the relay's access point settings
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidResponse`] if the answer has fewer than four
    /// fields, or any error described for [`RelayDevice::scan_wifi`].
    pub async fn read_settings(&self) -> Result<DeviceSettings> {
        let payload = self
            .run_for_response(Plan::read_settings(&self.config.pacing))
            .await?;
        let settings = decode_settings(&payload)?;

        info!(
            "Read settings: AP {:?}, channel {}, power {}, firmware {}",
            settings.ap_name, settings.wifi_channel, settings.transmit_power, settings.firmware_version
        );
        self.emit(DeviceEvent::Settings(settings.clone()));
        Ok(settings)
    }

    /// Write the relay's access point settings
    ///
    /// The firmware does not confirm the write. Firmware version and device id
    /// are never sent.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ValidationFailed`] for out-of-range values or
    /// delimiters in text fields (nothing is written), or any error described
    /// for [`RelayDevice::scan_wifi`].
    pub async fn write_settings(&self, settings: &DeviceSettings) -> Result<()> {
        validate_settings(settings)?;

        info!("Writing settings for AP {:?}", settings.ap_name);
        self.run(Plan::write_settings(settings, &self.config.pacing))
            .await?;
        Ok(())
    }

    /// List the networks the relay firmware remembers
    ///
    /// # Errors
    ///
    /// Returns any error described for [`RelayDevice::scan_wifi`].
    pub async fn list_saved_networks(&self) -> Result<Vec<String>> {
        let payload = self
            .run_for_response(Plan::list_saved_networks(&self.config.pacing))
            .await?;
        let networks = decode_saved_networks(&payload);

        info!("Relay remembers {} network(s)", networks.len());
        self.emit(DeviceEvent::SavedNetworks(networks.clone()));
        Ok(networks)
    }

    /// Make the relay forget a saved network
    ///
    /// The firmware does not confirm the removal.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ValidationFailed`] for an unusable SSID, or any
    /// error described for [`RelayDevice::scan_wifi`].
    pub async fn forget_network(&self, ssid: &str) -> Result<()> {
        validate_ssid(ssid)?;

        info!("Forgetting network {ssid:?}");
        self.run(Plan::forget_network(ssid, &self.config.pacing))
            .await?;
        Ok(())
    }

    /// Disconnect the relay from its upstream WiFi network
    ///
    /// With `shutdown_all` the firmware also stops its other radio services.
    ///
    /// # Errors
    ///
    /// Returns any error described for [`RelayDevice::scan_wifi`].
    pub async fn disconnect_wifi(&self, shutdown_all: bool) -> Result<()> {
        info!("Disconnecting relay from WiFi (shutdown all: {shutdown_all})");
        self.run(Plan::disconnect_wifi(shutdown_all)).await?;
        Ok(())
    }

    /// Stop the firmware's Bluetooth task and end the session
    ///
    /// # Errors
    ///
    /// Returns errors from sending `CLOSEBTTASK` or from dropping the link. A
    /// device that drops the link on its own during the grace delay is not an error.
    pub async fn shutdown_link(&self) -> Result<()> {
        info!("Shutting down relay Bluetooth task");
        match self.run(Plan::shutdown_link(&self.config.pacing)).await {
            Ok(_) | Err(RelayError::Cancelled) => {}
            Err(e) => return Err(e),
        }
        self.disconnect().await
    }

    /// Drop the link and end the session
    ///
    /// Any operation still waiting for a response fails with
    /// [`RelayError::Cancelled`].
    ///
    /// # Errors
    ///
    /// Returns transport errors raised while disconnecting; the session is
    /// torn down regardless.
    pub async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting from device");
        let result = self.link.disconnect().await;
        teardown(&self.session, &self.correlator).await;
        result
    }
}

impl<L: Link> Drop for RelayDevice<L> {
    fn drop(&mut self) {
        self.dispatcher.abort();

        let connected = self
            .session
            .try_read()
            .map_or(true, |session| session.state().is_connected());
        if !connected {
            return;
        }

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let link = self.link.clone();
            runtime.spawn(async move {
                let _ = link.disconnect().await;
            });
        }
    }
}

fn passive_subscriber(
    events: mpsc::UnboundedSender<DeviceEvent>,
    role_map: RoleMap,
) -> PassiveSubscriber {
    let status_role = role_map.route(CharacteristicRole::StatusOut);

    Box::new(move |role, payload| {
        let event = match role {
            CharacteristicRole::DataOut => {
                let networks = decode_scan_results(&payload);
                if !networks.is_empty() {
                    DeviceEvent::ScanResults(networks)
                } else if status_role == CharacteristicRole::DataOut {
                    DeviceEvent::StatusChanged(decode_status(&payload).status)
                } else {
                    // Late copy of a settings or saved-networks read
                    debug!("Dropping unsolicited {role} value with no scan records");
                    return;
                }
            }
            CharacteristicRole::StatusOut => {
                DeviceEvent::StatusChanged(decode_status(&payload).status)
            }
            CharacteristicRole::CommandIn | CharacteristicRole::DataIn => {
                debug!("Ignoring pushed value on {role}");
                return;
            }
        };
        let _ = events.send(event);
    })
}

async fn dispatch(
    mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
    session: Arc<RwLock<Session>>,
    correlator: Arc<Correlator>,
) {
    while let Some(event) = link_events.recv().await {
        match event {
            LinkEvent::ValueUpdated { role, value } => {
                correlator.deliver(role, value).await;
            }
            LinkEvent::Disconnected => teardown(&session, &correlator).await,
        }
    }

    debug!("Link event stream closed");
    teardown(&session, &correlator).await;
}

/// Leave `Ready` first so new waiters see the drop, then cancel the old ones
async fn teardown(session: &RwLock<Session>, correlator: &Correlator) {
    let previous = session.write().await.handle_disconnect();
    let cancelled = correlator.cancel_all().await;

    if previous != SessionState::Disconnected {
        warn!("Session ended from state {previous}; cancelled {cancelled} pending operation(s)");
    }
}

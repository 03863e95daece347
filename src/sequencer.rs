use bytes::Bytes;
use std::{sync::Arc, time::Duration};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::{
    correlator::Correlator,
    error::{RelayError, Result},
    link::Link,
    protocol::{encode_command, encode_settings, encode_text, Command},
    session::Session,
    types::{CharacteristicRole, DeviceSettings, PacingConfig, RoleMap, SessionState},
};

/// One protocol step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Write `payload` to `role`, then wait `post_delay`
    Write {
        /// Target role
        role: CharacteristicRole,
        /// Encoded bytes
        payload: Bytes,
        /// Pacing delay before the next step
        post_delay: Duration,
    },
    /// Request a read of `role` and wait for the correlated value
    AwaitRead {
        /// Role the result arrives on
        role: CharacteristicRole,
    },
}

/// Ordered steps implementing one logical operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    name: &'static str,
    steps: Vec<Step>,
}

impl Plan {
    /// Start an empty plan
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            steps: Vec::new(),
        }
    }

    /// Append a write step
    #[must_use]
    pub fn write(mut self, role: CharacteristicRole, payload: Bytes, post_delay: Duration) -> Self {
        self.steps.push(Step::Write {
            role,
            payload,
            post_delay,
        });
        self
    }

    /// Append a command write to `CommandIn`
    #[must_use]
    pub fn command(self, command: Command, post_delay: Duration) -> Self {
        self.write(
            CharacteristicRole::CommandIn,
            encode_command(command),
            post_delay,
        )
    }

    /// Append a correlated read step
    #[must_use]
    pub fn read(mut self, role: CharacteristicRole) -> Self {
        self.steps.push(Step::AwaitRead { role });
        self
    }

    /// Operation name, for logging
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Steps in execution order
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Whether the plan ends by waiting for a device response
    #[must_use]
    pub fn expects_response(&self) -> bool {
        matches!(self.steps.last(), Some(Step::AwaitRead { .. }))
    }

    fn roles(&self) -> impl Iterator<Item = CharacteristicRole> + '_ {
        self.steps.iter().map(|step| match step {
            Step::Write { role, .. } | Step::AwaitRead { role } => *role,
        })
    }

    /// `GETSSIDLIST`, then read the results from `DataOut`
    #[must_use]
    pub fn scan_wifi(pacing: &PacingConfig) -> Self {
        Self::new("scan WiFi")
            .command(Command::GetSsidList, pacing.scan_read_delay())
            .read(CharacteristicRole::DataOut)
    }

    /// Select the SSID, store the password, connect, then read the status
    ///
    /// The SSID must be committed with `SETSELSSID` before the password is
    /// written, because both travel over `DataIn`.
    #[must_use]
    pub fn connect_wifi(
        ssid: &str,
        password: &str,
        pacing: &PacingConfig,
        role_map: &RoleMap,
    ) -> Self {
        let chained = pacing.chained_write_delay();
        Self::new("connect WiFi")
            .write(CharacteristicRole::DataIn, encode_text(ssid), chained)
            .command(Command::SetSelSsid, chained)
            .write(CharacteristicRole::DataIn, encode_text(password), chained)
            .command(Command::StorePword, chained)
            .command(Command::ConnectWifi, pacing.status_read_delay())
            .read(role_map.route(CharacteristicRole::StatusOut))
    }

    /// `READSETTINGS`, then read the settings from `DataOut`
    #[must_use]
    pub fn read_settings(pacing: &PacingConfig) -> Self {
        Self::new("read settings")
            .command(Command::ReadSettings, pacing.result_read_delay())
            .read(CharacteristicRole::DataOut)
    }

    /// Write the encoded settings, then `WRITESETTINGS`; no confirmation is read
    #[must_use]
    pub fn write_settings(settings: &DeviceSettings, pacing: &PacingConfig) -> Self {
        Self::new("write settings")
            .write(
                CharacteristicRole::DataIn,
                encode_settings(settings),
                pacing.chained_write_delay(),
            )
            .command(Command::WriteSettings, Duration::ZERO)
    }

    /// `GETNETWORKS`, then read the list from `DataOut`
    #[must_use]
    pub fn list_saved_networks(pacing: &PacingConfig) -> Self {
        Self::new("list saved networks")
            .command(Command::GetNetworks, pacing.result_read_delay())
            .read(CharacteristicRole::DataOut)
    }

    /// Write the SSID, then `FORGETNETWORK`; no confirmation is read
    #[must_use]
    pub fn forget_network(ssid: &str, pacing: &PacingConfig) -> Self {
        Self::new("forget network")
            .write(
                CharacteristicRole::DataIn,
                encode_text(ssid),
                pacing.chained_write_delay(),
            )
            .command(Command::ForgetNetwork, Duration::ZERO)
    }

    /// `SHUTDOWNALL` or `DISCONNECT`
    #[must_use]
    pub fn disconnect_wifi(shutdown_all: bool) -> Self {
        let command = if shutdown_all {
            Command::ShutdownAll
        } else {
            Command::Disconnect
        };
        Self::new("disconnect WiFi").command(command, Duration::ZERO)
    }

    /// `CLOSEBTTASK`, then give the firmware time before the link is dropped
    #[must_use]
    pub fn shutdown_link(pacing: &PacingConfig) -> Self {
        Self::new("shutdown link").command(Command::CloseBtTask, pacing.shutdown_delay())
    }
}

/// Executes plans strictly in order over a [`Link`]
pub struct Sequencer<L: Link> {
    link: Arc<L>,
    correlator: Arc<Correlator>,
    session: Arc<RwLock<Session>>,
    response_timeout: Duration,
}

impl<L: Link> Sequencer<L> {
    /// Create a sequencer sharing the device's link, correlator and session
    #[must_use]
    pub const fn new(
        link: Arc<L>,
        correlator: Arc<Correlator>,
        session: Arc<RwLock<Session>>,
        response_timeout: Duration,
    ) -> Self {
        Self {
            link,
            correlator,
            session,
            response_timeout,
        }
    }

    /// Run `plan` and return the value of its final read, if it has one
    ///
    /// Every role the plan uses is checked before anything is written. Writes
    /// already sent are not undone if a later step fails.
    ///
    /// # Errors
    ///
    /// Returns the first error met: [`RelayError::CharacteristicsNotResolved`]
    /// before any write, a transport error, [`RelayError::Cancelled`] if the
    /// session drops, or [`RelayError::Timeout`] if the response never arrives.
    pub async fn run(&self, plan: &Plan) -> Result<Option<Bytes>> {
        let mut state = {
            let session = self.session.read().await;
            session.ensure_ready()?;
            for role in plan.roles() {
                session.ensure_resolved(role)?;
            }
            session.watch()
        };

        info!("Running operation: {}", plan.name());
        let mut response = None;

        for step in plan.steps() {
            ensure_live(&state)?;
            match step {
                Step::Write {
                    role,
                    payload,
                    post_delay,
                } => {
                    debug!("{}: writing {} byte(s) to {role}", plan.name(), payload.len());
                    self.link.write_characteristic(*role, payload).await?;
                    pause(*post_delay, &mut state).await?;
                }
                Step::AwaitRead { role } => {
                    response = Some(self.await_read(*role, &state).await?);
                }
            }
        }

        info!("Operation finished: {}", plan.name());
        Ok(response)
    }

    async fn await_read(
        &self,
        role: CharacteristicRole,
        state: &watch::Receiver<SessionState>,
    ) -> Result<Bytes> {
        let waiter = self.correlator.register(role).await?;
        let id = waiter.id();

        // A disconnect may have cancelled all waiters just before this one registered.
        if let Err(e) = ensure_live(state) {
            self.correlator.abandon(role, id).await;
            return Err(e);
        }

        if let Err(e) = self.link.request_read(role).await {
            self.correlator.abandon(role, id).await;
            return Err(e);
        }

        match waiter.wait(self.response_timeout).await {
            Ok(value) => Ok(value),
            Err(e) => {
                if matches!(e, RelayError::Timeout { .. }) {
                    warn!("No response on {role} within {:?}", self.response_timeout);
                    self.correlator.abandon(role, id).await;
                }
                Err(e)
            }
        }
    }
}

fn ensure_live(state: &watch::Receiver<SessionState>) -> Result<()> {
    if *state.borrow() == SessionState::Ready {
        Ok(())
    } else {
        Err(RelayError::Cancelled)
    }
}

/// Sleep for a pacing delay, cut short only by the session leaving `Ready`
async fn pause(delay: Duration, state: &mut watch::Receiver<SessionState>) -> Result<()> {
    if delay.is_zero() {
        return Ok(());
    }

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            () = &mut sleep => return Ok(()),
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() != SessionState::Ready {
                    return Err(RelayError::Cancelled);
                }
            }
        }
    }
}

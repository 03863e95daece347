use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use uuid::Uuid;

use crate::{error::Result, types::CharacteristicRole};

/// Asynchronous events a link delivers to the engine
#[derive(Debug)]
pub enum LinkEvent {
    /// A characteristic value arrived, either pushed or in answer to a read
    ValueUpdated {
        /// Role of the characteristic that changed
        role: CharacteristicRole,
        /// New value, or the transport error that replaced it
        value: Result<Bytes>,
    },
    /// The transport dropped the connection
    Disconnected,
}

/// A connected, characteristic-resolved transport to one relay
///
/// Implementations deliver value updates and disconnects as [`LinkEvent`]s on
/// a channel handed to [`crate::RelayDevice::attach`]. A read completion and a
/// notification look the same to the engine.
#[async_trait]
pub trait Link: Send + Sync + 'static {
    /// Write `payload` to the characteristic playing `role`
    ///
    /// # Errors
    ///
    /// Returns [`crate::RelayError::CharacteristicsNotResolved`] if the role has no
    /// characteristic, or [`crate::RelayError::TransportWriteFailed`] if the write
    /// is rejected.
    async fn write_characteristic(&self, role: CharacteristicRole, payload: &[u8]) -> Result<()>;

    /// Ask for a fresh value of `role`; it arrives later as a [`LinkEvent`]
    ///
    /// # Errors
    ///
    /// Returns [`crate::RelayError::CharacteristicsNotResolved`] if the role has no
    /// characteristic, or [`crate::RelayError::TransportReadFailed`] if the read
    /// cannot be started.
    async fn request_read(&self, role: CharacteristicRole) -> Result<()>;

    /// Drop the transport connection
    ///
    /// # Errors
    ///
    /// Returns transport errors raised while disconnecting.
    async fn disconnect(&self) -> Result<()>;

    /// Characteristics resolved during service discovery, by role
    fn resolved_roles(&self) -> HashMap<CharacteristicRole, Uuid>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scriptable in-memory link for engine tests.

    use super::{Link, LinkEvent};
    use crate::{
        error::{RelayError, Result},
        types::{CharacteristicRole, RoleMap},
    };
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::{
        collections::{HashMap, VecDeque},
        sync::{Arc, Mutex},
    };
    use tokio::sync::mpsc;
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Recorded {
        Write(CharacteristicRole, String),
        Read(CharacteristicRole),
        Disconnect,
    }

    #[derive(Default)]
    struct Script {
        log: Vec<Recorded>,
        replies: HashMap<CharacteristicRole, VecDeque<Bytes>>,
        failing_writes: Vec<String>,
    }

    /// Records every call and answers reads from scripted replies.
    ///
    /// A read with no scripted reply gets no answer, like a silent device.
    #[derive(Clone)]
    pub(crate) struct MockLink {
        roles: HashMap<CharacteristicRole, Uuid>,
        events: mpsc::UnboundedSender<LinkEvent>,
        script: Arc<Mutex<Script>>,
    }

    impl MockLink {
        pub(crate) fn new(role_map: &RoleMap) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
            let roles = role_map
                .characteristics
                .iter()
                .map(|(role, uuid)| (*role, *uuid))
                .collect();
            Self::with_roles(roles)
        }

        pub(crate) fn with_roles(
            roles: HashMap<CharacteristicRole, Uuid>,
        ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
            let (events, receiver) = mpsc::unbounded_channel();
            let link = Self {
                roles,
                events,
                script: Arc::new(Mutex::new(Script::default())),
            };
            (link, receiver)
        }

        pub(crate) fn reply(&self, role: CharacteristicRole, value: &str) {
            self.script
                .lock()
                .unwrap()
                .replies
                .entry(role)
                .or_default()
                .push_back(Bytes::copy_from_slice(value.as_bytes()));
        }

        pub(crate) fn fail_write_of(&self, payload: &str) {
            self.script
                .lock()
                .unwrap()
                .failing_writes
                .push(payload.to_string());
        }

        pub(crate) fn push(&self, role: CharacteristicRole, value: &str) {
            let _ = self.events.send(LinkEvent::ValueUpdated {
                role,
                value: Ok(Bytes::copy_from_slice(value.as_bytes())),
            });
        }

        pub(crate) fn drop_connection(&self) {
            let _ = self.events.send(LinkEvent::Disconnected);
        }

        pub(crate) fn log(&self) -> Vec<Recorded> {
            self.script.lock().unwrap().log.clone()
        }

        pub(crate) fn writes(&self) -> Vec<(CharacteristicRole, String)> {
            self.log()
                .into_iter()
                .filter_map(|entry| match entry {
                    Recorded::Write(role, payload) => Some((role, payload)),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl Link for MockLink {
        async fn write_characteristic(
            &self,
            role: CharacteristicRole,
            payload: &[u8],
        ) -> Result<()> {
            if !self.roles.contains_key(&role) {
                return Err(RelayError::CharacteristicsNotResolved { role });
            }
            let text = String::from_utf8_lossy(payload).to_string();
            let mut script = self.script.lock().unwrap();
            if script.failing_writes.contains(&text) {
                return Err(RelayError::TransportWriteFailed(format!(
                    "write of {text:?} rejected"
                )));
            }
            script.log.push(Recorded::Write(role, text));
            Ok(())
        }

        async fn request_read(&self, role: CharacteristicRole) -> Result<()> {
            if !self.roles.contains_key(&role) {
                return Err(RelayError::CharacteristicsNotResolved { role });
            }
            let reply = {
                let mut script = self.script.lock().unwrap();
                script.log.push(Recorded::Read(role));
                script.replies.get_mut(&role).and_then(VecDeque::pop_front)
            };
            if let Some(value) = reply {
                let _ = self.events.send(LinkEvent::ValueUpdated {
                    role,
                    value: Ok(value),
                });
            }
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            self.script.lock().unwrap().log.push(Recorded::Disconnect);
            let _ = self.events.send(LinkEvent::Disconnected);
            Ok(())
        }

        fn resolved_roles(&self) -> HashMap<CharacteristicRole, Uuid> {
            self.roles.clone()
        }
    }
}

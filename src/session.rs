use std::collections::HashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{RelayError, Result},
    types::{CharacteristicRole, DeviceEvent, RoleMap, SessionState},
};

/// Connection lifecycle and resolved characteristics of one device session
///
/// Every transition is published on a watch channel (used by the sequencer to
/// abort pacing delays) and as a [`DeviceEvent::ConnectionStateChanged`].
pub struct Session {
    state: SessionState,
    resolved: HashMap<CharacteristicRole, Uuid>,
    state_tx: watch::Sender<SessionState>,
    events: mpsc::UnboundedSender<DeviceEvent>,
}

impl Session {
    /// Create a disconnected session reporting to `events`
    #[must_use]
    pub fn new(events: mpsc::UnboundedSender<DeviceEvent>) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            state: SessionState::Disconnected,
            resolved: HashMap::new(),
            state_tx,
            events,
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Receiver that observes every state transition
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Resolved characteristic for `role`
    #[must_use]
    pub fn characteristic(&self, role: CharacteristicRole) -> Option<Uuid> {
        self.resolved.get(&role).copied()
    }

    fn transition(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        info!("Session state: {} -> {}", self.state, next);
        self.state = next;
        self.state_tx.send_replace(next);
        let _ = self.events.send(DeviceEvent::ConnectionStateChanged(next));
    }

    /// Mark the start of link establishment
    pub fn begin_connect(&mut self) {
        self.resolved.clear();
        self.transition(SessionState::Connecting);
    }

    /// Mark the link as up and characteristic resolution as started
    pub fn begin_discovery(&mut self) {
        self.transition(SessionState::ServiceDiscovery);
    }

    /// Record the characteristics found on the device
    ///
    /// Only roles present in `role_map` are kept. The session becomes `Ready`
    /// when every required role is resolved.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::CharacteristicsNotResolved`] naming the first
    /// required role that is missing; the session stays in `ServiceDiscovery`.
    pub fn resolve(
        &mut self,
        found: &HashMap<CharacteristicRole, Uuid>,
        role_map: &RoleMap,
    ) -> Result<()> {
        self.resolved = found
            .iter()
            .filter(|(role, uuid)| role_map.uuid_for(**role) == Some(**uuid))
            .map(|(role, uuid)| (*role, *uuid))
            .collect();

        if let Some(missing) = self.first_missing_required() {
            warn!("Required characteristic for {missing} not found on device");
            return Err(RelayError::CharacteristicsNotResolved { role: missing });
        }

        self.transition(SessionState::Ready);
        Ok(())
    }

    fn first_missing_required(&self) -> Option<CharacteristicRole> {
        CharacteristicRole::REQUIRED
            .into_iter()
            .find(|role| !self.resolved.contains_key(role))
    }

    /// Fail unless the session accepts operations
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::CharacteristicsNotResolved`] naming the first
    /// required role not yet resolved if the session is not `Ready`.
    pub fn ensure_ready(&self) -> Result<()> {
        if self.state == SessionState::Ready {
            return Ok(());
        }

        // Outside `Ready` at least one required role is unresolved
        let role = self
            .first_missing_required()
            .unwrap_or(CharacteristicRole::CommandIn);
        debug!("Operation rejected in state {}: {role} not resolved", self.state);
        Err(RelayError::CharacteristicsNotResolved { role })
    }

    /// Fail unless the session is `Ready` and `role` is resolved
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::CharacteristicsNotResolved`] naming `role`.
    pub fn ensure_resolved(&self, role: CharacteristicRole) -> Result<()> {
        if self.state == SessionState::Ready && self.resolved.contains_key(&role) {
            Ok(())
        } else {
            Err(RelayError::CharacteristicsNotResolved { role })
        }
    }

    /// Tear the session down after a transport disconnect, from any state
    ///
    /// Returns the state the session was in.
    pub fn handle_disconnect(&mut self) -> SessionState {
        let previous = self.state;
        self.resolved.clear();
        self.transition(SessionState::Disconnected);
        previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_roles(map: &RoleMap) -> HashMap<CharacteristicRole, Uuid> {
        map.characteristics
            .iter()
            .map(|(role, uuid)| (*role, *uuid))
            .collect()
    }

    #[test]
    fn test_lifecycle_to_ready_and_back() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new(tx);
        let map = RoleMap::generation_one();

        assert!(session.ensure_ready().is_err());

        session.begin_connect();
        session.begin_discovery();
        session.resolve(&full_roles(&map), &map).unwrap();

        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.ensure_ready().is_ok());
        assert!(session.ensure_resolved(CharacteristicRole::StatusOut).is_ok());

        assert_eq!(session.handle_disconnect(), SessionState::Ready);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.characteristic(CharacteristicRole::DataOut).is_none());

        let mut states = Vec::new();
        while let Ok(DeviceEvent::ConnectionStateChanged(state)) = rx.try_recv() {
            states.push(state);
        }
        assert_eq!(
            states,
            vec![
                SessionState::Connecting,
                SessionState::ServiceDiscovery,
                SessionState::Ready,
                SessionState::Disconnected,
            ]
        );
    }

    #[test]
    fn test_missing_required_role_blocks_ready() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = Session::new(tx);
        let map = RoleMap::generation_one();
        let mut roles = full_roles(&map);
        roles.remove(&CharacteristicRole::DataOut);

        session.begin_connect();
        session.begin_discovery();
        let result = session.resolve(&roles, &map);

        assert!(matches!(
            result,
            Err(RelayError::CharacteristicsNotResolved {
                role: CharacteristicRole::DataOut
            })
        ));
        assert_eq!(session.state(), SessionState::ServiceDiscovery);
        assert!(session.ensure_resolved(CharacteristicRole::CommandIn).is_err());
        assert!(matches!(
            session.ensure_ready(),
            Err(RelayError::CharacteristicsNotResolved {
                role: CharacteristicRole::DataOut
            })
        ));
    }

    #[test]
    fn test_not_ready_names_missing_role() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = Session::new(tx);
        let map = RoleMap::generation_one();
        let roles = HashMap::from([(
            CharacteristicRole::CommandIn,
            map.uuid_for(CharacteristicRole::CommandIn).unwrap(),
        )]);

        session.begin_connect();
        session.begin_discovery();
        assert!(session.resolve(&roles, &map).is_err());

        assert!(matches!(
            session.ensure_ready(),
            Err(RelayError::CharacteristicsNotResolved {
                role: CharacteristicRole::DataIn
            })
        ));
    }

    #[test]
    fn test_optional_status_role() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = Session::new(tx);
        let map = RoleMap::generation_two();

        session.begin_connect();
        session.begin_discovery();
        session.resolve(&full_roles(&map), &map).unwrap();

        assert!(session.ensure_resolved(CharacteristicRole::DataOut).is_ok());
        assert!(session.ensure_resolved(CharacteristicRole::StatusOut).is_err());
    }

    #[test]
    fn test_watch_observes_transitions() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = Session::new(tx);
        let watcher = session.watch();

        session.begin_connect();
        assert_eq!(*watcher.borrow(), SessionState::Connecting);

        session.handle_disconnect();
        assert_eq!(*watcher.borrow(), SessionState::Disconnected);
    }
}

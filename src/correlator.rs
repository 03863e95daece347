use bytes::Bytes;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::{
    error::{RelayError, Result},
    types::CharacteristicRole,
};

/// Callback receiving values that arrive with no waiter registered
pub type PassiveSubscriber = Box<dyn Fn(CharacteristicRole, Bytes) + Send + Sync>;

/// One in-flight request awaiting a device response
#[derive(Debug)]
struct PendingOperation {
    id: u64,
    completion: oneshot::Sender<Result<Bytes>>,
    created_at: Instant,
}

/// How a delivered value was routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// A registered waiter received the value
    Solicited,
    /// No waiter was registered; the passive subscriber received it
    Unsolicited,
}

/// Receiving half of a registered waiter
#[derive(Debug)]
pub struct Waiter {
    role: CharacteristicRole,
    id: u64,
    receiver: oneshot::Receiver<Result<Bytes>>,
}

impl Waiter {
    /// Role the waiter listens on
    #[must_use]
    pub const fn role(&self) -> CharacteristicRole {
        self.role
    }

    /// Registration id, used to abandon exactly this waiter
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the correlated value
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Timeout`] if nothing arrives within `timeout`, the
    /// delivered transport error, or [`RelayError::Cancelled`] if the waiter was
    /// cancelled or dropped by the correlator.
    pub async fn wait(self, timeout: Duration) -> Result<Bytes> {
        match tokio::time::timeout(timeout, self.receiver).await {
            Ok(Ok(value)) => value,
            Ok(Err(_)) => Err(RelayError::Cancelled),
            Err(_) => Err(RelayError::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

/// Routes inbound values to the single operation awaiting each role
///
/// Each role is either idle or awaiting exactly one waiter. A value arriving
/// on an awaiting role resolves that waiter; a value on an idle role goes to
/// the passive subscriber.
pub struct Correlator {
    pending: Mutex<HashMap<CharacteristicRole, PendingOperation>>,
    passive: PassiveSubscriber,
    next_id: AtomicU64,
}

impl Correlator {
    /// Create a correlator that hands unsolicited values to `passive`
    #[must_use]
    pub fn new(passive: PassiveSubscriber) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            passive,
            next_id: AtomicU64::new(1),
        }
    }

    /// Register the waiter for the next value on `role`
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::OperationInProgress`] if a waiter is already
    /// registered on `role`; the existing waiter is left untouched.
    pub async fn register(&self, role: CharacteristicRole) -> Result<Waiter> {
        let mut pending = self.pending.lock().await;
        if pending.contains_key(&role) {
            return Err(RelayError::OperationInProgress { role });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (completion, receiver) = oneshot::channel();
        pending.insert(
            role,
            PendingOperation {
                id,
                completion,
                created_at: Instant::now(),
            },
        );
        debug!("Registered waiter {id} on {role}");

        Ok(Waiter { role, id, receiver })
    }

    /// Route a value or transport error that arrived on `role`
    pub async fn deliver(&self, role: CharacteristicRole, value: Result<Bytes>) -> Delivery {
        let waiter = self.pending.lock().await.remove(&role);

        if let Some(operation) = waiter {
            debug!(
                "Resolving waiter {} on {role} after {:?}",
                operation.id,
                operation.created_at.elapsed()
            );
            if operation.completion.send(value).is_err() {
                debug!("Waiter {} on {role} was already gone", operation.id);
            }
            return Delivery::Solicited;
        }

        match value {
            Ok(bytes) => {
                debug!("Unsolicited value on {role}: {} byte(s)", bytes.len());
                (self.passive)(role, bytes);
            }
            Err(e) => warn!("Unsolicited transport error on {role}: {e}"),
        }
        Delivery::Unsolicited
    }

    /// Remove a waiter that gave up, if it is still the one registered
    pub async fn abandon(&self, role: CharacteristicRole, id: u64) {
        let mut pending = self.pending.lock().await;
        if pending.get(&role).is_some_and(|operation| operation.id == id) {
            pending.remove(&role);
            debug!("Abandoned waiter {id} on {role}");
        }
    }

    /// Resolve every outstanding waiter with [`RelayError::Cancelled`]
    pub async fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.pending.lock().await.drain().collect();
        let count = drained.len();

        for (role, operation) in drained {
            debug!("Cancelling waiter {} on {role}", operation.id);
            let _ = operation.completion.send(Err(RelayError::Cancelled));
        }

        count
    }

    /// Whether a waiter is registered on `role`
    pub async fn is_awaiting(&self, role: CharacteristicRole) -> bool {
        self.pending.lock().await.contains_key(&role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    fn recording_correlator() -> (Correlator, Arc<StdMutex<Vec<(CharacteristicRole, Bytes)>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let correlator = Correlator::new(Box::new(move |role, bytes| {
            sink.lock().unwrap().push((role, bytes));
        }));
        (correlator, seen)
    }

    #[tokio::test]
    async fn test_solicited_delivery_resolves_waiter() {
        let (correlator, seen) = recording_correlator();
        let waiter = correlator.register(CharacteristicRole::DataOut).await.unwrap();

        let delivery = correlator
            .deliver(CharacteristicRole::DataOut, Ok(Bytes::from_static(b"A;B")))
            .await;

        assert_eq!(delivery, Delivery::Solicited);
        let value = waiter.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(&value[..], b"A;B");
        assert!(seen.lock().unwrap().is_empty());
        assert!(!correlator.is_awaiting(CharacteristicRole::DataOut).await);
    }

    #[tokio::test]
    async fn test_unsolicited_delivery_goes_to_passive_subscriber() {
        let (correlator, seen) = recording_correlator();

        let delivery = correlator
            .deliver(
                CharacteristicRole::StatusOut,
                Ok(Bytes::from_static(b"Connected to Home")),
            )
            .await;

        assert_eq!(delivery, Delivery::Unsolicited);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, CharacteristicRole::StatusOut);
    }

    #[tokio::test]
    async fn test_second_register_fails_without_disturbing_first() {
        let (correlator, _) = recording_correlator();
        let first = correlator.register(CharacteristicRole::DataOut).await.unwrap();

        let second = correlator.register(CharacteristicRole::DataOut).await;
        assert!(matches!(
            second,
            Err(RelayError::OperationInProgress {
                role: CharacteristicRole::DataOut
            })
        ));

        correlator
            .deliver(CharacteristicRole::DataOut, Ok(Bytes::from_static(b"ok")))
            .await;
        let value = first.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(&value[..], b"ok");
    }

    #[tokio::test]
    async fn test_roles_are_independent() {
        let (correlator, _) = recording_correlator();
        let data = correlator.register(CharacteristicRole::DataOut).await.unwrap();
        let status = correlator.register(CharacteristicRole::StatusOut).await.unwrap();

        correlator
            .deliver(CharacteristicRole::StatusOut, Ok(Bytes::from_static(b"s")))
            .await;
        correlator
            .deliver(CharacteristicRole::DataOut, Ok(Bytes::from_static(b"d")))
            .await;

        assert_eq!(&status.wait(Duration::from_secs(1)).await.unwrap()[..], b"s");
        assert_eq!(&data.wait(Duration::from_secs(1)).await.unwrap()[..], b"d");
    }

    #[tokio::test]
    async fn test_cancel_all_resolves_waiters_with_cancelled() {
        let (correlator, _) = recording_correlator();
        let data = correlator.register(CharacteristicRole::DataOut).await.unwrap();
        let status = correlator.register(CharacteristicRole::StatusOut).await.unwrap();

        assert_eq!(correlator.cancel_all().await, 2);

        assert!(matches!(
            data.wait(Duration::from_secs(1)).await,
            Err(RelayError::Cancelled)
        ));
        assert!(matches!(
            status.wait(Duration::from_secs(1)).await,
            Err(RelayError::Cancelled)
        ));
        assert!(!correlator.is_awaiting(CharacteristicRole::DataOut).await);
    }

    #[tokio::test]
    async fn test_transport_error_reaches_waiter() {
        let (correlator, _) = recording_correlator();
        let waiter = correlator.register(CharacteristicRole::DataOut).await.unwrap();

        correlator
            .deliver(
                CharacteristicRole::DataOut,
                Err(RelayError::TransportReadFailed("gatt error".to_string())),
            )
            .await;

        assert!(matches!(
            waiter.wait(Duration::from_secs(1)).await,
            Err(RelayError::TransportReadFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_times_out_and_abandon_frees_role() {
        let (correlator, _) = recording_correlator();
        let waiter = correlator.register(CharacteristicRole::DataOut).await.unwrap();
        let id = waiter.id();

        let result = waiter.wait(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(RelayError::Timeout { timeout_ms: 10 })));
        assert!(correlator.is_awaiting(CharacteristicRole::DataOut).await);

        correlator.abandon(CharacteristicRole::DataOut, id + 1).await;
        assert!(correlator.is_awaiting(CharacteristicRole::DataOut).await);

        correlator.abandon(CharacteristicRole::DataOut, id).await;
        assert!(!correlator.is_awaiting(CharacteristicRole::DataOut).await);
        tokio_test::assert_ok!(correlator.register(CharacteristicRole::DataOut).await);
    }
}

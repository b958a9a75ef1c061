//! Single-flight guard for credential renewal.
//!
//! At most one renewal runs at a time. The first caller spawns it; everyone
//! arriving while it runs gets a clone of the same shared future. The renewal
//! body runs as its own task, so it settles even if every waiter goes away,
//! and it clears the slot when it ends.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::credentials::Credential;
use super::error::AuthError;
use crate::utils::lock;

pub type FlightOutcome = Result<Credential, AuthError>;

/// A renewal in progress, shared by every caller that joined it
pub type RefreshFlight = Shared<BoxFuture<'static, FlightOutcome>>;

struct ActiveFlight {
    id: u64,
    future: RefreshFlight,
}

#[derive(Default)]
pub(crate) struct FlightSlot {
    active: Arc<Mutex<Option<ActiveFlight>>>,
    next_id: AtomicU64,
}

impl FlightSlot {
    /// Join the active flight, or spawn a new one from `start`.
    /// Returns the flight and whether this call started it.
    pub(crate) fn join_or_start<F>(&self, start: F) -> (RefreshFlight, bool)
    where
        F: FnOnce(FlightGuard) -> JoinHandle<FlightOutcome>,
    {
        let mut active = lock(&self.active);
        if let Some(flight) = active.as_ref() {
            debug!(flight = flight.id, "Joining active refresh flight");
            return (flight.future.clone(), false);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let guard = FlightGuard {
            id,
            slot: Arc::clone(&self.active),
        };
        let handle = start(guard);
        let future = async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(flight = id, error = %e, "Refresh task did not complete");
                    Err(AuthError::RefreshFailed("renewal task aborted".to_string()))
                }
            }
        }
        .boxed()
        .shared();

        *active = Some(ActiveFlight {
            id,
            future: future.clone(),
        });
        debug!(flight = id, "Started refresh flight");
        (future, true)
    }

    pub(crate) fn is_active(&self) -> bool {
        lock(&self.active).is_some()
    }
}

/// Owned by the renewal task; tears the flight down when dropped, whether the
/// task finished, failed or panicked.
pub(crate) struct FlightGuard {
    id: u64,
    slot: Arc<Mutex<Option<ActiveFlight>>>,
}

impl FlightGuard {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut active = lock(&self.slot);
        if active.as_ref().map(|f| f.id) == Some(self.id) {
            *active = None;
            debug!(flight = self.id, "Refresh flight settled");
        }
    }
}

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::trace;

use super::credentials::Credential;
use crate::clock::Clock;
use crate::utils::{lock, read, write};

/// Profile of the signed-in user as reported by the identity service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, alias = "name")]
    pub display_name: Option<String>,
    /// Fields this crate does not interpret
    #[serde(flatten)]
    #[cfg_attr(feature = "ts", ts(skip))]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }
    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}

/// In-memory session record. Written only by the token manager.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub is_authenticated: bool,
    pub user: Option<UserProfile>,
    pub is_refreshing: bool,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Why a snapshot was published
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionChange {
    #[default]
    Initial,
    LoggedIn,
    Restored,
    Refreshing,
    Refreshed,
    /// Session was reset. `redirect` is the navigation hint passed to logout;
    /// it is published only after the reset has completed.
    LoggedOut { redirect: Option<String> },
    /// The credential ran out before it could be renewed
    Expired,
}

/// Immutable view of the session handed to observers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub is_authenticated: bool,
    pub is_refreshing: bool,
    pub is_expiring_soon: bool,
    pub user: Option<UserProfile>,
    pub last_activity: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub change: SessionChange,
}

impl SessionSnapshot {
    pub fn derive(
        session: &Session,
        credential: Option<&Credential>,
        now: DateTime<Utc>,
        lead_time: Duration,
        change: SessionChange,
    ) -> Self {
        Self {
            is_authenticated: session.is_authenticated,
            is_refreshing: session.is_refreshing,
            is_expiring_soon: session.is_authenticated
                && credential
                    .map(|c| c.is_expiring_soon(now, lead_time))
                    .unwrap_or(false),
            user: session.user.clone(),
            last_activity: session.last_activity,
            expires_at: credential.and_then(|c| c.expires_at),
            change,
        }
    }
}

type Listener = Arc<dyn Fn(&SessionSnapshot) + Send + Sync>;

struct PublisherInner {
    current: RwLock<SessionSnapshot>,
    listeners: Mutex<BTreeMap<u64, Listener>>,
    next_id: AtomicU64,
    watch_tx: watch::Sender<SessionSnapshot>,
    clock: Arc<dyn Clock>,
    lead_time: Duration,
}

/// Read-only view of the session for UI layers and resource clients.
///
/// Observers either register a callback with [`subscribe`](Self::subscribe)
/// or take a [`watch`](Self::watch) receiver. Listeners run synchronously on
/// the thread that changed the session, after the change is complete and
/// before the next change starts. A listener must not log in or out itself;
/// use the watch receiver to react with further transitions.
#[derive(Clone)]
pub struct SessionPublisher {
    inner: Arc<PublisherInner>,
}

impl SessionPublisher {
    pub fn new(clock: Arc<dyn Clock>, lead_time: Duration) -> Self {
        let (watch_tx, _) = watch::channel(SessionSnapshot::default());
        Self {
            inner: Arc::new(PublisherInner {
                current: RwLock::new(SessionSnapshot::default()),
                listeners: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
                watch_tx,
                clock,
                lead_time,
            }),
        }
    }

    /// Latest published snapshot
    pub fn current(&self) -> SessionSnapshot {
        read(&self.inner.current).clone()
    }

    pub fn is_authenticated(&self) -> bool {
        read(&self.inner.current).is_authenticated
    }

    pub fn is_refreshing(&self) -> bool {
        read(&self.inner.current).is_refreshing
    }

    /// Evaluated against the clock now, not at publish time
    pub fn is_expiring_soon(&self) -> bool {
        let snapshot = read(&self.inner.current);
        if !snapshot.is_authenticated {
            return false;
        }
        match snapshot.expires_at {
            Some(expiry) => {
                let remaining = expiry - self.inner.clock.now();
                remaining > Duration::zero() && remaining <= self.inner.lead_time
            }
            None => false,
        }
    }

    /// Register a listener. It is called once immediately with the current
    /// snapshot and then on every change until the subscription is dropped.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SessionSnapshot) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let listener: Listener = Arc::new(listener);
        lock(&self.inner.listeners).insert(id, Arc::clone(&listener));
        listener(&self.current());
        Subscription {
            id,
            publisher: Arc::downgrade(&self.inner),
        }
    }

    /// Async alternative to [`subscribe`](Self::subscribe)
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.watch_tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }

    pub(crate) fn publish(
        &self,
        session: &Session,
        credential: Option<&Credential>,
        change: SessionChange,
    ) -> SessionSnapshot {
        let snapshot = SessionSnapshot::derive(
            session,
            credential,
            self.inner.clock.now(),
            self.inner.lead_time,
            change,
        );
        *write(&self.inner.current) = snapshot.clone();
        self.inner.watch_tx.send_replace(snapshot.clone());

        // Listeners are called outside the registry lock so they may
        // unsubscribe or subscribe from inside the callback.
        let listeners: Vec<Listener> = lock(&self.inner.listeners).values().cloned().collect();
        trace!(listeners = listeners.len(), change = ?snapshot.change, "Publishing session snapshot");
        for listener in listeners {
            listener(&snapshot);
        }
        snapshot
    }
}

impl fmt::Debug for SessionPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPublisher")
            .field("current", &self.current())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Handle returned by [`SessionPublisher::subscribe`]. Dropping it unsubscribes.
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    publisher: Weak<PublisherInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.publisher.upgrade() {
            lock(&inner.listeners).remove(&self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn publisher(clock: Arc<ManualClock>) -> SessionPublisher {
        SessionPublisher::new(clock, Duration::seconds(600))
    }

    fn credential(now: DateTime<Utc>, expires_in: i64) -> Credential {
        Credential {
            access_token: "a".repeat(16),
            refresh_token: "r".repeat(16),
            token_type: "Bearer".to_string(),
            issued_at: now,
            expires_at: Some(now + Duration::seconds(expires_in)),
        }
    }

    #[test]
    fn test_subscribe_receives_current_then_updates() {
        let clock = Arc::new(ManualClock::default());
        let publisher = publisher(clock.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let subscription = publisher.subscribe(move |snapshot| {
            sink.lock().unwrap().push(snapshot.change.clone());
        });

        let session = Session {
            is_authenticated: true,
            ..Session::default()
        };
        publisher.publish(&session, None, SessionChange::LoggedIn);

        subscription.unsubscribe();
        publisher.publish(&Session::default(), None, SessionChange::LoggedOut { redirect: None });

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![SessionChange::Initial, SessionChange::LoggedIn]);
        assert_eq!(publisher.listener_count(), 0);
    }

    #[test]
    fn test_listener_may_unsubscribe_itself() {
        let clock = Arc::new(ManualClock::default());
        let publisher = publisher(clock);
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let inner_slot = Arc::clone(&slot);
        let subscription = publisher.subscribe(move |snapshot| {
            if snapshot.is_authenticated {
                inner_slot.lock().unwrap().take();
            }
        });
        *slot.lock().unwrap() = Some(subscription);

        let session = Session {
            is_authenticated: true,
            ..Session::default()
        };
        publisher.publish(&session, None, SessionChange::LoggedIn);
        assert_eq!(publisher.listener_count(), 0);
    }

    #[test]
    fn test_expiring_soon_is_derived_from_credential() {
        let clock = Arc::new(ManualClock::default());
        let publisher = publisher(clock.clone());
        let now = clock.now();
        let session = Session {
            is_authenticated: true,
            ..Session::default()
        };

        let snapshot = publisher.publish(&session, Some(&credential(now, 3600)), SessionChange::LoggedIn);
        assert!(snapshot.is_authenticated);
        assert!(!snapshot.is_expiring_soon);
        assert!(!publisher.is_expiring_soon());

        clock.advance(Duration::seconds(3550));
        assert!(publisher.is_expiring_soon());

        clock.advance(Duration::seconds(100));
        assert!(!publisher.is_expiring_soon());
    }

    #[tokio::test]
    async fn test_watch_receiver_sees_latest() {
        let clock = Arc::new(ManualClock::default());
        let publisher = publisher(clock);
        let mut rx = publisher.watch();

        let session = Session {
            is_authenticated: true,
            ..Session::default()
        };
        publisher.publish(&session, None, SessionChange::LoggedIn);

        rx.changed().await.unwrap();
        assert!(rx.borrow().is_authenticated);
    }

    #[test]
    fn test_user_profile_accepts_numeric_id() {
        let profile: UserProfile =
            serde_json::from_value(serde_json::json!({"id": 7, "name": "Ada", "role": "admin"})).unwrap();
        assert_eq!(profile.id, "7");
        assert_eq!(profile.display_name.as_deref(), Some("Ada"));
        assert_eq!(profile.extra.get("role").and_then(|v| v.as_str()), Some("admin"));
    }
}

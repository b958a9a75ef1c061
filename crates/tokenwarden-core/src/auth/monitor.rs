//! Expiry monitor.
//!
//! A background task that wakes on a fixed interval and compares the access
//! token's expiry against now + lead time. It only exists while a session is
//! authenticated and is replaced on every login and renewal.

use std::sync::Arc;

use chrono::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::manager::TokenManager;
use super::session::SessionChange;
use crate::utils::{lock, read};

/// Result of one expiry check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryCheck {
    /// No session; nothing to do
    Unauthenticated,
    /// Credential carries no expiry
    NoExpiry,
    /// Outside the renewal window
    Healthy,
    Refreshed,
    /// Renewal failed and the session was ended
    RefreshFailed,
    /// Credential was already unusable; session ended without renewal
    Expired,
}

impl ExpiryCheck {
    /// Whether a session is still in place after this check
    pub fn is_usable(self) -> bool {
        matches!(
            self,
            ExpiryCheck::NoExpiry | ExpiryCheck::Healthy | ExpiryCheck::Refreshed
        )
    }
}

impl TokenManager {
    /// Run one monitor check now
    pub async fn check_expiry(&self) -> ExpiryCheck {
        let (epoch, credential) = {
            let state = read(&self.inner.state);
            if !state.session.is_authenticated {
                return ExpiryCheck::Unauthenticated;
            }
            (state.epoch, state.credential.clone())
        };
        let Some(credential) = credential else {
            return ExpiryCheck::Unauthenticated;
        };
        let Some(remaining) = credential.time_until_expiry(self.now()) else {
            return ExpiryCheck::NoExpiry;
        };

        if remaining <= Duration::zero() {
            // Only end the session this check looked at; a renewal or logout
            // may have replaced it since.
            let ended = self.end_session_if(SessionChange::Expired, |state| {
                state.epoch == epoch
                    && state
                        .credential
                        .as_ref()
                        .map(|c| c.access_token == credential.access_token)
                        .unwrap_or(false)
            });
            if !ended {
                debug!("Credential replaced during expiry check");
                return if self.is_authenticated() {
                    ExpiryCheck::Healthy
                } else {
                    ExpiryCheck::Unauthenticated
                };
            }
            warn!(expired_for_secs = -remaining.num_seconds(), "Access token expired before renewal");
            return ExpiryCheck::Expired;
        }

        if remaining <= self.inner.settings.lead_time {
            info!(remaining_secs = remaining.num_seconds(), "Access token expiring soon, renewing");
            return if self.refresh().await {
                ExpiryCheck::Refreshed
            } else {
                ExpiryCheck::RefreshFailed
            };
        }

        debug!(remaining_secs = remaining.num_seconds(), "Access token healthy");
        ExpiryCheck::Healthy
    }

    pub fn monitor_running(&self) -> bool {
        lock(&self.inner.monitor)
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Replace any running monitor with a fresh one
    pub(super) fn start_monitor(&self) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.settings.monitor_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let manager = TokenManager { inner };
                let outcome = manager.check_expiry().await;
                debug!(?outcome, "Expiry monitor tick");
                if !outcome.is_usable() {
                    break;
                }
            }
        });

        if let Some(previous) = lock(&self.inner.monitor).replace(handle) {
            previous.abort();
        }
        debug!(interval_secs = period.as_secs(), "Expiry monitor started");
    }

    pub(super) fn stop_monitor(&self) {
        if let Some(handle) = lock(&self.inner.monitor).take() {
            handle.abort();
            debug!("Expiry monitor stopped");
        }
    }
}

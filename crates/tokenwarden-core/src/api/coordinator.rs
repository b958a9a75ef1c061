//! Request queue coordinator.
//!
//! Every authenticated call goes through [`RequestCoordinator::execute`]. The
//! current access token is attached; when the API answers 401, the call joins
//! a queue tied to one refresh flight. The first call to queue spawns a
//! flusher that waits for the flight and then either replays every queued call
//! once, in the order they queued, or rejects them all.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use super::error::RequestError;
use super::transport::{RequestDescriptor, Response, Transport};
use crate::auth::{AuthError, Credential, TokenManager};
use crate::utils::lock;

type Reply = oneshot::Sender<Result<Response, RequestError>>;

/// A call waiting for a refresh flight to settle
pub struct PendingRequest {
    pub descriptor: RequestDescriptor,
    pub enqueued_at: DateTime<Utc>,
    /// Dispatches made so far; the replay is the last one
    pub attempt_count: u32,
    reply: Reply,
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("method", &self.descriptor.method)
            .field("url", &self.descriptor.url)
            .field("enqueued_at", &self.enqueued_at)
            .field("attempt_count", &self.attempt_count)
            .finish()
    }
}

#[derive(Default)]
struct RefreshQueue {
    /// A flusher is waiting on a flight for the calls below
    awaiting_flight: bool,
    pending: VecDeque<PendingRequest>,
}

struct CoordinatorInner {
    manager: TokenManager,
    transport: Arc<dyn Transport>,
    queue: Mutex<RefreshQueue>,
}

enum Recovery {
    /// Token was already replaced while this call was in flight
    Retry(Credential),
    Wait(oneshot::Receiver<Result<Response, RequestError>>),
    Reject,
}

#[derive(Clone)]
pub struct RequestCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl RequestCoordinator {
    pub fn new(manager: TokenManager, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                manager,
                transport,
                queue: Mutex::new(RefreshQueue::default()),
            }),
        }
    }

    /// Number of calls currently waiting on a refresh
    pub fn queued(&self) -> usize {
        lock(&self.inner.queue).pending.len()
    }

    /// Send an authenticated request.
    ///
    /// Non-401 responses (including other error statuses) and transport
    /// errors are returned as they are. A 401 triggers at most one
    /// coordinated refresh and one retry for this call.
    pub async fn execute(&self, descriptor: RequestDescriptor) -> Result<Response, RequestError> {
        descriptor.validate()?;

        let credential = self
            .inner
            .manager
            .credential()
            .ok_or(RequestError::Authentication(AuthError::AuthenticationFailed))?;

        let response = self.dispatch(&descriptor, &credential).await?;
        if !response.is_unauthorized() {
            return Ok(response);
        }

        debug!(method = %descriptor.method, url = %descriptor.url, "Request unauthorized, waiting for refresh");
        self.recover(descriptor, &credential).await
    }

    async fn recover(
        &self,
        descriptor: RequestDescriptor,
        used: &Credential,
    ) -> Result<Response, RequestError> {
        let recovery = {
            let mut queue = lock(&self.inner.queue);
            match self.inner.manager.credential() {
                None => Recovery::Reject,
                Some(current) if current.access_token != used.access_token => Recovery::Retry(current),
                Some(_) => {
                    let (reply, rx) = oneshot::channel();
                    queue.pending.push_back(PendingRequest {
                        descriptor: descriptor.clone(),
                        enqueued_at: self.inner.manager.now(),
                        attempt_count: 1,
                        reply,
                    });
                    if queue.awaiting_flight {
                        debug!(queued = queue.pending.len(), "Queued behind active refresh");
                    } else {
                        queue.awaiting_flight = true;
                        let coordinator = self.clone();
                        tokio::spawn(async move { coordinator.flush_after_refresh().await });
                    }
                    Recovery::Wait(rx)
                }
            }
        };

        match recovery {
            Recovery::Reject => Err(RequestError::Authentication(AuthError::AuthenticationFailed)),
            Recovery::Retry(current) => {
                debug!(url = %descriptor.url, "Token already renewed, retrying with current token");
                self.retry(&descriptor, 2, &current).await
            }
            Recovery::Wait(rx) => rx
                .await
                .unwrap_or(Err(RequestError::Authentication(AuthError::SessionEnded))),
        }
    }

    /// Wait for the flight, then settle every call queued behind it
    async fn flush_after_refresh(self) {
        let outcome = self.inner.manager.refresh_credential().await;

        let pending: Vec<PendingRequest> = {
            let mut queue = lock(&self.inner.queue);
            queue.awaiting_flight = false;
            queue.pending.drain(..).collect()
        };

        // Replay with whatever is installed now. A logout after the flight
        // settled leaves nothing to replay with.
        let outcome = outcome.and_then(|_| {
            self.inner
                .manager
                .credential()
                .ok_or(AuthError::SessionEnded)
        });

        match outcome {
            Ok(credential) => {
                info!(count = pending.len(), "Refresh succeeded, replaying queued requests");
                // join_all polls in order, so replays are dispatched in queue order
                let replays = pending.into_iter().map(|request| {
                    let coordinator = self.clone();
                    let credential = credential.clone();
                    async move {
                        let PendingRequest {
                            descriptor,
                            attempt_count,
                            reply,
                            ..
                        } = request;
                        let result = coordinator
                            .retry(&descriptor, attempt_count + 1, &credential)
                            .await;
                        let _ = reply.send(result);
                    }
                });
                join_all(replays).await;
            }
            Err(e) => {
                warn!(count = pending.len(), error = %e, "Refresh failed, rejecting queued requests");
                for request in pending {
                    let _ = request
                        .reply
                        .send(Err(RequestError::Authentication(e.clone())));
                }
            }
        }
    }

    /// The one post-refresh attempt. A second 401 ends the session and is
    /// returned as an authentication error; it never starts another refresh.
    async fn retry(
        &self,
        descriptor: &RequestDescriptor,
        attempt: u32,
        credential: &Credential,
    ) -> Result<Response, RequestError> {
        trace!(url = %descriptor.url, attempt, "Retrying request with renewed token");

        let response = self.dispatch(descriptor, credential).await?;
        if response.is_unauthorized() {
            warn!(url = %descriptor.url, "Request still unauthorized after refresh");
            self.inner.manager.invalidate(credential);
            return Err(RequestError::Authentication(AuthError::AuthenticationFailed));
        }
        Ok(response)
    }

    async fn dispatch(
        &self,
        descriptor: &RequestDescriptor,
        credential: &Credential,
    ) -> Result<Response, RequestError> {
        let mut value = HeaderValue::from_str(&credential.authorization()).map_err(|_| {
            RequestError::Validation("access token is not a valid header value".to_string())
        })?;
        value.set_sensitive(true);

        let mut request = descriptor.clone();
        request.headers.insert(AUTHORIZATION, value);
        trace!(method = %request.method, url = %request.url, "Dispatching request");

        Ok(self.inner.transport.send(request).await?)
    }
}

impl std::fmt::Debug for RequestCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCoordinator")
            .field("queued", &self.queued())
            .finish()
    }
}

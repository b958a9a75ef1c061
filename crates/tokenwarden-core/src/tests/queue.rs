//! 401 recovery through the request coordinator.

use std::sync::atomic::Ordering;

use futures::future::join_all;
use reqwest::StatusCode;

use super::harness::{settle, wait_for, wait_until, TestHarness};
use crate::api::{RequestDescriptor, RequestError, TransportError};
use crate::auth::AuthError;

fn get(path: &str) -> RequestDescriptor {
    RequestDescriptor::get(TestHarness::url(path))
}

#[tokio::test]
async fn valid_token_is_attached_and_response_returned() {
    let harness = TestHarness::logged_in().await;

    let response = harness.context.execute(get("/items")).await.unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.data["token"], "access-0");
    assert_eq!(harness.identity.renewals(), 0);
}

#[tokio::test]
async fn two_simultaneous_401s_share_one_renewal() {
    let harness = TestHarness::logged_in().await;
    harness.authority.revoke("access-0");

    let (a, b) = tokio::join!(
        harness.context.execute(get("/a")),
        harness.context.execute(get("/b")),
    );

    assert_eq!(a.unwrap().data["token"], "access-1");
    assert_eq!(b.unwrap().data["token"], "access-1");
    assert_eq!(harness.identity.renewals(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simultaneous_401s_on_separate_workers_share_one_renewal() {
    let harness = TestHarness::logged_in().await;
    harness.authority.revoke("access-0");

    let requests: Vec<_> = ["/a", "/b", "/c"]
        .into_iter()
        .map(|path| {
            let context = harness.context.clone();
            tokio::spawn(async move { context.execute(get(path)).await })
        })
        .collect();

    for result in join_all(requests).await {
        assert_eq!(result.unwrap().unwrap().data["token"], "access-1");
    }
    assert_eq!(harness.identity.renewals(), 1);
    assert_eq!(harness.context.coordinator().queued(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn logout_during_renewal_rejects_queued_requests_across_threads() {
    let harness = TestHarness::logged_in().await;
    harness.authority.revoke("access-0");
    harness.identity.renew_gate.hold();

    let context = harness.context.clone();
    let request = tokio::spawn(async move { context.execute(get("/items")).await });
    wait_for(|| harness.identity.renewals() == 1).await;

    harness.context.logout(None);
    harness.identity.renew_gate.release();

    assert!(matches!(
        request.await.unwrap(),
        Err(RequestError::Authentication(AuthError::SessionEnded))
    ));
    // Nothing was replayed with the discarded token
    assert!(harness.transport.urls_with("access-1").is_empty());
    assert!(!harness.context.session().is_authenticated);
}

#[tokio::test]
async fn queued_requests_replay_once_in_enqueue_order() {
    let harness = TestHarness::logged_in().await;
    harness.authority.revoke("access-0");
    harness.identity.renew_gate.hold();

    let requests: Vec<_> = (0..5)
        .map(|i| {
            let context = harness.context.clone();
            tokio::spawn(async move { context.execute(get(&format!("/items/{}", i))).await })
        })
        .collect();

    let coordinator = harness.context.coordinator();
    wait_until(|| coordinator.queued() == 5 && harness.identity.renewals() == 1).await;
    harness.identity.renew_gate.release();

    for result in join_all(requests).await {
        assert_eq!(result.unwrap().unwrap().data["token"], "access-1");
    }

    let rejected = harness.transport.urls_with("access-0");
    let replayed = harness.transport.urls_with("access-1");
    assert_eq!(rejected.len(), 5);
    assert_eq!(replayed, rejected);
    assert_eq!(harness.identity.renewals(), 1);
    assert_eq!(coordinator.queued(), 0);
}

#[tokio::test]
async fn failed_renewal_rejects_every_queued_request() {
    let harness = TestHarness::logged_in().await;
    harness.authority.revoke("access-0");
    harness.identity.fail_renewal.store(true, Ordering::SeqCst);

    let (a, b) = tokio::join!(
        harness.context.execute(get("/a")),
        harness.context.execute(get("/b")),
    );

    for result in [a, b] {
        let err = result.unwrap_err();
        assert!(matches!(
            &err,
            RequestError::Authentication(AuthError::RefreshFailed(reason)) if reason == "renewal rejected"
        ));
        assert_eq!(err.to_string(), "Authentication failed");
    }
    assert_eq!(harness.identity.renewals(), 1);
    assert!(!harness.context.session().is_authenticated);
    assert!(harness.backend.is_empty());
    // No replays after the failed renewal
    assert_eq!(harness.transport.sent().len(), 2);
}

#[tokio::test]
async fn persistent_401_is_retried_only_once() {
    let harness = TestHarness::logged_in().await;
    harness.authority.revoke("access-0");
    harness.identity.honor_renewed.store(false, Ordering::SeqCst);

    let result = harness.context.execute(get("/items")).await;

    assert!(matches!(
        result,
        Err(RequestError::Authentication(AuthError::AuthenticationFailed))
    ));
    settle().await;
    assert_eq!(harness.identity.renewals(), 1);
    assert_eq!(harness.transport.sent().len(), 2);
    assert!(!harness.context.session().is_authenticated);
    assert!(harness.backend.is_empty());
}

#[tokio::test]
async fn stale_token_401_retries_with_current_token() {
    let harness = TestHarness::logged_in().await;
    harness.transport.slow_gate.hold();

    let context = harness.context.clone();
    let slow = tokio::spawn(async move { context.execute(get("/slow")).await });
    wait_until(|| harness.transport.sent().len() == 1).await;

    // Token replaced while the slow request is still out
    assert!(harness.context.refresh().await);
    harness.authority.revoke("access-0");
    harness.transport.slow_gate.release();

    let response = slow.await.unwrap().unwrap();
    assert_eq!(response.data["token"], "access-1");
    assert_eq!(harness.identity.renewals(), 1);
    // The original dispatch and exactly one retry
    assert_eq!(harness.transport.urls_with("access-0").len(), 1);
    assert_eq!(harness.transport.urls_with("access-1").len(), 1);
}

#[tokio::test]
async fn network_errors_surface_untouched() {
    let harness = TestHarness::logged_in().await;
    harness.transport.fail_network.store(true, Ordering::SeqCst);

    let result = harness.context.execute(get("/items")).await;

    assert!(matches!(
        result,
        Err(RequestError::Network(TransportError::Connect(_)))
    ));
    assert_eq!(harness.identity.renewals(), 0);
    assert!(harness.context.session().is_authenticated);
}

#[tokio::test]
async fn non_401_errors_are_returned_as_responses() {
    let harness = TestHarness::logged_in().await;

    let response = harness.context.execute(get("/items/missing")).await.unwrap();

    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(harness.identity.renewals(), 0);
}

#[tokio::test]
async fn malformed_requests_are_never_sent() {
    let harness = TestHarness::logged_in().await;

    let result = harness
        .context
        .execute(RequestDescriptor::get("not a url"))
        .await;

    assert!(matches!(result, Err(RequestError::Validation(_))));
    assert!(harness.transport.sent().is_empty());
}

#[tokio::test]
async fn unauthenticated_requests_are_rejected_locally() {
    let harness = TestHarness::new();

    let result = harness.context.execute(get("/items")).await;

    assert!(matches!(
        result,
        Err(RequestError::Authentication(AuthError::AuthenticationFailed))
    ));
    assert!(harness.transport.sent().is_empty());
}

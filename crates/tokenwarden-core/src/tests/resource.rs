//! Typed resource helpers.

use serde::Deserialize;
use serde_json::json;

use super::harness::{TestHarness, API};
use crate::api::RequestError;
use crate::auth::AuthError;

#[derive(Debug, Deserialize)]
struct Echo {
    url: String,
    token: String,
    body: Option<serde_json::Value>,
}

#[tokio::test]
async fn get_decodes_json() {
    let harness = TestHarness::logged_in().await;
    let client = harness.context.resource_client(API);

    let echo: Echo = client.get("/profiles/7").await.unwrap();

    assert_eq!(echo.url, format!("{}/profiles/7", API));
    assert_eq!(echo.token, "access-0");
    assert!(echo.body.is_none());
}

#[tokio::test]
async fn post_and_put_send_encoded_body() {
    let harness = TestHarness::logged_in().await;
    let client = harness.context.resource_client(format!("{}/", API));

    let created: Echo = client.post("notes", &json!({"text": "hi"})).await.unwrap();
    assert_eq!(created.body, Some(json!({"text": "hi"})));

    let updated: Echo = client.put("/notes/1", &json!({"text": "bye"})).await.unwrap();
    assert_eq!(updated.url, format!("{}/notes/1", API));
    assert_eq!(updated.body, Some(json!({"text": "bye"})));

    client.delete("/notes/1").await.unwrap();
    assert_eq!(harness.transport.sent().len(), 3);
}

#[tokio::test]
async fn error_statuses_map_to_request_errors() {
    let harness = TestHarness::logged_in().await;
    let client = harness.context.resource_client(API);

    let result: Result<Echo, RequestError> = client.get("/notes/missing").await;
    assert!(matches!(result, Err(RequestError::NotFound(_))));
}

#[tokio::test]
async fn resource_calls_recover_from_expired_token() {
    let harness = TestHarness::logged_in().await;
    harness.authority.revoke("access-0");
    let client = harness.context.resource_client(API);

    let echo: Echo = client.get("/profiles/7").await.unwrap();
    assert_eq!(echo.token, "access-1");
}

#[tokio::test]
async fn resource_calls_fail_after_logout() {
    let harness = TestHarness::logged_in().await;
    let client = harness.context.resource_client(API);
    harness.context.logout(None);

    let result: Result<Echo, RequestError> = client.get("/profiles/7").await;
    assert!(matches!(
        result,
        Err(RequestError::Authentication(AuthError::AuthenticationFailed))
    ));
}

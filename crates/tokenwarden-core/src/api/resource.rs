//! Typed JSON helpers for CRUD-style resources.
//!
//! Every call goes through the coordinator, so callers get token injection
//! and 401 recovery for free. Non-success statuses become `RequestError`s.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::debug;

use super::coordinator::RequestCoordinator;
use super::error::RequestError;
use super::transport::{RequestDescriptor, Response};

/// Clone is cheap - the coordinator is reference counted.
#[derive(Clone, Debug)]
pub struct ResourceClient {
    coordinator: RequestCoordinator,
    base_url: String,
}

impl ResourceClient {
    pub fn new(coordinator: RequestCoordinator, base_url: impl Into<String>) -> Self {
        Self {
            coordinator,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URLs are used as they are; paths are joined onto the base URL
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, RequestError> {
        let response = self.send(RequestDescriptor::get(self.url(path))).await?;
        response.json()
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, RequestError> {
        let descriptor = RequestDescriptor::post(self.url(path), Self::encode(body)?);
        self.send(descriptor).await?.json()
    }

    pub async fn put<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, RequestError> {
        let descriptor = RequestDescriptor::put(self.url(path), Self::encode(body)?);
        self.send(descriptor).await?.json()
    }

    /// Delete a resource; any response body is discarded
    pub async fn delete(&self, path: &str) -> Result<(), RequestError> {
        self.send(RequestDescriptor::delete(self.url(path))).await?;
        Ok(())
    }

    fn encode<B: Serialize>(body: &B) -> Result<Value, RequestError> {
        serde_json::to_value(body)
            .map_err(|e| RequestError::Validation(format!("failed to encode request body: {}", e)))
    }

    async fn send(&self, descriptor: RequestDescriptor) -> Result<Response, RequestError> {
        let url = descriptor.url.clone();
        let response = self.coordinator.execute(descriptor).await?;
        if response.is_success() {
            Ok(response)
        } else {
            debug!(url = %url, status = response.status.as_u16(), "Resource request failed");
            Err(RequestError::from_status(response.status, &response.body_text()))
        }
    }
}

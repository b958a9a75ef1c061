//! Outbound API plumbing.
//!
//! This module provides:
//! - `Transport` / `ReqwestTransport`: dispatch of request descriptors
//! - `IdentityProvider` / `HttpIdentityClient`: login, registration and renewal endpoints
//! - `RequestCoordinator`: bearer-token injection, 401 recovery and replay of queued calls
//! - `ResourceClient`: typed JSON helpers for CRUD-style resources on top of the coordinator

pub mod coordinator;
pub mod error;
pub mod identity;
pub mod resource;
pub mod transport;

pub use coordinator::{PendingRequest, RequestCoordinator};
pub use error::RequestError;
pub use identity::{HttpIdentityClient, IdentityError, IdentityProvider, LoginCredentials, Registration};
pub use resource::ResourceClient;
pub use transport::{ReqwestTransport, RequestDescriptor, Response, Transport, TransportError};

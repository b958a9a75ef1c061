//! Integration tests for the session keeper.
//!
//! - `harness.rs`   - mock identity service and mock API sharing one token set
//! - `lifecycle.rs` - login, registration, logout, restore and the expiry monitor
//! - `refresh.rs`   - single-flight renewal and session changes during a flight
//! - `queue.rs`     - 401 recovery, ordered replay, shared failure, bounded retry
//! - `resource.rs`  - typed CRUD helpers on top of the coordinator

pub(crate) mod harness;
mod queue;
mod resource;

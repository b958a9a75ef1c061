//! Small helpers shared across modules.

pub mod format;
pub mod sync;

pub use format::{redact, truncate_string};
pub use sync::{lock, read, write};

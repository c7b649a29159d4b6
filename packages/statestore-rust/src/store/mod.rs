//! The store contract and its two backend implementations.
//!
//! [`contract::StateStore`] is the single surface every call site consumes;
//! [`backends::FilesystemStore`] and [`backends::DatabaseStore`] are the
//! interchangeable implementations behind it.

pub mod backends;
pub mod contract;

pub use backends::{DatabaseStore, FilesystemStore};
pub use contract::{FallbackRead, JsonUpdater, StateStore, UpdateDecision};

//! Schema bookkeeping and bidirectional state migration.
//!
//! [`schema`] brings the database tables up to date once per process;
//! [`transfer`] moves live state between the filesystem and the database at
//! startup, idempotently in both directions.

pub mod schema;
pub mod transfer;

pub use transfer::{export_to_state_dir, import_state_dir, TransferReport};

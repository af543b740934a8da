//! Change store and snapshot store implementations.
//!
//! `memory` keeps everything in process and is what tests and single-node
//! deployments use; the `pg_*` modules persist to `PostgreSQL` through `sqlx`.

pub mod memory;
pub mod pg_change_store;
pub mod pg_snapshot_store;
pub mod schema;

pub use memory::{InMemoryChangeStore, InMemorySnapshotStore};
pub use pg_change_store::PgChangeStore;
pub use pg_snapshot_store::PgSnapshotStore;

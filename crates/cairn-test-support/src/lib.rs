//! Shared test clocks, a sample aggregate kind and store doubles for the
//! Cairn aggregate repository.

mod clock;
pub mod ledger;
mod stores;

pub use clock::{FixedClock, ManualClock, fixed_time};
pub use stores::{
    FailingChangeStore, FailingSnapshotStore, FlakySnapshotStore, RecordingChangeStore,
};

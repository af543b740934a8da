//! Cairn Core — shared abstractions for the aggregate repository.
//!
//! This crate defines the aggregate entity, the change and snapshot records,
//! and the contracts of the collaborators the repository orchestrates (change
//! store, snapshot store, serializer, factory). It contains no infrastructure
//! code.

pub mod aggregate;
pub mod change;
pub mod clock;
pub mod error;
pub mod serializer;
pub mod snapshot;
pub mod store;

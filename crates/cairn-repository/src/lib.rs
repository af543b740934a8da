//! Cairn Repository — the orchestrator between callers and the stores.
//!
//! [`AggregateRepository`] rebuilds aggregates from the latest snapshot plus
//! the changes recorded after it, keeps live instances in a sliding-TTL
//! [`AggregateCache`], and moves idle aggregates to cold storage. The
//! [`Sweeper`] drives that archival on a timer.

pub mod cache;
pub mod config;
pub mod repository;
pub mod sweeper;

pub use cache::{AggregateCache, LiveAggregate};
pub use config::{ConfigError, RepositoryConfig, SweeperConfig};
pub use repository::{AggregateRepository, PingReport, Version};
pub use sweeper::{Sweep, SweepReport, Sweeper, SweeperHandle};

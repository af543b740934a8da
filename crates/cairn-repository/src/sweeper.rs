//! Periodic archival of idle aggregates.
//!
//! A [`Sweeper`] holds one [`Sweep`] per aggregate kind, keyed by the kind's
//! type tag, and pings each of them on a fixed interval until stopped.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use cairn_core::aggregate::AggregateState;
use cairn_core::error::DomainError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::config::SweeperConfig;
use crate::repository::{AggregateRepository, PingReport};

/// Something that can archive its idle aggregates.
#[async_trait]
pub trait Sweep: Send + Sync {
    /// Type tag of the aggregates this sweep covers.
    fn kind(&self) -> &'static str;

    /// Box every idle aggregate.
    async fn ping(&self) -> Result<PingReport, DomainError>;
}

#[async_trait]
impl<S: AggregateState> Sweep for AggregateRepository<S> {
    fn kind(&self) -> &'static str {
        S::KIND
    }

    async fn ping(&self) -> Result<PingReport, DomainError> {
        AggregateRepository::ping(self).await
    }
}

/// Outcome of one pass over every registered kind.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Boxed identities per kind.
    pub boxed: BTreeMap<&'static str, Vec<Uuid>>,
    /// Identities that failed to box, with the error message, per kind.
    pub box_failures: BTreeMap<&'static str, Vec<(Uuid, String)>>,
    /// Error message per kind whose ping failed outright.
    pub failures: BTreeMap<&'static str, String>,
}

impl SweepReport {
    /// Total number of aggregates boxed.
    #[must_use]
    pub fn boxed_count(&self) -> usize {
        self.boxed.values().map(Vec::len).sum()
    }
}

/// Registry of sweeps driven by a timer.
pub struct Sweeper {
    sweeps: BTreeMap<&'static str, Arc<dyn Sweep>>,
    config: SweeperConfig,
}

impl Sweeper {
    /// Creates an empty sweeper.
    #[must_use]
    pub fn new(config: SweeperConfig) -> Self {
        Self {
            sweeps: BTreeMap::new(),
            config,
        }
    }

    /// Adds `sweep` under its kind.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the kind is already registered.
    pub fn register(&mut self, sweep: Arc<dyn Sweep>) -> Result<(), DomainError> {
        let kind = sweep.kind();
        if self.sweeps.contains_key(kind) {
            return Err(DomainError::Validation(format!(
                "a sweep for {kind} is already registered"
            )));
        }
        self.sweeps.insert(kind, sweep);
        Ok(())
    }

    /// Registered kinds, in order.
    #[must_use]
    pub fn kinds(&self) -> Vec<&'static str> {
        self.sweeps.keys().copied().collect()
    }

    /// Pings every kind once. A failing kind does not stop the others.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for (&kind, sweep) in &self.sweeps {
            match sweep.ping().await {
                Ok(ping) => {
                    if !ping.failed.is_empty() {
                        let failed = ping
                            .failed
                            .into_iter()
                            .map(|(id, err)| (id, err.to_string()))
                            .collect();
                        report.box_failures.insert(kind, failed);
                    }
                    report.boxed.insert(kind, ping.boxed);
                }
                Err(err) => {
                    tracing::warn!(kind, error = %err, "sweep failed");
                    report.failures.insert(kind, err.to_string());
                }
            }
        }
        report
    }

    /// Spawns the sweep loop on the current runtime.
    ///
    /// The first pass runs immediately, then once per interval.
    #[must_use]
    pub fn start(self) -> SweeperHandle {
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => {
                        tracing::debug!("sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = self.sweep_once().await;
                        tracing::debug!(
                            boxed = report.boxed_count(),
                            box_failures = report.box_failures.values().map(Vec::len).sum::<usize>(),
                            failed = report.failures.len(),
                            "sweep finished"
                        );
                    }
                }
            }
        });
        SweeperHandle {
            stop_tx: Some(stop_tx),
            task,
        }
    }
}

impl std::fmt::Debug for Sweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweeper")
            .field("kinds", &self.kinds())
            .field("config", &self.config)
            .finish()
    }
}

/// Handle to a running sweeper.
///
/// Dropping the handle does **not** stop the loop. Call
/// [`stop`](SweeperHandle::stop).
#[derive(Debug)]
pub struct SweeperHandle {
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stops the loop after the pass in progress, if any, and waits for it.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the sweep task panicked.
    pub async fn stop(mut self) -> Result<(), DomainError> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        self.task
            .await
            .map_err(|e| DomainError::Infrastructure(format!("sweeper task failed: {e}")))
    }

    /// Whether the loop is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

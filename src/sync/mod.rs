//! The sync pipeline shared by the scheduler loops, the listener consumer and
//! the HTTP surface.
//!
//! `SyncContext` owns the store, the state reader and the metrics. Syncs of the same address are serialized; different addresses
//! proceed concurrently.

pub mod scheduler;

pub use scheduler::{CycleGuard, ReconcileTrigger, ScheduleConfig, SyncScheduler};

use crate::metrics::SyncMetrics;
use crate::onchain::{ChainError, ChainEventSource, DeploymentEvent, StateReader};
use crate::store::{ContractInstance, DeploymentConfig, ReconciliationStore, StoreError};

use alloy::primitives::Address;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFailure {
    pub contract_address: Address,
    pub error: String,
}

/// Outcome of one full reconciliation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<SyncFailure>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub handled: usize,
    pub failed: usize,
}

pub struct SyncContext {
    store: Arc<dyn ReconciliationStore>,
    reader: StateReader,
    metrics: Arc<SyncMetrics>,
    locks: DashMap<Address, Arc<Mutex<()>>>,
}

impl SyncContext {
    pub fn new(
        source: Arc<dyn ChainEventSource>,
        store: Arc<dyn ReconciliationStore>,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            reader: StateReader::new(source, metrics.clone()),
            store,
            metrics,
            locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ReconciliationStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    /// Record an instance and its participants. Safe to repeat.
    pub async fn register(
        &self,
        event: &DeploymentEvent,
        config: &DeploymentConfig,
    ) -> Result<ContractInstance, SyncError> {
        Ok(self
            .store
            .upsert_instance(event, event.template, config)
            .await?)
    }

    /// Register a discovered deployment and eagerly read its state.
    pub async fn handle_deployment(
        &self,
        event: &DeploymentEvent,
    ) -> Result<ContractInstance, SyncError> {
        self.register(event, &event.config()).await?;
        self.sync_instance(event.instance).await
    }

    /// Handle a batch of events concurrently; one failure never affects the others.
    pub async fn dispatch(&self, events: &[DeploymentEvent]) -> DispatchSummary {
        let outcomes = join_all(events.iter().map(|e| self.handle_deployment(e))).await;

        let mut summary = DispatchSummary::default();
        for (event, outcome) in events.iter().zip(outcomes) {
            self.metrics.record_event(outcome.is_ok());
            match outcome {
                Ok(_) => summary.handled += 1,
                Err(e) => {
                    warn!(event = %event, error = %e, "deployment handling failed");
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    /// Read the instance's current on-chain state and overwrite the cache.
    pub async fn sync_instance(&self, address: Address) -> Result<ContractInstance, SyncError> {
        let lock = Arc::clone(&self.locks.entry(address).or_default());
        let result = {
            let _guard = lock.lock().await;
            self.sync_locked(address).await
        };
        drop(lock);
        // Only the map's own handle left: no sync of this address is queued.
        self.locks
            .remove_if(&address, |_, lock| Arc::strong_count(lock) == 1);

        self.metrics.record_sync(result.is_ok());
        result
    }

    async fn sync_locked(&self, address: Address) -> Result<ContractInstance, SyncError> {
        let instance = self
            .store
            .get_instance(address)
            .await?
            .ok_or(StoreError::NotFound(address))?;
        let state = self.reader.read_state(address, instance.template_id).await?;
        let updated = self.store.update_state(address, state).await?;
        debug!(
            address = %address,
            template = %updated.template_id,
            lifecycle = updated.lifecycle_label(),
            "instance synced"
        );
        Ok(updated)
    }

    /// Sync every non-terminal instance concurrently and attribute failures.
    pub async fn reconcile_all(&self) -> Result<ReconcileReport, SyncError> {
        let instances = self.store.non_terminal_instances().await?;
        let outcomes = join_all(
            instances
                .iter()
                .map(|i| async move { (i.address, self.sync_instance(i.address).await) }),
        )
        .await;

        let mut report = ReconcileReport {
            attempted: outcomes.len(),
            ..ReconcileReport::default()
        };
        for (address, outcome) in outcomes {
            match outcome {
                Ok(_) => report.succeeded += 1,
                Err(e) => {
                    warn!(address = %address, error = %e, "instance sync failed");
                    report.failures.push(SyncFailure {
                        contract_address: address,
                        error: e.to_string(),
                    });
                }
            }
        }
        report.failed = report.failures.len();
        self.metrics.record_reconcile_cycle();

        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            "reconciliation sweep finished"
        );
        Ok(report)
    }
}

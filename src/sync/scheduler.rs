//! The two background loops that drive the pipeline.
//!
//! 1. Deployment poll (short interval): every watcher polls its factory from
//!    its cursor, dispatches what it found and advances the cursor.
//! 2. Reconciliation sweep (long interval): every non-terminal instance is
//!    re-read from chain.
//!
//! Each loop awaits its cycle before the next tick, so cycles never overlap.
//! Reconcile cycles also hold a `CycleGuard` shared with manual sweeps.
//! Cancelling the shutdown token drops the in-flight cycle and ends the loop.

use super::{ReconcileReport, SyncContext, SyncError};
use crate::onchain::{DeploymentWatcher, SyncCursor};

use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub poll_interval: Duration,
    pub reconcile_interval: Duration,
    pub lookback_blocks: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            reconcile_interval: Duration::from_secs(300),
            lookback_blocks: 100,
        }
    }
}

/// Single-flight flag for one loop.
#[derive(Debug, Default)]
pub struct CycleGuard {
    running: AtomicBool,
}

pub struct CycleTicket<'a> {
    guard: &'a CycleGuard,
}

impl CycleGuard {
    /// `None` while another cycle holds the guard.
    pub fn try_acquire(&self) -> Option<CycleTicket<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CycleTicket { guard: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for CycleTicket<'_> {
    fn drop(&mut self) {
        self.guard.running.store(false, Ordering::Release);
    }
}

/// Runs a reconciliation sweep under the reconcile loop's guard. Shared with
/// the HTTP surface for manual sweeps.
#[derive(Clone)]
pub struct ReconcileTrigger {
    ctx: Arc<SyncContext>,
    guard: Arc<CycleGuard>,
}

impl ReconcileTrigger {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self {
            ctx,
            guard: Arc::new(CycleGuard::default()),
        }
    }

    /// `None` if a sweep is already running.
    pub async fn run_now(&self) -> Option<Result<ReconcileReport, SyncError>> {
        let _ticket = self.guard.try_acquire()?;
        Some(self.ctx.reconcile_all().await)
    }

    pub fn is_running(&self) -> bool {
        self.guard.is_running()
    }
}

pub struct SchedulerHandle {
    pub poll: JoinHandle<()>,
    pub reconcile: JoinHandle<()>,
}

pub struct SyncScheduler {
    ctx: Arc<SyncContext>,
    watchers: Vec<DeploymentWatcher>,
    config: ScheduleConfig,
    reconcile: ReconcileTrigger,
    shutdown: CancellationToken,
}

impl SyncScheduler {
    pub fn new(
        ctx: Arc<SyncContext>,
        watchers: Vec<DeploymentWatcher>,
        config: ScheduleConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            reconcile: ReconcileTrigger::new(ctx.clone()),
            ctx,
            watchers,
            config,
            shutdown,
        }
    }

    pub fn reconcile_trigger(&self) -> ReconcileTrigger {
        self.reconcile.clone()
    }

    /// Start both loops. Returns immediately.
    pub fn spawn(self) -> SchedulerHandle {
        let poll = tokio::spawn(run_poll_loop(
            self.ctx,
            self.watchers,
            self.config.poll_interval,
            self.config.lookback_blocks,
            self.shutdown.clone(),
        ));
        let reconcile = tokio::spawn(run_reconcile_loop(
            self.reconcile,
            self.config.reconcile_interval,
            self.shutdown,
        ));
        SchedulerHandle { poll, reconcile }
    }
}

pub async fn run_poll_loop(
    ctx: Arc<SyncContext>,
    watchers: Vec<DeploymentWatcher>,
    interval: Duration,
    lookback: u64,
    shutdown: CancellationToken,
) {
    let mut cursors: Vec<Option<SyncCursor>> = vec![None; watchers.len()];
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_secs = interval.as_secs(), watchers = watchers.len(), "deployment poll loop started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let cycle = join_all(
            watchers
                .iter()
                .zip(cursors.iter_mut())
                .map(|(watcher, cursor)| poll_watcher(&ctx, watcher, cursor, lookback)),
        );
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = cycle => {}
        }
    }
    info!("deployment poll loop stopped");
}

/// One poll for one watcher. The cursor only moves after dispatch.
async fn poll_watcher(
    ctx: &SyncContext,
    watcher: &DeploymentWatcher,
    cursor: &mut Option<SyncCursor>,
    lookback: u64,
) {
    let current = match *cursor {
        Some(c) => c,
        None => match watcher.init_cursor(lookback).await {
            Ok(c) => *cursor.insert(c),
            Err(e) => {
                warn!(factory = %watcher.factory(), error = %e, "failed to initialise cursor");
                ctx.metrics().record_poll(false, 0);
                return;
            }
        },
    };

    match watcher.poll_once(current).await {
        Ok(outcome) => {
            ctx.metrics().record_poll(true, outcome.events.len());
            if !outcome.events.is_empty() {
                let summary = ctx.dispatch(&outcome.events).await;
                info!(
                    factory = %watcher.factory(),
                    handled = summary.handled,
                    failed = summary.failed,
                    "dispatched deployments"
                );
            }
            *cursor = Some(outcome.cursor);
        }
        Err(e) => {
            ctx.metrics().record_poll(false, 0);
            warn!(
                factory = %watcher.factory(),
                from_block = current.last_processed_block + 1,
                transient = e.is_transient(),
                error = %e,
                "deployment poll failed, will retry range"
            );
        }
    }
}

pub async fn run_reconcile_loop(
    trigger: ReconcileTrigger,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_secs = interval.as_secs(), "reconciliation loop started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let outcome = tokio::select! {
            _ = shutdown.cancelled() => break,
            outcome = trigger.run_now() => outcome,
        };
        match outcome {
            None => debug!("reconciliation already running, skipping tick"),
            Some(Ok(report)) => {
                for failure in &report.failures {
                    debug!(address = %failure.contract_address, error = %failure.error, "sync failure");
                }
                trigger.ctx.metrics().log_summary();
            }
            Some(Err(e)) => error!(error = %e, "reconciliation sweep failed"),
        }
    }
    info!("reconciliation loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::SyncMetrics;
    use crate::onchain::{abi, ChainError, WatcherFamily};
    use crate::store::{MemoryStore, ReconciliationStore, Role};
    use crate::templates::TemplateId;
    use crate::testing::{creation_log, FakeChain};
    use alloy::primitives::{address, Address};

    const FACTORY: Address = address!("00000000000000000000000000000000000000f1");
    const CREATOR: Address = address!("00000000000000000000000000000000000000c0");
    const VAULT: Address = address!("00000000000000000000000000000000000000a1");

    fn setup() -> (Arc<FakeChain>, Arc<MemoryStore>, Arc<SyncContext>) {
        let chain = Arc::new(FakeChain::new());
        let store = Arc::new(MemoryStore::new());
        let ctx = Arc::new(SyncContext::new(
            chain.clone(),
            store.clone(),
            Arc::new(SyncMetrics::default()),
        ));
        (chain, store, ctx)
    }

    #[test]
    fn test_cycle_guard_is_single_flight() {
        let guard = CycleGuard::default();
        let ticket = guard.try_acquire();
        assert!(ticket.is_some());
        assert!(guard.try_acquire().is_none());
        drop(ticket);
        assert!(guard.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_poll_creates_instance_from_cursor() {
        let (chain, store, ctx) = setup();
        chain.set_height(105);
        chain.seed_rent_vault(VAULT, false);
        chain.push_log(creation_log(FACTORY, TemplateId::RentVault, CREATOR, VAULT, Address::ZERO, 103, 0));

        let watcher = DeploymentWatcher::new(chain.clone(), FACTORY, WatcherFamily::Generic);
        let mut cursor = Some(SyncCursor::at(98));
        poll_watcher(&ctx, &watcher, &mut cursor, 100).await;

        assert_eq!(cursor, Some(SyncCursor::at(105)));
        let instance = store.get_instance(VAULT).await.unwrap().unwrap();
        assert_eq!(instance.template_id, TemplateId::RentVault);
        assert_eq!(instance.lifecycle_state, 0);
        let participants = store.participants(VAULT).await.unwrap();
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].role, Role::Creator);
    }

    #[tokio::test]
    async fn test_failed_poll_retries_same_range() {
        let (chain, store, ctx) = setup();
        chain.set_height(105);
        chain.seed_rent_vault(VAULT, false);
        chain.push_log(creation_log(FACTORY, TemplateId::RentVault, CREATOR, VAULT, Address::ZERO, 103, 0));
        chain.fail_topic(abi::event_topic(TemplateId::RentVault.descriptor().creation_event));

        let watcher = DeploymentWatcher::new(chain.clone(), FACTORY, WatcherFamily::Generic);
        let mut cursor = Some(SyncCursor::at(98));
        poll_watcher(&ctx, &watcher, &mut cursor, 100).await;
        assert_eq!(cursor, Some(SyncCursor::at(98)));
        assert_eq!(store.instance_count(), 0);
        assert_eq!(ctx.metrics().snapshot().polls_failed, 1);

        chain.clear_failures();
        chain.set_height(107);
        poll_watcher(&ctx, &watcher, &mut cursor, 100).await;
        assert_eq!(cursor, Some(SyncCursor::at(107)));
        assert_eq!(store.instance_count(), 1);
    }

    #[tokio::test]
    async fn test_cursor_initialisation_failure_is_retried() {
        let (chain, _store, ctx) = setup();
        chain.fail_height(Some(ChainError::Network("connection reset".into())));
        let watcher = DeploymentWatcher::new(chain.clone(), FACTORY, WatcherFamily::Legacy);
        let mut cursor = None;
        poll_watcher(&ctx, &watcher, &mut cursor, 100).await;
        assert!(cursor.is_none());

        chain.fail_height(None);
        chain.set_height(1_000);
        poll_watcher(&ctx, &watcher, &mut cursor, 100).await;
        assert_eq!(cursor, Some(SyncCursor::at(1_000)));
        let query = chain.log_queries()[0];
        assert_eq!((query.from_block, query.to_block), (900, 1_000));
    }

    #[tokio::test]
    async fn test_manual_trigger_refuses_overlap() {
        let (_chain, _store, ctx) = setup();
        let trigger = ReconcileTrigger::new(ctx);
        let held = trigger.guard.try_acquire();
        assert!(held.is_some());
        assert!(trigger.is_running());
        assert!(trigger.run_now().await.is_none());
        drop(held);
        let report = trigger.run_now().await.unwrap().unwrap();
        assert_eq!(report.attempted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loops_stop_on_shutdown() {
        let (chain, store, ctx) = setup();
        chain.set_height(50);
        chain.seed_rent_vault(VAULT, false);
        chain.push_log(creation_log(FACTORY, TemplateId::RentVault, CREATOR, VAULT, Address::ZERO, 45, 0));

        let shutdown = CancellationToken::new();
        let watcher = DeploymentWatcher::new(chain.clone(), FACTORY, WatcherFamily::Generic);
        let scheduler = SyncScheduler::new(ctx.clone(), vec![watcher], ScheduleConfig::default(), shutdown.clone());
        let handle = scheduler.spawn();

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(store.instance_count(), 1);
        assert!(ctx.metrics().snapshot().polls_succeeded >= 3);
        assert_eq!(ctx.metrics().snapshot().reconcile_cycles, 1);

        shutdown.cancel();
        handle.poll.await.unwrap();
        handle.reconcile.await.unwrap();
    }
}

//! Sync pipeline metrics.
//!
//! Tracks the outcome of every unit of background work so failures that the
//! loops swallow stay visible:
//! - deployment polls and the events they discover
//! - per-instance syncs and degraded field reads
//! - reconciliation sweeps
//! - listener reconnects and terminal failures

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

#[derive(Debug, Default)]
pub struct SyncMetrics {
    polls_succeeded: AtomicU64,
    polls_failed: AtomicU64,
    events_discovered: AtomicU64,
    events_handled: AtomicU64,
    events_failed: AtomicU64,
    instances_synced: AtomicU64,
    instance_sync_failures: AtomicU64,
    field_read_failures: AtomicU64,
    reconcile_cycles: AtomicU64,
    listener_reconnects: AtomicU64,
    listener_fatal: AtomicU64,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub polls_succeeded: u64,
    pub polls_failed: u64,
    pub events_discovered: u64,
    pub events_handled: u64,
    pub events_failed: u64,
    pub instances_synced: u64,
    pub instance_sync_failures: u64,
    pub field_read_failures: u64,
    pub reconcile_cycles: u64,
    pub listener_reconnects: u64,
    pub listener_fatal: u64,
}

impl SyncMetrics {
    pub fn record_poll(&self, ok: bool, events: usize) {
        if ok {
            self.polls_succeeded.fetch_add(1, Ordering::Relaxed);
            self.events_discovered.fetch_add(events as u64, Ordering::Relaxed);
        } else {
            self.polls_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_event(&self, ok: bool) {
        let counter = if ok {
            &self.events_handled
        } else {
            &self.events_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync(&self, ok: bool) {
        let counter = if ok {
            &self.instances_synced
        } else {
            &self.instance_sync_failures
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_field_failure(&self) {
        self.field_read_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconcile_cycle(&self) {
        self.reconcile_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.listener_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_listener_fatal(&self) {
        self.listener_fatal.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            polls_succeeded: get(&self.polls_succeeded),
            polls_failed: get(&self.polls_failed),
            events_discovered: get(&self.events_discovered),
            events_handled: get(&self.events_handled),
            events_failed: get(&self.events_failed),
            instances_synced: get(&self.instances_synced),
            instance_sync_failures: get(&self.instance_sync_failures),
            field_read_failures: get(&self.field_read_failures),
            reconcile_cycles: get(&self.reconcile_cycles),
            listener_reconnects: get(&self.listener_reconnects),
            listener_fatal: get(&self.listener_fatal),
        }
    }

    /// Log a one-line summary.
    pub fn log_summary(&self) {
        let s = self.snapshot();
        info!(
            polls_ok = s.polls_succeeded,
            polls_failed = s.polls_failed,
            events = s.events_discovered,
            events_failed = s.events_failed,
            synced = s.instances_synced,
            sync_failures = s.instance_sync_failures,
            null_fields = s.field_read_failures,
            cycles = s.reconcile_cycles,
            reconnects = s.listener_reconnects,
            "sync metrics"
        );
    }
}

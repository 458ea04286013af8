//! Worker liveness + stale-execution reaper (spec §2 "Heartbeat + stale
//! reaper"). Two independent interval loops sharing one `Storage` handle.

use crate::storage::Storage;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Tracks how many jobs this worker currently has in flight, so the
/// heartbeat row can advertise real load rather than just liveness.
#[derive(Clone, Default)]
pub struct ActiveJobCounter(Arc<AtomicI32>);

impl ActiveJobCounter {
    pub fn new() -> Self {
        Self(Arc::new(AtomicI32::new(0)))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> i32 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs until `shutdown` fires. Advertises liveness on `interval`.
pub async fn run_heartbeat(
    storage: Storage,
    worker_id: String,
    max_concurrent_jobs: i32,
    active: ActiveJobCounter,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = storage
                    .upsert_heartbeat(&worker_id, max_concurrent_jobs, active.get())
                    .await
                {
                    warn!(err = %e, "heartbeat write failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Runs until `shutdown` fires. Marks executions stuck in `running` past
/// `threshold` since their last write as `timed_out`. This surfaces stuck
/// executions; it never kills a process (spec §4.3 "idle reap coupling").
pub async fn run_stale_reaper(
    storage: Storage,
    threshold: Duration,
    poll_interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match storage.reap_stale_executions(threshold).await {
                    Ok(ids) if !ids.is_empty() => {
                        info!(count = ids.len(), "reaped stale executions");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(err = %e, "stale execution reap failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Runs until `shutdown` fires. Periodic half of the idle/stale session
/// pruning supplement (SPEC_FULL.md supplemented feature #2) — the
/// crash-recovery half runs once at boot via `Storage::recover_stale_sessions`.
/// Ticks once a day; `Storage::prune_old_sessions` itself no-ops when
/// `retention_days` is `0`.
pub async fn run_session_pruner(
    storage: Storage,
    retention_days: u32,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match storage.prune_old_sessions(retention_days).await {
                    Ok(n) if n > 0 => info!(count = n, "pruned ended sessions"),
                    Ok(_) => {}
                    Err(e) => warn!(err = %e, "session prune failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_job_counter_tracks_in_flight() {
        let counter = ActiveJobCounter::new();
        assert_eq!(counter.get(), 0);
        counter.inc();
        counter.inc();
        assert_eq!(counter.get(), 2);
        counter.dec();
        assert_eq!(counter.get(), 1);
    }
}

//! Synchroniser: keeps the index converged with the authority.
//!
//! Startup decides between restoring the evaluation engine from a snapshot
//! plus a gap sync (short downtime) and rebuilding everything with a full
//! sync. Steady state runs an incremental sync every 30 seconds, a deletion
//! stream consumer, a daily catch-up gap sync, periodic snapshot dumps, and
//! listens for manually triggered full syncs.
pub mod delete;
pub mod full;
pub mod gap;
pub mod indexer;
pub mod snapshot;

use crate::metrics::{SYNC_TYPE_FULL, SYNC_TYPE_GAP, now_unix, sync_with_metrics};
use crate::queue::DeletionQueue;
use crate::shutdown::Shutdown;
use argus_authority::AuthorityClient;
use argus_index::Index;
use argus_policy::InstanceKind;
use argus_snapshot::{SnapshotError, SnapshotStore};
use indexer::Indexer;
use snapshot::Snapshotter;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub const ONE_DAY: i64 = 24 * 60 * 60;
pub const ONE_HOUR: i64 = 60 * 60;

// full sync
pub const FULL_POOL_SIZE: usize = 10;
pub const FULL_BATCH_SIZE: i64 = 500;

// incremental sync
pub const INCR_POOL_SIZE: usize = 10;
// the authority caps an ids fetch at 200
pub const INCR_BATCH_SIZE: usize = 100;
pub const INCR_INTERVAL_SECONDS: u64 = 30;
pub const LEAD_IN_SECONDS: i64 = 1;
pub const GAP_CHANNEL_CAPACITY: usize = 120;

// deletion stream
pub const DELETE_INTERVAL_SECONDS: u64 = 5;
pub const DELETE_BATCH_SIZE: usize = 1000;

// indexer buffers
pub const INDEX_CHANNEL_CAPACITY: usize = 10_000;
pub const INDEX_POOL_SIZE: usize = 10;
pub const INDEX_BATCH_SIZE: usize = 100;

pub const SNAPSHOT_INTERVAL_SECONDS: u64 = 300;
pub const TIMING_GAP_INTERVAL_SECONDS: u64 = 24 * 60 * 60;

pub struct SyncDeps {
    pub index: Arc<Index>,
    pub authority: Arc<dyn AuthorityClient>,
    pub snapshot_store: Arc<SnapshotStore>,
    pub queue: Option<Arc<dyn DeletionQueue>>,
    pub kind: InstanceKind,
    pub indexer_flush_interval: Duration,
}

/// Brings the index up and starts every background loop. Mirrors the
/// startup state machine: snapshot + gap sync when the last full sync is
/// recent enough, full sync otherwise.
pub fn start_sync(deps: SyncDeps, shutdown: Shutdown, full_sync_rx: mpsc::Receiver<()>) {
    let indexer = Indexer::start(
        Arc::clone(&deps.index),
        deps.indexer_flush_interval,
        shutdown.clone(),
    );
    let snapshotter = Arc::new(Snapshotter::new(
        Arc::clone(&deps.index),
        Arc::clone(&deps.snapshot_store),
    ));

    let last_full_sync = match deps.snapshot_store.full_sync_last_time() {
        Ok(ts) => ts,
        Err(SnapshotError::NoSyncBefore) => {
            info!("no full sync recorded before, starting cold");
            0
        }
        Err(err) => {
            error!(error = %err, "read last full sync time failed");
            0
        }
    };

    let now = now_unix();
    let age = now - last_full_sync;

    let mut bootstrap_with_snapshot = false;
    if age < ONE_DAY && snapshotter.exists() {
        info!(
            last_full_sync,
            age, "recent sync state and snapshot present, trying snapshot restore"
        );
        match snapshotter.load() {
            Ok(()) => {
                info!("snapshot restored, starting a gap sync to close the downtime window");
                bootstrap_with_snapshot = true;

                let authority = Arc::clone(&deps.authority);
                let store = Arc::clone(&deps.snapshot_store);
                let snapshotter = Arc::clone(&snapshotter);
                let idx = indexer.clone();
                let gap_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let result = sync_with_metrics(SYNC_TYPE_GAP, || {
                        gap::gap_sync(&authority, &idx, last_full_sync, now)
                    })
                    .await;
                    match result {
                        Ok(()) => {
                            persist_full_sync_time(&store, now);
                            snapshotter.start(gap_shutdown, SNAPSHOT_INTERVAL_SECONDS);
                        }
                        Err(err) => {
                            error!(error = %err, "bootstrap gap sync failed, index stays stale until the next cycle");
                        }
                    }
                });
            }
            Err(err) => {
                warn!(error = %err, "snapshot restore failed, falling back to full sync");
            }
        }
    }

    if !bootstrap_with_snapshot {
        info!(last_full_sync, "starting a bootstrap full sync");
        let authority = Arc::clone(&deps.authority);
        let store = Arc::clone(&deps.snapshot_store);
        let snapshotter = Arc::clone(&snapshotter);
        let idx = indexer.clone();
        let kind = deps.kind;
        let full_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result =
                sync_with_metrics(SYNC_TYPE_FULL, || full::full_sync(&authority, &idx, kind))
                    .await;
            match result {
                Ok(()) => {
                    persist_full_sync_time(&store, now);
                    snapshotter.start(full_shutdown, SNAPSHOT_INTERVAL_SECONDS);
                }
                Err(err) => {
                    error!(error = %err, "bootstrap full sync failed");
                }
            }
        });
    }

    gap::start_incr_sync(
        Arc::clone(&deps.authority),
        Arc::clone(&deps.snapshot_store),
        indexer.clone(),
        INCR_INTERVAL_SECONDS,
        shutdown.clone(),
    );

    if let Some(queue) = deps.queue.clone() {
        delete::start_delete_sync(queue, indexer.clone(), DELETE_INTERVAL_SECONDS, shutdown.clone());
    } else {
        warn!("no deletion queue configured, deletion stream consumer disabled");
    }

    gap::start_timing_gap_sync(
        Arc::clone(&deps.authority),
        Arc::clone(&deps.snapshot_store),
        Arc::clone(&snapshotter),
        indexer.clone(),
        TIMING_GAP_INTERVAL_SECONDS,
        shutdown.clone(),
    );

    spawn_full_sync_listener(deps, indexer, full_sync_rx, shutdown);
}

/// One manual full sync at a time: the signal channel has a single slot and
/// an atomic flag drops signals that race a sync already in flight.
fn spawn_full_sync_listener(
    deps: SyncDeps,
    indexer: Indexer,
    mut rx: mpsc::Receiver<()>,
    shutdown: Shutdown,
) {
    let in_flight = Arc::new(AtomicBool::new(false));
    let mut shutdown = shutdown;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                signal = rx.recv() => {
                    if signal.is_none() {
                        return;
                    }
                    if in_flight
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_err()
                    {
                        continue;
                    }

                    let now = now_unix();
                    let authority = Arc::clone(&deps.authority);
                    let store = Arc::clone(&deps.snapshot_store);
                    let idx = indexer.clone();
                    let kind = deps.kind;
                    let in_flight = Arc::clone(&in_flight);
                    tokio::spawn(async move {
                        let result = sync_with_metrics(SYNC_TYPE_FULL, || {
                            full::full_sync(&authority, &idx, kind)
                        })
                        .await;
                        if result.is_ok() {
                            persist_full_sync_time(&store, now);
                        }
                        in_flight.store(false, Ordering::SeqCst);
                    });
                }
                _ = shutdown.cancelled() => {
                    info!("shutdown, the full sync listener stops");
                    return;
                }
            }
        }
    });
}

pub(crate) fn persist_full_sync_time(store: &SnapshotStore, timestamp: i64) {
    if let Err(err) = store.set_full_sync_last_time(timestamp) {
        error!(error = %err, "persist full sync time failed");
    }
}

//! Incremental and gap synchronisation over `updated_at` windows.
use super::{
    GAP_CHANNEL_CAPACITY, INCR_BATCH_SIZE, INCR_POOL_SIZE, LEAD_IN_SECONDS, ONE_HOUR,
    persist_full_sync_time,
};
use crate::metrics::{SYNC_TYPE_GAP, SYNC_TYPE_INCR, now_unix, sync_with_metrics};
use crate::shutdown::Shutdown;
use crate::sync::indexer::Indexer;
use crate::sync::snapshot::Snapshotter;
use argus_authority::AuthorityClient;
use argus_snapshot::SnapshotStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{error, info};

#[derive(Debug, Clone, Copy)]
struct TimeGap {
    begin_updated_at: i64,
    end_updated_at: i64,
}

/// Fetches the policies updated inside one window: the id list first, then
/// their contents in bounded slices through a worker pool. A failed content
/// slice is logged and skipped; a failed id fetch fails the window so the
/// caller can retry it.
pub async fn sync_between_updated_at(
    authority: &Arc<dyn AuthorityClient>,
    indexer: &Indexer,
    begin_updated_at: i64,
    end_updated_at: i64,
) -> anyhow::Result<()> {
    info!(begin_updated_at, end_updated_at, "sync window");

    let ids = authority
        .list_policy_ids_between(begin_updated_at, end_updated_at)
        .await
        .map_err(|err| anyhow::anyhow!("list updated policy ids failed: {err}"))?;

    let pool = Arc::new(Semaphore::new(INCR_POOL_SIZE));
    let mut slices = JoinSet::new();
    for chunk in ids.chunks(INCR_BATCH_SIZE) {
        let chunk = chunk.to_vec();
        let authority = Arc::clone(authority);
        let indexer = indexer.clone();
        let permit = Arc::clone(&pool)
            .acquire_owned()
            .await
            .expect("incr sync pool closed");
        slices.spawn(async move {
            let _permit = permit;
            match authority.list_policies_by_ids(&chunk).await {
                Ok(policies) => indexer.bulk_add(policies).await,
                Err(err) => {
                    error!(ids = chunk.len(), error = %err, "incr sync slice fetch failed, skipping");
                }
            }
        });
    }
    while slices.join_next().await.is_some() {}

    info!(begin_updated_at, end_updated_at, count = ids.len(), "sync window done");
    Ok(())
}

/// Walks a historical interval hour by hour, sequentially: the authority
/// bounds one window to an hour, and ordering keeps replay deterministic.
pub async fn gap_sync(
    authority: &Arc<dyn AuthorityClient>,
    indexer: &Indexer,
    begin_updated_at: i64,
    end_updated_at: i64,
) -> anyhow::Result<()> {
    info!(begin_updated_at, end_updated_at, "start gap sync");
    let mut begin = begin_updated_at;
    while begin < end_updated_at {
        let end = (begin + ONE_HOUR).min(end_updated_at);
        sync_between_updated_at(authority, indexer, begin, end)
            .await
            .map_err(|err| anyhow::anyhow!("gap sync failed: {err}"))?;
        begin += ONE_HOUR;
    }
    info!(begin_updated_at, end_updated_at, "done gap sync");
    Ok(())
}

/// Every `interval` seconds, queue the just-elapsed window (with a small
/// lead-in for clock skew) onto a bounded channel; a separate consumer
/// drains it. Slow consumption widens lag but never loses a window.
pub fn start_incr_sync(
    authority: Arc<dyn AuthorityClient>,
    store: Arc<SnapshotStore>,
    indexer: Indexer,
    interval: u64,
    shutdown: Shutdown,
) {
    info!(interval, "start incremental sync");
    let (gap_tx, mut gap_rx) = mpsc::channel::<TimeGap>(GAP_CHANNEL_CAPACITY);

    let mut producer_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires immediately and would sync an empty window
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let end_updated_at = now_unix();
                    let gap = TimeGap {
                        begin_updated_at: end_updated_at - interval as i64 - LEAD_IN_SECONDS,
                        end_updated_at,
                    };
                    if gap_tx.send(gap).await.is_err() {
                        return;
                    }
                }
                _ = producer_shutdown.cancelled() => {
                    info!("shutdown, the incremental sync trigger stops");
                    return;
                }
            }
        }
    });

    let mut consumer_shutdown = shutdown;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(gap) = gap_rx.recv() => {
                    let result = sync_with_metrics(SYNC_TYPE_INCR, || {
                        sync_between_updated_at(
                            &authority,
                            &indexer,
                            gap.begin_updated_at,
                            gap.end_updated_at,
                        )
                    })
                    .await;
                    match result {
                        Ok(()) => {
                            if let Err(err) = store.set_incr_sync_last_time(now_unix()) {
                                error!(error = %err, "persist incr sync time failed");
                            }
                        }
                        Err(err) => {
                            error!(error = %err, "incremental sync window failed");
                        }
                    }
                }
                _ = consumer_shutdown.cancelled() => {
                    info!("shutdown, the incremental sync consumer stops");
                    return;
                }
            }
        }
    });
}

/// Every 24 hours, replay the interval since the last recorded full sync.
/// This closes holes left by skipped slices or missed deletion events over
/// long horizons.
pub fn start_timing_gap_sync(
    authority: Arc<dyn AuthorityClient>,
    store: Arc<SnapshotStore>,
    snapshotter: Arc<Snapshotter>,
    indexer: Indexer,
    interval: u64,
    mut shutdown: Shutdown,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let end_updated_at = now_unix();
                    let begin_updated_at = match store.full_sync_last_time() {
                        Ok(ts) => ts,
                        Err(err) => {
                            error!(error = %err, "read last full sync time failed");
                            end_updated_at - interval as i64
                        }
                    };

                    let result = sync_with_metrics(SYNC_TYPE_GAP, || {
                        gap_sync(&authority, &indexer, begin_updated_at, end_updated_at)
                    })
                    .await;
                    match result {
                        Ok(()) => {
                            persist_full_sync_time(&store, end_updated_at);
                            if let Err(err) = snapshotter.dump() {
                                error!(error = %err, "snapshot dump after timing gap sync failed");
                            }
                        }
                        Err(err) => {
                            error!(error = %err, "timing gap sync failed");
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("shutdown, the timing gap sync stops");
                    return;
                }
            }
        }
    });
}

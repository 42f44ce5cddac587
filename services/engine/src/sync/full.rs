//! Full sync: rebuild the index from the authority's whole id space.
use super::{FULL_BATCH_SIZE, FULL_POOL_SIZE};
use crate::metrics::now_unix;
use crate::sync::indexer::Indexer;
use argus_authority::AuthorityClient;
use argus_policy::InstanceKind;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Scans `[begin_id, max_id]` in fixed slices through a bounded worker
/// pool. Each slice upserts what the authority returned and deletes the ids
/// it did not: those policies were removed or never existed. A failed slice
/// is logged and skipped; the next cycle recovers it. Only the max-id fetch
/// can fail the sync as a whole.
pub async fn full_sync(
    authority: &Arc<dyn AuthorityClient>,
    indexer: &Indexer,
    kind: InstanceKind,
) -> anyhow::Result<()> {
    info!(
        pool_size = FULL_POOL_SIZE,
        batch_size = FULL_BATCH_SIZE,
        "start full sync"
    );

    let now = now_unix();
    let max_id = authority
        .max_policy_id(now)
        .await
        .map_err(|err| anyhow::anyhow!("full sync get max id failed: {err}"))?;

    let pool = Arc::new(Semaphore::new(FULL_POOL_SIZE));
    let mut slices = JoinSet::new();

    let mut begin = kind.policy_begin_id();
    while begin <= max_id {
        let end = (begin + FULL_BATCH_SIZE - 1).min(max_id);
        let authority = Arc::clone(authority);
        let indexer = indexer.clone();
        let permit = Arc::clone(&pool)
            .acquire_owned()
            .await
            .expect("full sync pool closed");

        slices.spawn(async move {
            let _permit = permit;
            sync_slice(&authority, &indexer, now, begin, end).await;
        });

        begin = end + 1;
    }

    while slices.join_next().await.is_some() {}

    info!(max_id, "done full sync");
    Ok(())
}

async fn sync_slice(
    authority: &Arc<dyn AuthorityClient>,
    indexer: &Indexer,
    timestamp: i64,
    begin: i64,
    end: i64,
) {
    let policies = match authority.list_policies_between_ids(timestamp, begin, end).await {
        Ok(policies) => policies,
        Err(err) => {
            error!(begin, end, error = %err, "full sync slice fetch failed, skipping");
            return;
        }
    };

    let existing: HashSet<i64> = policies.iter().map(|policy| policy.id).collect();
    indexer.bulk_add(policies).await;

    // ids the authority no longer returns are gone or expired
    let absent: Vec<i64> = (begin..=end).filter(|id| !existing.contains(id)).collect();
    indexer.bulk_delete(absent).await;
}

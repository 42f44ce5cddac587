//! Periodic evaluation-engine snapshot dumps.
use crate::metrics::record_snapshot_dump_failure;
use crate::shutdown::Shutdown;
use argus_index::Index;
use argus_snapshot::{SnapshotResult, SnapshotStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info};

pub struct Snapshotter {
    index: Arc<Index>,
    store: Arc<SnapshotStore>,
    started: AtomicBool,
}

impl Snapshotter {
    pub fn new(index: Arc<Index>, store: Arc<SnapshotStore>) -> Self {
        Self {
            index,
            store,
            started: AtomicBool::new(false),
        }
    }

    pub fn exists(&self) -> bool {
        self.store.snapshot_exists()
    }

    pub fn dump(&self) -> SnapshotResult<()> {
        let records = self.index.take_snapshot();
        self.store.save_snapshot(&records)
    }

    pub fn load(&self) -> SnapshotResult<()> {
        let records = self.store.load_snapshot()?;
        self.index.load_snapshot(records);
        Ok(())
    }

    /// Starts the periodic dump loop. Must only run after the first
    /// successful full or gap sync, otherwise a half-built index would
    /// overwrite a good snapshot; a second call is a no-op.
    pub fn start(self: Arc<Self>, mut shutdown: Shutdown, interval: u64) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(interval, "start periodic snapshot dump");

        let snapshotter = self;
        tokio::spawn(async move {
            // dump immediately, then on the interval
            snapshotter.dump_logged();

            let mut ticker = tokio::time::interval(Duration::from_secs(interval));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        snapshotter.dump_logged();
                    }
                    _ = shutdown.cancelled() => {
                        info!("shutdown, the snapshot dump stops");
                        return;
                    }
                }
            }
        });
    }

    fn dump_logged(&self) {
        match self.dump() {
            Ok(()) => info!("snapshot dumped"),
            Err(err) => {
                record_snapshot_dump_failure();
                error!(error = %err, "snapshot dump failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_index::doc::memory::MemoryDocumentStore;
    use argus_index::{DocEngine, EvalEngine};
    use argus_policy::InstanceKind;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_index() -> Arc<Index> {
        Arc::new(Index::new(
            DocEngine::new(Arc::new(MemoryDocumentStore::new())),
            EvalEngine::new(),
        ))
    }

    #[tokio::test]
    async fn dump_then_load_restores_eval_state() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SnapshotStore::new(dir.path(), InstanceKind::Abac));

        let source = test_index();
        source
            .bulk_upsert(vec![
                serde_json::from_value(json!({
                    "id": 4,
                    "system": "bk_cmdb",
                    "action": {"id": "edit"},
                    "subject": {"type": "group", "id": "admins", "name": ""},
                    "expression": {"op": "AND", "content": [
                        {"op": "eq", "field": "host.id", "value": "42"},
                        {"op": "eq", "field": "host.owner", "value": "bob"}
                    ]},
                    "expired_at": 4102444800i64,
                    "updated_at": 1i64
                }))
                .unwrap(),
            ])
            .await;

        let snapshotter = Snapshotter::new(Arc::clone(&source), Arc::clone(&store));
        assert!(!snapshotter.exists());
        snapshotter.dump().unwrap();
        assert!(snapshotter.exists());

        let target = test_index();
        let restoring = Snapshotter::new(Arc::clone(&target), store);
        restoring.load().unwrap();
        assert_eq!(target.total_stats().await.eval, 1);
    }
}

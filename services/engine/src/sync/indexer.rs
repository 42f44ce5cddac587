//! Buffering layer between the sync tasks and the index facade.
//!
//! Upserts and deletes accumulate in bounded channels and are flushed on a
//! batch-size threshold or an idle tick, whichever comes first, through a
//! bounded worker pool. Full channels block producers: enqueued work is
//! never silently dropped, lag just widens.
use super::{INDEX_BATCH_SIZE, INDEX_CHANNEL_CAPACITY, INDEX_POOL_SIZE};
use crate::shutdown::Shutdown;
use argus_index::Index;
use argus_policy::{Policy, Subject};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info, warn};

/// A pre-batched deletion instruction from the event stream.
#[derive(Debug, Clone)]
pub enum DeleteEvent {
    Policies(Vec<i64>),
    Subjects {
        timestamp: i64,
        subjects: Vec<Subject>,
    },
    TemplateSubjects {
        timestamp: i64,
        entries: Vec<TemplateSubject>,
    },
}

#[derive(Debug, Clone)]
pub struct TemplateSubject {
    pub template_id: i64,
    pub subject: Subject,
}

#[derive(Clone)]
pub struct Indexer {
    upserts: mpsc::Sender<Policy>,
    deletes: mpsc::Sender<i64>,
    events: mpsc::Sender<DeleteEvent>,
}

impl Indexer {
    pub fn start(index: Arc<Index>, flush_interval: Duration, shutdown: Shutdown) -> Self {
        let (upserts_tx, upserts_rx) = mpsc::channel(INDEX_CHANNEL_CAPACITY);
        let (deletes_tx, deletes_rx) = mpsc::channel(INDEX_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(INDEX_CHANNEL_CAPACITY);

        tokio::spawn(run(
            index,
            flush_interval,
            shutdown,
            upserts_rx,
            deletes_rx,
            events_rx,
        ));

        Self {
            upserts: upserts_tx,
            deletes: deletes_tx,
            events: events_tx,
        }
    }

    /// Blocks when the buffer is full; backpressure reaches the sync task.
    pub async fn bulk_add(&self, policies: Vec<Policy>) {
        for policy in policies {
            if self.upserts.send(policy).await.is_err() {
                warn!("indexer stopped, dropping upsert");
                return;
            }
        }
    }

    pub async fn bulk_delete(&self, ids: Vec<i64>) {
        for id in ids {
            if self.deletes.send(id).await.is_err() {
                warn!("indexer stopped, dropping delete");
                return;
            }
        }
    }

    /// Hands a deletion event over; an error means the indexer is gone and
    /// the caller must not acknowledge the event.
    pub async fn delete_by_event(&self, event: DeleteEvent) -> Result<(), ()> {
        self.events.send(event).await.map_err(|_| ())
    }
}

async fn run(
    index: Arc<Index>,
    flush_interval: Duration,
    mut shutdown: Shutdown,
    mut upserts_rx: mpsc::Receiver<Policy>,
    mut deletes_rx: mpsc::Receiver<i64>,
    mut events_rx: mpsc::Receiver<DeleteEvent>,
) {
    info!("indexer started");
    let pool = Arc::new(Semaphore::new(INDEX_POOL_SIZE));
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut upsert_buffer: Vec<Policy> = Vec::with_capacity(INDEX_BATCH_SIZE);
    let mut delete_buffer: Vec<i64> = Vec::with_capacity(INDEX_BATCH_SIZE);

    loop {
        tokio::select! {
            Some(policy) = upserts_rx.recv() => {
                upsert_buffer.push(policy);
                if upsert_buffer.len() >= INDEX_BATCH_SIZE {
                    flush_upserts(&index, &pool, &mut upsert_buffer).await;
                }
            }
            Some(id) = deletes_rx.recv() => {
                delete_buffer.push(id);
                if delete_buffer.len() >= INDEX_BATCH_SIZE {
                    flush_deletes(&index, &pool, &mut delete_buffer).await;
                }
            }
            Some(event) = events_rx.recv() => {
                // events arrive pre-batched, no extra buffering
                dispatch_event(&index, &pool, event).await;
            }
            _ = ticker.tick() => {
                if upsert_buffer.is_empty() && delete_buffer.is_empty() {
                    debug!("indexer idle");
                } else {
                    debug!(
                        upserts = upsert_buffer.len(),
                        deletes = delete_buffer.len(),
                        "idle tick, flushing partial batches"
                    );
                }
                flush_upserts(&index, &pool, &mut upsert_buffer).await;
                flush_deletes(&index, &pool, &mut delete_buffer).await;
            }
            _ = shutdown.cancelled() => {
                // no drain: the next start rediscovers pending work via sync
                info!("shutdown, the indexer stops");
                return;
            }
        }
    }
}

async fn flush_upserts(index: &Arc<Index>, pool: &Arc<Semaphore>, buffer: &mut Vec<Policy>) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::replace(buffer, Vec::with_capacity(INDEX_BATCH_SIZE));
    let permit = Arc::clone(pool).acquire_owned().await.expect("indexer pool closed");
    let index = Arc::clone(index);
    tokio::spawn(async move {
        index.bulk_upsert(batch).await;
        drop(permit);
    });
}

async fn flush_deletes(index: &Arc<Index>, pool: &Arc<Semaphore>, buffer: &mut Vec<i64>) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::replace(buffer, Vec::with_capacity(INDEX_BATCH_SIZE));
    let permit = Arc::clone(pool).acquire_owned().await.expect("indexer pool closed");
    let index = Arc::clone(index);
    tokio::spawn(async move {
        index.bulk_delete(&batch).await;
        drop(permit);
    });
}

async fn dispatch_event(index: &Arc<Index>, pool: &Arc<Semaphore>, event: DeleteEvent) {
    let permit = Arc::clone(pool).acquire_owned().await.expect("indexer pool closed");
    let index = Arc::clone(index);
    tokio::spawn(async move {
        match event {
            DeleteEvent::Policies(ids) => index.bulk_delete(&ids).await,
            DeleteEvent::Subjects {
                timestamp,
                subjects,
            } => index.bulk_delete_by_subjects(timestamp, &subjects).await,
            DeleteEvent::TemplateSubjects { timestamp, entries } => {
                // template deletions target one template per entry
                for entry in entries {
                    index
                        .bulk_delete_by_template_subjects(
                            timestamp,
                            entry.template_id,
                            std::slice::from_ref(&entry.subject),
                        )
                        .await;
                }
            }
        }
        drop(permit);
    });
}

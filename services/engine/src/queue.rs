//! Deletion event queue consumption.
//!
//! The authority publishes deletion events onto a Redis list. The consumer
//! uses the reliable-queue pattern: `RPOPLPUSH` moves an event into a
//! processing list, and only a successful hand-off acknowledges it with
//! `LREM`. Events left in the processing list by a crash are requeued on
//! startup.
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::VecDeque;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue broker unavailable: {0}")]
    Broker(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::Broker(err.to_string())
    }
}

pub type QueueResult<T> = Result<T, QueueError>;

#[async_trait]
pub trait DeletionQueue: Send + Sync {
    /// Pops the next raw event, holding it un-acknowledged.
    async fn pull(&self) -> QueueResult<Option<String>>;

    /// Acknowledges an event previously returned by `pull`.
    async fn ack(&self, raw: &str) -> QueueResult<()>;

    /// Returns events orphaned by a crash to the main queue.
    async fn recover(&self) -> QueueResult<usize>;
}

pub struct RedisDeletionQueue {
    manager: ConnectionManager,
    queue_key: String,
    processing_key: String,
}

impl RedisDeletionQueue {
    pub async fn connect(url: &str, queue_key: impl Into<String>) -> QueueResult<Self> {
        let client = redis::Client::open(url).map_err(QueueError::from)?;
        let manager = ConnectionManager::new(client).await?;
        let queue_key = queue_key.into();
        let processing_key = format!("{queue_key}:processing");
        Ok(Self {
            manager,
            queue_key,
            processing_key,
        })
    }
}

#[async_trait]
impl DeletionQueue for RedisDeletionQueue {
    async fn pull(&self) -> QueueResult<Option<String>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn
            .rpoplpush(&self.queue_key, &self.processing_key)
            .await?;
        Ok(raw)
    }

    async fn ack(&self, raw: &str) -> QueueResult<()> {
        let mut conn = self.manager.clone();
        let _removed: i64 = conn.lrem(&self.processing_key, 1, raw).await?;
        Ok(())
    }

    async fn recover(&self) -> QueueResult<usize> {
        let mut conn = self.manager.clone();
        let orphaned: Vec<String> = conn.lrange(&self.processing_key, 0, -1).await?;
        if orphaned.is_empty() {
            return Ok(0);
        }
        let count = orphaned.len();
        let _: i64 = conn.rpush(&self.queue_key, &orphaned).await?;
        let _: i64 = conn.del(&self.processing_key).await?;
        Ok(count)
    }
}

/// In-memory queue for tests and brokerless local runs.
#[derive(Default)]
pub struct MemoryDeletionQueue {
    pending: Mutex<VecDeque<String>>,
    processing: Mutex<Vec<String>>,
}

impl MemoryDeletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, raw: impl Into<String>) {
        self.pending
            .lock()
            .expect("queue lock")
            .push_back(raw.into());
    }

    pub fn processing_len(&self) -> usize {
        self.processing.lock().expect("queue lock").len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().expect("queue lock").len()
    }
}

#[async_trait]
impl DeletionQueue for MemoryDeletionQueue {
    async fn pull(&self) -> QueueResult<Option<String>> {
        let raw = self.pending.lock().expect("queue lock").pop_front();
        if let Some(raw) = &raw {
            self.processing.lock().expect("queue lock").push(raw.clone());
        }
        Ok(raw)
    }

    async fn ack(&self, raw: &str) -> QueueResult<()> {
        let mut processing = self.processing.lock().expect("queue lock");
        if let Some(position) = processing.iter().position(|item| item == raw) {
            processing.remove(position);
        }
        Ok(())
    }

    async fn recover(&self) -> QueueResult<usize> {
        let mut processing = self.processing.lock().expect("queue lock");
        let count = processing.len();
        let mut pending = self.pending.lock().expect("queue lock");
        for item in processing.drain(..) {
            pending.push_back(item);
        }
        Ok(count)
    }
}

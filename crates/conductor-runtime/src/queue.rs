//! Queue adapter contract and in-memory implementation.
//!
//! The queue is an at-least-once substrate: a received message stays
//! invisible for the visibility timeout and reappears if not deleted in
//! time. Retry delay is data on the re-sent message; the adapter holds the
//! message back until the delay elapses. Dead-letter routing after a
//! receive-count threshold belongs to the backing queue service, not the
//! worker.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Errors from the queue adapter.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue receive failed: {0}")]
    Receive(String),

    #[error("queue send failed: {0}")]
    Send(String),

    #[error("unknown receipt handle")]
    UnknownReceipt,
}

/// One delivered message.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub id: String,
    /// Opaque handle identifying this delivery for `delete`.
    pub receipt: String,
    pub body: String,
    /// Times this message has been received, including this delivery.
    pub receive_count: u32,
}

/// At-least-once delivery substrate.
#[async_trait]
pub trait QueueAdapter: Send + Sync {
    /// Long-poll for up to `max_messages`, waiting at most `wait`.
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Acknowledge a delivery, removing the message permanently.
    async fn delete(&self, message: &QueueMessage) -> Result<(), QueueError>;

    /// Enqueue a body, held back for `delay` before becoming receivable.
    async fn send(&self, body: String, delay: Duration) -> Result<(), QueueError>;
}

struct Entry {
    id: u64,
    body: String,
    /// Not receivable before this instant (send delay).
    ready_at: Instant,
    /// Hidden until this instant after a receive (visibility timeout).
    invisible_until: Option<Instant>,
    receive_count: u32,
    /// Receipt of the delivery currently holding the message.
    receipt: Option<String>,
}

struct QueueInner {
    entries: Vec<Entry>,
    next_id: u64,
}

/// In-memory queue for tests and single-node deployments.
///
/// Honors send delay, visibility timeout, and receive counting exactly as
/// the external queue contract describes, so executor behavior under
/// duplicate delivery can be exercised without a real queue service.
pub struct InMemoryQueue {
    inner: Mutex<QueueInner>,
    visibility_timeout: Duration,
}

impl InMemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                entries: Vec::new(),
                next_id: 1,
            }),
            visibility_timeout,
        }
    }

    /// Messages currently queued (visible or not). Test hook.
    pub fn depth(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Earliest ready-at delay remaining among queued messages. Test hook
    /// for asserting retry delays.
    pub fn next_ready_in(&self) -> Option<Duration> {
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .iter()
            .map(|e| e.ready_at.saturating_duration_since(now))
            .min()
    }

    fn try_receive(&self, max_messages: usize) -> Vec<QueueMessage> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let mut received = Vec::new();

        for entry in inner.entries.iter_mut() {
            if received.len() >= max_messages {
                break;
            }
            if entry.ready_at > now {
                continue;
            }
            if let Some(until) = entry.invisible_until {
                if until > now {
                    continue;
                }
            }
            entry.receive_count += 1;
            entry.invisible_until = Some(now + self.visibility_timeout);
            let receipt = format!("{}:{}", entry.id, entry.receive_count);
            entry.receipt = Some(receipt.clone());
            received.push(QueueMessage {
                id: entry.id.to_string(),
                receipt,
                body: entry.body.clone(),
                receive_count: entry.receive_count,
            });
        }
        received
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[async_trait]
impl QueueAdapter for InMemoryQueue {
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let batch = self.try_receive(max_messages);
            if !batch.is_empty() {
                return Ok(batch);
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn delete(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|e| e.receipt.as_deref() != Some(message.receipt.as_str()));
        if inner.entries.len() == before {
            return Err(QueueError::UnknownReceipt);
        }
        Ok(())
    }

    async fn send(&self, body: String, delay: Duration) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.push(Entry {
            id,
            body,
            ready_at: Instant::now() + delay,
            invisible_until: None,
            receive_count: 0,
            receipt: None,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn send_then_receive_then_delete() {
        let queue = InMemoryQueue::default();
        queue.send("m1".to_string(), Duration::ZERO).await.unwrap();

        let batch = queue.receive(10, Duration::from_secs(1)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body, "m1");
        assert_eq!(batch[0].receive_count, 1);

        queue.delete(&batch[0]).await.unwrap();
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_message_not_visible_early() {
        let queue = InMemoryQueue::default();
        queue
            .send("later".to_string(), Duration::from_secs(4))
            .await
            .unwrap();

        let early = queue.receive(10, Duration::from_secs(1)).await.unwrap();
        assert!(early.is_empty());

        tokio::time::advance(Duration::from_secs(4)).await;
        let batch = queue.receive(10, Duration::from_secs(1)).await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn visibility_timeout_redelivers_unacked() {
        let queue = InMemoryQueue::new(Duration::from_secs(30));
        queue.send("m".to_string(), Duration::ZERO).await.unwrap();

        let first = queue.receive(10, Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.len(), 1);

        // Still invisible
        let none = queue.receive(10, Duration::from_millis(100)).await.unwrap();
        assert!(none.is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        let again = queue.receive(10, Duration::from_secs(1)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].receive_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_receipt_cannot_delete_redelivered_message() {
        let queue = InMemoryQueue::new(Duration::from_secs(30));
        queue.send("m".to_string(), Duration::ZERO).await.unwrap();

        let first = queue.receive(10, Duration::from_secs(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        let second = queue.receive(10, Duration::from_secs(1)).await.unwrap();
        assert_eq!(second.len(), 1);

        // The first delivery's receipt is superseded
        assert!(queue.delete(&first[0]).await.is_err());
        queue.delete(&second[0]).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn batch_size_is_respected() {
        let queue = InMemoryQueue::default();
        for i in 0..15 {
            queue.send(format!("m{i}"), Duration::ZERO).await.unwrap();
        }
        let batch = queue.receive(10, Duration::from_secs(1)).await.unwrap();
        assert_eq!(batch.len(), 10);
    }
}

//! Relay queue between the pacing loop and the broadcaster
//!
//! A bounded single-producer/single-consumer channel. The producer never
//! waits: when the queue is full the newest payload is discarded and the
//! queued ones keep their order.

use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::{AppError, Result};
use crate::video::encoder::Payload;

/// Default relay capacity
pub const DEFAULT_QUEUE_SIZE: usize = 2;

/// Create a relay queue holding at most `capacity` payloads
pub fn relay_queue(capacity: usize) -> Result<(RelaySender, RelayReceiver)> {
    if capacity == 0 {
        return Err(AppError::Config(
            "relay queue capacity must be at least 1".to_string(),
        ));
    }

    let (tx, rx) = mpsc::channel(capacity);
    Ok((RelaySender { tx }, RelayReceiver { rx }))
}

/// Producer half, owned by the pacing loop
#[derive(Debug)]
pub struct RelaySender {
    tx: mpsc::Sender<Arc<Payload>>,
}

impl RelaySender {
    /// Enqueue without waiting
    ///
    /// Returns `false` and discards `payload` when the queue is full or the
    /// consumer is gone.
    pub fn try_enqueue(&self, payload: Arc<Payload>) -> bool {
        match self.tx.try_send(payload) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Consumer half, owned by the broadcaster
#[derive(Debug)]
pub struct RelayReceiver {
    rx: mpsc::Receiver<Arc<Payload>>,
}

impl RelayReceiver {
    /// Wait for the next payload
    ///
    /// Returns `None` once the producer is gone and the queue is drained.
    pub async fn dequeue(&mut self) -> Option<Arc<Payload>> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::encoder::PayloadMeta;
    use crate::video::frame::Resolution;

    fn payload(sequence: u64) -> Arc<Payload> {
        let meta = PayloadMeta::new(sequence, 24.0, Resolution::new(2, 2));
        Arc::new(Payload::from_image(&sequence.to_be_bytes(), meta).unwrap())
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(relay_queue(0), Err(AppError::Config(_))));
    }

    #[tokio::test]
    async fn test_fifo_below_capacity() {
        let (tx, mut rx) = relay_queue(DEFAULT_QUEUE_SIZE).unwrap();

        assert!(tx.try_enqueue(payload(0)));
        assert!(tx.try_enqueue(payload(1)));
        drop(tx);

        // Each payload comes out exactly once
        assert_eq!(rx.dequeue().await.unwrap().sequence(), 0);
        assert_eq!(rx.dequeue().await.unwrap().sequence(), 1);
        assert!(rx.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn test_full_queue_drops_newest() {
        let (tx, mut rx) = relay_queue(2).unwrap();

        assert!(tx.try_enqueue(payload(0)));
        assert!(tx.try_enqueue(payload(1)));
        assert!(!tx.try_enqueue(payload(2)));
        assert!(!tx.try_enqueue(payload(3)));

        // Existing entries survive untouched
        assert_eq!(rx.dequeue().await.unwrap().sequence(), 0);

        // Space frees up again after a dequeue
        assert!(tx.try_enqueue(payload(4)));
        assert_eq!(rx.dequeue().await.unwrap().sequence(), 1);
        assert_eq!(rx.dequeue().await.unwrap().sequence(), 4);

        drop(tx);
        assert!(rx.dequeue().await.is_none());
    }

    #[test]
    fn test_dequeue_pending_while_empty() {
        let (tx, mut rx) = relay_queue(2).unwrap();
        let mut dequeue = tokio_test::task::spawn(rx.dequeue());

        tokio_test::assert_pending!(dequeue.poll());
        assert!(tx.try_enqueue(payload(5)));
        assert!(dequeue.is_woken());

        let payload = tokio_test::assert_ready!(dequeue.poll());
        assert_eq!(payload.map(|p| p.sequence()), Some(5));
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_producer() {
        let (tx, mut rx) = relay_queue(2).unwrap();

        let consumer = tokio::spawn(async move { rx.dequeue().await.map(|p| p.sequence()) });
        tokio::task::yield_now().await;
        assert!(tx.try_enqueue(payload(9)));

        assert_eq!(consumer.await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn test_closed_after_producer_dropped() {
        let (tx, mut rx) = relay_queue(2).unwrap();
        assert!(tx.try_enqueue(payload(0)));
        drop(tx);

        // Queued payloads are still delivered before the end signal
        assert_eq!(rx.dequeue().await.unwrap().sequence(), 0);
        assert!(rx.dequeue().await.is_none());
    }

    #[test]
    fn test_enqueue_after_consumer_dropped() {
        let (tx, rx) = relay_queue(2).unwrap();
        drop(rx);
        assert!(!tx.try_enqueue(payload(0)));
    }
}

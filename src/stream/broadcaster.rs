//! Broadcaster: drains the relay queue and fans payloads out
//!
//! Every payload goes to a snapshot of the registry. Sends run
//! concurrently; a failed send removes (and closes) that subscriber after
//! the pass and never affects the others or the producer.

use futures::future::join_all;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pipeline::PipelineCounters;
use super::registry::{ConnectionRegistry, Subscriber, SubscriberId};
use super::relay::RelayReceiver;
use crate::error::{AppError, Result};
use crate::video::encoder::Payload;

/// Outcome of one fan-out pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutReport {
    /// Subscribers that accepted the payload
    pub delivered: usize,
    /// Subscribers removed because their send failed
    pub removed: Vec<SubscriberId>,
}

pub struct Broadcaster {
    relay: RelayReceiver,
    registry: Arc<ConnectionRegistry>,
    counters: Arc<PipelineCounters>,
    send_timeout: Option<Duration>,
}

impl Broadcaster {
    pub fn new(
        relay: RelayReceiver,
        registry: Arc<ConnectionRegistry>,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        Self {
            relay,
            registry,
            counters,
            send_timeout: None,
        }
    }

    /// Treat sends slower than `timeout` as failures
    pub fn with_send_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Run until cancelled or until the producer goes away
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Broadcaster started");

        loop {
            let payload = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Broadcaster cancelled");
                    break;
                }
                payload = self.relay.dequeue() => match payload {
                    Some(payload) => payload,
                    None => {
                        debug!("Relay queue closed");
                        break;
                    }
                },
            };

            self.fan_out(&payload).await;
        }

        info!("Broadcaster stopped");
    }

    /// Deliver one payload to every registered subscriber
    pub async fn fan_out(&self, payload: &Payload) -> FanOutReport {
        let targets = self.registry.snapshot();
        self.counters.payloads_broadcast.fetch_add(1, Ordering::Relaxed);

        if targets.is_empty() {
            return FanOutReport::default();
        }

        let sends = targets.iter().map(|(id, subscriber)| async move {
            let result = self.deliver(subscriber.as_ref(), payload).await;
            (*id, result)
        });

        let mut report = FanOutReport::default();
        for (id, result) in join_all(sends).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    debug!(subscriber = %id, sequence = payload.sequence(), "Send failed: {}", e);
                    report.removed.push(id);
                }
            }
        }

        for id in &report.removed {
            if let Some(subscriber) = self.registry.remove(*id) {
                warn!(
                    subscriber = %id,
                    peer = %subscriber.describe(),
                    "Dropping subscriber after failed send"
                );
                subscriber.close().await;
            }
        }

        self.counters
            .deliveries
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.counters
            .send_failures
            .fetch_add(report.removed.len() as u64, Ordering::Relaxed);

        report
    }

    async fn deliver(&self, subscriber: &dyn Subscriber, payload: &Payload) -> Result<()> {
        match self.send_timeout {
            Some(timeout) => tokio::time::timeout(timeout, subscriber.send(payload))
                .await
                .map_err(|_| {
                    AppError::SendFailure(format!("send timed out after {:?}", timeout))
                })?,
            None => subscriber.send(payload).await,
        }
    }
}

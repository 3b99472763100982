//! Stream pipeline: wires source, encoder, relay queue and broadcaster
//!
//! ```text
//! FrameSource ─> FrameEncoder ─> RelayQueue ─> Broadcaster ─> subscribers
//! └──────────── Pacer task ──────────────┘     └─ Broadcaster task ─┘
//! ```
//!
//! The pacer task is the sole producer and the broadcaster task the sole
//! consumer. A fatal source error stops both tasks and leaves the pipeline
//! in `PipelineState::Failed`; restarting is up to the owner.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::broadcaster::Broadcaster;
use super::registry::{ConnectionRegistry, Subscriber, SubscriberId};
use super::relay::{relay_queue, DEFAULT_QUEUE_SIZE};
use crate::config::StreamConfig;
use crate::error::{AppError, Result};
use crate::video::encoder::{FrameEncoder, JpegEncoder};
use crate::video::frame::Resolution;
use crate::video::pacer::Pacer;
use crate::video::source::{FfmpegSource, FrameSource};

/// Runtime parameters of one pipeline instance
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    /// Target frame rate
    pub fps: f64,
    /// Relay queue capacity
    pub queue_size: usize,
    /// Per-subscriber send timeout
    pub send_timeout: Option<Duration>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            fps: 24.0,
            queue_size: DEFAULT_QUEUE_SIZE,
            send_timeout: None,
        }
    }
}

impl From<&StreamConfig> for PipelineOptions {
    fn from(config: &StreamConfig) -> Self {
        Self {
            fps: config.fps,
            queue_size: config.queue_size,
            send_timeout: config.send_timeout(),
        }
    }
}

/// Counters shared by the pipeline tasks
#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub frames_produced: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub encode_errors: AtomicU64,
    pub payloads_broadcast: AtomicU64,
    pub deliveries: AtomicU64,
    pub send_failures: AtomicU64,
}

/// Pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Producing and broadcasting
    Running,
    /// Stopped on request
    Stopped,
    /// Stopped by a fatal source error
    Failed,
}

impl PipelineState {
    pub fn is_running(&self) -> bool {
        matches!(self, PipelineState::Running)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Running => write!(f, "running"),
            PipelineState::Stopped => write!(f, "stopped"),
            PipelineState::Failed => write!(f, "failed"),
        }
    }
}

/// Point-in-time pipeline statistics
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub state: PipelineState,
    pub resolution: Resolution,
    pub fps: f64,
    pub queue_size: usize,
    pub frames_produced: u64,
    pub frames_dropped: u64,
    pub encode_errors: u64,
    pub payloads_broadcast: u64,
    pub deliveries: u64,
    pub send_failures: u64,
    pub subscribers: usize,
    /// Reason of the fatal error when `state` is `failed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Pipeline entry points
pub struct StreamPipeline;

impl StreamPipeline {
    /// Open the configured source and start streaming it
    ///
    /// Fails with `AppError::SourceUnavailable` when the source cannot be
    /// probed or started.
    pub async fn start(config: &StreamConfig) -> Result<PipelineHandle> {
        let encoder = JpegEncoder::new(config.jpeg_quality)?;
        let source = FfmpegSource::open(&config.ffmpeg_options()).await?;
        info!(
            "Opened source {} ({})",
            source.location(),
            source.resolution()
        );
        Self::start_with(source, encoder, PipelineOptions::from(config))
    }

    /// Start a pipeline from already constructed parts
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_with<S, E>(source: S, encoder: E, options: PipelineOptions) -> Result<PipelineHandle>
    where
        S: FrameSource + 'static,
        E: FrameEncoder + 'static,
    {
        let resolution = source.resolution();
        let counters = Arc::new(PipelineCounters::default());
        let registry = Arc::new(ConnectionRegistry::new());

        let (relay_tx, relay_rx) = relay_queue(options.queue_size)?;
        let pacer = Pacer::new(source, encoder, relay_tx, options.fps, counters.clone())?;
        let broadcaster = Broadcaster::new(relay_rx, registry.clone(), counters.clone())
            .with_send_timeout(options.send_timeout);

        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(PipelineState::Running);
        let failure = Arc::new(Mutex::new(None));

        let pacer_task = {
            let cancel = cancel.clone();
            let failure = failure.clone();
            tokio::spawn(async move {
                let state = match pacer.run(cancel.clone()).await {
                    Ok(()) => PipelineState::Stopped,
                    Err(e) => {
                        error!("Pipeline failed: {}", e);
                        *failure.lock() = Some(e.to_string());
                        PipelineState::Failed
                    }
                };
                // Take the broadcaster down with the producer
                cancel.cancel();
                state_tx.send_replace(state);
            })
        };
        let broadcaster_task = tokio::spawn(broadcaster.run(cancel.clone()));

        info!(
            "Pipeline started: {} @ {} fps, queue size {}",
            resolution, options.fps, options.queue_size
        );

        Ok(PipelineHandle {
            registry,
            counters,
            options,
            resolution,
            state: state_rx,
            cancel,
            tasks: tokio::sync::Mutex::new(vec![pacer_task, broadcaster_task]),
            failure,
        })
    }
}

/// Handle to a running pipeline
///
/// Dropping the handle does not stop the pipeline; call `stop`.
pub struct PipelineHandle {
    registry: Arc<ConnectionRegistry>,
    counters: Arc<PipelineCounters>,
    options: PipelineOptions,
    resolution: Resolution,
    state: watch::Receiver<PipelineState>,
    cancel: CancellationToken,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl PipelineHandle {
    /// Add a subscriber; it receives payloads produced from now on
    pub fn register_subscriber(&self, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        self.registry.add(subscriber)
    }

    /// Remove a subscriber; unknown IDs are ignored
    pub fn unregister_subscriber(&self, id: SubscriberId) -> bool {
        self.registry.remove(id).is_some()
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Subscribe to state changes
    pub fn state_watch(&self) -> watch::Receiver<PipelineState> {
        self.state.clone()
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Reason of the fatal error, if the pipeline failed
    pub fn last_error(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            state: self.state(),
            resolution: self.resolution,
            fps: self.options.fps,
            queue_size: self.options.queue_size,
            frames_produced: self.counters.frames_produced.load(Ordering::Relaxed),
            frames_dropped: self.counters.frames_dropped.load(Ordering::Relaxed),
            encode_errors: self.counters.encode_errors.load(Ordering::Relaxed),
            payloads_broadcast: self.counters.payloads_broadcast.load(Ordering::Relaxed),
            deliveries: self.counters.deliveries.load(Ordering::Relaxed),
            send_failures: self.counters.send_failures.load(Ordering::Relaxed),
            subscribers: self.registry.len(),
            error: self.last_error(),
        }
    }

    /// Stop both tasks and release the source
    ///
    /// Idempotent. In-flight sends are allowed to finish.
    pub async fn stop(&self) {
        if self.state().is_running() {
            info!("Stopping pipeline");
        }
        self.cancel.cancel();
        self.join().await;
    }

    /// Wait until the pipeline stops
    ///
    /// Returns the fatal error when the pipeline failed.
    pub async fn wait(&self) -> Result<()> {
        let mut state = self.state.clone();
        if state.wait_for(|s| !s.is_running()).await.is_err() {
            warn!("Pipeline state channel closed while running");
        }
        self.join().await;

        match self.last_error() {
            Some(reason) => Err(AppError::SourceTerminated(reason)),
            None => Ok(()),
        }
    }

    async fn join(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Pipeline task panicked: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::encoder::{Payload, PayloadMeta};
    use crate::video::frame::Frame;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    const RES: Resolution = Resolution::new(4, 2);

    struct ScriptedSource {
        next: u64,
        fail_at: Option<u64>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl FrameSource for ScriptedSource {
        fn resolution(&self) -> Resolution {
            RES
        }

        async fn next_frame(&mut self) -> Result<Frame> {
            if self.fail_at == Some(self.next) {
                return Err(AppError::SourceTerminated("decoder exited: 1".to_string()));
            }
            let frame = Frame::from_vec(vec![0; RES.frame_size()], RES, self.next);
            self.next += 1;
            Ok(frame)
        }

        async fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct MetaOnlyEncoder;

    impl FrameEncoder for MetaOnlyEncoder {
        fn name(&self) -> &str {
            "meta-only"
        }

        fn encode(&mut self, frame: &Frame, sequence: u64, fps: f64) -> Result<Payload> {
            Payload::from_image(&[], PayloadMeta::new(sequence, fps, frame.resolution()))
        }
    }

    #[derive(Default)]
    struct Collector {
        sequences: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl Subscriber for Collector {
        fn describe(&self) -> String {
            "collector".to_string()
        }

        async fn send(&self, payload: &Payload) -> Result<()> {
            self.sequences.lock().push(payload.sequence());
            Ok(())
        }

        async fn close(&self) {}
    }

    fn source(fail_at: Option<u64>) -> (ScriptedSource, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        (
            ScriptedSource {
                next: 0,
                fail_at,
                closed: closed.clone(),
            },
            closed,
        )
    }

    fn options(fps: f64) -> PipelineOptions {
        PipelineOptions {
            fps,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_invalid_options_rejected() {
        let (src, _) = source(None);
        let result = StreamPipeline::start_with(
            src,
            MetaOnlyEncoder,
            PipelineOptions {
                queue_size: 0,
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(AppError::Config(_))));

        let (src, _) = source(None);
        let result = StreamPipeline::start_with(src, MetaOnlyEncoder, options(0.0));
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_termination_fails_pipeline() {
        let (src, closed) = source(Some(5));
        let handle = StreamPipeline::start_with(src, MetaOnlyEncoder, options(10.0)).unwrap();

        let result = handle.wait().await;
        assert!(matches!(result, Err(AppError::SourceTerminated(_))));
        assert_eq!(handle.state(), PipelineState::Failed);
        assert!(closed.load(Ordering::SeqCst));

        let stats = handle.stats();
        assert_eq!(stats.frames_produced, 5);
        assert!(stats.error.is_some());

        // Nothing more is produced after the failure
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.stats().frames_produced, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_releases_source() {
        let (src, closed) = source(None);
        let handle = StreamPipeline::start_with(src, MetaOnlyEncoder, options(10.0)).unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        handle.stop().await;

        assert_eq!(handle.state(), PipelineState::Stopped);
        assert!(closed.load(Ordering::SeqCst));
        assert!(handle.wait().await.is_ok());

        // Second stop is a no-op
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_subscriber_gets_no_backlog() {
        let (src, _) = source(None);
        let handle = StreamPipeline::start_with(src, MetaOnlyEncoder, options(10.0)).unwrap();

        let early = Arc::new(Collector::default());
        handle.register_subscriber(early.clone());

        // Frames 0..=5 are produced before the second viewer joins
        tokio::time::sleep(Duration::from_millis(550)).await;
        let late = Arc::new(Collector::default());
        let late_id = handle.register_subscriber(late.clone());

        tokio::time::sleep(Duration::from_millis(500)).await;
        handle.stop().await;

        let early = early.sequences.lock().clone();
        let late = late.sequences.lock().clone();
        assert_eq!(early, (0..early.len() as u64).collect::<Vec<_>>());
        assert!(!late.is_empty());
        assert!(late[0] >= 6, "late subscriber saw backlog: {:?}", late);
        assert!(late.windows(2).all(|w| w[0] < w[1]));

        assert!(handle.unregister_subscriber(late_id));
        assert!(!handle.unregister_subscriber(late_id));
        assert_eq!(handle.stats().subscribers, 1);
    }
}

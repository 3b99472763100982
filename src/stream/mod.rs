//! Payload distribution
//!
//! # Components
//!
//! - `relay` - Bounded drop-on-full queue between the pacer and the broadcaster
//! - `registry` - Live subscriber set with snapshot iteration
//! - `broadcaster` - Fan-out of each payload to every subscriber
//! - `pipeline` - Task wiring, lifecycle and statistics

pub mod broadcaster;
pub mod pipeline;
pub mod registry;
pub mod relay;

pub use broadcaster::{Broadcaster, FanOutReport};
pub use pipeline::{
    PipelineCounters, PipelineHandle, PipelineOptions, PipelineState, PipelineStats,
    StreamPipeline,
};
pub use registry::{ConnectionRegistry, Subscriber, SubscriberGuard, SubscriberId};
pub use relay::{relay_queue, RelayReceiver, RelaySender, DEFAULT_QUEUE_SIZE};

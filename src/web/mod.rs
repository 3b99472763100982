//! HTTP/WebSocket serving layer
//!
//! Accepts viewer connections and hands them to the pipeline; it does no
//! pipeline work itself.

mod handlers;
mod routes;
mod ws;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::stream::PipelineHandle;

pub use routes::create_router;
pub use ws::{ws_handler, WsSubscriber};

/// Shared state of the web handlers
pub struct AppState {
    pub pipeline: Arc<PipelineHandle>,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(pipeline: Arc<PipelineHandle>, config: AppConfig) -> Arc<Self> {
        Arc::new(Self { pipeline, config })
    }
}

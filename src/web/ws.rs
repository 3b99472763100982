//! WebSocket viewer endpoint
//!
//! Each connection at `/ws` becomes one subscriber of the pipeline. The
//! write half is registered with the broadcaster; this task only watches
//! the read half for disconnects and ignores anything the client sends.

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use super::AppState;
use crate::error::{AppError, Result};
use crate::stream::{PipelineState, Subscriber, SubscriberGuard};
use crate::video::encoder::Payload;

/// Write half of a viewer's WebSocket
pub struct WsSubscriber {
    peer: String,
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

impl WsSubscriber {
    pub fn new(peer: impl Into<String>, sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            peer: peer.into(),
            sink: Mutex::new(sink),
        }
    }
}

#[async_trait]
impl Subscriber for WsSubscriber {
    fn describe(&self) -> String {
        self.peer.clone()
    }

    async fn send(&self, payload: &Payload) -> Result<()> {
        self.sink
            .lock()
            .await
            .send(Message::Text(payload.text().to_owned()))
            .await
            .map_err(|e| AppError::SendFailure(e.to_string()))
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        // Fails harmlessly when the peer is already gone
        if let Err(e) = sink.send(Message::Close(None)).await {
            debug!(peer = %self.peer, "Close frame not sent: {}", e);
        }
        if let Err(e) = sink.close().await {
            debug!(peer = %self.peer, "WebSocket close failed: {}", e);
        }
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, addr, state))
}

async fn handle_socket(socket: WebSocket, addr: SocketAddr, state: Arc<AppState>) {
    let (sender, mut receiver) = socket.split();
    let subscriber = Arc::new(WsSubscriber::new(addr.to_string(), sender));
    let guard = SubscriberGuard::register(state.pipeline.registry(), subscriber.clone());
    let mut pipeline_state = state.pipeline.state_watch();

    info!(subscriber = %guard.id(), peer = %addr, "Viewer connected");

    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | None => {
                    debug!(peer = %addr, "Viewer closed connection");
                    break;
                }
                Some(Err(e)) => {
                    debug!(peer = %addr, "WebSocket receive error: {}", e);
                    break;
                }
                // Client messages carry no meaning
                Some(Ok(_)) => {}
            },
            _ = pipeline_stopped(&mut pipeline_state) => {
                debug!(peer = %addr, "Pipeline stopped, closing viewer");
                break;
            }
        }
    }

    drop(guard);
    subscriber.close().await;
    info!(peer = %addr, "Viewer disconnected");
}

async fn pipeline_stopped(state: &mut watch::Receiver<PipelineState>) {
    let _ = state.wait_for(|s| !s.is_running()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::stream::{PipelineHandle, PipelineOptions, StreamPipeline};
    use crate::video::encoder::{FrameEncoder, PayloadMeta};
    use crate::video::frame::{Frame, Resolution};
    use crate::video::source::FrameSource;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message as ClientMessage;

    const RES: Resolution = Resolution::new(8, 4);

    struct BlankSource {
        next: u64,
    }

    #[async_trait]
    impl FrameSource for BlankSource {
        fn resolution(&self) -> Resolution {
            RES
        }

        async fn next_frame(&mut self) -> Result<Frame> {
            let frame = Frame::from_vec(vec![0; RES.frame_size()], RES, self.next);
            self.next += 1;
            Ok(frame)
        }

        async fn close(&mut self) {}
    }

    struct FixedImageEncoder;

    impl FrameEncoder for FixedImageEncoder {
        fn name(&self) -> &str {
            "fixed"
        }

        fn encode(&mut self, frame: &Frame, sequence: u64, fps: f64) -> Result<Payload> {
            Payload::from_image(
                &[0xFF, 0xD8, 0xFF, 0xD9],
                PayloadMeta::new(sequence, fps, frame.resolution()),
            )
        }
    }

    async fn serve() -> (SocketAddr, Arc<PipelineHandle>) {
        let options = PipelineOptions {
            fps: 50.0,
            ..Default::default()
        };
        let pipeline = Arc::new(
            StreamPipeline::start_with(BlankSource { next: 0 }, FixedImageEncoder, options)
                .unwrap(),
        );
        let state = AppState::new(pipeline.clone(), AppConfig::default());
        let router = super::super::create_router(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        (addr, pipeline)
    }

    async fn wait_for_subscribers(pipeline: &PipelineHandle, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while pipeline.stats().subscribers != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_viewer_receives_frames_and_unregisters() {
        let (addr, pipeline) = serve().await;

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
            .await
            .unwrap();
        wait_for_subscribers(&pipeline, 1).await;

        // Client chatter is ignored
        client
            .send(ClientMessage::Text("hello".to_string()))
            .await
            .unwrap();

        let mut sequences = Vec::new();
        while sequences.len() < 3 {
            let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let ClientMessage::Text(text) = msg {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["image"], "/9j/2Q==");
                assert_eq!(value["meta"]["width"], 8);
                assert_eq!(value["meta"]["height"], 4);
                assert_eq!(value["meta"]["fps"], 50.0);
                sequences.push(value["meta"]["frame"].as_u64().unwrap());
            }
        }
        assert!(sequences.windows(2).all(|w| w[0] < w[1]));

        client.close(None).await.unwrap();
        wait_for_subscribers(&pipeline, 0).await;

        pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_viewers_closed_when_pipeline_stops() {
        let (addr, pipeline) = serve().await;

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
            .await
            .unwrap();
        wait_for_subscribers(&pipeline, 1).await;

        pipeline.stop().await;

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match client.next().await {
                    Some(Ok(ClientMessage::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok());
        wait_for_subscribers(&pipeline, 0).await;
    }
}

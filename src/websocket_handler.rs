use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use bytes::Bytes;
use chrono::Utc;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::connection_registry::ClientChannel;
use crate::metrics::iso_timestamp;
use crate::metrics_bridge::{MetricsBridge, MetricsSession};
use crate::runtime::container_name;
use crate::terminal_bridge::{TerminalBridge, TerminalSession};
use crate::AppState;

/// Outbound socket half shared by every per-connection task.
struct WsChannel {
    sink: tokio::sync::Mutex<SplitSink<WebSocket, Message>>,
}

impl WsChannel {
    fn new(sink: SplitSink<WebSocket, Message>) -> Arc<Self> {
        Arc::new(Self {
            sink: tokio::sync::Mutex::new(sink),
        })
    }
}

#[async_trait]
impl ClientChannel for WsChannel {
    async fn send_text(&self, text: String) -> bool {
        self.sink
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .is_ok()
    }

    async fn send_ping(&self) -> bool {
        self.sink
            .lock()
            .await
            .send(Message::Ping(Bytes::new()))
            .await
            .is_ok()
    }

    async fn send_close(&self) {
        let _ = self.sink.lock().await.send(Message::Close(None)).await;
    }
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "botId")]
    pub bot_id: Option<String>,
}

pub async fn terminal_ws(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_terminal_socket(state, socket, query.bot_id))
}

pub async fn metrics_ws(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_metrics_socket(state, socket, query.bot_id))
}

async fn handle_terminal_socket(state: AppState, socket: WebSocket, bot_id: Option<String>) {
    let (sink, mut receiver) = socket.split();
    let channel = WsChannel::new(sink);

    // Hard rejections happen before any runtime call and create no state.
    let Some(bot_id) = bot_id else {
        channel
            .send_text("[Error] botId query parameter is required".to_string())
            .await;
        channel.send_close().await;
        return;
    };

    let descriptor = match state.runtime.inspect(&container_name(&bot_id)).await {
        Ok(descriptor) => descriptor,
        Err(err) => {
            channel
                .send_text(format!("[Error] Could not access container: {}", err))
                .await;
            channel.send_close().await;
            return;
        }
    };

    info!("Terminal connection opened for bot {}", bot_id);
    let session = TerminalSession::new(
        bot_id.clone(),
        descriptor.id.clone(),
        channel,
        descriptor.state.running,
    );
    state.terminal_connections.insert(&bot_id, session.clone());

    let bridge = TerminalBridge::new(
        state.runtime.clone(),
        state.terminal_connections.clone(),
        state.config.streams,
    );

    // Backlog always flushes before anything live.
    bridge.send_backlog(&session).await;
    if session.is_running.load(Ordering::SeqCst) {
        session.send_status("Connected - streaming live logs").await;
        bridge.attach_live_stream(&session);
    } else {
        session
            .send_status("Bot stopped - waiting for start...")
            .await;
        bridge.spawn_event_monitor(&session);
    }
    bridge.spawn_keepalive(&session);

    loop {
        tokio::select! {
            message = receiver.next() => match message {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                // The terminal view is read-only.
                Some(Ok(_)) => {}
            },
            _ = session.closed_notify.notified() => break,
        }
    }

    state.terminal_connections.release(&bot_id, &session);
    info!("Terminal connection closed for bot {}", bot_id);
}

async fn handle_metrics_socket(state: AppState, socket: WebSocket, bot_id: Option<String>) {
    let (sink, mut receiver) = socket.split();
    let channel = WsChannel::new(sink);

    let Some(bot_id) = bot_id else {
        send_json_error(&channel, "botId query parameter is required").await;
        channel.send_close().await;
        return;
    };

    let descriptor = match state.runtime.inspect(&container_name(&bot_id)).await {
        Ok(descriptor) => descriptor,
        Err(err) => {
            send_json_error(&channel, &format!("Could not access container: {}", err)).await;
            channel.send_close().await;
            return;
        }
    };

    info!("Metrics connection opened for bot {}", bot_id);
    let session = MetricsSession::new(bot_id.clone(), channel, descriptor);
    state.metrics_connections.insert(&bot_id, session.clone());

    let bridge = MetricsBridge::new(
        state.runtime.clone(),
        state.metrics_connections.clone(),
        state.config.streams,
    );
    bridge.spawn_event_monitor(&session);
    bridge.spawn_stats_stream(&session);
    bridge.spawn_status_poll(&session);
    bridge.spawn_keepalive(&session);

    loop {
        tokio::select! {
            message = receiver.next() => match message {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            },
            _ = session.closed_notify.notified() => break,
        }
    }

    state.metrics_connections.release(&bot_id, &session);
    info!("Metrics connection closed for bot {}", bot_id);
}

async fn send_json_error(channel: &Arc<WsChannel>, message: &str) {
    let payload = json!({
        "error": message,
        "timestamp": iso_timestamp(Utc::now()),
    });
    channel.send_text(payload.to_string()).await;
}

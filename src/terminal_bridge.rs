use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::StreamConfig;
use crate::connection_registry::{ClientChannel, ConnectionRegistry, SessionTeardown};
use crate::lifecycle::{ContainerEvent, ContainerEventKind};
use crate::runtime::ContainerRuntime;
use crate::stream_codec::{JsonLineDecoder, LogDemuxer};

#[derive(Default)]
struct TerminalTasks {
    log_pump: Option<JoinHandle<()>>,
    exit_watch: Option<JoinHandle<()>>,
    event_monitor: Option<JoinHandle<()>>,
    keepalive: Option<JoinHandle<()>>,
}

/// State for one terminal (log view) connection.
pub struct TerminalSession {
    pub bot_id: String,
    pub container_id: String,
    channel: Arc<dyn ClientChannel>,
    pub is_running: AtomicBool,
    tasks: Mutex<TerminalTasks>,
    closed: AtomicBool,
    pub closed_notify: Notify,
}

impl TerminalSession {
    pub fn new(
        bot_id: String,
        container_id: String,
        channel: Arc<dyn ClientChannel>,
        running: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            bot_id,
            container_id,
            channel,
            is_running: AtomicBool::new(running),
            tasks: Mutex::new(TerminalTasks::default()),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn send_line(&self, text: &str) -> bool {
        if self.is_closed() {
            return false;
        }
        self.channel.send_text(text.to_string()).await
    }

    pub async fn send_status(&self, status: &str) -> bool {
        self.send_line(&format!("\x1b[1;37;41m {}\x1b[0m \r\n", status))
            .await
    }

    pub async fn send_error(&self, message: &str) -> bool {
        self.send_line(&format!("[Error] {}", message)).await
    }

    pub async fn send_ping(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.channel.send_ping().await
    }

    pub async fn send_close(&self) {
        self.channel.send_close().await;
    }

    fn store_task(&self, set: impl FnOnce(&mut TerminalTasks) -> &mut Option<JoinHandle<()>>, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(previous) = set(&mut tasks).replace(handle) {
            previous.abort();
        }
    }
}

impl SessionTeardown for TerminalSession {
    fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.tasks.lock().unwrap();
        for handle in [
            tasks.log_pump.take(),
            tasks.exit_watch.take(),
            tasks.event_monitor.take(),
            tasks.keepalive.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
        self.closed_notify.notify_one();
    }
}

/// Per-connection log streaming: bounded backlog first, then either the live
/// follow stream (running container) or lifecycle monitoring that attaches
/// the live stream once a start event arrives.
#[derive(Clone)]
pub struct TerminalBridge {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<ConnectionRegistry<TerminalSession>>,
    settings: StreamConfig,
}

impl TerminalBridge {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<ConnectionRegistry<TerminalSession>>,
        settings: StreamConfig,
    ) -> Self {
        Self {
            runtime,
            registry,
            settings,
        }
    }

    pub fn release(&self, session: &Arc<TerminalSession>) {
        self.registry.release(&session.bot_id, session);
    }

    async fn close(&self, session: &Arc<TerminalSession>) {
        session.send_close().await;
        self.release(session);
    }

    /// Fetches and forwards the trailing log lines. Always runs to
    /// completion before any live streaming starts.
    pub async fn send_backlog(&self, session: &Arc<TerminalSession>) {
        let blob = match self
            .runtime
            .log_backlog(&session.container_id, self.settings.log_backlog_lines)
            .await
        {
            Ok(blob) => blob,
            Err(err) => {
                session
                    .send_error(&format!("Failed to load recent logs: {}", err))
                    .await;
                return;
            }
        };

        let mut demux = LogDemuxer::new();
        match demux.push(&blob) {
            Ok(frames) => {
                for frame in frames {
                    if !session
                        .send_line(&String::from_utf8_lossy(&frame.payload))
                        .await
                    {
                        return;
                    }
                }
            }
            Err(err) => {
                session
                    .send_error(&format!("Failed to decode recent logs: {}", err))
                    .await;
            }
        }
    }

    /// Attaches the live follow stream and arms the exit watch. Log access
    /// failures close the connection; a natural end of the stream hands
    /// control back to the exit watch instead.
    pub fn attach_live_stream(&self, session: &Arc<TerminalSession>) {
        let bridge = self.clone();
        let pump_session = session.clone();
        let pump = tokio::spawn(async move {
            if pump_session.is_closed() {
                return;
            }
            let mut stream = match bridge.runtime.follow_logs(&pump_session.container_id).await {
                Ok(stream) => stream,
                Err(err) => {
                    pump_session
                        .send_error(&format!("Failed to start log stream: {}", err))
                        .await;
                    bridge.close(&pump_session).await;
                    return;
                }
            };

            let mut demux = LogDemuxer::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        pump_session
                            .send_error(&format!("Failed to read logs: {}", err))
                            .await;
                        bridge.close(&pump_session).await;
                        return;
                    }
                };
                match demux.push(&chunk) {
                    Ok(frames) => {
                        for frame in frames {
                            if !pump_session
                                .send_line(&String::from_utf8_lossy(&frame.payload))
                                .await
                            {
                                bridge.release(&pump_session);
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        pump_session
                            .send_error(&format!("Failed to read logs: {}", err))
                            .await;
                        bridge.close(&pump_session).await;
                        return;
                    }
                }
            }
            // Stream ended with the container's exit; the exit watch reports
            // the transition and resumes monitoring.
        });
        session.store_task(|tasks| &mut tasks.log_pump, pump);

        self.spawn_exit_watch(session);
    }

    fn spawn_exit_watch(&self, session: &Arc<TerminalSession>) {
        let bridge = self.clone();
        let watch_session = session.clone();
        let watch = tokio::spawn(async move {
            match bridge
                .runtime
                .wait_for_exit(&watch_session.container_id)
                .await
            {
                Ok(code) => {
                    debug!(
                        "Container for bot {} exited with code {}",
                        watch_session.bot_id, code
                    );
                    watch_session.is_running.store(false, Ordering::SeqCst);
                    watch_session
                        .send_status("Bot stopped - waiting for restart...")
                        .await;
                    // The client may still be watching for a restart; keep
                    // the socket and watch the event feed instead.
                    bridge.spawn_event_monitor(&watch_session);
                }
                Err(err) => {
                    debug!(
                        "Exit watch for bot {} ended: {}",
                        watch_session.bot_id, err
                    );
                }
            }
        });
        session.store_task(|tasks| &mut tasks.exit_watch, watch);
    }

    /// Watches the container's lifecycle events while no live stream is
    /// attached, re-attaching the log stream on start and closing the
    /// connection when the container is destroyed.
    pub fn spawn_event_monitor(&self, session: &Arc<TerminalSession>) {
        let bridge = self.clone();
        let monitor_session = session.clone();
        let monitor = tokio::spawn(async move {
            let mut stream = match bridge
                .runtime
                .event_stream(&monitor_session.container_id, &ContainerEventKind::MONITORED)
                .await
            {
                Ok(stream) => stream,
                Err(err) => {
                    monitor_session
                        .send_error(&format!("Failed to monitor container: {}", err))
                        .await;
                    return;
                }
            };

            let mut decoder = JsonLineDecoder::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        warn!(
                            "Event stream error for bot {}: {}",
                            monitor_session.bot_id, err
                        );
                        return;
                    }
                };
                for event in decoder.push::<ContainerEvent>(&chunk) {
                    let kind = event.kind();
                    debug!(
                        "Container {} event: {}",
                        event.container_id,
                        kind.as_str()
                    );
                    match kind {
                        ContainerEventKind::Start => {
                            if monitor_session.is_running.load(Ordering::SeqCst) {
                                continue;
                            }
                            monitor_session.is_running.store(true, Ordering::SeqCst);
                            monitor_session
                                .send_status("Bot started - attaching to logs...")
                                .await;
                            // The live path re-arms monitoring after the next
                            // exit; this monitor is done.
                            bridge.attach_live_stream(&monitor_session);
                            return;
                        }
                        ContainerEventKind::Die | ContainerEventKind::Stop => {
                            monitor_session.is_running.store(false, Ordering::SeqCst);
                            monitor_session
                                .send_status("Bot stopped - waiting for restart...")
                                .await;
                        }
                        ContainerEventKind::Destroy => {
                            monitor_session.send_error("Container removed").await;
                            bridge.close(&monitor_session).await;
                            return;
                        }
                        _ => {}
                    }
                }
            }
        });
        session.store_task(|tasks| &mut tasks.event_monitor, monitor);
    }

    /// Periodic liveness probe; a failed ping means the socket is gone and
    /// triggers teardown.
    pub fn spawn_keepalive(&self, session: &Arc<TerminalSession>) {
        let bridge = self.clone();
        let ping_session = session.clone();
        let interval_secs = self.settings.ping_interval_secs;
        let keepalive = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                if !ping_session.send_ping().await {
                    bridge.release(&ping_session);
                    return;
                }
            }
        });
        session.store_task(|tasks| &mut tasks.keepalive, keepalive);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_registry::testing::RecordingChannel;
    use crate::runtime::testing::MockRuntime;
    use crate::runtime::{ContainerDescriptor, ContainerState};

    fn frame(channel: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![channel, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn descriptor(running: bool) -> ContainerDescriptor {
        ContainerDescriptor {
            id: "c1".to_string(),
            state: ContainerState {
                status: if running { "running" } else { "exited" }.to_string(),
                running,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn settings() -> StreamConfig {
        StreamConfig {
            log_backlog_lines: 100,
            ping_interval_secs: 3600,
            status_poll_interval_secs: 3600,
            restart_grace_secs: 1,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    struct Fixture {
        runtime: Arc<MockRuntime>,
        registry: Arc<ConnectionRegistry<TerminalSession>>,
        bridge: TerminalBridge,
        channel: Arc<RecordingChannel>,
        session: Arc<TerminalSession>,
    }

    fn fixture(running: bool) -> Fixture {
        let runtime = Arc::new(MockRuntime::new(descriptor(running)));
        let registry = Arc::new(ConnectionRegistry::new());
        let bridge = TerminalBridge::new(runtime.clone(), registry.clone(), settings());
        let channel = RecordingChannel::new();
        let session = TerminalSession::new(
            "42".to_string(),
            "c1".to_string(),
            channel.clone() as Arc<dyn ClientChannel>,
            running,
        );
        registry.insert("42", session.clone());
        Fixture {
            runtime,
            registry,
            bridge,
            channel,
            session,
        }
    }

    #[tokio::test]
    async fn test_backlog_is_sent_before_any_live_output() {
        let fx = fixture(true);
        fx.runtime
            .set_backlog(frame(1, b"old line\n").into());

        fx.bridge.send_backlog(&fx.session).await;
        fx.bridge.attach_live_stream(&fx.session);

        wait_until(|| fx.runtime.logs.open_count() == 1).await;
        fx.runtime.logs.send(&frame(1, b"fresh line\n"));
        wait_until(|| fx.channel.snapshot().len() == 2).await;

        let messages = fx.channel.snapshot();
        assert_eq!(messages[0], "old line\n");
        assert_eq!(messages[1], "fresh line\n");
    }

    #[tokio::test]
    async fn test_stopped_container_waits_for_start_event_before_streaming() {
        let fx = fixture(false);
        fx.runtime.set_backlog(frame(1, b"boot log\n").into());

        fx.bridge.send_backlog(&fx.session).await;
        fx.session
            .send_status("Bot stopped - waiting for start...")
            .await;
        fx.bridge.spawn_event_monitor(&fx.session);

        wait_until(|| fx.runtime.events.open_count() == 1).await;
        assert_eq!(fx.runtime.logs.open_count(), 0);
        assert_eq!(fx.channel.snapshot().len(), 2);

        fx.runtime.events.send(b"{\"Action\":\"start\",\"id\":\"c1\"}\n");
        wait_until(|| fx.runtime.logs.open_count() == 1).await;
        fx.runtime.logs.send(&frame(1, b"live again\n"));

        wait_until(|| fx.channel.snapshot().last().map(String::as_str) == Some("live again\n"))
            .await;
        assert!(fx.session.is_running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_transport_error_reports_and_closes_connection() {
        let fx = fixture(true);
        fx.bridge.attach_live_stream(&fx.session);
        wait_until(|| fx.runtime.logs.open_count() == 1).await;

        fx.runtime.logs.error("connection reset");

        wait_until(|| fx.registry.is_empty()).await;
        let messages = fx.channel.snapshot();
        assert!(messages
            .iter()
            .any(|m| m.starts_with("[Error] Failed to read logs")));
        assert!(fx.session.is_closed());
    }

    #[tokio::test]
    async fn test_live_stream_natural_end_leaves_connection_open() {
        let fx = fixture(true);
        fx.bridge.attach_live_stream(&fx.session);
        wait_until(|| fx.runtime.logs.open_count() == 1).await;

        // The container exiting ends the follow stream without an error;
        // the exit watch owns the transition.
        fx.runtime.logs.close();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(fx.registry.len(), 1);
        assert!(!fx.session.is_closed());
    }

    #[tokio::test]
    async fn test_destroy_event_sends_error_and_closes() {
        let fx = fixture(false);
        fx.bridge.spawn_event_monitor(&fx.session);
        wait_until(|| fx.runtime.events.open_count() == 1).await;

        fx.runtime
            .events
            .send(b"{\"Action\":\"destroy\",\"id\":\"c1\"}\n");

        wait_until(|| fx.registry.is_empty()).await;
        assert!(fx
            .channel
            .snapshot()
            .iter()
            .any(|m| m == "[Error] Container removed"));
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent_and_stops_all_streaming() {
        let fx = fixture(true);
        fx.bridge.attach_live_stream(&fx.session);
        fx.bridge.spawn_keepalive(&fx.session);
        wait_until(|| fx.runtime.logs.open_count() == 1).await;

        fx.registry.release("42", &fx.session);
        fx.registry.release("42", &fx.session);
        fx.session.teardown();

        assert!(fx.registry.is_empty());
        let before = fx.channel.snapshot().len();
        fx.runtime.logs.send(&frame(1, b"after close\n"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.channel.snapshot().len(), before);
    }

    #[tokio::test]
    async fn test_keepalive_pings_live_socket() {
        let fx = fixture(true);
        let fast = StreamConfig {
            ping_interval_secs: 1,
            ..settings()
        };
        let bridge = TerminalBridge::new(fx.runtime.clone(), fx.registry.clone(), fast);
        bridge.spawn_keepalive(&fx.session);

        wait_until(|| *fx.channel.pings.lock().unwrap() >= 1).await;
        assert_eq!(fx.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_ping_triggers_teardown() {
        let fx = fixture(true);
        let fast = StreamConfig {
            ping_interval_secs: 1,
            ..settings()
        };
        let bridge = TerminalBridge::new(fx.runtime.clone(), fx.registry.clone(), fast);

        fx.channel.break_channel();
        bridge.spawn_keepalive(&fx.session);

        wait_until(|| fx.registry.is_empty()).await;
        assert!(fx.session.is_closed());
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::StreamConfig;
use crate::connection_registry::{ClientChannel, ConnectionRegistry, SessionTeardown};
use crate::errors::AgentError;
use crate::lifecycle::{ContainerEvent, ContainerEventKind};
use crate::metrics::{derive_metrics, iso_timestamp, synthetic_metrics, RawStats};
use crate::runtime::{ContainerDescriptor, ContainerRuntime};
use crate::stream_codec::JsonLineDecoder;

#[derive(Default)]
struct MetricsTasks {
    stats_pump: Option<JoinHandle<()>>,
    event_monitor: Option<JoinHandle<()>>,
    status_poll: Option<JoinHandle<()>>,
    keepalive: Option<JoinHandle<()>>,
    restart_grace: Option<JoinHandle<()>>,
}

/// State for one metrics connection.
pub struct MetricsSession {
    pub bot_id: String,
    pub container_id: String,
    channel: Arc<dyn ClientChannel>,
    /// Most recently observed descriptor; written by the lifecycle monitor
    /// and the status poll, read by metrics derivation.
    pub descriptor: RwLock<ContainerDescriptor>,
    /// Set on a restart observation, cleared by the grace timer or a
    /// confirmed running transition. The stats pump only reads it.
    restarting: AtomicBool,
    tasks: Mutex<MetricsTasks>,
    closed: AtomicBool,
    pub closed_notify: Notify,
}

impl MetricsSession {
    pub fn new(
        bot_id: String,
        channel: Arc<dyn ClientChannel>,
        descriptor: ContainerDescriptor,
    ) -> Arc<Self> {
        Arc::new(Self {
            bot_id,
            container_id: descriptor.id.clone(),
            channel,
            descriptor: RwLock::new(descriptor),
            restarting: AtomicBool::new(false),
            tasks: Mutex::new(MetricsTasks::default()),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::SeqCst)
    }

    pub async fn send_text(&self, text: String) -> bool {
        if self.is_closed() {
            return false;
        }
        self.channel.send_text(text).await
    }

    pub async fn send_error(&self, message: &str) -> bool {
        let payload = json!({
            "error": message,
            "timestamp": iso_timestamp(Utc::now()),
        });
        self.send_text(payload.to_string()).await
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

    fn store_task(
        &self,
        set: impl FnOnce(&mut MetricsTasks) -> &mut Option<JoinHandle<()>>,
        handle: JoinHandle<()>,
    ) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(previous) = set(&mut tasks).replace(handle) {
            previous.abort();
        }
    }

    fn clear_restart_grace(&self) {
        if let Some(handle) = self.tasks.lock().unwrap().restart_grace.take() {
            handle.abort();
        }
    }
}

impl SessionTeardown for MetricsSession {
    fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.tasks.lock().unwrap();
        for handle in [
            tasks.stats_pump.take(),
            tasks.event_monitor.take(),
            tasks.status_poll.take(),
            tasks.keepalive.take(),
            tasks.restart_grace.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
        self.closed_notify.notify_one();
    }
}

/// Per-connection telemetry: the live stats feed shaped through metrics
/// derivation, a fixed-interval descriptor poll that keeps status truthful
/// when the feed goes quiet, and lifecycle-event handling for the restart
/// indicator.
#[derive(Clone)]
pub struct MetricsBridge {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<ConnectionRegistry<MetricsSession>>,
    settings: StreamConfig,
}

impl MetricsBridge {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<ConnectionRegistry<MetricsSession>>,
        settings: StreamConfig,
    ) -> Self {
        Self {
            runtime,
            registry,
            settings,
        }
    }

    pub fn release(&self, session: &Arc<MetricsSession>) {
        self.registry.release(&session.bot_id, session);
    }

    async fn close(&self, session: &Arc<MetricsSession>) {
        session.send_close().await;
        self.release(session);
    }

    /// Attaches the runtime's stats feed. A transport failure stops this
    /// stream silently; the status poll keeps the connection informative.
    pub fn spawn_stats_stream(&self, session: &Arc<MetricsSession>) {
        let bridge = self.clone();
        let pump_session = session.clone();
        let pump = tokio::spawn(async move {
            if pump_session.is_closed() {
                return;
            }
            let mut stream = match bridge
                .runtime
                .stats_stream(&pump_session.container_id)
                .await
            {
                Ok(stream) => stream,
                Err(err) => {
                    debug!(
                        "Stats stream unavailable for bot {}: {}",
                        pump_session.bot_id, err
                    );
                    return;
                }
            };

            let mut decoder = JsonLineDecoder::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        debug!(
                            "Stats stream ended for bot {}: {}",
                            pump_session.bot_id, err
                        );
                        return;
                    }
                };
                for raw in decoder.push::<RawStats>(&chunk) {
                    let descriptor = pump_session.descriptor.read().await.clone();
                    let record = derive_metrics(
                        &raw,
                        &descriptor,
                        &pump_session.bot_id,
                        pump_session.is_restarting(),
                        Utc::now(),
                    );
                    let payload = match serde_json::to_string(&record) {
                        Ok(payload) => payload,
                        Err(err) => {
                            warn!("Failed to serialize metrics: {}", err);
                            continue;
                        }
                    };
                    if !pump_session.send_text(payload).await {
                        bridge.release(&pump_session);
                        return;
                    }
                }
            }
        });
        session.store_task(|tasks| &mut tasks.stats_pump, pump);
    }

    /// Watches the container's lifecycle events, refreshing the descriptor,
    /// driving the restart indicator, and closing the connection when the
    /// container is destroyed.
    pub fn spawn_event_monitor(&self, session: &Arc<MetricsSession>) {
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
                    warn!(
                        "Failed to monitor events for bot {}: {}",
                        monitor_session.bot_id, err
                    );
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
                        ContainerEventKind::Destroy => {
                            monitor_session.send_error("Container removed").await;
                            bridge.close(&monitor_session).await;
                            return;
                        }
                        ContainerEventKind::Restart => {
                            monitor_session.restarting.store(true, Ordering::SeqCst);
                            bridge.arm_restart_grace(&monitor_session);
                            bridge.refresh_descriptor(&monitor_session).await;
                        }
                        ContainerEventKind::Start => {
                            // Confirmed running resolves any pending restart.
                            monitor_session.restarting.store(false, Ordering::SeqCst);
                            monitor_session.clear_restart_grace();
                            bridge.refresh_descriptor(&monitor_session).await;
                        }
                        ContainerEventKind::Unknown => {}
                        _ => {
                            bridge.refresh_descriptor(&monitor_session).await;
                        }
                    }
                }
            }
        });
        session.store_task(|tasks| &mut tasks.event_monitor, monitor);
    }

    /// Fixed-interval descriptor poll, independent of the stats feed's
    /// cadence. On a status change it refreshes the descriptor and emits a
    /// synthetic zero-valued record so transitions reach the client even
    /// when stats have stopped flowing.
    pub fn spawn_status_poll(&self, session: &Arc<MetricsSession>) {
        let bridge = self.clone();
        let poll_session = session.clone();
        let interval_secs = self.settings.status_poll_interval_secs;
        let poll = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                let current = match bridge.runtime.inspect(&poll_session.container_id).await {
                    Ok(current) => current,
                    // The container can vanish transiently mid-restart.
                    Err(AgentError::NotFound(_)) => continue,
                    Err(err) => {
                        debug!(
                            "Status poll failed for bot {}: {}",
                            poll_session.bot_id, err
                        );
                        continue;
                    }
                };

                let changed = {
                    let last = poll_session.descriptor.read().await;
                    last.state.status != current.state.status
                };
                if !changed {
                    continue;
                }

                *poll_session.descriptor.write().await = current.clone();
                let record = synthetic_metrics(
                    &current,
                    &poll_session.bot_id,
                    poll_session.is_restarting(),
                    Utc::now(),
                );
                let payload = match serde_json::to_string(&record) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!("Failed to serialize metrics: {}", err);
                        continue;
                    }
                };
                if !poll_session.send_text(payload).await {
                    bridge.release(&poll_session);
                    return;
                }
            }
        });
        session.store_task(|tasks| &mut tasks.status_poll, poll);
    }

    /// Periodic liveness probe; a failed ping means the socket is gone and
    /// triggers teardown.
    pub fn spawn_keepalive(&self, session: &Arc<MetricsSession>) {
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

    /// Arms the one-shot grace timer that clears a restart indicator whose
    /// completion was never observed.
    fn arm_restart_grace(&self, session: &Arc<MetricsSession>) {
        let grace_session = session.clone();
        let grace_secs = self.settings.restart_grace_secs;
        let grace = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(grace_secs)).await;
            grace_session.restarting.store(false, Ordering::SeqCst);
        });
        session.store_task(|tasks| &mut tasks.restart_grace, grace);
    }

    async fn refresh_descriptor(&self, session: &Arc<MetricsSession>) {
        match self.runtime.inspect(&session.container_id).await {
            Ok(descriptor) => {
                *session.descriptor.write().await = descriptor;
            }
            Err(AgentError::NotFound(_)) => {}
            Err(err) => {
                debug!(
                    "Descriptor refresh failed for bot {}: {}",
                    session.bot_id, err
                );
            }
        }
    }
}

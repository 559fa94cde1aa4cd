use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::Deserialize;

use crate::errors::AgentResult;
use crate::lifecycle::ContainerEventKind;

/// Chunked byte feed from the runtime. Ends with `None`; transport failures
/// surface as an `Err` item before the stream ends.
pub type ByteStream = Pin<Box<dyn Stream<Item = AgentResult<Bytes>> + Send>>;

pub fn container_name(bot_id: &str) -> String {
    format!("bot-{}-container", bot_id)
}

pub fn image_name(bot_id: &str) -> String {
    format!("bot-{}", bot_id)
}

/// Point-in-time container state snapshot, as reported by the runtime's
/// inspect call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerDescriptor {
    #[serde(rename = "Id", default)]
    pub id: String,
    #[serde(rename = "State", default)]
    pub state: ContainerState,
    #[serde(rename = "RestartCount", default)]
    pub restart_count: u64,
    #[serde(rename = "HostConfig", default)]
    pub host_config: HostConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerState {
    #[serde(rename = "Status", default)]
    pub status: String,
    #[serde(rename = "Running", default)]
    pub running: bool,
    #[serde(rename = "Paused", default)]
    pub paused: bool,
    #[serde(rename = "Restarting", default)]
    pub restarting: bool,
    #[serde(rename = "StartedAt", default)]
    pub started_at: String,
    #[serde(rename = "FinishedAt", default)]
    pub finished_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostConfig {
    #[serde(rename = "Memory", default)]
    pub memory: u64,
}

/// One row of the runtime's container listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerSummary {
    #[serde(rename = "Image", default)]
    pub image: String,
    #[serde(rename = "State", default)]
    pub state: String,
    #[serde(rename = "Status", default)]
    pub status: String,
    #[serde(rename = "Created", default)]
    pub created: i64,
    #[serde(rename = "Labels", default)]
    pub labels: HashMap<String, String>,
}

/// Creation parameters for a bot container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub labels: HashMap<String, String>,
    pub memory_bytes: u64,
    pub nano_cpus: u64,
}

/// The surface of the container runtime the agent consumes. The streaming
/// bridges only ever hold this trait object, so they can be exercised with
/// synthetic feeds.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn inspect(&self, name: &str) -> AgentResult<ContainerDescriptor>;

    /// Bounded fetch of the most recent trailing log lines, in the runtime's
    /// multiplexed framing, as one finite blob.
    async fn log_backlog(&self, name: &str, tail: u32) -> AgentResult<Bytes>;

    /// Live follow stream of new log output, multiplexed framing.
    async fn follow_logs(&self, name: &str) -> AgentResult<ByteStream>;

    /// Periodic resource-usage snapshots, newline-delimited JSON.
    async fn stats_stream(&self, name: &str) -> AgentResult<ByteStream>;

    /// Lifecycle events for one container, filtered to the given kinds,
    /// newline-delimited JSON.
    async fn event_stream(
        &self,
        container_id: &str,
        kinds: &[ContainerEventKind],
    ) -> AgentResult<ByteStream>;

    /// Resolves when the container's main process exits; returns the exit code.
    async fn wait_for_exit(&self, name: &str) -> AgentResult<i64>;

    async fn list_containers(
        &self,
        label_filter: Option<&str>,
    ) -> AgentResult<Vec<ContainerSummary>>;

    async fn start_container(&self, name: &str) -> AgentResult<()>;

    async fn stop_container(&self, name: &str, timeout_secs: u32) -> AgentResult<()>;

    async fn restart_container(&self, name: &str, timeout_secs: u32) -> AgentResult<()>;

    async fn create_container(&self, name: &str, spec: &ContainerSpec) -> AgentResult<()>;

    /// Builds an image from a tar archive of the build context.
    async fn build_image(&self, tag: &str, context_tar: Bytes) -> AgentResult<()>;
}

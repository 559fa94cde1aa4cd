use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

mod bot_uploader;
mod config;
mod connection_registry;
mod docker_client;
mod errors;
mod lifecycle;
mod metrics;
mod metrics_bridge;
mod routes;
mod runtime;
mod stream_codec;
mod terminal_bridge;
mod websocket_handler;

pub use config::AgentConfig;
pub use errors::{AgentError, AgentResult};

use connection_registry::ConnectionRegistry;
use docker_client::DockerClient;
use metrics_bridge::MetricsSession;
use runtime::ContainerRuntime;
use terminal_bridge::TerminalSession;

/// Maximum accepted bot upload size.
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Shared state behind every route and socket handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AgentConfig>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub terminal_connections: Arc<ConnectionRegistry<TerminalSession>>,
    pub metrics_connections: Arc<ConnectionRegistry<MetricsSession>>,
}

/// Bothive Agent - Main application state
pub struct BothiveAgent {
    pub config: Arc<AgentConfig>,
    pub state: AppState,
}

impl BothiveAgent {
    pub fn new(config: AgentConfig) -> Self {
        info!("Initializing Bothive Agent");

        let config = Arc::new(config);
        let runtime: Arc<dyn ContainerRuntime> =
            Arc::new(DockerClient::new(config.docker.socket_path.clone()));

        let state = AppState {
            config: config.clone(),
            runtime,
            terminal_connections: Arc::new(ConnectionRegistry::new()),
            metrics_connections: Arc::new(ConnectionRegistry::new()),
        };

        Self { config, state }
    }

    pub async fn run(&self) -> AgentResult<()> {
        let app = Router::new()
            .route("/api/list-bots", get(routes::list_bots))
            .route("/api/start-bot", post(routes::start_bot))
            .route("/api/stop-bot", post(routes::stop_bot))
            .route("/api/restart-bot", post(routes::restart_bot))
            .route(
                "/api/upload-bot",
                post(bot_uploader::upload_bot).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
            )
            .route("/api/ws-terminal", get(websocket_handler::terminal_ws))
            .route("/api/ws-metrics", get(websocket_handler::metrics_ws))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone());

        let addr = format!(
            "{}:{}",
            self.config.server.bind_address, self.config.server.port
        );
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        info!("API + WebSocket server listening on {}", addr);

        axum::serve(listener, app)
            .await
            .map_err(|e| AgentError::NetworkError(e.to_string()))
    }
}

#[tokio::main]
async fn main() -> AgentResult<()> {
    let mut config_path: Option<String> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            config_path = args.next();
        }
    }

    let config_path = config_path.as_deref().unwrap_or("./config.toml");
    // Load config first so logging level/format can be applied.
    let config = AgentConfig::from_file(config_path)
        .or_else(|_| AgentConfig::from_file("/opt/bothive-agent/config.toml"))
        .or_else(|_| AgentConfig::from_env())
        .map_err(AgentError::ConfigError)?;

    let filter = format!("bothive_agent={},tokio=info", config.logging.level);
    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Bothive Agent starting");
    info!("Configuration loaded: {:?}", config);

    let agent = BothiveAgent::new(config);
    agent.run().await?;

    Ok(())
}

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    pub server: ServerConfig,
    pub docker: DockerConfig,
    #[serde(default)]
    pub streams: StreamConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DockerConfig {
    pub socket_path: PathBuf,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u32,
}

/// Tunables for the per-connection streaming bridges.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct StreamConfig {
    #[serde(default = "default_backlog_lines")]
    pub log_backlog_lines: u32,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_status_poll_interval")]
    pub status_poll_interval_secs: u64,
    #[serde(default = "default_restart_grace")]
    pub restart_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

fn default_stop_timeout() -> u32 {
    30
}

fn default_backlog_lines() -> u32 {
    100
}

fn default_ping_interval() -> u64 {
    30
}

fn default_status_poll_interval() -> u64 {
    2
}

fn default_restart_grace() -> u64 {
    10
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            log_backlog_lines: default_backlog_lines(),
            ping_interval_secs: default_ping_interval(),
            status_poll_interval_secs: default_status_poll_interval(),
            restart_grace_secs: default_restart_grace(),
        }
    }
}

impl AgentConfig {
    pub fn from_file(path: &str) -> Result<Self, String> {
        let content =
            std::fs::read_to_string(path).map_err(|e| format!("Failed to read config: {}", e))?;
        toml::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))
    }

    pub fn from_env() -> Result<Self, String> {
        Ok(Self {
            server: ServerConfig {
                bind_address: std::env::var("BIND_ADDRESS")
                    .unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: std::env::var("PORT")
                    .ok()
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(3001),
                data_dir: PathBuf::from(
                    std::env::var("DATA_DIR").unwrap_or_else(|_| "/var/lib/bothive".to_string()),
                ),
            },
            docker: DockerConfig {
                socket_path: PathBuf::from(
                    std::env::var("DOCKER_SOCKET")
                        .unwrap_or_else(|_| "/var/run/docker.sock".to_string()),
                ),
                stop_timeout_secs: default_stop_timeout(),
            },
            streams: StreamConfig::default(),
            logging: LoggingConfig {
                level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
                format: "json".to_string(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_defaults_fill_missing_sections() {
        let config: AgentConfig = toml::from_str(
            r#"
            [server]
            bind_address = "127.0.0.1"
            port = 3001
            data_dir = "/tmp/bots"

            [docker]
            socket_path = "/var/run/docker.sock"

            [logging]
            level = "debug"
            format = "text"
            "#,
        )
        .expect("config should parse without a [streams] section");

        assert_eq!(config.streams.log_backlog_lines, 100);
        assert_eq!(config.streams.ping_interval_secs, 30);
        assert_eq!(config.streams.status_poll_interval_secs, 2);
        assert_eq!(config.streams.restart_grace_secs, 10);
        assert_eq!(config.docker.stop_timeout_secs, 30);
    }
}

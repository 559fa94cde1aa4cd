use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::net::UnixStream;
use tracing::debug;

use crate::errors::{AgentError, AgentResult};
use crate::lifecycle::ContainerEventKind;
use crate::runtime::{
    ByteStream, ContainerDescriptor, ContainerRuntime, ContainerSpec, ContainerSummary,
};
use crate::stream_codec::JsonLineDecoder;

/// Client for the container runtime's HTTP API over its Unix socket. One
/// short-lived connection per call; streaming responses hold their
/// connection open until the body is dropped, so tearing a stream down never
/// waits for the runtime's acknowledgment.
pub struct DockerClient {
    socket_path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct WaitResponse {
    #[serde(rename = "StatusCode")]
    status_code: i64,
}

#[derive(Debug, Deserialize)]
struct BuildProgressLine {
    #[serde(default)]
    error: Option<String>,
}

impl DockerClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    async fn request(
        &self,
        method: Method,
        target: String,
        body: Option<(Bytes, &'static str)>,
    ) -> AgentResult<Response<Incoming>> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            AgentError::NetworkError(format!(
                "Failed to connect to runtime socket {}: {}",
                self.socket_path.display(),
                e
            ))
        })?;

        let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| AgentError::NetworkError(format!("Runtime handshake failed: {}", e)))?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!("Runtime connection closed: {}", err);
            }
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(target)
            .header(HOST, "docker");
        if let Some((_, content_type)) = &body {
            builder = builder.header(CONTENT_TYPE, *content_type);
        }
        let request = builder
            .body(Full::new(body.map(|(bytes, _)| bytes).unwrap_or_default()))
            .map_err(|e| AgentError::InternalError(e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| AgentError::NetworkError(format!("Runtime request failed: {}", e)))?;
        self.check_status(response).await
    }

    async fn check_status(&self, response: Response<Incoming>) -> AgentResult<Response<Incoming>> {
        let status = response.status();
        // 304 comes back from start/stop when the container is already there.
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok(response);
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .unwrap_or_default();
        let message = serde_json::from_slice::<ApiErrorBody>(&body)
            .map(|parsed| parsed.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&body).trim().to_string());

        if status == StatusCode::NOT_FOUND {
            Err(AgentError::NotFound(message))
        } else {
            Err(AgentError::ContainerError(format!(
                "Runtime API error ({}): {}",
                status, message
            )))
        }
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        target: String,
        body: Option<(Bytes, &'static str)>,
    ) -> AgentResult<T> {
        let response = self.request(method, target, body).await?;
        let bytes = collect_body(response).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn request_unit(
        &self,
        method: Method,
        target: String,
        body: Option<(Bytes, &'static str)>,
    ) -> AgentResult<()> {
        let response = self.request(method, target, body).await?;
        // Drain so the connection can wind down cleanly.
        let _ = collect_body(response).await;
        Ok(())
    }
}

async fn collect_body(response: Response<Incoming>) -> AgentResult<Bytes> {
    response
        .into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| AgentError::NetworkError(format!("Failed to read runtime response: {}", e)))
}

fn into_byte_stream(response: Response<Incoming>) -> ByteStream {
    Box::pin(response.into_body().into_data_stream().map(|item| {
        item.map_err(|e| AgentError::NetworkError(format!("Runtime stream error: {}", e)))
    }))
}

/// Percent-encodes one query-string value (RFC 3986 unreserved set).
fn encode_query(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

fn event_filters(container_id: &str, kinds: &[ContainerEventKind]) -> String {
    let kinds: Vec<&str> = kinds.iter().map(|kind| kind.as_str()).collect();
    json!({ "container": [container_id], "event": kinds }).to_string()
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn inspect(&self, name: &str) -> AgentResult<ContainerDescriptor> {
        self.request_json(Method::GET, format!("/containers/{}/json", name), None)
            .await
    }

    async fn log_backlog(&self, name: &str, tail: u32) -> AgentResult<Bytes> {
        let response = self
            .request(
                Method::GET,
                format!(
                    "/containers/{}/logs?stdout=true&stderr=true&follow=false&tail={}",
                    name, tail
                ),
                None,
            )
            .await?;
        collect_body(response).await
    }

    async fn follow_logs(&self, name: &str) -> AgentResult<ByteStream> {
        let response = self
            .request(
                Method::GET,
                format!(
                    "/containers/{}/logs?stdout=true&stderr=true&follow=true&tail=0",
                    name
                ),
                None,
            )
            .await?;
        Ok(into_byte_stream(response))
    }

    async fn stats_stream(&self, name: &str) -> AgentResult<ByteStream> {
        let response = self
            .request(
                Method::GET,
                format!("/containers/{}/stats?stream=true", name),
                None,
            )
            .await?;
        Ok(into_byte_stream(response))
    }

    async fn event_stream(
        &self,
        container_id: &str,
        kinds: &[ContainerEventKind],
    ) -> AgentResult<ByteStream> {
        let filters = event_filters(container_id, kinds);
        let response = self
            .request(
                Method::GET,
                format!("/events?filters={}", encode_query(&filters)),
                None,
            )
            .await?;
        Ok(into_byte_stream(response))
    }

    async fn wait_for_exit(&self, name: &str) -> AgentResult<i64> {
        let response: WaitResponse = self
            .request_json(Method::POST, format!("/containers/{}/wait", name), None)
            .await?;
        Ok(response.status_code)
    }

    async fn list_containers(
        &self,
        label_filter: Option<&str>,
    ) -> AgentResult<Vec<ContainerSummary>> {
        let mut target = "/containers/json?all=true".to_string();
        if let Some(label) = label_filter {
            let filters = json!({ "label": [label] }).to_string();
            target.push_str(&format!("&filters={}", encode_query(&filters)));
        }
        self.request_json(Method::GET, target, None).await
    }

    async fn start_container(&self, name: &str) -> AgentResult<()> {
        self.request_unit(Method::POST, format!("/containers/{}/start", name), None)
            .await
    }

    async fn stop_container(&self, name: &str, timeout_secs: u32) -> AgentResult<()> {
        self.request_unit(
            Method::POST,
            format!("/containers/{}/stop?t={}", name, timeout_secs),
            None,
        )
        .await
    }

    async fn restart_container(&self, name: &str, timeout_secs: u32) -> AgentResult<()> {
        self.request_unit(
            Method::POST,
            format!("/containers/{}/restart?t={}", name, timeout_secs),
            None,
        )
        .await
    }

    async fn create_container(&self, name: &str, spec: &ContainerSpec) -> AgentResult<()> {
        let body = json!({
            "Image": spec.image,
            "Labels": spec.labels,
            "HostConfig": {
                "Memory": spec.memory_bytes,
                "NanoCpus": spec.nano_cpus,
            },
        });
        self.request_unit(
            Method::POST,
            format!("/containers/create?name={}", encode_query(name)),
            Some((Bytes::from(body.to_string()), "application/json")),
        )
        .await
    }

    async fn build_image(&self, tag: &str, context_tar: Bytes) -> AgentResult<()> {
        let response = self
            .request(
                Method::POST,
                format!("/build?t={}&rm=true", encode_query(tag)),
                Some((context_tar, "application/x-tar")),
            )
            .await?;

        // The build endpoint reports failures inside its progress feed, not
        // via the HTTP status.
        let mut body = into_byte_stream(response);
        let mut decoder = JsonLineDecoder::new();
        let mut failure: Option<String> = None;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            for line in decoder.push::<BuildProgressLine>(&chunk) {
                if let Some(error) = line.error {
                    failure.get_or_insert(error);
                }
            }
        }
        if failure.is_none() {
            if let Some(line) = decoder.finish::<BuildProgressLine>() {
                failure = line.error;
            }
        }

        match failure {
            Some(error) => Err(AgentError::InstallationError(format!(
                "Image build failed: {}",
                error
            ))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_query_escapes_filter_json() {
        assert_eq!(encode_query("a-b_c.d~e"), "a-b_c.d~e");
        assert_eq!(
            encode_query(r#"{"container":["abc"]}"#),
            "%7B%22container%22%3A%5B%22abc%22%5D%7D"
        );
    }

    #[test]
    fn test_event_filters_carry_container_and_kinds() {
        let filters = event_filters(
            "c1",
            &[ContainerEventKind::Start, ContainerEventKind::Die],
        );
        let parsed: serde_json::Value = serde_json::from_str(&filters).unwrap();
        assert_eq!(parsed["container"][0], "c1");
        assert_eq!(parsed["event"][0], "start");
        assert_eq!(parsed["event"][1], "die");
    }

    #[test]
    fn test_wait_response_parses_status_code() {
        let parsed: WaitResponse = serde_json::from_str(r#"{"StatusCode":137}"#).unwrap();
        assert_eq!(parsed.status_code, 137);
    }

    #[test]
    fn test_build_progress_line_surfaces_error_field() {
        let line: BuildProgressLine =
            serde_json::from_str(r#"{"error":"no such file","errorDetail":{}}"#).unwrap();
        assert_eq!(line.error.as_deref(), Some("no such file"));
        let ok: BuildProgressLine = serde_json::from_str(r#"{"stream":"Step 1/5"}"#).unwrap();
        assert!(ok.error.is_none());
    }
}

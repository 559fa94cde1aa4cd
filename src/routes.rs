use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::errors::{AgentError, AgentResult};
use crate::runtime::{container_name, ContainerSummary};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BotAction {
    #[serde(rename = "botId")]
    pub bot_id: Option<String>,
}

fn bot_json(container: &ContainerSummary) -> Value {
    json!({
        "containerName": container.image,
        "botId": container.labels.get("botId"),
        "state": container.state,
        "status": container.status,
        "created": container.created,
    })
}

pub async fn list_bots(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AgentResult<Json<Value>> {
    let user_id = query
        .user_id
        .ok_or_else(|| AgentError::InvalidRequest("userId is required".to_string()))?;

    let containers = state
        .runtime
        .list_containers(Some(&format!("userId={}", user_id)))
        .await?;
    let bots: Vec<Value> = containers.iter().map(bot_json).collect();

    Ok(Json(json!({ "count": bots.len(), "bots": bots })))
}

pub async fn start_bot(
    State(state): State<AppState>,
    Json(body): Json<BotAction>,
) -> AgentResult<Json<Value>> {
    let bot_id = required_bot_id(body)?;
    let name = container_name(&bot_id);

    state.runtime.inspect(&name).await?;
    state.runtime.start_container(&name).await?;
    info!("Started bot {}", bot_id);

    Ok(Json(json!({ "message": "Bot started", "botId": bot_id })))
}

pub async fn stop_bot(
    State(state): State<AppState>,
    Json(body): Json<BotAction>,
) -> AgentResult<Json<Value>> {
    let bot_id = required_bot_id(body)?;
    let name = container_name(&bot_id);

    state.runtime.inspect(&name).await?;
    state
        .runtime
        .stop_container(&name, state.config.docker.stop_timeout_secs)
        .await?;
    info!("Stopped bot {}", bot_id);

    Ok(Json(json!({ "message": "Bot stopped", "botId": bot_id })))
}

pub async fn restart_bot(
    State(state): State<AppState>,
    Json(body): Json<BotAction>,
) -> AgentResult<Json<Value>> {
    let bot_id = required_bot_id(body)?;
    let name = container_name(&bot_id);

    state.runtime.inspect(&name).await?;
    state
        .runtime
        .restart_container(&name, state.config.docker.stop_timeout_secs)
        .await?;
    info!("Restarted bot {}", bot_id);

    Ok(Json(json!({ "message": "Bot restarted", "botId": bot_id })))
}

fn required_bot_id(body: BotAction) -> AgentResult<String> {
    body.bot_id
        .ok_or_else(|| AgentError::InvalidRequest("botId is required".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_bot_json_maps_label_and_container_fields() {
        let container = ContainerSummary {
            image: "bot-42".to_string(),
            state: "running".to_string(),
            status: "Up 2 hours".to_string(),
            created: 1714557600,
            labels: HashMap::from([
                ("botId".to_string(), "42".to_string()),
                ("userId".to_string(), "7".to_string()),
            ]),
        };

        let value = bot_json(&container);
        assert_eq!(value["containerName"], "bot-42");
        assert_eq!(value["botId"], "42");
        assert_eq!(value["state"], "running");
        assert_eq!(value["created"], 1714557600);
    }

    #[test]
    fn test_missing_bot_id_is_invalid_request() {
        let err = required_bot_id(BotAction { bot_id: None }).unwrap_err();
        assert!(matches!(err, AgentError::InvalidRequest(_)));
    }
}

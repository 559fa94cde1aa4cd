use std::collections::HashMap;
use std::path::Path;

use axum::extract::{Multipart, State};
use axum::Json;
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{error, info};
use uuid::Uuid;

use crate::errors::{AgentError, AgentResult};
use crate::runtime::{container_name, image_name, ContainerSpec};
use crate::AppState;

const BOT_MEMORY_BYTES: u64 = 256 * 1024 * 1024;
const BOT_NANO_CPUS: u64 = 500_000_000;

/// Dockerfile synthesized into every uploaded bot's build context.
const BOT_DOCKERFILE: &str = "\
FROM python:3-slim

WORKDIR /app
RUN apt-get update && apt-get install -y curl
RUN curl -I https://pypi.org/simple/
COPY . .
RUN pip install --upgrade pip
RUN pip install --no-cache-dir -r requirements.txt

CMD [\"python\", \"-u\", \"main.py\"]
";

/// Accepts a bot upload: a `.zip` holding `main.py` and `requirements.txt`,
/// plus the owning `userId`. Extracts, builds the image, creates and starts
/// the container. The partially-created bot directory is removed on failure.
pub async fn upload_bot(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AgentResult<Json<Value>> {
    let mut archive: Option<Bytes> = None;
    let mut archive_name = String::new();
    let mut user_id: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AgentError::InvalidRequest(format!("Invalid multipart payload: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "BotZip" => {
                archive_name = field.file_name().unwrap_or_default().to_string();
                archive = Some(field.bytes().await.map_err(|e| {
                    AgentError::InvalidRequest(format!("Failed to read upload: {}", e))
                })?);
            }
            "userId" => {
                user_id = Some(field.text().await.map_err(|e| {
                    AgentError::InvalidRequest(format!("Failed to read userId: {}", e))
                })?);
            }
            _ => {}
        }
    }

    let archive = archive
        .ok_or_else(|| AgentError::InvalidRequest("A .zip upload is required".to_string()))?;
    if !archive_name.ends_with(".zip") {
        return Err(AgentError::InvalidRequest(
            "A .zip upload is required".to_string(),
        ));
    }
    let user_id =
        user_id.ok_or_else(|| AgentError::InvalidRequest("userId is required".to_string()))?;

    let bot_id = Uuid::new_v4().to_string();
    let bot_dir = state.config.server.data_dir.join("bots").join(&bot_id);

    info!("Installing uploaded bot {} for user {}", bot_id, user_id);
    if let Err(err) = install_bot(&state, &bot_id, &user_id, &bot_dir, archive).await {
        error!("Bot upload failed for {}: {}", bot_id, err);
        let _ = tokio::fs::remove_dir_all(&bot_dir).await;
        return Err(err);
    }

    Ok(Json(json!({
        "message": "Upload and build complete",
        "botId": bot_id,
    })))
}

async fn install_bot(
    state: &AppState,
    bot_id: &str,
    user_id: &str,
    bot_dir: &Path,
    archive: Bytes,
) -> AgentResult<()> {
    extract_archive(state, bot_id, bot_dir, archive).await?;
    verify_bot_files(bot_dir).await?;

    tokio::fs::write(bot_dir.join("Dockerfile"), BOT_DOCKERFILE).await?;

    let context = tar_directory(bot_dir).await?;
    let image = image_name(bot_id);
    state.runtime.build_image(&image, context).await?;

    let name = container_name(bot_id);
    let spec = ContainerSpec {
        image,
        labels: HashMap::from([
            ("botId".to_string(), bot_id.to_string()),
            ("userId".to_string(), user_id.to_string()),
        ]),
        memory_bytes: BOT_MEMORY_BYTES,
        nano_cpus: BOT_NANO_CPUS,
    };
    state.runtime.create_container(&name, &spec).await?;
    state.runtime.start_container(&name).await?;

    info!("Bot {} container started", bot_id);
    Ok(())
}

async fn extract_archive(
    state: &AppState,
    bot_id: &str,
    bot_dir: &Path,
    archive: Bytes,
) -> AgentResult<()> {
    tokio::fs::create_dir_all(bot_dir).await?;

    let uploads_dir = state.config.server.data_dir.join("uploads");
    tokio::fs::create_dir_all(&uploads_dir).await?;
    let zip_path = uploads_dir.join(format!("{}.zip", bot_id));
    tokio::fs::write(&zip_path, &archive).await?;

    let result = unzip_into(&zip_path, bot_dir).await;
    let _ = tokio::fs::remove_file(&zip_path).await;
    result
}

async fn unzip_into(zip_path: &Path, bot_dir: &Path) -> AgentResult<()> {
    let output = Command::new("unzip")
        .arg("-o")
        .arg(zip_path)
        .arg("-d")
        .arg(bot_dir)
        .output()
        .await
        .map_err(|e| AgentError::IoError(format!("Failed to run unzip: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AgentError::InvalidRequest(format!(
            "Invalid .zip archive: {}",
            stderr.trim()
        )));
    }
    Ok(())
}

/// Every bot needs an entry point and a dependency list.
async fn verify_bot_files(bot_dir: &Path) -> AgentResult<()> {
    for required in ["main.py", "requirements.txt"] {
        let present = tokio::fs::try_exists(bot_dir.join(required))
            .await
            .unwrap_or(false);
        if !present {
            return Err(AgentError::InvalidRequest(format!(
                "The .zip archive must contain {}",
                required
            )));
        }
    }
    Ok(())
}

async fn tar_directory(dir: &Path) -> AgentResult<Bytes> {
    let output = Command::new("tar")
        .arg("-C")
        .arg(dir)
        .arg("-cf")
        .arg("-")
        .arg(".")
        .output()
        .await
        .map_err(|e| AgentError::IoError(format!("Failed to run tar: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AgentError::IoError(format!(
            "Failed to archive build context: {}",
            stderr.trim()
        )));
    }
    Ok(Bytes::from(output.stdout))
}

//! Per-skill request handling: validate the task, decode the upload, call the
//! backend and shape the result.

use std::sync::Arc;

use axum::body::Bytes;
use serde_json::{Map, Value};
use tokio::task;
use tracing::error;

use crate::{
    error::ServiceError,
    model::{
        CaptionResponse, Capability, DetectResponse, InvocationRequest, ModelRegistry,
        PointResponse, QueryResponse, RasterImage,
    },
};

pub const CAPTION_LENGTHS: [&str; 2] = ["short", "normal"];

#[derive(Debug, Clone)]
pub struct CaptionTask {
    pub length: String,
    pub stream: bool,
    pub reasoning: bool,
}

impl Default for CaptionTask {
    fn default() -> Self {
        Self {
            length: "normal".to_string(),
            stream: false,
            reasoning: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryTask {
    pub question: String,
    pub stream: bool,
    pub reasoning: bool,
}

/// Shared by detect and point.
#[derive(Debug, Clone, Default)]
pub struct LocateTask {
    pub object_name: String,
    pub reasoning: bool,
}

pub async fn caption(
    registry: &ModelRegistry,
    image: Bytes,
    task: CaptionTask,
) -> Result<CaptionResponse, ServiceError> {
    log_failure(Capability::Caption, run_caption(registry, image, task).await)
}

pub async fn query(
    registry: &ModelRegistry,
    image: Bytes,
    task: QueryTask,
) -> Result<QueryResponse, ServiceError> {
    log_failure(Capability::Query, run_query(registry, image, task).await)
}

pub async fn detect(
    registry: &ModelRegistry,
    image: Bytes,
    task: LocateTask,
) -> Result<DetectResponse, ServiceError> {
    let capability = Capability::Detect;
    let outcome = locate(registry, image, task, capability)
        .await
        .and_then(|result| record_field(&result, capability))
        .map(|objects| DetectResponse { objects });
    log_failure(capability, outcome)
}

pub async fn point(
    registry: &ModelRegistry,
    image: Bytes,
    task: LocateTask,
) -> Result<PointResponse, ServiceError> {
    let capability = Capability::Point;
    let outcome = locate(registry, image, task, capability)
        .await
        .and_then(|result| record_field(&result, capability))
        .map(|points| PointResponse { points });
    log_failure(capability, outcome)
}

async fn run_caption(
    registry: &ModelRegistry,
    image: Bytes,
    task: CaptionTask,
) -> Result<CaptionResponse, ServiceError> {
    registry.ensure_ready()?;
    if !CAPTION_LENGTHS.contains(&task.length.as_str()) {
        return Err(ServiceError::InvalidParameter(
            "Length must be 'short' or 'normal'".into(),
        ));
    }
    let image = decode_image(image).await?;

    let request = InvocationRequest::new(Capability::Caption)
        .image(image)
        .param("length", task.length)
        .param("stream", task.stream)
        .param("reasoning", task.reasoning);
    let result = registry.invoke(request).await?;

    Ok(CaptionResponse {
        caption: text_field(&result, Capability::Caption)?,
    })
}

async fn run_query(
    registry: &ModelRegistry,
    image: Bytes,
    task: QueryTask,
) -> Result<QueryResponse, ServiceError> {
    registry.ensure_ready()?;
    require_text(&task.question, "Question")?;
    let image = decode_image(image).await?;

    let request = InvocationRequest::new(Capability::Query)
        .image(image)
        .text(task.question)
        .param("stream", task.stream)
        .param("reasoning", task.reasoning);
    let result = registry.invoke(request).await?;

    Ok(QueryResponse {
        answer: text_field(&result, Capability::Query)?,
    })
}

async fn locate(
    registry: &ModelRegistry,
    image: Bytes,
    task: LocateTask,
    capability: Capability,
) -> Result<Value, ServiceError> {
    registry.ensure_ready()?;
    require_text(&task.object_name, "Object name")?;
    let image = decode_image(image).await?;

    let request = InvocationRequest::new(capability)
        .image(image)
        .text(task.object_name)
        .param("reasoning", task.reasoning);
    registry.invoke(request).await
}

pub async fn decode_image(bytes: Bytes) -> Result<Arc<RasterImage>, ServiceError> {
    task::spawn_blocking(move || RasterImage::decode(&bytes))
        .await
        .map_err(|err| ServiceError::InvalidImage(format!("decoder task failed: {err}")))?
        .map(Arc::new)
}

fn require_text(value: &str, label: &str) -> Result<(), ServiceError> {
    if value.trim().is_empty() {
        return Err(ServiceError::InvalidParameter(format!("{label} cannot be empty")));
    }
    Ok(())
}

/// A string, or the fragments of a streamed result joined back together.
fn text_field(result: &Value, capability: Capability) -> Result<String, ServiceError> {
    let malformed = || ServiceError::MalformedResult {
        capability,
        key: capability.result_key(),
    };

    match result.get(capability.result_key()) {
        Some(Value::String(text)) => Ok(text.clone()),
        Some(Value::Array(chunks)) => chunks
            .iter()
            .map(|chunk| chunk.as_str().ok_or_else(malformed))
            .collect::<Result<String, _>>(),
        _ => Err(malformed()),
    }
}

fn record_field(
    result: &Value,
    capability: Capability,
) -> Result<Vec<Map<String, Value>>, ServiceError> {
    let malformed = || ServiceError::MalformedResult {
        capability,
        key: capability.result_key(),
    };

    let Some(Value::Array(items)) = result.get(capability.result_key()) else {
        return Err(malformed());
    };
    items
        .iter()
        .map(|item| item.as_object().cloned().ok_or_else(malformed))
        .collect()
}

fn log_failure<T>(capability: Capability, outcome: Result<T, ServiceError>) -> Result<T, ServiceError> {
    if let Err(err) = &outcome {
        error!(%capability, error = %err, kind = err.kind(), "skill request failed");
    }
    outcome
}

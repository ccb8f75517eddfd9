use std::{collections::HashMap, sync::Arc};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, State, multipart::MultipartRejection},
    routing::{get, post},
};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{
        CaptionResponse, DetectResponse, LifecycleState, ModelRegistry, PointResponse,
        QueryResponse,
    },
    pipeline::{self, CaptionTask, LocateTask, QueryTask},
};

pub const SERVICE_NAME: &str = "Moondream API";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<ModelRegistry>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    model_loaded: bool,
    state: LifecycleState,
    optimized: bool,
}

#[derive(Serialize)]
struct InfoResponse {
    message: &'static str,
    version: &'static str,
}

pub fn build_router(config: Arc<AppConfig>, registry: Arc<ModelRegistry>) -> Router {
    let body_limit = config.max_upload_bytes;
    let state = AppState { registry, config };

    Router::new()
        .route("/health", get(health))
        .route("/v1", get(info))
        .route("/v1/caption", post(caption))
        .route("/v1/query", post(query))
        .route("/v1/detect", post(detect))
        .route("/v1/point", post(point))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let lifecycle = state.registry.state();
    let status = match lifecycle {
        LifecycleState::Ready => "healthy",
        other => other.as_str(),
    };

    Json(HealthResponse {
        status,
        model_loaded: state.registry.is_loaded(),
        state: lifecycle,
        optimized: state.registry.is_optimized(),
    })
}

async fn info() -> Json<InfoResponse> {
    Json(InfoResponse {
        message: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn caption(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<CaptionResponse>, ServiceError> {
    state.registry.ensure_ready()?;
    let mut form = SkillForm::read(multipart).await?;
    let task = CaptionTask {
        length: form.text_or("length", "normal"),
        stream: form.flag("stream")?,
        reasoning: form.flag("reasoning")?,
    };

    let response = pipeline::caption(&state.registry, form.image()?, task).await?;
    Ok(Json(response))
}

async fn query(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<QueryResponse>, ServiceError> {
    state.registry.ensure_ready()?;
    let mut form = SkillForm::read(multipart).await?;
    let task = QueryTask {
        question: form.required("question")?,
        stream: form.flag("stream")?,
        reasoning: form.flag("reasoning")?,
    };

    let response = pipeline::query(&state.registry, form.image()?, task).await?;
    Ok(Json(response))
}

async fn detect(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<DetectResponse>, ServiceError> {
    state.registry.ensure_ready()?;
    let mut form = SkillForm::read(multipart).await?;
    let task = form.locate_task()?;

    let response = pipeline::detect(&state.registry, form.image()?, task).await?;
    Ok(Json(response))
}

async fn point(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PointResponse>, ServiceError> {
    state.registry.ensure_ready()?;
    let mut form = SkillForm::read(multipart).await?;
    let task = form.locate_task()?;

    let response = pipeline::point(&state.registry, form.image()?, task).await?;
    Ok(Json(response))
}

/// Multipart upload: one `image` file plus plain text fields.
#[derive(Debug, Default)]
struct SkillForm {
    image: Option<Bytes>,
    fields: HashMap<String, String>,
}

impl SkillForm {
    async fn read(multipart: Result<Multipart, MultipartRejection>) -> Result<Self, ServiceError> {
        let mut multipart = multipart.map_err(|e| ServiceError::InvalidParameter(e.body_text()))?;
        let mut form = SkillForm::default();

        while let Some(field) = multipart.next_field().await.map_err(malformed_body)? {
            let Some(name) = field.name().map(str::to_owned) else {
                continue;
            };
            if name == "image" {
                form.image = Some(field.bytes().await.map_err(malformed_body)?);
            } else {
                let value = field.text().await.map_err(malformed_body)?;
                form.fields.insert(name, value);
            }
        }

        Ok(form)
    }

    fn image(&mut self) -> Result<Bytes, ServiceError> {
        self.image
            .take()
            .ok_or_else(|| ServiceError::InvalidParameter("field 'image' is required".into()))
    }

    fn required(&self, name: &str) -> Result<String, ServiceError> {
        self.fields
            .get(name)
            .cloned()
            .ok_or_else(|| ServiceError::InvalidParameter(format!("field '{name}' is required")))
    }

    fn text_or(&self, name: &str, default: &str) -> String {
        self.fields
            .get(name)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    fn flag(&self, name: &str) -> Result<bool, ServiceError> {
        match self.fields.get(name) {
            None => Ok(false),
            Some(raw) => parse_flag(raw).ok_or_else(|| {
                ServiceError::InvalidParameter(format!("field '{name}' must be a boolean, got '{raw}'"))
            }),
        }
    }

    fn locate_task(&self) -> Result<LocateTask, ServiceError> {
        Ok(LocateTask {
            object_name: self.required("object_name")?,
            reasoning: self.flag("reasoning")?,
        })
    }
}

fn malformed_body(err: axum::extract::multipart::MultipartError) -> ServiceError {
    ServiceError::InvalidParameter(format!("malformed multipart body: {err}"))
}

/// Form booleans as browsers and HTTP clients tend to send them.
fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

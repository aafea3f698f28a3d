//! JSON API over the radar engine.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        FromRequest, FromRequestParts, Path, Query, Request, State,
    },
    http::{request::Parts, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use radar_core::{
    Alert, HotTag, Page, PageRequest, ProcessStatus, RunRecord, RunTrigger, Settings,
    SettingsPatch, Task, TaskDraft, TaskPatch, TaskStatus, Template, TemplateDraft, TemplatePatch,
    ValidationError, VideoRecord, VideoSort,
};
use radar_engine::{DryRunReport, Engine, EngineError};
use radar_storage::{TaskFilter, VideoFilter};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "radar-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// `["*"]` allows any origin.
    pub cors_origins: Vec<String>,
}

/// Engine error rendered as `{ "error": kind, "message": text }`.
#[derive(Debug)]
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::ConcurrentRunConflict { .. } => StatusCode::CONFLICT,
            EngineError::Fetch(_) => StatusCode::BAD_GATEWAY,
            EngineError::ItemClassification { .. } | EngineError::Persistence(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        let body = json!({ "error": self.0.kind(), "message": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

impl ApiError {
    fn malformed(part: &str, message: String) -> Self {
        Self(EngineError::Validation(ValidationError::new(part, message)))
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// `Json` whose rejections render through [`ApiError`] as validation errors.
#[derive(Debug)]
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError::malformed("body", rejection.body_text())),
        }
    }
}

/// `Query` counterpart of [`ApiJson`].
#[derive(Debug)]
pub struct ApiQuery<T>(pub T);

impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    Query<T>: FromRequestParts<S, Rejection = QueryRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Query::<T>::from_request_parts(parts, state).await {
            Ok(Query(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError::malformed("query", rejection.body_text())),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PageQuery {
    page: Option<u32>,
    page_size: Option<u32>,
}

impl PageQuery {
    fn request(&self) -> PageRequest {
        PageRequest::new(self.page, self.page_size)
    }
}

#[derive(Debug, Default, Deserialize)]
struct TaskListQuery {
    status: Option<TaskStatus>,
    q: Option<String>,
    page: Option<u32>,
    page_size: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct AlertListQuery {
    #[serde(default)]
    unread: bool,
    page: Option<u32>,
    page_size: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct VideoListQuery {
    task_id: Option<Uuid>,
    tag: Option<HotTag>,
    process_status: Option<ProcessStatus>,
    publish_from: Option<DateTime<Utc>>,
    publish_to: Option<DateTime<Utc>>,
    fetch_from: Option<DateTime<Utc>>,
    fetch_to: Option<DateTime<Utc>>,
    min_views: Option<u64>,
    min_fav: Option<u64>,
    min_coin: Option<u64>,
    min_reply: Option<u64>,
    min_fav_rate: Option<f64>,
    min_coin_rate: Option<f64>,
    min_reply_rate: Option<f64>,
    min_fav_fan_ratio: Option<f64>,
    fan_max: Option<u64>,
    #[serde(default)]
    sort: VideoSort,
    page: Option<u32>,
    page_size: Option<u32>,
}

impl VideoListQuery {
    fn filter(&self) -> VideoFilter {
        VideoFilter {
            task_id: self.task_id,
            tag: self.tag,
            process_status: self.process_status,
            publish_from: self.publish_from,
            publish_to: self.publish_to,
            fetch_from: self.fetch_from,
            fetch_to: self.fetch_to,
            min_views: self.min_views,
            min_fav: self.min_fav,
            min_coin: self.min_coin,
            min_reply: self.min_reply,
            min_fav_rate: self.min_fav_rate,
            min_coin_rate: self.min_coin_rate,
            min_reply_rate: self.min_reply_rate,
            min_fav_fan_ratio: self.min_fav_fan_ratio,
            fan_max: self.fan_max,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProcessStatusBody {
    process_status: ProcessStatus,
}

#[derive(Debug, Deserialize)]
struct NoteBody {
    note: Option<String>,
}

#[derive(Debug, Serialize)]
struct TagList {
    items: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DryRunQuery {
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ApplyTemplateBody {
    template_id: Uuid,
}

#[derive(Debug, Serialize)]
struct RunStarted {
    run_id: Uuid,
}

#[derive(Debug, Serialize)]
struct Count {
    count: u64,
}

pub fn app(state: AppState) -> Router {
    api_router(state)
        .layer(TraceLayer::new_for_http())
}

fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/tasks", get(list_tasks_handler).post(create_task_handler))
        .route(
            "/api/tasks/{id}",
            get(get_task_handler)
                .put(update_task_handler)
                .delete(delete_task_handler),
        )
        .route("/api/tasks/{id}/enable", post(enable_task_handler))
        .route("/api/tasks/{id}/disable", post(disable_task_handler))
        .route("/api/tasks/{id}/run", post(run_task_handler))
        .route("/api/tasks/{id}/dry-run", post(dry_run_handler))
        .route("/api/tasks/{id}/clone", post(clone_task_handler))
        .route("/api/tasks/{id}/apply-template", post(apply_template_to_task_handler))
        .route("/api/tasks/{id}/runs", get(list_runs_handler))
        .route("/api/runs/{id}", get(get_run_handler))
        .route("/api/runs/{id}/retry", post(retry_run_handler))
        .route("/api/alerts", get(list_alerts_handler))
        .route("/api/alerts/unread-count", get(unread_count_handler))
        .route("/api/alerts/read-all", post(mark_all_read_handler))
        .route("/api/alerts/{id}/read", post(mark_read_handler))
        .route("/api/settings", get(get_settings_handler).put(put_settings_handler))
        .route(
            "/api/templates",
            get(list_templates_handler).post(create_template_handler),
        )
        .route(
            "/api/templates/{id}",
            get(get_template_handler)
                .put(update_template_handler)
                .delete(delete_template_handler),
        )
        .route("/api/templates/{id}/apply", post(apply_template_handler))
        .route("/api/videos", get(list_videos_handler))
        .route("/api/videos/{bvid}", get(get_video_handler))
        .route("/api/videos/{bvid}/process-status", post(set_process_status_handler))
        .route("/api/videos/{bvid}/note", post(set_note_handler))
        .route("/api/tags", get(list_tags_handler))
        .with_state(Arc::new(state))
}

pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return base.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    base.allow_origin(AllowOrigin::list(allowed))
}

pub async fn serve(
    config: ServerConfig,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    info!(addr = %config.bind, "api listening");
    let router = app(state).layer(cors_layer(&config.cors_origins));
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("serving api")?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_tasks_handler(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<TaskListQuery>,
) -> ApiResult<Page<Task>> {
    let filter = TaskFilter {
        status: query.status,
        q: query.q,
    };
    let page = PageRequest::new(query.page, query.page_size);
    Ok(Json(state.engine.tasks.list(filter, page).await?))
}

async fn create_task_handler(
    State(state): State<Arc<AppState>>,
    ApiJson(draft): ApiJson<TaskDraft>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let task = state.engine.tasks.create(draft).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn get_task_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Task> {
    Ok(Json(state.engine.tasks.get(id).await?))
}

async fn update_task_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    ApiJson(patch): ApiJson<TaskPatch>,
) -> ApiResult<Task> {
    Ok(Json(state.engine.tasks.update(id, patch).await?))
}

async fn delete_task_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.engine.tasks.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn enable_task_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Task> {
    Ok(Json(
        state.engine.tasks.set_status(id, TaskStatus::Enabled).await?,
    ))
}

async fn disable_task_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Task> {
    Ok(Json(
        state.engine.tasks.set_status(id, TaskStatus::Disabled).await?,
    ))
}

async fn run_task_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<RunStarted>), ApiError> {
    let run = state.engine.executor.start(id, RunTrigger::Manual).await?;
    Ok((StatusCode::ACCEPTED, Json(RunStarted { run_id: run.id })))
}

async fn dry_run_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    ApiQuery(query): ApiQuery<DryRunQuery>,
) -> ApiResult<DryRunReport> {
    Ok(Json(state.engine.executor.dry_run(id, query.limit).await?))
}

async fn clone_task_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let copy = state.engine.tasks.clone_task(id).await?;
    Ok((StatusCode::CREATED, Json(copy)))
}

async fn apply_template_to_task_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    ApiJson(body): ApiJson<ApplyTemplateBody>,
) -> ApiResult<Task> {
    Ok(Json(
        state.engine.tasks.apply_template(id, body.template_id).await?,
    ))
}

async fn list_runs_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    ApiQuery(query): ApiQuery<PageQuery>,
) -> ApiResult<Page<RunRecord>> {
    Ok(Json(state.engine.tasks.list_runs(id, query.request()).await?))
}

async fn get_run_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<RunRecord> {
    Ok(Json(state.engine.tasks.get_run(id).await?))
}

async fn retry_run_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<RunStarted>), ApiError> {
    let run = state.engine.executor.retry(id).await?;
    Ok((StatusCode::ACCEPTED, Json(RunStarted { run_id: run.id })))
}

async fn list_alerts_handler(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<AlertListQuery>,
) -> ApiResult<Page<Alert>> {
    let page = PageRequest::new(query.page, query.page_size);
    Ok(Json(state.engine.alerts.list(query.unread, page).await?))
}

async fn unread_count_handler(State(state): State<Arc<AppState>>) -> ApiResult<Count> {
    Ok(Json(Count {
        count: state.engine.alerts.unread_count().await?,
    }))
}

async fn mark_read_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Alert> {
    Ok(Json(state.engine.alerts.mark_read(id).await?))
}

async fn mark_all_read_handler(State(state): State<Arc<AppState>>) -> ApiResult<Count> {
    Ok(Json(Count {
        count: state.engine.alerts.mark_all_read().await?,
    }))
}

async fn get_settings_handler(State(state): State<Arc<AppState>>) -> Json<Settings> {
    Json(state.engine.settings.current())
}

async fn put_settings_handler(
    State(state): State<Arc<AppState>>,
    ApiJson(patch): ApiJson<SettingsPatch>,
) -> ApiResult<Settings> {
    Ok(Json(state.engine.settings.update(patch).await?))
}

async fn list_templates_handler(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Template>> {
    Ok(Json(state.engine.templates.list().await?))
}

async fn create_template_handler(
    State(state): State<Arc<AppState>>,
    ApiJson(draft): ApiJson<TemplateDraft>,
) -> Result<(StatusCode, Json<Template>), ApiError> {
    let template = state.engine.templates.create(draft).await?;
    Ok((StatusCode::CREATED, Json(template)))
}

async fn get_template_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Template> {
    Ok(Json(state.engine.templates.get(id).await?))
}

async fn update_template_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    ApiJson(patch): ApiJson<TemplatePatch>,
) -> ApiResult<Template> {
    Ok(Json(state.engine.templates.update(id, patch).await?))
}

async fn delete_template_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.engine.templates.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn apply_template_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    ApiJson(draft): ApiJson<TaskDraft>,
) -> ApiResult<TaskDraft> {
    Ok(Json(state.engine.templates.apply(id, draft).await?))
}

async fn list_videos_handler(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<VideoListQuery>,
) -> ApiResult<Page<VideoRecord>> {
    let page = PageRequest::new(query.page, query.page_size);
    Ok(Json(
        state.engine.videos.list(query.filter(), query.sort, page).await?,
    ))
}

async fn get_video_handler(
    State(state): State<Arc<AppState>>,
    Path(bvid): Path<String>,
) -> ApiResult<VideoRecord> {
    Ok(Json(state.engine.videos.get(&bvid).await?))
}

async fn set_process_status_handler(
    State(state): State<Arc<AppState>>,
    Path(bvid): Path<String>,
    ApiJson(body): ApiJson<ProcessStatusBody>,
) -> ApiResult<VideoRecord> {
    Ok(Json(
        state
            .engine
            .videos
            .set_process_status(&bvid, body.process_status)
            .await?,
    ))
}

async fn set_note_handler(
    State(state): State<Arc<AppState>>,
    Path(bvid): Path<String>,
    ApiJson(body): ApiJson<NoteBody>,
) -> ApiResult<VideoRecord> {
    Ok(Json(state.engine.videos.set_note(&bvid, body.note).await?))
}

async fn list_tags_handler(State(state): State<Arc<AppState>>) -> ApiResult<TagList> {
    Ok(Json(TagList {
        items: state.engine.videos.tags().await?,
    }))
}

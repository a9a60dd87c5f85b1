//! HTTP surface: JSON endpoints over the hub services.

use crate::error::HubError;
use crate::inbox::{Inbox, InboxPage};
use crate::mapping::{suggest_mapping, MappingRequest, MappingStore};
use crate::models::{
    DataSourceConfig, DataSourceView, DataType, FieldMapping, FieldPair, JobParameters, JobType,
    ProbeResult, ScheduleRequest, SourcePatch, SyncConflict, SyncJob, SyncSchedule,
};
use crate::query::{QueryExecutor, QueryResult};
use crate::registry::SourceRegistry;
use crate::sanitizer::AuditEntry;
use crate::scheduler::SyncScheduler;
use crate::store::HubStore;
use crate::target_schema::{schema_for, TargetSchema};
use axum::{
    async_trait,
    extract::{FromRequest, Path, Query, Request, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

const DEFAULT_JOB_LIMIT: usize = 50;
const DEFAULT_INBOX_LIMIT: usize = 20;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SourceRegistry>,
    pub executor: Arc<QueryExecutor>,
    pub mappings: Arc<MappingStore>,
    pub scheduler: Arc<SyncScheduler>,
    pub store: HubStore,
    pub inbox: Inbox,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sources", get(list_sources).post(create_source))
        .route(
            "/sources/:id",
            get(get_source).patch(update_source).delete(delete_source),
        )
        .route("/sources/:id/test", post(test_source))
        .route("/query", post(run_query))
        .route("/schemas/:data_type", get(get_schema))
        .route("/mappings/:data_type", get(list_mappings).post(create_mapping))
        .route("/mappings/:data_type/suggest", post(suggest))
        .route(
            "/mappings/:data_type/:name",
            get(get_mapping).put(update_mapping).delete(delete_mapping),
        )
        .route("/schedules", get(list_schedules).post(create_schedule))
        .route(
            "/schedules/:id",
            get(get_schedule).put(update_schedule).delete(delete_schedule),
        )
        .route("/schedules/:id/run", post(run_schedule))
        .route("/jobs", get(list_jobs).post(create_job))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/conflicts", get(get_conflicts))
        .route("/jobs/:id/audit", get(get_audit))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/notifications", get(list_notifications))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Error mapping
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status: String,
    pub message: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn status_for(e: &HubError) -> StatusCode {
    match e {
        HubError::SourceNotFound(_)
        | HubError::MappingNotFound(_)
        | HubError::ScheduleNotFound(_)
        | HubError::JobNotFound(_) => StatusCode::NOT_FOUND,
        HubError::DuplicateSource(_)
        | HubError::DuplicateMapping(_)
        | HubError::JobAlreadyRunning(_) => StatusCode::CONFLICT,
        HubError::InvalidConfig(_)
        | HubError::QueryRejected(_)
        | HubError::InvalidMapping(_)
        | HubError::InvalidSchedule(_) => StatusCode::BAD_REQUEST,
        HubError::ConnectionUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        HubError::QueryTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        HubError::Connection { .. } | HubError::Query(_) => StatusCode::BAD_GATEWAY,
        HubError::Sanitization(_) => StatusCode::UNPROCESSABLE_ENTITY,
        HubError::Notification { .. } | HubError::Storage(_) | HubError::Io(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn api_error(e: HubError) -> ApiError {
    let status = status_for(&e);
    if status.is_server_error() {
        error!("Request failed: {}", e);
    }
    (
        status,
        Json(ErrorBody {
            status: "error".into(),
            message: e.to_string(),
        }),
    )
}

/// JSON request body whose rejections use the error envelope.
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err((
                rejection.status(),
                Json(ErrorBody {
                    status: "error".into(),
                    message: rejection.body_text(),
                }),
            )),
        }
    }
}

fn parse_data_type(raw: &str) -> Result<DataType, ApiError> {
    DataType::parse(raw).ok_or_else(|| {
        api_error(HubError::InvalidMapping(format!(
            "unknown data type '{}', expected one of property, sales, valuation, tax",
            raw
        )))
    })
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> &'static str {
    "ok"
}

async fn list_sources(State(state): State<AppState>) -> Json<Vec<DataSourceView>> {
    Json(state.registry.list().await)
}

async fn create_source(
    State(state): State<AppState>,
    JsonBody(config): JsonBody<DataSourceConfig>,
) -> Result<(StatusCode, Json<DataSourceView>), ApiError> {
    let view = state.registry.register(config).await.map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn get_source(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<DataSourceView> {
    state.registry.get(&id).await.map(Json).map_err(api_error)
}

async fn update_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
    JsonBody(patch): JsonBody<SourcePatch>,
) -> ApiResult<DataSourceView> {
    state.registry.update(&id, patch).await.map(Json).map_err(api_error)
}

async fn delete_source(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    state.registry.delete(&id).await.map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn test_source(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<ProbeResult> {
    state.registry.test_connection(&id).await.map(Json).map_err(api_error)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest {
    source_id: String,
    statement: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Serialize)]
struct QueryResponse {
    status: &'static str,
    #[serde(flatten)]
    result: QueryResult,
}

/// Run a read-only statement against a registered source.
async fn run_query(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<QueryRequest>,
) -> ApiResult<QueryResponse> {
    info!("Ad-hoc query on {}", req.source_id);
    let result = state
        .executor
        .execute(&req.source_id, &req.statement, req.limit)
        .await
        .map_err(api_error)?;
    Ok(Json(QueryResponse {
        status: "success",
        result,
    }))
}

async fn get_schema(Path(data_type): Path<String>) -> ApiResult<&'static TargetSchema> {
    Ok(Json(schema_for(parse_data_type(&data_type)?)))
}

async fn list_mappings(
    State(state): State<AppState>,
    Path(data_type): Path<String>,
) -> ApiResult<Vec<FieldMapping>> {
    Ok(Json(state.mappings.list(parse_data_type(&data_type)?)))
}

async fn create_mapping(
    State(state): State<AppState>,
    Path(data_type): Path<String>,
    JsonBody(req): JsonBody<MappingRequest>,
) -> Result<(StatusCode, Json<FieldMapping>), ApiError> {
    let data_type = parse_data_type(&data_type)?;
    let name = req
        .mapping_name
        .ok_or_else(|| api_error(HubError::InvalidMapping("mappingName is required".into())))?;
    let mapping = state
        .mappings
        .create(data_type, &name, req.fields)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(mapping)))
}

async fn get_mapping(
    State(state): State<AppState>,
    Path((data_type, name)): Path<(String, String)>,
) -> ApiResult<FieldMapping> {
    let data_type = parse_data_type(&data_type)?;
    state.mappings.get(data_type, &name).map(Json).map_err(api_error)
}

async fn update_mapping(
    State(state): State<AppState>,
    Path((data_type, name)): Path<(String, String)>,
    JsonBody(req): JsonBody<MappingRequest>,
) -> ApiResult<FieldMapping> {
    let data_type = parse_data_type(&data_type)?;
    state
        .mappings
        .update(data_type, &name, req.fields)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn delete_mapping(
    State(state): State<AppState>,
    Path((data_type, name)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let data_type = parse_data_type(&data_type)?;
    state.mappings.delete(data_type, &name).await.map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct SuggestRequest {
    columns: Vec<String>,
}

async fn suggest(
    Path(data_type): Path<String>,
    JsonBody(req): JsonBody<SuggestRequest>,
) -> ApiResult<Vec<FieldPair>> {
    Ok(Json(suggest_mapping(parse_data_type(&data_type)?, &req.columns)))
}

async fn list_schedules(State(state): State<AppState>) -> Json<Vec<SyncSchedule>> {
    Json(state.scheduler.list().await)
}

async fn create_schedule(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<ScheduleRequest>,
) -> Result<(StatusCode, Json<SyncSchedule>), ApiError> {
    let schedule = state.scheduler.create(req).await.map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

async fn get_schedule(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<SyncSchedule> {
    state.scheduler.get(&id).await.map(Json).map_err(api_error)
}

async fn update_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<ScheduleRequest>,
) -> ApiResult<SyncSchedule> {
    state.scheduler.update(&id, req).await.map(Json).map_err(api_error)
}

async fn delete_schedule(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    state.scheduler.delete(&id).await.map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Force a run of the schedule now. 409 while a run is in flight.
async fn run_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<SyncJob>), ApiError> {
    let job = state.scheduler.trigger(&id).await.map_err(api_error)?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobRequest {
    job_type: JobType,
    parameters: JobParameters,
}

async fn create_job(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<JobRequest>,
) -> Result<(StatusCode, Json<SyncJob>), ApiError> {
    let job = state
        .scheduler
        .run_adhoc(req.job_type, req.parameters)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

#[derive(Deserialize)]
struct JobListQuery {
    limit: Option<usize>,
}

async fn list_jobs(State(state): State<AppState>, Query(query): Query<JobListQuery>) -> ApiResult<Vec<SyncJob>> {
    state
        .store
        .list_jobs(query.limit.unwrap_or(DEFAULT_JOB_LIMIT))
        .await
        .map(Json)
        .map_err(api_error)
}

async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<SyncJob> {
    state
        .store
        .get_job(&id)
        .await
        .map_err(api_error)?
        .map(Json)
        .ok_or_else(|| api_error(HubError::JobNotFound(id)))
}

async fn get_conflicts(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Vec<SyncConflict>> {
    state.store.list_conflicts(&id).await.map(Json).map_err(api_error)
}

async fn get_audit(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Vec<AuditEntry>> {
    state.store.list_audit(&id).await.map(Json).map_err(api_error)
}

async fn cancel_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    state.scheduler.cancel(&id).map_err(api_error)?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Deserialize)]
struct InboxQuery {
    offset: Option<usize>,
    limit: Option<usize>,
}

/// In-app notifications, newest first.
async fn list_notifications(State(state): State<AppState>, Query(query): Query<InboxQuery>) -> Json<InboxPage> {
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(DEFAULT_INBOX_LIMIT);
    Json(state.inbox.page(offset, limit))
}

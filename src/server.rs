//! Web server module for Sensorium.
//!
//! Thin HTTP and WebSocket surface over the ingestion pipeline, the
//! streaming query manager and the store facade.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

use crate::ingest::{Endpoint, IngestError, IngestionPipeline, SubscriptionChange};
use crate::live::{LiveFilter, LiveHub, LiveReceiver};
use crate::storage::{
    Aggregation, QuerySpec, SavedQueryRegistry, StorageError, StorageWriter, StoreFacade,
    TimeRange, measurements_from_json,
};
use crate::streaming::{StreamError, StreamingQueryManager};

/// Section used when a query request names none.
const DEFAULT_SECTION: &str = "default";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: IngestionPipeline,
    pub streams: StreamingQueryManager,
    pub facade: StoreFacade,
    pub writer: StorageWriter,
    pub saved_queries: SavedQueryRegistry,
    pub hub: LiveHub,
    /// Endpoint used by `/api/connect` when the request names none.
    pub default_endpoint: Endpoint,
}

// =============================================================================
// Errors
// =============================================================================

/// JSON error response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    partial_write: bool,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            partial_write: false,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = if self.partial_write {
            json!({ "error": self.message, "partial_write": true })
        } else {
            json!({ "error": self.message })
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        let status = match &err {
            StorageError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            StorageError::NotFound(_) => StatusCode::NOT_FOUND,
            StorageError::NotConnected => StatusCode::CONFLICT,
            StorageError::Connectivity(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let partial_write = matches!(err, StorageError::PartialWrite { .. });
        if partial_write {
            tracing::error!(error = %err, "Saved queries at risk after partial write");
        }
        Self {
            status,
            message: err.to_string(),
            partial_write,
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        let status = match &err {
            IngestError::InvalidEndpoint(_) | IngestError::InvalidTopic(_) => {
                StatusCode::BAD_REQUEST
            }
            IngestError::NotConnected | IngestError::AlreadyConnected(_) => StatusCode::CONFLICT,
            IngestError::Connectivity { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<StreamError> for ApiError {
    fn from(err: StreamError) -> Self {
        let status = match &err {
            StreamError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

type ApiResult<T> = Result<T, ApiError>;

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct ConnectRequest {
    endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TopicRequest {
    topic: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    section_id: Option<String>,
    measurements: Option<Value>,
    #[serde(rename = "timeRange")]
    time_range: Option<String>,
    aggregation: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RunSavedRequest {
    #[serde(rename = "timeRange")]
    time_range: Option<String>,
    aggregation: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SaveQueryRequest {
    query_name: Option<String>,
    measurements: Option<Value>,
}

/// Query parameters for the live feed.
#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub topic: Option<String>,
    pub section: Option<String>,
}

#[derive(Serialize)]
struct ChangeResponse {
    success: bool,
    changed: bool,
    message: String,
}

/// Parse an optional JSON body; an empty body yields the default.
fn optional_body<T: Default + serde::de::DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("invalid body: {e}")))
}

fn required_topic(request: TopicRequest) -> ApiResult<String> {
    request
        .topic
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("topic is required"))
}

// =============================================================================
// Router
// =============================================================================

/// Create the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    let app_state = Arc::new(state);

    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/api/connect", post(connect_handler))
        .route("/api/disconnect", post(disconnect_handler))
        .route("/api/status", get(status_handler))
        .route("/api/subscribe", post(subscribe_handler))
        .route("/api/unsubscribe", post(unsubscribe_handler))
        .route("/api/subscriptions", get(subscriptions_handler))
        .route("/api/catalog", get(catalog_handler))
        .route("/api/catalog/refresh", post(catalog_refresh_handler))
        .route("/api/query", post(start_query_handler))
        .route("/api/query/section/{section_id}", delete(stop_query_handler))
        .route("/api/sections", get(sections_handler))
        .route("/api/save_query", post(save_query_handler))
        .route("/api/user_queries", get(user_queries_handler))
        .route(
            "/api/query/{name}",
            post(run_saved_query_handler).delete(delete_saved_query_handler),
        )
        .route("/ws", get(ws_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

// =============================================================================
// Probes
// =============================================================================

/// Liveness probe.
async fn healthz_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Readiness probe that pings the store.
async fn readyz_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.facade.ping().await {
        Ok(()) => Json(json!({ "status": "ok", "db": "ready" })).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "not_ready", "db": err.to_string() })),
            )
                .into_response()
        }
    }
}

// =============================================================================
// Transport
// =============================================================================

async fn connect_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let request: ConnectRequest = optional_body(&body)?;
    let endpoint = match request.endpoint {
        Some(raw) => raw.parse::<Endpoint>()?,
        None => state.default_endpoint.clone(),
    };

    let handle = state.pipeline.connect(&endpoint).await?;
    Ok(Json(json!({
        "success": true,
        "endpoint": handle.endpoint().to_string(),
        "message": "Connected",
    })))
}

async fn disconnect_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.pipeline.disconnect().await;
    Json(json!({ "success": true, "message": "Disconnected" }))
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "transport": state.pipeline.status().await,
        "store": state.facade.state(),
        "writer": state.writer.stats(),
        "sections": state.streams.active_count().await,
        "live_receivers": state.hub.receiver_count(),
    }))
}

async fn subscribe_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TopicRequest>,
) -> ApiResult<Json<ChangeResponse>> {
    let topic = required_topic(request)?;
    let change = state.pipeline.subscribe(&topic).await?;
    let message = match change {
        SubscriptionChange::Applied => format!("Subscribed to {topic}"),
        SubscriptionChange::Unchanged => format!("Already subscribed to {topic}"),
    };
    Ok(Json(ChangeResponse {
        success: true,
        changed: change.is_changed(),
        message,
    }))
}

async fn unsubscribe_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TopicRequest>,
) -> ApiResult<Json<ChangeResponse>> {
    let topic = required_topic(request)?;
    let change = state.pipeline.unsubscribe(&topic).await?;
    let message = match change {
        SubscriptionChange::Applied => format!("Unsubscribed from {topic}"),
        SubscriptionChange::Unchanged => format!("Not subscribed to {topic}"),
    };
    Ok(Json(ChangeResponse {
        success: true,
        changed: change.is_changed(),
        message,
    }))
}

async fn subscriptions_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "topics": state.pipeline.list_subscriptions().await }))
}

// =============================================================================
// Catalog and queries
// =============================================================================

async fn catalog_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let catalog = state.facade.catalog().await;
    Json(json!(catalog.as_ref()))
}

async fn catalog_refresh_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let catalog = state.facade.refresh_catalog().await?;
    Ok(Json(json!(catalog.as_ref())))
}

async fn start_query_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> ApiResult<Json<Value>> {
    let measurements = request
        .measurements
        .as_ref()
        .ok_or_else(|| ApiError::bad_request("measurements is required"))
        .and_then(|m| measurements_from_json(m).map_err(ApiError::from))?;
    let spec = QuerySpec::new(
        measurements,
        TimeRange::parse_lenient(request.time_range.as_deref()),
        Aggregation::parse_lenient(request.aggregation.as_deref()),
    );
    let section_id = request
        .section_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SECTION.to_string());

    let outcome = state.streams.start(&section_id, spec).await?;
    Ok(Json(json!({
        "message": "Query started",
        "section_id": outcome.section_id,
        "run_id": outcome.run_id,
        "replaced": outcome.replaced,
    })))
}

async fn stop_query_handler(
    State(state): State<Arc<AppState>>,
    Path(section_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let stopped = state.streams.stop(&section_id).await?;
    Ok(Json(json!({
        "success": true,
        "section_id": section_id,
        "stopped": stopped,
    })))
}

async fn sections_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.streams.list().await))
}

// =============================================================================
// Saved queries
// =============================================================================

async fn save_query_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SaveQueryRequest>,
) -> ApiResult<Json<Value>> {
    let (Some(name), Some(measurements)) = (request.query_name, request.measurements) else {
        return Err(ApiError::bad_request(
            "query_name and measurements are required",
        ));
    };
    let measurements = measurements_from_json(&measurements)?;
    let saved = state.saved_queries.save(&name, measurements).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Query saved",
        "query": saved,
    })))
}

async fn user_queries_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let queries = state.saved_queries.list().await?;
    Ok(Json(json!({ "queries": queries })))
}

async fn run_saved_query_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let request: RunSavedRequest = optional_body(&body)?;
    let rows = state
        .saved_queries
        .run(
            &name,
            TimeRange::parse_lenient(request.time_range.as_deref()),
            Aggregation::parse_lenient(request.aggregation.as_deref()),
        )
        .await?;
    Ok(Json(json!({ "query_name": name, "data": rows })))
}

async fn delete_saved_query_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let removed = state.saved_queries.delete(&name).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Query deleted",
        "query_name": removed.query_name,
    })))
}

// =============================================================================
// Live feed
// =============================================================================

/// Upgrade to a WebSocket streaming live frames.
///
/// With no parameters every channel is forwarded.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<WsParams>,
) -> impl IntoResponse {
    let filter = match (params.topic, params.section) {
        (None, None) => LiveFilter::All,
        (Some(topic), None) => LiveFilter::topic(topic),
        (None, Some(section)) => LiveFilter::section(section),
        (Some(topic), Some(section)) => {
            LiveFilter::Any(vec![LiveFilter::topic(topic), LiveFilter::section(section)])
        }
    };
    let receiver = state.hub.subscribe(filter);
    ws.on_upgrade(move |socket| forward_live(socket, receiver))
}

async fn forward_live(mut socket: WebSocket, mut receiver: LiveReceiver) {
    tracing::debug!(filter = ?receiver.filter(), "Live client connected");
    loop {
        tokio::select! {
            message = receiver.recv() => {
                let Some(message) = message else { break };
                let frame = message.to_frame().to_string();
                if socket.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    tracing::debug!("Live client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{LocalBroker, PipelineOptions};
    use crate::storage::{StorageBuilder, StorageHandles};
    use crate::streaming::StreamOptions;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn create_test_state() -> (AppState, StorageHandles) {
        let handles = StorageBuilder::new("sqlite::memory:")
            .channel_capacity(100)
            .build()
            .await
            .unwrap();
        let hub = LiveHub::new(64);
        let pipeline = IngestionPipeline::new(
            Arc::new(LocalBroker::new()),
            handles.writer.clone(),
            hub.clone(),
            PipelineOptions::default(),
        );
        let streams =
            StreamingQueryManager::new(handles.facade.clone(), hub.clone(), StreamOptions::default());

        let state = AppState {
            pipeline,
            streams,
            facade: handles.facade.clone(),
            writer: handles.writer.clone(),
            saved_queries: handles.saved_queries.clone(),
            hub,
            default_endpoint: Endpoint::new("local", 1883),
        };
        (state, handles)
    }

    async fn call(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_healthz() {
        let (state, _handles) = create_test_state().await;
        let (status, body) = call(create_router(state), "GET", "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_subscribe_before_connect_is_conflict() {
        let (state, _handles) = create_test_state().await;
        let (status, body) = call(
            create_router(state),
            "POST",
            "/api/subscribe",
            Some(json!({ "topic": "a/b" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("not connected"));
    }

    #[tokio::test]
    async fn test_save_query_requires_fields() {
        let (state, _handles) = create_test_state().await;
        let (status, _) = call(
            create_router(state),
            "POST",
            "/api/save_query",
            Some(json!({ "query_name": "q1" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_start_query_defaults_section() {
        let (state, _handles) = create_test_state().await;
        let streams = state.streams.clone();
        let (status, body) = call(
            create_router(state),
            "POST",
            "/api/query",
            Some(json!({ "measurements": ["t1"], "timeRange": "unknown", "aggregation": "unknown" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Query started");
        assert_eq!(body["section_id"], "default");

        let info = streams.lookup("default").await.unwrap();
        assert_eq!(info.query.time_range, TimeRange::Last24Hours);
        assert_eq!(info.query.aggregation, Aggregation::Average);
        streams.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_nested_measurements_rejected() {
        let (state, _handles) = create_test_state().await;
        let (status, _) = call(
            create_router(state),
            "POST",
            "/api/query",
            Some(json!({ "measurements": [["a", "b"]] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}

//! HTTP surface: the CLI operations, the gated mesh entry point and `/fetch/*` interception.

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use threshold_core::{
    DenialReason, FetchRequest, MeshContext, MeshError, MeshRequest, MeshResponse, Threshold,
};

/// Header carrying the cell token for `/v1/mesh`.
pub const TOKEN_HEADER: &str = "x-cell-token";
const DEFAULT_DRILL_HOURS: f64 = 1.0;

#[derive(Clone)]
pub struct AppState {
    pub mesh: Arc<MeshContext>,
}

pub struct ApiError(MeshError);

impl From<MeshError> for ApiError {
    fn from(e: MeshError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            MeshError::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            MeshError::NotFound(_) | MeshError::UnknownCell(_) | MeshError::UnknownRoute(_) => {
                StatusCode::NOT_FOUND
            }
            e if e.is_validation() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "[GATEWAY] request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/gate", get(gate_status))
        .route("/v1/dashboard", get(dashboard))
        .route("/v1/routes/:threshold", get(route_check))
        .route("/v1/sync", post(sync_force))
        .route("/v1/offline-drill", post(offline_drill))
        .route("/v1/mesh", post(mesh_request))
        .route("/fetch/*path", any(fetch))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn gate_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.mesh.gate_status())
}

async fn dashboard(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.mesh.dashboard()?))
}

async fn route_check(
    State(state): State<AppState>,
    Path(threshold): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let threshold: Threshold = threshold.parse()?;
    Ok(Json(state.mesh.route_check(threshold)?))
}

async fn sync_force(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.mesh.sync_force().await?))
}

#[derive(Debug, Deserialize)]
struct DrillParams {
    hours: Option<f64>,
}

async fn offline_drill(
    State(state): State<AppState>,
    Query(params): Query<DrillParams>,
) -> ApiResult<impl IntoResponse> {
    let hours = params.hours.unwrap_or(DEFAULT_DRILL_HOURS);
    Ok(Json(state.mesh.test_offline(hours).await?))
}

async fn mesh_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<MeshRequest>,
) -> ApiResult<Response> {
    let token = headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let response = state.mesh.handle(token, request).await?;
    let status = match &response {
        MeshResponse::Denied {
            reason: DenialReason::RateLimited,
            ..
        } => StatusCode::TOO_MANY_REQUESTS,
        MeshResponse::Denied {
            reason: DenialReason::Lockdown,
            ..
        } => StatusCode::LOCKED,
        _ => StatusCode::OK,
    };
    Ok((status, Json(response)).into_response())
}

async fn fetch(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Response> {
    let full = uri.path_and_query().map(|p| p.as_str()).unwrap_or(uri.path());
    let path = full.strip_prefix("/fetch").unwrap_or(full);
    let request = FetchRequest {
        method: method.as_str().to_string(),
        path: if path.is_empty() { "/".to_string() } else { path.to_string() },
        body: (!body.is_empty()).then_some(body),
        content_type: headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    };
    let response = state.mesh.interceptor().handle(request).await?;
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = response
        .content_type
        .unwrap_or_else(|| "text/plain; charset=utf-8".to_string());
    Ok((
        status,
        [
            (header::CONTENT_TYPE, content_type),
            (
                header::HeaderName::from_static("x-threshold-source"),
                format!("{:?}", response.source).to_lowercase(),
            ),
        ],
        response.body,
    )
        .into_response())
}

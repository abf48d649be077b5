use crate::app_state::{AppState, SharedAppState};
use crate::dataset::{DatasetSeries, QueryRequest};
use crate::error::IngestError;
use crate::metrics::{metrics_handler, record_response_metrics, request_counter};
use crate::models::TriggerEvent;
use crate::object_store::base_name;
use crate::orchestrator::Orchestrator;
use crate::validated_json::ValidatedJson;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower::Layer;
use tower::ServiceBuilder;
use tower_http::normalize_path::{NormalizePath, NormalizePathLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

const USER_ID_PARAM: &str = "userId";
const FILE_ID_PARAM: &str = "fileId";

/// Body of the response to an accepted trigger event.
#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct Accepted {
    /// Ids of the uploads queued for processing
    pub accepted: Vec<String>,
}

/// Returns a [axum::Router] for the ingestion service API.
///
/// # Arguments
///
/// * `state`: Shared application state
pub fn router(state: SharedAppState) -> Router {
    fn v1() -> Router<SharedAppState> {
        Router::new()
            .route("/events", post(events))
            .route("/benchmarks/:benchmark_id/datasets", get(datasets))
            .route("/benchmarks/:benchmark_id/query", post(query))
    }

    fn status_routes(allow_origin: &str) -> Router<SharedAppState> {
        let allow_origin = HeaderValue::from_str(allow_origin).unwrap_or_else(|_| {
            tracing::warn!("invalid CORS origin {:?}, allowing any origin", allow_origin);
            HeaderValue::from_static("*")
        });
        Router::new()
            .route("/status", get(status).options(preflight))
            .layer(
                ServiceBuilder::new()
                    .layer(SetResponseHeaderLayer::overriding(
                        header::ACCESS_CONTROL_ALLOW_ORIGIN,
                        allow_origin,
                    ))
                    .layer(SetResponseHeaderLayer::overriding(
                        header::ACCESS_CONTROL_ALLOW_METHODS,
                        HeaderValue::from_static("GET,OPTIONS"),
                    ))
                    .layer(SetResponseHeaderLayer::overriding(
                        header::ACCESS_CONTROL_ALLOW_HEADERS,
                        HeaderValue::from_static("Content-Type,Authorization"),
                    )),
            )
    }

    let allow_origin = state.args.cors_allow_origin.clone();
    Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(status_routes(&allow_origin))
        .nest("/v1", v1())
        .layer(
            TraceLayer::new_for_http()
                .on_request(request_counter)
                .on_response(record_response_metrics),
        )
        .with_state(state)
}

/// The ingestion service type
///
/// We use a [NormalizePath] to strip trailing slashes from request paths.
pub type Service = NormalizePath<Router>;

/// Returns a [crate::app::Service] for the ingestion service API.
///
/// # Arguments
///
/// * `state`: Shared application state
pub fn service(state: AppState) -> Service {
    NormalizePathLayer::trim_trailing_slash().layer(router(Arc::new(state)))
}

/// Accept an object-created event and process its uploads in the background.
async fn events(
    State(state): State<SharedAppState>,
    payload: Result<Json<TriggerEvent>, JsonRejection>,
) -> Result<(StatusCode, Json<Accepted>), IngestError> {
    let Json(event) = payload?;
    let uploads = Orchestrator::uploads(&event);
    let mut accepted = Vec::with_capacity(uploads.len());
    for upload in uploads {
        accepted.push(base_name(&upload.key).to_string());
        let orchestrator = state.orchestrator.clone();
        let event = TriggerEvent::for_object(&upload);
        tokio::spawn(async move {
            match orchestrator.run(event).await {
                Ok(outcome) => tracing::debug!(key = %upload.key, %outcome, "upload handled"),
                Err(err) => tracing::debug!(key = %upload.key, "upload not recorded: {}", err),
            }
        });
    }
    Ok((StatusCode::ACCEPTED, Json(Accepted { accepted })))
}

/// Look up the status of an upload.
///
/// A request without any query parameters is a health check.
async fn status(
    State(state): State<SharedAppState>,
    params: Result<Query<HashMap<String, String>>, axum::extract::rejection::QueryRejection>,
) -> Result<Response, IngestError> {
    let Query(params) = params?;
    if params.is_empty() {
        return Ok(Json(serde_json::json!({ "status": "ok" })).into_response());
    }
    let param = |name: &str| params.get(name).filter(|value| !value.is_empty());
    let (Some(user_id), Some(file_id)) = (param(USER_ID_PARAM), param(FILE_ID_PARAM)) else {
        return Err(IngestError::MissingQueryParameters);
    };
    match state.status.get(user_id, file_id).await? {
        Some(record) => Ok(Json(record).into_response()),
        None => Ok(Json(serde_json::json!({})).into_response()),
    }
}

async fn preflight() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "CORS preflight successful" }))
}

/// List the datasets published for a benchmark.
async fn datasets(
    State(state): State<SharedAppState>,
    Path(benchmark_id): Path<String>,
) -> Result<Json<Vec<String>>, IngestError> {
    let names = state.datasets.list_datasets(&benchmark_id).await?;
    Ok(Json(names.to_vec()))
}

/// Fetch series from a benchmark's datasets.
async fn query(
    State(state): State<SharedAppState>,
    Path(benchmark_id): Path<String>,
    ValidatedJson(request): ValidatedJson<QueryRequest>,
) -> Json<Vec<DatasetSeries>> {
    Json(state.datasets.fetch_datasets(&benchmark_id, &request).await)
}

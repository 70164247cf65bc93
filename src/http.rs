//! HTTP API
//!
//! Thin axum layer over the [`Datastore`]: routes decode JSON, enter the
//! synchronous engine through `spawn_blocking`, and translate errors to
//! status codes at the boundary.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value as JsonValue};

use crate::datastore::{DataPointSet, Datastore, QueryMetric};
use crate::error::{Result, TsdbError};

#[derive(Clone)]
struct ApiState {
    datastore: Arc<Datastore>,
    domain: String,
}

/// Build the API router
pub fn router(datastore: Arc<Datastore>, domain: String) -> Router {
    Router::new()
        .route("/api/v1/datapoints", post(add_datapoints))
        .route("/api/v1/datapoints/query", post(query_database))
        .route("/api/v1/datapoints/query/tags", post(query_metric_tags))
        .route("/api/v1/metricnames", get(get_metric_names))
        .route("/api/v1/tagnames", get(get_tag_names))
        .route("/api/v1/tagvalues", get(get_tag_values))
        .with_state(ApiState { datastore, domain })
}

fn error_response(e: &TsdbError) -> Response {
    let status =
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({ "errors": [e.to_string()] }))).into_response()
}

/// Run an engine call off the async runtime
async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TsdbError::Internal(format!("worker task failed: {}", e)))?
}

/// `POST /api/v1/datapoints` - record metric datapoints, 204 on success
async fn add_datapoints(State(state): State<ApiState>, Json(body): Json<JsonValue>) -> Response {
    let result = run_blocking(move || {
        for set in DataPointSet::from_json_object(&body)? {
            state.datastore.put_data_points(&state.domain, &set)?;
        }
        Ok(())
    })
    .await;
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

/// `POST /api/v1/datapoints/query` - values for a set of metric queries
async fn query_database(State(state): State<ApiState>, Json(body): Json<JsonValue>) -> Response {
    let result = run_blocking(move || {
        let now = state.datastore.schema().now();
        let mut queries = Vec::new();
        for query in QueryMetric::from_json_object(&body, now)? {
            queries.push(state.datastore.query_database(&state.domain, &query)?);
        }
        Ok(queries)
    })
    .await;
    match result {
        Ok(queries) => Json(json!({ "queries": queries })).into_response(),
        Err(e) => error_response(&e),
    }
}

/// `POST /api/v1/datapoints/query/tags` - tag information only, no values
async fn query_metric_tags(State(state): State<ApiState>, Json(body): Json<JsonValue>) -> Response {
    let result = run_blocking(move || {
        let now = state.datastore.schema().now();
        let mut results = Vec::new();
        for query in QueryMetric::from_json_object(&body, now)? {
            let tags = state.datastore.query_metric_tags(&state.domain, &query)?;
            results.push(json!({ "name": query.name, "tags": tags }));
        }
        Ok(results)
    })
    .await;
    match result {
        Ok(results) => Json(json!({ "results": results })).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn get_metric_names(State(state): State<ApiState>) -> Response {
    names_response(run_blocking(move || state.datastore.get_metric_names(&state.domain)).await)
}

async fn get_tag_names(State(state): State<ApiState>) -> Response {
    names_response(run_blocking(move || state.datastore.get_tag_names(&state.domain)).await)
}

async fn get_tag_values(State(state): State<ApiState>) -> Response {
    names_response(run_blocking(move || state.datastore.get_tag_values(&state.domain)).await)
}

fn names_response(result: Result<Vec<String>>) -> Response {
    match result {
        Ok(names) => Json(json!({ "results": names })).into_response(),
        Err(e) => error_response(&e),
    }
}

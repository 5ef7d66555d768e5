use axum::extract::{Query, State};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use crate::error::{Error, ErrorDetails};
use crate::gateway_util::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct TelemetryQuery {
    pub format: Option<String>,
}

/// Aggregate gateway metrics: Prometheus text exposition by default, or a
/// JSON rollup with `?format=json`. Returns 503 when the metrics recorder was
/// never installed.
pub async fn metrics_handler(
    State(app_state): AppState,
    Query(query): Query<TelemetryQuery>,
) -> Result<Response, Error> {
    let handle = app_state
        .metrics_handle
        .as_ref()
        .ok_or_else(|| Error::new(ErrorDetails::TelemetryUnavailable))?;

    if query.format.as_deref() == Some("json") {
        return Ok(Json(app_state.metrics.snapshot()).into_response());
    }

    Ok(handle.render().into_response())
}

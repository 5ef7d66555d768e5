use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Json;
use serde_json::{json, Value};

use crate::auth::USER_ID_HEADER;
use crate::error::{Error, ErrorDetails};
use crate::gateway_util::AppState;
use crate::usage::next_utc_midnight;

/// Read-only view of the caller's usage summary. No usage side effects.
pub async fn usage_summary_handler(
    State(app_state): AppState,
    headers: HeaderMap,
) -> Result<Json<Value>, Error> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            Error::new(ErrorDetails::Unauthenticated {
                message: "No resolvable user for this request".to_string(),
            })
        })?;

    let daily_limit = app_state.quota.daily_limit();
    let summary = app_state
        .usage_store
        .read_summary(user_id, daily_limit)
        .await?;

    Ok(Json(match summary {
        Some(summary) => json!({
            "user_id": summary.user_id,
            "daily": {
                "date": summary.daily.date,
                "requests": summary.daily.requests,
                "cost": summary.daily.cost,
            },
            "weekly_requests": summary.weekly_requests,
            "monthly_requests": summary.monthly_requests,
            "total_requests": summary.total_requests,
            "total_cost": summary.total_cost,
            "daily_limit": summary.daily_limit,
            "remaining_requests": summary.remaining_requests(),
            "next_reset": summary.next_reset.to_rfc3339(),
            "limit_exceeded": summary.limit_exceeded,
        }),
        None => json!({
            "user_id": user_id,
            "daily": { "requests": 0, "cost": 0.0 },
            "total_requests": 0,
            "total_cost": 0.0,
            "daily_limit": daily_limit,
            "remaining_requests": daily_limit,
            "next_reset": next_utc_midnight().to_rfc3339(),
            "limit_exceeded": false,
        }),
    }))
}

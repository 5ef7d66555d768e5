use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};
use std::time::Instant;
use tokio::time::Duration;

use crate::auth::USER_ID_HEADER;
use crate::error::{Error, ErrorDetails};
use crate::gateway_util::{AppState, AppStateData};
use crate::insight::{fallback_insight, template_insight, QuickInsightParams};
use crate::usage::{next_utc_midnight, InsightMethod, NewUsage, QuotaDecision};

pub const QUICK_INSIGHT_ENDPOINT: &str = "quick-insight";

/// Client metadata captured into every usage record.
#[derive(Debug, Clone)]
struct ClientMeta {
    user_agent: Option<String>,
    forwarded_for: Option<String>,
    request_id: Option<String>,
}

fn client_meta(headers: &HeaderMap) -> ClientMeta {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };
    ClientMeta {
        user_agent: header_value("user-agent"),
        forwarded_for: header_value("x-forwarded-for"),
        request_id: header_value("x-request-id"),
    }
}

fn resolve_user(headers: &HeaderMap) -> Result<String, Error> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            Error::new(ErrorDetails::Unauthenticated {
                message: "No resolvable user for this request".to_string(),
            })
        })
}

struct Tracking<'a> {
    app_state: &'a AppStateData,
    user_id: &'a str,
    meta: ClientMeta,
    started: Instant,
}

impl Tracking<'_> {
    fn new_usage(
        &self,
        success: bool,
        method: InsightMethod,
        cache_hit: bool,
        input_tokens: u32,
        output_tokens: u32,
        error_message: Option<String>,
    ) -> NewUsage {
        NewUsage {
            user_id: self.user_id.to_string(),
            endpoint: QUICK_INSIGHT_ENDPOINT.to_string(),
            input_tokens,
            output_tokens,
            duration_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            success,
            error_message,
            cache_hit,
            method,
            user_agent: self.meta.user_agent.clone(),
            forwarded_for: self.meta.forwarded_for.clone(),
            request_id: self.meta.request_id.clone(),
        }
    }

    async fn track_failure(&self, method: InsightMethod, error_message: String) {
        self.app_state
            .tracker
            .record_best_effort(self.new_usage(false, method, false, 0, 0, Some(error_message)))
            .await;
    }

    async fn track_success(
        &self,
        method: InsightMethod,
        cache_hit: bool,
        input_tokens: u32,
        output_tokens: u32,
    ) {
        self.app_state
            .tracker
            .record_best_effort(self.new_usage(
                true,
                method,
                cache_hit,
                input_tokens,
                output_tokens,
                None,
            ))
            .await;
    }
}

/// Current usage snapshot included in successful responses. Best-effort: a
/// store failure here degrades to the full budget rather than failing the
/// response.
async fn usage_view(app_state: &AppStateData, user_id: &str) -> Value {
    let daily_limit = app_state.quota.daily_limit();
    let summary = app_state
        .usage_store
        .read_summary(user_id, daily_limit)
        .await
        .ok()
        .flatten();
    match summary {
        Some(summary) => json!({
            "daily_requests": summary.daily.requests,
            "daily_limit": summary.daily_limit,
            "remaining_requests": summary.remaining_requests(),
            "next_reset": summary.next_reset.to_rfc3339(),
        }),
        None => json!({
            "daily_requests": 0,
            "daily_limit": daily_limit,
            "remaining_requests": daily_limit,
            "next_reset": next_utc_midnight().to_rfc3339(),
        }),
    }
}

async fn success_response(
    app_state: &AppStateData,
    user_id: &str,
    insight: String,
    cached: bool,
    cost: f64,
    method: InsightMethod,
) -> Response {
    let usage = usage_view(app_state, user_id).await;
    Json(json!({
        "success": true,
        "insight": insight,
        "cached": cached,
        "cost": cost,
        "method": method.as_str(),
        "usage": usage,
    }))
    .into_response()
}

/// The quick-insight protocol. Every exit path after identity resolution
/// writes a usage record before responding:
/// `START -> VALIDATE -> LIMIT_CHECK -> {CACHE | TEMPLATE | FALLBACK | AI} -> TRACK -> RESPOND`.
pub async fn quick_insight_handler(
    State(app_state): AppState,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Error> {
    // Authentication failures are not tracked: there is no user to attribute
    // the record to.
    let user_id = resolve_user(&headers)?;
    let tracking = Tracking {
        app_state: &app_state,
        user_id: &user_id,
        meta: client_meta(&headers),
        started: Instant::now(),
    };

    // Validate the request body
    let params: QuickInsightParams = match serde_json::from_slice(&body) {
        Ok(params) => params,
        Err(e) => {
            let message = format!("Invalid request body: {e}");
            tracking
                .track_failure(InsightMethod::None, message.clone())
                .await;
            return Err(Error::new(ErrorDetails::InvalidRequest { message }));
        }
    };
    if let Err(message) = params.validate() {
        tracking
            .track_failure(InsightMethod::None, message.clone())
            .await;
        return Err(Error::new(ErrorDetails::InvalidRequest { message }));
    }

    // Quota check
    match app_state.quota.check_usage_limits(&user_id).await {
        QuotaDecision::Deny {
            reason,
            reset_time,
            remaining_requests,
        } => {
            tracking
                .track_failure(InsightMethod::None, "Rate limited".to_string())
                .await;
            return Err(Error::new(ErrorDetails::QuotaExceeded {
                reason,
                reset_time,
                remaining_requests,
            }));
        }
        QuotaDecision::Allow { .. } => {}
    }

    // Cache lookup: reuse a previously computed insight at zero token cost
    if let Some(hit) = app_state.insight_cache.get(&params).await {
        app_state.metrics.record_cache_hit();
        tracking.track_success(hit.method, true, 0, 0).await;
        return Ok(success_response(&app_state, &user_id, hit.insight, true, 0.0, hit.method).await);
    }

    // Deterministic template, no AI call
    if let Some(insight) = template_insight(&params) {
        app_state.metrics.record_template_hit();
        app_state
            .insight_cache
            .insert(&params, insight.clone(), InsightMethod::Template)
            .await;
        tracking
            .track_success(InsightMethod::Template, false, 0, 0)
            .await;
        return Ok(success_response(
            &app_state,
            &user_id,
            insight,
            false,
            0.0,
            InsightMethod::Template,
        )
        .await);
    }

    // Generic fallback when the AI backend is switched off
    let coach = match (app_state.config.ai.enabled, app_state.coach.as_ref()) {
        (true, Some(coach)) => coach,
        _ => {
            let insight = fallback_insight(&params);
            app_state.metrics.record_fallback();
            tracking
                .track_success(InsightMethod::Fallback, false, 0, 0)
                .await;
            return Ok(success_response(
                &app_state,
                &user_id,
                insight,
                false,
                0.0,
                InsightMethod::Fallback,
            )
            .await);
        }
    };

    // AI call
    app_state.metrics.record_ai_call();
    let timeout = Duration::from_millis(app_state.config.ai.timeout_ms);
    match coach.generate_insight(&params, timeout).await {
        Ok((insight, usage)) => {
            let cost =
                app_state
                    .config
                    .ai
                    .cost_for(coach.model(), usage.input_tokens, usage.output_tokens);
            app_state
                .insight_cache
                .insert(&params, insight.clone(), InsightMethod::Ai)
                .await;
            tracking
                .track_success(
                    InsightMethod::Ai,
                    false,
                    usage.input_tokens,
                    usage.output_tokens,
                )
                .await;
            Ok(
                success_response(&app_state, &user_id, insight, false, cost, InsightMethod::Ai)
                    .await,
            )
        }
        Err(e) => {
            app_state.metrics.record_ai_failure();
            // Token accounting for the failed attempt is unknown here, so the
            // record carries zero tokens plus the provider error.
            tracking
                .track_failure(InsightMethod::Ai, e.to_string())
                .await;
            Err(e)
        }
    }
}

/// Static capability metadata for the quick-insight endpoint. No usage side
/// effects.
pub async fn quick_insight_info_handler(State(app_state): AppState) -> Json<Value> {
    Json(json!({
        "endpoint": QUICK_INSIGHT_ENDPOINT,
        "model": app_state.config.ai.model,
        "ai_enabled": app_state.config.ai.enabled,
        "daily_limit": app_state.quota.daily_limit(),
        "features": [
            "insight_cache",
            "template_insights",
            "usage_tracking",
            "daily_quota",
        ],
    }))
}

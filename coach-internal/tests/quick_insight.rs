use axum::body::{to_bytes, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use serde_json::{json, Value};
use std::sync::Arc;

use coach_internal::auth::USER_ID_HEADER;
use coach_internal::config_parser::Config;
use coach_internal::endpoints::insight::{quick_insight_handler, quick_insight_info_handler};
use coach_internal::endpoints::usage::usage_summary_handler;
use coach_internal::gateway_util::AppStateData;

const AI_DISABLED_CONFIG: &str = r#"
[ai]
enabled = false
"#;

fn state_with(config: &str) -> AppStateData {
    AppStateData::new_with_mock_store(Arc::new(Config::load_from_str(config).unwrap()))
}

fn user_headers(user_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_ID_HEADER, HeaderValue::from_str(user_id).unwrap());
    headers.insert("user-agent", HeaderValue::from_static("coach-tests/1.0"));
    headers
}

async fn call_quick_insight(
    state: &AppStateData,
    headers: HeaderMap,
    body: Value,
) -> (StatusCode, Value) {
    let response = quick_insight_handler(
        State(state.clone()),
        headers,
        Bytes::from(body.to_string()),
    )
    .await
    .into_response();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn mock_records(state: &AppStateData) -> Vec<coach_internal::usage::UsageRecord> {
    state.usage_store.as_mock().unwrap().records()
}

#[tokio::test]
async fn test_missing_identity_is_401_and_untracked() {
    let state = state_with(AI_DISABLED_CONFIG);
    let (status, body) =
        call_quick_insight(&state, HeaderMap::new(), json!({"habit_name": "Run"})).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"]["message"].as_str().is_some());
    // Nothing to attribute the record to, so nothing is written
    assert!(mock_records(&state).is_empty());
}

#[tokio::test]
async fn test_validation_failure_writes_one_failed_zero_token_record() {
    let state = state_with(AI_DISABLED_CONFIG);
    let (status, body) = call_quick_insight(
        &state,
        user_headers("user_1"),
        json!({"streak": 3, "completion_rate": 60.0}),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("Invalid request body"));

    let records = mock_records(&state);
    assert_eq!(records.len(), 1);
    assert!(!records[0].success);
    assert_eq!(records[0].input_tokens, 0);
    assert_eq!(records[0].output_tokens, 0);
    assert!(records[0].error_message.is_some());
}

#[tokio::test]
async fn test_out_of_range_completion_rate_is_rejected() {
    let state = state_with(AI_DISABLED_CONFIG);
    let (status, _) = call_quick_insight(
        &state,
        user_headers("user_1"),
        json!({"habit_name": "Run", "streak": 3, "completion_rate": 140.0}),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(mock_records(&state).len(), 1);
}

#[tokio::test]
async fn test_rate_limited_request_gets_429_with_reset_fields() {
    let state = state_with(
        r#"
[quota]
daily_limit = 1

[ai]
enabled = false
"#,
    );
    let body = json!({"habit_name": "Run", "streak": 0, "completion_rate": 60.0});

    let (status, _) = call_quick_insight(&state, user_headers("user_1"), body.clone()).await;
    assert_eq!(status, StatusCode::OK);

    let (status, response) = call_quick_insight(&state, user_headers("user_1"), body).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(response["reset_time"].as_str().is_some());
    assert_eq!(response["remaining_requests"].as_u64(), Some(0));

    let records = mock_records(&state);
    assert_eq!(records.len(), 2);
    assert!(records[0].success);
    assert!(!records[1].success);
    assert_eq!(records[1].error_message.as_deref(), Some("Rate limited"));
}

#[tokio::test]
async fn test_identical_request_within_ttl_is_served_from_cache() {
    let state = state_with(AI_DISABLED_CONFIG);
    // streak 8 matches the one-week template, which is then cached
    let body = json!({"habit_name": "Morning run", "streak": 8, "completion_rate": 60.0});

    let (status, first) = call_quick_insight(&state, user_headers("user_1"), body.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["cached"], json!(false));
    assert_eq!(first["method"], json!("template"));
    assert_eq!(first["cost"], json!(0.0));

    let (status, second) = call_quick_insight(&state, user_headers("user_1"), body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["cached"], json!(true));
    assert_eq!(second["cost"], json!(0.0));
    assert_eq!(second["insight"], first["insight"]);

    let records = mock_records(&state);
    assert_eq!(records.len(), 2);
    assert!(!records[0].cache_hit);
    assert!(records[1].cache_hit);
}

#[tokio::test]
async fn test_ai_disabled_serves_fallback_at_zero_cost() {
    let state = state_with(AI_DISABLED_CONFIG);
    // Mid streak, mid completion: no template rule applies
    let (status, body) = call_quick_insight(
        &state,
        user_headers("user_1"),
        json!({"habit_name": "Stretching", "streak": 3, "completion_rate": 60.0}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["method"], json!("fallback"));
    assert_eq!(body["cost"], json!(0.0));
    assert!(body["insight"].as_str().unwrap().contains("Stretching"));
}

#[tokio::test]
async fn test_success_response_reports_bounded_remaining_requests() {
    let state = state_with(AI_DISABLED_CONFIG);
    let daily_limit = state.quota.daily_limit() as u64;

    for expected_used in 1..=3u64 {
        let (status, body) = call_quick_insight(
            &state,
            user_headers("user_1"),
            json!({"habit_name": "Run", "streak": 0, "completion_rate": 60.0}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let usage = &body["usage"];
        let remaining = usage["remaining_requests"].as_u64().unwrap();
        assert!(remaining <= daily_limit);
        assert_eq!(usage["daily_requests"].as_u64(), Some(expected_used));
        assert_eq!(remaining, daily_limit - expected_used);
        assert!(usage["next_reset"].as_str().is_some());
    }
}

#[tokio::test]
async fn test_info_endpoint_has_no_usage_side_effects() {
    let state = state_with(AI_DISABLED_CONFIG);
    let response = quick_insight_info_handler(State(state.clone())).await;
    let body = response.0;

    assert_eq!(body["daily_limit"].as_u64(), Some(10));
    assert!(body["model"].as_str().is_some());
    assert!(body["features"].as_array().is_some());
    assert!(mock_records(&state).is_empty());
}

#[tokio::test]
async fn test_usage_summary_endpoint_reflects_tracked_calls() {
    let state = state_with(AI_DISABLED_CONFIG);
    call_quick_insight(
        &state,
        user_headers("user_1"),
        json!({"habit_name": "Run", "streak": 0, "completion_rate": 60.0}),
    )
    .await;

    let response = usage_summary_handler(State(state.clone()), user_headers("user_1"))
        .await
        .into_response();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["daily"]["requests"].as_u64(), Some(1));
    assert_eq!(body["total_requests"].as_u64(), Some(1));

    // Reading the summary writes nothing
    assert_eq!(mock_records(&state).len(), 1);

    let response = usage_summary_handler(State(state), HeaderMap::new())
        .await
        .into_response();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_fail_open_keeps_serving_when_store_is_down() {
    let state = state_with(AI_DISABLED_CONFIG);
    state.usage_store.as_mock().unwrap().set_healthy(false);

    let (status, body) = call_quick_insight(
        &state,
        user_headers("user_1"),
        json!({"habit_name": "Run", "streak": 0, "completion_rate": 60.0}),
    )
    .await;

    // Limit check fails open and the tracking write failure is swallowed
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
}

#[tokio::test]
async fn test_fail_closed_denies_when_store_is_down() {
    let state = state_with(
        r#"
[quota]
fail_policy = "fail_closed"

[ai]
enabled = false
"#,
    );
    state.usage_store.as_mock().unwrap().set_healthy(false);

    let (status, _) = call_quick_insight(
        &state,
        user_headers("user_1"),
        json!({"habit_name": "Run", "streak": 0, "completion_rate": 60.0}),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

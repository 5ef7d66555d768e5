use axum::response::Json;
use serde_json::{json, Value};

pub const COACH_GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");

pub async fn status_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": COACH_GATEWAY_VERSION,
    }))
}

pub async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

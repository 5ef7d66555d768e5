use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

pub async fn handle_404(uri: Uri) -> Response {
    let body = json!({
        "error": {
            "message": format!("No route for {uri}"),
            "type": "not_found",
            "code": StatusCode::NOT_FOUND.as_u16(),
        }
    });
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

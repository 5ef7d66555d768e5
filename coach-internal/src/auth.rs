use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config_parser::AuthConfig;

/// Request header carrying the resolved user identity. Set by the auth
/// middleware after key validation; handlers trust it (spoofed values are
/// stripped before validation).
pub const USER_ID_HEADER: &str = "x-coach-user-id";

// Hash API key using SHA256 with a "coach-" prefix so raw keys never sit in
// config files or memory maps.
pub fn hash_api_key(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"coach-");
    hasher.update(api_key.as_bytes());
    format!("{:x}", hasher.finalize())
}

// Common error response helper
fn auth_error_response(status: StatusCode, message: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "message": message,
            "type": "authentication_error",
            "code": status.as_u16()
        }
    });
    (status, axum::Json(body)).into_response()
}

#[derive(Clone)]
pub struct Auth {
    // Hashed API key -> user id
    api_keys: Arc<RwLock<HashMap<String, String>>>,
}

impl Auth {
    pub fn new(api_keys: HashMap<String, String>) -> Self {
        Self {
            api_keys: Arc::new(RwLock::new(api_keys)),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.keys.clone())
    }

    /// Register a key by its plaintext value. Used by tests and key rotation.
    pub fn insert_key(&self, api_key: &str, user_id: &str) {
        // In practice, a poisoned RwLock indicates a panic in another thread while holding the lock.
        // This is a catastrophic failure that should not be recovered from.
        #[expect(clippy::expect_used)]
        let mut api_keys = self.api_keys.write().expect("RwLock poisoned");
        api_keys.insert(hash_api_key(api_key), user_id.to_string());
    }

    pub fn delete_key(&self, api_key: &str) {
        #[expect(clippy::expect_used)]
        let mut api_keys = self.api_keys.write().expect("RwLock poisoned");
        api_keys.remove(&hash_api_key(api_key));
    }

    /// Resolve the user behind a presented API key, or None if unknown.
    pub fn resolve_user(&self, api_key: &str) -> Option<String> {
        let hashed_key = hash_api_key(api_key);
        #[expect(clippy::expect_used)]
        let api_keys = self.api_keys.read().expect("RwLock poisoned");
        api_keys.get(&hashed_key).cloned()
    }
}

pub async fn require_api_key(
    State(auth): State<Auth>,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    let (mut parts, body) = request.into_parts();
    let bytes = to_bytes(body, 1024 * 1024).await.unwrap_or_default();

    // Never trust an identity header supplied by the client.
    parts.headers.remove(USER_ID_HEADER);

    let key = parts
        .headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let key = match key {
        Some(key) => {
            // Strip "Bearer " prefix if present
            let key = key.trim();
            key.strip_prefix("Bearer ").unwrap_or(key).to_string()
        }
        None => {
            return Err(auth_error_response(
                StatusCode::UNAUTHORIZED,
                "Missing authorization header",
            ))
        }
    };

    let user_id = match auth.resolve_user(&key) {
        Some(user_id) => user_id,
        None => {
            return Err(auth_error_response(
                StatusCode::UNAUTHORIZED,
                "Invalid API key",
            ))
        }
    };

    let mut request = Request::from_parts(parts, Body::from(bytes));
    match HeaderValue::from_str(&user_id) {
        Ok(value) => {
            request.headers_mut().insert(USER_ID_HEADER, value);
        }
        Err(_) => {
            return Err(auth_error_response(
                StatusCode::UNAUTHORIZED,
                "Invalid user identifier for API key",
            ))
        }
    }

    Ok(next.run(request).await)
}

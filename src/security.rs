use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc};
use tracing::{info, warn};

/// Keys allowed to call the write surface.
#[derive(Clone, Default)]
pub struct AdminState {
    records: Arc<HashMap<String, AdminContext>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdminContext {
    pub admin: String,
    pub api_key_id: String,
}

impl AdminState {
    pub fn from_env() -> Self {
        Self::from_entries(&env::var("ADMIN_API_KEYS").unwrap_or_default())
    }

    /// Parses comma-separated `name:key` entries.
    pub fn from_entries(raw: &str) -> Self {
        Self {
            records: Arc::new(parse_keys(raw)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn authenticate(&self, presented: &str) -> Option<AdminContext> {
        self.records.get(presented).cloned()
    }
}

pub async fn require_admin(
    State(state): State<AdminState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    if state.is_empty() {
        return Ok(unauthorized_response(
            "admin_disabled",
            "No admin keys are configured",
        ));
    }
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(unauthorized_response(
            "missing_api_key",
            "Provide X-Admin-Key or Bearer token",
        ));
    };
    let Some(context) = state.authenticate(&presented) else {
        return Ok(unauthorized_response("invalid_api_key", "Key not recognized"));
    };
    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get("X-Admin-Key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

fn parse_keys(raw: &str) -> HashMap<String, AdminContext> {
    let mut entries = HashMap::new();
    for (idx, token) in raw.split(',').enumerate() {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(2, ':');
        let admin = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let key = parts.next().map(str::trim).filter(|s| !s.is_empty());
        match (admin, key) {
            (Some(admin), Some(secret)) => {
                entries.insert(
                    secret.to_string(),
                    AdminContext {
                        admin: admin.to_string(),
                        api_key_id: format!("key-{:02}", idx + 1),
                    },
                );
            }
            _ => warn!(
                target = "emlak.api",
                "ignored malformed ADMIN_API_KEYS entry at position {}",
                idx + 1
            ),
        }
    }

    if entries.is_empty() {
        warn!(
            target = "emlak.api",
            "ADMIN_API_KEYS produced no keys; write endpoints are disabled"
        );
    } else {
        info!(
            target = "emlak.api",
            key_count = entries.len(),
            "loaded admin keys"
        );
    }
    entries
}

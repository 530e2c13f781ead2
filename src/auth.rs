use axum::http::{header::AUTHORIZATION, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::{
    error::{AppError, AppResult},
    state::AppState,
};

const SUPABASE_AUDIENCE: &str = "authenticated";

#[derive(Debug, Clone, Deserialize)]
pub struct SupabaseUser {
    pub id: String,
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccessClaims {
    sub: String,
    email: Option<String>,
}

/// Resolves the calling user id. The id is handed explicitly to every
/// downstream call; nothing reads the session from ambient state.
pub async fn require_user_id(state: &AppState, headers: &HeaderMap) -> AppResult<String> {
    if let Some(user_id) = dev_override_user_id(
        state.config.auth_dev_overrides_enabled(),
        state.config.default_user_id.as_deref(),
        headers,
    ) {
        return Ok(user_id);
    }
    let user = require_supabase_user(state, headers).await?;
    tracing::debug!(user_id = %user.id, email = ?user.email, "Authenticated request");
    Ok(user.id)
}

pub async fn require_supabase_user(state: &AppState, headers: &HeaderMap) -> AppResult<SupabaseUser> {
    let token = bearer_token(headers)
        .ok_or_else(|| AppError::Unauthorized("Unauthorized: missing bearer token.".to_string()))?;

    if let Some(secret) = state.config.supabase_jwt_secret.as_deref() {
        return decode_access_token(token, secret);
    }
    fetch_supabase_user(state, token).await
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = raw.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim()).filter(|value| !value.is_empty())
}

fn dev_override_user_id(
    enabled: bool,
    default_user_id: Option<&str>,
    headers: &HeaderMap,
) -> Option<String> {
    if !enabled {
        return None;
    }
    headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .or(default_user_id)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

fn decode_access_token(token: &str, secret: &str) -> AppResult<SupabaseUser> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&[SUPABASE_AUDIENCE]);

    let data = decode::<AccessClaims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map_err(|error| {
            tracing::debug!(error = %error, "Rejected access token");
            AppError::Unauthorized("Unauthorized: invalid or expired token.".to_string())
        })?;

    Ok(SupabaseUser {
        id: data.claims.sub,
        email: data.claims.email,
    })
}

async fn fetch_supabase_user(state: &AppState, token: &str) -> AppResult<SupabaseUser> {
    let (Some(base_url), Some(service_key)) = (
        state.config.supabase_url.as_deref(),
        state.config.supabase_service_role_key.as_deref(),
    ) else {
        return Err(AppError::Dependency(
            "Auth is not configured. Set SUPABASE_JWT_SECRET or SUPABASE_URL.".to_string(),
        ));
    };

    let response = state
        .http_client
        .get(format!("{}/auth/v1/user", base_url.trim_end_matches('/')))
        .header("apikey", service_key)
        .bearer_auth(token)
        .send()
        .await
        .map_err(|error| AppError::Dependency(format!("Auth request failed: {error}")))?;

    if !response.status().is_success() {
        return Err(AppError::Unauthorized(
            "Unauthorized: invalid or expired token.".to_string(),
        ));
    }
    response
        .json::<SupabaseUser>()
        .await
        .map_err(|error| AppError::Dependency(format!("Auth response was malformed: {error}")))
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, HeaderValue};
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    use super::{bearer_token, decode_access_token, dev_override_user_id};

    fn headers_with(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).expect("header"));
        headers
    }

    #[test]
    fn extracts_bearer_tokens() {
        let headers = headers_with("authorization", "Bearer abc.def");
        assert_eq!(bearer_token(&headers), Some("abc.def"));
        let headers = headers_with("authorization", "bearer   abc ");
        assert_eq!(bearer_token(&headers), Some("abc"));
        let headers = headers_with("authorization", "Basic abc");
        assert_eq!(bearer_token(&headers), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn dev_override_only_when_enabled() {
        let headers = headers_with("x-user-id", "user-7");
        assert_eq!(dev_override_user_id(false, Some("user-1"), &headers), None);
        assert_eq!(
            dev_override_user_id(true, Some("user-1"), &headers).as_deref(),
            Some("user-7")
        );
        assert_eq!(
            dev_override_user_id(true, Some("user-1"), &HeaderMap::new()).as_deref(),
            Some("user-1")
        );
        assert_eq!(dev_override_user_id(true, None, &HeaderMap::new()), None);
    }

    #[test]
    fn decodes_signed_tokens_and_rejects_bad_signatures() {
        let claims = json!({
            "sub": "550e8400-e29b-41d4-a716-446655440000",
            "email": "owner@example.com",
            "aud": "authenticated",
            "exp": Utc::now().timestamp() + 3600,
        });
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .expect("token");

        let user = decode_access_token(&token, "test-secret").expect("valid token");
        assert_eq!(user.id, "550e8400-e29b-41d4-a716-446655440000");
        assert_eq!(user.email.as_deref(), Some("owner@example.com"));

        assert!(decode_access_token(&token, "other-secret").is_err());
    }
}

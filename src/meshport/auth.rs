use std::{
    sync::OnceLock,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use axum::{
    extract::Request,
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

const TOKEN_TTL: Duration = Duration::from_secs(72 * 3600);

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: u64,
}

// Minted per process, so issued tokens die with it.
fn signing_secret() -> &'static [u8] {
    static SECRET: OnceLock<String> = OnceLock::new();
    SECRET
        .get_or_init(|| uuid::Uuid::new_v4().to_string())
        .as_bytes()
}

pub fn generate_token(username: &str) -> Result<String, jsonwebtoken::errors::Error> {
    let exp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .saturating_add(TOKEN_TTL)
        .as_secs();
    encode(
        &Header::default(),
        &Claims {
            sub: username.to_string(),
            exp,
        },
        &EncodingKey::from_secret(signing_secret()),
    )
}

pub fn validate_token(token: &str) -> bool {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(signing_secret()),
        &Validation::default(),
    )
    .is_ok()
}

/// Guard for the authenticated API group. Accepts the token raw or with a
/// `Bearer ` prefix.
pub async fn require_token(req: Request, next: Next) -> Response {
    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v))
        .map(validate_token)
        .unwrap_or(false);

    if !authorized {
        return (StatusCode::UNAUTHORIZED, "invalid API token").into_response();
    }
    next.run(req).await
}

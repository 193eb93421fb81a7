//! Bearer tokens and password digests.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use shared::{
    domain::UserId,
    error::{ApiError, ErrorCode},
};

const SUBJECT_PREFIX: &str = "user:";

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
    pub ttl_seconds: i64,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret", &"<redacted>")
            .field("ttl_seconds", &self.ttl_seconds)
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
}

pub fn issue_token(config: &AuthConfig, user_id: UserId) -> Result<String, ApiError> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: format!("{SUBJECT_PREFIX}{}", user_id.0),
        iat: now,
        exp: now + config.ttl_seconds,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(config.secret.as_bytes()),
    )
    .map_err(|e| ApiError::new(ErrorCode::Internal, format!("token encode failed: {e}")))
}

/// Resolves a bearer token to the user it was issued for. Expired, tampered
/// and malformed tokens all map to `Unauthorized`.
pub fn verify_token(config: &AuthConfig, token: &str) -> Result<UserId, ApiError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.secret.as_bytes()),
        &validation,
    )
    .map_err(|_| ApiError::unauthorized("invalid or expired token"))?;

    data.claims
        .sub
        .strip_prefix(SUBJECT_PREFIX)
        .and_then(|raw| raw.parse::<i64>().ok())
        .map(UserId)
        .ok_or_else(|| ApiError::unauthorized("invalid token subject"))
}

pub fn new_salt() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn digest_password(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn verify_password(password: &str, salt: &str, expected_digest: &str) -> bool {
    digest_password(password, salt) == expected_digest
}

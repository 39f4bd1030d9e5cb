use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::AnyPool;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::db::{self, DbKind, RefreshTokenRecord, UserRecord};
use crate::errors::{ApiError, ApiResult};
use crate::types::TokenPair;

#[derive(Debug, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    #[serde(rename = "type")]
    pub token_type: String,
    pub iat: i64,
    pub exp: i64,
}

fn jwt_algorithm(cfg: &AuthConfig) -> Algorithm {
    match cfg.jwt_algorithm.as_str() {
        "HS384" => Algorithm::HS384,
        "HS512" => Algorithm::HS512,
        _ => Algorithm::HS256,
    }
}

pub fn hash_password(password: &str) -> ApiResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| {
            warn!("password hashing failed: {err}");
            ApiError::internal()
        })?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, password_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(password_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

pub fn create_access_token(cfg: &AuthConfig, subject: &str) -> ApiResult<String> {
    let now = Utc::now();
    let claims = AccessClaims {
        sub: subject.to_string(),
        token_type: "access".to_string(),
        iat: now.timestamp(),
        exp: (now + Duration::minutes(cfg.access_token_expire_minutes)).timestamp(),
    };
    encode(
        &Header::new(jwt_algorithm(cfg)),
        &claims,
        &EncodingKey::from_secret(cfg.secret_key.as_bytes()),
    )
    .map_err(|err| {
        warn!("access token encoding failed: {err}");
        ApiError::internal()
    })
}

pub fn decode_access_token(cfg: &AuthConfig, token: &str) -> ApiResult<AccessClaims> {
    let data = decode::<AccessClaims>(
        token,
        &DecodingKey::from_secret(cfg.secret_key.as_bytes()),
        &Validation::new(jwt_algorithm(cfg)),
    )
    .map_err(|_| ApiError::invalid_token())?;

    if data.claims.token_type != "access" {
        return Err(ApiError::new(
            axum::http::StatusCode::UNAUTHORIZED,
            "invalid_token",
            "Invalid token type",
        ));
    }
    Ok(data.claims)
}

pub fn generate_refresh_token() -> String {
    let mut bytes = [0u8; 48];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn hash_token(raw_token: &str) -> String {
    hex::encode(Sha256::digest(raw_token.as_bytes()))
}

fn is_active(token: &RefreshTokenRecord, now: DateTime<Utc>) -> bool {
    token.revoked_at.is_none() && token.expires_at > now
}

fn new_refresh_token_record(cfg: &AuthConfig, user_id: &str, raw_token: &str) -> RefreshTokenRecord {
    let now = Utc::now();
    RefreshTokenRecord {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        token_hash: hash_token(raw_token),
        issued_at: now,
        expires_at: now + Duration::days(cfg.refresh_token_expire_days),
        revoked_at: None,
        replaced_by_token_id: None,
    }
}

fn token_pair(cfg: &AuthConfig, access_token: String, refresh_token: String) -> TokenPair {
    TokenPair {
        access_token,
        refresh_token,
        token_type: "bearer".to_string(),
        expires_in: cfg.access_token_expire_minutes * 60,
    }
}

pub async fn register_user(
    pool: &AnyPool,
    kind: DbKind,
    cfg: &AuthConfig,
    username: &str,
    display_name: Option<&str>,
    password: &str,
) -> ApiResult<(UserRecord, TokenPair)> {
    if db::get_user_by_username(pool, kind, username).await?.is_some() {
        return Err(ApiError::username_taken());
    }

    let now = Utc::now();
    let user = UserRecord {
        id: Uuid::new_v4().to_string(),
        username: username.to_string(),
        display_name: display_name.unwrap_or(username).to_string(),
        password_hash: hash_password(password)?,
        created_at: now,
        updated_at: now,
    };

    let raw_refresh = generate_refresh_token();
    let refresh_record = new_refresh_token_record(cfg, &user.id, &raw_refresh);

    let mut tx = pool.begin().await.map_err(ApiError::from)?;
    if let Err(err) = db::insert_user(&mut tx, kind, &user).await {
        // Concurrent register racing the lookup above.
        if err
            .downcast_ref::<sqlx::Error>()
            .map(db::is_unique_violation)
            .unwrap_or(false)
        {
            return Err(ApiError::username_taken());
        }
        return Err(err.into());
    }
    db::insert_refresh_token(&mut tx, kind, &refresh_record).await?;
    tx.commit().await.map_err(ApiError::from)?;

    info!("user registered user_id={} username={}", user.id, user.username);
    let access = create_access_token(cfg, &user.id)?;
    Ok((user, token_pair(cfg, access, raw_refresh)))
}

pub async fn authenticate_user(
    pool: &AnyPool,
    kind: DbKind,
    cfg: &AuthConfig,
    username: &str,
    password: &str,
) -> ApiResult<(UserRecord, TokenPair)> {
    let user = db::get_user_by_username(pool, kind, username).await?;
    let Some(user) = user else {
        return Err(ApiError::invalid_credentials());
    };
    if !verify_password(password, &user.password_hash) {
        warn!("login failed username={username}");
        return Err(ApiError::invalid_credentials());
    }

    let raw_refresh = generate_refresh_token();
    let refresh_record = new_refresh_token_record(cfg, &user.id, &raw_refresh);
    let mut tx = pool.begin().await.map_err(ApiError::from)?;
    db::insert_refresh_token(&mut tx, kind, &refresh_record).await?;
    tx.commit().await.map_err(ApiError::from)?;

    info!("user authenticated user_id={}", user.id);
    let access = create_access_token(cfg, &user.id)?;
    Ok((user, token_pair(cfg, access, raw_refresh)))
}

pub async fn rotate_refresh_token(
    pool: &AnyPool,
    kind: DbKind,
    cfg: &AuthConfig,
    refresh_token_raw: &str,
) -> ApiResult<(UserRecord, TokenPair)> {
    let now = Utc::now();
    let current = db::find_refresh_token_by_hash(pool, kind, &hash_token(refresh_token_raw)).await?;
    let Some(current) = current else {
        return Err(ApiError::invalid_refresh_token());
    };
    if !is_active(&current, now) {
        return Err(ApiError::invalid_refresh_token());
    }

    let user = db::get_user(pool, kind, &current.user_id).await?;
    let Some(user) = user else {
        return Err(ApiError::invalid_refresh_token());
    };

    let raw_refresh = generate_refresh_token();
    let new_record = new_refresh_token_record(cfg, &user.id, &raw_refresh);

    let mut tx = pool.begin().await.map_err(ApiError::from)?;
    db::insert_refresh_token(&mut tx, kind, &new_record).await?;
    db::mark_refresh_token_revoked(&mut tx, kind, &current.id, now, Some(&new_record.id)).await?;
    tx.commit().await.map_err(ApiError::from)?;

    info!("refresh token rotated user_id={}", user.id);
    let access = create_access_token(cfg, &user.id)?;
    Ok((user, token_pair(cfg, access, raw_refresh)))
}

/// Revokes only the presented refresh token; outstanding access tokens stay
/// valid until expiry.
pub async fn revoke_refresh_token(
    pool: &AnyPool,
    kind: DbKind,
    refresh_token_raw: &str,
) -> ApiResult<()> {
    let token = db::find_refresh_token_by_hash(pool, kind, &hash_token(refresh_token_raw)).await?;
    let Some(token) = token else {
        return Ok(());
    };
    if token.revoked_at.is_some() {
        return Ok(());
    }

    let mut tx = pool.begin().await.map_err(ApiError::from)?;
    db::mark_refresh_token_revoked(&mut tx, kind, &token.id, Utc::now(), None).await?;
    tx.commit().await.map_err(ApiError::from)?;
    info!("refresh token revoked user_id={}", token.user_id);
    Ok(())
}

/// Sliding-window limiter for the token-minting auth routes, keyed by
/// `client_ip:path`.
pub struct AuthRateLimiter {
    window_seconds: u64,
    max_requests: usize,
    events: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl AuthRateLimiter {
    pub fn new(window_seconds: u64, max_requests: usize) -> Self {
        Self {
            window_seconds,
            max_requests,
            events: Mutex::new(HashMap::new()),
        }
    }

    pub fn hit(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut events = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let bucket = events.entry(key.to_string()).or_default();
        while let Some(front) = bucket.front() {
            if now.duration_since(*front).as_secs() >= self.window_seconds {
                bucket.pop_front();
            } else {
                break;
            }
        }
        if bucket.len() >= self.max_requests {
            return false;
        }
        bucket.push_back(now);
        true
    }
}

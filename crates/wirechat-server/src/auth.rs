//! Authentication: bearer tokens and password hashing, plus the account
//! service behind `/api/register`, `/api/login`, and `/api/guest`.

use std::sync::Arc;

use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use wirechat_store::{Database, StoreError};

/// bcrypt cost factor. 10 balances security and login latency.
const BCRYPT_COST: u32 = 10;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("user already exists")]
    UserExists,

    #[error("username must be 3-32 characters")]
    InvalidUsername,

    #[error("password must be at least 6 characters")]
    InvalidPassword,

    #[error("invalid token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("hash password: {0}")]
    Hash(#[from] bcrypt::BcryptError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// JWT signing configuration.
#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl: Duration,
}

/// Claims carried by a WireChat bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: i64,
    pub username: String,
    #[serde(default)]
    pub is_guest: bool,
    pub iss: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
}

/// Sign a token for the given user.
pub fn generate_token(
    cfg: &JwtConfig,
    user_id: i64,
    username: &str,
    is_guest: bool,
) -> Result<String, AuthError> {
    let now = Utc::now();
    let claims = Claims {
        user_id,
        username: username.to_string(),
        is_guest,
        iss: cfg.issuer.clone(),
        aud: cfg.audience.clone(),
        exp: (now + cfg.ttl).timestamp(),
        iat: now.timestamp(),
    };

    let token = jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.secret.as_bytes()),
    )?;
    Ok(token)
}

/// Validate signature, expiry, and the configured issuer/audience.
pub fn validate_token(cfg: &JwtConfig, token: &str) -> Result<Claims, AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    if cfg.issuer.is_empty() {
        validation.iss = None;
    } else {
        validation.set_issuer(&[&cfg.issuer]);
    }
    if cfg.audience.is_empty() {
        validation.validate_aud = false;
    } else {
        validation.set_audience(&[&cfg.audience]);
    }

    let data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(cfg.secret.as_bytes()),
        &validation,
    )?;
    Ok(data.claims)
}

pub fn hash_password(password: &str) -> Result<String, AuthError> {
    Ok(bcrypt::hash(password, BCRYPT_COST)?)
}

pub fn verify_password(hash: &str, password: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

/// Account operations on top of the store.
pub struct AuthService {
    db: Arc<Database>,
    jwt: JwtConfig,
}

impl AuthService {
    pub fn new(db: Arc<Database>, jwt: JwtConfig) -> Self {
        Self { db, jwt }
    }

    /// Create a user and return a signed token.
    pub fn register(&self, username: &str, password: &str) -> Result<String, AuthError> {
        let username = username.trim();
        if username.len() < 3 || username.len() > 32 {
            return Err(AuthError::InvalidUsername);
        }
        if password.len() < 6 {
            return Err(AuthError::InvalidPassword);
        }

        if self.db.get_user_by_username(username).is_ok() {
            return Err(AuthError::UserExists);
        }

        let hash = hash_password(password)?;
        let user = match self.db.create_user(username, &hash) {
            Ok(user) => user,
            Err(e) if e.is_unique_violation() => return Err(AuthError::UserExists),
            Err(e) => return Err(e.into()),
        };

        generate_token(&self.jwt, user.id, &user.username, false)
    }

    /// Validate credentials and return a signed token.
    pub fn login(&self, username: &str, password: &str) -> Result<String, AuthError> {
        let user = self
            .db
            .get_user_by_username(username.trim())
            .map_err(|_| AuthError::InvalidCredentials)?;

        if !verify_password(&user.password_hash, password) {
            return Err(AuthError::InvalidCredentials);
        }

        generate_token(&self.jwt, user.id, &user.username, false)
    }

    /// Create a throwaway guest account and return its token and session id.
    pub fn guest_login(&self) -> Result<(String, String), AuthError> {
        let session_id = new_guest_session_id();
        let user = self.db.create_guest_user(&session_id)?;
        let token = generate_token(&self.jwt, user.id, &user.username, true)?;
        Ok((token, session_id))
    }

    pub fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        validate_token(&self.jwt, token)
    }
}

fn new_guest_session_id() -> String {
    let mut buf = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

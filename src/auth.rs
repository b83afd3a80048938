use crate::{
    config::Config,
    error::{AppError, AppResult, ErrorCode},
    models::User,
    schema::*,
    DbPool,
};
use argon2::Argon2;
use axum::{
    async_trait,
    extract::{FromRequestParts, TypedHeader},
    headers::{authorization::Bearer, Authorization},
    http::request::Parts,
    Extension,
};
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use jsonwebtoken::{
    errors::Result as JwtResult, DecodingKey, EncodingKey, Header, Validation,
};
use password_hash::{
    self, rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{sync::Arc, time::Duration};

pub fn hash_password(password: impl AsRef<[u8]>) -> password_hash::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_ref(), &salt)
        .map(|h| h.to_string())
}

pub fn verify_password(
    password: impl AsRef<[u8]>,
    password_hash: impl AsRef<str>,
) -> password_hash::Result<bool> {
    let parsed_hash = PasswordHash::new(password_hash.as_ref())?;
    Ok(Argon2::default()
        .verify_password(password.as_ref(), &parsed_hash)
        .is_ok())
}

/// Signing material and token lifetimes, built once from [`Config`].
pub struct AuthKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub session_ttl: Duration,
}

impl AuthKeys {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::from_secret(
            &config.jwt_secret,
            config.access_token_ttl(),
            config.refresh_token_ttl(),
            config.session_ttl(),
        )
    }

    pub fn from_secret(
        secret: &str,
        access_ttl: Duration,
        refresh_ttl: Duration,
        session_ttl: Duration,
    ) -> anyhow::Result<Self> {
        Ok(AuthKeys {
            encoding: EncodingKey::from_base64_secret(secret)
                .map_err(|_| anyhow::anyhow!("JWT_SECRET is not valid base64"))?,
            decoding: DecodingKey::from_base64_secret(secret)
                .map_err(|_| anyhow::anyhow!("JWT_SECRET is not valid base64"))?,
            access_ttl,
            refresh_ttl,
            session_ttl,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i32,
    /// Session the token was minted for.
    pub sid: i32,
    pub kind: TokenKind,
    pub exp: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error(transparent)]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("expected a {expected:?} token")]
    WrongKind { expected: TokenKind },
}

pub fn generate_jwt(
    keys: &AuthKeys,
    user_id: i32,
    session_id: i32,
    kind: TokenKind,
) -> JwtResult<String> {
    let ttl = match kind {
        TokenKind::Access => keys.access_ttl,
        TokenKind::Refresh => keys.refresh_ttl,
    };
    jsonwebtoken::encode(
        &Header::default(),
        &Claims {
            sub: user_id,
            sid: session_id,
            kind,
            exp: jsonwebtoken::get_current_timestamp() + ttl.as_secs(),
        },
        &keys.encoding,
    )
}

pub fn validate_jwt(keys: &AuthKeys, token: &str, expected: TokenKind) -> Result<Claims, TokenError> {
    let data = jsonwebtoken::decode::<Claims>(token, &keys.decoding, &Validation::default())?;
    if data.claims.kind != expected {
        return Err(TokenError::WrongKind { expected });
    }
    Ok(data.claims)
}

/// Opaque session credential handed to the client. Only its hash is stored.
pub fn new_session_token() -> String {
    nanoid::nanoid!(48)
}

pub fn hash_session_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

async fn load_active_user(conn: &mut AsyncPgConnection, user_id: i32) -> AppResult<User> {
    users::table
        .find(user_id)
        .filter(users::is_active.eq(true))
        .select(User::as_select())
        .first(conn)
        .await
        .optional()?
        .ok_or_else(invalid_token)
}

fn invalid_token() -> AppError {
    AppError::from(ErrorCode::InvalidCredentials, "invalid or expired credentials")
}

/// Resolves a bearer credential: a JWT access token, or an opaque session
/// token that has not expired.
pub async fn resolve_bearer(
    conn: &mut AsyncPgConnection,
    keys: &AuthKeys,
    token: &str,
) -> AppResult<User> {
    if let Ok(claims) = validate_jwt(keys, token, TokenKind::Access) {
        return load_active_user(conn, claims.sub).await;
    }

    let user_id = auth_sessions::table
        .filter(auth_sessions::token_hash.eq(hash_session_token(token)))
        .filter(auth_sessions::expires_at.gt(Utc::now()))
        .select(auth_sessions::user_id)
        .first::<i32>(conn)
        .await
        .optional()?
        .ok_or_else(invalid_token)?;

    load_active_user(conn, user_id).await
}

/// Optional authentication. Absent credentials give `None`; present but
/// invalid credentials are rejected.
pub struct MaybeAuth(pub Option<User>);

#[async_trait]
impl<S> FromRequestParts<S> for MaybeAuth
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let bearer =
            Option::<TypedHeader<Authorization<Bearer>>>::from_request_parts(parts, state)
                .await
                .ok()
                .flatten();
        let Some(TypedHeader(Authorization(bearer))) = bearer else {
            return Ok(MaybeAuth(None));
        };

        let Extension(pool) = Extension::<DbPool>::from_request_parts(parts, state).await?;
        let Extension(keys) = Extension::<Arc<AuthKeys>>::from_request_parts(parts, state).await?;

        let mut conn = pool.get().await?;
        let user = resolve_bearer(&mut conn, &keys, bearer.token()).await?;
        Ok(MaybeAuth(Some(user)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> AuthKeys {
        // base64 of "a test secret that is long enough"
        AuthKeys::from_secret(
            "YSB0ZXN0IHNlY3JldCB0aGF0IGlzIGxvbmcgZW5vdWdo",
            Duration::from_secs(60),
            Duration::from_secs(3600),
            Duration::from_secs(7200),
        )
        .unwrap()
    }

    #[test]
    fn password_roundtrip() {
        let hash = hash_password("hunter22").unwrap();
        assert!(verify_password("hunter22", &hash).unwrap());
        assert!(!verify_password("hunter23", &hash).unwrap());
    }

    #[test]
    fn malformed_hash_is_an_error() {
        assert!(verify_password("hunter22", "not-a-phc-string").is_err());
    }

    #[test]
    fn access_token_validates_as_access_only() {
        let keys = keys();
        let token = generate_jwt(&keys, 7, 3, TokenKind::Access).unwrap();
        let claims = validate_jwt(&keys, &token, TokenKind::Access).unwrap();
        assert_eq!(claims.sub, 7);
        assert_eq!(claims.sid, 3);
        assert!(matches!(
            validate_jwt(&keys, &token, TokenKind::Refresh),
            Err(TokenError::WrongKind {
                expected: TokenKind::Refresh
            })
        ));
    }

    #[test]
    fn tokens_from_another_secret_are_rejected() {
        let token = generate_jwt(&keys(), 7, 3, TokenKind::Refresh).unwrap();
        let other = AuthKeys::from_secret(
            "c29tZSBvdGhlciBzZWNyZXQgZW50aXJlbHk=",
            Duration::from_secs(60),
            Duration::from_secs(60),
            Duration::from_secs(60),
        )
        .unwrap();
        assert!(matches!(
            validate_jwt(&other, &token, TokenKind::Refresh),
            Err(TokenError::Jwt(_))
        ));
    }

    #[test]
    fn invalid_base64_secret_fails() {
        assert!(AuthKeys::from_secret(
            "%%%",
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(1)
        )
        .is_err());
    }

    #[test]
    fn session_tokens_hash_deterministically() {
        let token = new_session_token();
        assert_eq!(token.len(), 48);
        assert_eq!(hash_session_token(&token), hash_session_token(&token));
        assert_eq!(hash_session_token(&token).len(), 64);
        assert_ne!(hash_session_token(&token), hash_session_token("other"));
    }
}

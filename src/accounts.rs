//! User accounts: registration, credential checks, login sessions and the
//! caller's own profile.

use crate::{
    auth::{self, AuthKeys, TokenKind},
    error::{AppError, AppResult, ErrorCode, FieldErrors},
    models::{lower, User},
    schema::*,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};

pub const MIN_PASSWORD_LEN: usize = 8;
const MAX_USERNAME_LEN: usize = 150;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

#[derive(Debug, Deserialize)]
pub struct Credentials {
    /// Username or email.
    pub login: String,
    pub password: String,
}

#[derive(Debug, Default, Deserialize, AsChangeset)]
#[diesel(table_name = users)]
pub struct ProfilePatch {
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserView {
    pub id: i32,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub is_superuser: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        UserView {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            is_superuser: user.is_superuser,
            created_at: user.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TokenBundle {
    pub access_token: String,
    pub refresh_token: String,
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
    pub user: UserView,
}

#[derive(Debug, Serialize)]
pub struct AccessToken {
    pub access_token: String,
}

fn validate_email(errors: &mut FieldErrors, email: &str) {
    if email.trim().parse::<lettre::Address>().is_err() {
        errors.add("email", "enter a valid email address");
    }
}

fn validate_registration(req: &RegisterRequest) -> AppResult<()> {
    let mut errors = FieldErrors::default();
    let username = req.username.trim();
    if username.is_empty() {
        errors.add("username", "this field may not be blank");
    } else if username.chars().count() > MAX_USERNAME_LEN {
        errors.add("username", format!("ensure this field has no more than {MAX_USERNAME_LEN} characters"));
    } else if !username
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '-' | '@' | '+'))
    {
        errors.add("username", "letters, digits and @/./+/-/_ only");
    }
    validate_email(&mut errors, &req.email);
    if req.password.chars().count() < MIN_PASSWORD_LEN {
        errors.add("password", format!("ensure this field has at least {MIN_PASSWORD_LEN} characters"));
    }
    errors.into_result()
}

async fn ensure_available(
    conn: &mut AsyncPgConnection,
    username: Option<&str>,
    email: Option<&str>,
    except: Option<i32>,
) -> AppResult<()> {
    if let Some(username) = username {
        let mut query = users::table
            .filter(lower(users::username).eq(username.to_lowercase()))
            .select(users::id)
            .into_boxed();
        if let Some(id) = except {
            query = query.filter(users::id.ne(id));
        }
        if query.first::<i32>(conn).await.optional()?.is_some() {
            return Err(AppError::from(ErrorCode::DuplicateUsername, "username has been taken"));
        }
    }
    if let Some(email) = email {
        let mut query = users::table
            .filter(lower(users::email).eq(email.to_lowercase()))
            .select(users::id)
            .into_boxed();
        if let Some(id) = except {
            query = query.filter(users::id.ne(id));
        }
        if query.first::<i32>(conn).await.optional()?.is_some() {
            return Err(AppError::from(
                ErrorCode::DuplicateEmail,
                "an account with this email already exists",
            ));
        }
    }
    Ok(())
}

/// Creates a user without opening a session. Shared with invitation
/// acceptance, which runs it on its own transaction.
pub async fn create_user(conn: &mut AsyncPgConnection, req: &RegisterRequest) -> AppResult<User> {
    validate_registration(req)?;
    let username = req.username.trim();
    let email = req.email.trim();
    ensure_available(conn, Some(username), Some(email), None).await?;

    let user = diesel::insert_into(users::table)
        .values((
            users::username.eq(username),
            users::email.eq(email),
            users::password_hash.eq(auth::hash_password(&req.password)?),
            users::first_name.eq(req.first_name.trim()),
            users::last_name.eq(req.last_name.trim()),
        ))
        .returning(User::as_returning())
        .get_result(conn)
        .await
        .map_err(AppError::from_db)?;

    tracing::info!(user_id = user.id, "user registered");
    Ok(user)
}

pub async fn register(
    conn: &mut AsyncPgConnection,
    keys: &AuthKeys,
    req: RegisterRequest,
) -> AppResult<TokenBundle> {
    let user = create_user(conn, &req).await?;
    open_session(conn, keys, &user).await
}

fn invalid_credentials() -> AppError {
    AppError::from(ErrorCode::InvalidCredentials, "invalid username or password")
}

/// Checks a login handle (username or email, case-insensitive) and password.
pub async fn authenticate(
    conn: &mut AsyncPgConnection,
    login: &str,
    password: &str,
) -> AppResult<User> {
    let login = login.trim().to_lowercase();
    let user = users::table
        .filter(
            lower(users::username)
                .eq(&login)
                .or(lower(users::email).eq(&login)),
        )
        .filter(users::is_active.eq(true))
        .select(User::as_select())
        .first(conn)
        .await
        .optional()?
        .ok_or_else(invalid_credentials)?;

    if auth::verify_password(password, &user.password_hash)? {
        Ok(user)
    } else {
        Err(invalid_credentials())
    }
}

/// Stores a new session (only the token hash) and mints the token pair
/// bound to it.
pub async fn open_session(
    conn: &mut AsyncPgConnection,
    keys: &AuthKeys,
    user: &User,
) -> AppResult<TokenBundle> {
    let session_token = auth::new_session_token();
    let expires_at = Utc::now() + chrono::Duration::from_std(keys.session_ttl)?;
    let session_id = diesel::insert_into(auth_sessions::table)
        .values((
            auth_sessions::user_id.eq(user.id),
            auth_sessions::token_hash.eq(auth::hash_session_token(&session_token)),
            auth_sessions::expires_at.eq(expires_at),
        ))
        .returning(auth_sessions::id)
        .get_result::<i32>(conn)
        .await?;

    Ok(TokenBundle {
        access_token: auth::generate_jwt(keys, user.id, session_id, TokenKind::Access)?,
        refresh_token: auth::generate_jwt(keys, user.id, session_id, TokenKind::Refresh)?,
        session_token,
        expires_at,
        user: user.into(),
    })
}

pub async fn login(
    conn: &mut AsyncPgConnection,
    keys: &AuthKeys,
    credentials: Credentials,
) -> AppResult<TokenBundle> {
    let user = authenticate(conn, &credentials.login, &credentials.password).await?;
    let bundle = open_session(conn, keys, &user).await?;
    tracing::info!(user_id = user.id, "user logged in");
    Ok(bundle)
}

/// Exchanges a refresh token for a new access token while its session lives.
pub async fn refresh(
    conn: &mut AsyncPgConnection,
    keys: &AuthKeys,
    refresh_token: &str,
) -> AppResult<AccessToken> {
    let expired = || AppError::from(ErrorCode::InvalidCredentials, "invalid or expired refresh token");
    let claims = auth::validate_jwt(keys, refresh_token, TokenKind::Refresh).map_err(|err| {
        tracing::debug!(error = %err, "refresh token rejected");
        expired()
    })?;

    let live = auth_sessions::table
        .inner_join(users::table)
        .filter(auth_sessions::id.eq(claims.sid))
        .filter(auth_sessions::user_id.eq(claims.sub))
        .filter(auth_sessions::expires_at.gt(Utc::now()))
        .filter(users::is_active.eq(true))
        .select(auth_sessions::id)
        .first::<i32>(conn)
        .await
        .optional()?;
    if live.is_none() {
        return Err(expired());
    }

    Ok(AccessToken {
        access_token: auth::generate_jwt(keys, claims.sub, claims.sid, TokenKind::Access)?,
    })
}

/// Ends the session identified by `token`: either a JWT of the session or
/// its opaque token. Unknown tokens are ignored.
pub async fn logout(conn: &mut AsyncPgConnection, keys: &AuthKeys, token: &str) -> AppResult<()> {
    let session = auth::validate_jwt(keys, token, TokenKind::Refresh)
        .or_else(|_| auth::validate_jwt(keys, token, TokenKind::Access));
    let deleted = match session {
        Ok(claims) => {
            diesel::delete(auth_sessions::table.find(claims.sid))
                .execute(conn)
                .await?
        }
        Err(_) => {
            diesel::delete(
                auth_sessions::table
                    .filter(auth_sessions::token_hash.eq(auth::hash_session_token(token))),
            )
            .execute(conn)
            .await?
        }
    };
    tracing::debug!(deleted, "session closed");
    Ok(())
}

pub async fn update_profile(
    conn: &mut AsyncPgConnection,
    user: &User,
    mut patch: ProfilePatch,
) -> AppResult<UserView> {
    let mut errors = FieldErrors::default();
    if let Some(email) = patch.email.as_mut() {
        *email = email.trim().to_string();
        validate_email(&mut errors, email);
    }
    errors.into_result()?;
    ensure_available(conn, None, patch.email.as_deref(), Some(user.id)).await?;

    if patch.email.is_none() && patch.first_name.is_none() && patch.last_name.is_none() {
        return Ok(user.into());
    }
    let updated = diesel::update(users::table.find(user.id))
        .set(&patch)
        .returning(User::as_returning())
        .get_result(conn)
        .await
        .map_err(AppError::from_db)?;
    Ok((&updated).into())
}

use crate::{
    accounts::{self, AccessToken, Credentials, ProfilePatch, RegisterRequest, TokenBundle, UserView},
    api::Signed,
    auth::AuthKeys,
    error::AppResult,
    rbac, DbPool,
};
use axum::{
    extract::TypedHeader,
    headers::{authorization::Bearer, Authorization},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

#[derive(Deserialize)]
struct LogoutRequest {
    token: Option<String>,
}

async fn register(
    Extension(pool): Extension<DbPool>,
    Extension(keys): Extension<Arc<AuthKeys>>,
    Json(req): Json<RegisterRequest>,
) -> AppResult<(StatusCode, Json<TokenBundle>)> {
    let conn = &mut pool.get().await?;
    let bundle = accounts::register(conn, &keys, req).await?;
    Ok((StatusCode::CREATED, Json(bundle)))
}

async fn login(
    Extension(pool): Extension<DbPool>,
    Extension(keys): Extension<Arc<AuthKeys>>,
    Json(req): Json<Credentials>,
) -> AppResult<Json<TokenBundle>> {
    let conn = &mut pool.get().await?;
    Ok(Json(accounts::login(conn, &keys, req).await?))
}

async fn refresh(
    Extension(pool): Extension<DbPool>,
    Extension(keys): Extension<Arc<AuthKeys>>,
    Json(req): Json<RefreshRequest>,
) -> AppResult<Json<AccessToken>> {
    let conn = &mut pool.get().await?;
    Ok(Json(accounts::refresh(conn, &keys, &req.refresh_token).await?))
}

/// Ends the session named by the body token, or else by the bearer
/// credential.
async fn logout(
    Extension(pool): Extension<DbPool>,
    Extension(keys): Extension<Arc<AuthKeys>>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    body: Option<Json<LogoutRequest>>,
) -> AppResult<StatusCode> {
    let token = body
        .and_then(|Json(req)| req.token)
        .or_else(|| bearer.map(|TypedHeader(Authorization(bearer))| bearer.token().to_string()));
    if let Some(token) = token {
        let conn = &mut pool.get().await?;
        accounts::logout(conn, &keys, &token).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn me(caller: Signed) -> Json<UserView> {
    Json((&caller.user).into())
}

#[derive(Serialize)]
struct Manageable {
    clubs: Vec<i32>,
    chapters: Vec<i32>,
    members: Vec<i32>,
}

async fn manageable(Extension(pool): Extension<DbPool>, caller: Signed) -> AppResult<Json<Manageable>> {
    let conn = &mut pool.get().await?;
    Ok(Json(Manageable {
        clubs: rbac::manageable_clubs(conn, &caller.scope).await?,
        chapters: rbac::manageable_chapters(conn, &caller.scope).await?,
        members: rbac::manageable_members(conn, &caller.scope).await?,
    }))
}

async fn update_me(
    Extension(pool): Extension<DbPool>,
    caller: Signed,
    Json(patch): Json<ProfilePatch>,
) -> AppResult<Json<UserView>> {
    let conn = &mut pool.get().await?;
    Ok(Json(accounts::update_profile(conn, &caller.user, patch).await?))
}

pub fn app() -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/refresh", post(refresh))
        .route("/logout", post(logout))
        .route("/me", get(me).patch(update_me))
        .route("/me/manageable", get(manageable))
}

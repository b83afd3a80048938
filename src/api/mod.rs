use crate::{
    auth::MaybeAuth,
    error::{AppError, AppResult},
    models::User,
    rbac::Scope,
    DbPool,
};
use axum::{async_trait, extract::FromRequestParts, http::request::Parts, Extension, Router};

pub mod achievements;
pub mod admins;
pub mod auth;
pub mod chapters;
pub mod clubs;
pub mod invitations;
pub mod join_requests;
pub mod members;

pub fn app() -> Router {
    Router::new()
        .nest("/auth", auth::app())
        .nest("/clubs", clubs::app())
        .nest("/chapters", chapters::app())
        .nest("/members", members::app())
        .nest("/club-admins", admins::club_app())
        .nest("/chapter-admins", admins::chapter_app())
        .nest("/discovery/join-requests", join_requests::app())
        .nest("/invitations", invitations::app())
        .nest("/achievements", achievements::catalogue_app())
        .nest("/user-achievements", achievements::awards_app())
}

/// Caller of a public endpoint: maybe a user, always a scope.
pub struct Viewer {
    pub user: Option<User>,
    pub scope: Scope,
}

/// Caller of an endpoint that requires authentication.
pub struct Signed {
    pub user: User,
    pub scope: Scope,
}

async fn load_scope<S: Send + Sync>(
    parts: &mut Parts,
    state: &S,
    user: Option<&User>,
) -> AppResult<Scope> {
    let Some(user) = user else {
        return Ok(Scope::anonymous());
    };
    let Extension(pool) = Extension::<DbPool>::from_request_parts(parts, state).await?;
    let conn = &mut pool.get().await?;
    Scope::load(conn, Some(user)).await
}

#[async_trait]
impl<S> FromRequestParts<S> for Viewer
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let MaybeAuth(user) = MaybeAuth::from_request_parts(parts, state).await?;
        let scope = load_scope(parts, state, user.as_ref()).await?;
        Ok(Viewer { user, scope })
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Signed
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let MaybeAuth(user) = MaybeAuth::from_request_parts(parts, state).await?;
        let user = user.ok_or_else(AppError::unauthenticated)?;
        let scope = load_scope(parts, state, Some(&user)).await?;
        Ok(Signed { user, scope })
    }
}

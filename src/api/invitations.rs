use crate::{
    api::Signed,
    auth::MaybeAuth,
    email::Mailer,
    error::{AppError, AppResult},
    invitations::{self, AcceptCredentials, Accepted, Acceptor, CreatedInvitation, InvitationDraft, InvitationInfo},
    models::Invitation,
    types::InvitationStatus,
    DbPool,
};
use axum::{
    extract::{Path, Query},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Deserialize)]
struct StatusFilter {
    status: Option<InvitationStatus>,
}

async fn list(
    Extension(pool): Extension<DbPool>,
    caller: Signed,
    Query(filter): Query<StatusFilter>,
) -> AppResult<Json<Vec<Invitation>>> {
    let conn = &mut pool.get().await?;
    Ok(Json(invitations::list_invitations(conn, &caller.scope, filter.status).await?))
}

/// The email goes out after the invitation is committed.
async fn create(
    Extension(pool): Extension<DbPool>,
    Extension(mailer): Extension<Mailer>,
    caller: Signed,
    Json(draft): Json<InvitationDraft>,
) -> AppResult<(StatusCode, Json<CreatedInvitation>)> {
    let conn = &mut pool.get().await?;
    let created = invitations::create_invitation(conn, &caller.scope, &caller.user, draft).await?;
    mailer
        .send_invitation(&created.invitation, &created.club_name)
        .await;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn read(
    Extension(pool): Extension<DbPool>,
    caller: Signed,
    Path(id): Path<i32>,
) -> AppResult<Json<Invitation>> {
    let conn = &mut pool.get().await?;
    Ok(Json(invitations::get_invitation(conn, &caller.scope, id).await?))
}

async fn info(
    Extension(pool): Extension<DbPool>,
    Path(token): Path<Uuid>,
) -> AppResult<Json<InvitationInfo>> {
    let conn = &mut pool.get().await?;
    Ok(Json(invitations::info(conn, token).await?))
}

/// Credentials in the body win over the bearer identity.
async fn accept(
    Extension(pool): Extension<DbPool>,
    MaybeAuth(user): MaybeAuth,
    Path(token): Path<Uuid>,
    body: Option<Json<AcceptCredentials>>,
) -> AppResult<Json<Accepted>> {
    let acceptor = match (body, user) {
        (Some(Json(credentials)), _) => Acceptor::Credentials(credentials),
        (None, Some(user)) => Acceptor::Current(user),
        (None, None) => return Err(AppError::unauthenticated()),
    };
    let conn = &mut pool.get().await?;
    Ok(Json(invitations::accept(conn, token, acceptor).await?))
}

async fn decline(
    Extension(pool): Extension<DbPool>,
    Path(token): Path<Uuid>,
) -> AppResult<Json<Invitation>> {
    let conn = &mut pool.get().await?;
    Ok(Json(invitations::decline(conn, token).await?))
}

// token routes share the `:id` segment name with the admin routes
pub fn app() -> Router {
    Router::new()
        .route("/", get(list).post(create))
        .route("/:id", get(read))
        .route("/:id/info", get(info))
        .route("/:id/accept", post(accept))
        .route("/:id/decline", post(decline))
}

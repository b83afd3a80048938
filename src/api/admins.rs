use crate::{
    admins::{self, AssignmentFilter, Assigned, ChapterAdminDraft, ClubAdminDraft},
    api::Signed,
    error::AppResult,
    models::{ChapterAdmin, ClubAdmin},
    DbPool,
};
use axum::{
    extract::{Path, Query},
    http::StatusCode,
    routing::get,
    Extension, Json, Router,
};

async fn list_club_admins(
    Extension(pool): Extension<DbPool>,
    caller: Signed,
    Query(filter): Query<AssignmentFilter>,
) -> AppResult<Json<Vec<ClubAdmin>>> {
    let conn = &mut pool.get().await?;
    Ok(Json(admins::list_club_admins(conn, &caller.scope, filter).await?))
}

async fn assign_club_admin(
    Extension(pool): Extension<DbPool>,
    caller: Signed,
    Json(draft): Json<ClubAdminDraft>,
) -> AppResult<(StatusCode, Json<Assigned<ClubAdmin>>)> {
    let conn = &mut pool.get().await?;
    let assigned = admins::assign_club_admin(conn, &caller.scope, draft).await?;
    Ok((StatusCode::CREATED, Json(assigned)))
}

async fn read_club_admin(
    Extension(pool): Extension<DbPool>,
    caller: Signed,
    Path(id): Path<i32>,
) -> AppResult<Json<ClubAdmin>> {
    let conn = &mut pool.get().await?;
    Ok(Json(admins::get_club_admin(conn, &caller.scope, id).await?))
}

async fn revoke_club_admin(
    Extension(pool): Extension<DbPool>,
    caller: Signed,
    Path(id): Path<i32>,
) -> AppResult<StatusCode> {
    let conn = &mut pool.get().await?;
    admins::revoke_club_admin(conn, &caller.scope, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_chapter_admins(
    Extension(pool): Extension<DbPool>,
    caller: Signed,
    Query(filter): Query<AssignmentFilter>,
) -> AppResult<Json<Vec<ChapterAdmin>>> {
    let conn = &mut pool.get().await?;
    Ok(Json(admins::list_chapter_admins(conn, &caller.scope, filter).await?))
}

async fn assign_chapter_admin(
    Extension(pool): Extension<DbPool>,
    caller: Signed,
    Json(draft): Json<ChapterAdminDraft>,
) -> AppResult<(StatusCode, Json<Assigned<ChapterAdmin>>)> {
    let conn = &mut pool.get().await?;
    let assigned = admins::assign_chapter_admin(conn, &caller.scope, draft).await?;
    Ok((StatusCode::CREATED, Json(assigned)))
}

async fn read_chapter_admin(
    Extension(pool): Extension<DbPool>,
    caller: Signed,
    Path(id): Path<i32>,
) -> AppResult<Json<ChapterAdmin>> {
    let conn = &mut pool.get().await?;
    Ok(Json(admins::get_chapter_admin(conn, &caller.scope, id).await?))
}

async fn revoke_chapter_admin(
    Extension(pool): Extension<DbPool>,
    caller: Signed,
    Path(id): Path<i32>,
) -> AppResult<StatusCode> {
    let conn = &mut pool.get().await?;
    admins::revoke_chapter_admin(conn, &caller.scope, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn club_app() -> Router {
    Router::new()
        .route("/", get(list_club_admins).post(assign_club_admin))
        .route("/:id", get(read_club_admin).delete(revoke_club_admin))
}

pub fn chapter_app() -> Router {
    Router::new()
        .route("/", get(list_chapter_admins).post(assign_chapter_admin))
        .route("/:id", get(read_chapter_admin).delete(revoke_chapter_admin))
}

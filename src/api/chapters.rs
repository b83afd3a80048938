use crate::{
    api::{Signed, Viewer},
    error::AppResult,
    models::Chapter,
    provisioning::{self, ChapterDraft, ChapterOutcome, ChapterPatch},
    DbPool,
};
use axum::{
    extract::{Path, Query},
    http::StatusCode,
    routing::get,
    Extension, Json, Router,
};
use serde::Deserialize;

#[derive(Deserialize)]
struct ChapterFilter {
    club: Option<i32>,
}

async fn list(
    Extension(pool): Extension<DbPool>,
    viewer: Viewer,
    Query(filter): Query<ChapterFilter>,
) -> AppResult<Json<Vec<Chapter>>> {
    let conn = &mut pool.get().await?;
    Ok(Json(provisioning::list_chapters(conn, &viewer.scope, filter.club).await?))
}

/// 201 when the chapter was written, 202 when it awaits approval.
async fn create(
    Extension(pool): Extension<DbPool>,
    caller: Signed,
    Json(draft): Json<ChapterDraft>,
) -> AppResult<(StatusCode, Json<ChapterOutcome>)> {
    let conn = &mut pool.get().await?;
    let outcome = provisioning::create_chapter_intent(conn, &caller.scope, draft).await?;
    let status = match outcome {
        ChapterOutcome::Created { .. } => StatusCode::CREATED,
        ChapterOutcome::PendingApproval { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(outcome)))
}

async fn read(
    Extension(pool): Extension<DbPool>,
    viewer: Viewer,
    Path(id): Path<i32>,
) -> AppResult<Json<Chapter>> {
    let conn = &mut pool.get().await?;
    Ok(Json(provisioning::visible_chapter(conn, &viewer.scope, id).await?))
}

async fn update(
    Extension(pool): Extension<DbPool>,
    viewer: Viewer,
    Path(id): Path<i32>,
    Json(patch): Json<ChapterPatch>,
) -> AppResult<Json<Chapter>> {
    let conn = &mut pool.get().await?;
    Ok(Json(provisioning::update_chapter(conn, &viewer.scope, id, patch).await?))
}

async fn delete(
    Extension(pool): Extension<DbPool>,
    viewer: Viewer,
    Path(id): Path<i32>,
) -> AppResult<StatusCode> {
    let conn = &mut pool.get().await?;
    provisioning::delete_chapter(conn, &viewer.scope, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn app() -> Router {
    Router::new()
        .route("/", get(list).post(create))
        .route("/:id", get(read).patch(update).put(update).delete(delete))
}

use crate::{
    api::{Signed, Viewer},
    clubs::{self, ClubDraft, ClubPatch, FoundedClub},
    error::AppResult,
    models::Club,
    DbPool,
};
use axum::{extract::Path, http::StatusCode, routing::get, Extension, Json, Router};

async fn list(Extension(pool): Extension<DbPool>, viewer: Viewer) -> AppResult<Json<Vec<Club>>> {
    let conn = &mut pool.get().await?;
    Ok(Json(clubs::list_visible(conn, &viewer.scope).await?))
}

async fn create(
    Extension(pool): Extension<DbPool>,
    caller: Signed,
    Json(draft): Json<ClubDraft>,
) -> AppResult<(StatusCode, Json<FoundedClub>)> {
    let conn = &mut pool.get().await?;
    let founded = clubs::create_club(conn, &caller.user, draft).await?;
    Ok((StatusCode::CREATED, Json(founded)))
}

async fn read(
    Extension(pool): Extension<DbPool>,
    viewer: Viewer,
    Path(id): Path<i32>,
) -> AppResult<Json<Club>> {
    let conn = &mut pool.get().await?;
    Ok(Json(clubs::visible(conn, &viewer.scope, id).await?))
}

async fn update(
    Extension(pool): Extension<DbPool>,
    viewer: Viewer,
    Path(id): Path<i32>,
    Json(patch): Json<ClubPatch>,
) -> AppResult<Json<Club>> {
    let conn = &mut pool.get().await?;
    Ok(Json(clubs::update_club(conn, &viewer.scope, id, patch).await?))
}

async fn delete(
    Extension(pool): Extension<DbPool>,
    viewer: Viewer,
    Path(id): Path<i32>,
) -> AppResult<StatusCode> {
    let conn = &mut pool.get().await?;
    clubs::delete_club(conn, &viewer.scope, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn app() -> Router {
    Router::new()
        .route("/", get(list).post(create))
        .route("/:id", get(read).patch(update).put(update).delete(delete))
}

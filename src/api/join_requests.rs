use crate::{
    api::Signed,
    error::AppResult,
    models::ChapterJoinRequest,
    provisioning::{self, Decision, JoinRequestDraft, ReviewOutcome},
    types::JoinRequestStatus,
    DbPool,
};
use axum::{
    extract::{Path, Query},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;

#[derive(Deserialize)]
struct StatusFilter {
    status: Option<JoinRequestStatus>,
}

#[derive(Default, Deserialize)]
struct ReviewRequest {
    admin_notes: Option<String>,
}

async fn list(
    Extension(pool): Extension<DbPool>,
    caller: Signed,
    Query(filter): Query<StatusFilter>,
) -> AppResult<Json<Vec<ChapterJoinRequest>>> {
    let conn = &mut pool.get().await?;
    Ok(Json(provisioning::list_requests(conn, &caller.scope, filter.status).await?))
}

async fn submit(
    Extension(pool): Extension<DbPool>,
    caller: Signed,
    Json(draft): Json<JoinRequestDraft>,
) -> AppResult<(StatusCode, Json<ChapterJoinRequest>)> {
    let conn = &mut pool.get().await?;
    let request = provisioning::submit_join_request(conn, &caller.scope, draft).await?;
    Ok((StatusCode::CREATED, Json(request)))
}

async fn read(
    Extension(pool): Extension<DbPool>,
    caller: Signed,
    Path(id): Path<i32>,
) -> AppResult<Json<ChapterJoinRequest>> {
    let conn = &mut pool.get().await?;
    Ok(Json(provisioning::get_request(conn, &caller.scope, id).await?))
}

async fn review(
    pool: DbPool,
    caller: Signed,
    id: i32,
    decision: Decision,
    body: Option<Json<ReviewRequest>>,
) -> AppResult<Json<ReviewOutcome>> {
    let Json(req) = body.unwrap_or_default();
    let conn = &mut pool.get().await?;
    Ok(Json(
        provisioning::review(conn, &caller.scope, id, decision, req.admin_notes).await?,
    ))
}

async fn approve(
    Extension(pool): Extension<DbPool>,
    caller: Signed,
    Path(id): Path<i32>,
    body: Option<Json<ReviewRequest>>,
) -> AppResult<Json<ReviewOutcome>> {
    review(pool, caller, id, Decision::Approve, body).await
}

async fn reject(
    Extension(pool): Extension<DbPool>,
    caller: Signed,
    Path(id): Path<i32>,
    body: Option<Json<ReviewRequest>>,
) -> AppResult<Json<ReviewOutcome>> {
    review(pool, caller, id, Decision::Reject, body).await
}

pub fn app() -> Router {
    Router::new()
        .route("/", get(list).post(submit))
        .route("/:id", get(read))
        .route("/:id/approve", post(approve))
        .route("/:id/reject", post(reject))
}

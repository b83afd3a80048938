use crate::{
    api::{Signed, Viewer},
    error::AppResult,
    models::Member,
    roster::{self, CompleteProfile, MemberDraft, MemberFilter, MemberPatch, MemberWrite},
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
struct ClaimRequest {
    code: String,
}

async fn list(
    Extension(pool): Extension<DbPool>,
    viewer: Viewer,
    Query(filter): Query<MemberFilter>,
) -> AppResult<Json<Vec<Member>>> {
    let conn = &mut pool.get().await?;
    Ok(Json(roster::list_members(conn, &viewer.scope, filter).await?))
}

async fn create(
    Extension(pool): Extension<DbPool>,
    viewer: Viewer,
    Json(draft): Json<MemberDraft>,
) -> AppResult<(StatusCode, Json<MemberWrite>)> {
    let conn = &mut pool.get().await?;
    let created = roster::create_member(conn, &viewer.scope, draft).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn read(
    Extension(pool): Extension<DbPool>,
    viewer: Viewer,
    Path(id): Path<i32>,
) -> AppResult<Json<Member>> {
    let conn = &mut pool.get().await?;
    Ok(Json(roster::get_member(conn, &viewer.scope, id).await?))
}

async fn update(
    Extension(pool): Extension<DbPool>,
    viewer: Viewer,
    Path(id): Path<i32>,
    Json(patch): Json<MemberPatch>,
) -> AppResult<Json<MemberWrite>> {
    let conn = &mut pool.get().await?;
    Ok(Json(roster::update_member(conn, &viewer.scope, id, patch).await?))
}

async fn delete(
    Extension(pool): Extension<DbPool>,
    viewer: Viewer,
    Path(id): Path<i32>,
) -> AppResult<StatusCode> {
    let conn = &mut pool.get().await?;
    roster::delete_member(conn, &viewer.scope, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn claim_membership(
    Extension(pool): Extension<DbPool>,
    caller: Signed,
    Json(req): Json<ClaimRequest>,
) -> AppResult<Json<MemberWrite>> {
    let conn = &mut pool.get().await?;
    Ok(Json(roster::claim_membership(conn, &caller.user, &req.code).await?))
}

async fn complete_profile(
    Extension(pool): Extension<DbPool>,
    viewer: Viewer,
    Path(id): Path<i32>,
) -> AppResult<Json<CompleteProfile>> {
    let conn = &mut pool.get().await?;
    Ok(Json(roster::complete_profile(conn, &viewer.scope, id).await?))
}

async fn issue_claim_code(
    Extension(pool): Extension<DbPool>,
    caller: Signed,
    Path(id): Path<i32>,
) -> AppResult<Json<MemberWrite>> {
    let conn = &mut pool.get().await?;
    Ok(Json(roster::issue_claim_code(conn, &caller.scope, id).await?))
}

pub fn app() -> Router {
    Router::new()
        .route("/", get(list).post(create))
        .route("/claim-membership", post(claim_membership))
        .route("/:id", get(read).patch(update).put(update).delete(delete))
        .route("/:id/complete-profile", get(complete_profile))
        .route("/:id/claim-code", post(issue_claim_code))
}

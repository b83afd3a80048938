use crate::{
    achievements::{self as engine, AchievementSummary, AwardView, TriggerContext},
    api::Signed,
    error::{AppError, AppResult},
    models::{Achievement, UserAchievement},
    schema::*,
    DbPool,
};
use axum::{
    extract::{Path, Query},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use diesel::prelude::*;
use diesel_async::{scoped_futures::ScopedFutureExt, AsyncConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};

async fn list_catalogue(Extension(pool): Extension<DbPool>) -> AppResult<Json<Vec<Achievement>>> {
    let conn = &mut pool.get().await?;
    let catalogue = achievements::table
        .filter(achievements::is_active.eq(true))
        .order((achievements::category, achievements::points, achievements::code))
        .select(Achievement::as_select())
        .load(conn)
        .await?;
    Ok(Json(catalogue))
}

async fn read_achievement(
    Extension(pool): Extension<DbPool>,
    Path(id): Path<i32>,
) -> AppResult<Json<Achievement>> {
    let conn = &mut pool.get().await?;
    achievements::table
        .find(id)
        .filter(achievements::is_active.eq(true))
        .select(Achievement::as_select())
        .first(conn)
        .await
        .optional()?
        .map(Json)
        .ok_or_else(|| AppError::not_found("achievement"))
}

pub fn catalogue_app() -> Router {
    Router::new()
        .route("/", get(list_catalogue))
        .route("/:id", get(read_achievement))
}

#[derive(Deserialize)]
struct AwardFilter {
    user: Option<i32>,
}

#[derive(Deserialize)]
struct AwardRequest {
    user: i32,
    code: String,
}

#[derive(Serialize)]
struct AwardResult {
    #[serde(flatten)]
    award: UserAchievement,
    created: bool,
}

#[derive(Serialize)]
struct CheckResult {
    awarded: Vec<UserAchievement>,
}

/// Whose awards a listing shows. Another user's awards are invisible to a
/// regular caller, so filtering on them matches nothing.
fn listed_owner(caller_id: i32, superuser: bool, requested: Option<i32>) -> Option<i32> {
    match requested {
        None => Some(caller_id),
        Some(user_id) if user_id == caller_id || superuser => Some(user_id),
        Some(_) => None,
    }
}

/// Own awards; superusers may look at anyone's.
async fn list_awards(
    Extension(pool): Extension<DbPool>,
    caller: Signed,
    Query(filter): Query<AwardFilter>,
) -> AppResult<Json<Vec<AwardView>>> {
    let Some(user_id) = listed_owner(caller.user.id, caller.scope.superuser, filter.user) else {
        return Ok(Json(Vec::new()));
    };
    let conn = &mut pool.get().await?;
    Ok(Json(engine::awards_for_user(conn, user_id).await?))
}

async fn read_award(
    Extension(pool): Extension<DbPool>,
    caller: Signed,
    Path(id): Path<i32>,
) -> AppResult<Json<AwardView>> {
    let conn = &mut pool.get().await?;
    let (award, achievement) = user_achievements::table
        .inner_join(achievements::table)
        .filter(user_achievements::id.eq(id))
        .select((UserAchievement::as_select(), Achievement::as_select()))
        .first::<(UserAchievement, Achievement)>(conn)
        .await
        .optional()?
        .filter(|(award, _)| caller.scope.superuser || award.user_id == caller.user.id)
        .ok_or_else(|| AppError::not_found("user achievement"))?;
    Ok(Json(AwardView::new(award, achievement)))
}

async fn my_summary(
    Extension(pool): Extension<DbPool>,
    caller: Signed,
) -> AppResult<Json<AchievementSummary>> {
    let conn = &mut pool.get().await?;
    Ok(Json(engine::summary(conn, caller.user.id).await?))
}

async fn check_achievements(
    Extension(pool): Extension<DbPool>,
    caller: Signed,
) -> AppResult<Json<CheckResult>> {
    let conn = &mut pool.get().await?;
    let context = TriggerContext::new("manual_check");
    let user_id = caller.user.id;
    let awarded = conn
        .transaction(|conn| {
            async move { engine::check_user_achievements(conn, user_id, &context).await }
                .scope_boxed()
        })
        .await?;
    Ok(Json(CheckResult { awarded }))
}

async fn award(
    Extension(pool): Extension<DbPool>,
    caller: Signed,
    Json(req): Json<AwardRequest>,
) -> AppResult<(StatusCode, Json<AwardResult>)> {
    if !caller.scope.superuser {
        return Err(AppError::forbidden());
    }
    let conn = &mut pool.get().await?;
    let context = TriggerContext::new("manual_award");
    let (award, created) = engine::award_by_code(conn, req.user, &req.code, &context).await?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(AwardResult { award, created })))
}

async fn verify(
    Extension(pool): Extension<DbPool>,
    caller: Signed,
    Path(id): Path<i32>,
) -> AppResult<Json<UserAchievement>> {
    if !caller.scope.superuser {
        return Err(AppError::forbidden());
    }
    let conn = &mut pool.get().await?;
    Ok(Json(engine::verify_award(conn, id, caller.user.id).await?))
}

pub fn awards_app() -> Router {
    Router::new()
        .route("/", get(list_awards))
        .route("/my-summary", get(my_summary))
        .route("/check-achievements", post(check_achievements))
        .route("/award", post(award))
        .route("/:id", get(read_award))
        .route("/:id/verify", post(verify))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn award_listing_is_filtered_not_refused() {
        assert_eq!(listed_owner(4, false, None), Some(4));
        assert_eq!(listed_owner(4, false, Some(4)), Some(4));
        assert_eq!(listed_owner(4, false, Some(9)), None);
        assert_eq!(listed_owner(4, true, Some(9)), Some(9));
    }
}

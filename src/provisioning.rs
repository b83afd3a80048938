//! Chapter provisioning.
//!
//! Superusers and admins of the target club create chapters directly.
//! Everyone else files a [`ChapterJoinRequest`] that stays `pending` until a
//! club admin approves or rejects it. Approval materializes the chapter in
//! the same transaction that stamps the review.

use crate::{
    clubs::validate_name,
    error::{AppError, AppResult, ErrorCode, FieldErrors},
    events::{self, DomainEvent},
    models::{Chapter, ChapterJoinRequest, UserAchievement},
    rbac::{ChapterRef, Scope, Target, Verb, Verdict},
    schema::*,
    types::{nullable, JoinRequestStatus},
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{scoped_futures::ScopedFutureExt, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChapterDraft {
    #[serde(rename = "club")]
    pub club_id: i32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub city: Option<String>,
    pub state_id: Option<i32>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(default = "default_true")]
    pub is_public: bool,
    #[serde(default = "default_true")]
    pub accepts_new_members: bool,
    /// Only used when the intent is routed to a join request.
    #[serde(default)]
    pub reason: String,
    pub estimated_members: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JoinRequestDraft {
    #[serde(rename = "club")]
    pub club_id: i32,
    pub chapter_name: String,
    pub city: Option<String>,
    pub state_id: Option<i32>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub reason: String,
    pub estimated_members: Option<i32>,
}

impl From<ChapterDraft> for JoinRequestDraft {
    fn from(draft: ChapterDraft) -> Self {
        JoinRequestDraft {
            club_id: draft.club_id,
            chapter_name: draft.name,
            city: draft.city,
            state_id: draft.state_id,
            description: draft.description,
            reason: draft.reason,
            estimated_members: draft.estimated_members,
        }
    }
}

#[derive(Debug, Default, Deserialize, AsChangeset)]
#[diesel(table_name = chapters)]
pub struct ChapterPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub city: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub state_id: Option<Option<i32>>,
    #[serde(default, deserialize_with = "nullable")]
    pub latitude: Option<Option<f64>>,
    #[serde(default, deserialize_with = "nullable")]
    pub longitude: Option<Option<f64>>,
    pub is_public: Option<bool>,
    pub is_active: Option<bool>,
    pub accepts_new_members: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct,
    Request,
}

/// Where a chapter creation intent goes for this actor.
pub fn route_intent(scope: &Scope, club_id: i32) -> AppResult<Route> {
    scope.require_user()?;
    match scope.authorize(Verb::Create, Target::Chapter(ChapterRef { id: 0, club_id })) {
        Verdict::Allow => Ok(Route::Direct),
        _ => Ok(Route::Request),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

/// The only legal edges are `pending -> approved` and `pending -> rejected`.
pub fn transition(current: JoinRequestStatus, decision: Decision) -> AppResult<JoinRequestStatus> {
    match (current, decision) {
        (JoinRequestStatus::Pending, Decision::Approve) => Ok(JoinRequestStatus::Approved),
        (JoinRequestStatus::Pending, Decision::Reject) => Ok(JoinRequestStatus::Rejected),
        (current, _) => Err(AppError::from(
            ErrorCode::TransitionNotAllowed,
            format!("join request is already {current}"),
        )),
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChapterOutcome {
    Created {
        chapter: Chapter,
        achievements: Vec<UserAchievement>,
    },
    PendingApproval {
        detail: &'static str,
        request: ChapterJoinRequest,
    },
}

#[derive(Debug, Serialize)]
pub struct ReviewOutcome {
    pub request: ChapterJoinRequest,
    pub chapter: Option<Chapter>,
    pub achievements: Vec<UserAchievement>,
}

async fn ensure_chapter_name_free(
    conn: &mut AsyncPgConnection,
    club_id: i32,
    name: &str,
    except: Option<i32>,
) -> AppResult<()> {
    let mut query = chapters::table
        .filter(chapters::club_id.eq(club_id))
        .filter(chapters::name.eq(name))
        .select(chapters::id)
        .into_boxed();
    if let Some(id) = except {
        query = query.filter(chapters::id.ne(id));
    }
    if query.first::<i32>(conn).await.optional()?.is_some() {
        return Err(AppError::from(
            ErrorCode::DuplicateName,
            "a chapter with this name already exists in the club",
        ));
    }
    Ok(())
}

fn validate_coordinates(errors: &mut FieldErrors, latitude: Option<f64>, longitude: Option<f64>) {
    if latitude.map_or(false, |lat| !(-90.0..=90.0).contains(&lat)) {
        errors.add("latitude", "latitude must be between -90 and 90");
    }
    if longitude.map_or(false, |lng| !(-180.0..=180.0).contains(&lng)) {
        errors.add("longitude", "longitude must be between -180 and 180");
    }
}

pub async fn create_chapter_intent(
    conn: &mut AsyncPgConnection,
    scope: &Scope,
    draft: ChapterDraft,
) -> AppResult<ChapterOutcome> {
    let actor = scope.require_user()?;
    let club = crate::clubs::visible(conn, scope, draft.club_id).await?;

    match route_intent(scope, club.id)? {
        Route::Request => {
            let request = submit_join_request(conn, scope, draft.into()).await?;
            Ok(ChapterOutcome::PendingApproval {
                detail: "chapter creation requires approval by a club administrator",
                request,
            })
        }
        Route::Direct => {
            let mut errors = FieldErrors::default();
            validate_name(&mut errors, "name", &draft.name);
            validate_coordinates(&mut errors, draft.latitude, draft.longitude);
            errors.into_result()?;

            let name = draft.name.trim().to_string();
            ensure_chapter_name_free(conn, club.id, &name, None).await?;

            conn.transaction(|conn| {
                async move {
                    let chapter = diesel::insert_into(chapters::table)
                        .values((
                            chapters::club_id.eq(club.id),
                            chapters::name.eq(name),
                            chapters::description.eq(draft.description),
                            chapters::owner_id.eq(actor),
                            chapters::city.eq(draft.city),
                            chapters::state_id.eq(draft.state_id),
                            chapters::latitude.eq(draft.latitude),
                            chapters::longitude.eq(draft.longitude),
                            chapters::is_public.eq(draft.is_public),
                            chapters::accepts_new_members.eq(draft.accepts_new_members),
                        ))
                        .returning(Chapter::as_returning())
                        .get_result(conn)
                        .await
                        .map_err(AppError::from_db)?;

                    let achievements = events::dispatch(
                        conn,
                        DomainEvent::ChapterCreated {
                            chapter: &chapter,
                            creator: Some(actor),
                        },
                    )
                    .await?;

                    tracing::info!(chapter_id = chapter.id, club_id = chapter.club_id, "chapter created");
                    Ok(ChapterOutcome::Created {
                        chapter,
                        achievements,
                    })
                }
                .scope_boxed()
            })
            .await
        }
    }
}

pub async fn submit_join_request(
    conn: &mut AsyncPgConnection,
    scope: &Scope,
    draft: JoinRequestDraft,
) -> AppResult<ChapterJoinRequest> {
    let actor = scope.require_user()?;
    let club = crate::clubs::visible(conn, scope, draft.club_id).await?;
    if !club.accepts_new_chapters {
        return Err(AppError::from(
            ErrorCode::ChaptersClosed,
            "this club is not accepting new chapters",
        ));
    }

    let mut errors = FieldErrors::default();
    validate_name(&mut errors, "chapter_name", &draft.chapter_name);
    if draft.estimated_members.map_or(false, |n| n < 1) {
        errors.add("estimated_members", "ensure this value is greater than or equal to 1");
    }
    errors.into_result()?;

    let request = diesel::insert_into(chapter_join_requests::table)
        .values((
            chapter_join_requests::club_id.eq(club.id),
            chapter_join_requests::requested_by.eq(actor),
            chapter_join_requests::chapter_name.eq(draft.chapter_name.trim()),
            chapter_join_requests::city.eq(draft.city),
            chapter_join_requests::state_id.eq(draft.state_id),
            chapter_join_requests::description.eq(draft.description),
            chapter_join_requests::reason.eq(draft.reason),
            chapter_join_requests::estimated_members.eq(draft.estimated_members),
            chapter_join_requests::status.eq(JoinRequestStatus::Pending),
        ))
        .returning(ChapterJoinRequest::as_returning())
        .get_result(conn)
        .await
        .map_err(AppError::from_db)?;

    tracing::info!(
        request_id = request.id,
        club_id = club.id,
        requested_by = actor,
        "chapter join request submitted"
    );
    Ok(request)
}

fn can_see_request(scope: &Scope, request: &ChapterJoinRequest) -> bool {
    scope.administers_club(request.club_id) || scope.user_id == Some(request.requested_by)
}

pub async fn get_request(
    conn: &mut AsyncPgConnection,
    scope: &Scope,
    request_id: i32,
) -> AppResult<ChapterJoinRequest> {
    let request = chapter_join_requests::table
        .find(request_id)
        .select(ChapterJoinRequest::as_select())
        .first(conn)
        .await
        .optional()?;
    match request {
        Some(request) if can_see_request(scope, &request) => Ok(request),
        _ => Err(AppError::not_found("join request")),
    }
}

/// Requests in clubs the actor administers plus the actor's own requests.
pub async fn list_requests(
    conn: &mut AsyncPgConnection,
    scope: &Scope,
    status: Option<JoinRequestStatus>,
) -> AppResult<Vec<ChapterJoinRequest>> {
    let actor = scope.require_user()?;
    let mut query = chapter_join_requests::table
        .select(ChapterJoinRequest::as_select())
        .into_boxed();
    if !scope.superuser {
        query = query.filter(
            chapter_join_requests::club_id
                .eq_any(scope.club_id_list())
                .or(chapter_join_requests::requested_by.eq(actor)),
        );
    }
    if let Some(status) = status {
        query = query.filter(chapter_join_requests::status.eq(status));
    }
    Ok(query
        .order(chapter_join_requests::created_at.desc())
        .load(conn)
        .await?)
}

/// Approves or rejects a pending request. The row is locked for the whole
/// review so concurrent reviewers serialize.
pub async fn review(
    conn: &mut AsyncPgConnection,
    scope: &Scope,
    request_id: i32,
    decision: Decision,
    admin_notes: Option<String>,
) -> AppResult<ReviewOutcome> {
    let reviewer = scope.require_user()?;

    conn.transaction(|conn| {
        async move {
            let request = chapter_join_requests::table
                .find(request_id)
                .select(ChapterJoinRequest::as_select())
                .for_update()
                .first(conn)
                .await
                .optional()?
                .filter(|r| can_see_request(scope, r))
                .ok_or_else(|| AppError::not_found("join request"))?;
            scope.ensure(
                Verb::Update,
                Target::JoinRequestReview {
                    club_id: request.club_id,
                },
            )?;

            let next = transition(request.status, decision)?;
            let now = Utc::now();

            let chapter = match next {
                JoinRequestStatus::Approved => Some(materialize(conn, &request, now).await?),
                _ => None,
            };

            let request = diesel::update(chapter_join_requests::table.find(request.id))
                .set((
                    chapter_join_requests::status.eq(next),
                    chapter_join_requests::admin_notes.eq(admin_notes),
                    chapter_join_requests::reviewed_by.eq(reviewer),
                    chapter_join_requests::reviewed_at.eq(now),
                    chapter_join_requests::chapter_id.eq(chapter.as_ref().map(|c| c.id)),
                ))
                .returning(ChapterJoinRequest::as_returning())
                .get_result(conn)
                .await?;

            let achievements = match &chapter {
                Some(chapter) => {
                    events::dispatch(
                        conn,
                        DomainEvent::ChapterCreated {
                            chapter,
                            creator: Some(request.requested_by),
                        },
                    )
                    .await?
                }
                None => Vec::new(),
            };

            tracing::info!(
                request_id = request.id,
                status = %request.status,
                reviewer,
                "chapter join request reviewed"
            );
            Ok(ReviewOutcome {
                request,
                chapter,
                achievements,
            })
        }
        .scope_boxed()
    })
    .await
}

/// Creates the chapter for an approved request. Its creation time equals
/// the review time.
async fn materialize(
    conn: &mut AsyncPgConnection,
    request: &ChapterJoinRequest,
    now: DateTime<Utc>,
) -> AppResult<Chapter> {
    ensure_chapter_name_free(conn, request.club_id, &request.chapter_name, None).await?;
    diesel::insert_into(chapters::table)
        .values((
            chapters::club_id.eq(request.club_id),
            chapters::name.eq(&request.chapter_name),
            chapters::description.eq(&request.description),
            chapters::owner_id.eq(request.requested_by),
            chapters::city.eq(&request.city),
            chapters::state_id.eq(request.state_id),
            chapters::is_public.eq(true),
            chapters::accepts_new_members.eq(true),
            chapters::created_at.eq(now),
            chapters::updated_at.eq(now),
        ))
        .returning(Chapter::as_returning())
        .get_result(conn)
        .await
        .map_err(AppError::from_db)
}

/// A chapter plus whether its club is public.
pub async fn find_chapter(
    conn: &mut AsyncPgConnection,
    chapter_id: i32,
) -> AppResult<Option<(Chapter, bool)>> {
    Ok(chapters::table
        .inner_join(clubs::table)
        .filter(chapters::id.eq(chapter_id))
        .select((Chapter::as_select(), clubs::is_public))
        .first(conn)
        .await
        .optional()?)
}

pub async fn visible_chapter(
    conn: &mut AsyncPgConnection,
    scope: &Scope,
    chapter_id: i32,
) -> AppResult<Chapter> {
    match find_chapter(conn, chapter_id).await? {
        Some((chapter, club_is_public)) if scope.can_see_chapter(&chapter, club_is_public) => {
            Ok(chapter)
        }
        _ => Err(AppError::not_found("chapter")),
    }
}

pub async fn list_chapters(
    conn: &mut AsyncPgConnection,
    scope: &Scope,
    club_id: Option<i32>,
) -> AppResult<Vec<Chapter>> {
    let mut query = chapters::table
        .inner_join(clubs::table)
        .select(Chapter::as_select())
        .into_boxed();
    if !scope.superuser {
        query = query.filter(
            chapters::is_public
                .eq(true)
                .and(clubs::is_public.eq(true))
                .or(chapters::club_id.eq_any(scope.club_id_list()))
                .or(chapters::id.eq_any(scope.chapter_id_list())),
        );
    }
    if let Some(club_id) = club_id {
        query = query.filter(chapters::club_id.eq(club_id));
    }
    Ok(query.order((chapters::club_id, chapters::name)).load(conn).await?)
}

pub async fn update_chapter(
    conn: &mut AsyncPgConnection,
    scope: &Scope,
    chapter_id: i32,
    mut patch: ChapterPatch,
) -> AppResult<Chapter> {
    let chapter = visible_chapter(conn, scope, chapter_id).await?;
    scope.ensure(Verb::Update, Target::Chapter((&chapter).into()))?;

    let mut errors = FieldErrors::default();
    if let Some(name) = &patch.name {
        validate_name(&mut errors, "name", name);
    }
    validate_coordinates(&mut errors, patch.latitude.flatten(), patch.longitude.flatten());
    errors.into_result()?;

    if let Some(name) = patch.name.as_mut() {
        *name = name.trim().to_string();
        ensure_chapter_name_free(conn, chapter.club_id, name, Some(chapter.id)).await?;
    }

    conn.transaction(|conn| {
        async move {
            let updated = diesel::update(chapters::table.find(chapter.id))
                .set((&patch, chapters::updated_at.eq(Utc::now())))
                .returning(Chapter::as_returning())
                .get_result(conn)
                .await
                .map_err(AppError::from_db)?;
            if patch.is_active.is_some() {
                events::dispatch(
                    conn,
                    DomainEvent::ChapterChanged {
                        club_id: updated.club_id,
                    },
                )
                .await?;
            }
            Ok(updated)
        }
        .scope_boxed()
    })
    .await
}

pub async fn delete_chapter(
    conn: &mut AsyncPgConnection,
    scope: &Scope,
    chapter_id: i32,
) -> AppResult<()> {
    let chapter = visible_chapter(conn, scope, chapter_id).await?;
    scope.ensure(Verb::Delete, Target::Chapter((&chapter).into()))?;

    conn.transaction(|conn| {
        async move {
            diesel::delete(chapters::table.find(chapter.id))
                .execute(conn)
                .await?;
            events::dispatch(
                conn,
                DomainEvent::ChapterChanged {
                    club_id: chapter.club_id,
                },
            )
            .await?;
            tracing::info!(chapter_id = chapter.id, "chapter deleted");
            Ok(())
        }
        .scope_boxed()
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_pending_requests_move() {
        assert_eq!(
            transition(JoinRequestStatus::Pending, Decision::Approve).unwrap(),
            JoinRequestStatus::Approved
        );
        assert_eq!(
            transition(JoinRequestStatus::Pending, Decision::Reject).unwrap(),
            JoinRequestStatus::Rejected
        );
        for status in [JoinRequestStatus::Approved, JoinRequestStatus::Rejected] {
            for decision in [Decision::Approve, Decision::Reject] {
                let err = transition(status, decision).unwrap_err();
                assert_eq!(err.code(), ErrorCode::TransitionNotAllowed);
            }
        }
    }

    #[test]
    fn routing_by_tier() {
        let mut admin = Scope {
            user_id: Some(1),
            ..Scope::default()
        };
        admin.club_ids.insert(7);
        assert_eq!(route_intent(&admin, 7).unwrap(), Route::Direct);
        assert_eq!(route_intent(&admin, 8).unwrap(), Route::Request);

        let superuser = Scope {
            user_id: Some(2),
            superuser: true,
            ..Scope::default()
        };
        assert_eq!(route_intent(&superuser, 8).unwrap(), Route::Direct);

        let mut chapter_admin = Scope {
            user_id: Some(3),
            ..Scope::default()
        };
        chapter_admin.chapter_ids.insert(70);
        assert_eq!(route_intent(&chapter_admin, 7).unwrap(), Route::Request);

        let err = route_intent(&Scope::anonymous(), 7).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unauthenticated);
    }

    #[test]
    fn chapter_draft_becomes_a_request() {
        let draft: ChapterDraft = serde_json::from_value(json!({
            "club": 4,
            "name": "Bay Chapter",
            "city": "Oakland",
            "reason": "we ride here",
        }))
        .unwrap();
        assert!(draft.is_public);
        let request = JoinRequestDraft::from(draft);
        assert_eq!(request.club_id, 4);
        assert_eq!(request.chapter_name, "Bay Chapter");
        assert_eq!(request.city.as_deref(), Some("Oakland"));
        assert_eq!(request.reason, "we ride here");
    }

    #[test]
    fn coordinates_are_range_checked() {
        let mut errors = FieldErrors::default();
        validate_coordinates(&mut errors, Some(91.0), Some(-181.0));
        assert!(errors.get("latitude").is_some());
        assert!(errors.get("longitude").is_some());

        let mut errors = FieldErrors::default();
        validate_coordinates(&mut errors, Some(37.8), Some(-122.3));
        validate_coordinates(&mut errors, None, None);
        assert!(errors.is_empty());
    }

    #[test]
    fn pending_outcome_is_tagged() {
        let request = ChapterJoinRequest {
            id: 3,
            club_id: 1,
            requested_by: 2,
            chapter_name: "Bay Chapter".to_string(),
            city: None,
            state_id: None,
            description: String::new(),
            reason: String::new(),
            estimated_members: None,
            status: JoinRequestStatus::Pending,
            admin_notes: None,
            reviewed_by: None,
            chapter_id: None,
            created_at: Utc::now(),
            reviewed_at: None,
        };
        let body = serde_json::to_value(ChapterOutcome::PendingApproval {
            detail: "pending",
            request,
        })
        .unwrap();
        assert_eq!(body["outcome"], "pending_approval");
        assert_eq!(body["request"]["id"], 3);
        assert_eq!(body["request"]["status"], "pending");
    }
}

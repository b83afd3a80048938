//! ClubAdmin and ChapterAdmin assignments.

use crate::{
    clubs,
    error::{AppError, AppResult, ErrorCode},
    events::{self, DomainEvent},
    models::{ChapterAdmin, ClubAdmin, UserAchievement},
    provisioning,
    rbac::{ChapterRef, Scope, Target, Verb},
    schema::*,
};
use diesel::prelude::*;
use diesel_async::{scoped_futures::ScopedFutureExt, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct ClubAdminDraft {
    pub user: i32,
    pub club: i32,
}

#[derive(Debug, Deserialize)]
pub struct ChapterAdminDraft {
    pub user: i32,
    pub chapter: i32,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct AssignmentFilter {
    pub club: Option<i32>,
    pub chapter: Option<i32>,
    pub user: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct Assigned<T> {
    #[serde(flatten)]
    pub assignment: T,
    pub achievements: Vec<UserAchievement>,
}

fn duplicate() -> AppError {
    AppError::from(
        ErrorCode::DuplicateAdminAssignment,
        "this user already holds this assignment",
    )
}

async fn ensure_user_exists(conn: &mut AsyncPgConnection, user_id: i32) -> AppResult<()> {
    let exists = diesel::select(diesel::dsl::exists(users::table.find(user_id)))
        .get_result::<bool>(conn)
        .await?;
    if exists {
        Ok(())
    } else {
        Err(AppError::field("user", "referenced object does not exist"))
    }
}

pub async fn assign_club_admin(
    conn: &mut AsyncPgConnection,
    scope: &Scope,
    draft: ClubAdminDraft,
) -> AppResult<Assigned<ClubAdmin>> {
    let actor = scope.require_user()?;
    let club = clubs::visible(conn, scope, draft.club).await?;
    scope.ensure(
        Verb::Create,
        Target::ClubAdmin {
            club_id: club.id,
            user_id: draft.user,
        },
    )?;
    ensure_user_exists(conn, draft.user).await?;

    let held = club_admins::table
        .filter(club_admins::user_id.eq(draft.user))
        .filter(club_admins::club_id.eq(club.id))
        .select(club_admins::id)
        .first::<i32>(conn)
        .await
        .optional()?;
    if held.is_some() {
        return Err(duplicate());
    }

    conn.transaction(|conn| {
        async move {
            let assignment = diesel::insert_into(club_admins::table)
                .values((
                    club_admins::user_id.eq(draft.user),
                    club_admins::club_id.eq(club.id),
                    club_admins::created_by.eq(actor),
                ))
                .returning(ClubAdmin::as_returning())
                .get_result(conn)
                .await
                .map_err(AppError::from_db)?;
            let achievements =
                events::dispatch(conn, DomainEvent::ClubAdminAssigned(&assignment)).await?;

            tracing::info!(user_id = assignment.user_id, club_id = assignment.club_id, "club admin assigned");
            Ok(Assigned {
                assignment,
                achievements,
            })
        }
        .scope_boxed()
    })
    .await
}

pub async fn list_club_admins(
    conn: &mut AsyncPgConnection,
    scope: &Scope,
    filter: AssignmentFilter,
) -> AppResult<Vec<ClubAdmin>> {
    scope.require_user()?;
    let mut query = club_admins::table
        .select(ClubAdmin::as_select())
        .into_boxed();
    if !scope.superuser {
        query = query.filter(club_admins::club_id.eq_any(scope.club_id_list()));
    }
    if let Some(club_id) = filter.club {
        query = query.filter(club_admins::club_id.eq(club_id));
    }
    if let Some(user_id) = filter.user {
        query = query.filter(club_admins::user_id.eq(user_id));
    }
    Ok(query.order(club_admins::id).load(conn).await?)
}

pub async fn get_club_admin(conn: &mut AsyncPgConnection, scope: &Scope, id: i32) -> AppResult<ClubAdmin> {
    club_admins::table
        .find(id)
        .select(ClubAdmin::as_select())
        .first(conn)
        .await
        .optional()?
        .filter(|assignment: &ClubAdmin| scope.administers_club(assignment.club_id))
        .ok_or_else(|| AppError::not_found("club admin"))
}

pub async fn revoke_club_admin(conn: &mut AsyncPgConnection, scope: &Scope, id: i32) -> AppResult<()> {
    let assignment = get_club_admin(conn, scope, id).await?;
    scope.ensure(
        Verb::Delete,
        Target::ClubAdmin {
            club_id: assignment.club_id,
            user_id: assignment.user_id,
        },
    )?;
    diesel::delete(club_admins::table.find(assignment.id))
        .execute(conn)
        .await?;
    tracing::info!(user_id = assignment.user_id, club_id = assignment.club_id, "club admin revoked");
    Ok(())
}

pub async fn assign_chapter_admin(
    conn: &mut AsyncPgConnection,
    scope: &Scope,
    draft: ChapterAdminDraft,
) -> AppResult<Assigned<ChapterAdmin>> {
    let actor = scope.require_user()?;
    let chapter = provisioning::visible_chapter(conn, scope, draft.chapter).await?;
    scope.ensure(Verb::Create, Target::ChapterAdmin((&chapter).into()))?;
    ensure_user_exists(conn, draft.user).await?;

    let held = chapter_admins::table
        .filter(chapter_admins::user_id.eq(draft.user))
        .filter(chapter_admins::chapter_id.eq(chapter.id))
        .select(chapter_admins::id)
        .first::<i32>(conn)
        .await
        .optional()?;
    if held.is_some() {
        return Err(duplicate());
    }

    conn.transaction(|conn| {
        async move {
            let assignment = diesel::insert_into(chapter_admins::table)
                .values((
                    chapter_admins::user_id.eq(draft.user),
                    chapter_admins::chapter_id.eq(chapter.id),
                    chapter_admins::created_by.eq(actor),
                ))
                .returning(ChapterAdmin::as_returning())
                .get_result(conn)
                .await
                .map_err(AppError::from_db)?;
            let achievements = events::dispatch(
                conn,
                DomainEvent::ChapterAdminAssigned {
                    assignment: &assignment,
                    club_id: chapter.club_id,
                },
            )
            .await?;

            tracing::info!(
                user_id = assignment.user_id,
                chapter_id = assignment.chapter_id,
                "chapter admin assigned"
            );
            Ok(Assigned {
                assignment,
                achievements,
            })
        }
        .scope_boxed()
    })
    .await
}

/// Chapter assignments visible to the caller: those of their clubs and of
/// chapters they administer themselves.
pub async fn list_chapter_admins(
    conn: &mut AsyncPgConnection,
    scope: &Scope,
    filter: AssignmentFilter,
) -> AppResult<Vec<ChapterAdmin>> {
    scope.require_user()?;
    let mut query = chapter_admins::table
        .inner_join(chapters::table)
        .select(ChapterAdmin::as_select())
        .into_boxed();
    if !scope.superuser {
        query = query.filter(
            chapters::club_id
                .eq_any(scope.club_id_list())
                .or(chapters::id.eq_any(scope.chapter_id_list())),
        );
    }
    if let Some(club_id) = filter.club {
        query = query.filter(chapters::club_id.eq(club_id));
    }
    if let Some(chapter_id) = filter.chapter {
        query = query.filter(chapter_admins::chapter_id.eq(chapter_id));
    }
    if let Some(user_id) = filter.user {
        query = query.filter(chapter_admins::user_id.eq(user_id));
    }
    Ok(query.order(chapter_admins::id).load(conn).await?)
}

async fn chapter_assignment(
    conn: &mut AsyncPgConnection,
    scope: &Scope,
    id: i32,
) -> AppResult<(ChapterAdmin, ChapterRef)> {
    chapter_admins::table
        .inner_join(chapters::table)
        .filter(chapter_admins::id.eq(id))
        .select((ChapterAdmin::as_select(), chapters::club_id))
        .first::<(ChapterAdmin, i32)>(conn)
        .await
        .optional()?
        .map(|(assignment, club_id)| {
            let chapter = ChapterRef {
                id: assignment.chapter_id,
                club_id,
            };
            (assignment, chapter)
        })
        .filter(|(_, chapter)| scope.administers_chapter(*chapter))
        .ok_or_else(|| AppError::not_found("chapter admin"))
}

pub async fn get_chapter_admin(
    conn: &mut AsyncPgConnection,
    scope: &Scope,
    id: i32,
) -> AppResult<ChapterAdmin> {
    Ok(chapter_assignment(conn, scope, id).await?.0)
}

pub async fn revoke_chapter_admin(conn: &mut AsyncPgConnection, scope: &Scope, id: i32) -> AppResult<()> {
    let (assignment, chapter) = chapter_assignment(conn, scope, id).await?;
    scope.ensure(Verb::Delete, Target::ChapterAdmin(chapter))?;
    diesel::delete(chapter_admins::table.find(assignment.id))
        .execute(conn)
        .await?;
    tracing::info!(
        user_id = assignment.user_id,
        chapter_id = assignment.chapter_id,
        "chapter admin revoked"
    );
    Ok(())
}

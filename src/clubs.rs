//! Club lifecycle. Creating a club bootstraps its founder: a ClubAdmin row,
//! a default chapter and a president roster entry, all in one transaction.

use crate::{
    error::{AppError, AppResult, ErrorCode, FieldErrors},
    events::{self, DomainEvent},
    models::{lower, Chapter, Club, Member, User, UserAchievement},
    rbac::{Scope, Target, Verb},
    schema::*,
    types::{nullable, ClubType, MemberRole, MemberType},
};
use chrono::{NaiveDate, Utc};
use diesel::prelude::*;
use diesel_async::{scoped_futures::ScopedFutureExt, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const DEFAULT_CHAPTER_NAME: &str = "Main Chapter";
const MAX_NAME_LEN: usize = 100;

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct ClubDraft {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub foundation_date: Option<NaiveDate>,
    pub logo_url: Option<String>,
    #[serde(default = "default_true")]
    pub is_public: bool,
    #[serde(default = "default_true")]
    pub accepts_new_chapters: bool,
    #[serde(default)]
    pub club_type: ClubType,
    pub country_id: Option<i32>,
    pub state_id: Option<i32>,
}

#[derive(Debug, Default, Deserialize, AsChangeset)]
#[diesel(table_name = clubs)]
pub struct ClubPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub foundation_date: Option<Option<NaiveDate>>,
    #[serde(default, deserialize_with = "nullable")]
    pub logo_url: Option<Option<String>>,
    pub is_public: Option<bool>,
    pub accepts_new_chapters: Option<bool>,
    pub club_type: Option<ClubType>,
    #[serde(default, deserialize_with = "nullable")]
    pub country_id: Option<Option<i32>>,
    #[serde(default, deserialize_with = "nullable")]
    pub state_id: Option<Option<i32>>,
}

#[derive(Debug, Serialize)]
pub struct FoundedClub {
    #[serde(flatten)]
    pub club: Club,
    pub default_chapter: Chapter,
    pub founder_member: Member,
    pub achievements: Vec<UserAchievement>,
}

pub(crate) fn validate_name(errors: &mut FieldErrors, field: &str, name: &str) {
    let name = name.trim();
    if name.is_empty() {
        errors.add(field, "this field may not be blank");
    } else if name.chars().count() > MAX_NAME_LEN {
        errors.add(field, format!("ensure this field has no more than {MAX_NAME_LEN} characters"));
    }
}

pub(crate) fn validate_url(errors: &mut FieldErrors, field: &str, value: Option<&str>) {
    if let Some(value) = value.filter(|v| !v.is_empty()) {
        if url::Url::parse(value).is_err() {
            errors.add(field, "enter a valid URL");
        }
    }
}

/// A state, when given together with a country, must belong to it.
pub(crate) async fn check_location(
    conn: &mut AsyncPgConnection,
    errors: &mut FieldErrors,
    country_id: Option<i32>,
    state_id: Option<i32>,
) -> AppResult<()> {
    if let (Some(country_id), Some(state_id)) = (country_id, state_id) {
        let state_country = states::table
            .find(state_id)
            .select(states::country_id)
            .first::<i32>(conn)
            .await
            .optional()?;
        match state_country {
            None => errors.add("state", "referenced object does not exist"),
            Some(owner) if owner != country_id => {
                errors.add("state", "state does not belong to the selected country")
            }
            Some(_) => {}
        }
    }
    Ok(())
}

async fn ensure_name_free(
    conn: &mut AsyncPgConnection,
    name: &str,
    except: Option<i32>,
) -> AppResult<()> {
    let mut query = clubs::table
        .filter(lower(clubs::name).eq(name.to_lowercase()))
        .select(clubs::id)
        .into_boxed();
    if let Some(id) = except {
        query = query.filter(clubs::id.ne(id));
    }
    if query.first::<i32>(conn).await.optional()?.is_some() {
        return Err(AppError::from(
            ErrorCode::DuplicateClubName,
            "a club with this name already exists",
        ));
    }
    Ok(())
}

pub async fn find(conn: &mut AsyncPgConnection, club_id: i32) -> AppResult<Option<Club>> {
    Ok(clubs::table
        .find(club_id)
        .select(Club::as_select())
        .first(conn)
        .await
        .optional()?)
}

/// Loads a club the scope may see; hidden and missing clubs look the same.
pub async fn visible(conn: &mut AsyncPgConnection, scope: &Scope, club_id: i32) -> AppResult<Club> {
    match find(conn, club_id).await? {
        Some(club) if scope.can_see_club(&club) => Ok(club),
        _ => Err(AppError::not_found("club")),
    }
}

pub async fn list_visible(conn: &mut AsyncPgConnection, scope: &Scope) -> AppResult<Vec<Club>> {
    let mut query = clubs::table.select(Club::as_select()).into_boxed();
    if !scope.superuser {
        query = query.filter(clubs::is_public.eq(true).or(clubs::id.eq_any(scope.club_id_list())));
    }
    Ok(query.order(clubs::name).load(conn).await?)
}

pub async fn create_club(
    conn: &mut AsyncPgConnection,
    founder: &User,
    draft: ClubDraft,
) -> AppResult<FoundedClub> {
    let mut errors = FieldErrors::default();
    validate_name(&mut errors, "name", &draft.name);
    validate_url(&mut errors, "logo_url", draft.logo_url.as_deref());
    check_location(conn, &mut errors, draft.country_id, draft.state_id).await?;
    errors.into_result()?;

    let name = draft.name.trim().to_string();
    ensure_name_free(conn, &name, None).await?;

    conn.transaction(|conn| {
        async move {
            #[derive(Insertable)]
            #[diesel(table_name = clubs)]
            struct NewClub {
                name: String,
                description: String,
                foundation_date: Option<NaiveDate>,
                logo_url: Option<String>,
                is_public: bool,
                accepts_new_chapters: bool,
                club_type: ClubType,
                country_id: Option<i32>,
                state_id: Option<i32>,
            }

            let club = diesel::insert_into(clubs::table)
                .values(NewClub {
                    name,
                    description: draft.description,
                    foundation_date: draft.foundation_date,
                    logo_url: draft.logo_url.filter(|u| !u.is_empty()),
                    is_public: draft.is_public,
                    accepts_new_chapters: draft.accepts_new_chapters,
                    club_type: draft.club_type,
                    country_id: draft.country_id,
                    state_id: draft.state_id,
                })
                .returning(Club::as_returning())
                .get_result(conn)
                .await
                .map_err(AppError::from_db)?;

            diesel::insert_into(club_admins::table)
                .values((
                    club_admins::user_id.eq(founder.id),
                    club_admins::club_id.eq(club.id),
                    club_admins::created_by.eq(founder.id),
                ))
                .execute(conn)
                .await
                .map_err(AppError::from_db)?;

            let chapter = diesel::insert_into(chapters::table)
                .values((
                    chapters::club_id.eq(club.id),
                    chapters::name.eq(DEFAULT_CHAPTER_NAME),
                    chapters::description.eq(format!("Default chapter of {}", club.name)),
                    chapters::owner_id.eq(founder.id),
                    chapters::state_id.eq(club.state_id),
                    chapters::is_public.eq(true),
                    chapters::accepts_new_members.eq(true),
                ))
                .returning(Chapter::as_returning())
                .get_result(conn)
                .await
                .map_err(AppError::from_db)?;

            let last_name = Some(founder.last_name.trim())
                .filter(|n| !n.is_empty())
                .map(str::to_string);
            let member = diesel::insert_into(members::table)
                .values((
                    members::chapter_id.eq(chapter.id),
                    members::user_id.eq(founder.id),
                    members::first_name.eq(founder.display_first_name()),
                    members::last_name.eq(last_name),
                    members::role.eq(MemberRole::President),
                    members::member_type.eq(MemberType::Pilot),
                    members::metadata.eq(json!({})),
                ))
                .returning(Member::as_returning())
                .get_result(conn)
                .await
                .map_err(AppError::from_db)?;

            let achievements = events::dispatch(
                conn,
                DomainEvent::ClubFounded {
                    club: &club,
                    chapter: &chapter,
                    founder: &member,
                },
            )
            .await?;

            // counters were refreshed by the dispatch
            let club = find(conn, club.id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("club vanished inside its own transaction"))?;

            tracing::info!(club_id = club.id, founder = founder.id, "club founded");
            Ok(FoundedClub {
                club,
                default_chapter: chapter,
                founder_member: member,
                achievements,
            })
        }
        .scope_boxed()
    })
    .await
}

pub async fn update_club(
    conn: &mut AsyncPgConnection,
    scope: &Scope,
    club_id: i32,
    mut patch: ClubPatch,
) -> AppResult<Club> {
    let club = visible(conn, scope, club_id).await?;
    scope.ensure(Verb::Update, Target::Club(club.id))?;

    let mut errors = FieldErrors::default();
    if let Some(name) = &patch.name {
        validate_name(&mut errors, "name", name);
    }
    validate_url(&mut errors, "logo_url", patch.logo_url.as_ref().and_then(Option::as_deref));
    check_location(
        conn,
        &mut errors,
        patch.country_id.unwrap_or(club.country_id),
        patch.state_id.unwrap_or(club.state_id),
    )
    .await?;
    errors.into_result()?;

    if let Some(name) = patch.name.as_mut() {
        *name = name.trim().to_string();
        ensure_name_free(conn, name, Some(club.id)).await?;
    }

    let updated = diesel::update(clubs::table.find(club.id))
        .set((&patch, clubs::updated_at.eq(Utc::now())))
        .returning(Club::as_returning())
        .get_result(conn)
        .await
        .map_err(AppError::from_db)?;
    Ok(updated)
}

pub async fn delete_club(conn: &mut AsyncPgConnection, scope: &Scope, club_id: i32) -> AppResult<()> {
    let club = visible(conn, scope, club_id).await?;
    scope.ensure(Verb::Delete, Target::Club(club.id))?;

    diesel::delete(clubs::table.find(club.id)).execute(conn).await?;
    tracing::info!(club_id, "club deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_defaults() {
        let draft: ClubDraft = serde_json::from_value(json!({"name": "Desert Riders MC"})).unwrap();
        assert!(draft.is_public);
        assert!(draft.accepts_new_chapters);
        assert_eq!(draft.club_type, ClubType::MotorcycleClub);
        assert_eq!(draft.description, "");
        assert_eq!(draft.country_id, None);
    }

    #[test]
    fn unknown_club_type_is_rejected() {
        let err = serde_json::from_value::<ClubDraft>(json!({"name": "X", "club_type": "gang"}));
        assert!(err.is_err());
    }

    #[test]
    fn name_validation() {
        let mut errors = FieldErrors::default();
        validate_name(&mut errors, "name", "   ");
        validate_name(&mut errors, "other", &"x".repeat(MAX_NAME_LEN + 1));
        validate_name(&mut errors, "fine", "Desert Riders MC");
        assert_eq!(errors.get("name").map(<[String]>::len), Some(1));
        assert_eq!(errors.get("other").map(<[String]>::len), Some(1));
        assert!(errors.get("fine").is_none());
    }

    #[test]
    fn url_validation_ignores_empty_values() {
        let mut errors = FieldErrors::default();
        validate_url(&mut errors, "logo_url", Some(""));
        validate_url(&mut errors, "logo_url", None);
        assert!(errors.is_empty());
        validate_url(&mut errors, "logo_url", Some("not a url"));
        validate_url(&mut errors, "ok", Some("https://cdn.example.com/logo.png"));
        assert!(errors.get("logo_url").is_some());
        assert!(errors.get("ok").is_none());
    }
}

//! Chapter rosters: member writes, duplicate checks, copilot links, claim
//! codes and the claim flow.
//!
//! The unique indexes on `members` are authoritative. The pre-checks here
//! only exist to answer with a precise error before touching the store.

use crate::{
    error::{AppError, AppResult, ErrorCode, FieldErrors},
    events::{self, DomainEvent},
    models::{coalesce, lower, Chapter, Club, Member, User, UserAchievement},
    provisioning,
    rbac::{ChapterRef, Scope, Target, Verb, Verdict},
    schema::*,
    types::{nullable, MemberProfile, MemberRole, MemberType},
};
use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use diesel_async::{scoped_futures::ScopedFutureExt, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use itertools::Itertools;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const CLAIM_CODE_LEN: usize = 8;
const CLAIM_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const CLAIM_CODE_ATTEMPTS: usize = 10;
const MAX_NAME_LEN: usize = 50;

/// Accepts a user id, a numeric string, `null`, or an empty string. Empty
/// and absent values mean "no user".
pub fn deserialize_user<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawUser {
        Id(i32),
        Text(String),
    }

    match Option::<RawUser>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawUser::Id(id)) => Ok(Some(id)),
        Some(RawUser::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(RawUser::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("`{text}` is not a valid user id"))),
    }
}

/// Patch flavour of [`deserialize_user`]: absent stays `None`, an explicit
/// null or empty string becomes `Some(None)`.
fn deserialize_user_patch<'de, D>(deserializer: D) -> Result<Option<Option<i32>>, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_user(deserializer).map(Some)
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemberDraft {
    #[serde(rename = "chapter")]
    pub chapter_id: i32,
    #[serde(default, deserialize_with = "deserialize_user")]
    pub user: Option<i32>,
    pub first_name: String,
    pub last_name: Option<String>,
    pub nickname: Option<String>,
    #[serde(default)]
    pub role: MemberRole,
    pub national_role: Option<MemberRole>,
    pub member_type: Option<MemberType>,
    pub is_vested: Option<bool>,
    pub linked_to: Option<i32>,
    pub profile_picture_url: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub metadata: Option<Value>,
    #[serde(default)]
    pub generate_claim_code: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemberPatch {
    #[serde(rename = "chapter")]
    pub chapter_id: Option<i32>,
    #[serde(default, deserialize_with = "deserialize_user_patch")]
    pub user: Option<Option<i32>>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub nickname: Option<String>,
    pub role: Option<MemberRole>,
    #[serde(default, deserialize_with = "nullable")]
    pub national_role: Option<Option<MemberRole>>,
    pub member_type: Option<MemberType>,
    pub is_vested: Option<bool>,
    pub linked_to: Option<i32>,
    pub profile_picture_url: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub date_of_birth: Option<Option<NaiveDate>>,
    pub is_active: Option<bool>,
    pub metadata: Option<Value>,
}

impl MemberPatch {
    /// Fields only chapter administrators may change.
    fn touches_privileged_fields(&self, member: &Member) -> bool {
        self.chapter_id.map_or(false, |c| c != member.chapter_id)
            || self.role.map_or(false, |r| r != member.role)
            || self.national_role.map_or(false, |r| r != member.national_role)
            || self.user.map_or(false, |u| u != member.user_id)
            || self.is_active.map_or(false, |a| a != member.is_active)
    }
}

/// Every writable column, fully resolved.
#[derive(Debug, Clone, Insertable, AsChangeset)]
#[diesel(table_name = members, treat_none_as_null = true)]
struct MemberRow {
    chapter_id: i32,
    user_id: Option<i32>,
    first_name: String,
    last_name: Option<String>,
    nickname: Option<String>,
    role: MemberRole,
    national_role: Option<MemberRole>,
    member_type: MemberType,
    profile_picture_url: Option<String>,
    date_of_birth: Option<NaiveDate>,
    claim_code: Option<String>,
    is_active: bool,
    metadata: Value,
    updated_at: DateTime<Utc>,
}

/// Result of a member write. The claim code is only echoed to the chapter
/// administrator who created or reissued it.
#[derive(Debug, Serialize)]
pub struct MemberWrite {
    #[serde(flatten)]
    pub member: Member,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_code: Option<String>,
    pub achievements: Vec<UserAchievement>,
}

pub fn generate_claim_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..CLAIM_CODE_LEN)
        .map(|_| char::from(CLAIM_CODE_ALPHABET[rng.gen_range(0..CLAIM_CODE_ALPHABET.len())]))
        .collect()
}

/// Uppercases and checks the shape of a presented code.
pub fn normalize_claim_code(code: &str) -> Option<String> {
    let code = code.trim().to_ascii_uppercase();
    (code.len() == CLAIM_CODE_LEN && code.bytes().all(|b| CLAIM_CODE_ALPHABET.contains(&b)))
        .then_some(code)
}

fn blank_to_none(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn validate_row(row: &MemberRow, now: DateTime<Utc>) -> AppResult<()> {
    let mut errors = FieldErrors::default();
    if row.first_name.is_empty() {
        errors.add("first_name", "this field may not be blank");
    } else if row.first_name.chars().count() > MAX_NAME_LEN {
        errors.add("first_name", format!("ensure this field has no more than {MAX_NAME_LEN} characters"));
    }
    if row.last_name.as_ref().map_or(false, |n| n.chars().count() > MAX_NAME_LEN) {
        errors.add("last_name", format!("ensure this field has no more than {MAX_NAME_LEN} characters"));
    }
    if row.date_of_birth.map_or(false, |dob| dob > now.date_naive()) {
        errors.add("date_of_birth", "date of birth cannot be in the future");
    }
    crate::clubs::validate_url(&mut errors, "profile_picture_url", row.profile_picture_url.as_deref());
    if !row.metadata.is_object() {
        errors.add("metadata", "expected a JSON object");
    }
    errors.into_result()
}

/// Combines a requested member type with copilot fields, falling back to
/// what the member already has.
pub fn resolve_profile(
    member_type: MemberType,
    is_vested: Option<bool>,
    linked_to: Option<i32>,
    current: Option<&MemberProfile>,
) -> MemberProfile {
    match member_type {
        MemberType::Pilot => MemberProfile::Pilot,
        MemberType::Prospect => MemberProfile::Prospect,
        MemberType::Copilot => {
            let (current_vested, current_link) = match current {
                Some(MemberProfile::Copilot {
                    is_vested,
                    linked_to,
                }) => (*is_vested, *linked_to),
                _ => (false, None),
            };
            MemberProfile::Copilot {
                is_vested: is_vested.unwrap_or(current_vested),
                linked_to: linked_to.or(current_link),
            }
        }
    }
}

/// A copilot may only ride with an active pilot of the same chapter.
async fn check_copilot_link(
    conn: &mut AsyncPgConnection,
    chapter_id: i32,
    member_id: Option<i32>,
    profile: &MemberProfile,
) -> AppResult<()> {
    let Some(pilot_id) = profile.linked_pilot() else {
        return Ok(());
    };
    let invalid = || {
        AppError::from(
            ErrorCode::InvalidCopilotLink,
            "linked_to must reference an active pilot in the same chapter",
        )
    };
    if Some(pilot_id) == member_id {
        return Err(invalid());
    }
    let pilot = members::table
        .find(pilot_id)
        .select((members::chapter_id, members::member_type, members::is_active))
        .first::<(i32, MemberType, bool)>(conn)
        .await
        .optional()?;
    match pilot {
        Some((pilot_chapter, MemberType::Pilot, true)) if pilot_chapter == chapter_id => Ok(()),
        _ => Err(invalid()),
    }
}

async fn ensure_name_free(
    conn: &mut AsyncPgConnection,
    chapter_id: i32,
    first_name: &str,
    last_name: Option<&str>,
    except: Option<i32>,
) -> AppResult<()> {
    let mut query = members::table
        .filter(members::chapter_id.eq(chapter_id))
        .filter(members::is_active.eq(true))
        .filter(lower(members::first_name).eq(first_name.to_lowercase()))
        .filter(lower(coalesce(members::last_name, "")).eq(last_name.unwrap_or("").to_lowercase()))
        .select(members::id)
        .into_boxed();
    if let Some(id) = except {
        query = query.filter(members::id.ne(id));
    }
    if query.first::<i32>(conn).await.optional()?.is_some() {
        return Err(AppError::from(
            ErrorCode::DuplicateMemberName,
            "an active member with this name already exists in the chapter",
        ));
    }
    Ok(())
}

async fn ensure_user_free(
    conn: &mut AsyncPgConnection,
    chapter_id: i32,
    user_id: i32,
    except: Option<i32>,
) -> AppResult<()> {
    let mut query = members::table
        .filter(members::chapter_id.eq(chapter_id))
        .filter(members::user_id.eq(user_id))
        .select(members::id)
        .into_boxed();
    if let Some(id) = except {
        query = query.filter(members::id.ne(id));
    }
    if query.first::<i32>(conn).await.optional()?.is_some() {
        return Err(AppError::from(
            ErrorCode::DuplicateMembership,
            "this user is already a member of the chapter",
        ));
    }
    Ok(())
}

async fn check_uniqueness(
    conn: &mut AsyncPgConnection,
    row: &MemberRow,
    except: Option<i32>,
) -> AppResult<()> {
    if row.is_active {
        ensure_name_free(conn, row.chapter_id, &row.first_name, row.last_name.as_deref(), except)
            .await?;
    }
    if let Some(user_id) = row.user_id {
        ensure_user_free(conn, row.chapter_id, user_id, except).await?;
    }
    Ok(())
}

/// A claim code no member holds or has consumed. Bounded retries.
pub async fn fresh_claim_code(conn: &mut AsyncPgConnection) -> AppResult<String> {
    for _ in 0..CLAIM_CODE_ATTEMPTS {
        let code = generate_claim_code(&mut rand::thread_rng());
        let taken = diesel::select(diesel::dsl::exists(
            members::table.filter(
                members::claim_code
                    .eq(&code)
                    .or(members::claimed_code.eq(&code)),
            ),
        ))
        .get_result::<bool>(conn)
        .await?;
        if !taken {
            return Ok(code);
        }
        tracing::debug!("claim code collision, retrying");
    }
    Err(anyhow::anyhow!("could not generate a unique claim code after {CLAIM_CODE_ATTEMPTS} attempts").into())
}

async fn chapter_club(conn: &mut AsyncPgConnection, chapter_id: i32) -> AppResult<i32> {
    Ok(chapters::table
        .find(chapter_id)
        .select(chapters::club_id)
        .first::<i32>(conn)
        .await?)
}

/// A member plus its chapter and whether the club is public.
async fn find_with_chapter(
    conn: &mut AsyncPgConnection,
    member_id: i32,
) -> AppResult<Option<(Member, Chapter, bool)>> {
    Ok(members::table
        .inner_join(chapters::table.inner_join(clubs::table))
        .filter(members::id.eq(member_id))
        .select((Member::as_select(), Chapter::as_select(), clubs::is_public))
        .first(conn)
        .await
        .optional()?)
}

async fn visible_with_chapter(
    conn: &mut AsyncPgConnection,
    scope: &Scope,
    member_id: i32,
) -> AppResult<(Member, Chapter)> {
    match find_with_chapter(conn, member_id).await? {
        Some((member, chapter, club_is_public))
            if scope.can_see_member(member.user_id, member.is_active, &chapter, club_is_public) =>
        {
            Ok((member, chapter))
        }
        _ => Err(AppError::not_found("member")),
    }
}

pub async fn get_member(conn: &mut AsyncPgConnection, scope: &Scope, member_id: i32) -> AppResult<Member> {
    Ok(visible_with_chapter(conn, scope, member_id).await?.0)
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct MemberFilter {
    #[serde(rename = "chapter")]
    pub chapter_id: Option<i32>,
    #[serde(rename = "club")]
    pub club_id: Option<i32>,
    #[serde(rename = "user")]
    pub user_id: Option<i32>,
}

pub async fn list_members(
    conn: &mut AsyncPgConnection,
    scope: &Scope,
    filter: MemberFilter,
) -> AppResult<Vec<Member>> {
    let mut query = members::table
        .inner_join(chapters::table.inner_join(clubs::table))
        .select(Member::as_select())
        .into_boxed();
    if !scope.superuser {
        let public = members::is_active
            .eq(true)
            .and(chapters::is_public.eq(true))
            .and(clubs::is_public.eq(true));
        let managed = chapters::club_id
            .eq_any(scope.club_id_list())
            .or(chapters::id.eq_any(scope.chapter_id_list()));
        query = match scope.user_id {
            Some(actor) => query.filter(
                public
                    .or(managed)
                    .or(members::user_id.eq(actor).assume_not_null()),
            ),
            None => query.filter(public.or(managed)),
        };
    }
    if let Some(chapter_id) = filter.chapter_id {
        query = query.filter(members::chapter_id.eq(chapter_id));
    }
    if let Some(club_id) = filter.club_id {
        query = query.filter(chapters::club_id.eq(club_id));
    }
    if let Some(user_id) = filter.user_id {
        query = query.filter(members::user_id.eq(user_id));
    }
    Ok(query
        .order((members::chapter_id, members::first_name, members::id))
        .load(conn)
        .await?)
}

pub async fn create_member(
    conn: &mut AsyncPgConnection,
    scope: &Scope,
    draft: MemberDraft,
) -> AppResult<MemberWrite> {
    let chapter = provisioning::visible_chapter(conn, scope, draft.chapter_id).await?;
    scope.ensure(Verb::Create, Target::Member((&chapter).into()))?;

    if draft.generate_claim_code && draft.user.is_some() {
        return Err(AppError::field(
            "generate_claim_code",
            "claim codes are only issued for members without a user",
        ));
    }

    let profile = resolve_profile(
        draft.member_type.unwrap_or(MemberType::Pilot),
        draft.is_vested,
        draft.linked_to,
        None,
    );
    let now = Utc::now();
    let mut row = MemberRow {
        chapter_id: chapter.id,
        user_id: draft.user,
        first_name: draft.first_name.trim().to_string(),
        last_name: blank_to_none(draft.last_name),
        nickname: blank_to_none(draft.nickname),
        role: draft.role,
        national_role: draft.national_role,
        member_type: profile.member_type(),
        profile_picture_url: blank_to_none(draft.profile_picture_url),
        date_of_birth: draft.date_of_birth,
        claim_code: None,
        is_active: draft.is_active,
        metadata: draft.metadata.unwrap_or_else(|| Value::Object(Default::default())),
        updated_at: now,
    };
    validate_row(&row, now)?;
    row.metadata = profile.merge_into(row.metadata);
    check_copilot_link(conn, chapter.id, None, &profile).await?;
    check_uniqueness(conn, &row, None).await?;

    conn.transaction(|conn| {
        async move {
            if draft.generate_claim_code {
                row.claim_code = Some(fresh_claim_code(conn).await?);
            }
            let member = diesel::insert_into(members::table)
                .values(&row)
                .returning(Member::as_returning())
                .get_result(conn)
                .await
                .map_err(AppError::from_db)?;

            let achievements = events::dispatch(
                conn,
                DomainEvent::MemberCreated {
                    member: &member,
                    club_id: chapter.club_id,
                },
            )
            .await?;

            tracing::info!(member_id = member.id, chapter_id = member.chapter_id, "member created");
            Ok(MemberWrite {
                claim_code: member.claim_code.clone(),
                member,
                achievements,
            })
        }
        .scope_boxed()
    })
    .await
}

/// Inserts an unlinked roster row for an invitation. Runs on the caller's
/// transaction.
pub(crate) async fn insert_placeholder(
    conn: &mut AsyncPgConnection,
    chapter: &Chapter,
    first_name: &str,
    last_name: Option<&str>,
    role: MemberRole,
) -> AppResult<Member> {
    let now = Utc::now();
    let row = MemberRow {
        chapter_id: chapter.id,
        user_id: None,
        first_name: first_name.trim().to_string(),
        last_name: blank_to_none(last_name.map(str::to_string)),
        nickname: None,
        role,
        national_role: None,
        member_type: MemberType::Pilot,
        profile_picture_url: None,
        date_of_birth: None,
        claim_code: None,
        is_active: true,
        metadata: Value::Object(Default::default()),
        updated_at: now,
    };
    validate_row(&row, now)?;
    check_uniqueness(conn, &row, None).await?;

    let member = diesel::insert_into(members::table)
        .values(&row)
        .returning(Member::as_returning())
        .get_result(conn)
        .await
        .map_err(AppError::from_db)?;
    events::dispatch(
        conn,
        DomainEvent::MemberCreated {
            member: &member,
            club_id: chapter.club_id,
        },
    )
    .await?;
    Ok(member)
}

/// Links `user_id` to an unlinked roster row. Runs on the caller's
/// transaction; the caller holds the row lock.
pub(crate) async fn link_user(
    conn: &mut AsyncPgConnection,
    member: &Member,
    user_id: i32,
    claimed_code: Option<&str>,
) -> AppResult<(Member, Vec<UserAchievement>)> {
    ensure_user_free(conn, member.chapter_id, user_id, Some(member.id)).await?;

    let mut update = diesel::update(members::table.find(member.id))
        .set((
            members::user_id.eq(user_id),
            members::claim_code.eq(None::<String>),
            members::updated_at.eq(Utc::now()),
        ))
        .returning(Member::as_returning())
        .get_result(conn)
        .await
        .map_err(AppError::from_db)?;
    if let Some(code) = claimed_code {
        update = diesel::update(members::table.find(member.id))
            .set(members::claimed_code.eq(code))
            .returning(Member::as_returning())
            .get_result(conn)
            .await?;
    }

    let club_id = chapter_club(conn, update.chapter_id).await?;
    let achievements = events::dispatch(
        conn,
        DomainEvent::MemberLinked {
            member: &update,
            club_id,
        },
    )
    .await?;
    Ok((update, achievements))
}

pub async fn update_member(
    conn: &mut AsyncPgConnection,
    scope: &Scope,
    member_id: i32,
    patch: MemberPatch,
) -> AppResult<MemberWrite> {
    let (member, chapter) = visible_with_chapter(conn, scope, member_id).await?;
    let privileged = patch.touches_privileged_fields(&member);
    match scope.authorize_member_update((&chapter).into(), member.user_id, privileged) {
        Verdict::Allow => {}
        _ if scope.user_id.is_none() => return Err(AppError::unauthenticated()),
        _ => return Err(AppError::forbidden()),
    }

    let target = match patch.chapter_id {
        Some(chapter_id) if chapter_id != chapter.id => {
            let target = provisioning::visible_chapter(conn, scope, chapter_id).await?;
            scope.ensure(Verb::Create, Target::Member(ChapterRef::from(&target)))?;
            target
        }
        _ => chapter.clone(),
    };

    let current_profile = member.profile();
    let profile = resolve_profile(
        patch.member_type.unwrap_or(member.member_type),
        patch.is_vested,
        patch.linked_to,
        Some(&current_profile),
    );
    let user_id = patch.user.unwrap_or(member.user_id);
    let now = Utc::now();
    let mut row = MemberRow {
        chapter_id: target.id,
        user_id,
        first_name: patch
            .first_name
            .map(|n| n.trim().to_string())
            .unwrap_or_else(|| member.first_name.clone()),
        last_name: match patch.last_name {
            Some(last_name) => blank_to_none(Some(last_name)),
            None => member.last_name.clone(),
        },
        nickname: match patch.nickname {
            Some(nickname) => blank_to_none(Some(nickname)),
            None => member.nickname.clone(),
        },
        role: patch.role.unwrap_or(member.role),
        national_role: patch.national_role.unwrap_or(member.national_role),
        member_type: profile.member_type(),
        profile_picture_url: match patch.profile_picture_url {
            Some(url) => blank_to_none(Some(url)),
            None => member.profile_picture_url.clone(),
        },
        date_of_birth: patch.date_of_birth.unwrap_or(member.date_of_birth),
        // a linked row never carries a claim code
        claim_code: if user_id.is_some() {
            None
        } else {
            member.claim_code.clone()
        },
        is_active: patch.is_active.unwrap_or(member.is_active),
        metadata: patch.metadata.unwrap_or_else(|| member.metadata.clone()),
        updated_at: now,
    };
    validate_row(&row, now)?;
    row.metadata = profile.merge_into(row.metadata);
    check_copilot_link(conn, target.id, Some(member.id), &profile).await?;
    check_uniqueness(conn, &row, Some(member.id)).await?;

    let role_changed = row.role != member.role;
    let newly_linked = member.user_id.is_none() && row.user_id.is_some();

    conn.transaction(|conn| {
        async move {
            let updated = diesel::update(members::table.find(member.id))
                .set(&row)
                .returning(Member::as_returning())
                .get_result(conn)
                .await
                .map_err(AppError::from_db)?;

            let mut achievements = events::dispatch(
                conn,
                DomainEvent::MemberChanged {
                    member: &updated,
                    club_id: target.club_id,
                    previous_club_id: chapter.club_id,
                    role_changed,
                },
            )
            .await?;
            if newly_linked {
                achievements.extend(
                    events::dispatch(
                        conn,
                        DomainEvent::MemberLinked {
                            member: &updated,
                            club_id: target.club_id,
                        },
                    )
                    .await?,
                );
            }

            Ok(MemberWrite {
                member: updated,
                claim_code: None,
                achievements,
            })
        }
        .scope_boxed()
    })
    .await
}

pub async fn delete_member(conn: &mut AsyncPgConnection, scope: &Scope, member_id: i32) -> AppResult<()> {
    let (member, chapter) = visible_with_chapter(conn, scope, member_id).await?;
    scope.ensure(Verb::Delete, Target::Member((&chapter).into()))?;

    conn.transaction(|conn| {
        async move {
            diesel::delete(members::table.find(member.id))
                .execute(conn)
                .await?;
            events::dispatch(
                conn,
                DomainEvent::MemberRemoved {
                    club_id: chapter.club_id,
                },
            )
            .await?;
            tracing::info!(member_id = member.id, "member deleted");
            Ok(())
        }
        .scope_boxed()
    })
    .await
}

/// Issues (or replaces) the claim code of an unlinked member.
pub async fn issue_claim_code(
    conn: &mut AsyncPgConnection,
    scope: &Scope,
    member_id: i32,
) -> AppResult<MemberWrite> {
    let (member, chapter) = visible_with_chapter(conn, scope, member_id).await?;
    scope.ensure(Verb::Update, Target::Member((&chapter).into()))?;

    conn.transaction(|conn| {
        async move {
            let linked = members::table
                .find(member.id)
                .select(members::user_id)
                .for_update()
                .first::<Option<i32>>(conn)
                .await?;
            if linked.is_some() {
                return Err(AppError::from(
                    ErrorCode::AlreadyClaimed,
                    "this member is already linked to a user",
                ));
            }

            let code = fresh_claim_code(conn).await?;
            let member = diesel::update(members::table.find(member.id))
                .set((
                    members::claim_code.eq(&code),
                    members::updated_at.eq(Utc::now()),
                ))
                .returning(Member::as_returning())
                .get_result(conn)
                .await?;
            tracing::info!(member_id = member.id, "claim code issued");
            Ok(MemberWrite {
                member,
                claim_code: Some(code),
                achievements: Vec::new(),
            })
        }
        .scope_boxed()
    })
    .await
}

/// Consumes a claim code for `user`. The member row is locked so concurrent
/// claims on one code serialize; the loser sees the code as consumed.
pub async fn claim_membership(
    conn: &mut AsyncPgConnection,
    user: &User,
    code: &str,
) -> AppResult<MemberWrite> {
    let invalid = || AppError::from(ErrorCode::InvalidCode, "invalid claim code");
    let code = normalize_claim_code(code).ok_or_else(invalid)?;

    conn.transaction(|conn| {
        async move {
            let member = members::table
                .filter(members::claim_code.eq(&code))
                .select(Member::as_select())
                .for_update()
                .first(conn)
                .await
                .optional()?;

            let Some(member) = member else {
                let consumed = diesel::select(diesel::dsl::exists(
                    members::table.filter(members::claimed_code.eq(&code)),
                ))
                .get_result::<bool>(conn)
                .await?;
                return Err(if consumed {
                    AppError::from(ErrorCode::AlreadyClaimed, "this claim code has already been used")
                } else {
                    invalid()
                });
            };
            if member.user_id.is_some() {
                return Err(AppError::from(
                    ErrorCode::AlreadyClaimed,
                    "this member is already linked to a user",
                ));
            }

            let (member, achievements) = link_user(conn, &member, user.id, Some(&code)).await?;
            tracing::info!(member_id = member.id, user_id = user.id, "membership claimed");
            Ok(MemberWrite {
                member,
                claim_code: None,
                achievements,
            })
        }
        .scope_boxed()
    })
    .await
}

#[derive(Debug, Serialize)]
pub struct NamedRef {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct MembershipEntry {
    pub member: Member,
    pub chapter: NamedRef,
    pub club: NamedRef,
    pub is_current: bool,
}

#[derive(Debug, Serialize)]
pub struct LinkedUser {
    pub id: i32,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Serialize)]
pub struct CompleteProfile {
    pub current: Member,
    pub user: Option<LinkedUser>,
    pub memberships: Vec<MembershipEntry>,
    pub total_clubs: usize,
    pub total_chapters: usize,
}

fn build_profile(current: Member, user: Option<LinkedUser>, rows: Vec<(Member, Chapter, Club)>) -> CompleteProfile {
    let total_clubs = rows.iter().map(|(_, _, club)| club.id).unique().count();
    let total_chapters = rows.iter().map(|(_, chapter, _)| chapter.id).unique().count();
    let memberships = rows
        .into_iter()
        .map(|(member, chapter, club)| MembershipEntry {
            is_current: member.id == current.id,
            member,
            chapter: NamedRef {
                id: chapter.id,
                name: chapter.name,
            },
            club: NamedRef {
                id: club.id,
                name: club.name,
            },
        })
        .collect();
    CompleteProfile {
        current,
        user,
        memberships,
        total_clubs,
        total_chapters,
    }
}

/// Every visible roster row of the member's user across clubs, with the
/// requested row flagged as the current context.
pub async fn complete_profile(
    conn: &mut AsyncPgConnection,
    scope: &Scope,
    member_id: i32,
) -> AppResult<CompleteProfile> {
    let (member, _) = visible_with_chapter(conn, scope, member_id).await?;

    let mut query = members::table
        .inner_join(chapters::table.inner_join(clubs::table))
        .select((Member::as_select(), Chapter::as_select(), Club::as_select()))
        .order((clubs::name, chapters::name))
        .into_boxed();
    query = match member.user_id {
        Some(user_id) => query.filter(members::user_id.eq(user_id)),
        None => query.filter(members::id.eq(member.id)),
    };
    let rows = query
        .load::<(Member, Chapter, Club)>(conn)
        .await?
        .into_iter()
        .filter(|(m, chapter, club)| {
            m.id == member.id || scope.can_see_member(m.user_id, m.is_active, chapter, club.is_public)
        })
        .collect();

    let user = match member.user_id {
        Some(user_id) => users::table
            .find(user_id)
            .select((users::id, users::username, users::first_name, users::last_name))
            .first::<(i32, String, String, String)>(conn)
            .await
            .optional()?
            .map(|(id, username, first_name, last_name)| LinkedUser {
                id,
                username,
                first_name,
                last_name,
            }),
        None => None,
    };

    Ok(build_profile(member, user, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use serde_json::json;
    use std::collections::BTreeSet;

    #[derive(Debug, Deserialize)]
    struct UserField {
        #[serde(default, deserialize_with = "deserialize_user")]
        user: Option<i32>,
    }

    fn user_field(value: Value) -> Result<Option<i32>, serde_json::Error> {
        serde_json::from_value::<UserField>(value).map(|f| f.user)
    }

    #[test]
    fn empty_or_absent_user_is_null() {
        assert_eq!(user_field(json!({})).unwrap(), None);
        assert_eq!(user_field(json!({"user": null})).unwrap(), None);
        assert_eq!(user_field(json!({"user": ""})).unwrap(), None);
        assert_eq!(user_field(json!({"user": "  "})).unwrap(), None);
        assert_eq!(user_field(json!({"user": 7})).unwrap(), Some(7));
        assert_eq!(user_field(json!({"user": "7"})).unwrap(), Some(7));
        assert!(user_field(json!({"user": "seven"})).is_err());
    }

    #[test]
    fn patch_distinguishes_absent_from_cleared_user() {
        let patch: MemberPatch = serde_json::from_value(json!({})).unwrap();
        assert_eq!(patch.user, None);
        let patch: MemberPatch = serde_json::from_value(json!({"user": ""})).unwrap();
        assert_eq!(patch.user, Some(None));
        let patch: MemberPatch = serde_json::from_value(json!({"user": 3})).unwrap();
        assert_eq!(patch.user, Some(Some(3)));
    }

    #[test]
    fn patch_can_clear_nullable_columns() {
        let patch: MemberPatch =
            serde_json::from_value(json!({"national_role": null, "date_of_birth": null})).unwrap();
        assert_eq!(patch.national_role, Some(None));
        assert_eq!(patch.date_of_birth, Some(None));

        let patch: MemberPatch = serde_json::from_value(json!({"national_role": "president"})).unwrap();
        assert_eq!(patch.national_role, Some(Some(MemberRole::President)));
        assert_eq!(patch.date_of_birth, None);

        let mut officer = member(1, Some(5), MemberRole::Rider);
        officer.national_role = Some(MemberRole::President);
        let cleared = MemberPatch {
            national_role: Some(None),
            ..MemberPatch::default()
        };
        assert!(cleared.touches_privileged_fields(&officer));
    }

    #[test]
    fn claim_codes_use_the_alphabet() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let code = generate_claim_code(&mut rng);
            assert_eq!(code.len(), CLAIM_CODE_LEN);
            assert!(code.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()));
            assert_eq!(normalize_claim_code(&code), Some(code));
        }
    }

    #[test]
    fn claim_codes_cover_the_alphabet() {
        let mut rng = StdRng::seed_from_u64(42);
        let seen: BTreeSet<u8> = (0..500)
            .flat_map(|_| generate_claim_code(&mut rng).into_bytes())
            .collect();
        assert_eq!(seen.len(), CLAIM_CODE_ALPHABET.len());
    }

    #[test]
    fn presented_codes_are_normalized() {
        assert_eq!(normalize_claim_code(" xk3dq91p "), Some("XK3DQ91P".to_string()));
        assert_eq!(normalize_claim_code("XK3DQ91"), None);
        assert_eq!(normalize_claim_code("XK3DQ91P0"), None);
        assert_eq!(normalize_claim_code("XK3-Q91P"), None);
    }

    #[test]
    fn copilot_profile_keeps_existing_fields() {
        let current = MemberProfile::Copilot {
            is_vested: true,
            linked_to: Some(4),
        };
        assert_eq!(
            resolve_profile(MemberType::Copilot, None, None, Some(&current)),
            current
        );
        assert_eq!(
            resolve_profile(MemberType::Copilot, Some(false), Some(9), Some(&current)),
            MemberProfile::Copilot {
                is_vested: false,
                linked_to: Some(9)
            }
        );
        assert_eq!(
            resolve_profile(MemberType::Pilot, Some(true), Some(9), Some(&current)),
            MemberProfile::Pilot
        );
        assert_eq!(
            resolve_profile(MemberType::Copilot, None, None, None),
            MemberProfile::Copilot {
                is_vested: false,
                linked_to: None
            }
        );
    }

    fn row() -> MemberRow {
        MemberRow {
            chapter_id: 1,
            user_id: None,
            first_name: "John".to_string(),
            last_name: Some("Doe".to_string()),
            nickname: None,
            role: MemberRole::Member,
            national_role: None,
            member_type: MemberType::Pilot,
            profile_picture_url: None,
            date_of_birth: None,
            claim_code: None,
            is_active: true,
            metadata: json!({}),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn row_validation() {
        let now = Utc::now();
        assert!(validate_row(&row(), now).is_ok());

        let mut bad = row();
        bad.first_name = String::new();
        bad.date_of_birth = Some(NaiveDate::from_ymd_opt(2999, 1, 1).unwrap());
        bad.metadata = json!([1, 2]);
        let Err(AppError::ValidationError(fields)) = validate_row(&bad, now) else {
            panic!("expected a validation error");
        };
        assert!(fields.get("first_name").is_some());
        assert!(fields.get("date_of_birth").is_some());
        assert!(fields.get("metadata").is_some());
    }

    fn member(id: i32, user_id: Option<i32>, role: MemberRole) -> Member {
        Member {
            id,
            chapter_id: 1,
            user_id,
            first_name: "John".to_string(),
            last_name: None,
            nickname: None,
            role,
            national_role: None,
            member_type: MemberType::Pilot,
            profile_picture_url: None,
            date_of_birth: None,
            claim_code: None,
            claimed_code: None,
            is_active: true,
            metadata: json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn privileged_fields() {
        let current = member(1, Some(5), MemberRole::Rider);
        let harmless = MemberPatch {
            nickname: Some("Wheels".to_string()),
            role: Some(MemberRole::Rider),
            chapter_id: Some(1),
            ..MemberPatch::default()
        };
        assert!(!harmless.touches_privileged_fields(&current));

        for patch in [
            MemberPatch {
                role: Some(MemberRole::President),
                ..MemberPatch::default()
            },
            MemberPatch {
                chapter_id: Some(2),
                ..MemberPatch::default()
            },
            MemberPatch {
                user: Some(None),
                ..MemberPatch::default()
            },
            MemberPatch {
                is_active: Some(false),
                ..MemberPatch::default()
            },
        ] {
            assert!(patch.touches_privileged_fields(&current), "{patch:?}");
        }
    }

    #[test]
    fn claim_code_only_leaves_through_member_writes() {
        let mut placeholder = member(3, None, MemberRole::Rider);
        placeholder.claim_code = Some("AB12CD34".to_string());

        let public = serde_json::to_value(&placeholder).unwrap();
        assert!(public.get("claim_code").is_none());
        assert!(public.get("claimed_code").is_none());

        let issued = serde_json::to_value(MemberWrite {
            claim_code: placeholder.claim_code.clone(),
            member: placeholder.clone(),
            achievements: Vec::new(),
        })
        .unwrap();
        assert_eq!(issued["claim_code"], "AB12CD34");
        assert_eq!(issued["id"], 3);

        let updated = serde_json::to_value(MemberWrite {
            member: placeholder,
            claim_code: None,
            achievements: Vec::new(),
        })
        .unwrap();
        assert!(updated.get("claim_code").is_none());
    }

    #[test]
    fn profile_counts_distinct_clubs_and_chapters() {
        fn chapter(id: i32, club_id: i32) -> Chapter {
            Chapter {
                id,
                club_id,
                name: format!("Chapter {id}"),
                description: String::new(),
                owner_id: None,
                city: None,
                state_id: None,
                latitude: None,
                longitude: None,
                is_public: true,
                is_active: true,
                accepts_new_members: true,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            }
        }
        fn club(id: i32) -> Club {
            Club {
                id,
                name: format!("Club {id}"),
                description: String::new(),
                foundation_date: None,
                logo_url: None,
                is_public: true,
                accepts_new_chapters: true,
                total_members: 0,
                total_chapters: 0,
                club_type: Default::default(),
                country_id: None,
                state_id: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            }
        }

        let rider = member(1, Some(5), MemberRole::Rider);
        let secretary = member(2, Some(5), MemberRole::Secretary);
        let profile = build_profile(
            secretary.clone(),
            None,
            vec![
                (rider, chapter(10, 1), club(1)),
                (secretary, chapter(20, 2), club(2)),
            ],
        );
        assert_eq!(profile.total_clubs, 2);
        assert_eq!(profile.total_chapters, 2);
        let current: Vec<_> = profile
            .memberships
            .iter()
            .filter(|m| m.is_current)
            .map(|m| m.member.id)
            .collect();
        assert_eq!(current, vec![2]);
        assert_eq!(profile.memberships[1].club.name, "Club 2");
    }
}

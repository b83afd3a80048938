//! Invitations onboard a named prospect into a chapter. Creating one also
//! writes the unlinked roster row the invitee will take over.
//!
//! Expiry is lazy: any read that finds a pending row past `expires_at`
//! persists `expired` before answering.

use crate::{
    accounts::{self, RegisterRequest, UserView},
    error::{AppError, AppResult, ErrorCode, FieldErrors},
    events::{self, DomainEvent},
    models::{lower, Invitation, Member, User, UserAchievement},
    provisioning,
    rbac::{ChapterRef, Scope, Target, Verb},
    roster::{self, NamedRef},
    schema::*,
    types::{InvitationStatus, MemberRole},
};
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use diesel_async::{scoped_futures::ScopedFutureExt, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const INVITATION_TTL_DAYS: i64 = 30;

#[derive(Debug, Deserialize)]
pub struct InvitationDraft {
    pub email: String,
    pub first_name: String,
    pub last_name: Option<String>,
    #[serde(rename = "chapter")]
    pub chapter_id: i32,
    /// Optional; must match the chapter's club when given.
    #[serde(rename = "club")]
    pub club_id: Option<i32>,
    #[serde(default)]
    pub role: MemberRole,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum AcceptCredentials {
    Existing {
        login: String,
        password: String,
    },
    New {
        username: String,
        password: String,
        first_name: Option<String>,
        last_name: Option<String>,
    },
}

/// Who takes over the invitation.
pub enum Acceptor {
    /// The authenticated caller.
    Current(User),
    Credentials(AcceptCredentials),
}

#[derive(Debug, Serialize)]
pub struct CreatedInvitation {
    #[serde(flatten)]
    pub invitation: Invitation,
    #[serde(skip)]
    pub club_name: String,
}

#[derive(Debug, Serialize)]
pub struct InvitationInfo {
    pub email: String,
    pub first_name: String,
    pub last_name: Option<String>,
    pub club: NamedRef,
    pub chapter: NamedRef,
    pub role: MemberRole,
    pub message: String,
    pub status: InvitationStatus,
    pub expires_at: DateTime<Utc>,
    pub invited_by: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Accepted {
    pub invitation: Invitation,
    pub member: Member,
    pub user: UserView,
    pub achievements: Vec<UserAchievement>,
}

pub fn is_expired(invitation: &Invitation, now: DateTime<Utc>) -> bool {
    invitation.status == InvitationStatus::Pending && now > invitation.expires_at
}

fn expired_error() -> AppError {
    AppError::from(ErrorCode::InvitationExpired, "this invitation has expired")
}

fn not_pending_error(status: InvitationStatus) -> AppError {
    AppError::from(
        ErrorCode::InvitationNotPending,
        format!("this invitation is already {status}"),
    )
}

/// Persists `expired` on every overdue pending row matched by `club_ids`
/// (all clubs when `None`).
async fn sweep_expired(conn: &mut AsyncPgConnection, club_ids: Option<Vec<i32>>) -> AppResult<usize> {
    let mut query = invitations::table
        .filter(invitations::status.eq(InvitationStatus::Pending))
        .filter(invitations::expires_at.lt(Utc::now()))
        .select(invitations::id)
        .into_boxed();
    if let Some(club_ids) = club_ids {
        query = query.filter(invitations::club_id.eq_any(club_ids));
    }
    let overdue = query.load::<i32>(conn).await?;
    if overdue.is_empty() {
        return Ok(0);
    }
    let expired = diesel::update(
        invitations::table
            .filter(invitations::id.eq_any(&overdue))
            .filter(invitations::status.eq(InvitationStatus::Pending)),
    )
    .set(invitations::status.eq(InvitationStatus::Expired))
    .execute(conn)
    .await?;
    tracing::debug!(expired, "expired overdue invitations");
    Ok(expired)
}

/// Persists the lazy expiry of one row if it is due.
async fn refresh_status(conn: &mut AsyncPgConnection, invitation: Invitation) -> AppResult<Invitation> {
    if !is_expired(&invitation, Utc::now()) {
        return Ok(invitation);
    }
    let updated = diesel::update(
        invitations::table
            .find(invitation.id)
            .filter(invitations::status.eq(InvitationStatus::Pending)),
    )
    .set(invitations::status.eq(InvitationStatus::Expired))
    .returning(Invitation::as_returning())
    .get_result(conn)
    .await
    .optional()?;
    tracing::info!(invitation_id = invitation.id, "invitation expired");
    Ok(match updated {
        Some(updated) => updated,
        None => invitations::table
            .find(invitation.id)
            .select(Invitation::as_select())
            .first(conn)
            .await?,
    })
}

async fn by_token(conn: &mut AsyncPgConnection, token: Uuid) -> AppResult<Invitation> {
    let invitation = invitations::table
        .filter(invitations::token.eq(token))
        .select(Invitation::as_select())
        .first(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::not_found("invitation"))?;
    refresh_status(conn, invitation).await
}

pub async fn create_invitation(
    conn: &mut AsyncPgConnection,
    scope: &Scope,
    inviter: &User,
    draft: InvitationDraft,
) -> AppResult<CreatedInvitation> {
    let chapter = provisioning::visible_chapter(conn, scope, draft.chapter_id).await?;
    scope.ensure(Verb::Create, Target::Invitation((&chapter).into()))?;

    let email = draft.email.trim().to_string();
    let mut errors = FieldErrors::default();
    if email.parse::<lettre::Address>().is_err() {
        errors.add("email", "enter a valid email address");
    }
    if draft.first_name.trim().is_empty() {
        errors.add("first_name", "this field may not be blank");
    }
    if draft.club_id.map_or(false, |club_id| club_id != chapter.club_id) {
        errors.add("club", "chapter does not belong to this club");
    }
    errors.into_result()?;

    sweep_expired(conn, Some(vec![chapter.club_id])).await?;
    let pending = invitations::table
        .filter(lower(invitations::email).eq(email.to_lowercase()))
        .filter(invitations::club_id.eq(chapter.club_id))
        .filter(invitations::status.eq(InvitationStatus::Pending))
        .select(invitations::id)
        .first::<i32>(conn)
        .await
        .optional()?;
    if pending.is_some() {
        return Err(AppError::from(
            ErrorCode::DuplicateInvitation,
            "a pending invitation for this email already exists in the club",
        ));
    }

    let club_name = clubs::table
        .find(chapter.club_id)
        .select(clubs::name)
        .first::<String>(conn)
        .await?;

    conn.transaction(|conn| {
        async move {
            let member = roster::insert_placeholder(
                conn,
                &chapter,
                &draft.first_name,
                draft.last_name.as_deref(),
                draft.role,
            )
            .await?;

            let now = Utc::now();
            let invitation = diesel::insert_into(invitations::table)
                .values((
                    invitations::email.eq(&email),
                    invitations::first_name.eq(draft.first_name.trim()),
                    invitations::last_name.eq(&member.last_name),
                    invitations::club_id.eq(chapter.club_id),
                    invitations::chapter_id.eq(chapter.id),
                    invitations::role.eq(draft.role),
                    invitations::invited_by.eq(inviter.id),
                    invitations::message.eq(draft.message.trim()),
                    invitations::token.eq(Uuid::new_v4()),
                    invitations::status.eq(InvitationStatus::Pending),
                    invitations::member_id.eq(member.id),
                    invitations::created_at.eq(now),
                    invitations::expires_at.eq(now + Duration::days(INVITATION_TTL_DAYS)),
                ))
                .returning(Invitation::as_returning())
                .get_result(conn)
                .await
                .map_err(AppError::from_db)?;

            tracing::info!(invitation_id = invitation.id, chapter_id = chapter.id, "invitation created");
            Ok(CreatedInvitation {
                invitation,
                club_name,
            })
        }
        .scope_boxed()
    })
    .await
}

fn manages(scope: &Scope, invitation: &Invitation) -> bool {
    scope.administers_chapter(ChapterRef {
        id: invitation.chapter_id,
        club_id: invitation.club_id,
    })
}

pub async fn get_invitation(
    conn: &mut AsyncPgConnection,
    scope: &Scope,
    invitation_id: i32,
) -> AppResult<Invitation> {
    let invitation = invitations::table
        .find(invitation_id)
        .select(Invitation::as_select())
        .first(conn)
        .await
        .optional()?
        .filter(|invitation| manages(scope, invitation))
        .ok_or_else(|| AppError::not_found("invitation"))?;
    refresh_status(conn, invitation).await
}

/// Invitations of every chapter the caller administers.
pub async fn list_invitations(
    conn: &mut AsyncPgConnection,
    scope: &Scope,
    status: Option<InvitationStatus>,
) -> AppResult<Vec<Invitation>> {
    scope.require_user()?;
    let club_filter = (!scope.superuser).then(|| scope.club_id_list());
    sweep_expired(conn, club_filter).await?;

    let mut query = invitations::table
        .select(Invitation::as_select())
        .into_boxed();
    if !scope.superuser {
        query = query.filter(
            invitations::club_id
                .eq_any(scope.club_id_list())
                .or(invitations::chapter_id.eq_any(scope.chapter_id_list())),
        );
    }
    if let Some(status) = status {
        query = query.filter(invitations::status.eq(status));
    }
    let invitations = query
        .order(invitations::created_at.desc())
        .load::<Invitation>(conn)
        .await?;

    // chapter-level admins outside the swept clubs
    let mut fresh = Vec::with_capacity(invitations.len());
    for invitation in invitations {
        fresh.push(refresh_status(conn, invitation).await?);
    }
    if let Some(status) = status {
        fresh.retain(|invitation| invitation.status == status);
    }
    Ok(fresh)
}

/// Public view of an invitation, addressed by its token.
pub async fn info(conn: &mut AsyncPgConnection, token: Uuid) -> AppResult<InvitationInfo> {
    let invitation = by_token(conn, token).await?;
    let (club_name, chapter_name) = chapters::table
        .inner_join(clubs::table)
        .filter(chapters::id.eq(invitation.chapter_id))
        .select((clubs::name, chapters::name))
        .first::<(String, String)>(conn)
        .await?;
    let invited_by = match invitation.invited_by {
        Some(user_id) => users::table
            .find(user_id)
            .select(users::username)
            .first::<String>(conn)
            .await
            .optional()?,
        None => None,
    };

    Ok(InvitationInfo {
        email: invitation.email,
        first_name: invitation.first_name,
        last_name: invitation.last_name,
        club: NamedRef {
            id: invitation.club_id,
            name: club_name,
        },
        chapter: NamedRef {
            id: invitation.chapter_id,
            name: chapter_name,
        },
        role: invitation.role,
        message: invitation.message,
        status: invitation.status,
        expires_at: invitation.expires_at,
        invited_by,
    })
}

/// Locks the invitation and checks it can still be answered. An overdue
/// row is marked expired; the caller commits that before failing.
async fn lock_pending(conn: &mut AsyncPgConnection, token: Uuid) -> AppResult<Result<Invitation, Invitation>> {
    let invitation = invitations::table
        .filter(invitations::token.eq(token))
        .select(Invitation::as_select())
        .for_update()
        .first(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::not_found("invitation"))?;

    if is_expired(&invitation, Utc::now()) {
        return Ok(Err(refresh_status(conn, invitation).await?));
    }
    match invitation.status {
        InvitationStatus::Pending => Ok(Ok(invitation)),
        InvitationStatus::Expired => Err(expired_error()),
        status => Err(not_pending_error(status)),
    }
}

async fn resolve_acceptor(
    conn: &mut AsyncPgConnection,
    invitation: &Invitation,
    acceptor: Acceptor,
) -> AppResult<User> {
    match acceptor {
        Acceptor::Current(user) => Ok(user),
        Acceptor::Credentials(AcceptCredentials::Existing { login, password }) => {
            accounts::authenticate(conn, &login, &password).await
        }
        Acceptor::Credentials(AcceptCredentials::New {
            username,
            password,
            first_name,
            last_name,
        }) => {
            accounts::create_user(
                conn,
                &RegisterRequest {
                    username,
                    email: invitation.email.clone(),
                    password,
                    first_name: first_name.unwrap_or_else(|| invitation.first_name.clone()),
                    last_name: last_name
                        .or_else(|| invitation.last_name.clone())
                        .unwrap_or_default(),
                },
            )
            .await
        }
    }
}

/// The roster row the invitee takes over. Recreated if the placeholder was
/// removed in the meantime.
async fn placeholder_for(conn: &mut AsyncPgConnection, invitation: &Invitation) -> AppResult<Member> {
    if let Some(member_id) = invitation.member_id {
        let member = members::table
            .find(member_id)
            .select(Member::as_select())
            .for_update()
            .first(conn)
            .await
            .optional()?;
        if let Some(member) = member {
            return Ok(member);
        }
    }
    let chapter = provisioning::find_chapter(conn, invitation.chapter_id)
        .await?
        .map(|(chapter, _)| chapter)
        .ok_or_else(|| AppError::not_found("chapter"))?;
    roster::insert_placeholder(
        conn,
        &chapter,
        &invitation.first_name,
        invitation.last_name.as_deref(),
        invitation.role,
    )
    .await
}

pub async fn accept(conn: &mut AsyncPgConnection, token: Uuid, acceptor: Acceptor) -> AppResult<Accepted> {
    let outcome = conn
        .transaction(|conn| {
            async move {
                let invitation = match lock_pending(conn, token).await? {
                    Ok(invitation) => invitation,
                    Err(expired) => return Ok::<_, AppError>(Err(expired)),
                };

                let user = resolve_acceptor(conn, &invitation, acceptor).await?;
                let placeholder = placeholder_for(conn, &invitation).await?;
                let (member, achievements) = match placeholder.user_id {
                    None => roster::link_user(conn, &placeholder, user.id, None).await?,
                    Some(owner) if owner == user.id => (placeholder, Vec::new()),
                    Some(_) => {
                        return Err(AppError::from(
                            ErrorCode::AlreadyClaimed,
                            "the invited member is already linked to another user",
                        ))
                    }
                };

                let invitation = diesel::update(invitations::table.find(invitation.id))
                    .set((
                        invitations::status.eq(InvitationStatus::Accepted),
                        invitations::accepted_at.eq(Utc::now()),
                        invitations::member_id.eq(member.id),
                    ))
                    .returning(Invitation::as_returning())
                    .get_result(conn)
                    .await?;

                tracing::info!(invitation_id = invitation.id, user_id = user.id, "invitation accepted");
                Ok(Ok(Accepted {
                    invitation,
                    member,
                    user: (&user).into(),
                    achievements,
                }))
            }
            .scope_boxed()
        })
        .await?;
    outcome.map_err(|_| expired_error())
}

pub async fn decline(conn: &mut AsyncPgConnection, token: Uuid) -> AppResult<Invitation> {
    let outcome = conn
        .transaction(|conn| {
            async move {
                let invitation = match lock_pending(conn, token).await? {
                    Ok(invitation) => invitation,
                    Err(expired) => return Ok::<_, AppError>(Err(expired)),
                };

                let invitation = diesel::update(invitations::table.find(invitation.id))
                    .set(invitations::status.eq(InvitationStatus::Declined))
                    .returning(Invitation::as_returning())
                    .get_result(conn)
                    .await?;

                if let Some(member_id) = invitation.member_id {
                    let removed = diesel::delete(
                        members::table
                            .find(member_id)
                            .filter(members::user_id.is_null()),
                    )
                    .execute(conn)
                    .await?;
                    if removed > 0 {
                        events::dispatch(
                            conn,
                            DomainEvent::MemberRemoved {
                                club_id: invitation.club_id,
                            },
                        )
                        .await?;
                    }
                }

                tracing::info!(invitation_id = invitation.id, "invitation declined");
                Ok(Ok(invitation))
            }
            .scope_boxed()
        })
        .await?;
    outcome.map_err(|_| expired_error())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invitation(status: InvitationStatus, expires_in: Duration) -> Invitation {
        let now = Utc::now();
        Invitation {
            id: 1,
            email: "rider@example.com".to_string(),
            first_name: "Ana".to_string(),
            last_name: None,
            club_id: 1,
            chapter_id: 2,
            role: MemberRole::Member,
            invited_by: None,
            message: String::new(),
            token: Uuid::new_v4(),
            status,
            member_id: None,
            created_at: now,
            expires_at: now + expires_in,
            accepted_at: None,
        }
    }

    #[test]
    fn only_overdue_pending_rows_expire() {
        let now = Utc::now();
        assert!(!is_expired(&invitation(InvitationStatus::Pending, Duration::days(1)), now));
        assert!(is_expired(&invitation(InvitationStatus::Pending, Duration::seconds(-1)), now));
        assert!(!is_expired(&invitation(InvitationStatus::Accepted, Duration::seconds(-1)), now));
        assert!(!is_expired(&invitation(InvitationStatus::Declined, Duration::days(-3)), now));
    }

    #[test]
    fn accept_credentials_shapes() {
        let existing: AcceptCredentials =
            serde_json::from_value(json!({"login": "ana", "password": "secret123"})).unwrap();
        assert!(matches!(existing, AcceptCredentials::Existing { .. }));

        let new: AcceptCredentials = serde_json::from_value(
            json!({"username": "ana", "password": "secret123", "first_name": "Ana"}),
        )
        .unwrap();
        assert!(matches!(
            new,
            AcceptCredentials::New { first_name: Some(ref name), .. } if name == "Ana"
        ));

        assert!(serde_json::from_value::<AcceptCredentials>(json!({"password": "x"})).is_err());
    }

    #[test]
    fn draft_defaults() {
        let draft: InvitationDraft = serde_json::from_value(json!({
            "email": "rider@example.com",
            "first_name": "Ana",
            "chapter": 4
        }))
        .unwrap();
        assert_eq!(draft.role, MemberRole::Member);
        assert_eq!(draft.club_id, None);
        assert_eq!(draft.message, "");
    }

    #[test]
    fn admins_of_club_or_chapter_manage_invitations() {
        let invitation = invitation(InvitationStatus::Pending, Duration::days(1));
        let mut scope = Scope {
            user_id: Some(9),
            ..Scope::default()
        };
        assert!(!manages(&scope, &invitation));
        scope.chapter_ids.insert(2);
        assert!(manages(&scope, &invitation));
        scope.chapter_ids.clear();
        scope.club_ids.insert(1);
        assert!(manages(&scope, &invitation));
    }
}

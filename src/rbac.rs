//! Role-based access control.
//!
//! A [`Scope`] captures everything needed to answer authorization questions
//! for one actor: whether they are a superuser, and which clubs and chapters
//! they administer directly. Verdicts are pure functions of the scope and the
//! target so handlers can load a scope once per request.
//!
//! Read paths never reveal hidden rows: a caller that cannot see an instance
//! gets `not_found`, while a caller that can see it but may not change it
//! gets `forbidden`.

use crate::{
    error::{AppError, AppResult},
    models::{Chapter, Club, User},
    schema::*,
};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    pub user_id: Option<i32>,
    pub superuser: bool,
    /// Clubs with a ClubAdmin row for this user.
    pub club_ids: BTreeSet<i32>,
    /// Chapters with a ChapterAdmin row for this user.
    pub chapter_ids: BTreeSet<i32>,
}

/// Just enough of a chapter to place it inside its club.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChapterRef {
    pub id: i32,
    pub club_id: i32,
}

impl From<&Chapter> for ChapterRef {
    fn from(chapter: &Chapter) -> Self {
        ChapterRef {
            id: chapter.id,
            club_id: chapter.club_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Club(i32),
    Chapter(ChapterRef),
    Member(ChapterRef),
    ClubAdmin { club_id: i32, user_id: i32 },
    ChapterAdmin(ChapterRef),
    JoinRequestReview { club_id: i32 },
    Invitation(ChapterRef),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
    /// Actors may not grant themselves club authority.
    SelfAssignment,
}

impl Scope {
    pub fn anonymous() -> Self {
        Scope::default()
    }

    pub async fn load(conn: &mut AsyncPgConnection, user: Option<&User>) -> AppResult<Self> {
        let Some(user) = user else {
            return Ok(Scope::anonymous());
        };

        let club_ids = club_admins::table
            .filter(club_admins::user_id.eq(user.id))
            .select(club_admins::club_id)
            .load::<i32>(conn)
            .await?;
        let chapter_ids = chapter_admins::table
            .filter(chapter_admins::user_id.eq(user.id))
            .select(chapter_admins::chapter_id)
            .load::<i32>(conn)
            .await?;

        Ok(Scope {
            user_id: Some(user.id),
            superuser: user.is_superuser,
            club_ids: club_ids.into_iter().collect(),
            chapter_ids: chapter_ids.into_iter().collect(),
        })
    }

    pub fn require_user(&self) -> AppResult<i32> {
        self.user_id.ok_or_else(AppError::unauthenticated)
    }

    pub fn administers_club(&self, club_id: i32) -> bool {
        self.superuser || self.club_ids.contains(&club_id)
    }

    /// ClubAdmin of the parent club or ChapterAdmin of the chapter itself.
    pub fn administers_chapter(&self, chapter: ChapterRef) -> bool {
        self.administers_club(chapter.club_id) || self.chapter_ids.contains(&chapter.id)
    }

    pub fn authorize(&self, verb: Verb, target: Target) -> Verdict {
        let allowed = match (verb, target) {
            (Verb::Create, Target::Club(_)) => self.user_id.is_some(),
            (_, Target::Club(club_id)) => self.administers_club(club_id),

            // direct creation only; everyone else goes through a join request
            (Verb::Create, Target::Chapter(chapter)) => self.administers_club(chapter.club_id),
            (Verb::Update, Target::Chapter(chapter)) => self.administers_chapter(chapter),
            (Verb::Delete, Target::Chapter(chapter)) => self.administers_club(chapter.club_id),

            (_, Target::Member(chapter)) => self.administers_chapter(chapter),

            (Verb::Create, Target::ClubAdmin { club_id, user_id }) => {
                if !self.administers_club(club_id) {
                    false
                } else if !self.superuser && self.user_id == Some(user_id) {
                    return Verdict::SelfAssignment;
                } else {
                    true
                }
            }
            (_, Target::ClubAdmin { club_id, .. }) => self.administers_club(club_id),

            (_, Target::ChapterAdmin(chapter)) => self.administers_club(chapter.club_id),
            (_, Target::JoinRequestReview { club_id }) => self.administers_club(club_id),
            (_, Target::Invitation(chapter)) => self.administers_chapter(chapter),
        };
        if allowed {
            Verdict::Allow
        } else {
            Verdict::Deny
        }
    }

    pub fn ensure(&self, verb: Verb, target: Target) -> AppResult<()> {
        match self.authorize(verb, target) {
            Verdict::Allow => Ok(()),
            Verdict::Deny if self.user_id.is_none() => Err(AppError::unauthenticated()),
            Verdict::Deny => Err(AppError::forbidden()),
            Verdict::SelfAssignment => Err(AppError::from(
                crate::error::ErrorCode::SelfAssignment,
                "you cannot grant yourself administrative authority",
            )),
        }
    }

    /// A member's linked user may edit their own row, but never its role or
    /// chapter; admins of the chapter may edit anything.
    pub fn authorize_member_update(
        &self,
        chapter: ChapterRef,
        member_user: Option<i32>,
        touches_role_or_chapter: bool,
    ) -> Verdict {
        if self.administers_chapter(chapter) {
            return Verdict::Allow;
        }
        match (self.user_id, member_user) {
            (Some(actor), Some(owner)) if actor == owner && !touches_role_or_chapter => {
                Verdict::Allow
            }
            _ => Verdict::Deny,
        }
    }

    pub fn can_see_club(&self, club: &Club) -> bool {
        club.is_public || self.administers_club(club.id)
    }

    pub fn can_see_chapter(&self, chapter: &Chapter, club_is_public: bool) -> bool {
        (chapter.is_public && club_is_public) || self.administers_chapter(chapter.into())
    }

    /// Members inherit visibility from their chapter; linked users always see
    /// their own rows.
    pub fn can_see_member(
        &self,
        member_user: Option<i32>,
        member_is_active: bool,
        chapter: &Chapter,
        club_is_public: bool,
    ) -> bool {
        if self.administers_chapter(chapter.into()) {
            return true;
        }
        if member_user.is_some() && member_user == self.user_id {
            return true;
        }
        member_is_active && chapter.is_public && club_is_public
    }

    pub fn club_id_list(&self) -> Vec<i32> {
        self.club_ids.iter().copied().collect()
    }

    pub fn chapter_id_list(&self) -> Vec<i32> {
        self.chapter_ids.iter().copied().collect()
    }
}

/// Every club for superusers, else the clubs the user administers.
pub async fn manageable_clubs(conn: &mut AsyncPgConnection, scope: &Scope) -> AppResult<Vec<i32>> {
    if scope.superuser {
        return Ok(clubs::table.select(clubs::id).load(conn).await?);
    }
    Ok(scope.club_id_list())
}

/// Chapters of manageable clubs plus chapters administered directly.
pub async fn manageable_chapters(
    conn: &mut AsyncPgConnection,
    scope: &Scope,
) -> AppResult<Vec<i32>> {
    let mut query = chapters::table.select(chapters::id).into_boxed();
    if !scope.superuser {
        query = query.filter(
            chapters::club_id
                .eq_any(scope.club_id_list())
                .or(chapters::id.eq_any(scope.chapter_id_list())),
        );
    }
    Ok(query.order(chapters::id).load(conn).await?)
}

/// Members whose chapter is manageable.
pub async fn manageable_members(
    conn: &mut AsyncPgConnection,
    scope: &Scope,
) -> AppResult<Vec<i32>> {
    let mut query = members::table
        .inner_join(chapters::table)
        .select(members::id)
        .into_boxed();
    if !scope.superuser {
        query = query.filter(
            chapters::club_id
                .eq_any(scope.club_id_list())
                .or(chapters::id.eq_any(scope.chapter_id_list())),
        );
    }
    Ok(query.order(members::id).load(conn).await?)
}

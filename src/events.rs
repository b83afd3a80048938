//! Domain events emitted by mutations and consumed synchronously, inside
//! the same transaction, by the stats aggregator and the achievement engine.

use crate::{
    achievements::{self, TriggerContext},
    error::AppResult,
    models::{Chapter, ChapterAdmin, Club, ClubAdmin, Member, UserAchievement},
    stats,
};
use diesel_async::AsyncPgConnection;
use std::collections::BTreeSet;

#[derive(Debug)]
pub enum DomainEvent<'a> {
    ClubFounded {
        club: &'a Club,
        chapter: &'a Chapter,
        founder: &'a Member,
    },
    ChapterCreated {
        chapter: &'a Chapter,
        creator: Option<i32>,
    },
    /// Update, activation toggle or removal of a chapter.
    ChapterChanged { club_id: i32 },
    MemberCreated {
        member: &'a Member,
        club_id: i32,
    },
    MemberChanged {
        member: &'a Member,
        club_id: i32,
        previous_club_id: i32,
        role_changed: bool,
    },
    MemberRemoved { club_id: i32 },
    /// A user took over a roster row (claim code or invitation).
    MemberLinked {
        member: &'a Member,
        club_id: i32,
    },
    ClubAdminAssigned(&'a ClubAdmin),
    ChapterAdminAssigned {
        assignment: &'a ChapterAdmin,
        club_id: i32,
    },
}

impl DomainEvent<'_> {
    pub fn trigger(&self) -> &'static str {
        match self {
            DomainEvent::ClubFounded { .. } => "club_created",
            DomainEvent::ChapterCreated { .. } => "chapter_created",
            DomainEvent::ChapterChanged { .. } => "chapter_changed",
            DomainEvent::MemberCreated { .. } => "member_created",
            DomainEvent::MemberChanged {
                role_changed: true, ..
            } => "member_role_changed",
            DomainEvent::MemberChanged { .. } => "member_changed",
            DomainEvent::MemberRemoved { .. } => "member_removed",
            DomainEvent::MemberLinked { .. } => "member_linked",
            DomainEvent::ClubAdminAssigned(_) => "club_admin_assigned",
            DomainEvent::ChapterAdminAssigned { .. } => "chapter_admin_assigned",
        }
    }

    /// Clubs whose counters may have moved.
    pub fn affected_clubs(&self) -> BTreeSet<i32> {
        match self {
            DomainEvent::ClubFounded { club, .. } => BTreeSet::from([club.id]),
            DomainEvent::ChapterCreated { chapter, .. } => BTreeSet::from([chapter.club_id]),
            DomainEvent::ChapterChanged { club_id }
            | DomainEvent::MemberCreated { club_id, .. }
            | DomainEvent::MemberRemoved { club_id } => BTreeSet::from([*club_id]),
            DomainEvent::MemberChanged {
                club_id,
                previous_club_id,
                ..
            } => BTreeSet::from([*club_id, *previous_club_id]),
            DomainEvent::MemberLinked { .. }
            | DomainEvent::ClubAdminAssigned(_)
            | DomainEvent::ChapterAdminAssigned { .. } => BTreeSet::new(),
        }
    }

    /// User whose achievements should be re-evaluated.
    pub fn beneficiary(&self) -> Option<i32> {
        match self {
            DomainEvent::ClubFounded { founder, .. } => founder.user_id,
            DomainEvent::ChapterCreated { creator, .. } => *creator,
            DomainEvent::MemberCreated { member, .. } | DomainEvent::MemberLinked { member, .. } => {
                member.user_id
            }
            DomainEvent::MemberChanged {
                member,
                club_id,
                previous_club_id,
                role_changed,
            } if *role_changed || club_id != previous_club_id => member.user_id,
            DomainEvent::ClubAdminAssigned(assignment) => Some(assignment.user_id),
            DomainEvent::ChapterAdminAssigned { assignment, .. } => Some(assignment.user_id),
            DomainEvent::MemberChanged { .. }
            | DomainEvent::ChapterChanged { .. }
            | DomainEvent::MemberRemoved { .. } => None,
        }
    }

    pub fn context(&self) -> TriggerContext {
        let context = TriggerContext::new(self.trigger());
        match self {
            DomainEvent::ClubFounded {
                club,
                chapter,
                founder,
            } => context
                .with_club(club)
                .with_chapter(chapter)
                .with_member(founder),
            DomainEvent::ChapterCreated { chapter, .. } => context.with_chapter(chapter),
            DomainEvent::MemberCreated { member, club_id }
            | DomainEvent::MemberLinked { member, club_id }
            | DomainEvent::MemberChanged {
                member, club_id, ..
            } => context.with_member(member).with_club_id(*club_id),
            DomainEvent::ClubAdminAssigned(assignment) => context.with_club_id(assignment.club_id),
            DomainEvent::ChapterAdminAssigned { club_id, .. } => context.with_club_id(*club_id),
            DomainEvent::ChapterChanged { club_id } | DomainEvent::MemberRemoved { club_id } => {
                context.with_club_id(*club_id)
            }
        }
    }
}

/// Runs the synchronous consumers of `event` on the caller's transaction.
/// Counter refreshes propagate their errors; the achievement check is
/// contained and only logs.
pub async fn dispatch(
    conn: &mut AsyncPgConnection,
    event: DomainEvent<'_>,
) -> AppResult<Vec<UserAchievement>> {
    tracing::debug!(trigger = event.trigger(), "dispatching domain event");

    for club_id in event.affected_clubs() {
        stats::refresh_club(conn, club_id).await?;
    }

    let Some(user_id) = event.beneficiary() else {
        return Ok(Vec::new());
    };
    let context = event.context();
    Ok(achievements::check_contained(conn, user_id, &context).await)
}

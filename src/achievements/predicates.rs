//! Badge predicates over a user's aggregate state.
//!
//! Every predicate is a pure function of [`UserAggregate`] and the current
//! time. New badges register one implementation under their code in
//! [`REGISTRY`].

use crate::types::MemberRole;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashMap};

/// One roster row of the user, flattened with its club.
#[derive(Debug, Clone, PartialEq)]
pub struct MembershipFact {
    pub member_id: i32,
    pub chapter_id: i32,
    pub club_id: i32,
    pub role: MemberRole,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserAggregate {
    pub memberships: Vec<MembershipFact>,
    pub admin_club_ids: BTreeSet<i32>,
    pub admin_chapter_ids: BTreeSet<i32>,
    /// Chapters belonging to the clubs in `admin_club_ids`.
    pub admin_club_chapter_ids: BTreeSet<i32>,
}

impl UserAggregate {
    pub fn holds_role(&self, role: MemberRole) -> bool {
        self.memberships.iter().any(|m| m.role == role)
    }

    pub fn distinct_clubs(&self) -> BTreeSet<i32> {
        self.memberships.iter().map(|m| m.club_id).collect()
    }

    pub fn leadership_clubs(&self) -> BTreeSet<i32> {
        self.memberships
            .iter()
            .filter(|m| m.role.is_leadership())
            .map(|m| m.club_id)
            .collect()
    }

    /// Union of chapters under administered clubs and directly administered
    /// chapters.
    pub fn managed_chapters(&self) -> BTreeSet<i32> {
        self.admin_club_chapter_ids
            .union(&self.admin_chapter_ids)
            .copied()
            .collect()
    }

    pub fn earliest_membership(&self) -> Option<DateTime<Utc>> {
        self.memberships.iter().map(|m| m.created_at).min()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub current: i32,
    pub target: i32,
}

impl Progress {
    pub fn is_complete(&self) -> bool {
        self.current >= self.target
    }
}

pub trait Predicate: Send + Sync {
    fn is_satisfied(&self, user: &UserAggregate, now: DateTime<Utc>) -> bool;

    /// Counter-style predicates report how far along the user is.
    fn progress(&self, _user: &UserAggregate, _now: DateTime<Utc>) -> Option<Progress> {
        None
    }
}

pub struct HoldsRole(pub MemberRole);

impl Predicate for HoldsRole {
    fn is_satisfied(&self, user: &UserAggregate, _now: DateTime<Utc>) -> bool {
        user.holds_role(self.0)
    }
}

pub struct AdministersAnyClub;

impl Predicate for AdministersAnyClub {
    fn is_satisfied(&self, user: &UserAggregate, _now: DateTime<Utc>) -> bool {
        !user.admin_club_ids.is_empty()
    }
}

pub struct HasMembership;

impl Predicate for HasMembership {
    fn is_satisfied(&self, user: &UserAggregate, _now: DateTime<Utc>) -> bool {
        !user.memberships.is_empty()
    }
}

fn count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

/// Memberships spanning at least the given number of distinct clubs.
pub struct ClubSpan(pub i32);

impl Predicate for ClubSpan {
    fn is_satisfied(&self, user: &UserAggregate, now: DateTime<Utc>) -> bool {
        self.progress(user, now).map_or(false, |p| p.is_complete())
    }

    fn progress(&self, user: &UserAggregate, _now: DateTime<Utc>) -> Option<Progress> {
        Some(Progress {
            current: count(user.distinct_clubs().len()),
            target: self.0,
        })
    }
}

/// Officer roles held in at least the given number of distinct clubs.
pub struct LeadershipSpan(pub i32);

impl Predicate for LeadershipSpan {
    fn is_satisfied(&self, user: &UserAggregate, now: DateTime<Utc>) -> bool {
        self.progress(user, now).map_or(false, |p| p.is_complete())
    }

    fn progress(&self, user: &UserAggregate, _now: DateTime<Utc>) -> Option<Progress> {
        Some(Progress {
            current: count(user.leadership_clubs().len()),
            target: self.0,
        })
    }
}

pub struct ManagedChapters(pub i32);

impl Predicate for ManagedChapters {
    fn is_satisfied(&self, user: &UserAggregate, now: DateTime<Utc>) -> bool {
        self.progress(user, now).map_or(false, |p| p.is_complete())
    }

    fn progress(&self, user: &UserAggregate, _now: DateTime<Utc>) -> Option<Progress> {
        Some(Progress {
            current: count(user.managed_chapters().len()),
            target: self.0,
        })
    }
}

/// Some membership at least `days` old.
pub struct Tenure {
    pub days: i64,
}

impl Predicate for Tenure {
    fn is_satisfied(&self, user: &UserAggregate, now: DateTime<Utc>) -> bool {
        let cutoff = now - Duration::days(self.days);
        user.memberships.iter().any(|m| m.created_at <= cutoff)
    }

    fn progress(&self, user: &UserAggregate, now: DateTime<Utc>) -> Option<Progress> {
        let earliest = user.earliest_membership()?;
        let elapsed = (now - earliest).num_days().clamp(0, self.days);
        Some(Progress {
            current: i32::try_from(elapsed).unwrap_or(i32::MAX),
            target: i32::try_from(self.days).unwrap_or(i32::MAX),
        })
    }
}

pub const PRESIDENT_BADGE: &str = "president_badge";
pub const VICE_PRESIDENT_BADGE: &str = "vice_president_badge";
pub const SECRETARY_BADGE: &str = "secretary_badge";
pub const TREASURER_BADGE: &str = "treasurer_badge";
pub const CLUB_FOUNDER_BADGE: &str = "club_founder_badge";
pub const MULTI_CLUB_LEADER_BADGE: &str = "multi_club_leader_badge";
pub const FIRST_TIMER_BADGE: &str = "first_timer_badge";
pub const MULTI_CLUB_MEMBER_BADGE: &str = "multi_club_member_badge";
pub const SOCIAL_BUTTERFLY_BADGE: &str = "social_butterfly_badge";
pub const VETERAN_RIDER_BADGE: &str = "veteran_rider_badge";
pub const CHAPTER_CREATOR_BADGE: &str = "chapter_creator_badge";

lazy_static::lazy_static! {
    pub static ref REGISTRY: HashMap<&'static str, Box<dyn Predicate>> = {
        let mut registry: HashMap<&'static str, Box<dyn Predicate>> = HashMap::new();
        registry.insert(PRESIDENT_BADGE, Box::new(HoldsRole(MemberRole::President)));
        registry.insert(VICE_PRESIDENT_BADGE, Box::new(HoldsRole(MemberRole::VicePresident)));
        registry.insert(SECRETARY_BADGE, Box::new(HoldsRole(MemberRole::Secretary)));
        registry.insert(TREASURER_BADGE, Box::new(HoldsRole(MemberRole::Treasurer)));
        registry.insert(CLUB_FOUNDER_BADGE, Box::new(AdministersAnyClub));
        registry.insert(MULTI_CLUB_LEADER_BADGE, Box::new(LeadershipSpan(2)));
        registry.insert(FIRST_TIMER_BADGE, Box::new(HasMembership));
        registry.insert(MULTI_CLUB_MEMBER_BADGE, Box::new(ClubSpan(2)));
        registry.insert(SOCIAL_BUTTERFLY_BADGE, Box::new(ClubSpan(3)));
        registry.insert(VETERAN_RIDER_BADGE, Box::new(Tenure { days: 365 }));
        registry.insert(CHAPTER_CREATOR_BADGE, Box::new(ManagedChapters(2)));
        registry
    };
}

pub fn predicate_for(code: &str) -> Option<&'static dyn Predicate> {
    REGISTRY.get(code).map(|p| p.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(member_id: i32, club_id: i32, role: MemberRole, age_days: i64) -> MembershipFact {
        MembershipFact {
            member_id,
            chapter_id: member_id * 10,
            club_id,
            role,
            created_at: Utc::now() - Duration::days(age_days),
        }
    }

    fn check(code: &str, user: &UserAggregate) -> bool {
        predicate_for(code)
            .expect("registered predicate")
            .is_satisfied(user, Utc::now())
    }

    #[test]
    fn registry_covers_the_catalogue() {
        for code in [
            PRESIDENT_BADGE,
            VICE_PRESIDENT_BADGE,
            SECRETARY_BADGE,
            TREASURER_BADGE,
            CLUB_FOUNDER_BADGE,
            MULTI_CLUB_LEADER_BADGE,
            FIRST_TIMER_BADGE,
            MULTI_CLUB_MEMBER_BADGE,
            SOCIAL_BUTTERFLY_BADGE,
            VETERAN_RIDER_BADGE,
            CHAPTER_CREATOR_BADGE,
        ] {
            assert!(predicate_for(code).is_some(), "{code}");
        }
        assert!(predicate_for("unknown_badge").is_none());
    }

    #[test]
    fn empty_user_earns_nothing() {
        let user = UserAggregate::default();
        for code in REGISTRY.keys() {
            assert!(!check(code, &user), "{code}");
        }
    }

    #[test]
    fn role_badges() {
        let user = UserAggregate {
            memberships: vec![
                fact(1, 1, MemberRole::Secretary, 0),
                fact(2, 2, MemberRole::Rider, 0),
            ],
            ..Default::default()
        };
        assert!(check(SECRETARY_BADGE, &user));
        assert!(!check(PRESIDENT_BADGE, &user));
        assert!(!check(TREASURER_BADGE, &user));
        assert!(check(FIRST_TIMER_BADGE, &user));
    }

    #[test]
    fn multi_club_member_and_social_butterfly() {
        let mut user = UserAggregate {
            memberships: vec![
                fact(1, 1, MemberRole::Rider, 0),
                fact(2, 1, MemberRole::Member, 0),
            ],
            ..Default::default()
        };
        // two chapters of the same club are still one club
        assert!(!check(MULTI_CLUB_MEMBER_BADGE, &user));

        user.memberships.push(fact(3, 2, MemberRole::Member, 0));
        assert!(check(MULTI_CLUB_MEMBER_BADGE, &user));
        assert!(!check(SOCIAL_BUTTERFLY_BADGE, &user));

        user.memberships.push(fact(4, 3, MemberRole::Member, 0));
        assert!(check(SOCIAL_BUTTERFLY_BADGE, &user));

        let progress = predicate_for(SOCIAL_BUTTERFLY_BADGE)
            .unwrap()
            .progress(&user, Utc::now())
            .unwrap();
        assert_eq!(progress, Progress { current: 3, target: 3 });
    }

    #[test]
    fn multi_club_leader_needs_officer_roles_in_two_clubs() {
        let mut user = UserAggregate {
            memberships: vec![
                fact(1, 1, MemberRole::President, 0),
                fact(2, 1, MemberRole::Treasurer, 0),
                fact(3, 2, MemberRole::RoadCaptain, 0),
            ],
            ..Default::default()
        };
        assert!(!check(MULTI_CLUB_LEADER_BADGE, &user));
        user.memberships.push(fact(4, 2, MemberRole::VicePresident, 0));
        assert!(check(MULTI_CLUB_LEADER_BADGE, &user));
    }

    #[test]
    fn veteran_rider_after_a_year() {
        let mut user = UserAggregate {
            memberships: vec![fact(1, 1, MemberRole::Member, 364)],
            ..Default::default()
        };
        assert!(!check(VETERAN_RIDER_BADGE, &user));
        let progress = predicate_for(VETERAN_RIDER_BADGE)
            .unwrap()
            .progress(&user, Utc::now())
            .unwrap();
        assert_eq!(progress.target, 365);
        assert!(progress.current >= 363 && progress.current <= 364);

        user.memberships.push(fact(2, 2, MemberRole::Member, 366));
        assert!(check(VETERAN_RIDER_BADGE, &user));
    }

    #[test]
    fn club_founder_and_chapter_creator() {
        let mut user = UserAggregate::default();
        user.admin_club_ids.insert(1);
        user.admin_club_chapter_ids.insert(10);
        assert!(check(CLUB_FOUNDER_BADGE, &user));
        assert!(!check(CHAPTER_CREATOR_BADGE, &user));

        // overlap between club chapters and direct chapter admin counts once
        user.admin_chapter_ids.insert(10);
        assert!(!check(CHAPTER_CREATOR_BADGE, &user));

        user.admin_chapter_ids.insert(30);
        assert!(check(CHAPTER_CREATOR_BADGE, &user));
    }

    #[test]
    fn chapter_admin_alone_is_not_a_founder() {
        let mut user = UserAggregate::default();
        user.admin_chapter_ids.insert(5);
        assert!(!check(CLUB_FOUNDER_BADGE, &user));
    }
}

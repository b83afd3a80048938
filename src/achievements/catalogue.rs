use super::predicates::*;
use crate::{error::AppResult, schema::achievements, types::{AchievementCategory, Difficulty}};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = achievements)]
pub struct AchievementDefinition {
    pub code: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub category: AchievementCategory,
    pub difficulty: Difficulty,
    pub points: i32,
    pub icon: &'static str,
    pub is_repeatable: bool,
    pub requires_verification: bool,
}

const fn badge(
    code: &'static str,
    name: &'static str,
    description: &'static str,
    category: AchievementCategory,
    difficulty: Difficulty,
    points: i32,
    icon: &'static str,
) -> AchievementDefinition {
    AchievementDefinition {
        code,
        name,
        description,
        category,
        difficulty,
        points,
        icon,
        is_repeatable: false,
        requires_verification: false,
    }
}

pub const DEFAULT_CATALOGUE: &[AchievementDefinition] = &[
    badge(
        PRESIDENT_BADGE,
        "President",
        "Serve as president of a chapter.",
        AchievementCategory::Leadership,
        Difficulty::Hard,
        100,
        "crown",
    ),
    badge(
        VICE_PRESIDENT_BADGE,
        "Vice President",
        "Serve as vice president of a chapter.",
        AchievementCategory::Leadership,
        Difficulty::Medium,
        75,
        "medal",
    ),
    badge(
        SECRETARY_BADGE,
        "Secretary",
        "Keep the books as chapter secretary.",
        AchievementCategory::Leadership,
        Difficulty::Medium,
        50,
        "scroll",
    ),
    badge(
        TREASURER_BADGE,
        "Treasurer",
        "Handle the funds as chapter treasurer.",
        AchievementCategory::Leadership,
        Difficulty::Medium,
        50,
        "coins",
    ),
    badge(
        CLUB_FOUNDER_BADGE,
        "Club Founder",
        "Found or administer a club.",
        AchievementCategory::Leadership,
        Difficulty::Hard,
        150,
        "flag",
    ),
    badge(
        MULTI_CLUB_LEADER_BADGE,
        "Multi-Club Leader",
        "Hold an officer role in two different clubs.",
        AchievementCategory::Leadership,
        Difficulty::Legendary,
        200,
        "star",
    ),
    badge(
        FIRST_TIMER_BADGE,
        "First Timer",
        "Join your first chapter.",
        AchievementCategory::Membership,
        Difficulty::Easy,
        10,
        "helmet",
    ),
    badge(
        MULTI_CLUB_MEMBER_BADGE,
        "Multi-Club Member",
        "Ride with two different clubs.",
        AchievementCategory::Social,
        Difficulty::Medium,
        40,
        "handshake",
    ),
    badge(
        SOCIAL_BUTTERFLY_BADGE,
        "Social Butterfly",
        "Ride with three different clubs.",
        AchievementCategory::Social,
        Difficulty::Hard,
        80,
        "butterfly",
    ),
    badge(
        VETERAN_RIDER_BADGE,
        "Veteran Rider",
        "Stay on a roster for a full year.",
        AchievementCategory::Milestone,
        Difficulty::Medium,
        60,
        "road",
    ),
    badge(
        CHAPTER_CREATOR_BADGE,
        "Chapter Creator",
        "Oversee at least two chapters.",
        AchievementCategory::Leadership,
        Difficulty::Hard,
        120,
        "map",
    ),
];

/// Inserts missing catalogue entries. Existing rows (possibly edited by an
/// operator) are left alone.
pub async fn seed_catalogue(conn: &mut AsyncPgConnection) -> AppResult<usize> {
    let inserted = diesel::insert_into(achievements::table)
        .values(DEFAULT_CATALOGUE.to_vec())
        .on_conflict(achievements::code)
        .do_nothing()
        .execute(conn)
        .await?;
    if inserted > 0 {
        tracing::info!(inserted, "seeded achievement catalogue");
    }
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn every_catalogue_entry_has_a_predicate() {
        for definition in DEFAULT_CATALOGUE {
            assert!(
                predicate_for(definition.code).is_some(),
                "{} has no predicate",
                definition.code
            );
        }
    }

    #[test]
    fn catalogue_codes_are_unique() {
        let codes: HashSet<_> = DEFAULT_CATALOGUE.iter().map(|d| d.code).collect();
        assert_eq!(codes.len(), DEFAULT_CATALOGUE.len());
        assert_eq!(codes.len(), REGISTRY.len());
    }
}

//! Achievement engine.
//!
//! Checks run synchronously inside the transaction of the write that
//! triggered them and observe the post-write state. Each award runs in its
//! own savepoint so a failing badge never aborts the caller.

use crate::{
    error::{AppError, AppResult},
    models::{Achievement, AchievementProgress, Chapter, Club, Member, UserAchievement},
    schema::*,
    types::MemberRole,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{scoped_futures::ScopedFutureExt, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashSet};

pub mod catalogue;
pub mod predicates;

pub use catalogue::seed_catalogue;
use predicates::{predicate_for, MembershipFact, Progress, UserAggregate};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextRef {
    pub id: i32,
    pub name: Option<String>,
}

/// What caused a check. Only used to annotate awards.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerContext {
    pub trigger: &'static str,
    pub member: Option<ContextRef>,
    pub chapter: Option<ContextRef>,
    pub club: Option<ContextRef>,
}

impl TriggerContext {
    pub fn new(trigger: &'static str) -> Self {
        TriggerContext {
            trigger,
            member: None,
            chapter: None,
            club: None,
        }
    }

    pub fn with_member(mut self, member: &Member) -> Self {
        self.member = Some(ContextRef {
            id: member.id,
            name: Some(member.full_name()),
        });
        self
    }

    pub fn with_chapter(mut self, chapter: &Chapter) -> Self {
        self.chapter = Some(ContextRef {
            id: chapter.id,
            name: Some(chapter.name.clone()),
        });
        if self.club.is_none() {
            self.club = Some(ContextRef {
                id: chapter.club_id,
                name: None,
            });
        }
        self
    }

    pub fn with_club(mut self, club: &Club) -> Self {
        self.club = Some(ContextRef {
            id: club.id,
            name: Some(club.name.clone()),
        });
        self
    }

    pub fn with_club_id(mut self, club_id: i32) -> Self {
        if self.club.is_none() {
            self.club = Some(ContextRef {
                id: club_id,
                name: None,
            });
        }
        self
    }

    pub fn source_member_id(&self) -> Option<i32> {
        self.member.as_ref().map(|m| m.id)
    }

    pub fn source_club_id(&self) -> Option<i32> {
        self.club.as_ref().map(|c| c.id)
    }

    /// JSON-safe snapshot stored on the award.
    pub fn to_progress_data(&self) -> Value {
        let mut map = Map::new();
        map.insert("trigger".to_string(), json!(self.trigger));
        for (key, reference) in [
            ("member", &self.member),
            ("chapter", &self.chapter),
            ("club", &self.club),
        ] {
            if let Some(reference) = reference {
                map.insert(key.to_string(), json!(reference));
            }
        }
        Value::Object(map)
    }
}

/// Loads everything the predicates look at for one user.
pub async fn load_aggregate(conn: &mut AsyncPgConnection, user_id: i32) -> AppResult<UserAggregate> {
    let memberships = members::table
        .inner_join(chapters::table)
        .filter(members::user_id.eq(user_id))
        .select((
            members::id,
            members::chapter_id,
            chapters::club_id,
            members::role,
            members::created_at,
        ))
        .load::<(i32, i32, i32, MemberRole, DateTime<Utc>)>(conn)
        .await?
        .into_iter()
        .map(|(member_id, chapter_id, club_id, role, created_at)| MembershipFact {
            member_id,
            chapter_id,
            club_id,
            role,
            created_at,
        })
        .collect();

    let admin_club_ids = club_admins::table
        .filter(club_admins::user_id.eq(user_id))
        .select(club_admins::club_id)
        .load::<i32>(conn)
        .await?;

    let admin_chapter_ids = chapter_admins::table
        .filter(chapter_admins::user_id.eq(user_id))
        .select(chapter_admins::chapter_id)
        .load::<i32>(conn)
        .await?;

    let admin_club_chapter_ids = if admin_club_ids.is_empty() {
        Vec::new()
    } else {
        chapters::table
            .filter(chapters::club_id.eq_any(&admin_club_ids))
            .select(chapters::id)
            .load::<i32>(conn)
            .await?
    };

    Ok(UserAggregate {
        memberships,
        admin_club_ids: admin_club_ids.into_iter().collect(),
        admin_chapter_ids: admin_chapter_ids.into_iter().collect(),
        admin_club_chapter_ids: admin_club_chapter_ids.into_iter().collect(),
    })
}

/// Writes an award. Non-repeatable achievements already held by the user
/// give `None`; repeatable ones always gain a new row.
pub async fn award_achievement(
    conn: &mut AsyncPgConnection,
    user_id: i32,
    achievement: &Achievement,
    context: &TriggerContext,
) -> AppResult<Option<UserAchievement>> {
    #[derive(Insertable)]
    #[diesel(table_name = user_achievements)]
    struct NewUserAchievement {
        user_id: i32,
        achievement_id: i32,
        source_member_id: Option<i32>,
        source_club_id: Option<i32>,
        progress_data: Value,
        repeatable: bool,
    }

    let insert = diesel::insert_into(user_achievements::table).values(NewUserAchievement {
        user_id,
        achievement_id: achievement.id,
        source_member_id: context.source_member_id(),
        source_club_id: context.source_club_id(),
        progress_data: context.to_progress_data(),
        repeatable: achievement.is_repeatable,
    });

    let award = if achievement.is_repeatable {
        Some(
            insert
                .returning(UserAchievement::as_returning())
                .get_result(conn)
                .await?,
        )
    } else {
        insert
            .on_conflict_do_nothing()
            .returning(UserAchievement::as_returning())
            .get_result(conn)
            .await
            .optional()?
    };

    if let Some(award) = &award {
        tracing::info!(
            user_id,
            achievement = %achievement.code,
            trigger = context.trigger,
            award_id = award.id,
            "achievement awarded"
        );
    }
    Ok(award)
}

/// Upserts the `(user, achievement)` counter.
pub async fn record_progress(
    conn: &mut AsyncPgConnection,
    user_id: i32,
    achievement_id: i32,
    progress: Progress,
    context: &TriggerContext,
) -> AppResult<AchievementProgress> {
    #[derive(Insertable, AsChangeset)]
    #[diesel(table_name = achievement_progress)]
    struct ProgressRow {
        user_id: i32,
        achievement_id: i32,
        current_value: i32,
        target_value: Option<i32>,
        progress_data: Value,
        updated_at: DateTime<Utc>,
    }

    let row = ProgressRow {
        user_id,
        achievement_id,
        current_value: progress.current,
        target_value: Some(progress.target),
        progress_data: context.to_progress_data(),
        updated_at: Utc::now(),
    };

    Ok(diesel::insert_into(achievement_progress::table)
        .values(&row)
        .on_conflict((achievement_progress::user_id, achievement_progress::achievement_id))
        .do_update()
        .set(&row)
        .returning(AchievementProgress::as_returning())
        .get_result(conn)
        .await?)
}

async fn evaluate_one(
    conn: &mut AsyncPgConnection,
    user_id: i32,
    achievement: &Achievement,
    aggregate: &UserAggregate,
    now: DateTime<Utc>,
    context: &TriggerContext,
) -> AppResult<Option<UserAchievement>> {
    let Some(predicate) = predicate_for(&achievement.code) else {
        tracing::debug!(code = %achievement.code, "no predicate registered");
        return Ok(None);
    };

    if let Some(progress) = predicate.progress(aggregate, now) {
        record_progress(conn, user_id, achievement.id, progress, context).await?;
    }

    if !predicate.is_satisfied(aggregate, now) {
        return Ok(None);
    }
    award_achievement(conn, user_id, achievement, context).await
}

/// Evaluates every active achievement the user does not hold yet and
/// awards the satisfied ones. Returns the new awards.
pub async fn check_user_achievements(
    conn: &mut AsyncPgConnection,
    user_id: i32,
    context: &TriggerContext,
) -> AppResult<Vec<UserAchievement>> {
    let held: HashSet<i32> = user_achievements::table
        .filter(user_achievements::user_id.eq(user_id))
        .select(user_achievements::achievement_id)
        .load::<i32>(conn)
        .await?
        .into_iter()
        .collect();

    let candidates = achievements::table
        .filter(achievements::is_active.eq(true))
        .order(achievements::id)
        .select(Achievement::as_select())
        .load(conn)
        .await?
        .into_iter()
        .filter(|a| !held.contains(&a.id))
        .collect::<Vec<_>>();
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let aggregate = load_aggregate(conn, user_id).await?;
    let now = Utc::now();

    let mut awarded = Vec::new();
    for achievement in &candidates {
        let aggregate = &aggregate;
        let result = conn
            .transaction(|conn| {
                async move { evaluate_one(conn, user_id, achievement, aggregate, now, context).await }
                    .scope_boxed()
            })
            .await;
        match result {
            Ok(Some(award)) => awarded.push(award),
            Ok(None) => {}
            Err(err) => tracing::warn!(
                user_id,
                code = %achievement.code,
                error = ?err,
                "achievement check failed, skipping"
            ),
        }
    }
    Ok(awarded)
}

/// [`check_user_achievements`] behind a savepoint. Failures are logged and
/// the triggering mutation carries on.
pub async fn check_contained(
    conn: &mut AsyncPgConnection,
    user_id: i32,
    context: &TriggerContext,
) -> Vec<UserAchievement> {
    let result = conn
        .transaction(|conn| {
            async move { check_user_achievements(conn, user_id, context).await }.scope_boxed()
        })
        .await;
    match result {
        Ok(awards) => awards,
        Err(err) => {
            tracing::warn!(user_id, trigger = context.trigger, error = ?err, "achievement engine failed");
            Vec::new()
        }
    }
}

/// Direct award of an active achievement by code. For a non-repeatable badge
/// the user already holds, the existing award is returned with `false`.
pub async fn award_by_code(
    conn: &mut AsyncPgConnection,
    user_id: i32,
    code: &str,
    context: &TriggerContext,
) -> AppResult<(UserAchievement, bool)> {
    let achievement = achievements::table
        .filter(achievements::code.eq(code))
        .filter(achievements::is_active.eq(true))
        .select(Achievement::as_select())
        .first(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::not_found("achievement"))?;

    let user_exists = diesel::select(diesel::dsl::exists(users::table.find(user_id)))
        .get_result::<bool>(conn)
        .await?;
    if !user_exists {
        return Err(AppError::field("user", "user does not exist"));
    }

    if let Some(award) = award_achievement(conn, user_id, &achievement, context).await? {
        return Ok((award, true));
    }

    let existing = user_achievements::table
        .filter(user_achievements::user_id.eq(user_id))
        .filter(user_achievements::achievement_id.eq(achievement.id))
        .order(user_achievements::earned_at.asc())
        .select(UserAchievement::as_select())
        .first(conn)
        .await?;
    Ok((existing, false))
}

/// Stamps the verifier on an award. Already verified awards keep their
/// original verifier.
pub async fn verify_award(
    conn: &mut AsyncPgConnection,
    award_id: i32,
    verifier_id: i32,
) -> AppResult<UserAchievement> {
    let updated = diesel::update(
        user_achievements::table
            .find(award_id)
            .filter(user_achievements::verified_by.is_null()),
    )
    .set((
        user_achievements::verified_by.eq(verifier_id),
        user_achievements::verified_at.eq(Utc::now()),
    ))
    .returning(UserAchievement::as_returning())
    .get_result(conn)
    .await
    .optional()?;

    if let Some(award) = updated {
        tracing::info!(award_id, verifier_id, "achievement verified");
        return Ok(award);
    }

    user_achievements::table
        .find(award_id)
        .select(UserAchievement::as_select())
        .first(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::not_found("user achievement"))
}

#[derive(Debug, Serialize)]
pub struct AwardView {
    pub award: UserAchievement,
    pub achievement: Achievement,
    pub is_verified: bool,
}

impl AwardView {
    pub fn new(award: UserAchievement, achievement: Achievement) -> Self {
        AwardView {
            is_verified: award.is_verified(&achievement),
            award,
            achievement,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProgressView {
    pub achievement: String,
    pub name: String,
    pub current_value: i32,
    pub target_value: Option<i32>,
    pub percentage: f64,
}

#[derive(Debug, Serialize)]
pub struct AchievementSummary {
    pub total_points: i64,
    pub total_achievements: usize,
    pub by_category: BTreeMap<&'static str, usize>,
    pub recent: Vec<AwardView>,
    pub in_progress: Vec<ProgressView>,
}

const RECENT_AWARDS: usize = 5;

/// Awards of one user, newest first.
pub async fn awards_for_user(conn: &mut AsyncPgConnection, user_id: i32) -> AppResult<Vec<AwardView>> {
    Ok(user_achievements::table
        .inner_join(achievements::table)
        .filter(user_achievements::user_id.eq(user_id))
        .order((user_achievements::earned_at.desc(), user_achievements::id.desc()))
        .select((UserAchievement::as_select(), Achievement::as_select()))
        .load::<(UserAchievement, Achievement)>(conn)
        .await?
        .into_iter()
        .map(|(award, achievement)| AwardView::new(award, achievement))
        .collect())
}

pub async fn summary(conn: &mut AsyncPgConnection, user_id: i32) -> AppResult<AchievementSummary> {
    let awards = awards_for_user(conn, user_id).await?;

    let progress = achievement_progress::table
        .inner_join(achievements::table)
        .filter(achievement_progress::user_id.eq(user_id))
        .order(achievements::id)
        .select((AchievementProgress::as_select(), Achievement::as_select()))
        .load::<(AchievementProgress, Achievement)>(conn)
        .await?;

    Ok(build_summary(awards, progress))
}

fn build_summary(
    awards: Vec<AwardView>,
    progress: Vec<(AchievementProgress, Achievement)>,
) -> AchievementSummary {
    let total_points = awards.iter().map(|a| i64::from(a.achievement.points)).sum();
    let mut by_category = BTreeMap::new();
    for award in &awards {
        *by_category.entry(award.achievement.category.as_str()).or_insert(0) += 1;
    }

    let in_progress = progress
        .into_iter()
        .filter(|(row, _)| !row.is_complete())
        .map(|(row, achievement)| ProgressView {
            percentage: row.percentage(),
            achievement: achievement.code,
            name: achievement.name,
            current_value: row.current_value,
            target_value: row.target_value,
        })
        .collect();

    AchievementSummary {
        total_points,
        total_achievements: awards.len(),
        by_category,
        recent: awards.into_iter().take(RECENT_AWARDS).collect(),
        in_progress,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AchievementCategory, Difficulty, MemberType};

    fn achievement(id: i32, category: AchievementCategory, points: i32) -> Achievement {
        Achievement {
            id,
            code: format!("badge_{id}"),
            name: format!("Badge {id}"),
            description: String::new(),
            category,
            difficulty: Difficulty::Easy,
            points,
            icon: String::new(),
            is_repeatable: false,
            requires_verification: false,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    fn award(id: i32, achievement_id: i32) -> UserAchievement {
        UserAchievement {
            id,
            user_id: 1,
            achievement_id,
            earned_at: Utc::now(),
            source_member_id: None,
            source_club_id: None,
            verified_by: None,
            verified_at: None,
            progress_data: Value::Null,
            repeatable: false,
        }
    }

    fn progress(achievement_id: i32, current: i32, target: i32) -> AchievementProgress {
        AchievementProgress {
            id: achievement_id,
            user_id: 1,
            achievement_id,
            current_value: current,
            target_value: Some(target),
            progress_data: Value::Null,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn context_snapshot_carries_ids_and_names() {
        let member = Member {
            id: 12,
            chapter_id: 3,
            user_id: Some(1),
            first_name: "Jane".to_string(),
            last_name: Some("Roe".to_string()),
            nickname: None,
            role: MemberRole::Secretary,
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
        };
        let context = TriggerContext::new("member_created")
            .with_member(&member)
            .with_club_id(4);

        assert_eq!(context.source_member_id(), Some(12));
        assert_eq!(context.source_club_id(), Some(4));
        assert_eq!(
            context.to_progress_data(),
            json!({
                "trigger": "member_created",
                "member": {"id": 12, "name": "Jane Roe"},
                "club": {"id": 4, "name": null},
            })
        );
    }

    #[test]
    fn bare_context_only_names_the_trigger() {
        let context = TriggerContext::new("manual_check");
        assert_eq!(context.to_progress_data(), json!({"trigger": "manual_check"}));
        assert_eq!(context.source_club_id(), None);
    }

    #[test]
    fn summary_totals_and_progress() {
        let leadership = achievement(1, AchievementCategory::Leadership, 100);
        let social = achievement(2, AchievementCategory::Social, 40);
        let other_social = achievement(3, AchievementCategory::Social, 80);
        let awards = vec![
            AwardView::new(award(1, 1), leadership.clone()),
            AwardView::new(award(2, 2), social.clone()),
        ];

        let summary = build_summary(
            awards,
            vec![(progress(2, 2, 2), social), (progress(3, 2, 3), other_social)],
        );

        assert_eq!(summary.total_points, 140);
        assert_eq!(summary.total_achievements, 2);
        assert_eq!(summary.by_category.get("leadership"), Some(&1));
        assert_eq!(summary.by_category.get("social"), Some(&1));
        assert_eq!(summary.recent.len(), 2);
        assert_eq!(summary.in_progress.len(), 1);
        assert_eq!(summary.in_progress[0].achievement, "badge_3");
        assert!((summary.in_progress[0].percentage - 66.666).abs() < 0.01);
    }

    #[test]
    fn recent_awards_are_capped() {
        let awards = (1..=8)
            .map(|i| AwardView::new(award(i, i), achievement(i, AchievementCategory::Milestone, 10)))
            .collect();
        let summary = build_summary(awards, Vec::new());
        assert_eq!(summary.total_achievements, 8);
        assert_eq!(summary.total_points, 80);
        assert_eq!(summary.recent.len(), RECENT_AWARDS);
    }
}

use crate::schema::*;
use crate::types::{
    AchievementCategory, ClubType, Difficulty, InvitationStatus, JoinRequestStatus, MemberProfile,
    MemberRole, MemberType,
};
use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

diesel::sql_function! {
    /// Case folding used by the case-insensitive unique indexes.
    fn lower(x: diesel::sql_types::Text) -> diesel::sql_types::Text;
}

diesel::sql_function! {
    fn coalesce(x: diesel::sql_types::Nullable<diesel::sql_types::Text>, y: diesel::sql_types::Text) -> diesel::sql_types::Text;
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: i32,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub is_superuser: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Name used for the founder's roster row and in emails.
    pub fn display_first_name(&self) -> &str {
        if self.first_name.trim().is_empty() {
            &self.username
        } else {
            &self.first_name
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = auth_sessions)]
pub struct AuthSession {
    pub id: i32,
    pub user_id: i32,
    pub token_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = countries)]
pub struct Country {
    pub id: i32,
    pub name: String,
    pub code: String,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = states)]
pub struct State {
    pub id: i32,
    pub country_id: i32,
    pub name: String,
    pub code: Option<String>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = clubs)]
pub struct Club {
    pub id: i32,
    pub name: String,
    pub description: String,
    pub foundation_date: Option<NaiveDate>,
    pub logo_url: Option<String>,
    pub is_public: bool,
    pub accepts_new_chapters: bool,
    pub total_members: i32,
    pub total_chapters: i32,
    pub club_type: ClubType,
    pub country_id: Option<i32>,
    pub state_id: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = chapters)]
pub struct Chapter {
    pub id: i32,
    #[serde(rename = "club")]
    pub club_id: i32,
    pub name: String,
    pub description: String,
    #[serde(rename = "owner")]
    pub owner_id: Option<i32>,
    pub city: Option<String>,
    pub state_id: Option<i32>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub is_public: bool,
    pub is_active: bool,
    pub accepts_new_members: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = members)]
pub struct Member {
    pub id: i32,
    #[serde(rename = "chapter")]
    pub chapter_id: i32,
    #[serde(rename = "user")]
    pub user_id: Option<i32>,
    pub first_name: String,
    pub last_name: Option<String>,
    pub nickname: Option<String>,
    pub role: MemberRole,
    pub national_role: Option<MemberRole>,
    pub member_type: MemberType,
    pub profile_picture_url: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    #[serde(skip_serializing)]
    pub claim_code: Option<String>,
    #[serde(skip_serializing)]
    pub claimed_code: Option<String>,
    pub is_active: bool,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Member {
    pub fn profile(&self) -> MemberProfile {
        MemberProfile::from_columns(self.member_type, &self.metadata)
    }

    pub fn full_name(&self) -> String {
        match self.last_name.as_deref().map(str::trim) {
            Some(last) if !last.is_empty() => format!("{} {}", self.first_name, last),
            _ => self.first_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = club_admins)]
pub struct ClubAdmin {
    pub id: i32,
    #[serde(rename = "user")]
    pub user_id: i32,
    #[serde(rename = "club")]
    pub club_id: i32,
    pub created_by: Option<i32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = chapter_admins)]
pub struct ChapterAdmin {
    pub id: i32,
    #[serde(rename = "user")]
    pub user_id: i32,
    #[serde(rename = "chapter")]
    pub chapter_id: i32,
    pub created_by: Option<i32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = chapter_join_requests)]
pub struct ChapterJoinRequest {
    pub id: i32,
    #[serde(rename = "club")]
    pub club_id: i32,
    pub requested_by: i32,
    pub chapter_name: String,
    pub city: Option<String>,
    pub state_id: Option<i32>,
    pub description: String,
    pub reason: String,
    pub estimated_members: Option<i32>,
    pub status: JoinRequestStatus,
    pub admin_notes: Option<String>,
    pub reviewed_by: Option<i32>,
    #[serde(rename = "chapter")]
    pub chapter_id: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = invitations)]
pub struct Invitation {
    pub id: i32,
    pub email: String,
    pub first_name: String,
    pub last_name: Option<String>,
    #[serde(rename = "club")]
    pub club_id: i32,
    #[serde(rename = "chapter")]
    pub chapter_id: i32,
    pub role: MemberRole,
    pub invited_by: Option<i32>,
    pub message: String,
    pub token: Uuid,
    pub status: InvitationStatus,
    #[serde(rename = "member")]
    pub member_id: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = achievements)]
pub struct Achievement {
    pub id: i32,
    pub code: String,
    pub name: String,
    pub description: String,
    pub category: AchievementCategory,
    pub difficulty: Difficulty,
    pub points: i32,
    pub icon: String,
    pub is_repeatable: bool,
    pub requires_verification: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = user_achievements)]
pub struct UserAchievement {
    pub id: i32,
    #[serde(rename = "user")]
    pub user_id: i32,
    #[serde(rename = "achievement")]
    pub achievement_id: i32,
    pub earned_at: DateTime<Utc>,
    pub source_member_id: Option<i32>,
    pub source_club_id: Option<i32>,
    pub verified_by: Option<i32>,
    pub verified_at: Option<DateTime<Utc>>,
    pub progress_data: Value,
    #[serde(skip_serializing)]
    pub repeatable: bool,
}

impl UserAchievement {
    pub fn is_verified(&self, achievement: &Achievement) -> bool {
        !achievement.requires_verification || self.verified_by.is_some()
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = achievement_progress)]
pub struct AchievementProgress {
    pub id: i32,
    #[serde(rename = "user")]
    pub user_id: i32,
    #[serde(rename = "achievement")]
    pub achievement_id: i32,
    pub current_value: i32,
    pub target_value: Option<i32>,
    pub progress_data: Value,
    pub updated_at: DateTime<Utc>,
}

impl AchievementProgress {
    pub fn percentage(&self) -> f64 {
        progress_percentage(self.current_value, self.target_value)
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.target_value, Some(target) if target > 0 && self.current_value >= target)
    }
}

/// `min(100, current / target * 100)`; missing or non-positive targets give 0.
pub fn progress_percentage(current: i32, target: Option<i32>) -> f64 {
    match target {
        Some(target) if target > 0 => (f64::from(current) / f64::from(target) * 100.0).min(100.0),
        _ => 0.0,
    }
}

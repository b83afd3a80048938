#![allow(dead_code)]

use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl, SimpleAsyncConnection};
use moto_club_hub::{
    accounts::{self, RegisterRequest},
    connect_to_db,
    models::User,
    rbac::Scope,
    schema::*,
    DbPool,
};
use tokio::sync::OnceCell;

const UP: &str = include_str!("../../migrations/2024-01-01-000000_create_core/up.sql");
const RESET: &str = "DROP SCHEMA IF EXISTS public CASCADE; CREATE SCHEMA public;";

static MIGRATED: OnceCell<bool> = OnceCell::const_new();

fn database_url() -> Option<String> {
    std::env::var("TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .ok()
}

/// Resets the schema once per test binary. `None` means no database is
/// configured or reachable and the test should return early.
pub async fn pool() -> Option<DbPool> {
    let Some(url) = database_url() else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return None;
    };
    let pool = connect_to_db(&url).ok()?;

    let migrated = MIGRATED
        .get_or_init(|| async {
            let Ok(mut conn) = pool.get().await else {
                return false;
            };
            if let Err(err) = conn.batch_execute(RESET).await {
                eprintln!("failed to reset the schema: {err}");
                return false;
            }
            if let Err(err) = conn.batch_execute(UP).await {
                eprintln!("failed to apply migration: {err}");
                return false;
            }
            moto_club_hub::achievements::seed_catalogue(&mut conn).await.is_ok()
        })
        .await;
    if !*migrated {
        eprintln!("database not reachable, skipping");
        return None;
    }
    Some(pool)
}

pub fn unique(prefix: &str) -> String {
    let suffix = nanoid::nanoid!(8, &"abcdefghijklmnopqrstuvwxyz0123456789".chars().collect::<Vec<_>>());
    format!("{prefix}{suffix}")
}

pub async fn user(conn: &mut AsyncPgConnection, first_name: &str) -> User {
    let username = unique(&first_name.to_lowercase());
    accounts::create_user(
        conn,
        &RegisterRequest {
            email: format!("{username}@example.com"),
            username,
            password: "correct horse".to_string(),
            first_name: first_name.to_string(),
            last_name: "Tester".to_string(),
        },
    )
    .await
    .unwrap()
}

pub async fn superuser(conn: &mut AsyncPgConnection) -> User {
    let user = user(conn, "Root").await;
    diesel::update(users::table.find(user.id))
        .set(users::is_superuser.eq(true))
        .returning(User::as_returning())
        .get_result(conn)
        .await
        .unwrap()
}

pub async fn scope(conn: &mut AsyncPgConnection, user: &User) -> Scope {
    Scope::load(conn, Some(user)).await.unwrap()
}

pub async fn award_codes(conn: &mut AsyncPgConnection, user_id: i32) -> Vec<String> {
    user_achievements::table
        .inner_join(achievements::table)
        .filter(user_achievements::user_id.eq(user_id))
        .select(achievements::code)
        .order(achievements::code)
        .load(conn)
        .await
        .unwrap()
}

pub async fn counters(conn: &mut AsyncPgConnection, club_id: i32) -> (i32, i32) {
    clubs::table
        .find(club_id)
        .select((clubs::total_chapters, clubs::total_members))
        .first(conn)
        .await
        .unwrap()
}

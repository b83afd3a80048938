use crate::{error::AppResult, schema::*};
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClubCounters {
    pub total_members: i32,
    pub total_chapters: i32,
}

/// Recomputes `total_chapters` (active chapters) and `total_members` (active
/// members of active chapters) for one club.
///
/// Must run inside the transaction of the write that changed the counts.
/// The club row is locked first so concurrent writers serialize here.
/// Returns `None` when the club no longer exists.
pub async fn refresh_club(
    conn: &mut AsyncPgConnection,
    club_id: i32,
) -> AppResult<Option<ClubCounters>> {
    let locked = clubs::table
        .find(club_id)
        .select(clubs::id)
        .for_update()
        .first::<i32>(conn)
        .await
        .optional()?;
    if locked.is_none() {
        return Ok(None);
    }

    let total_chapters = chapters::table
        .filter(chapters::club_id.eq(club_id))
        .filter(chapters::is_active.eq(true))
        .count()
        .get_result::<i64>(conn)
        .await?;

    let total_members = members::table
        .inner_join(chapters::table)
        .filter(chapters::club_id.eq(club_id))
        .filter(chapters::is_active.eq(true))
        .filter(members::is_active.eq(true))
        .count()
        .get_result::<i64>(conn)
        .await?;

    let counters = ClubCounters {
        total_members: i32::try_from(total_members)?,
        total_chapters: i32::try_from(total_chapters)?,
    };

    diesel::update(clubs::table.find(club_id))
        .set((
            clubs::total_members.eq(counters.total_members),
            clubs::total_chapters.eq(counters.total_chapters),
            clubs::updated_at.eq(Utc::now()),
        ))
        .execute(conn)
        .await?;

    tracing::debug!(
        club_id,
        total_members = counters.total_members,
        total_chapters = counters.total_chapters,
        "club counters refreshed"
    );
    Ok(Some(counters))
}

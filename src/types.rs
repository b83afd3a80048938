//! Closed enumerations stored as text columns, and the typed view over a
//! member's `member_type` + `metadata` pair.

use diesel::{
    deserialize::{self, FromSql, FromSqlRow},
    expression::AsExpression,
    pg::{Pg, PgValue},
    serialize::{self, IsNull, Output, ToSql},
    sql_types::Text,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::{fmt, io::Write, str::FromStr};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("`{value}` is not a valid {kind}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Patch fields over nullable columns: absent stays `None`, an explicit
/// null becomes `Some(None)`.
pub fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
            Serialize, Deserialize, AsExpression, FromSqlRow,
        )]
        #[diesel(sql_type = Text)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql<Text, Pg> for $name {
            fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
                out.write_all(self.as_str().as_bytes())?;
                Ok(IsNull::No)
            }
        }

        impl FromSql<Text, Pg> for $name {
            fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
                let raw = std::str::from_utf8(bytes.as_bytes())?;
                Ok(raw.parse::<$name>()?)
            }
        }
    };
}

text_enum! {
    /// Roster role inside a chapter.
    MemberRole {
        President => "president",
        VicePresident => "vice_president",
        Secretary => "secretary",
        Treasurer => "treasurer",
        RoadCaptain => "road_captain",
        SergeantAtArms => "sergeant_at_arms",
        EventCoordinator => "event_coordinator",
        Member => "member",
        Rider => "rider",
        Honorary => "honorary",
    }
}

impl MemberRole {
    /// Officer roles that count towards leadership badges.
    pub fn is_leadership(&self) -> bool {
        matches!(
            self,
            MemberRole::President
                | MemberRole::VicePresident
                | MemberRole::Secretary
                | MemberRole::Treasurer
        )
    }
}

impl Default for MemberRole {
    fn default() -> Self {
        MemberRole::Member
    }
}

text_enum! {
    MemberType {
        Pilot => "pilot",
        Copilot => "copilot",
        Prospect => "prospect",
    }
}

text_enum! {
    JoinRequestStatus {
        Pending => "pending",
        Approved => "approved",
        Rejected => "rejected",
    }
}

text_enum! {
    InvitationStatus {
        Pending => "pending",
        Accepted => "accepted",
        Declined => "declined",
        Expired => "expired",
    }
}

text_enum! {
    ClubType {
        MotorcycleClub => "motorcycle_club",
        RidingClub => "riding_club",
        Association => "association",
        Other => "other",
    }
}

impl Default for ClubType {
    fn default() -> Self {
        ClubType::MotorcycleClub
    }
}

text_enum! {
    AchievementCategory {
        Leadership => "leadership",
        Membership => "membership",
        Milestone => "milestone",
        Social => "social",
        Special => "special",
    }
}

text_enum! {
    Difficulty {
        Easy => "easy",
        Medium => "medium",
        Hard => "hard",
        Legendary => "legendary",
    }
}

/// Typed view of `member_type` + the copilot keys inside `metadata`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "member_type", rename_all = "snake_case")]
pub enum MemberProfile {
    Pilot,
    Copilot {
        #[serde(default)]
        is_vested: bool,
        #[serde(default)]
        linked_to: Option<i32>,
    },
    Prospect,
}

impl Default for MemberProfile {
    fn default() -> Self {
        MemberProfile::Pilot
    }
}

impl MemberProfile {
    pub fn member_type(&self) -> MemberType {
        match self {
            MemberProfile::Pilot => MemberType::Pilot,
            MemberProfile::Copilot { .. } => MemberType::Copilot,
            MemberProfile::Prospect => MemberType::Prospect,
        }
    }

    /// Rebuilds the profile from stored columns. Missing or mistyped copilot
    /// keys fall back to their defaults.
    pub fn from_columns(member_type: MemberType, metadata: &Value) -> Self {
        match member_type {
            MemberType::Pilot => MemberProfile::Pilot,
            MemberType::Prospect => MemberProfile::Prospect,
            MemberType::Copilot => MemberProfile::Copilot {
                is_vested: metadata
                    .get("is_vested")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                linked_to: metadata
                    .get("linked_to")
                    .and_then(Value::as_i64)
                    .and_then(|id| i32::try_from(id).ok()),
            },
        }
    }

    /// Writes the profile into an existing metadata document, keeping
    /// unrelated keys. Copilot keys are dropped for other member types.
    pub fn merge_into(&self, metadata: Value) -> Value {
        let mut map = match metadata {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        map.remove("is_vested");
        map.remove("linked_to");
        if let MemberProfile::Copilot {
            is_vested,
            linked_to,
        } = self
        {
            map.insert("is_vested".to_string(), json!(is_vested));
            map.insert("linked_to".to_string(), json!(linked_to));
        }
        Value::Object(map)
    }

    pub fn linked_pilot(&self) -> Option<i32> {
        match self {
            MemberProfile::Copilot { linked_to, .. } => *linked_to,
            _ => None,
        }
    }
}

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use serde::Serialize;
use std::{borrow::Cow, collections::BTreeMap};

/// Stable machine-readable error codes. Each code maps to exactly one
/// status and is never reused for a different failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ValidationError,
    Unauthenticated,
    InvalidCredentials,
    Forbidden,
    NotFound,
    SelfAssignment,
    ChaptersClosed,
    InvalidCopilotLink,
    DuplicateClubName,
    DuplicateName,
    DuplicateMemberName,
    DuplicateMembership,
    DuplicateAdminAssignment,
    DuplicateInvitation,
    DuplicateUsername,
    DuplicateEmail,
    AlreadyClaimed,
    InvalidCode,
    TransitionNotAllowed,
    InvitationExpired,
    InvitationNotPending,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::Unauthenticated => "unauthenticated",
            ErrorCode::InvalidCredentials => "invalid_credentials",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::NotFound => "not_found",
            ErrorCode::SelfAssignment => "self_assignment",
            ErrorCode::ChaptersClosed => "chapters_closed",
            ErrorCode::InvalidCopilotLink => "invalid_copilot_link",
            ErrorCode::DuplicateClubName => "duplicate_club_name",
            ErrorCode::DuplicateName => "duplicate_name",
            ErrorCode::DuplicateMemberName => "duplicate_member_name",
            ErrorCode::DuplicateMembership => "duplicate_membership",
            ErrorCode::DuplicateAdminAssignment => "duplicate_admin_assignment",
            ErrorCode::DuplicateInvitation => "duplicate_invitation",
            ErrorCode::DuplicateUsername => "duplicate_username",
            ErrorCode::DuplicateEmail => "duplicate_email",
            ErrorCode::AlreadyClaimed => "already_claimed",
            ErrorCode::InvalidCode => "invalid_code",
            ErrorCode::TransitionNotAllowed => "transition_not_allowed",
            ErrorCode::InvitationExpired => "invitation_expired",
            ErrorCode::InvitationNotPending => "invitation_not_pending",
            ErrorCode::InternalError => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ErrorCode::ValidationError
            | ErrorCode::SelfAssignment
            | ErrorCode::ChaptersClosed
            | ErrorCode::InvalidCopilotLink => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthenticated | ErrorCode::InvalidCredentials => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::NotFound | ErrorCode::InvalidCode => StatusCode::NOT_FOUND,
            ErrorCode::DuplicateClubName
            | ErrorCode::DuplicateName
            | ErrorCode::DuplicateMemberName
            | ErrorCode::DuplicateMembership
            | ErrorCode::DuplicateAdminAssignment
            | ErrorCode::DuplicateInvitation
            | ErrorCode::DuplicateUsername
            | ErrorCode::DuplicateEmail
            | ErrorCode::AlreadyClaimed
            | ErrorCode::TransitionNotAllowed
            | ErrorCode::InvitationNotPending => StatusCode::CONFLICT,
            ErrorCode::InvitationExpired => StatusCode::GONE,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Per-field validation messages, keyed by request field name.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct FieldErrors(BTreeMap<String, Vec<String>>);

impl FieldErrors {
    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.0
            .entry(field.to_string())
            .or_default()
            .push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }

    pub fn into_result(self) -> AppResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(AppError::ValidationError(self))
        }
    }
}

pub enum AppError {
    InternalServerError(anyhow::Error),
    ResponseStatusError(ErrorCode, Cow<'static, str>),
    ValidationError(FieldErrors),
}

pub type AppResult<T> = Result<T, AppError>;

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::InternalServerError(err) => write!(f, "internal error: {err:?}"),
            AppError::ResponseStatusError(code, message) => {
                write!(f, "{}: {message}", code.as_str())
            }
            AppError::ValidationError(fields) => write!(f, "validation error: {fields:?}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct AppErrorResponse {
            status: u16,
            code: &'static str,
            message: Cow<'static, str>,
            #[serde(skip_serializing_if = "Option::is_none")]
            fields: Option<FieldErrors>,
        }

        let (code, message, fields) = match self {
            AppError::InternalServerError(err) => {
                tracing::error!(error = ?err, "internal server error");
                (
                    ErrorCode::InternalError,
                    Cow::Borrowed("Internal Server Error"),
                    None,
                )
            }
            AppError::ResponseStatusError(code, message) => (code, message, None),
            AppError::ValidationError(fields) => (
                ErrorCode::ValidationError,
                Cow::Borrowed("invalid input"),
                Some(fields),
            ),
        };

        let status = code.status();
        (
            status,
            Json(AppErrorResponse {
                status: status.as_u16(),
                code: code.as_str(),
                message,
                fields,
            }),
        )
            .into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(e: E) -> AppError {
        AppError::InternalServerError(e.into())
    }
}

impl AppError {
    pub fn from(code: ErrorCode, s: impl Into<Cow<'static, str>>) -> AppError {
        AppError::ResponseStatusError(code, s.into())
    }

    pub fn not_found(what: &'static str) -> AppError {
        AppError::from(ErrorCode::NotFound, format!("{what} not found"))
    }

    pub fn forbidden() -> AppError {
        AppError::from(
            ErrorCode::Forbidden,
            "you are not allowed to perform this action",
        )
    }

    pub fn unauthenticated() -> AppError {
        AppError::from(ErrorCode::Unauthenticated, "authentication required")
    }

    pub fn field(field: &str, message: impl Into<String>) -> AppError {
        let mut fields = FieldErrors::default();
        fields.add(field, message);
        AppError::ValidationError(fields)
    }

    /// Translates store failures; unique violations on known constraints
    /// become conflicts, everything else stays internal.
    pub fn from_db(err: DieselError) -> AppError {
        match &err {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                if let Some(code) = info.constraint_name().and_then(conflict_for_constraint) {
                    return AppError::from(code, conflict_message(code));
                }
            }
            DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, info) => {
                let field = info
                    .constraint_name()
                    .and_then(field_for_foreign_key)
                    .unwrap_or("reference");
                return AppError::field(field, "referenced object does not exist");
            }
            _ => {}
        }
        AppError::InternalServerError(err.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::InternalServerError(_) => ErrorCode::InternalError,
            AppError::ResponseStatusError(code, _) => *code,
            AppError::ValidationError(_) => ErrorCode::ValidationError,
        }
    }
}

pub fn conflict_for_constraint(constraint: &str) -> Option<ErrorCode> {
    Some(match constraint {
        "clubs_name_lower_key" => ErrorCode::DuplicateClubName,
        "chapters_club_id_name_key" => ErrorCode::DuplicateName,
        "members_chapter_name_active_key" => ErrorCode::DuplicateMemberName,
        "members_chapter_id_user_id_key" => ErrorCode::DuplicateMembership,
        "club_admins_user_id_club_id_key" | "chapter_admins_user_id_chapter_id_key" => {
            ErrorCode::DuplicateAdminAssignment
        }
        "invitations_pending_email_club_key" => ErrorCode::DuplicateInvitation,
        "users_username_lower_key" => ErrorCode::DuplicateUsername,
        "users_email_lower_key" => ErrorCode::DuplicateEmail,
        _ => return None,
    })
}

fn conflict_message(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::DuplicateClubName => "a club with this name already exists",
        ErrorCode::DuplicateName => "a chapter with this name already exists in the club",
        ErrorCode::DuplicateMemberName => {
            "an active member with this name already exists in the chapter"
        }
        ErrorCode::DuplicateMembership => "this user is already a member of the chapter",
        ErrorCode::DuplicateAdminAssignment => "this user already holds the assignment",
        ErrorCode::DuplicateInvitation => {
            "a pending invitation for this email already exists in the club"
        }
        ErrorCode::DuplicateUsername => "username has been taken",
        ErrorCode::DuplicateEmail => "email is already registered",
        _ => "conflict",
    }
}

fn field_for_foreign_key(constraint: &str) -> Option<&'static str> {
    // postgres default naming: <table>_<column>_fkey
    let column = constraint.strip_suffix("_fkey")?;
    [
        "club_id",
        "chapter_id",
        "user_id",
        "country_id",
        "state_id",
        "achievement_id",
    ]
    .into_iter()
    .find(|field| column.ends_with(field))
    .map(|field| field.trim_end_matches("_id"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_unique_constraint_has_a_conflict_code() {
        let expected = [
            ("clubs_name_lower_key", ErrorCode::DuplicateClubName),
            ("chapters_club_id_name_key", ErrorCode::DuplicateName),
            (
                "members_chapter_name_active_key",
                ErrorCode::DuplicateMemberName,
            ),
            (
                "members_chapter_id_user_id_key",
                ErrorCode::DuplicateMembership,
            ),
            (
                "club_admins_user_id_club_id_key",
                ErrorCode::DuplicateAdminAssignment,
            ),
            (
                "chapter_admins_user_id_chapter_id_key",
                ErrorCode::DuplicateAdminAssignment,
            ),
            (
                "invitations_pending_email_club_key",
                ErrorCode::DuplicateInvitation,
            ),
        ];
        for (constraint, code) in expected {
            assert_eq!(conflict_for_constraint(constraint), Some(code));
            assert_eq!(code.status(), StatusCode::CONFLICT);
        }
        assert_eq!(conflict_for_constraint("members_claim_code_key"), None);
    }

    #[test]
    fn codes_are_not_overloaded() {
        let codes = [
            ErrorCode::ValidationError,
            ErrorCode::Unauthenticated,
            ErrorCode::InvalidCredentials,
            ErrorCode::Forbidden,
            ErrorCode::NotFound,
            ErrorCode::SelfAssignment,
            ErrorCode::ChaptersClosed,
            ErrorCode::InvalidCopilotLink,
            ErrorCode::DuplicateClubName,
            ErrorCode::DuplicateName,
            ErrorCode::DuplicateMemberName,
            ErrorCode::DuplicateMembership,
            ErrorCode::DuplicateAdminAssignment,
            ErrorCode::DuplicateInvitation,
            ErrorCode::DuplicateUsername,
            ErrorCode::DuplicateEmail,
            ErrorCode::AlreadyClaimed,
            ErrorCode::InvalidCode,
            ErrorCode::TransitionNotAllowed,
            ErrorCode::InvitationExpired,
            ErrorCode::InvitationNotPending,
            ErrorCode::InternalError,
        ];
        let names: std::collections::HashSet<_> = codes.iter().map(ErrorCode::as_str).collect();
        assert_eq!(names.len(), codes.len());
    }

    #[test]
    fn foreign_key_constraint_names_map_to_fields() {
        assert_eq!(field_for_foreign_key("members_chapter_id_fkey"), Some("chapter"));
        assert_eq!(field_for_foreign_key("clubs_state_id_fkey"), Some("state"));
        assert_eq!(field_for_foreign_key("members_claim_code_key"), None);
    }

    #[test]
    fn field_errors_accumulate() {
        let mut fields = FieldErrors::default();
        assert!(fields.clone().into_result().is_ok());
        fields.add("first_name", "required");
        fields.add("first_name", "too long");
        assert_eq!(fields.get("first_name").unwrap().len(), 2);
        let err = fields.into_result().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[test]
    fn error_response_carries_status_and_code() {
        let response = AppError::from(ErrorCode::AlreadyClaimed, "taken").into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let response = AppError::from(ErrorCode::InvitationExpired, "late").into_response();
        assert_eq!(response.status(), StatusCode::GONE);
        let response = AppError::from(ErrorCode::InvalidCode, "nope").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

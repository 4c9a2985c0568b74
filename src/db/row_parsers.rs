use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::rbac::{Group, Permission, Role, RoleAssignment, SubjectKind};

pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>, AppError> {
    let s = s.trim();

    // RFC3339 (what sqlx writes for DateTime<Utc>)
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    // SQLite CURRENT_TIMESTAMP: "YYYY-MM-DD HH:MM:SS" with optional fraction
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&naive));
    }

    if let Ok(naive_date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let ndt = naive_date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| AppError::internal("invalid datetime: date out of range".to_string()))?;
        return Ok(Utc.from_utc_datetime(&ndt));
    }

    Err(AppError::internal(format!("invalid datetime: {}", s)))
}

fn parse_opt_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, AppError> {
    match s {
        Some(s) if !s.trim().is_empty() => Ok(Some(parse_datetime(&s)?)),
        _ => Ok(None),
    }
}

fn get_column<'r, T>(row: &'r SqliteRow, column: &str) -> Result<T, AppError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(column)
        .map_err(|e| AppError::internal(format!("missing {}: {}", column, e)))
}

fn get_uuid(row: &SqliteRow, column: &str) -> Result<Uuid, AppError> {
    let raw: String = get_column(row, column)?;
    Uuid::parse_str(raw.trim()).map_err(|e| AppError::internal(format!("invalid uuid in {}: {}", column, e)))
}

fn get_opt_uuid(row: &SqliteRow, column: &str) -> Result<Option<Uuid>, AppError> {
    let raw: Option<String> = get_column(row, column)?;
    raw.map(|s| Uuid::parse_str(s.trim()))
        .transpose()
        .map_err(|e| AppError::internal(format!("invalid uuid in {}: {}", column, e)))
}

pub fn role_from_row(row: &SqliteRow) -> Result<Role, AppError> {
    let created_at: String = get_column(row, "created_at")?;
    let updated_at: String = get_column(row, "updated_at")?;

    Ok(Role {
        id: get_uuid(row, "id")?,
        name: get_column(row, "name")?,
        description: get_column(row, "description")?,
        parent_id: get_opt_uuid(row, "parent_id")?,
        level: get_column(row, "level")?,
        is_system: get_column(row, "is_system")?,
        is_active: get_column(row, "is_active")?,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

pub fn permission_from_row(row: &SqliteRow) -> Result<Permission, AppError> {
    let effect: String = get_column(row, "effect")?;
    let created_at: String = get_column(row, "created_at")?;
    let updated_at: String = get_column(row, "updated_at")?;

    Ok(Permission {
        id: get_uuid(row, "id")?,
        name: get_column(row, "name")?,
        resource_type: get_column(row, "resource_type")?,
        action: get_column(row, "action")?,
        effect: effect
            .parse()
            .map_err(|_| AppError::internal(format!("invalid effect: {}", effect)))?,
        conditions: get_column(row, "conditions")?,
        is_active: get_column(row, "is_active")?,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

pub fn group_from_row(row: &SqliteRow) -> Result<Group, AppError> {
    let created_at: String = get_column(row, "created_at")?;
    let updated_at: String = get_column(row, "updated_at")?;

    Ok(Group {
        id: get_uuid(row, "id")?,
        name: get_column(row, "name")?,
        description: get_column(row, "description")?,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

/// Expects the assignment columns prefixed with `ra_`.
pub fn assignment_from_row(row: &SqliteRow) -> Result<RoleAssignment, AppError> {
    let kind: String = get_column(row, "ra_subject_kind")?;
    let subject_kind = match kind.as_str() {
        "user" => SubjectKind::User,
        "group" => SubjectKind::Group,
        other => return Err(AppError::internal(format!("invalid subject kind: {}", other))),
    };
    let created_at: String = get_column(row, "ra_created_at")?;

    Ok(RoleAssignment {
        id: get_uuid(row, "ra_id")?,
        subject_kind,
        subject_id: get_uuid(row, "ra_subject_id")?,
        role_id: get_uuid(row, "ra_role_id")?,
        resource_id: get_column(row, "ra_resource_id")?,
        expires_at: parse_opt_datetime(get_column(row, "ra_expires_at")?)?,
        is_active: get_column(row, "ra_is_active")?,
        granted_by: get_opt_uuid(row, "ra_granted_by")?,
        created_at: parse_datetime(&created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_datetime_formats() {
        assert!(parse_datetime("2025-11-19T12:34:56Z").is_ok());
        assert!(parse_datetime("2025-11-19T12:34:56.123456+00:00").is_ok());
        assert!(parse_datetime("2025-11-19 12:34:56").is_ok());
        assert!(parse_datetime("2025-11-19").is_ok());
        assert!(parse_datetime("yesterday").is_err());
    }

    #[test]
    fn test_parse_opt_datetime_blank_is_none() {
        assert_eq!(parse_opt_datetime(Some("  ".into())).unwrap(), None);
        assert_eq!(parse_opt_datetime(None).unwrap(), None);
    }
}

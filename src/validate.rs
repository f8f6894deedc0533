//! Event validation.
//!
//! Turns a [`RawEvent`] into an [`Event`] or names the first field that is
//! wrong. Fields are checked in the order `site_id`, `event_type`, `path`,
//! `timestamp`. `user_id` never fails: absent, null and empty all mean
//! "no user".

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use thiserror::Error;

use crate::model::{Event, RawEvent};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("\"{0}\" is required")]
    Missing(&'static str),

    #[error("\"{0}\" is not allowed to be empty")]
    Empty(&'static str),

    #[error("\"timestamp\" must be in ISO 8601 date format, got {0:?}")]
    InvalidTimestamp(String),

    #[error("\"date\" must be a calendar date (YYYY-MM-DD), got {0:?}")]
    InvalidDate(String),
}

impl ValidationError {
    /// The input field this error is about.
    pub fn field(&self) -> &'static str {
        match self {
            ValidationError::Missing(field) | ValidationError::Empty(field) => field,
            ValidationError::InvalidTimestamp(_) => "timestamp",
            ValidationError::InvalidDate(_) => "date",
        }
    }
}

/// Validate a raw record into a canonical event.
pub fn validate(raw: RawEvent) -> Result<Event, ValidationError> {
    let site_id = required("site_id", raw.site_id)?;
    let event_type = required("event_type", raw.event_type)?;
    let path = required("path", raw.path)?;
    let user_id = raw.user_id.filter(|u| !u.is_empty());
    let timestamp = required("timestamp", raw.timestamp)?;
    let timestamp = parse_timestamp(&timestamp)?;

    Ok(Event {
        site_id,
        event_type,
        path,
        user_id,
        timestamp,
    })
}

fn required(field: &'static str, value: Option<String>) -> Result<String, ValidationError> {
    match value {
        None => Err(ValidationError::Missing(field)),
        Some(v) if v.is_empty() => Err(ValidationError::Empty(field)),
        Some(v) => Ok(v),
    }
}

/// Parse an ISO 8601 instant.
///
/// Accepts RFC 3339 with an offset, a date-time without offset (taken as
/// UTC), and a bare `YYYY-MM-DD` (midnight UTC).
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, ValidationError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc());
        }
    }
    if let Some(midnight) = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
    {
        return Ok(midnight.and_utc());
    }
    Err(ValidationError::InvalidTimestamp(s.to_string()))
}

/// Parse the optional `date` filter used by reporting.
pub fn parse_date(s: &str) -> Result<NaiveDate, ValidationError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| ValidationError::InvalidDate(s.to_string()))
}

//! Core domain model, ingestion policy and timestamp normalization for Kobo submission sync.

use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "kobo-core";

/// Payload key carrying the platform-assigned submission identifier.
pub const UUID_FIELD: &str = "_uuid";
pub const SUBMISSION_TIME_FIELD: &str = "_submission_time";
pub const XFORM_ID_FIELD: &str = "_xform_id_string";
pub const FORM_ID_FIELD: &str = "formid";
/// Form marker used when a pushed payload names no form.
pub const UNKNOWN_FORM_UID: &str = "unknown";

/// Persisted submission, keyed by the external `uuid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: i64,
    pub uuid: String,
    pub form_uid: String,
    pub data: JsonValue,
    pub date_submitted: DateTime<Utc>,
    pub date_synced: DateTime<Utc>,
    pub date_updated: DateTime<Utc>,
}

impl Submission {
    /// First twelve characters of the uuid, for listings.
    pub fn short_uuid(&self) -> String {
        let head: String = self.uuid.chars().take(12).collect();
        format!("{head}...")
    }
}

impl fmt::Display for Submission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head: String = self.uuid.chars().take(8).collect();
        write!(f, "{} - {} ({})", self.form_uid, head, self.date_submitted)
    }
}

/// Write contract handed from the reconciler to a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSubmission {
    pub uuid: String,
    pub form_uid: String,
    pub data: JsonValue,
    pub date_submitted: DateTime<Utc>,
}

/// What a store may do when the uuid is already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestPolicy {
    /// Keep the stored record untouched.
    Skip,
    /// Replace form id, data and submission time (last write wins).
    Overwrite,
}

impl IngestPolicy {
    pub fn from_force_flag(force_update: bool) -> Self {
        if force_update {
            Self::Overwrite
        } else {
            Self::Skip
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    Created,
    Updated,
    Skipped,
}

impl ReconcileAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Skipped => "skipped",
        }
    }
}

/// Extracts the external uuid. Numeric ids are stringified; only the empty string counts as absent.
pub fn extract_uuid(record: &JsonValue) -> Option<String> {
    match record.get(UUID_FIELD)? {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Form id carried by a pushed payload: `_xform_id_string`, then `formid`, then `"unknown"`.
pub fn form_uid_from_payload(payload: &JsonValue) -> String {
    [XFORM_ID_FIELD, FORM_ID_FIELD]
        .iter()
        .filter_map(|key| match payload.get(*key)? {
            JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .next()
        .unwrap_or_else(|| UNKNOWN_FORM_UID.to_string())
}

/// How a normalized submission time was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampSource {
    Parsed,
    Missing,
    Unparseable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizedTimestamp {
    pub instant: DateTime<Utc>,
    pub source: TimestampSource,
}

impl NormalizedTimestamp {
    /// True when the instant is the processing time rather than the platform's value.
    pub fn is_fallback(&self) -> bool {
        self.source != TimestampSource::Parsed
    }
}

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

const OFFSET_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
];

/// Parses an ISO-8601 submission time. Values without an offset are taken as UTC.
pub fn parse_submission_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in OFFSET_DATETIME_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(raw, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Normalizes a submission time, falling back to `now` when absent or malformed.
pub fn normalize_submission_time_at(raw: Option<&str>, now: DateTime<Utc>) -> NormalizedTimestamp {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => NormalizedTimestamp {
            instant: now,
            source: TimestampSource::Missing,
        },
        Some(text) => match parse_submission_time(text) {
            Some(instant) => NormalizedTimestamp {
                instant,
                source: TimestampSource::Parsed,
            },
            None => NormalizedTimestamp {
                instant: now,
                source: TimestampSource::Unparseable,
            },
        },
    }
}

pub fn normalize_submission_time(raw: Option<&str>) -> NormalizedTimestamp {
    normalize_submission_time_at(raw, Utc::now())
}

/// Reads `_submission_time` from a raw record and normalizes it.
pub fn submission_time_of(record: &JsonValue) -> NormalizedTimestamp {
    normalize_submission_time(record.get(SUBMISSION_TIME_FIELD).and_then(JsonValue::as_str))
}

/// Parses `+06:00`, `-0530`, `Z` or `UTC` into a display offset.
pub fn parse_utc_offset(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    if minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Asia/Dhaka has no DST, so a fixed offset renders it exactly.
pub fn default_display_offset() -> FixedOffset {
    FixedOffset::east_opt(6 * 3600).unwrap_or_else(|| Utc.fix())
}

/// `first_name` -> `First Name`.
pub fn readable_field(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_alpha = false;
    for c in name.replace('_', " ").chars() {
        if c.is_alphabetic() {
            if prev_alpha {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(c);
            prev_alpha = false;
        }
    }
    out
}

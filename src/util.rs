use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};

use crate::error::{Error, Result};

/// Current wall-clock time, truncated to whole seconds.
///
/// All timestamps in the store use second resolution; truncating at the
/// source keeps arithmetic on parsed values consistent with what was
/// persisted.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// Current wall-clock time in the storage format.
pub fn now_ts() -> String {
    format_ts(now_utc())
}

/// Formats a timestamp for storage: ISO-8601 UTC with a `Z` suffix and
/// second resolution, e.g. `2024-05-01T12:30:00Z`.
///
/// The format is fixed-width, so lexicographic order on stored values is
/// chronological order and scheduling comparisons can run directly in SQL.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parses a timestamp in any RFC 3339 form into UTC.
pub(crate) fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| Error::InvalidInput(format!("invalid timestamp {value:?}: {err}")))
}

/// Returns `base + delay_secs` in the storage format, rounding the delay up
/// to whole seconds so a scheduled wait is never shorter than requested.
pub(crate) fn ts_after(base: DateTime<Utc>, delay_secs: f64) -> String {
    let secs = delay_secs.ceil().max(0.0) as i64;
    format_ts(base + chrono::Duration::seconds(secs))
}

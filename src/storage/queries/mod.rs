//! Database query modules for CRUD operations.
//!
//! Each module provides async functions that operate on the database. Where a
//! multi-statement operation has to be atomic, the module also exposes a
//! synchronous `*_in` variant that runs on a borrowed connection or
//! transaction.

pub mod activity;
pub mod attachments;
pub mod backups;
pub mod documents;
pub mod emails;
pub mod folders;
pub mod labels;
pub mod providers;
pub mod settings;

use chrono::{DateTime, SecondsFormat, Utc};

/// Formats a timestamp so that lexical order matches chronological order.
pub(crate) fn to_sql_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn from_sql_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

pub(crate) fn from_sql_opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(from_sql_ts)
}

/// Escapes `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern.
pub(crate) fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// `?, ?, ?` for an `IN (...)` list of `n` values.
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_sort_lexically() {
        let a = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 11, 2, 3, 4, 5).unwrap();
        assert!(to_sql_ts(&a) < to_sql_ts(&b));
        assert_eq!(from_sql_ts(&to_sql_ts(&a)), a);
    }

    #[test]
    fn invalid_timestamp_falls_back_to_epoch() {
        assert_eq!(from_sql_ts("garbage"), DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn like_escaping() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
    }

    #[test]
    fn placeholder_lists() {
        assert_eq!(placeholders(3), "?, ?, ?");
        assert_eq!(placeholders(1), "?");
    }
}

//! Backup and backup schedule types.

use chrono::{DateTime, Duration, Months, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BackupId, EmailId, FolderId, ScheduleId, UserId};

/// Current backup archive format version.
pub const BACKUP_FORMAT_VERSION: &str = "1.0";

/// Archive versions this build can restore.
pub const SUPPORTED_BACKUP_VERSIONS: &[&str] = &["1.0"];

/// Kind of backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Incremental,
    Selective,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
            Self::Selective => "selective",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(Self::Full),
            "incremental" => Some(Self::Incremental),
            "selective" => Some(Self::Selective),
            _ => None,
        }
    }
}

/// Which emails a backup covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BackupScope {
    Full,
    /// Emails updated at or after `since`.
    Incremental { since: DateTime<Utc> },
    /// Emails in any of `folders`, plus any of `email_ids`.
    Selective {
        #[serde(default)]
        folders: Vec<FolderId>,
        #[serde(default)]
        email_ids: Vec<EmailId>,
    },
}

impl BackupScope {
    pub fn backup_type(&self) -> BackupType {
        match self {
            Self::Full => BackupType::Full,
            Self::Incremental { .. } => BackupType::Incremental,
            Self::Selective { .. } => BackupType::Selective,
        }
    }
}

/// Descriptive metadata stored with each backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub version: String,
    pub scope: BackupScope,
    /// Folders present in the archive.
    pub folders: Vec<FolderId>,
    pub batch_size: usize,
    pub include_deleted: bool,
}

/// A completed backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub id: BackupId,
    pub user_id: UserId,
    pub backup_type: BackupType,
    /// Object-store prefix holding the manifest and chunks.
    pub storage_path: String,
    pub email_count: u64,
    pub size_bytes: u64,
    pub encrypted: bool,
    pub compressed: bool,
    pub chunked: bool,
    pub chunk_count: u32,
    pub metadata: BackupMetadata,
    pub created_at: DateTime<Utc>,
}

impl Backup {
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_days()
    }
}

/// How often a scheduled backup runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupFrequency {
    Daily,
    Weekly,
    Monthly,
}

impl BackupFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            _ => None,
        }
    }

    fn advance(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Daily => at + Duration::days(1),
            Self::Weekly => at + Duration::days(7),
            Self::Monthly => at
                .checked_add_months(Months::new(1))
                .unwrap_or(at + Duration::days(30)),
        }
    }

    /// First run strictly after `after`, at `time` UTC.
    pub fn next_run_after(&self, after: DateTime<Utc>, time: NaiveTime) -> DateTime<Utc> {
        let candidate = after.date_naive().and_time(time).and_utc();
        if candidate > after {
            candidate
        } else {
            self.advance(candidate)
        }
    }
}

/// Parses a strict 24-hour `HH:MM` time.
pub fn parse_time_of_day(value: &str) -> Option<NaiveTime> {
    let (hours, minutes) = value.split_once(':')?;
    if hours.len() != 2 || minutes.len() != 2 {
        return None;
    }
    let hours: u32 = hours.parse().ok()?;
    let minutes: u32 = minutes.parse().ok()?;
    NaiveTime::from_hms_opt(hours, minutes, 0)
}

/// A recurring automatic backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSchedule {
    pub id: ScheduleId,
    pub user_id: UserId,
    pub frequency: BackupFrequency,
    /// `HH:MM`, UTC.
    pub time_of_day: String,
    pub retention_days: u32,
    pub include_deleted: bool,
    pub compress: bool,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

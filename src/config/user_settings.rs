//! Per-user email settings.
//!
//! Stored as one JSON document per user. Enumerated fields are kept as
//! strings so a bad value can be reported alongside every other validation
//! error rather than failing deserialization.

use std::collections::HashMap;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::parse_time_of_day;

pub const THEMES: &[&str] = &["light", "dark", "auto"];
pub const PREVIEW_PANES: &[&str] = &["left", "right", "bottom", "hidden"];
pub const DIGEST_FREQUENCIES: &[&str] = &["never", "daily", "weekly"];
pub const MAX_SIGNATURE_CHARS: usize = 1000;

/// All settings for one user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UserEmailSettings {
    /// Sanitized HTML.
    pub signature: String,
    pub auto_reply: AutoReply,
    pub notifications: NotificationSettings,
    pub display: DisplaySettings,
    pub security: SecuritySettings,
    pub folders: FolderSettings,
    pub labels: LabelSettings,
    pub keyboard_shortcuts: KeyboardShortcuts,
}

/// Out-of-office responder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AutoReply {
    pub enabled: bool,
    pub subject: String,
    pub message: String,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl AutoReply {
    /// Enabled and, when bounded, within its window.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && self.start_date.map_or(true, |start| now >= start)
            && self.end_date.map_or(true, |end| now <= end)
    }
}

/// Notification preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NotificationSettings {
    pub new_email: bool,
    pub desktop: bool,
    pub sound: bool,
    pub business_alerts: bool,
    pub digest_frequency: String,
    pub quiet_hours: QuietHours,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            new_email: true,
            desktop: true,
            sound: false,
            business_alerts: true,
            digest_frequency: "daily".to_string(),
            quiet_hours: QuietHours::default(),
        }
    }
}

/// Kinds of notification the engine may deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NewEmail,
    Desktop,
    Sound,
    BusinessAlert,
    Digest,
}

impl NotificationSettings {
    pub fn allows(&self, kind: NotificationKind) -> bool {
        match kind {
            NotificationKind::NewEmail => self.new_email,
            NotificationKind::Desktop => self.desktop,
            NotificationKind::Sound => self.sound,
            NotificationKind::BusinessAlert => self.business_alerts,
            NotificationKind::Digest => self.digest_frequency != "never",
        }
    }
}

/// Window during which notifications are suppressed. `HH:MM`, UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QuietHours {
    pub enabled: bool,
    pub start: String,
    pub end: String,
}

impl Default for QuietHours {
    fn default() -> Self {
        Self {
            enabled: false,
            start: "22:00".to_string(),
            end: "07:00".to_string(),
        }
    }
}

impl QuietHours {
    /// Whether `time` falls inside the window. Windows may span midnight.
    pub fn contains(&self, time: NaiveTime) -> bool {
        if !self.enabled {
            return false;
        }
        let (Some(start), Some(end)) =
            (parse_time_of_day(&self.start), parse_time_of_day(&self.end))
        else {
            return false;
        };
        if start <= end {
            time >= start && time < end
        } else {
            time >= start || time < end
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DisplaySettings {
    pub theme: String,
    pub emails_per_page: u32,
    pub preview_pane: String,
    pub show_snippets: bool,
    pub conversation_view: bool,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            theme: "auto".to_string(),
            emails_per_page: 50,
            preview_pane: "right".to_string(),
            show_snippets: true,
            conversation_view: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SecuritySettings {
    pub session_timeout_minutes: u32,
    pub load_remote_images: bool,
    pub phishing_protection: bool,
    pub require_two_factor: bool,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            session_timeout_minutes: 60,
            load_remote_images: false,
            phishing_protection: true,
            require_two_factor: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FolderSettings {
    pub auto_archive: bool,
    pub auto_archive_days: u32,
    pub default_folder: String,
}

impl Default for FolderSettings {
    fn default() -> Self {
        Self {
            auto_archive: false,
            auto_archive_days: 30,
            default_folder: "inbox".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LabelSettings {
    pub max_labels_per_email: u32,
    pub show_label_colors: bool,
}

impl Default for LabelSettings {
    fn default() -> Self {
        Self {
            max_labels_per_email: 10,
            show_label_colors: true,
        }
    }
}

/// Custom keybinding overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KeyboardShortcuts {
    pub enabled: bool,
    /// Action name to key sequence.
    pub overrides: HashMap<String, String>,
}

impl Default for KeyboardShortcuts {
    fn default() -> Self {
        Self {
            enabled: true,
            overrides: HashMap::new(),
        }
    }
}

fn check_range(errors: &mut Vec<String>, name: &str, value: u32, min: u32, max: u32) {
    if !(min..=max).contains(&value) {
        errors.push(format!("{} must be between {} and {}", name, min, max));
    }
}

fn check_choice(errors: &mut Vec<String>, name: &str, value: &str, allowed: &[&str]) {
    if !allowed.contains(&value) {
        errors.push(format!("{} must be one of: {}", name, allowed.join(", ")));
    }
}

impl UserEmailSettings {
    /// Every validation error, empty when valid.
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        check_range(&mut errors, "emailsPerPage", self.display.emails_per_page, 1, 200);
        check_choice(&mut errors, "theme", &self.display.theme, THEMES);
        check_choice(&mut errors, "previewPane", &self.display.preview_pane, PREVIEW_PANES);
        check_range(
            &mut errors,
            "sessionTimeoutMinutes",
            self.security.session_timeout_minutes,
            5,
            1440,
        );
        check_range(&mut errors, "autoArchiveDays", self.folders.auto_archive_days, 1, 365);
        check_range(
            &mut errors,
            "maxLabelsPerEmail",
            self.labels.max_labels_per_email,
            1,
            50,
        );
        check_choice(
            &mut errors,
            "digestFrequency",
            &self.notifications.digest_frequency,
            DIGEST_FREQUENCIES,
        );

        let quiet = &self.notifications.quiet_hours;
        if parse_time_of_day(&quiet.start).is_none() {
            errors.push("Quiet hours start must be in HH:MM format".to_string());
        }
        if parse_time_of_day(&quiet.end).is_none() {
            errors.push("Quiet hours end must be in HH:MM format".to_string());
        }

        if let (Some(start), Some(end)) = (self.auto_reply.start_date, self.auto_reply.end_date) {
            if end <= start {
                errors.push("Auto-reply end date must be after start date".to_string());
            }
        }

        if self.signature.chars().count() > MAX_SIGNATURE_CHARS {
            errors.push(format!(
                "Signature must be at most {} characters",
                MAX_SIGNATURE_CHARS
            ));
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn defaults_are_valid() {
        assert!(UserEmailSettings::default().validation_errors().is_empty());
    }

    #[test]
    fn every_error_is_reported() {
        let mut settings = UserEmailSettings::default();
        settings.display.emails_per_page = 0;
        settings.display.theme = "neon".into();
        settings.security.session_timeout_minutes = 2;
        settings.notifications.quiet_hours.start = "25:00".into();
        settings.signature = "x".repeat(1001);

        let errors = settings.validation_errors();
        assert_eq!(errors.len(), 5);
        assert!(errors.contains(&"emailsPerPage must be between 1 and 200".to_string()));
        assert!(errors.contains(&"theme must be one of: light, dark, auto".to_string()));
    }

    #[test]
    fn quiet_hours_span_midnight() {
        let quiet = QuietHours {
            enabled: true,
            start: "22:00".into(),
            end: "07:00".into(),
        };
        assert!(quiet.contains(at(23, 30)));
        assert!(quiet.contains(at(3, 0)));
        assert!(!quiet.contains(at(7, 0)));
        assert!(!quiet.contains(at(12, 0)));

        let daytime = QuietHours {
            enabled: true,
            start: "12:00".into(),
            end: "13:00".into(),
        };
        assert!(daytime.contains(at(12, 30)));
        assert!(!daytime.contains(at(23, 0)));
    }

    #[test]
    fn auto_reply_window() {
        let reply = AutoReply {
            enabled: true,
            subject: "Away".into(),
            message: "Back Monday".into(),
            start_date: Some(Utc.with_ymd_and_hms(2025, 8, 1, 0, 0, 0).unwrap()),
            end_date: Some(Utc.with_ymd_and_hms(2025, 8, 10, 0, 0, 0).unwrap()),
        };
        assert!(reply.is_active(Utc.with_ymd_and_hms(2025, 8, 5, 0, 0, 0).unwrap()));
        assert!(!reply.is_active(Utc.with_ymd_and_hms(2025, 8, 11, 0, 0, 0).unwrap()));
    }

    #[test]
    fn camel_case_json() {
        let json = serde_json::to_value(UserEmailSettings::default()).unwrap();
        assert_eq!(json["display"]["emailsPerPage"], 50);
        assert_eq!(json["security"]["sessionTimeoutMinutes"], 60);

        let parsed: UserEmailSettings =
            serde_json::from_str(r#"{"display":{"theme":"dark"}}"#).unwrap();
        assert_eq!(parsed.display.theme, "dark");
        assert_eq!(parsed.display.emails_per_page, 50);
    }
}

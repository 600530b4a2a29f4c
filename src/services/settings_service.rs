//! Per-user email settings with validation and a read cache.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde_json::Value;
use tracing::{debug, info};

use super::events::{EngineEvent, EventBus};
use crate::config::user_settings::{
    AutoReply, DisplaySettings, KeyboardShortcuts, NotificationSettings, SecuritySettings,
};
use crate::config::{NotificationKind, UserEmailSettings};
use crate::domain::UserId;
use crate::error::{EngineError, Result};
use crate::storage::queries;
use crate::storage::Database;

const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Strips scripts, frames, event handlers and `javascript:` URLs.
pub fn sanitize_signature(html: &str) -> String {
    ammonia::Builder::default().clean(html).to_string()
}

/// Recursively overlays `patch` onto `base`. Nulls in `patch` are ignored.
fn merge_json(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None if !value.is_null() => {
                        base.insert(key, value);
                    }
                    None => {}
                }
            }
        }
        (_, Value::Null) => {}
        (slot, value) => *slot = value,
    }
}

/// Cached documents plus a counter every write bumps. A read only fills
/// the cache if no write happened while it was loading.
struct SettingsCache {
    entries: LruCache<UserId, UserEmailSettings>,
    generation: u64,
}

pub struct SettingsService {
    db: Database,
    events: Arc<EventBus>,
    cache: Mutex<SettingsCache>,
}

impl SettingsService {
    pub fn new(db: Database, events: Arc<EventBus>, cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity)
            .or(NonZeroUsize::new(DEFAULT_CACHE_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            db,
            events,
            cache: Mutex::new(SettingsCache {
                entries: LruCache::new(capacity),
                generation: 0,
            }),
        }
    }

    fn cache(&self) -> MutexGuard<'_, SettingsCache> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cached copy, or the generation a load must still see to fill the cache.
    fn cached_or_generation(
        &self,
        user_id: &UserId,
    ) -> std::result::Result<UserEmailSettings, u64> {
        let mut cache = self.cache();
        match cache.entries.get(user_id) {
            Some(cached) => Ok(cached.clone()),
            None => Err(cache.generation),
        }
    }

    fn fill(&self, user_id: &UserId, generation: u64, settings: &UserEmailSettings) {
        let mut cache = self.cache();
        if cache.generation == generation {
            cache.entries.put(user_id.clone(), settings.clone());
        }
    }

    fn invalidate(&self, user_id: &UserId) {
        let mut cache = self.cache();
        cache.generation = cache.generation.wrapping_add(1);
        cache.entries.pop(user_id);
    }

    /// Stored settings, or the defaults for a user who has none.
    pub async fn get_settings(&self, user_id: &UserId) -> Result<UserEmailSettings> {
        let generation = match self.cached_or_generation(user_id) {
            Ok(cached) => return Ok(cached),
            Err(generation) => generation,
        };
        let settings = match queries::settings::get(&self.db, user_id).await? {
            Some(doc) => serde_json::from_value(doc)?,
            None => UserEmailSettings::default(),
        };
        self.fill(user_id, generation, &settings);
        Ok(settings)
    }

    /// Sanitizes, validates and stores a complete settings document.
    ///
    /// Nothing is written unless every field is valid. The cached copy is
    /// dropped before returning.
    pub async fn save_settings(
        &self,
        user_id: &UserId,
        mut settings: UserEmailSettings,
    ) -> Result<UserEmailSettings> {
        settings.signature = sanitize_signature(&settings.signature);
        let errors = settings.validation_errors();
        if !errors.is_empty() {
            debug!(user_id = %user_id, ?errors, "Rejected settings");
            return Err(EngineError::InvalidSettings(errors));
        }

        let doc = serde_json::to_value(&settings)?;
        queries::settings::upsert(&self.db, user_id, &doc).await?;
        self.invalidate(user_id);
        info!(user_id = %user_id, "Settings updated");
        self.events.emit(EngineEvent::SettingsUpdated {
            user_id: user_id.clone(),
        });
        Ok(settings)
    }

    /// Applies a partial camelCase settings document over the current one.
    pub async fn update_settings(
        &self,
        user_id: &UserId,
        changes: Value,
    ) -> Result<UserEmailSettings> {
        if !changes.is_object() {
            return Err(EngineError::InvalidSettings(vec![
                "Settings update must be an object".into(),
            ]));
        }
        let mut doc = serde_json::to_value(self.get_settings(user_id).await?)?;
        merge_json(&mut doc, changes);
        let settings: UserEmailSettings = serde_json::from_value(doc)
            .map_err(|e| EngineError::InvalidSettings(vec![e.to_string()]))?;
        self.save_settings(user_id, settings).await
    }

    async fn modify<F>(&self, user_id: &UserId, change: F) -> Result<UserEmailSettings>
    where
        F: FnOnce(&mut UserEmailSettings),
    {
        let mut settings = self.get_settings(user_id).await?;
        change(&mut settings);
        self.save_settings(user_id, settings).await
    }

    pub async fn update_signature(
        &self,
        user_id: &UserId,
        signature: &str,
    ) -> Result<UserEmailSettings> {
        let signature = signature.to_string();
        self.modify(user_id, move |s| s.signature = signature).await
    }

    pub async fn configure_auto_reply(
        &self,
        user_id: &UserId,
        auto_reply: AutoReply,
    ) -> Result<UserEmailSettings> {
        self.modify(user_id, move |s| s.auto_reply = auto_reply).await
    }

    pub async fn disable_auto_reply(&self, user_id: &UserId) -> Result<UserEmailSettings> {
        self.modify(user_id, |s| s.auto_reply.enabled = false).await
    }

    pub async fn is_auto_reply_active(&self, user_id: &UserId, now: DateTime<Utc>) -> Result<bool> {
        Ok(self.get_settings(user_id).await?.auto_reply.is_active(now))
    }

    pub async fn configure_notifications(
        &self,
        user_id: &UserId,
        notifications: NotificationSettings,
    ) -> Result<UserEmailSettings> {
        self.modify(user_id, move |s| s.notifications = notifications).await
    }

    /// Whether a notification of `kind` may go out at `at`. Nothing goes
    /// out during quiet hours.
    pub async fn should_send_notification(
        &self,
        user_id: &UserId,
        kind: NotificationKind,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let notifications = self.get_settings(user_id).await?.notifications;
        Ok(notifications.allows(kind) && !notifications.quiet_hours.contains(at.time()))
    }

    pub async fn configure_display(
        &self,
        user_id: &UserId,
        display: DisplaySettings,
    ) -> Result<UserEmailSettings> {
        self.modify(user_id, move |s| s.display = display).await
    }

    pub async fn configure_security(
        &self,
        user_id: &UserId,
        security: SecuritySettings,
    ) -> Result<UserEmailSettings> {
        self.modify(user_id, move |s| s.security = security).await
    }

    pub async fn configure_shortcuts(
        &self,
        user_id: &UserId,
        shortcuts: KeyboardShortcuts,
    ) -> Result<UserEmailSettings> {
        self.modify(user_id, move |s| s.keyboard_shortcuts = shortcuts).await
    }

    /// Deletes the stored document. Later reads return the defaults.
    pub async fn reset_settings(&self, user_id: &UserId) -> Result<UserEmailSettings> {
        queries::settings::delete(&self.db, user_id).await?;
        self.invalidate(user_id);
        info!(user_id = %user_id, "Settings reset");
        self.events.emit(EngineEvent::SettingsUpdated {
            user_id: user_id.clone(),
        });
        Ok(UserEmailSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    async fn service() -> SettingsService {
        let db = Database::open_in_memory().await.unwrap();
        SettingsService::new(db, Arc::new(EventBus::new()), 8)
    }

    #[tokio::test]
    async fn defaults_until_saved() {
        let service = service().await;
        let user = UserId::from("user-1");
        assert_eq!(service.get_settings(&user).await.unwrap(), UserEmailSettings::default());
    }

    #[tokio::test]
    async fn writes_invalidate_the_cache() {
        let service = service().await;
        let user = UserId::from("user-1");
        service.get_settings(&user).await.unwrap();

        service
            .update_settings(&user, json!({ "display": { "theme": "dark" } }))
            .await
            .unwrap();
        let read = service.get_settings(&user).await.unwrap();
        assert_eq!(read.display.theme, "dark");
        assert_eq!(read.display.emails_per_page, 50);
    }

    #[tokio::test]
    async fn load_overtaken_by_a_write_does_not_fill_the_cache() {
        let service = service().await;
        let user = UserId::from("user-1");

        // A read misses the cache and loads the defaults, then a write lands
        // before the read stores what it loaded.
        let generation = service.cached_or_generation(&user).unwrap_err();
        let stale = UserEmailSettings::default();
        service
            .update_settings(&user, json!({ "display": { "theme": "dark" } }))
            .await
            .unwrap();
        service.fill(&user, generation, &stale);

        assert_eq!(service.get_settings(&user).await.unwrap().display.theme, "dark");
    }

    #[tokio::test]
    async fn concurrent_reads_and_writes_end_fresh() {
        let service = Arc::new(service().await);
        let user = UserId::from("user-1");

        let mut tasks = Vec::new();
        for i in 0..20u32 {
            let service = service.clone();
            let user = user.clone();
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    service.get_settings(&user).await.map(|_| ())
                } else {
                    service
                        .update_settings(&user, json!({ "display": { "emailsPerPage": 10 + i } }))
                        .await
                        .map(|_| ())
                }
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        service
            .update_settings(&user, json!({ "display": { "emailsPerPage": 99 } }))
            .await
            .unwrap();
        assert_eq!(service.get_settings(&user).await.unwrap().display.emails_per_page, 99);
    }

    #[tokio::test]
    async fn invalid_update_writes_nothing() {
        let service = service().await;
        let user = UserId::from("user-1");

        let err = service
            .update_settings(
                &user,
                json!({
                    "display": { "emailsPerPage": 500, "theme": "neon" },
                    "security": { "sessionTimeoutMinutes": 1 }
                }),
            )
            .await
            .unwrap_err();
        let EngineError::InvalidSettings(errors) = err else {
            panic!("expected InvalidSettings");
        };
        assert_eq!(errors.len(), 3);
        assert!(queries::settings::get(&service.db, &user).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn signature_is_sanitized() {
        let service = service().await;
        let user = UserId::from("user-1");
        let saved = service
            .update_signature(
                &user,
                r#"<p onclick="steal()">Jane <b>Doe</b></p><script>alert(1)</script><a href="javascript:x()">x</a>"#,
            )
            .await
            .unwrap();
        assert!(saved.signature.contains("<b>Doe</b>"));
        assert!(!saved.signature.contains("script"));
        assert!(!saved.signature.contains("onclick"));
        assert!(!saved.signature.contains("javascript:"));
    }

    #[tokio::test]
    async fn quiet_hours_suppress_notifications() {
        let service = service().await;
        let user = UserId::from("user-1");
        let mut notifications = NotificationSettings::default();
        notifications.quiet_hours.enabled = true;
        service.configure_notifications(&user, notifications).await.unwrap();

        let night = Utc.with_ymd_and_hms(2025, 1, 1, 23, 30, 0).unwrap();
        let noon = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        assert!(!service
            .should_send_notification(&user, NotificationKind::NewEmail, night)
            .await
            .unwrap());
        assert!(service
            .should_send_notification(&user, NotificationKind::NewEmail, noon)
            .await
            .unwrap());
        assert!(!service
            .should_send_notification(&user, NotificationKind::Sound, noon)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn auto_reply_dates_are_checked() {
        let service = service().await;
        let user = UserId::from("user-1");
        let start = Utc.with_ymd_and_hms(2025, 8, 10, 0, 0, 0).unwrap();
        let bad = AutoReply {
            enabled: true,
            start_date: Some(start),
            end_date: Some(start - chrono::Duration::days(1)),
            ..Default::default()
        };
        assert!(matches!(
            service.configure_auto_reply(&user, bad).await,
            Err(EngineError::InvalidSettings(_))
        ));

        let good = AutoReply {
            enabled: true,
            start_date: Some(start),
            end_date: Some(start + chrono::Duration::days(5)),
            ..Default::default()
        };
        service.configure_auto_reply(&user, good).await.unwrap();
        assert!(service
            .is_auto_reply_active(&user, start + chrono::Duration::days(1))
            .await
            .unwrap());
        service.disable_auto_reply(&user).await.unwrap();
        assert!(!service
            .is_auto_reply_active(&user, start + chrono::Duration::days(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn reset_returns_to_defaults() {
        let service = service().await;
        let user = UserId::from("user-1");
        service
            .update_settings(&user, json!({ "display": { "theme": "light" } }))
            .await
            .unwrap();
        service.reset_settings(&user).await.unwrap();
        assert_eq!(service.get_settings(&user).await.unwrap().display.theme, "auto");
    }
}

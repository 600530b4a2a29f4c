//! Engine event bus.
//!
//! Every mutation the services perform is announced as an [`EngineEvent`].
//! Observers either subscribe to the typed broadcast channel or register a
//! callback listener. A failing or panicking listener is logged and skipped;
//! the emitter never sees its error.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::domain::{
    AttachmentId, BackupId, DocumentId, EmailId, FolderId, ProviderId, ProviderKind, UserId,
};

/// Capacity of the broadcast channel.
const CHANNEL_CAPACITY: usize = 256;

/// Matches every event name.
pub const ALL_EVENTS: &str = "*";

/// Something that changed in the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    EmailStored {
        user_id: UserId,
        email_id: EmailId,
    },
    EmailSent {
        user_id: UserId,
        /// Local copy, absent when storing it failed.
        email_id: Option<EmailId>,
        provider_id: ProviderId,
        message_id: String,
    },
    EmailUpdated {
        user_id: UserId,
        email_id: EmailId,
    },
    EmailMoved {
        user_id: UserId,
        email_id: EmailId,
        folder_id: FolderId,
    },
    EmailDeleted {
        user_id: UserId,
        email_id: EmailId,
        permanent: bool,
    },
    EmailRestored {
        user_id: UserId,
        email_id: EmailId,
    },
    LabelApplied {
        user_id: UserId,
        email_id: EmailId,
        label: String,
    },
    LabelRemoved {
        user_id: UserId,
        email_id: EmailId,
        label: String,
    },
    BusinessEmailSent {
        user_id: UserId,
        document_id: DocumentId,
        email_type: String,
    },
    ProviderConfigured {
        user_id: UserId,
        provider_id: ProviderId,
        kind: ProviderKind,
    },
    ProviderRemoved {
        user_id: UserId,
        provider_id: ProviderId,
    },
    SyncCompleted {
        user_id: UserId,
        provider_id: ProviderId,
        emails: u64,
        incremental: bool,
    },
    SyncFailed {
        user_id: UserId,
        provider_id: ProviderId,
        error: String,
    },
    AttachmentUploaded {
        user_id: UserId,
        attachment_id: AttachmentId,
    },
    AttachmentQuarantined {
        user_id: UserId,
        attachment_id: AttachmentId,
        threats: Vec<String>,
    },
    AttachmentDeleted {
        user_id: UserId,
        attachment_id: AttachmentId,
    },
    BackupCreated {
        user_id: UserId,
        backup_id: BackupId,
    },
    BackupRestored {
        user_id: UserId,
        backup_id: BackupId,
        restored: u64,
    },
    BackupDeleted {
        user_id: UserId,
        backup_id: BackupId,
    },
    SettingsUpdated {
        user_id: UserId,
    },
}

impl EngineEvent {
    /// Wire name, e.g. `email:sent`. Listeners register against these.
    pub fn name(&self) -> &'static str {
        match self {
            Self::EmailStored { .. } => "email:stored",
            Self::EmailSent { .. } => "email:sent",
            Self::EmailUpdated { .. } => "email:updated",
            Self::EmailMoved { .. } => "email:moved",
            Self::EmailDeleted { .. } => "email:deleted",
            Self::EmailRestored { .. } => "email:restored",
            Self::LabelApplied { .. } => "label:applied",
            Self::LabelRemoved { .. } => "label:removed",
            Self::BusinessEmailSent { .. } => "business:sent",
            Self::ProviderConfigured { .. } => "provider:configured",
            Self::ProviderRemoved { .. } => "provider:removed",
            Self::SyncCompleted { .. } => "sync:completed",
            Self::SyncFailed { .. } => "sync:failed",
            Self::AttachmentUploaded { .. } => "attachment:uploaded",
            Self::AttachmentQuarantined { .. } => "attachment:quarantined",
            Self::AttachmentDeleted { .. } => "attachment:deleted",
            Self::BackupCreated { .. } => "backup:created",
            Self::BackupRestored { .. } => "backup:restored",
            Self::BackupDeleted { .. } => "backup:deleted",
            Self::SettingsUpdated { .. } => "settings:updated",
        }
    }

    pub fn user_id(&self) -> &UserId {
        match self {
            Self::EmailStored { user_id, .. }
            | Self::EmailSent { user_id, .. }
            | Self::EmailUpdated { user_id, .. }
            | Self::EmailMoved { user_id, .. }
            | Self::EmailDeleted { user_id, .. }
            | Self::EmailRestored { user_id, .. }
            | Self::LabelApplied { user_id, .. }
            | Self::LabelRemoved { user_id, .. }
            | Self::BusinessEmailSent { user_id, .. }
            | Self::ProviderConfigured { user_id, .. }
            | Self::ProviderRemoved { user_id, .. }
            | Self::SyncCompleted { user_id, .. }
            | Self::SyncFailed { user_id, .. }
            | Self::AttachmentUploaded { user_id, .. }
            | Self::AttachmentQuarantined { user_id, .. }
            | Self::AttachmentDeleted { user_id, .. }
            | Self::BackupCreated { user_id, .. }
            | Self::BackupRestored { user_id, .. }
            | Self::BackupDeleted { user_id, .. }
            | Self::SettingsUpdated { user_id } => user_id,
        }
    }
}

/// Handle returned by [`EventBus::add_event_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Callback invoked for matching events.
pub type Listener = Arc<dyn Fn(&EngineEvent) -> anyhow::Result<()> + Send + Sync>;

struct Registration {
    id: ListenerId,
    event: String,
    listener: Listener,
}

/// Broadcast channel plus an isolated listener registry.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
    listeners: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Receives every event emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Registers `listener` for events named `event`, or [`ALL_EVENTS`].
    pub fn add_event_listener<F>(&self, event: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&EngineEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let event = event.into();
        debug!(listener = id.0, event = %event, "Registered event listener");
        self.registrations().push(Registration {
            id,
            event,
            listener: Arc::new(listener),
        });
        id
    }

    /// Returns false if the listener was not registered.
    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        let mut registrations = self.registrations();
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        registrations.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.registrations().len()
    }

    /// Publishes an event to subscribers and matching listeners.
    pub fn emit(&self, event: EngineEvent) {
        let name = event.name();

        // Call listeners outside the lock so they may register or remove others.
        let matching: Vec<(ListenerId, Listener)> = self
            .registrations()
            .iter()
            .filter(|r| r.event == ALL_EVENTS || r.event == name)
            .map(|r| (r.id, Arc::clone(&r.listener)))
            .collect();

        for (id, listener) in matching {
            match catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(listener = id.0, event = name, error = %e, "Event listener failed");
                }
                Err(_) => {
                    error!(listener = id.0, event = name, "Event listener panicked");
                }
            }
        }

        // No receivers is not an error.
        let _ = self.sender.send(event);
    }

    fn registrations(&self) -> std::sync::MutexGuard<'_, Vec<Registration>> {
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

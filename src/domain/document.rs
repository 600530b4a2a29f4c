//! Business documents and the email activity recorded against them.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::{ClientId, DocumentId, DocumentKind, EmailId, ProviderId, UserId};

/// Lifecycle status of an invoice or quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Draft,
    Sent,
    Paid,
    Overdue,
    Cancelled,
    Accepted,
    Declined,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Sent => "sent",
            Self::Paid => "paid",
            Self::Overdue => "overdue",
            Self::Cancelled => "cancelled",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "sent" => Some(Self::Sent),
            "paid" => Some(Self::Paid),
            "overdue" => Some(Self::Overdue),
            "cancelled" => Some(Self::Cancelled),
            "accepted" => Some(Self::Accepted),
            "declined" => Some(Self::Declined),
            _ => None,
        }
    }
}

/// Client details carried on a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: Option<ClientId>,
    pub name: String,
    pub company: Option<String>,
    pub email: Option<String>,
}

/// An invoice or quote owned by the host application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessDocument {
    pub id: DocumentId,
    pub user_id: UserId,
    pub kind: DocumentKind,
    /// Human-facing number, e.g. "INV-001".
    pub number: String,
    /// Total in minor currency units.
    pub amount_cents: i64,
    pub currency: String,
    pub status: DocumentStatus,
    pub client: ClientInfo,
    pub issue_date: NaiveDate,
    /// Due date for invoices, validity end for quotes.
    pub due_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BusinessDocument {
    /// Amount with two decimals, e.g. "150.00".
    pub fn formatted_amount(&self) -> String {
        format_cents(self.amount_cents)
    }

    /// Whole days past the due date, zero if not yet due.
    pub fn days_overdue(&self, today: NaiveDate) -> i64 {
        self.due_date
            .map(|due| (today - due).num_days().max(0))
            .unwrap_or(0)
    }
}

/// Formats minor units with two decimals.
pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

/// Payment reminder escalation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReminderLevel {
    Gentle,
    Firm,
    Final,
    Urgent,
}

impl ReminderLevel {
    /// Template used for this level.
    pub fn template_id(&self) -> &'static str {
        match self {
            Self::Gentle => "reminder_gentle",
            Self::Firm => "reminder_firm",
            Self::Final => "reminder_final",
            Self::Urgent => "reminder_urgent",
        }
    }

    /// Email type recorded in the business log.
    pub fn email_type(&self) -> &'static str {
        self.template_id()
    }

    pub fn from_email_type(email_type: &str) -> Option<Self> {
        [Self::Gentle, Self::Firm, Self::Final, Self::Urgent]
            .into_iter()
            .find(|level| level.email_type() == email_type)
    }
}

/// Automated follow-up cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FollowUpSequence {
    Standard,
    Urgent,
    Gentle,
}

impl FollowUpSequence {
    /// `(days from now, reminder level)` per step.
    pub fn steps(&self) -> &'static [(i64, ReminderLevel)] {
        match self {
            Self::Standard => &[
                (7, ReminderLevel::Gentle),
                (14, ReminderLevel::Firm),
                (30, ReminderLevel::Final),
            ],
            Self::Urgent => &[(3, ReminderLevel::Urgent), (7, ReminderLevel::Final)],
            Self::Gentle => &[(14, ReminderLevel::Gentle), (30, ReminderLevel::Firm)],
        }
    }
}

/// Outcome recorded for a business email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Failed,
    /// A follow-up step waiting for its due date.
    Scheduled,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Scheduled => "scheduled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "sent" => Self::Sent,
            "scheduled" => Self::Scheduled,
            _ => Self::Failed,
        }
    }
}

/// A business-context email log row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessEmailLog {
    pub id: String,
    pub user_id: UserId,
    pub client_id: Option<ClientId>,
    pub document_kind: Option<DocumentKind>,
    pub document_id: Option<DocumentId>,
    pub document_number: Option<String>,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    pub email_type: String,
    pub status: DeliveryStatus,
    pub recipient_email: String,
    pub subject: String,
    pub template_id: Option<String>,
    pub message_id: Option<String>,
    pub error: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A generic activity row: sends, provider usage, recovery operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailActivity {
    pub id: String,
    pub user_id: UserId,
    pub email_id: Option<EmailId>,
    pub provider_id: Option<ProviderId>,
    pub action: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One entry of a provider's sync history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncHistoryEntry {
    pub id: String,
    pub user_id: UserId,
    pub provider_id: ProviderId,
    pub synced_at: DateTime<Utc>,
    pub emails_count: u64,
    pub success: bool,
    pub incremental: bool,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cents_formatting() {
        assert_eq!(format_cents(15000), "150.00");
        assert_eq!(format_cents(5), "0.05");
        assert_eq!(format_cents(-1234), "-12.34");
    }

    #[test]
    fn overdue_days_clamped_at_zero() {
        let doc = BusinessDocument {
            id: DocumentId::from("inv-1"),
            user_id: UserId::from("u"),
            kind: DocumentKind::Invoice,
            number: "INV-001".into(),
            amount_cents: 100,
            currency: "USD".into(),
            status: DocumentStatus::Sent,
            client: ClientInfo {
                id: None,
                name: "Acme".into(),
                company: None,
                email: None,
            },
            issue_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            due_date: NaiveDate::from_ymd_opt(2024, 1, 31),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let before = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let after = NaiveDate::from_ymd_opt(2024, 2, 10).unwrap();
        assert_eq!(doc.days_overdue(before), 0);
        assert_eq!(doc.days_overdue(after), 10);
    }

    #[test]
    fn follow_up_sequences() {
        assert_eq!(FollowUpSequence::Standard.steps().len(), 3);
        assert_eq!(
            FollowUpSequence::Urgent.steps()[0],
            (3, ReminderLevel::Urgent)
        );
        assert_eq!(ReminderLevel::Firm.template_id(), "reminder_firm");
    }
}

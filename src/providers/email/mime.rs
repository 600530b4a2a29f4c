//! RFC-822 building and parsing.
//!
//! Outbound messages are built with `lettre`; raw messages from Gmail, IMAP
//! and EML imports are parsed with `mail-parser`.

use std::time::SystemTime;

use chrono::{DateTime, Utc};
use lettre::address::Envelope;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MessageBuilder, MultiPart, SinglePart};
use lettre::Message;
use mail_parser::{Addr, Message as ParsedMessage, MessageParser, MimeHeaders};

use super::{OutgoingEmail, ProviderError, Result};
use crate::domain::{Address, Direction, Email, EmailContent, NewEmail, Recipients};

/// Domain used for generated Message-IDs.
const MESSAGE_ID_DOMAIN: &str = "courier.local";

/// A fresh `<uuid@domain>` Message-ID.
pub fn generate_message_id() -> String {
    format!("<{}@{}>", uuid::Uuid::new_v4(), MESSAGE_ID_DOMAIN)
}

fn mailbox(addr: &Address, role: &str) -> Result<Mailbox> {
    let email = addr
        .email
        .parse::<lettre::Address>()
        .map_err(|e| ProviderError::InvalidRequest(format!("invalid {} address: {}", role, e)))?;
    Ok(Mailbox::new(addr.name.clone(), email))
}

fn body(text: Option<&str>, html: Option<&str>) -> MultiPart {
    match (text, html) {
        (Some(text), Some(html)) => MultiPart::alternative()
            .singlepart(SinglePart::plain(text.to_string()))
            .singlepart(SinglePart::html(html.to_string())),
        (None, Some(html)) => MultiPart::mixed().singlepart(SinglePart::html(html.to_string())),
        (text, None) => {
            MultiPart::mixed().singlepart(SinglePart::plain(text.unwrap_or_default().to_string()))
        }
    }
}

/// Builds a sendable message. Returns it with its Message-ID.
pub fn build_message(email: &OutgoingEmail) -> Result<(Message, String)> {
    let message_id = generate_message_id();
    let mut builder = MessageBuilder::new()
        .from(mailbox(&email.from, "from")?)
        .subject(email.subject.clone())
        .message_id(Some(message_id.clone()))
        .date_now();

    for addr in &email.to {
        builder = builder.to(mailbox(addr, "to")?);
    }
    for addr in &email.cc {
        builder = builder.cc(mailbox(addr, "cc")?);
    }
    for addr in &email.bcc {
        builder = builder.bcc(mailbox(addr, "bcc")?);
    }
    if let Some(reply_to) = &email.in_reply_to {
        builder = builder.in_reply_to(reply_to.clone());
    }

    let mut parts = body(email.body_text.as_deref(), email.body_html.as_deref());
    if !email.attachments.is_empty() {
        let mut mixed = MultiPart::mixed().multipart(parts);
        for attachment in &email.attachments {
            let content_type = ContentType::parse(&attachment.content_type).map_err(|e| {
                ProviderError::InvalidRequest(format!(
                    "invalid content type for {}: {}",
                    attachment.filename, e
                ))
            })?;
            mixed = mixed.singlepart(
                Attachment::new(attachment.filename.clone())
                    .body(attachment.data.clone(), content_type),
            );
        }
        parts = mixed;
    }

    let message = builder
        .multipart(parts)
        .map_err(|e| ProviderError::InvalidRequest(format!("failed to build message: {}", e)))?;
    Ok((message, message_id))
}

/// Renders a stored email as an RFC-822 document.
///
/// Messages without recipients still render; the envelope is only used by
/// `lettre` for validation.
pub fn render_eml(email: &Email) -> Result<String> {
    let from = mailbox(&email.sender, "from")?;
    let mut builder = MessageBuilder::new()
        .from(from.clone())
        .subject(email.subject.clone())
        .date(SystemTime::from(email.timestamp()));

    if let Some(message_id) = &email.provider_message_id {
        if message_id.starts_with('<') {
            builder = builder.message_id(Some(message_id.clone()));
        }
    }
    for addr in &email.recipients.to {
        builder = builder.to(mailbox(addr, "to")?);
    }
    for addr in &email.recipients.cc {
        builder = builder.cc(mailbox(addr, "cc")?);
    }

    let envelope = Envelope::new(Some(from.email.clone()), vec![from.email])
        .map_err(|e| ProviderError::InvalidRequest(e.to_string()))?;
    let message = builder
        .envelope(envelope)
        .multipart(body(
            email.content.text.as_deref(),
            email.content.html.as_deref(),
        ))
        .map_err(|e| ProviderError::InvalidRequest(format!("failed to build message: {}", e)))?;

    Ok(String::from_utf8_lossy(&message.formatted()).into_owned())
}

fn parse_addr(addr: &Addr) -> Address {
    Address {
        email: addr.address().unwrap_or("").to_string(),
        name: addr.name().map(|s| s.to_string()),
    }
}

fn addresses(field: Option<&mail_parser::Address>) -> Vec<Address> {
    field
        .and_then(|addr| addr.as_list())
        .map(|list| list.iter().map(parse_addr).collect())
        .unwrap_or_default()
}

/// A raw message decoded into storable fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEmail {
    pub message_id: Option<String>,
    pub subject: String,
    pub sender: Address,
    pub recipients: Recipients,
    pub content: EmailContent,
    pub date: Option<DateTime<Utc>>,
    pub attachment_names: Vec<String>,
}

impl ParsedEmail {
    /// Converts into a [`NewEmail`] in the given direction.
    pub fn into_new_email(self, direction: Direction) -> NewEmail {
        let mut email = match direction {
            Direction::Inbound => NewEmail::inbound(self.sender, self.subject),
            Direction::Outbound => NewEmail::outbound(self.sender, self.subject),
        };
        email.recipients = self.recipients;
        email.content = self.content;
        email.timestamp = self.date;
        email.provider_message_id = self.message_id;
        email
    }
}

/// Parses a raw RFC-822 message. Returns `None` if it is not a message.
pub fn parse_raw(raw: &[u8]) -> Option<ParsedEmail> {
    let message: ParsedMessage = MessageParser::default().parse(raw)?;
    // A parse of arbitrary bytes yields an empty message; require a header.
    if message.from().is_none() && message.subject().is_none() && message.message_id().is_none() {
        return None;
    }

    let sender = addresses(message.from())
        .into_iter()
        .next()
        .unwrap_or_else(|| Address::new(""));
    let date = message
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0));

    let attachment_names = message
        .attachments()
        .filter_map(|part| part.attachment_name().map(str::to_string))
        .collect();

    Some(ParsedEmail {
        message_id: message.message_id().map(|id| format!("<{}>", id)),
        subject: message.subject().unwrap_or_default().to_string(),
        sender,
        recipients: Recipients {
            to: addresses(message.to()),
            cc: addresses(message.cc()),
            bcc: addresses(message.bcc()),
        },
        content: EmailContent {
            text: message.body_text(0).map(|s| s.to_string()),
            html: message.body_html(0).map(|s| s.to_string()),
        },
        date,
        attachment_names,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::email::OutgoingAttachment;

    fn outgoing() -> OutgoingEmail {
        OutgoingEmail {
            from: Address::with_name("me@example.com", "Me"),
            to: vec![Address::with_name("client@example.com", "Client")],
            cc: vec![Address::new("cc@example.com")],
            bcc: vec![],
            subject: "Invoice INV-001".into(),
            body_text: Some("Please find your invoice attached.".into()),
            body_html: Some("<p>Please find your invoice attached.</p>".into()),
            in_reply_to: None,
            attachments: vec![],
        }
    }

    #[test]
    fn built_message_parses_back() {
        let (message, message_id) = build_message(&outgoing()).unwrap();
        let parsed = parse_raw(&message.formatted()).unwrap();

        assert_eq!(parsed.message_id.as_deref(), Some(message_id.as_str()));
        assert_eq!(parsed.subject, "Invoice INV-001");
        assert_eq!(parsed.sender, Address::with_name("me@example.com", "Me"));
        assert_eq!(parsed.recipients.to[0].email, "client@example.com");
        assert_eq!(parsed.recipients.cc[0].email, "cc@example.com");
        assert!(parsed.content.html.unwrap().contains("<p>"));
    }

    #[test]
    fn attachments_are_included() {
        let mut email = outgoing();
        email.attachments.push(OutgoingAttachment {
            filename: "invoice.pdf".into(),
            content_type: "application/pdf".into(),
            data: b"%PDF-1.4".to_vec(),
        });
        let (message, _) = build_message(&email).unwrap();
        let parsed = parse_raw(&message.formatted()).unwrap();
        assert_eq!(parsed.attachment_names, vec!["invoice.pdf".to_string()]);
    }

    #[test]
    fn invalid_recipient_is_rejected() {
        let mut email = outgoing();
        email.to = vec![Address::new("not an address")];
        assert!(matches!(
            build_message(&email),
            Err(ProviderError::InvalidRequest(_))
        ));
    }

    #[test]
    fn parse_plain_message() {
        let raw = b"From: Alice <alice@example.com>\r\n\
To: bob@example.com\r\n\
Subject: Lunch?\r\n\
Message-ID: <abc@example.com>\r\n\
Date: Tue, 1 Jul 2025 10:00:00 +0000\r\n\
\r\n\
Are you free at noon?\r\n";
        let parsed = parse_raw(raw).unwrap();
        assert_eq!(parsed.sender.name.as_deref(), Some("Alice"));
        assert_eq!(parsed.message_id.as_deref(), Some("<abc@example.com>"));
        assert_eq!(
            parsed.date.map(|d| d.to_rfc3339()),
            Some("2025-07-01T10:00:00+00:00".to_string())
        );

        let new_email = parsed.into_new_email(Direction::Inbound);
        assert!(new_email.validation_errors().is_empty());
        assert!(new_email.content.text.unwrap().contains("noon"));
    }

    #[test]
    fn garbage_is_not_a_message() {
        assert!(parse_raw(b"").is_none());
    }
}

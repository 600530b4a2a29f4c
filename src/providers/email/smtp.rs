//! SMTP provider implementation (send only).

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials as SmtpCredentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use tracing::info;

use super::mime;
use super::{ConnectionStatus, EmailProvider, OutgoingEmail, ProviderError, Result};
use crate::domain::{ProviderKind, ServerCredentials};

/// Generic SMTP relay.
///
/// `secure` selects implicit TLS; otherwise the connection is upgraded with
/// STARTTLS.
pub struct SmtpProvider {
    credentials: ServerCredentials,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpProvider {
    pub fn new(credentials: ServerCredentials) -> Result<Self> {
        let smtp_credentials = SmtpCredentials::new(
            credentials.username.clone(),
            credentials.password.expose().to_string(),
        );

        let builder = if credentials.secure {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&credentials.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&credentials.host)
        }
        .map_err(|e| ProviderError::Connection(format!("SMTP relay error: {}", e)))?;

        let mailer = builder
            .credentials(smtp_credentials)
            .port(credentials.port)
            .build();

        Ok(Self {
            credentials,
            mailer,
        })
    }

    /// Sender mailbox name, from the connection settings when present.
    fn sender_name<'a>(&'a self, email: &'a OutgoingEmail) -> Option<&'a str> {
        email
            .from
            .name
            .as_deref()
            .or(self.credentials.from_name.as_deref())
    }
}

#[async_trait]
impl EmailProvider for SmtpProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Smtp
    }

    async fn test_connection(&self) -> Result<ConnectionStatus> {
        let connected = self
            .mailer
            .test_connection()
            .await
            .map_err(|e| ProviderError::Connection(format!("SMTP handshake failed: {}", e)))?;
        Ok(ConnectionStatus {
            connected,
            identity: Some(self.credentials.username.clone()),
        })
    }

    async fn send_email(&self, email: &OutgoingEmail) -> Result<String> {
        let mut outgoing = email.clone();
        outgoing.from.name = self.sender_name(email).map(str::to_string);
        let (message, message_id) = mime::build_message(&outgoing)?;

        self.mailer.send(message).await.map_err(|e| {
            if e.is_permanent() {
                ProviderError::InvalidRequest(format!("SMTP rejected message: {}", e))
            } else {
                ProviderError::Connection(format!("SMTP send failed: {}", e))
            }
        })?;

        info!(message_id = %message_id, "Email sent via SMTP");
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Address, Feature, Secret};

    fn credentials() -> ServerCredentials {
        ServerCredentials {
            host: "smtp.example.com".into(),
            port: 587,
            secure: false,
            username: "user@example.com".into(),
            password: Secret::new("password"),
            from_name: Some("Acme Billing".into()),
        }
    }

    fn outgoing(name: Option<&str>) -> OutgoingEmail {
        OutgoingEmail {
            from: Address {
                email: "user@example.com".into(),
                name: name.map(str::to_string),
            },
            to: vec![Address::new("client@example.com")],
            cc: vec![],
            bcc: vec![],
            subject: "Hi".into(),
            body_text: Some("Hello".into()),
            body_html: None,
            in_reply_to: None,
            attachments: vec![],
        }
    }

    #[tokio::test]
    async fn builds_for_starttls_and_cannot_receive() {
        let provider = SmtpProvider::new(credentials()).unwrap();
        assert_eq!(provider.kind(), ProviderKind::Smtp);
        assert!(provider.supports(Feature::Send));

        let result = provider
            .sync_emails(&crate::providers::email::SyncRequest::full(10))
            .await;
        assert!(matches!(result, Err(ProviderError::Unsupported(_))));
    }

    #[tokio::test]
    async fn from_name_falls_back_to_connection_setting() {
        let provider = SmtpProvider::new(credentials()).unwrap();
        assert_eq!(provider.sender_name(&outgoing(None)), Some("Acme Billing"));
        assert_eq!(provider.sender_name(&outgoing(Some("Jo"))), Some("Jo"));
    }
}

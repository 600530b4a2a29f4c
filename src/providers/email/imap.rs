//! IMAP provider implementation (receive only).
//!
//! Each operation opens its own implicit-TLS session, logs in, does its work
//! and logs out. Incremental sync keys on `UIDVALIDITY:UID`: when the
//! server's UIDVALIDITY changes the cursor is discarded and a full sync runs.

use std::sync::Arc;

use async_imap::types::{Fetch, Flag};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info, warn};

use super::mime;
use super::{ConnectionStatus, EmailProvider, ProviderError, Result, SyncBatch, SyncRequest};
use crate::domain::{
    system_folders, Direction, FolderId, ProviderId, ProviderKind, ServerCredentials,
};

type ImapSession = async_imap::Session<Compat<TlsStream<TcpStream>>>;

const INBOX: &str = "INBOX";

/// Position in a mailbox: `uidvalidity:last_uid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UidCursor {
    pub uid_validity: u32,
    pub last_uid: u32,
}

impl UidCursor {
    pub fn parse(token: &str) -> Option<Self> {
        let (validity, uid) = token.split_once(':')?;
        Some(Self {
            uid_validity: validity.parse().ok()?,
            last_uid: uid.parse().ok()?,
        })
    }

    pub fn to_token(self) -> String {
        format!("{}:{}", self.uid_validity, self.last_uid)
    }
}

/// Generic IMAP provider.
pub struct ImapProvider {
    credentials: ServerCredentials,
    provider_id: Option<ProviderId>,
}

impl ImapProvider {
    /// Only implicit TLS is supported.
    pub fn new(credentials: ServerCredentials) -> Result<Self> {
        if !credentials.secure {
            return Err(ProviderError::InvalidRequest(
                "IMAP requires implicit TLS (secure: true)".to_string(),
            ));
        }
        Ok(Self {
            credentials,
            provider_id: None,
        })
    }

    pub fn for_connection(mut self, provider_id: ProviderId) -> Self {
        self.provider_id = Some(provider_id);
        self
    }

    /// Establishes TLS connection to the IMAP server with futures compat wrapper.
    async fn connect_tls(&self) -> Result<Compat<TlsStream<TcpStream>>> {
        let tcp_stream = TcpStream::connect((self.credentials.host.as_str(), self.credentials.port))
            .await
            .map_err(|e| ProviderError::Connection(format!("TCP connect failed: {}", e)))?;

        let config = ClientConfig::builder()
            .with_root_certificates(tokio_rustls::rustls::RootCertStore::from_iter(
                webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
            ))
            .with_no_client_auth();

        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(self.credentials.host.clone())
            .map_err(|e| ProviderError::Connection(format!("invalid server name: {}", e)))?;

        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| ProviderError::Connection(format!("TLS handshake failed: {}", e)))?;

        Ok(tls_stream.compat())
    }

    async fn login(&self) -> Result<ImapSession> {
        let client = async_imap::Client::new(self.connect_tls().await?);
        client
            .login(&self.credentials.username, self.credentials.password.expose())
            .await
            .map_err(|e| ProviderError::Authentication(format!("IMAP login failed: {}", e.0)))
    }

    async fn fetch_batch(
        &self,
        session: &mut ImapSession,
        cursor: Option<UidCursor>,
        max_results: u32,
    ) -> Result<SyncBatch> {
        let mailbox = session
            .select(INBOX)
            .await
            .map_err(|e| ProviderError::Connection(format!("SELECT failed: {}", e)))?;
        let uid_validity = mailbox.uid_validity.unwrap_or_default();

        let since = match cursor {
            Some(c) if c.uid_validity == uid_validity => Some(c.last_uid),
            Some(_) => {
                warn!(host = %self.credentials.host, "UIDVALIDITY changed, resyncing mailbox");
                None
            }
            None => None,
        };
        let query = match since {
            Some(last) => format!("UID {}:*", last.saturating_add(1)),
            None => "ALL".to_string(),
        };

        let uids = session
            .uid_search(&query)
            .await
            .map_err(|e| ProviderError::Connection(format!("SEARCH failed: {}", e)))?;
        let uids = select_uids(uids, since, max_results);

        let last_uid = uids.last().copied().or(since).unwrap_or_default();
        let next_token = Some(
            UidCursor {
                uid_validity,
                last_uid,
            }
            .to_token(),
        );
        if uids.is_empty() {
            return Ok(SyncBatch {
                emails: Vec::new(),
                next_token,
            });
        }

        let sequence = uids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let mut stream = session
            .uid_fetch(&sequence, "(UID FLAGS RFC822)")
            .await
            .map_err(|e| ProviderError::Connection(format!("FETCH failed: {}", e)))?;

        let mut emails = Vec::new();
        while let Some(fetch) = stream.next().await {
            match fetch {
                Ok(fetch) => {
                    if let Some(email) = self.to_new_email(&fetch) {
                        emails.push(email);
                    }
                }
                Err(e) => warn!(error = %e, "Skipping unreadable IMAP message"),
            }
        }
        drop(stream);

        debug!(count = emails.len(), "IMAP sync fetched messages");
        Ok(SyncBatch { emails, next_token })
    }

    fn to_new_email(&self, fetch: &Fetch) -> Option<crate::domain::NewEmail> {
        let parsed = mime::parse_raw(fetch.body()?)?;
        let mut email = parsed.into_new_email(Direction::Inbound);
        for flag in fetch.flags() {
            match flag {
                Flag::Seen => email.is_read = true,
                Flag::Flagged => email.is_starred = true,
                _ => {}
            }
        }
        if email.provider_message_id.is_none() {
            email.provider_message_id = fetch.uid.map(|uid| format!("uid:{}", uid));
        }
        email.provider_id = self.provider_id.clone();
        email.folder_id = Some(FolderId::from(system_folders::INBOX));
        Some(email)
    }
}

/// UIDs above the cursor in ascending order, capped at `max_results`.
fn select_uids(
    uids: impl IntoIterator<Item = u32>,
    since: Option<u32>,
    max_results: u32,
) -> Vec<u32> {
    // `n:*` always matches the highest UID, even when it is below `n`.
    let mut uids: Vec<u32> = uids
        .into_iter()
        .filter(|uid| since.map_or(true, |last| *uid > last))
        .collect();
    uids.sort_unstable();
    uids.truncate(max_results as usize);
    uids
}

#[async_trait]
impl EmailProvider for ImapProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Imap
    }

    async fn test_connection(&self) -> Result<ConnectionStatus> {
        let mut session = self.login().await?;
        session
            .logout()
            .await
            .map_err(|e| ProviderError::Connection(format!("LOGOUT failed: {}", e)))?;
        info!(host = %self.credentials.host, "IMAP connection verified");
        Ok(ConnectionStatus {
            connected: true,
            identity: Some(self.credentials.username.clone()),
        })
    }

    async fn sync_emails(&self, request: &SyncRequest) -> Result<SyncBatch> {
        let cursor = if request.incremental {
            request.since_token.as_deref().and_then(UidCursor::parse)
        } else {
            None
        };

        let mut session = self.login().await?;
        let result = self.fetch_batch(&mut session, cursor, request.max_results).await;
        if let Err(e) = session.logout().await {
            debug!(error = %e, "IMAP logout failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Secret;
    use crate::domain::Feature;

    fn credentials(secure: bool) -> ServerCredentials {
        ServerCredentials {
            host: "imap.example.com".into(),
            port: 993,
            secure,
            username: "user@example.com".into(),
            password: Secret::new("password"),
            from_name: None,
        }
    }

    #[test]
    fn plaintext_imap_is_rejected() {
        assert!(matches!(
            ImapProvider::new(credentials(false)),
            Err(ProviderError::InvalidRequest(_))
        ));
        let provider = ImapProvider::new(credentials(true)).unwrap();
        assert_eq!(provider.kind(), ProviderKind::Imap);
        assert!(!provider.supports(Feature::Send));
    }

    #[test]
    fn cursor_token_format() {
        let cursor = UidCursor::parse("1700000000:42").unwrap();
        assert_eq!(cursor.uid_validity, 1_700_000_000);
        assert_eq!(cursor.last_uid, 42);
        assert_eq!(cursor.to_token(), "1700000000:42");
        assert!(UidCursor::parse("42").is_none());
        assert!(UidCursor::parse("a:b").is_none());
    }

    #[test]
    fn uid_selection_skips_seen_and_caps() {
        assert_eq!(select_uids([42], Some(42), 10), Vec::<u32>::new());
        assert_eq!(select_uids([45, 43, 44], Some(42), 2), vec![43, 44]);
        assert_eq!(select_uids([3, 1, 2], None, 10), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn send_is_unsupported() {
        let provider = ImapProvider::new(credentials(true)).unwrap();
        let email = crate::providers::email::OutgoingEmail {
            from: crate::domain::Address::new("user@example.com"),
            to: vec![crate::domain::Address::new("you@example.com")],
            cc: vec![],
            bcc: vec![],
            subject: "Hi".into(),
            body_text: None,
            body_html: None,
            in_reply_to: None,
            attachments: vec![],
        };
        assert!(matches!(
            provider.send_email(&email).await,
            Err(ProviderError::Unsupported(_))
        ));
    }
}

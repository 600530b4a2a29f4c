//! OAuth 2.0 authorization-code flow with PKCE for Google and Microsoft.
//!
//! Authorization URLs and PKCE pairs come from the `oauth2` crate. Token
//! exchange, refresh and revoke are plain form posts so they share the
//! engine's `reqwest` client and error classification.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use chrono::{DateTime, Duration, Utc};
use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge, RedirectUrl, Scope, TokenUrl,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::http;
use super::{ProviderError, Result};
use crate::domain::{ProviderId, ProviderKind, Secret, UserId};

/// How long an issued state stays redeemable.
pub const STATE_TTL_MINUTES: i64 = 10;

const GOOGLE_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.modify",
    "https://www.googleapis.com/auth/gmail.send",
    "https://www.googleapis.com/auth/userinfo.email",
];

const MICROSOFT_SCOPES: &[&str] = &[
    "offline_access",
    "https://graph.microsoft.com/Mail.ReadWrite",
    "https://graph.microsoft.com/Mail.Send",
    "https://graph.microsoft.com/User.Read",
];

/// Authorization, token and revoke endpoints. Overridable for tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthEndpoints {
    pub google_auth_url: String,
    pub google_token_url: String,
    pub google_revoke_url: String,
    /// Base of `{authority}/{tenant}/oauth2/v2.0/...`.
    pub microsoft_authority: String,
}

impl Default for OAuthEndpoints {
    fn default() -> Self {
        Self {
            google_auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            google_token_url: "https://oauth2.googleapis.com/token".to_string(),
            google_revoke_url: "https://oauth2.googleapis.com/revoke".to_string(),
            microsoft_authority: "https://login.microsoftonline.com".to_string(),
        }
    }
}

impl OAuthEndpoints {
    pub fn auth_url(&self, kind: ProviderKind, tenant: &str) -> Result<String> {
        match kind {
            ProviderKind::Gmail => Ok(self.google_auth_url.clone()),
            ProviderKind::Outlook => Ok(format!(
                "{}/{}/oauth2/v2.0/authorize",
                self.microsoft_authority.trim_end_matches('/'),
                tenant
            )),
            other => Err(not_oauth(other)),
        }
    }

    pub fn token_url(&self, kind: ProviderKind, tenant: &str) -> Result<String> {
        match kind {
            ProviderKind::Gmail => Ok(self.google_token_url.clone()),
            ProviderKind::Outlook => Ok(format!(
                "{}/{}/oauth2/v2.0/token",
                self.microsoft_authority.trim_end_matches('/'),
                tenant
            )),
            other => Err(not_oauth(other)),
        }
    }
}

fn not_oauth(kind: ProviderKind) -> ProviderError {
    ProviderError::Unsupported(format!("{} does not use OAuth", kind))
}

fn scopes(kind: ProviderKind) -> &'static [&'static str] {
    match kind {
        ProviderKind::Outlook => MICROSOFT_SCOPES,
        _ => GOOGLE_SCOPES,
    }
}

/// An OAuth application registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: Secret,
    pub redirect_uri: String,
    /// Microsoft tenant; ignored for Google.
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
}

fn default_tenant() -> String {
    "common".to_string()
}

/// Returned by [`OAuthFlow::authorize`]: where to send the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationRequest {
    pub auth_url: String,
    pub state: String,
}

/// Tokens from an exchange or refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: Secret,
    /// Absent on refreshes that do not rotate the refresh token.
    pub refresh_token: Option<Secret>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
}

impl From<TokenResponse> for TokenSet {
    fn from(response: TokenResponse) -> Self {
        Self {
            access_token: Secret::new(response.access_token),
            refresh_token: response.refresh_token.map(Secret::new),
            expires_at: response
                .expires_in
                .map(|secs| Utc::now() + Duration::seconds(secs)),
            scope: response.scope,
        }
    }
}

/// Stores tokens an adapter refreshed by itself, so a rotated refresh token
/// outlives the adapter holding it.
#[async_trait]
pub trait TokenSink: Send + Sync {
    async fn store_tokens(
        &self,
        user_id: &UserId,
        provider_id: &ProviderId,
        tokens: &TokenSet,
    ) -> Result<()>;
}

/// One connection's route to a [`TokenSink`].
#[derive(Clone)]
pub struct TokenPersistence {
    sink: Arc<dyn TokenSink>,
    user_id: UserId,
    provider_id: ProviderId,
}

impl TokenPersistence {
    pub fn new(sink: Arc<dyn TokenSink>, user_id: UserId, provider_id: ProviderId) -> Self {
        Self {
            sink,
            user_id,
            provider_id,
        }
    }

    /// A failed write is logged. The refreshed token stays usable in memory.
    pub async fn store(&self, tokens: &TokenSet) {
        if let Err(e) = self
            .sink
            .store_tokens(&self.user_id, &self.provider_id, tokens)
            .await
        {
            warn!(
                provider_id = %self.provider_id,
                error = %e,
                "Failed to persist refreshed tokens"
            );
        }
    }
}

impl std::fmt::Debug for TokenPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPersistence")
            .field("provider_id", &self.provider_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct PendingAuthorization {
    kind: ProviderKind,
    user_id: UserId,
    pkce_verifier: Secret,
    issued_at: DateTime<Utc>,
}

/// A state redeemed by a callback.
#[derive(Debug)]
pub struct RedeemedState {
    pub kind: ProviderKind,
    pub user_id: UserId,
    pub pkce_verifier: Secret,
}

/// Issues authorization URLs and redeems their states.
///
/// States are single-use and expire after [`STATE_TTL_MINUTES`].
#[derive(Debug)]
pub struct OAuthFlow {
    http: reqwest::Client,
    endpoints: OAuthEndpoints,
    pending: Mutex<HashMap<String, PendingAuthorization>>,
}

impl OAuthFlow {
    pub fn new(http: reqwest::Client, endpoints: OAuthEndpoints) -> Self {
        Self {
            http,
            endpoints,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn endpoints(&self) -> &OAuthEndpoints {
        &self.endpoints
    }

    /// Builds an authorization URL with a fresh state and S256 PKCE challenge.
    pub fn authorize(
        &self,
        kind: ProviderKind,
        user_id: &UserId,
        client: &OAuthClient,
    ) -> Result<AuthorizationRequest> {
        let auth_url = AuthUrl::new(self.endpoints.auth_url(kind, &client.tenant_id)?)
            .map_err(|e| ProviderError::InvalidRequest(format!("auth url: {}", e)))?;
        let token_url = TokenUrl::new(self.endpoints.token_url(kind, &client.tenant_id)?)
            .map_err(|e| ProviderError::InvalidRequest(format!("token url: {}", e)))?;
        let redirect = RedirectUrl::new(client.redirect_uri.clone())
            .map_err(|e| ProviderError::InvalidRequest(format!("redirect uri: {}", e)))?;

        let oauth_client = BasicClient::new(
            ClientId::new(client.client_id.clone()),
            Some(ClientSecret::new(client.client_secret.expose().to_string())),
            auth_url,
            Some(token_url),
        )
        .set_redirect_uri(redirect);

        let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
        let mut request = oauth_client
            .authorize_url(CsrfToken::new_random)
            .set_pkce_challenge(challenge);
        for scope in scopes(kind) {
            request = request.add_scope(Scope::new(scope.to_string()));
        }
        if kind == ProviderKind::Gmail {
            request = request
                .add_extra_param("access_type", "offline")
                .add_extra_param("prompt", "consent");
        }
        let (url, state) = request.url();

        let mut pending = self.lock_pending()?;
        let now = Utc::now();
        pending.retain(|_, p| !is_expired(p.issued_at, now));
        pending.insert(
            state.secret().clone(),
            PendingAuthorization {
                kind,
                user_id: user_id.clone(),
                pkce_verifier: Secret::new(verifier.secret().clone()),
                issued_at: now,
            },
        );

        debug!(user_id = %user_id, provider = %kind, "Issued OAuth authorization request");
        Ok(AuthorizationRequest {
            auth_url: url.to_string(),
            state: state.secret().clone(),
        })
    }

    /// Redeems a callback's state.
    ///
    /// The returned state must equal `expected_state`, must have been issued
    /// for `kind` and must not have expired. Any mismatch consumes nothing
    /// and fails with [`ProviderError::InvalidState`].
    pub fn redeem_state(
        &self,
        kind: ProviderKind,
        state: &str,
        expected_state: &str,
    ) -> Result<RedeemedState> {
        if state.is_empty() || !constant_time_eq(state.as_bytes(), expected_state.as_bytes()) {
            warn!(provider = %kind, "OAuth callback state mismatch");
            return Err(ProviderError::InvalidState);
        }

        let mut pending = self.lock_pending()?;
        let issued_for_kind = pending.get(state).is_some_and(|p| p.kind == kind);
        if !issued_for_kind {
            warn!(provider = %kind, "OAuth callback with unknown state");
            return Err(ProviderError::InvalidState);
        }
        let Some(entry) = pending.remove(state) else {
            return Err(ProviderError::InvalidState);
        };
        if is_expired(entry.issued_at, Utc::now()) {
            warn!(provider = %kind, "OAuth callback with expired state");
            return Err(ProviderError::InvalidState);
        }

        Ok(RedeemedState {
            kind: entry.kind,
            user_id: entry.user_id,
            pkce_verifier: entry.pkce_verifier,
        })
    }

    /// Exchanges an authorization code for tokens.
    pub async fn exchange_code(
        &self,
        kind: ProviderKind,
        client: &OAuthClient,
        code: &str,
        pkce_verifier: &Secret,
    ) -> Result<TokenSet> {
        let url = self.endpoints.token_url(kind, &client.tenant_id)?;
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", client.redirect_uri.as_str()),
            ("client_id", client.client_id.as_str()),
            ("client_secret", client.client_secret.expose()),
            ("code_verifier", pkce_verifier.expose()),
        ];
        let response = self
            .http
            .post(&url)
            .form(&params)
            .send()
            .await
            .map_err(http::connection_error)?;
        let tokens: TokenResponse = http::json(response).await?;
        info!(provider = %kind, "Exchanged OAuth authorization code");
        Ok(tokens.into())
    }

    /// Uses a refresh token to obtain a new access token.
    pub async fn refresh(
        &self,
        kind: ProviderKind,
        client_id: &str,
        client_secret: &Secret,
        tenant: &str,
        refresh_token: &Secret,
    ) -> Result<TokenSet> {
        let url = self.endpoints.token_url(kind, tenant)?;
        let scope = scopes(kind).join(" ");
        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.expose()),
            ("client_id", client_id),
            ("client_secret", client_secret.expose()),
        ];
        if kind == ProviderKind::Outlook {
            params.push(("scope", scope.as_str()));
        }
        let response = self
            .http
            .post(&url)
            .form(&params)
            .send()
            .await
            .map_err(http::connection_error)?;
        let tokens: TokenResponse = http::json(response).await.map_err(|e| match e {
            // A rejected refresh token cannot be remediated by another refresh.
            ProviderError::TokenExpired => {
                ProviderError::Authentication("refresh token rejected".to_string())
            }
            other => other,
        })?;
        debug!(provider = %kind, "Refreshed OAuth access token");
        Ok(tokens.into())
    }

    /// Revokes a token. Microsoft has no revocation endpoint.
    pub async fn revoke(&self, kind: ProviderKind, token: &Secret) -> Result<()> {
        match kind {
            ProviderKind::Gmail => {
                let response = self
                    .http
                    .post(&self.endpoints.google_revoke_url)
                    .form(&[("token", token.expose())])
                    .send()
                    .await
                    .map_err(http::connection_error)?;
                http::check(response).await?;
                info!(provider = %kind, "Revoked OAuth token");
                Ok(())
            }
            ProviderKind::Outlook => Err(ProviderError::Unsupported(
                "Microsoft does not support token revocation".to_string(),
            )),
            other => Err(not_oauth(other)),
        }
    }

    fn lock_pending(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, PendingAuthorization>>> {
        self.pending
            .lock()
            .map_err(|_| ProviderError::Internal("OAuth state lock poisoned".to_string()))
    }

    #[cfg(test)]
    fn backdate(&self, state: &str, minutes: i64) {
        if let Some(entry) = self.pending.lock().unwrap().get_mut(state) {
            entry.issued_at -= Duration::minutes(minutes);
        }
    }
}

fn is_expired(issued_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - issued_at > Duration::minutes(STATE_TTL_MINUTES)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

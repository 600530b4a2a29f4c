//! Shared HTTP plumbing for the REST adapters.

use reqwest::header::RETRY_AFTER;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;

use super::{ProviderError, Result};

/// Maps a failed HTTP exchange to a [`ProviderError`].
///
/// 401 and `invalid_token` bodies become [`ProviderError::TokenExpired`];
/// 429 becomes [`ProviderError::RateLimited`] with the `Retry-After` hint.
pub fn classify_status(status: StatusCode, retry_after: Option<&str>, body: &str) -> ProviderError {
    if status == StatusCode::UNAUTHORIZED || body.contains("invalid_token") {
        return ProviderError::TokenExpired;
    }
    match status.as_u16() {
        429 => ProviderError::RateLimited {
            retry_after_secs: retry_after.and_then(parse_retry_after),
        },
        403 => ProviderError::Authentication(format!("forbidden: {}", truncate(body))),
        404 | 410 => ProviderError::NotFound(truncate(body)),
        400 | 422 => ProviderError::InvalidRequest(truncate(body)),
        500..=599 => {
            ProviderError::Connection(format!("server error ({}): {}", status, truncate(body)))
        }
        _ => ProviderError::Provider(format!("API error ({}): {}", status, truncate(body))),
    }
}

/// Parses a `Retry-After` value given as delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    let at = mailparse::dateparse(value).ok()?;
    let delta = at - chrono::Utc::now().timestamp();
    Some(delta.max(0) as u64)
}

fn truncate(body: &str) -> String {
    const LIMIT: usize = 300;
    match body.char_indices().nth(LIMIT) {
        Some((idx, _)) => format!("{}…", &body[..idx]),
        None => body.to_string(),
    }
}

pub fn connection_error(err: reqwest::Error) -> ProviderError {
    ProviderError::Connection(err.to_string())
}

/// Returns the response if successful, or the classified error.
pub async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, retry_after.as_deref(), &body))
}

/// Checks the status and decodes a JSON body.
pub async fn json<T: DeserializeOwned>(response: Response) -> Result<T> {
    check(response)
        .await?
        .json()
        .await
        .map_err(|e| ProviderError::Internal(format!("parse response: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_is_token_expired() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, ""),
            ProviderError::TokenExpired
        ));
        assert!(matches!(
            classify_status(
                StatusCode::BAD_REQUEST,
                None,
                r#"{"error":"invalid_token"}"#
            ),
            ProviderError::TokenExpired
        ));
    }

    #[test]
    fn too_many_requests_carries_hint() {
        match classify_status(StatusCode::TOO_MANY_REQUESTS, Some("30"), "") {
            ProviderError::RateLimited { retry_after_secs } => {
                assert_eq!(retry_after_secs, Some(30))
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, None, ""),
            ProviderError::RateLimited {
                retry_after_secs: None
            }
        ));
    }

    #[test]
    fn retry_after_in_the_past_is_zero() {
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), Some(0));
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn other_statuses() {
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, None, "gone"),
            ProviderError::NotFound(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None, ""),
            ProviderError::Connection(_)
        ));
    }
}

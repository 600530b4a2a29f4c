//! One-shot remediation of transient provider failures.

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use super::{EmailProvider, ProviderError, Result};

/// Longest `Retry-After` hint worth waiting for in-line.
pub const MAX_INLINE_WAIT_SECS: u64 = 120;

/// Runs `op`, remediating one transient failure.
///
/// - `TokenExpired`: refresh the provider's token, then retry once.
/// - `RateLimited` with a hint up to [`MAX_INLINE_WAIT_SECS`]: wait, then
///   retry once.
///
/// Anything else, including a second failure, goes to the caller.
pub async fn with_remediation<T, F, Fut>(provider: &dyn EmailProvider, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match op().await {
        Err(ProviderError::TokenExpired) => {
            info!(provider = %provider.kind(), "Access token expired, refreshing");
            provider.refresh_token().await?;
            op().await
        }
        Err(ProviderError::RateLimited {
            retry_after_secs: Some(wait),
        }) if wait <= MAX_INLINE_WAIT_SECS => {
            warn!(provider = %provider.kind(), wait_secs = wait, "Rate limited, waiting once");
            tokio::time::sleep(Duration::from_secs(wait)).await;
            op().await
        }
        other => other,
    }
}

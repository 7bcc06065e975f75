//! Optimistic-concurrency config writes.

use serde_json::Value;

use crate::traits::{ConfigSnapshot, Gateway, GatewayError};

/// Read the current config hash and apply `patch` against it, re-reading
/// and retrying on a stale hash up to `attempts` times in total.
///
/// # Errors
/// Returns the last [`GatewayError::Conflict`] once attempts run out, or
/// the first non-conflict error immediately.
pub async fn patch_config_with_retry(
    gateway: &dyn Gateway,
    patch: &Value,
    attempts: usize,
) -> Result<ConfigSnapshot, GatewayError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        let current = gateway.get_config().await?;
        match gateway.patch_config(patch, &current.hash).await {
            Ok(updated) => return Ok(updated),
            Err(GatewayError::Conflict { base_hash }) if attempt < attempts => {
                tracing::warn!(attempt, %base_hash, "config hash stale, re-reading");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

//! HTTP collateral fetching with retries and an on-disk cache.

use std::time::Duration;

use async_std::{fs, task};
use bytes::Bytes;
use log::{debug, warn};

use crate::common::cache::cache_file_path;
use crate::common::file::write_bytes_atomic;
use crate::error::{self, Result};

/// How often and how patiently a fetch is retried.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u8,
    pub sleep: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u8, sleep_ms: u64) -> Self {
        Self { attempts, sleep: Duration::from_millis(sleep_ms) }
    }
}

/// GETs `url`, retrying transport failures and non-success statuses. The last
/// failure is returned once attempts are exhausted.
pub async fn fetch_url(url: &str, policy: &RetryPolicy) -> Result<Bytes> {
    let mut last_err = error::fetch(format!("no attempts made for {}", url), None);

    for attempt in 1..=policy.attempts {
        match reqwest::get(url).await {
            Ok(response) if response.status().is_success() => {
                return response.bytes().await
                    .map_err(|e| error::fetch(e, Some(format!("failed to read bytes during fetch: {}", url))));
            }
            Ok(response) => {
                debug!("fetch {} of {} for '{}' returned {}", attempt, policy.attempts, url, response.status());
                last_err = error::fetch(format!("status: {}", response.status()),
                                        Some(format!("failed to fetch URL '{}'", url)));
            }
            Err(err) => {
                warn!("fetch {} of {} for '{}' failed: {:?}", attempt, policy.attempts, url, err);
                last_err = error::fetch(err, Some(format!("failed to fetch URL '{}'", url)));
            }
        }

        if attempt < policy.attempts {
            task::sleep(policy.sleep).await;
        }
    }

    Err(last_err)
}

/// Like [`fetch_url`], but served from `path` under the cache root when present.
/// Fresh downloads are written to the cache before returning.
pub async fn fetch_url_cached(url: &str, path: &str, policy: &RetryPolicy) -> Result<Bytes> {
    let full_path = cache_file_path(path, true).await?;

    if full_path.exists().await {
        let cached = fs::read(&full_path).await
            .map_err(|e| error::io(e, Some(format!("failed to read cached file: {}", full_path.display()))))?;
        return Ok(Bytes::from(cached));
    }

    let body = fetch_url(url, policy).await?;
    write_bytes_atomic(full_path.as_path(), &body).await?;

    Ok(body)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::RetryPolicy;

    #[test]
    fn retry_policy() {
        let policy = RetryPolicy::new(3, 250);

        assert_eq!(policy.attempts, 3);
        assert_eq!(policy.sleep, Duration::from_millis(250));
    }
}

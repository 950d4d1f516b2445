use std::time::Duration;

use bytes::Bytes;
use reqwest::StatusCode;
use tracing::{debug, error, warn};
use url::Url;

use crate::client::{ArchiveClient, ArchiveError};

/// Retry policy for [`ArchiveClient::fetch`].
///
/// The first two tries run back to back; try `n` (zero based, `n >= 2`)
/// waits `step * n` first. `courtesy_delay` is slept after every successful
/// fetch to keep request rates polite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPolicy {
    pub attempts: u32,
    pub step: Duration,
    pub courtesy_delay: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            attempts: 20,
            step: Duration::from_secs(20),
            courtesy_delay: Duration::from_secs(1),
        }
    }
}

impl FetchPolicy {
    /// No waiting at all; used by tests and dry runs.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            step: Duration::ZERO,
            courtesy_delay: Duration::ZERO,
        }
    }

    pub fn delay_before(&self, try_index: u32) -> Duration {
        if try_index > 1 {
            self.step.saturating_mul(try_index)
        } else {
            Duration::ZERO
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    pub expect_status: StatusCode,
    pub minimum_size: Option<usize>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            expect_status: StatusCode::OK,
            minimum_size: None,
        }
    }
}

impl ArchiveClient {
    /// GET `url` with bounded retries.
    ///
    /// Transport errors, unexpected statuses and undersized bodies are
    /// retried. A 404 is returned at once as [`ArchiveError::NotFound`].
    pub async fn fetch(&self, url: Url, options: &FetchOptions) -> Result<Bytes, ArchiveError> {
        let policy = self.policy;
        let mut last = None;
        for try_index in 0..policy.attempts {
            let delay = policy.delay_before(try_index);
            if !delay.is_zero() {
                debug!(%url, delay_secs = delay.as_secs(), "backing off before refetch");
                tokio::time::sleep(delay).await;
            }
            debug!(%url, attempt = try_index + 1, "fetch");

            let response = match self.http.get(url.clone()).send().await {
                Ok(response) => response,
                Err(err) => {
                    warn!(%url, error = %err, "fetch transport error");
                    last = Some(ArchiveError::Request(err));
                    continue;
                }
            };
            let status = response.status();
            if status == StatusCode::NOT_FOUND {
                error!(%url, "fetch got 404");
                return Err(ArchiveError::NotFound {
                    url: url.to_string(),
                });
            }
            if status != options.expect_status {
                warn!(
                    %url,
                    expected = %options.expect_status,
                    %status,
                    "status code mismatch"
                );
                last = Some(ArchiveError::Status {
                    status,
                    url: url.to_string(),
                });
                continue;
            }
            let body = match response.bytes().await {
                Ok(body) => body,
                Err(err) => {
                    warn!(%url, error = %err, "failed reading response body");
                    last = Some(ArchiveError::Request(err));
                    continue;
                }
            };
            if let Some(minimum) = options.minimum_size
                && body.len() < minimum
            {
                warn!(%url, size = body.len(), minimum, "response body too small");
                last = Some(ArchiveError::TooSmall {
                    url: url.to_string(),
                    size: body.len(),
                    minimum,
                });
                continue;
            }

            if !policy.courtesy_delay.is_zero() {
                tokio::time::sleep(policy.courtesy_delay).await;
            }
            return Ok(body);
        }

        error!(%url, attempts = policy.attempts, "fetch giving up");
        Err(ArchiveError::GaveUp {
            url: url.to_string(),
            attempts: policy.attempts,
            last: last.map(Box::new),
        })
    }
}

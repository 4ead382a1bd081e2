// Copyright (C) 2024 Quickwit, Inc.
//
// Quickwit is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@quickwit.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

use std::fmt::Debug;
use std::time::Duration;

use futures::Future;
use rand::Rng;
use tracing::{debug, warn};

use crate::metrics::TRANSFER_PERF_COUNTERS;

const DEFAULT_MAX_ATTEMPTS: usize = 10;
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(if cfg!(test) { 1 } else { 1_000 });
const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(if cfg!(test) { 256 } else { 256_000 });

/// Classification of a failed outcome.
///
/// `retry_after` carries the service-supplied throttling deadline when the
/// failure came with a `Retry-After` header; it takes precedence over the
/// exponential backoff schedule.
pub trait Retryable {
    fn is_retryable(&self) -> bool {
        false
    }

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct RetryParams {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Total number of requests, first try inclusive: `max_attempts == 10`
    /// means up to 10 HTTP requests before the last error surfaces.
    pub max_attempts: usize,
}

impl Default for RetryParams {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryParams {
    pub fn with_max_attempts(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Sleep duration before retry attempt `attempt_count` (1-based),
    /// jitter excluded: `min(base_delay * 2^(i-1), max_delay)`.
    pub fn backoff_delay(&self, attempt_count: usize) -> Duration {
        let exponent = (attempt_count.saturating_sub(1)).min(31) as u32;
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Uniform jitter in `[0, 1)` units of the base delay. With the default
/// 1 s base this is the `U[0,1)` seconds added to every sleep.
fn jitter(params: &RetryParams) -> Duration {
    params.base_delay.mul_f64(rand::thread_rng().gen::<f64>())
}

/// Runs `f` until it succeeds, its error stops being retryable, or
/// `max_attempts` requests have been issued. Waits dictated by a
/// `Retry-After` hint and plain backoff waits are recorded separately in
/// the global transfer perf counters.
pub async fn retry<F, U, E, Fut>(retry_params: &RetryParams, f: F) -> Result<U, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<U, E>>,
    E: Retryable + Debug + 'static,
{
    let mut attempt_count = 0;

    loop {
        let response = f().await;

        attempt_count += 1;

        match response {
            Ok(response) => {
                return Ok(response);
            }
            Err(error) => {
                if !error.is_retryable() {
                    return Err(error);
                }
                if attempt_count >= retry_params.max_attempts {
                    warn!(
                        attempt_count = %attempt_count,
                        error = ?error,
                        "Request failed, retries exhausted"
                    );
                    return Err(error);
                }

                let delay = match error.retry_after() {
                    Some(hint) => {
                        let delay = hint + jitter(retry_params);
                        TRANSFER_PERF_COUNTERS.add_throttled_wait(delay);
                        delay
                    }
                    None => {
                        let delay = retry_params.backoff_delay(attempt_count) + jitter(retry_params);
                        TRANSFER_PERF_COUNTERS.add_timeout_wait(delay);
                        delay
                    }
                };
                debug!(
                    attempt_count = %attempt_count,
                    delay_ms = %delay.as_millis(),
                    error = ?error,
                    "Request failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

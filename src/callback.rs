//! Retrying callback client for reporting results to the control plane.
//!
//! Each attempt is authenticated with a freshly minted internal token, since
//! tokens are time-bound. Delivery is best-effort: failures are logged and
//! surfaced as `false`, never as an error.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::auth::generate_internal_token;
use crate::clock::{exponential_delay, Sleeper, TokioSleeper};

/// Retry policy for callback delivery.
#[derive(Debug, Clone)]
pub struct CallbackConfig {
    /// Total number of POST attempts.
    pub max_retries: u32,
    /// Delay before attempt `n + 1` is `backoff_base ^ n` seconds.
    pub backoff_base: f64,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: 2.0,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Delivers JSON payloads with bounded retries and exponential backoff.
#[derive(Clone)]
pub struct CallbackRetrier {
    http: Client,
    config: CallbackConfig,
    sleeper: Arc<dyn Sleeper>,
}

impl CallbackRetrier {
    pub fn new(config: CallbackConfig) -> Self {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to build callback HTTP client, using defaults");
                Client::new()
            });
        Self {
            http,
            config,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Replace the sleeper used between attempts.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn config(&self) -> &CallbackConfig {
        &self.config
    }

    /// POST `payload` to `url`, retrying on any failure.
    ///
    /// Returns `true` once a 2xx response is received, `false` after all
    /// attempts fail.
    pub async fn deliver<T: Serialize + ?Sized>(
        &self,
        url: &str,
        payload: &T,
        secret: &str,
    ) -> bool {
        let max_retries = self.config.max_retries;

        for attempt in 1..=max_retries {
            let token = generate_internal_token(secret);
            debug!(callback_url = %url, attempt, "Posting callback");

            let result = self
                .http
                .post(url)
                .header("Authorization", format!("Bearer {token}"))
                .json(payload)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    info!(callback_url = %url, attempt, "Callback delivered");
                    return true;
                }
                Ok(response) => {
                    warn!(
                        callback_url = %url,
                        attempt,
                        max_retries,
                        status = %response.status(),
                        "Callback rejected"
                    );
                }
                Err(e) => {
                    warn!(
                        callback_url = %url,
                        attempt,
                        max_retries,
                        error = %e,
                        "Callback request failed"
                    );
                }
            }

            if attempt < max_retries {
                let delay = exponential_delay(self.config.backoff_base, attempt);
                self.sleeper.sleep(delay).await;
            }
        }

        error!(
            callback_url = %url,
            attempts = max_retries,
            "Callback delivery failed after all retries"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let config = CallbackConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.backoff_base, 2.0);
    }

    #[test]
    fn test_backoff_delays_increase() {
        let config = CallbackConfig::default();
        let delays: Vec<_> = (1..config.max_retries)
            .map(|n| exponential_delay(config.backoff_base, n))
            .collect();
        assert_eq!(delays, vec![Duration::from_secs(2), Duration::from_secs(4)]);
    }
}

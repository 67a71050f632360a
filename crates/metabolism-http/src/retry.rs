//! Retry policy implementation with exponential backoff

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::env_var;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (5 retries = 6 attempts)
    pub max_retries: u32,

    /// Delay before the first retry
    pub initial_backoff: Duration,

    /// Upper bound for any single delay
    pub max_backoff: Duration,

    /// Backoff multiplier
    pub multiplier: f64,

    /// Add up to 30% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Create retry policy from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            max_retries: env_var("METABOLISM_MAX_RETRIES").unwrap_or(defaults.max_retries),
            initial_backoff: env_var("METABOLISM_RETRY_BACKOFF_MS")
                .map_or(defaults.initial_backoff, Duration::from_millis),
            max_backoff: env_var("METABOLISM_MAX_BACKOFF_MS")
                .map_or(defaults.max_backoff, Duration::from_millis),
            multiplier: env_var("METABOLISM_BACKOFF_MULTIPLIER").unwrap_or(defaults.multiplier),
            jitter: env_var("METABOLISM_RETRY_JITTER").unwrap_or(defaults.jitter),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "backoff multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (0-based): `initial × multiplier^attempt`, capped
    #[allow(clippy::cast_possible_wrap)]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(64) as i32);
        let secs = (self.initial_backoff.as_secs_f64() * factor).min(self.max_backoff.as_secs_f64());
        let mut delay = Duration::try_from_secs_f64(secs).unwrap_or(self.max_backoff);

        if self.jitter {
            delay += delay.mul_f64(rand::random::<f64>() * 0.3);
        }

        delay
    }

    /// Total attempts this policy allows
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Execute a function with retry logic
    ///
    /// Non-retryable errors are returned unchanged. Once the retry ceiling is
    /// reached the last error is wrapped in [`Error::FetchFailed`].
    pub async fn execute<F, Fut, T>(&self, what: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            match f().await {
                Ok(result) => return Ok(result),
                Err(e) if !e.should_retry() => return Err(e),
                Err(e) if attempt >= self.max_retries => {
                    return Err(Error::FetchFailed {
                        what: what.to_string(),
                        attempts: attempt + 1,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = self.backoff(attempt);
                    attempt += 1;
                    warn!(
                        "Attempt {attempt} for '{what}' failed: {e}; retrying in {:.1}s",
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(
    unsafe_code,
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::significant_drop_tightening
)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: false,
        }
    }

    fn server_error() -> Error {
        Error::ServerError {
            url: "https://example.com".to_string(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.max_attempts(), 6);
        assert_eq!(policy.initial_backoff, Duration::from_secs(1));
        assert!((policy.multiplier - 2.0).abs() < f64::EPSILON);
        assert!(!policy.jitter);
    }

    #[test]
    fn test_from_env() {
        const VARS: [&str; 5] = [
            "METABOLISM_MAX_RETRIES",
            "METABOLISM_RETRY_BACKOFF_MS",
            "METABOLISM_MAX_BACKOFF_MS",
            "METABOLISM_BACKOFF_MULTIPLIER",
            "METABOLISM_RETRY_JITTER",
        ];

        for var in VARS {
            unsafe {
                std::env::remove_var(var);
            }
        }

        let policy = RetryPolicy::from_env();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.initial_backoff, Duration::from_secs(1));

        unsafe {
            std::env::set_var("METABOLISM_MAX_RETRIES", "2");
            std::env::set_var("METABOLISM_RETRY_BACKOFF_MS", "250");
            std::env::set_var("METABOLISM_MAX_BACKOFF_MS", "4000");
            std::env::set_var("METABOLISM_BACKOFF_MULTIPLIER", "1.5");
            std::env::set_var("METABOLISM_RETRY_JITTER", "true");
        }

        let policy = RetryPolicy::from_env();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.initial_backoff, Duration::from_millis(250));
        assert_eq!(policy.max_backoff, Duration::from_millis(4000));
        assert!((policy.multiplier - 1.5).abs() < f64::EPSILON);
        assert!(policy.jitter);

        for var in VARS {
            unsafe {
                std::env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(3),
            ..RetryPolicy::default()
        };

        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(3));
        assert_eq!(policy.backoff(1000), Duration::from_secs(3));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::default().with_jitter(true);
        for _ in 0..50 {
            let delay = policy.backoff(1);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_millis(2600));
        }
    }

    #[test]
    fn test_validate_multiplier() {
        let policy = RetryPolicy {
            multiplier: 0.5,
            ..RetryPolicy::default()
        };
        assert!(policy.validate().is_err());
        assert!(RetryPolicy::default().validate().is_ok());
    }

    #[tokio::test]
    async fn test_execute_success_on_first_try() {
        let calls = Arc::new(Mutex::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = fast_policy(3)
            .execute("test", || async {
                *calls_clone.lock().unwrap() += 1;
                Ok::<_, Error>(42)
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_execute_retry_on_retryable_error() {
        let calls = Arc::new(Mutex::new(0));
        let calls_clone = Arc::clone(&calls);

        let start = Instant::now();
        let result = fast_policy(3)
            .execute("test", || async {
                let mut count = calls_clone.lock().unwrap();
                *count += 1;
                if *count < 3 { Err(server_error()) } else { Ok(42) }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(*calls.lock().unwrap(), 3);
        // 1ms + 2ms of backoff
        assert!(start.elapsed() >= Duration::from_millis(3));
    }

    #[tokio::test]
    async fn test_execute_fail_on_non_retryable_error() {
        let calls = Arc::new(Mutex::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = fast_policy(3)
            .execute("test", || async {
                *calls_clone.lock().unwrap() += 1;
                Err::<i32, _>(Error::unexpected_status(
                    "https://example.com",
                    StatusCode::NOT_FOUND,
                ))
            })
            .await;

        assert!(matches!(
            result.expect_err("should fail"),
            Error::UnexpectedStatus { .. }
        ));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_execute_exceed_max_retries() {
        let calls = Arc::new(Mutex::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = fast_policy(2)
            .execute("https://example.com", || async {
                *calls_clone.lock().unwrap() += 1;
                Err::<i32, _>(server_error())
            })
            .await;

        match result.expect_err("should fail") {
            Error::FetchFailed {
                what,
                attempts,
                source,
            } => {
                assert_eq!(what, "https://example.com");
                assert_eq!(attempts, 3);
                assert!(matches!(*source, Error::ServerError { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_backoff_progression() {
        let policy = RetryPolicy {
            max_retries: 4,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            multiplier: 2.0,
            jitter: false,
        };

        let calls = Arc::new(Mutex::new(0));
        let calls_clone = Arc::clone(&calls);
        let start = Instant::now();

        let _ = policy
            .execute("test", || async {
                *calls_clone.lock().unwrap() += 1;
                Err::<i32, _>(server_error())
            })
            .await;

        // 10 + 20 + 40 + 50 (capped)
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(120));
        assert_eq!(*calls.lock().unwrap(), 5);
    }
}

//! Outbound alerting
//!
//! Plugins deliver one message per attempt; retry, timeout and counting
//! live in the provided [`NotificationPlugin::send_notification`].

pub mod dispatcher;
pub mod plugins;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::NotificationConfig;
use crate::error::{Error, Result};

pub use dispatcher::{DeliveryReceipt, NotificationDispatcher};
pub use plugins::{DiscordPlugin, TelegramPlugin};

#[derive(Debug, Default)]
pub struct PluginStats {
    success: AtomicU64,
    failure: AtomicU64,
}

impl PluginStats {
    pub fn success(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    pub fn failure(&self) -> u64 {
        self.failure.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PluginSnapshot {
        PluginSnapshot {
            success: self.success(),
            failure: self.failure(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct PluginSnapshot {
    pub success: u64,
    pub failure: u64,
}

/// Attempt budget and pacing for one delivery
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &NotificationConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            attempt_timeout: Duration::from_secs(config.attempt_timeout_secs),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&NotificationConfig::default())
    }
}

/// base, 2*base, 3*base ... until the attempt budget is spent
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    base: Duration,
    max_attempts: u32,
    failed: u32,
}

impl LinearBackoff {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            base: policy.base_delay,
            max_attempts: policy.max_attempts,
            failed: 0,
        }
    }
}

impl Backoff for LinearBackoff {
    fn reset(&mut self) {
        self.failed = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.failed += 1;
        if self.failed >= self.max_attempts {
            return None;
        }
        Some(self.base * self.failed)
    }
}

#[async_trait]
pub trait NotificationPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn stats(&self) -> &PluginStats;

    /// One delivery attempt
    async fn deliver(&self, message: &str) -> Result<()>;

    /// Deliver with retry; success and failure are each counted once per call.
    /// A non-retryable error ends the call without further attempts.
    async fn send_notification(&self, message: &str, policy: &RetryPolicy) -> bool {
        let attempts = AtomicU64::new(0);
        let result = backoff::future::retry(LinearBackoff::new(policy), || async {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            let outcome = match tokio::time::timeout(policy.attempt_timeout, self.deliver(message)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::NotificationTimeout(policy.attempt_timeout.as_millis() as u64)),
            };
            outcome.map_err(|e| {
                warn!(
                    plugin = self.name(),
                    "Notification attempt {}/{} failed: {}",
                    attempt,
                    policy.max_attempts,
                    e
                );
                if e.is_retryable() {
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await;

        match result {
            Ok(()) => {
                self.stats().success.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.stats().failure.fetch_add(1, Ordering::Relaxed);
                info!(plugin = self.name(), "Notification gave up: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Fails the first `failures` attempts, then succeeds
    pub struct FlakyPlugin {
        pub name: String,
        pub failures: u64,
        pub attempts: AtomicU64,
        pub delay: Option<Duration>,
        /// Fail with a non-retryable error carrying this reason
        pub rejection: Option<String>,
        pub delivered: Mutex<Vec<String>>,
        pub stats: PluginStats,
    }

    impl FlakyPlugin {
        pub fn new(name: &str, failures: u64) -> Self {
            Self {
                name: name.to_string(),
                failures,
                attempts: AtomicU64::new(0),
                delay: None,
                rejection: None,
                delivered: Mutex::new(Vec::new()),
                stats: PluginStats::default(),
            }
        }
    }

    #[async_trait]
    impl NotificationPlugin for FlakyPlugin {
        fn name(&self) -> &str {
            &self.name
        }

        fn stats(&self) -> &PluginStats {
            &self.stats
        }

        async fn deliver(&self, message: &str) -> Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if attempt <= self.failures {
                return Err(self
                    .rejection
                    .as_ref()
                    .map(|reason| Error::Serialization(reason.clone()))
                    .unwrap_or_else(|| Error::Notification(format!("attempt {attempt} refused"))));
            }
            self.delivered.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    pub fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            attempt_timeout: Duration::from_millis(200),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_linear_backoff_schedule() {
        let policy = RetryPolicy::default();
        let mut backoff = LinearBackoff::new(&policy);
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_backoff(), None);

        backoff.reset();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_all_attempts_fail_counts_one_failure() {
        let plugin = FlakyPlugin::new("flaky", u64::MAX);
        assert!(!plugin.send_notification("hello", &fast_policy()).await);
        assert_eq!(plugin.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(plugin.stats().snapshot(), PluginSnapshot { success: 0, failure: 1 });
    }

    #[tokio::test]
    async fn test_second_attempt_success() {
        let plugin = FlakyPlugin::new("flaky", 1);
        assert!(plugin.send_notification("hello", &fast_policy()).await);
        assert_eq!(plugin.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(plugin.stats().snapshot(), PluginSnapshot { success: 1, failure: 0 });
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_after_one_attempt() {
        let mut plugin = FlakyPlugin::new("broken", u64::MAX);
        plugin.rejection = Some("unencodable body".to_string());
        assert!(!plugin.send_notification("hello", &fast_policy()).await);
        assert_eq!(plugin.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(plugin.stats().snapshot(), PluginSnapshot { success: 0, failure: 1 });
    }

    #[tokio::test]
    async fn test_attempt_timeout_counts_as_failure() {
        let mut plugin = FlakyPlugin::new("slow", 0);
        plugin.delay = Some(Duration::from_millis(500));
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            attempt_timeout: Duration::from_millis(20),
        };
        assert!(!plugin.send_notification("hello", &policy).await);
        assert_eq!(plugin.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(plugin.stats().failure(), 1);
    }
}

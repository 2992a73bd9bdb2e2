//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Scheduler configuration. Immutable for the lifetime of a scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker slots, i.e. tasks executing at the same time.
    pub max_concurrent_tasks: usize,
    /// Bound on tasks waiting in the run queue.
    pub queue_capacity: usize,
    /// Budget for a task's whole action sequence when the task sets none.
    pub task_timeout: Duration,
    /// Retries per action when the action sets none.
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt.
    pub backoff_base: Duration,
    /// Upper bound for a single backoff delay.
    pub backoff_max: Duration,
    /// Random spread applied to each delay, as a fraction (0.0 = none).
    pub backoff_jitter: f64,
    /// Extra attempts for a failed store write.
    pub persist_retries: u32,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 100,
            queue_capacity: 10_000,
            task_timeout: Duration::from_secs(3600), // 1 hour
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            backoff_jitter: 0.0,
            persist_retries: 3,
            event_capacity: 1024,
        }
    }
}

impl SchedulerConfig {
    /// Build config from `ORCH_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            max_concurrent_tasks: parse(&lookup, "ORCH_MAX_CONCURRENT_TASKS")?
                .unwrap_or(defaults.max_concurrent_tasks),
            queue_capacity: parse(&lookup, "ORCH_QUEUE_CAPACITY")?
                .unwrap_or(defaults.queue_capacity),
            task_timeout: parse(&lookup, "ORCH_TASK_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.task_timeout),
            max_retries: parse(&lookup, "ORCH_MAX_RETRIES")?.unwrap_or(defaults.max_retries),
            backoff_base: parse(&lookup, "ORCH_BACKOFF_BASE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_base),
            backoff_max: parse(&lookup, "ORCH_BACKOFF_MAX_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_max),
            backoff_jitter: parse(&lookup, "ORCH_BACKOFF_JITTER")?
                .unwrap_or(defaults.backoff_jitter),
            persist_retries: parse(&lookup, "ORCH_PERSIST_RETRIES")?
                .unwrap_or(defaults.persist_retries),
            event_capacity: defaults.event_capacity,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_tasks == 0 {
            return Err(invalid("max_concurrent_tasks", "must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity", "must be at least 1"));
        }
        if self.event_capacity == 0 {
            return Err(invalid("event_capacity", "must be at least 1"));
        }
        if self.backoff_base > self.backoff_max {
            return Err(invalid(
                "backoff_base",
                "must not exceed backoff_max",
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(invalid("backoff_jitter", "must be between 0.0 and 1.0"));
        }
        Ok(())
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| invalid(key, &format!("{raw:?}: {e}"))),
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = SchedulerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.max_concurrent_tasks, 100);
        assert_eq!(config.task_timeout, Duration::from_secs(3600));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.backoff_max, Duration::from_secs(60));
    }

    #[test]
    fn reads_overrides() {
        let config = SchedulerConfig::from_lookup(lookup(&[
            ("ORCH_MAX_CONCURRENT_TASKS", "4"),
            ("ORCH_QUEUE_CAPACITY", "16"),
            ("ORCH_TASK_TIMEOUT_SECS", "30"),
            ("ORCH_MAX_RETRIES", "0"),
            ("ORCH_BACKOFF_BASE_MS", "10"),
            ("ORCH_BACKOFF_MAX_MS", "80"),
        ]))
        .unwrap();

        assert_eq!(config.max_concurrent_tasks, 4);
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.task_timeout, Duration::from_secs(30));
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.backoff_base, Duration::from_millis(10));
        assert_eq!(config.backoff_max, Duration::from_millis(80));
    }

    #[test]
    fn rejects_unparsable_value() {
        let err = SchedulerConfig::from_lookup(lookup(&[("ORCH_MAX_RETRIES", "many")]))
            .unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "ORCH_MAX_RETRIES")
        );
    }

    #[test]
    fn rejects_zero_concurrency() {
        let err = SchedulerConfig::from_lookup(lookup(&[("ORCH_MAX_CONCURRENT_TASKS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn rejects_inverted_backoff() {
        let config = SchedulerConfig {
            backoff_base: Duration::from_secs(10),
            backoff_max: Duration::from_secs(1),
            ..SchedulerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}

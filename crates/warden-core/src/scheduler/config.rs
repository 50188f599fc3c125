use std::time::Duration;

/// Scheduler-wide settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Queue name, carried on every event.
    pub name: String,
    /// Handlers running at once under the worker loop.
    pub concurrency: usize,
    /// Maximum pending tasks (queued plus waiting out a retry delay).
    pub capacity: usize,
    /// Per-attempt handler timeout.
    pub timeout: Duration,
    /// Delay before the first retry; doubles on each further failure.
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// Wait after which a queued task starts gaining priority.
    pub starvation_threshold: Duration,
    /// Priority points gained per full second waited past the threshold.
    pub aging_factor: u32,
    /// Idle wait of the worker loop between empty polls.
    pub poll_interval: Duration,
    /// Settled tasks kept per terminal list (completed, failed, cancelled).
    pub max_history: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            concurrency: 4,
            capacity: 10_000,
            timeout: Duration::from_secs(30),
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
            starvation_threshold: Duration::from_secs(30),
            aging_factor: 10,
            poll_interval: Duration::from_millis(100),
            max_history: 1_000,
        }
    }
}

impl SchedulerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration, max: Duration) -> Self {
        self.retry_delay = delay;
        self.max_retry_delay = max.max(delay);
        self
    }

    pub fn with_aging(mut self, threshold: Duration, factor: u32) -> Self {
        self.starvation_threshold = threshold;
        self.aging_factor = factor;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_history(mut self, max: usize) -> Self {
        self.max_history = max;
        self
    }

    /// Backoff after the `attempts`-th failed attempt: `retry_delay * 2^(attempts-1)`, capped.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(31);
        self.retry_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_retry_delay)
            .min(self.max_retry_delay)
    }
}

/// Per-task options for `enqueue`.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub max_attempts: u32,
    pub tags: Vec<String>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            tags: Vec::new(),
        }
    }
}

impl EnqueueOptions {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = SchedulerConfig::default()
            .with_retry_delay(Duration::from_millis(100), Duration::from_millis(1_000));
        assert_eq!(cfg.backoff(1), Duration::from_millis(100));
        assert_eq!(cfg.backoff(2), Duration::from_millis(200));
        assert_eq!(cfg.backoff(3), Duration::from_millis(400));
        assert_eq!(cfg.backoff(5), Duration::from_millis(1_000));
        assert_eq!(cfg.backoff(40), Duration::from_millis(1_000));
    }

    #[test]
    fn concurrency_is_at_least_one() {
        assert_eq!(SchedulerConfig::default().with_concurrency(0).concurrency, 1);
    }
}

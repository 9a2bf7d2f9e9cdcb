//! Deque configuration.

use std::time::Duration;

/// Configuration for opening a deque.
#[derive(Debug, Clone)]
pub struct DequeConfig {
    /// Whether to create the directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Size at which the write segment is rolled over.
    pub max_segment_size: u64,

    /// Largest payload accepted by a single offer.
    pub max_entry_size: u64,

    /// Age at which a non-empty write segment is rolled over.
    pub segment_roll_time_limit: Option<Duration>,

    /// Whether payloads are LZ4 block-compressed when that makes them smaller.
    pub compression: bool,

    /// Whether to fsync the write segment after every offer.
    pub sync_on_write: bool,
}

impl Default for DequeConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            max_segment_size: 64 * 1024 * 1024, // 64 MB
            max_entry_size: 32 * 1024 * 1024,   // 32 MB
            segment_roll_time_limit: None,
            compression: false,
            sync_on_write: false,
        }
    }
}

impl DequeConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the rollover size of a segment.
    #[must_use]
    pub const fn max_segment_size(mut self, size: u64) -> Self {
        self.max_segment_size = size;
        self
    }

    /// Sets the largest accepted payload.
    #[must_use]
    pub const fn max_entry_size(mut self, size: u64) -> Self {
        self.max_entry_size = size;
        self
    }

    /// Sets the age limit of the write segment.
    #[must_use]
    pub const fn segment_roll_time_limit(mut self, limit: Option<Duration>) -> Self {
        self.segment_roll_time_limit = limit;
        self
    }

    /// Enables or disables payload compression.
    #[must_use]
    pub const fn compression(mut self, value: bool) -> Self {
        self.compression = value;
        self
    }

    /// Sets whether to sync on every offer.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }
}

/// Configuration of a [`RetentionScheduler`](crate::RetentionScheduler).
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Number of worker threads.
    pub threads: usize,
    /// Time between enforcement passes for one deque.
    pub interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            interval: Duration::from_secs(1),
        }
    }
}

impl RetentionConfig {
    /// Sets the number of worker threads.
    #[must_use]
    pub const fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Sets the enforcement interval.
    #[must_use]
    pub const fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = DequeConfig::default();
        assert!(config.create_if_missing);
        assert!(!config.compression);
        assert!(config.segment_roll_time_limit.is_none());
        assert!(config.max_entry_size < config.max_segment_size);
    }

    #[test]
    fn builder_pattern() {
        let config = DequeConfig::new()
            .create_if_missing(false)
            .compression(true)
            .max_segment_size(4096)
            .segment_roll_time_limit(Some(Duration::from_millis(50)));

        assert!(!config.create_if_missing);
        assert!(config.compression);
        assert_eq!(config.max_segment_size, 4096);
        assert_eq!(
            config.segment_roll_time_limit,
            Some(Duration::from_millis(50))
        );
    }

    #[test]
    fn retention_config() {
        let config = RetentionConfig::default()
            .threads(2)
            .interval(Duration::from_millis(10));
        assert_eq!(config.threads, 2);
        assert_eq!(config.interval, Duration::from_millis(10));
    }
}

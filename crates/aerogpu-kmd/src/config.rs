use std::time::Duration;

use crate::error::{KmdError, KmdResult};

/// Tunables for one device instance.
///
/// Loading these from the registry is the host's job; the core only consumes a filled-in struct.
#[derive(Clone, Debug)]
pub struct KmdConfig {
    /// Ring slots; must be a power of two (the legacy ring accepts any value >= 2 but the same
    /// value is used for both ABIs).
    pub ring_entry_count: u32,
    /// Retired submissions kept for post-mortem inspection.
    pub retired_max_count: usize,
    pub retired_max_bytes: usize,
    pub pool: PoolConfig,
    /// Interval between completed-fence polls in a blocking idle wait.
    pub idle_poll_interval: Duration,
    /// Attempts at a torn-free hi/lo/hi 64-bit register read before giving up.
    pub fence_read_retries: u32,
    /// Error interrupts that are always reported; after this only power-of-two counts are.
    pub error_notify_burst: u64,
    pub submission_log_len: usize,
    pub deferred_queue_len: usize,
    /// Use the shared fence page when the device advertises it.
    pub prefer_fence_page: bool,
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub page_size: usize,
    /// Largest pooled allocation, in pages. Bigger requests bypass the pool.
    pub max_class_pages: usize,
    pub max_entries_per_class: usize,
    pub max_retained_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            max_class_pages: 16,
            max_entries_per_class: 8,
            max_retained_bytes: 2 * 1024 * 1024,
        }
    }
}

impl Default for KmdConfig {
    fn default() -> Self {
        Self {
            ring_entry_count: 256,
            retired_max_count: 64,
            retired_max_bytes: 4 * 1024 * 1024,
            pool: PoolConfig::default(),
            idle_poll_interval: Duration::from_millis(1),
            fence_read_retries: 3,
            error_notify_burst: 3,
            submission_log_len: 64,
            deferred_queue_len: 64,
            prefer_fence_page: true,
        }
    }
}

impl KmdConfig {
    pub fn validate(&self) -> KmdResult<()> {
        if self.ring_entry_count < 2 || !self.ring_entry_count.is_power_of_two() {
            return Err(KmdError::InvalidParameter(
                "ring_entry_count must be a power of two >= 2",
            ));
        }
        if self.pool.page_size == 0 || !self.pool.page_size.is_power_of_two() {
            return Err(KmdError::InvalidParameter(
                "pool page_size must be a non-zero power of two",
            ));
        }
        if self.fence_read_retries == 0 {
            return Err(KmdError::InvalidParameter(
                "fence_read_retries must be non-zero",
            ));
        }
        if self.idle_poll_interval.is_zero() {
            return Err(KmdError::InvalidParameter(
                "idle_poll_interval must be non-zero",
            ));
        }
        if self.deferred_queue_len == 0 {
            return Err(KmdError::InvalidParameter(
                "deferred_queue_len must be non-zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        KmdConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_non_power_of_two_ring() {
        for count in [0, 1, 3, 100] {
            let cfg = KmdConfig {
                ring_entry_count: count,
                ..KmdConfig::default()
            };
            assert!(
                matches!(cfg.validate(), Err(KmdError::InvalidParameter(_))),
                "entry_count={count}"
            );
        }
    }

    #[test]
    fn rejects_zero_poll_interval_and_retries() {
        let cfg = KmdConfig {
            idle_poll_interval: Duration::ZERO,
            ..KmdConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = KmdConfig {
            fence_read_retries: 0,
            ..KmdConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}

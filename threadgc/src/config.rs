use std::{env, time::Duration};

use crate::OS_PAGE_SIZE;

/// Upper bound on parallel marker helper threads.
pub const MAX_MARKERS: usize = 16;

/// Default capacity of the implicit discovery slot array.
pub const MAX_THREADS: usize = 512;

/// How threads become known to the collector, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryKind {
    /// Threads register under the global lock into the hashed store.
    #[default]
    Explicit,
    /// Threads claim a slot of a fixed array without the lock.
    Implicit,
}

/// Configuration of the thread registry, the suspend coordinator and the
/// allocation caches.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub discovery: DiscoveryKind,
    /// Number of hash buckets of the explicit store. Power of two.
    pub table_buckets: usize,
    /// Capacity of the implicit slot array.
    pub implicit_slots: usize,
    /// Attempts per thread before a failed suspend becomes fatal.
    pub suspend_retry_limit: u32,
    /// Granules a size class must see on the global path before the
    /// thread switches it to a local free list.
    pub direct_granules: usize,
    /// Bytes mapped at once when a size class runs dry.
    pub chunk_bytes: usize,
    /// Parallel marker helpers, 0 disables parallel marking.
    pub markers: usize,
    /// How long a cooperative suspend waits for the target to park.
    pub ack_timeout: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            discovery: DiscoveryKind::Explicit,
            table_buckets: 256,
            implicit_slots: MAX_THREADS,
            suspend_retry_limit: 1_000_000,
            direct_granules: 256,
            chunk_bytes: 65_536, // 64 KB
            markers: 0,
            ack_timeout: Duration::from_millis(1),
        }
    }
}

impl CollectorConfig {
    /// Defaults overridden by `GC_MARKERS` and `GC_RETRY_LIMIT`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(markers) = read_env::<usize>("GC_MARKERS") {
            config.markers = markers.min(MAX_MARKERS);
        }
        if let Some(limit) = read_env::<u32>("GC_RETRY_LIMIT") {
            config.suspend_retry_limit = limit;
        }
        config
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.table_buckets == 0 || !self.table_buckets.is_power_of_two() {
            return Err("table_buckets must be a power of two");
        }
        if self.discovery == DiscoveryKind::Implicit && self.implicit_slots == 0 {
            return Err("implicit_slots must be > 0");
        }
        if self.suspend_retry_limit == 0 {
            return Err("suspend_retry_limit must be > 0");
        }
        // a counting slot may overshoot the threshold by one class
        if self.direct_granules == 0
            || self.direct_granules + crate::heap::SIZE_CLASSES + 1 >= crate::local_alloc::COUNT_LIMIT
        {
            return Err("direct_granules out of range");
        }
        if self.chunk_bytes == 0 || !self.chunk_bytes.is_multiple_of(OS_PAGE_SIZE) {
            return Err("chunk_bytes must be a multiple of the page size");
        }
        if self.chunk_bytes < crate::heap::MAX_OBJECT_BYTES {
            return Err("chunk_bytes must hold at least one object of every size class");
        }
        if self.markers > MAX_MARKERS {
            return Err("too many parallel markers");
        }
        Ok(())
    }
}

fn read_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring malformed {name}={raw:?}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(CollectorConfig::default().validate(), Ok(()));
    }

    #[test]
    fn bucket_count_must_be_power_of_two() {
        let config = CollectorConfig {
            table_buckets: 100,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn chunk_must_be_page_multiple() {
        let config = CollectorConfig {
            chunk_bytes: OS_PAGE_SIZE + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn marker_count_is_bounded() {
        let config = CollectorConfig {
            markers: MAX_MARKERS + 1,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err("too many parallel markers"));
    }
}

//! Storage engine configuration.

/// Tuning knobs for the B-tree, integrity checks and the persist schedule.
#[derive(Debug, Clone)]
pub struct Config {
    /// Node size in bytes above which a rebuilt B-tree node is split.
    pub max_node_size: usize,

    /// Length of the trailing arena window inspected by quick checks.
    pub quick_check_window: u64,

    /// Clock value installed after a full consolidation. Must be a power of
    /// two; the next `consolidation_delay` persists write small incremental
    /// generations before everything is merged again.
    pub consolidation_delay: u64,

    /// Probe limit for finger searches over packed metadata blocks.
    pub max_probe: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_node_size: 256,
            quick_check_window: 32 * 1024 * 1024, // 32 MB
            consolidation_delay: 0b100_0000,      // ~1 hour at 1 persist/minute
            max_probe: 20,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the node split threshold.
    #[must_use]
    pub const fn max_node_size(mut self, bytes: usize) -> Self {
        self.max_node_size = bytes;
        self
    }

    /// Sets the quick check window.
    #[must_use]
    pub const fn quick_check_window(mut self, bytes: u64) -> Self {
        self.quick_check_window = bytes;
        self
    }

    /// Sets the clock installed after a full consolidation.
    #[must_use]
    pub const fn consolidation_delay(mut self, clock: u64) -> Self {
        self.consolidation_delay = clock;
        self
    }

    /// Sets the probe limit for packed block searches.
    #[must_use]
    pub const fn max_probe(mut self, probes: usize) -> Self {
        self.max_probe = probes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.max_node_size, 256);
        assert_eq!(config.consolidation_delay, 64);
        assert_eq!(config.max_probe, 20);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .max_node_size(64)
            .quick_check_window(4096)
            .consolidation_delay(8);

        assert_eq!(config.max_node_size, 64);
        assert_eq!(config.quick_check_window, 4096);
        assert_eq!(config.consolidation_delay, 8);
    }
}

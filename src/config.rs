use std::time::Duration;
use anyhow::bail;
use rustc_hash::FxHashMap;

pub struct MadConfig {
    /// Initial number of unacknowledged RMPP segments a receiver grants a
    ///  sender before the first ACK.
    pub rmpp_initial_window: u32,

    /// Number of additional segments granted with each window-exhaustion ACK.
    pub rmpp_window_growth: u32,

    /// How often receive-side reassembly state is swept for inactivity. A
    ///  transfer that sees no traffic for two consecutive sweeps is dropped.
    pub reassembly_sweep_interval: Duration,

    /// Upper bound on how long deregistration waits for outstanding hardware
    ///  completions to drain before giving up on them.
    pub teardown_timeout: Duration,
    pub teardown_poll_interval: Duration,

    /// This is the number of buffers that will be pooled at a given time -
    ///  buffers in excess of this number are discarded when they are returned.
    pub buffer_pool_size: usize,

    pub default_class_config: MadClassConfig,
    pub specific_class_configs: FxHashMap<u8, MadClassConfig>,
}

impl MadConfig {
    pub fn default_config() -> MadConfig {
        MadConfig {
            rmpp_initial_window: 8,
            rmpp_window_growth: 8,
            reassembly_sweep_interval: Duration::from_secs(10),
            teardown_timeout: Duration::from_secs(5),
            teardown_poll_interval: Duration::from_millis(10),
            buffer_pool_size: 1024,
            default_class_config: MadClassConfig {
                retries: 3,
                initial_timeout: Duration::from_millis(200),
                max_timeout: Duration::from_secs(2),
            },
            specific_class_configs: FxHashMap::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.rmpp_initial_window == 0 {
            bail!("RMPP initial window must be at least one segment");
        }
        if self.rmpp_window_growth == 0 {
            bail!("RMPP window growth must be at least one segment");
        }
        if self.reassembly_sweep_interval.is_zero() {
            bail!("reassembly sweep interval must be non-zero");
        }
        if self.teardown_poll_interval.is_zero() {
            bail!("teardown poll interval must be non-zero");
        }
        for (class, config) in std::iter::once((&0u8, &self.default_class_config))
            .chain(self.specific_class_configs.iter())
        {
            if config.initial_timeout.is_zero() {
                bail!("initial timeout for class 0x{:02x} must be non-zero", class);
            }
            if config.max_timeout < config.initial_timeout {
                bail!("max timeout for class 0x{:02x} is below the initial timeout", class);
            }
        }
        Ok(())
    }

    pub fn get_effective_class_config(&self, mgmt_class: u8) -> &MadClassConfig {
        self.specific_class_configs.get(&mgmt_class)
            .unwrap_or(&self.default_class_config)
    }
}

/// Retry behavior for transactions of a given management class.
#[derive(Clone)]
pub struct MadClassConfig {
    /// Number of *re*-transmissions after the initial attempt.
    pub retries: u32,
    pub initial_timeout: Duration,
    /// Cap for the exponentially growing per-retry timeout.
    pub max_timeout: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn test_default_config_is_valid() {
        assert!(MadConfig::default_config().validate().is_ok());
    }

    #[rstest]
    fn test_validate_rejects_zero_window() {
        let mut config = MadConfig::default_config();
        config.rmpp_initial_window = 0;
        assert!(config.validate().is_err());
    }

    #[rstest]
    fn test_validate_rejects_inverted_timeouts() {
        let mut config = MadConfig::default_config();
        config.specific_class_configs.insert(0x04, MadClassConfig {
            retries: 1,
            initial_timeout: Duration::from_secs(2),
            max_timeout: Duration::from_secs(1),
        });
        assert!(config.validate().is_err());
    }

    #[rstest]
    fn test_effective_class_config() {
        let mut config = MadConfig::default_config();
        config.specific_class_configs.insert(0x04, MadClassConfig {
            retries: 7,
            initial_timeout: Duration::from_millis(50),
            max_timeout: Duration::from_secs(1),
        });

        assert_eq!(config.get_effective_class_config(0x04).retries, 7);
        assert_eq!(config.get_effective_class_config(0x01).retries,
                   config.default_class_config.retries);
    }
}

use std::time::Duration;

use crate::error::{Result, TreeError};
use crate::storage::record::MAX_INLINE_VALUE_SIZE;

#[derive(Debug, Clone)]
pub struct Config {
    /// Records per page.
    pub page_size: u16,
    /// Bytes per record.
    pub record_size: u16,
    /// Values up to this many bytes are stored inline in their parent record.
    /// Hard-capped by the 6-bit inline length field.
    pub max_inline_value_size: u16,
    /// Expiry for granted locks and bound on pending lock waits.
    pub lock_timeout: Duration,
    /// Node address cache capacity (entries).
    pub cache_capacity: usize,
    /// Idle expiry of cached node addresses.
    pub cache_timeout: Duration,
    /// Memory-map the file for reads.
    pub use_mmap: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: 1024,
            record_size: 128,
            max_inline_value_size: 50,
            lock_timeout: Duration::from_secs(120),
            cache_capacity: 10_000,
            cache_timeout: Duration::from_secs(60),
            use_mmap: true,
        }
    }
}

impl Config {
    /// Small records and pages; suited to many tiny nodes on slow storage.
    pub fn compact() -> Self {
        Self {
            page_size: 256,
            record_size: 32,
            max_inline_value_size: 16,
            ..Self::default()
        }
    }

    /// Larger records for fewer, bigger nodes.
    pub fn large_records() -> Self {
        Self {
            page_size: 512,
            record_size: 1024,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.record_size < 32 {
            return Err(TreeError::InvalidArgument(
                "record size must be at least 32 bytes".into(),
            ));
        }
        if self.page_size == 0 {
            return Err(TreeError::InvalidArgument(
                "page size must be at least 1 record".into(),
            ));
        }
        if self.max_inline_value_size < 4
            || self.max_inline_value_size as usize > MAX_INLINE_VALUE_SIZE
        {
            return Err(TreeError::InvalidArgument(format!(
                "max inline value size must be 4..={MAX_INLINE_VALUE_SIZE}"
            )));
        }
        if self.lock_timeout.is_zero() {
            return Err(TreeError::InvalidArgument(
                "lock timeout must be non-zero".into(),
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
        Config::default().validate().expect("valid");
        Config::compact().validate().expect("valid");
        Config::large_records().validate().expect("valid");
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let mut config = Config::default();
        config.record_size = 16;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.max_inline_value_size = 100;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.page_size = 0;
        assert!(config.validate().is_err());
    }
}

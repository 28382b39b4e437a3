//! Per-snapshot configuration loaded from `config.toml`

use serde::{Deserialize, Serialize};

use std::time::Duration;

use crate::addrs::VirtAddr;

/// Configuration for how a snapshot is fuzzed.
///
/// Every field has a default so an empty or missing `config.toml` still
/// yields a usable configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Guest virtual address the testcase is written to before each run
    #[serde(default)]
    pub input_addr: Option<VirtAddr>,

    /// Guest virtual address the testcase length is written to as a `u64`,
    /// if the target expects one
    #[serde(default)]
    pub input_len_addr: Option<VirtAddr>,

    /// Guest virtual addresses that signal the end of a successful run.
    /// Hardware backends patch these with breakpoints.
    #[serde(default)]
    pub reset_addresses: Vec<VirtAddr>,

    /// Maximum number of input bytes written into the guest
    #[serde(default = "default_max_input_size")]
    pub max_input_size: usize,

    /// How often the fuzz loop logs statistics
    #[serde(default = "default_stats_interval")]
    pub stats_interval: Duration,
}

const fn default_max_input_size() -> usize {
    0x1000
}

const fn default_stats_interval() -> Duration {
    Duration::from_secs(2)
}

impl std::default::Default for Config {
    fn default() -> Self {
        Self {
            input_addr: None,
            input_len_addr: None,
            reset_addresses: Vec::new(),
            max_input_size: default_max_input_size(),
            stats_interval: default_stats_interval(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.input_addr.is_none());
        assert!(config.reset_addresses.is_empty());
        assert_eq!(config.max_input_size, 0x1000);
    }

    #[test]
    fn addresses_parse_from_hex_strings() {
        let config: Config = toml::from_str(
            r#"
            input_addr = "0x402000"
            input_len_addr = "0x402ff8"
            reset_addresses = ["0x400005", "0xffff800000001000"]
            max_input_size = 256
            "#,
        )
        .unwrap();

        assert_eq!(config.input_addr, Some(VirtAddr(0x402000)));
        assert_eq!(config.input_len_addr, Some(VirtAddr(0x402ff8)));
        assert_eq!(
            config.reset_addresses,
            vec![VirtAddr(0x400005), VirtAddr(0xffff_8000_0000_1000)]
        );
        assert_eq!(config.max_input_size, 256);
    }
}

use serde::{Deserialize, Serialize};

use crate::hash::H256;
use crate::header::LegacyHeader;
use crate::u256::U256;

pub const DIFFICULTY_ADJUSTMENT_INTERVAL: u64 = 2016;
pub const HEADER_SIZE_LEGACY: usize = LegacyHeader::SIZE;

/// Median time past spans the last 11 blocks.
pub const MEDIAN_TIME_SPAN: usize = 11;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

/// Consensus constants for one Bitcoin Gold network.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// First block mined under the Bitcoin Gold rules.
    pub btg_height: u64,
    /// First block retargeted with LWMA instead of Digishield.
    pub lwma_height: u64,
    /// Number of premine blocks mined at `pow_limit` right after the fork.
    pub premine_size: u64,
    pub pow_limit: U256,
    pub pow_limit_start: U256,
    pub pow_limit_legacy: U256,
    pub pow_target_spacing: u32,
    pub pow_target_timespan_legacy: i64,
    pub digi_averaging_window: u64,
    pub digi_max_adjust_down: i64,
    pub digi_max_adjust_up: i64,
    pub lwma_averaging_window: u64,
    pub lwma_adjust_weight: u64,
    /// Headers per chunk as served by the electrum protocol.
    pub chunk_size: u64,
    /// Serialized size of a post-fork header, solution included.
    pub header_size: usize,
    /// Height at which the Equihash parameters (and with them the header
    /// size) changed, for networks that hard-forked a second time.
    pub equihash_fork_height: Option<u64>,
    pub header_size_equihash: usize,
    pub equihash_n: u32,
    pub equihash_k: u32,
    pub genesis: H256,
    /// One `(hash of last block, target for the next window)` pair per
    /// fully-verified 2016-block window below the fork point.
    pub checkpoints: Vec<(H256, U256)>,
    pub testnet: bool,
    pub regtest: bool,
}

impl NetworkConfig {
    pub fn new(network: Network) -> Self {
        match network {
            Network::Mainnet => NetworkConfig {
                btg_height: 491_407,
                lwma_height: u64::MAX,
                premine_size: 8000,
                pow_limit: U256::new(0x0007_ffff_ffff_0000_0000_0000_0000_0000, 0),
                pow_limit_start: U256::new(0x0000_000f_ffff_0000_0000_0000_0000_0000, 0),
                pow_limit_legacy: U256::new(0x0000_0000_ffff_0000_0000_0000_0000_0000, 0),
                header_size: 1487,
                header_size_equihash: 1487,
                equihash_n: 200,
                equihash_k: 9,
                genesis: "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
                    .parse()
                    .expect("genesis hash"),
                testnet: false,
                regtest: false,
                ..Self::base()
            },
            Network::Testnet => NetworkConfig {
                btg_height: 1,
                lwma_height: 0,
                premine_size: 50,
                pow_limit: U256::new(0x0007_ffff_ffff_ffff_ffff_ffff_ffff_ffff, u128::MAX),
                pow_limit_start: U256::new(0x0007_ffff_ffff_ffff_ffff_ffff_ffff_ffff, u128::MAX),
                pow_limit_legacy: U256::new(0x0000_0000_ffff_ffff_ffff_ffff_ffff_ffff, u128::MAX),
                header_size: 1487,
                header_size_equihash: 1487,
                equihash_n: 200,
                equihash_k: 9,
                genesis: "00000000e0781ebe24b91eedc293adfea2f557b53ec379e78959de3853e6f9f6"
                    .parse()
                    .expect("genesis hash"),
                testnet: true,
                regtest: false,
                ..Self::base()
            },
            Network::Regtest => NetworkConfig {
                btg_height: 2000,
                lwma_height: 0,
                premine_size: 10,
                pow_limit: U256::new(0x7fff_ffff_ffff_ffff_ffff_ffff_ffff_ffff, u128::MAX),
                pow_limit_start: U256::new(0x7fff_ffff_ffff_ffff_ffff_ffff_ffff_ffff, u128::MAX),
                pow_limit_legacy: U256::new(0x7fff_ffff_ffff_ffff_ffff_ffff_ffff_ffff, u128::MAX),
                header_size: 177,
                header_size_equihash: 177,
                equihash_n: 48,
                equihash_k: 5,
                genesis: "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"
                    .parse()
                    .expect("genesis hash"),
                testnet: false,
                regtest: true,
                ..Self::base()
            },
        }
    }

    /// Constants every network shares; the per-network arms override the rest.
    fn base() -> Self {
        NetworkConfig {
            btg_height: 0,
            lwma_height: 0,
            premine_size: 0,
            pow_limit: U256::ZERO,
            pow_limit_start: U256::ZERO,
            pow_limit_legacy: U256::ZERO,
            pow_target_spacing: 600,
            pow_target_timespan_legacy: 14 * 24 * 60 * 60,
            digi_averaging_window: 30,
            digi_max_adjust_down: 32,
            digi_max_adjust_up: 16,
            lwma_averaging_window: 45,
            lwma_adjust_weight: 13_632,
            chunk_size: 252,
            header_size: 0,
            equihash_fork_height: None,
            header_size_equihash: 0,
            equihash_n: 0,
            equihash_k: 0,
            genesis: H256::ZERO,
            checkpoints: Vec::new(),
            testnet: false,
            regtest: false,
        }
    }

    #[must_use]
    pub fn is_post_btg_fork(&self, height: u64) -> bool {
        height >= self.btg_height
    }

    #[must_use]
    pub fn is_post_equihash_fork(&self, height: u64) -> bool {
        self.equihash_fork_height.is_some_and(|fork| height >= fork)
    }

    /// Serialized size of the header at `height`.
    #[must_use]
    pub fn header_size(&self, height: u64) -> usize {
        if !self.is_post_btg_fork(height) {
            HEADER_SIZE_LEGACY
        } else if self.is_post_equihash_fork(height) {
            self.header_size_equihash
        } else {
            self.header_size
        }
    }

    /// `(n, k)` for the Equihash regime in force at `height`.
    #[must_use]
    pub fn equihash_params(&self, _height: u64) -> (u32, u32) {
        (self.equihash_n, self.equihash_k)
    }

    /// Whether the target must be recomputed when verifying the header at
    /// `height`: always at an adjustment boundary, and at every height once
    /// Digishield/LWMA retarget per block.
    #[must_use]
    pub fn needs_retarget(&self, height: u64) -> bool {
        height % DIFFICULTY_ADJUSTMENT_INTERVAL == 0 || self.is_post_btg_fork(height)
    }

    #[must_use]
    pub fn averaging_window_timespan(&self) -> i64 {
        self.digi_averaging_window as i64 * i64::from(self.pow_target_spacing)
    }

    #[must_use]
    pub fn min_actual_timespan(&self) -> i64 {
        self.averaging_window_timespan() * (100 - self.digi_max_adjust_up) / 100
    }

    #[must_use]
    pub fn max_actual_timespan(&self) -> i64 {
        self.averaging_window_timespan() * (100 + self.digi_max_adjust_down) / 100
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_switches_at_fork() {
        let config = NetworkConfig::new(Network::Mainnet);
        assert_eq!(config.header_size(config.btg_height - 1), 80);
        assert_eq!(config.header_size(config.btg_height), 1487);

        let regtest = NetworkConfig::new(Network::Regtest);
        assert_eq!(regtest.header_size(2000), 177);
    }

    #[test]
    fn digishield_bounds() {
        let config = NetworkConfig::new(Network::Mainnet);
        assert_eq!(config.averaging_window_timespan(), 18_000);
        assert_eq!(config.min_actual_timespan(), 15_120);
        assert_eq!(config.max_actual_timespan(), 23_760);
    }

    #[test]
    fn retarget_heights() {
        let config = NetworkConfig::new(Network::Mainnet);
        assert!(config.needs_retarget(2016));
        assert!(!config.needs_retarget(2017));
        // Every post-fork height retargets.
        assert!(config.needs_retarget(config.btg_height + 1));
    }
}

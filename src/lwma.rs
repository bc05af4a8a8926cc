use btg_types::network::NetworkConfig;
use btg_types::utils::target_from_bits;
use btg_types::U256;

use crate::error::Error;
use crate::utils::{require_header, HeaderLookup};

// Zawy's linearly-weighted moving average, the retarget in force once
// `lwma_height` activates.
// https://github.com/zawy12/difficulty-algorithms/issues/3
pub(crate) fn get_lwma_target(
    config: &NetworkConfig,
    height: u64,
    lookup: &impl HeaderLookup,
) -> Result<U256, Error> {
    let last = require_header(lookup, height - 1)?;

    if config.regtest {
        return Ok(target_from_bits(last.bits()));
    }

    if config.testnet {
        // Special difficulty rule for testnet, as in the legacy regime but
        // easing to the post-fork limit.
        let cur = require_header(lookup, height)?;
        if i64::from(cur.time()) > i64::from(last.time()) + 2 * i64::from(config.pow_target_spacing)
        {
            return Ok(config.pow_limit);
        }
    }

    let n = config.lwma_averaging_window;
    let k = config.lwma_adjust_weight;
    assert!(height > n, "lwma window reaches below genesis");

    // Loop through the N most recent blocks; height-1 is the most recently
    // solved one.
    let mut total = U256::ZERO;
    let mut t: i64 = 0;
    let mut j: i64 = 0;
    let divisor = k * n * n;
    for i in (height - n)..height {
        let cur = require_header(lookup, i)?;
        let prev = require_header(lookup, i - 1)?;

        let solvetime = i64::from(cur.time()) - i64::from(prev.time());
        j += 1;
        t += solvetime * j;

        let (sum, overflow) =
            total.overflowing_add(target_from_bits(cur.bits()) / U256::from(divisor));
        assert!(!overflow, "weighted target sum overflowed");
        total = sum;
    }

    // Keep t reasonable in case strange solvetimes occurred.
    let floor = (n * k / 3) as i64;
    if t < floor {
        t = floor;
    }

    let (new_target, overflow) = total.overflowing_mul(t as u64);
    if overflow {
        return Ok(config.pow_limit);
    }
    Ok(new_target.min(config.pow_limit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::targeting::tests::{legacy_header, MockChain};
    use btg_types::network::Network;

    fn chain_with_spacing(bits: u32, spacing: u32) -> MockChain {
        MockChain(
            (0..100_u64)
                .map(|i| (i, legacy_header(i as u32 * spacing, bits)))
                .collect(),
        )
    }

    #[test]
    fn slower_chains_get_easier_targets() {
        let config = NetworkConfig::new(Network::Mainnet);
        let bits = 0x1d00ffff;
        let slow = get_lwma_target(&config, 100, &chain_with_spacing(bits, 1200)).unwrap();
        let steady = get_lwma_target(&config, 100, &chain_with_spacing(bits, 600)).unwrap();
        let fast = get_lwma_target(&config, 100, &chain_with_spacing(bits, 150)).unwrap();
        assert!(fast < steady);
        assert!(steady < slow);
    }

    #[test]
    fn uniform_spacing_matches_the_closed_form() {
        let config = NetworkConfig::new(Network::Mainnet);
        let bits = 0x1d00ffff;
        let spacing = 600_u64;
        let n = config.lwma_averaging_window;
        let k = config.lwma_adjust_weight;
        let target = get_lwma_target(&config, 100, &chain_with_spacing(bits, spacing as u32)).unwrap();

        // With every solvetime equal, t = spacing * n(n+1)/2 and each window
        // block contributes target / (k * n * n).
        let t = spacing * n * (n + 1) / 2;
        let per_block = target_from_bits(bits) / U256::from(k * n * n);
        let expected = per_block.overflowing_mul(n).0.overflowing_mul(t).0;
        assert_eq!(target, expected);
    }

    #[test]
    fn absurd_solvetimes_clamp_to_the_floor() {
        let config = NetworkConfig::new(Network::Mainnet);
        let bits = 0x1d00ffff;
        // Timestamps all equal: every solvetime is zero, so t hits the floor.
        let chain = MockChain(
            (0..100_u64)
                .map(|i| (i, legacy_header(1_000_000, bits)))
                .collect(),
        );
        let n = config.lwma_averaging_window;
        let k = config.lwma_adjust_weight;
        let target = get_lwma_target(&config, 100, &chain).unwrap();
        let per_block = target_from_bits(bits) / U256::from(k * n * n);
        let expected = per_block.overflowing_mul(n).0.overflowing_mul(n * k / 3).0;
        assert_eq!(target, expected);
    }

    #[test]
    fn result_is_capped_by_the_pow_limit() {
        let config = NetworkConfig::new(Network::Mainnet);
        // An easy target and day-long solvetimes push far past the limit.
        let bits = config.pow_limit.target_to_bits();
        let target = get_lwma_target(&config, 100, &chain_with_spacing(bits, 86_400)).unwrap();
        assert_eq!(target, config.pow_limit);
    }
}

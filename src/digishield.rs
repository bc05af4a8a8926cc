use btg_types::network::NetworkConfig;
use btg_types::utils::target_from_bits;
use btg_types::U256;

use crate::error::Error;
use crate::targeting::median_time_past;
use crate::utils::{require_header, HeaderLookup};

// Digishield v3, as activated after the premine ramp.
// https://github.com/BTCGPU/BTCGPU/blob/master/src/pow.cpp (DigishieldGetNextWorkRequired)
pub(crate) fn get_digishield_target(
    config: &NetworkConfig,
    height: u64,
    lookup: &impl HeaderLookup,
) -> Result<U256, Error> {
    let last_height = height - 1;
    let Some(last) = lookup.header_at(last_height)? else {
        return Ok(config.pow_limit);
    };

    if config.regtest {
        return Ok(target_from_bits(last.bits()));
    }

    let window = config.digi_averaging_window;
    let mut total = U256::ZERO;
    for i in 0..window {
        let h = last_height
            .checked_sub(i)
            .ok_or(Error::MissingHeader(0))?;
        let header = if i == 0 { last.clone() } else { require_header(lookup, h)? };
        let (sum, overflow) = total.overflowing_add(target_from_bits(header.bits()));
        assert!(!overflow, "averaging window target sum overflowed");
        total = sum;
    }

    // Use medians to prevent time-warp attacks. The anchor is the block just
    // before the averaging window.
    let first_height = last_height
        .checked_sub(window)
        .ok_or(Error::MissingHeader(0))?;
    require_header(lookup, first_height)?;

    let actual_timespan = (i64::from(median_time_past(lookup, last_height)?)
        - i64::from(median_time_past(lookup, first_height)?))
    .clamp(config.min_actual_timespan(), config.max_actual_timespan());

    let avg = total / U256::from(window);
    let avg = avg / U256::from(config.averaging_window_timespan() as u64);
    let (new_target, overflow) = avg.overflowing_mul(actual_timespan as u64);
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
    use std::collections::HashMap;

    /// 60 headers spaced `spacing` seconds apart, all at the same bits.
    fn chain_with_spacing(bits: u32, spacing: u32) -> MockChain {
        MockChain(
            (0..60_u64)
                .map(|i| (i, legacy_header(i as u32 * spacing, bits)))
                .collect(),
        )
    }

    #[test]
    fn steady_chain_keeps_target_near_average() {
        let config = NetworkConfig::new(Network::Mainnet);
        let bits = 0x1d00ffff;
        let chain = chain_with_spacing(bits, 600);
        let target = get_digishield_target(&config, 60, &chain).unwrap();
        // Ideal spacing: the result is the window average scaled by the
        // exact window timespan, i.e. the input target (modulo flooring).
        let expected = {
            let avg = target_from_bits(bits) / U256::from(config.averaging_window_timespan() as u64);
            avg.overflowing_mul(config.averaging_window_timespan() as u64).0
        };
        assert_eq!(target, expected);
    }

    #[test]
    fn slow_blocks_ease_no_further_than_the_damping_bound() {
        let config = NetworkConfig::new(Network::Mainnet);
        let bits = 0x1d00ffff;
        // An hour per block: far beyond the +32% bound.
        let slow = get_digishield_target(&config, 60, &chain_with_spacing(bits, 3600)).unwrap();
        let steady = get_digishield_target(&config, 60, &chain_with_spacing(bits, 600)).unwrap();
        assert!(slow > steady);
        let bound = {
            let avg = target_from_bits(bits) / U256::from(config.averaging_window_timespan() as u64);
            avg.overflowing_mul(config.max_actual_timespan() as u64).0
        };
        assert_eq!(slow, bound);
    }

    #[test]
    fn fast_blocks_tighten_no_further_than_the_damping_bound() {
        let config = NetworkConfig::new(Network::Mainnet);
        let bits = 0x1d00ffff;
        let fast = get_digishield_target(&config, 60, &chain_with_spacing(bits, 60)).unwrap();
        let steady = get_digishield_target(&config, 60, &chain_with_spacing(bits, 600)).unwrap();
        assert!(fast < steady);
        let bound = {
            let avg = target_from_bits(bits) / U256::from(config.averaging_window_timespan() as u64);
            avg.overflowing_mul(config.min_actual_timespan() as u64).0
        };
        assert_eq!(fast, bound);
    }

    #[test]
    fn missing_previous_header_falls_back_to_the_limit() {
        let config = NetworkConfig::new(Network::Mainnet);
        let chain = MockChain(HashMap::new());
        assert_eq!(
            get_digishield_target(&config, 60, &chain).unwrap(),
            config.pow_limit
        );
    }
}

use btg_types::network::{NetworkConfig, DIFFICULTY_ADJUSTMENT_INTERVAL};
use btg_types::utils::target_from_bits;
use btg_types::{Header, U256};

use crate::error::Error;
use crate::utils::{require_header, HeaderLookup};

// https://github.com/bitcoin/bitcoin/blob/ae024137bda9fe189f4e7ccf26dbaffd44cbbeb6/src/pow.cpp#L14
pub(crate) fn get_legacy_target(
    config: &NetworkConfig,
    height: u64,
    lookup: &impl HeaderLookup,
) -> Result<U256, Error> {
    let last_height = height - 1;
    let last = require_header(lookup, last_height)?;

    if config.regtest {
        return Ok(target_from_bits(last.bits()));
    }

    if height % DIFFICULTY_ADJUSTMENT_INTERVAL != 0 {
        if config.testnet {
            return testnet_target(config, height, &last, last_height, lookup);
        }
        return Ok(target_from_bits(last.bits()));
    }

    let first = require_header(lookup, height - DIFFICULTY_ADJUSTMENT_INTERVAL)?;
    let target = target_from_bits(last.bits());

    let target_timespan = config.pow_target_timespan_legacy;
    let actual_timespan = (i64::from(last.time()) - i64::from(first.time()))
        .clamp(target_timespan / 4, target_timespan * 4);

    let (scaled, overflow) = target.overflowing_mul(actual_timespan as u64);
    if overflow {
        return Ok(config.pow_limit_legacy);
    }
    let new_target = scaled / U256::from(target_timespan as u64);
    Ok(new_target.min(config.pow_limit_legacy))
}

/// Special difficulty rule for testnet: a block arriving more than twice the
/// target spacing after its parent may be mined at minimum difficulty, and
/// the blocks after it resume from the last non-minimum bits.
fn testnet_target(
    config: &NetworkConfig,
    height: u64,
    last: &Header,
    last_height: u64,
    lookup: &impl HeaderLookup,
) -> Result<U256, Error> {
    let cur = require_header(lookup, height)?;
    if i64::from(cur.time()) > i64::from(last.time()) + 2 * i64::from(config.pow_target_spacing) {
        return Ok(config.pow_limit_legacy);
    }

    let min_bits = config.pow_limit_legacy.target_to_bits();
    let mut walk = last.clone();
    let mut walk_height = last_height;
    while walk.bits() == min_bits && walk_height % DIFFICULTY_ADJUSTMENT_INTERVAL != 0 {
        let Some(prev_height) = walk_height.checked_sub(1) else {
            break;
        };
        match lookup.header_at(prev_height)? {
            Some(prev) => {
                walk = prev;
                walk_height = prev_height;
            }
            None => break,
        }
    }
    Ok(target_from_bits(walk.bits()))
}

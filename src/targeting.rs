use btg_types::network::{NetworkConfig, DIFFICULTY_ADJUSTMENT_INTERVAL, MEDIAN_TIME_SPAN};
use btg_types::U256;

use crate::error::Error;
use crate::utils::HeaderLookup;
use crate::{digishield, legacy, lwma};

/// Target the header at `height` must encode in its `bits`.
///
/// Selection, in order: genesis, checkpointed windows, the pre-fork legacy
/// rules, the premined blocks right after the fork, the reduced-difficulty
/// ramp, Digishield v3, and finally LWMA.
pub(crate) fn get_target(
    config: &NetworkConfig,
    height: u64,
    lookup: &impl HeaderLookup,
) -> Result<U256, Error> {
    if height == 0 {
        return Ok(config.pow_limit_legacy);
    }

    if height % DIFFICULTY_ADJUSTMENT_INTERVAL == 0 {
        let index = usize::try_from(height / DIFFICULTY_ADJUSTMENT_INTERVAL - 1)
            .expect("checkpoint index fits usize");
        if let Some((_, target)) = config.checkpoints.get(index) {
            return Ok(*target);
        }
    }

    if height < config.btg_height {
        legacy::get_legacy_target(config, height, lookup)
    } else if height < config.btg_height + config.premine_size {
        Ok(config.pow_limit)
    } else if height < config.btg_height + config.premine_size + config.digi_averaging_window {
        Ok(config.pow_limit_start)
    } else if height < config.lwma_height {
        digishield::get_digishield_target(config, height, lookup)
    } else {
        lwma::get_lwma_target(config, height, lookup)
    }
}

/// Sorted median of the timestamps of the 11 headers ending at `height`
/// (fewer if unavailable).
pub(crate) fn median_time_past(lookup: &impl HeaderLookup, height: u64) -> Result<u32, Error> {
    let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
    for i in 0..MEDIAN_TIME_SPAN as u64 {
        let Some(h) = height.checked_sub(i) else { break };
        match lookup.header_at(h)? {
            Some(header) => times.push(header.time()),
            None => break,
        }
    }
    if times.is_empty() {
        return Err(Error::MissingHeader(height));
    }
    times.sort_unstable();
    Ok(times[times.len() / 2])
}

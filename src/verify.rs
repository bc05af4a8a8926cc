use btg_types::hash::H256;
use btg_types::utils::DecodeHeaderError;
use btg_types::{Header, U256};

use crate::error::Error;
use crate::{BtgLightClient, HeaderCache};

impl BtgLightClient {
    /// Checks one header against its chain link and the target computed for
    /// its height: the previous hash must match, `bits` must encode the
    /// target exactly, the block hash must not exceed the target, and a
    /// post-fork header must carry a valid Equihash solution.
    pub(crate) fn verify_header(
        &self,
        header: &Header,
        height: u64,
        prev_hash: &H256,
        target: U256,
    ) -> Result<(), Error> {
        if header.prev_block_hash() != prev_hash {
            return Err(Error::PrevHashMismatch {
                expected: *prev_hash,
                actual: *header.prev_block_hash(),
            });
        }

        let bits = target.target_to_bits();
        if bits != header.bits() {
            return Err(Error::BitsMismatch {
                expected: bits,
                actual: header.bits(),
            });
        }

        if self.config.skip_pow_verification {
            return Ok(());
        }

        let hash = header.block_hash();
        if U256::from_le_bytes(&hash.0) > target {
            return Err(Error::InsufficientPow { hash });
        }

        if let Header::Equihash(header) = header {
            let (n, k) = self.config.network.equihash_params(height);
            equihash::is_valid_solution(n, k, &header.equihash_input(), &header.nonce.0, &header.solution)
                .map_err(|err| Error::InvalidEquihash(err.to_string()))?;
        }

        Ok(())
    }

    /// Verifies a run of consecutive raw headers starting at `start_height`
    /// without writing anything. The target is recomputed at every retarget
    /// height; headers earlier in the chunk are visible to the retarget
    /// through the cache.
    pub(crate) fn verify_chunk(
        &self,
        chain: u64,
        start_height: u64,
        data: &[u8],
    ) -> Result<(), Error> {
        let mut height = start_height;
        let mut offset = 0usize;
        let mut prev_hash = if height == 0 {
            H256::ZERO
        } else {
            self.get_hash(chain, height - 1)?
        };
        let mut cache = HeaderCache::new();
        let mut target: Option<U256> = None;

        while offset < data.len() {
            let header_size = self.config.network.header_size(height);
            let end = offset + header_size;
            if end > data.len() {
                return Err(DecodeHeaderError::TooShort {
                    expected: header_size,
                    actual: data.len() - offset,
                }
                .into());
            }

            let header = Header::from_bytes(&data[offset..end], height, &self.config.network)?;
            cache.insert(height, header.clone());

            if self.config.network.needs_retarget(height) || target.is_none() {
                target = Some(self.get_target(chain, height, &cache)?);
            }
            let target = target.expect("target computed above");
            self.verify_header(&header, height, &prev_hash, target)?;

            prev_hash = header.block_hash();
            offset = end;
            height += 1;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{empty_client, legacy_config};
    use btg_types::LegacyHeader;
    use serde_json::json;

    fn bitcoin_genesis() -> Header {
        Header::Legacy(
            serde_json::from_value::<LegacyHeader>(json!({
                "version": 1,
                "prev_block_hash": "0000000000000000000000000000000000000000000000000000000000000000",
                "merkle_root": "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
                "time": 1_231_006_505,
                "bits": 486_604_799_u32,
                "nonce": 2_083_236_893_u32,
            }))
            .unwrap(),
        )
    }

    #[test]
    fn real_genesis_header_verifies() {
        let (client, _dir) = empty_client(legacy_config());
        let header = bitcoin_genesis();
        let target = btg_types::utils::target_from_bits(0x1d00ffff);
        client
            .verify_header(&header, 0, &H256::ZERO, target)
            .unwrap();
    }

    #[test]
    fn prev_hash_mismatch_is_rejected_first() {
        let (client, _dir) = empty_client(legacy_config());
        let header = bitcoin_genesis();
        let wrong_prev = header.block_hash();
        assert!(matches!(
            client.verify_header(&header, 0, &wrong_prev, U256::ZERO),
            Err(Error::PrevHashMismatch { .. })
        ));
    }

    #[test]
    fn bits_must_encode_the_expected_target() {
        let (client, _dir) = empty_client(legacy_config());
        let header = bitcoin_genesis();
        let tighter = btg_types::utils::target_from_bits(0x1c00ffff);
        assert!(matches!(
            client.verify_header(&header, 0, &H256::ZERO, tighter),
            Err(Error::BitsMismatch { expected: 0x1c00ffff, actual: 0x1d00ffff })
        ));
    }

    #[test]
    fn hash_above_target_is_insufficient_pow() {
        let (client, _dir) = empty_client(legacy_config());
        // bits encoding the target 1: no real hash can satisfy it.
        let header = Header::Legacy(LegacyHeader {
            bits: 0x01010000,
            ..match bitcoin_genesis() {
                Header::Legacy(h) => h,
                Header::Equihash(_) => unreachable!(),
            }
        });
        let target = btg_types::utils::target_from_bits(0x01010000);
        assert!(matches!(
            client.verify_header(&header, 0, &H256::ZERO, target),
            Err(Error::InsufficientPow { .. })
        ));
    }
}

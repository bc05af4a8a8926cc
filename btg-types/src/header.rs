use serde::{Deserialize, Serialize};

use crate::hash::{double_sha256, H256};
use crate::network::NetworkConfig;
use crate::utils::DecodeHeaderError;

/// Block header as mined before the Bitcoin Gold fork point.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LegacyHeader {
    /// Block version, now repurposed for soft fork signalling.
    pub version: u32,
    /// Reference to the previous block in the chain.
    pub prev_block_hash: H256,
    /// The root hash of the merkle tree of transactions in the block.
    pub merkle_root: H256,
    /// The timestamp of the block, as claimed by the miner.
    pub time: u32,
    /// The target value below which the blockhash must lie.
    pub bits: u32,
    /// The nonce, selected to obtain a low enough blockhash.
    pub nonce: u32,
}

impl LegacyHeader {
    /// Serialized length of fields (version, prev_blockhash, merkle_root, time, bits, nonce)
    pub const SIZE: usize = 4 + 32 + 32 + 4 + 4 + 4; // 80

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend(self.prev_block_hash.0);
        out.extend(self.merkle_root.0);
        out.extend_from_slice(&self.time.to_le_bytes());
        out.extend_from_slice(&self.bits.to_le_bytes());
        out.extend_from_slice(&self.nonce.to_le_bytes());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeHeaderError> {
        if data.len() != Self::SIZE {
            return Err(DecodeHeaderError::TooShort {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }

        Ok(Self {
            version: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            prev_block_hash: H256::try_from(&data[4..36]).unwrap(),
            merkle_root: H256::try_from(&data[36..68]).unwrap(),
            time: u32::from_le_bytes(data[68..72].try_into().unwrap()),
            bits: u32::from_le_bytes(data[72..76].try_into().unwrap()),
            nonce: u32::from_le_bytes(data[76..80].try_into().unwrap()),
        })
    }

    #[must_use]
    pub fn block_hash(&self) -> H256 {
        double_sha256(&self.to_bytes())
    }
}

/// Block header as mined at or above the Bitcoin Gold fork point: the block
/// height and a 28-byte reserved field sit between the merkle root and the
/// timestamp, the nonce grows to 32 bytes and an Equihash solution follows,
/// prefixed by its compact-size length on the wire.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EquihashHeader {
    /// Block version, now repurposed for soft fork signalling.
    pub version: u32,
    /// Reference to the previous block in the chain.
    pub prev_block_hash: H256,
    /// The root hash of the merkle tree of transactions in the block.
    pub merkle_root: H256,
    /// Height of this block, committed to by the miner.
    pub block_height: u32,
    #[serde(with = "hex::serde")]
    pub reserved: [u8; 28],
    /// The timestamp of the block, as claimed by the miner.
    pub time: u32,
    /// The target value below which the blockhash must lie.
    pub bits: u32,
    /// The 256-bit nonce fed into the Equihash personalization.
    pub nonce: H256,
    /// Equihash solution, without its compact-size length prefix.
    #[serde(with = "hex::serde")]
    pub solution: Vec<u8>,
}

impl EquihashHeader {
    /// Serialized length of everything before the nonce — the input half of
    /// the Equihash preimage.
    pub const PREIMAGE_SIZE: usize = 4 + 32 + 32 + 4 + 28 + 4 + 4; // 108

    /// Serialized length including nonce, solution and its length prefix.
    #[must_use]
    pub fn wire_size(&self) -> usize {
        Self::PREIMAGE_SIZE + 32 + compact_size_len(self.solution.len()) + self.solution.len()
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_size());
        out.extend_from_slice(&self.equihash_input());
        out.extend(self.nonce.0);
        write_compact_size(&mut out, self.solution.len());
        out.extend_from_slice(&self.solution);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeHeaderError> {
        const NONCE_END: usize = EquihashHeader::PREIMAGE_SIZE + 32; // 140

        if data.len() < NONCE_END + 1 {
            return Err(DecodeHeaderError::TooShort {
                expected: NONCE_END + 1,
                actual: data.len(),
            });
        }

        let (solution_len, prefix_len) = read_compact_size(&data[NONCE_END..])?;
        let solution_start = NONCE_END + prefix_len;
        if solution_start + solution_len != data.len() {
            return Err(DecodeHeaderError::SolutionLength {
                declared: solution_len,
                actual: data.len() - solution_start,
            });
        }

        let mut reserved = [0u8; 28];
        reserved.copy_from_slice(&data[72..100]);

        Ok(Self {
            version: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            prev_block_hash: H256::try_from(&data[4..36]).unwrap(),
            merkle_root: H256::try_from(&data[36..68]).unwrap(),
            block_height: u32::from_le_bytes(data[68..72].try_into().unwrap()),
            reserved,
            time: u32::from_le_bytes(data[100..104].try_into().unwrap()),
            bits: u32::from_le_bytes(data[104..108].try_into().unwrap()),
            nonce: H256::try_from(&data[108..140]).unwrap(),
            solution: data[solution_start..].to_vec(),
        })
    }

    #[must_use]
    pub fn block_hash(&self) -> H256 {
        double_sha256(&self.to_bytes())
    }

    /// The block header minus nonce and solution, as hashed by the solver.
    #[must_use]
    pub fn equihash_input(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::PREIMAGE_SIZE);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend(self.prev_block_hash.0);
        out.extend(self.merkle_root.0);
        out.extend_from_slice(&self.block_height.to_le_bytes());
        out.extend_from_slice(&self.reserved);
        out.extend_from_slice(&self.time.to_le_bytes());
        out.extend_from_slice(&self.bits.to_le_bytes());
        out
    }
}

/// A header from either side of the fork point.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum Header {
    Equihash(EquihashHeader),
    Legacy(LegacyHeader),
}

impl Header {
    /// Decodes wire bytes; the regime is chosen by the height the bytes were
    /// read at, not by their length.
    pub fn from_bytes(
        data: &[u8],
        height: u64,
        config: &NetworkConfig,
    ) -> Result<Self, DecodeHeaderError> {
        if config.is_post_btg_fork(height) {
            EquihashHeader::from_bytes(data).map(Header::Equihash)
        } else {
            LegacyHeader::from_bytes(data).map(Header::Legacy)
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Header::Equihash(h) => h.to_bytes(),
            Header::Legacy(h) => h.to_bytes(),
        }
    }

    #[must_use]
    pub fn block_hash(&self) -> H256 {
        match self {
            Header::Equihash(h) => h.block_hash(),
            Header::Legacy(h) => h.block_hash(),
        }
    }

    #[must_use]
    pub fn prev_block_hash(&self) -> &H256 {
        match self {
            Header::Equihash(h) => &h.prev_block_hash,
            Header::Legacy(h) => &h.prev_block_hash,
        }
    }

    #[must_use]
    pub fn merkle_root(&self) -> &H256 {
        match self {
            Header::Equihash(h) => &h.merkle_root,
            Header::Legacy(h) => &h.merkle_root,
        }
    }

    #[must_use]
    pub fn time(&self) -> u32 {
        match self {
            Header::Equihash(h) => h.time,
            Header::Legacy(h) => h.time,
        }
    }

    #[must_use]
    pub fn bits(&self) -> u32 {
        match self {
            Header::Equihash(h) => h.bits,
            Header::Legacy(h) => h.bits,
        }
    }

    /// The height committed in the header, when the regime carries one.
    #[must_use]
    pub fn height(&self) -> Option<u64> {
        match self {
            Header::Equihash(h) => Some(u64::from(h.block_height)),
            Header::Legacy(_) => None,
        }
    }

    #[must_use]
    pub fn wire_size(&self) -> usize {
        match self {
            Header::Equihash(h) => h.wire_size(),
            Header::Legacy(_) => LegacyHeader::SIZE,
        }
    }
}

fn compact_size_len(n: usize) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        _ => 5,
    }
}

fn write_compact_size(out: &mut Vec<u8>, n: usize) {
    match n {
        0..=0xfc => out.push(n as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        _ => {
            out.push(0xfe);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
    }
}

/// Returns `(value, bytes consumed)`.
fn read_compact_size(data: &[u8]) -> Result<(usize, usize), DecodeHeaderError> {
    let too_short = |expected: usize| DecodeHeaderError::TooShort {
        expected,
        actual: data.len(),
    };

    match data.first().copied().ok_or_else(|| too_short(1))? {
        0xfd => {
            let raw = data.get(1..3).ok_or_else(|| too_short(3))?;
            Ok((u16::from_le_bytes(raw.try_into().unwrap()).into(), 3))
        }
        0xfe => {
            let raw = data.get(1..5).ok_or_else(|| too_short(5))?;
            let n = u32::from_le_bytes(raw.try_into().unwrap());
            Ok((usize::try_from(n).unwrap(), 5))
        }
        0xff => {
            let raw = data.get(1..9).ok_or_else(|| too_short(9))?;
            let n = u64::from_le_bytes(raw.try_into().unwrap());
            usize::try_from(n)
                .map(|n| (n, 9))
                .map_err(|_| DecodeHeaderError::SolutionLength {
                    declared: usize::MAX,
                    actual: data.len(),
                })
        }
        small => Ok((small.into(), 1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Network, NetworkConfig};
    use serde_json::json;

    fn bitcoin_genesis() -> LegacyHeader {
        serde_json::from_value(json!({
            "version": 1,
            "prev_block_hash": "0000000000000000000000000000000000000000000000000000000000000000",
            "merkle_root": "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
            "time": 1_231_006_505,
            "bits": 486_604_799_u32,
            "nonce": 2_083_236_893_u32,
        }))
        .unwrap()
    }

    #[test]
    fn legacy_block_hash() {
        assert_eq!(
            bitcoin_genesis().block_hash().to_string(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }

    #[test]
    fn legacy_round_trip() {
        let header = bitcoin_genesis();
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), LegacyHeader::SIZE);
        assert_eq!(LegacyHeader::from_bytes(&bytes).unwrap(), header);
    }

    fn regtest_header(solution: Vec<u8>) -> EquihashHeader {
        EquihashHeader {
            version: 536_870_912,
            prev_block_hash: "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"
                .parse()
                .unwrap(),
            merkle_root: "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
                .parse()
                .unwrap(),
            block_height: 2000,
            reserved: [0u8; 28],
            time: 1_532_452_000,
            bits: 0x207fffff,
            nonce: H256::from([7u8; 32]),
            solution,
        }
    }

    #[test]
    fn equihash_round_trip() {
        let config = NetworkConfig::new(Network::Regtest);
        let header = regtest_header(vec![0xab; 36]);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), config.header_size(2000));
        // One-byte compact size for the 36-byte regtest solution.
        assert_eq!(bytes[140], 0x24);
        assert_eq!(
            Header::from_bytes(&bytes, 2000, &config).unwrap(),
            Header::Equihash(header)
        );
    }

    #[test]
    fn equihash_preimage_excludes_nonce_and_solution() {
        let header = regtest_header(vec![0xab; 36]);
        let input = header.equihash_input();
        assert_eq!(input.len(), EquihashHeader::PREIMAGE_SIZE);
        assert_eq!(&header.to_bytes()[..EquihashHeader::PREIMAGE_SIZE], &input[..]);
    }

    #[test]
    fn mainnet_solution_uses_three_byte_prefix() {
        let header = regtest_header(vec![0xcd; 1344]);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), 1487);
        assert_eq!(&bytes[140..143], &[0xfd, 0x40, 0x05]);
    }

    #[test]
    fn truncated_solution_is_rejected() {
        let mut bytes = regtest_header(vec![0xab; 36]).to_bytes();
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            EquihashHeader::from_bytes(&bytes),
            Err(DecodeHeaderError::SolutionLength { declared: 36, actual: 35 })
        ));
    }

    #[test]
    fn header_json_is_untagged() {
        // A server header without a solution field parses as the legacy
        // variant; one with the post-fork fields parses as Equihash.
        let legacy: Header = serde_json::to_value(bitcoin_genesis())
            .and_then(serde_json::from_value)
            .unwrap();
        assert!(matches!(legacy, Header::Legacy(_)));

        let equihash: Header = serde_json::to_value(regtest_header(vec![1, 2, 3]))
            .and_then(serde_json::from_value)
            .unwrap();
        assert!(matches!(equihash, Header::Equihash(_)));
    }
}

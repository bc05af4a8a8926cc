use btg_types::hash::H256;
use btg_types::utils::DecodeHeaderError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("prev hash mismatch: {expected} vs {actual}")]
    PrevHashMismatch { expected: H256, actual: H256 },

    #[error("bits mismatch: {expected:#010x} vs {actual:#010x}")]
    BitsMismatch { expected: u32, actual: u32 },

    #[error("insufficient proof of work: {hash}")]
    InsufficientPow { hash: H256 },

    #[error("invalid equihash solution: {0}")]
    InvalidEquihash(String),

    #[error(transparent)]
    HeaderTooShort(#[from] DecodeHeaderError),

    #[error("branch {0} is not connected")]
    BranchNotConnected(u64),

    #[error("no header stored at height {0}")]
    MissingHeader(u64),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

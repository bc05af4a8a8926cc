pub mod hash;
pub mod header;
pub mod network;
pub mod u256;
pub mod utils;

pub use hash::{double_sha256, H256};
pub use header::{EquihashHeader, Header, LegacyHeader};
pub use network::{Network, NetworkConfig};
pub use u256::U256;

pub type Target = U256;

//! Header store and verifier for a Bitcoin Gold SPV client.
//!
//! Headers live in append-mostly branch files: the main chain in
//! `blockchain_headers`, every competing branch in `forks/fork_<parent>_<checkpoint>`.
//! A single file can hold both the 80-byte pre-fork rows and the
//! Equihash-sized post-fork rows; heights are derived from byte offsets.
//! The branch with the most headers past its fork point is always kept
//! closest to the root, swapping files with its parent when it outgrows it.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use log::{debug, info, warn};
use serde::Deserialize;

use btg_types::hash::H256;
use btg_types::network::DIFFICULTY_ADJUSTMENT_INTERVAL;

mod branch;
mod digishield;
pub mod error;
mod legacy;
mod lwma;
mod targeting;
mod utils;
mod verify;

pub use branch::Branch;
pub use error::Error;
pub use utils::HeaderLookup;

pub use btg_types::{
    self, EquihashHeader, Header, LegacyHeader, Network, NetworkConfig, U256,
};

/// Headers already decoded by the operation in flight, keyed by height and
/// consulted before disk.
pub type HeaderCache = std::collections::HashMap<u64, Header>;

#[derive(Clone, Debug, Deserialize)]
pub struct ClientConfig {
    /// Directory holding `blockchain_headers` and the `forks/` directory.
    pub datadir: PathBuf,
    pub network: NetworkConfig,
    /// Skip the hash-versus-target and Equihash checks. Chain linkage and
    /// `bits` are always enforced. For tests and trusted snapshots only.
    #[serde(default)]
    pub skip_pow_verification: bool,
}

/// The set of live branches, keyed by checkpoint. The root branch
/// (checkpoint 0) always exists.
pub struct BtgLightClient {
    config: ClientConfig,
    branches: BTreeMap<u64, Branch>,
}

impl BtgLightClient {
    /// Discovers the branches already on disk and rehydrates the set.
    ///
    /// The root branch is created empty if this is a fresh datadir. Fork
    /// files whose first header no longer connects to their parent are
    /// logged and skipped.
    pub fn load(config: ClientConfig) -> Result<Self, Error> {
        let forks_dir = config.datadir.join("forks");
        fs::create_dir_all(&forks_dir)?;

        let mut root = Branch::new(0, None);
        let root_path = root.path(&config);
        if !root_path.exists() {
            branch::create_empty_file(&root_path)?;
        }
        root.update_size(&config)?;

        let mut client = Self {
            config,
            branches: BTreeMap::from([(0, root)]),
        };

        let mut forks = Vec::new();
        for entry in fs::read_dir(&forks_dir)? {
            let name = entry?.file_name();
            if let Some(ids) = branch::parse_fork_file_name(&name.to_string_lossy()) {
                forks.push(ids);
            }
        }
        forks.sort_unstable();

        for (parent, checkpoint) in forks {
            let mut branch = Branch::new(checkpoint, Some(parent));
            branch.update_size(&client.config)?;

            let first_header = if client.branches.contains_key(&parent) {
                branch.read_header(&client.config, checkpoint)?
            } else {
                None
            };
            let connects = first_header
                .map(|h| client.can_connect_branch(parent, &h, checkpoint, false))
                .unwrap_or(false);

            if connects {
                client.branches.insert(checkpoint, branch);
            } else {
                warn!(target: "chain", "cannot connect fork_{parent}_{checkpoint}, skipping");
            }
        }

        Ok(client)
    }

    #[must_use]
    pub fn network(&self) -> &NetworkConfig {
        &self.config.network
    }

    pub fn branches(&self) -> impl Iterator<Item = &Branch> {
        self.branches.values()
    }

    #[must_use]
    pub fn branch(&self, chain: u64) -> Option<&Branch> {
        self.branches.get(&chain)
    }

    fn branch_or_err(&self, chain: u64) -> Result<&Branch, Error> {
        self.branches.get(&chain).ok_or(Error::BranchNotConnected(chain))
    }

    /// The branch with the highest tip.
    #[must_use]
    pub fn best_chain(&self) -> u64 {
        self.branches
            .values()
            .max_by_key(|b| b.next_height())
            .map(|b| b.checkpoint())
            .unwrap_or(0)
    }

    /// Tip height of a branch, `None` while it is empty.
    #[must_use]
    pub fn height(&self, chain: u64) -> Option<u64> {
        self.branches
            .get(&chain)
            .filter(|b| b.size() > 0)
            .map(Branch::height)
    }

    /// The checkpoint of the highest-forking child of this branch, if any.
    #[must_use]
    pub fn get_max_child(&self, chain: u64) -> Option<u64> {
        self.branches
            .values()
            .filter(|b| b.parent_id() == Some(chain))
            .map(Branch::checkpoint)
            .max()
    }

    /// Number of headers this branch holds past its last fork point.
    #[must_use]
    pub fn branch_size(&self, chain: u64) -> u64 {
        let Some(branch) = self.branches.get(&chain) else {
            return 0;
        };
        let fork_point = self.get_max_child(chain).unwrap_or_else(|| branch.checkpoint());
        branch.next_height().saturating_sub(fork_point)
    }

    /// Reads the header at `height`, walking up to parent branches for
    /// heights below this branch's checkpoint.
    pub fn read_header(&self, chain: u64, height: u64) -> Result<Option<Header>, Error> {
        let branch = self.branch_or_err(chain)?;
        if height < branch.checkpoint() {
            let parent = branch.parent_id().ok_or(Error::BranchNotConnected(chain))?;
            assert_ne!(parent, chain, "branch cannot be its own parent");
            return self.read_header(parent, height);
        }
        branch.read_header(&self.config, height)
    }

    /// Hash of the header at `height` as seen from `chain`: the genesis and
    /// checkpointed window boundaries come from the network constants, the
    /// rest from disk.
    pub fn get_hash(&self, chain: u64, height: u64) -> Result<H256, Error> {
        if height == 0 {
            return Ok(self.config.network.genesis);
        }
        if (height + 1) % DIFFICULTY_ADJUSTMENT_INTERVAL == 0 {
            let index = usize::try_from(height / DIFFICULTY_ADJUSTMENT_INTERVAL)
                .expect("checkpoint index fits usize");
            if let Some((hash, _)) = self.config.network.checkpoints.get(index) {
                return Ok(*hash);
            }
        }
        let header = self
            .read_header(chain, height)?
            .ok_or(Error::MissingHeader(height))?;
        Ok(header.block_hash())
    }

    /// Target the header at `height` must encode, with `cache` overlaying
    /// headers not yet on disk.
    pub fn get_target(&self, chain: u64, height: u64, cache: &HeaderCache) -> Result<U256, Error> {
        let view = ChainView {
            client: self,
            chain,
            cache,
        };
        targeting::get_target(&self.config.network, height, &view)
    }

    /// Tries every branch; the first branch the header extends wins.
    pub fn can_connect(&self, header: &Header, height: u64) -> Option<u64> {
        self.branches
            .keys()
            .copied()
            .find(|&chain| self.can_connect_branch(chain, header, height, true))
    }

    fn can_connect_branch(
        &self,
        chain: u64,
        header: &Header,
        height: u64,
        check_height: bool,
    ) -> bool {
        let Some(branch) = self.branches.get(&chain) else {
            return false;
        };
        if check_height && branch.next_height() != height {
            debug!(target: "chain", "branch {chain} cannot connect at height {height}");
            return false;
        }
        if height == 0 {
            return header.block_hash() == self.config.network.genesis;
        }

        let Ok(prev_hash) = self.get_hash(chain, height - 1) else {
            return false;
        };
        if prev_hash != *header.prev_block_hash() {
            return false;
        }

        let mut cache = HeaderCache::new();
        cache.insert(height, header.clone());
        let Ok(target) = self.get_target(chain, height, &cache) else {
            return false;
        };
        match self.verify_header(header, height, &prev_hash, target) {
            Ok(()) => true,
            Err(err) => {
                debug!(target: "chain", "header {height} does not connect to branch {chain}: {err}");
                false
            }
        }
    }

    /// Finds the branch whose stored header at `height` matches `header`.
    pub fn check_header(&self, header: &Header, height: u64) -> Option<u64> {
        let server_hash = header.block_hash();
        for &chain in self.branches.keys() {
            match self.get_hash(chain, height) {
                Ok(local) if local == server_hash => return Some(chain),
                Ok(local) => {
                    debug!(target: "chain", "header hash mismatch ({height}) {server_hash} != {local}");
                }
                Err(_) => {}
            }
        }
        None
    }

    /// Starts a new branch whose first header is `header` at `height`,
    /// forking off `parent`. Returns the new branch's checkpoint.
    pub fn fork(&mut self, parent: u64, header: &Header, height: u64) -> Result<u64, Error> {
        self.branch_or_err(parent)?;

        let branch = Branch::new(height, Some(parent));
        branch::create_empty_file(&branch.path(&self.config))?;
        if self.branches.insert(height, branch).is_some() {
            info!(target: "chain", "replacing existing branch at checkpoint {height}");
        }
        self.save_header(height, header, height)
    }

    /// Appends one verified header at the branch tip, then rebalances.
    /// Returns the checkpoint the branch is keyed under afterwards (it
    /// changes when the append triggers a swap with the parent).
    ///
    /// # Panics
    /// If the header does not sit exactly one past the branch tip; callers
    /// gate appends through [`can_connect`](Self::can_connect).
    pub fn save_header(&mut self, chain: u64, header: &Header, height: u64) -> Result<u64, Error> {
        let branch = self.branch_or_err(chain)?;
        assert!(
            height >= branch.checkpoint(),
            "header height {height} below branch checkpoint {}",
            branch.checkpoint()
        );
        assert_eq!(
            height - branch.checkpoint(),
            branch.size(),
            "header does not extend the branch tip"
        );

        let data = header.to_bytes();
        assert_eq!(
            data.len(),
            self.config.network.header_size(height),
            "serialized header has the wrong size for height {height}"
        );

        let offset = branch::get_offset(&self.config.network, branch.checkpoint(), height);
        let branch = self.branches.get_mut(&chain).expect("branch checked above");
        branch.write(&self.config, &data, offset, true)?;

        self.swap_with_parent(chain)
    }

    /// Verifies and stores one chunk of raw headers. Returns `false` (with a
    /// log line) on any failure; nothing is written in that case.
    pub fn connect_chunk(&mut self, chain: u64, idx: u64, hex_data: &str) -> bool {
        let height = idx * self.config.network.chunk_size;

        let data = match hex::decode(hex_data) {
            Ok(data) => data,
            Err(err) => {
                warn!(target: "chain", "chunk {idx} is not valid hex: {err}");
                return false;
            }
        };

        if let Err(err) = self.verify_chunk(chain, height, &data) {
            warn!(target: "chain", "verifying chunk {idx} failed: {err}");
            return false;
        }

        match self.save_chunk(chain, height, &data) {
            Ok(_) => {
                debug!(target: "chain", "validated chunk {idx}");
                true
            }
            Err(err) => {
                warn!(target: "chain", "saving chunk {idx} failed: {err}");
                false
            }
        }
    }

    /// Writes already-verified chunk bytes at their offset, trimming any
    /// rows below the branch checkpoint, then rebalances.
    fn save_chunk(&mut self, chain: u64, height: u64, data: &[u8]) -> Result<u64, Error> {
        let branch = self.branch_or_err(chain)?;
        let checkpoint = branch.checkpoint();

        let mut height = height;
        let mut data = data;
        if height < checkpoint {
            // Drop the chunk rows this branch does not store.
            let skip = usize::try_from(branch::get_offset(&self.config.network, height, checkpoint))
                .expect("offset fits usize");
            data = data.get(skip..).unwrap_or_default();
            height = checkpoint;
        }

        // Overwrites beyond the checkpointed region invalidate whatever used
        // to follow them.
        let truncate = height / DIFFICULTY_ADJUSTMENT_INTERVAL
            > self.config.network.checkpoints.len() as u64;
        let offset = branch::get_offset(&self.config.network, checkpoint, height);

        let branch = self.branches.get_mut(&chain).expect("branch checked above");
        branch.write(&self.config, data, offset, truncate)?;

        self.swap_with_parent(chain)
    }

    /// The branch with the most headers past the fork point must be the one
    /// closest to the root: when a child outgrows its parent the two
    /// exchange identities, file contents included. Returns the checkpoint
    /// the branch passed in is keyed under afterwards.
    fn swap_with_parent(&mut self, chain: u64) -> Result<u64, Error> {
        let branch = self.branch_or_err(chain)?;
        let Some(parent_id) = branch.parent_id() else {
            return Ok(chain);
        };
        let parent = self.branch_or_err(parent_id)?;

        let checkpoint = branch.checkpoint();
        let parent_branch_size = parent.next_height().saturating_sub(checkpoint);
        if parent_branch_size >= branch.size() {
            return Ok(chain);
        }

        info!(target: "chain", "swap {checkpoint} with parent {parent_id}");

        let mut child = self.branches.remove(&chain).expect("branch checked above");
        let mut parent = self.branches.remove(&parent_id).expect("parent checked above");

        // The other branches keep their identity, so their file names should
        // not move; snapshot them and rename whatever did.
        let old_paths: Vec<(u64, PathBuf)> = self
            .branches
            .iter()
            .map(|(&id, b)| (id, b.path(&self.config)))
            .collect();

        let child_data = child.read_all(&self.config)?;
        let offset = branch::get_offset(&self.config.network, parent.checkpoint(), checkpoint);
        let parent_data = parent.read_from(&self.config, offset)?;

        // Writes address the files under their pre-swap names: the child's
        // file becomes the parent's tail, the parent's file continues with
        // the child's headers.
        child.write(&self.config, &parent_data, 0, true)?;
        parent.write(&self.config, &child_data, offset, true)?;

        // Exchange identities.
        let old_child_parent = child.parent_id;
        child.parent_id = parent.parent_id;
        parent.parent_id = old_child_parent;
        child.checkpoint = parent.checkpoint;
        parent.checkpoint = checkpoint;
        child.size = parent.size;
        parent.size = parent_branch_size;

        let promoted = child.checkpoint;
        self.branches.insert(child.checkpoint, child);
        self.branches.insert(parent.checkpoint, parent);

        for (id, old_path) in old_paths {
            let new_path = self.branches[&id].path(&self.config);
            if new_path != old_path {
                info!(target: "chain", "renaming {} to {}", old_path.display(), new_path.display());
                fs::rename(&old_path, &new_path)?;
            }
        }

        Ok(promoted)
    }

    /// Checkpoint seed data for future clients: for each fully-verified
    /// adjustment window below the fork point, the hash of its last block
    /// and the target of the window after it.
    pub fn get_checkpoints(&self, chain: u64) -> Result<Vec<(H256, U256)>, Error> {
        let branch = self.branch_or_err(chain)?;
        let mut checkpoints = Vec::new();
        if branch.size() == 0 {
            return Ok(checkpoints);
        }

        let cache = HeaderCache::new();
        let windows = branch.height() / DIFFICULTY_ADJUSTMENT_INTERVAL;
        for index in 0..windows {
            let height = (index + 1) * DIFFICULTY_ADJUSTMENT_INTERVAL;
            if self.config.network.is_post_btg_fork(height) {
                break;
            }
            let hash = self.get_hash(chain, height - 1)?;
            let target = self.get_target(chain, height, &cache)?;
            checkpoints.push((hash, target));
        }
        Ok(checkpoints)
    }
}

/// One branch of one client plus an in-flight header cache, which the
/// retarget functions see as a single chain.
struct ChainView<'a> {
    client: &'a BtgLightClient,
    chain: u64,
    cache: &'a HeaderCache,
}

impl HeaderLookup for ChainView<'_> {
    fn header_at(&self, height: u64) -> Result<Option<Header>, Error> {
        if let Some(header) = self.cache.get(&height) {
            return Ok(Some(header.clone()));
        }
        self.client.read_header(self.chain, height)
    }
}

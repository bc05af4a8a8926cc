use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use btg_types::network::{NetworkConfig, HEADER_SIZE_LEGACY};
use btg_types::Header;

use crate::error::Error;
use crate::ClientConfig;

/// A contiguous run of headers backed by one file.
///
/// The root branch stores heights `0..size` in `<datadir>/blockchain_headers`;
/// every other branch stores `checkpoint..checkpoint + size` in
/// `<datadir>/forks/fork_<parent>_<checkpoint>`. Heights are never written to
/// disk; they follow from the byte offset.
#[derive(Debug)]
pub struct Branch {
    pub(crate) checkpoint: u64,
    pub(crate) parent_id: Option<u64>,
    pub(crate) size: u64,
    lock: Mutex<()>,
}

impl Branch {
    pub(crate) fn new(checkpoint: u64, parent_id: Option<u64>) -> Self {
        Branch {
            checkpoint,
            parent_id,
            size: 0,
            lock: Mutex::new(()),
        }
    }

    /// Absolute height of the first header stored in this branch's file.
    #[must_use]
    pub fn checkpoint(&self) -> u64 {
        self.checkpoint
    }

    /// Checkpoint of the parent branch; `None` for the root.
    #[must_use]
    pub fn parent_id(&self) -> Option<u64> {
        self.parent_id
    }

    /// Number of headers currently stored in this branch's file.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Height of this branch's tip.
    ///
    /// # Panics
    /// If the branch is empty.
    #[must_use]
    pub fn height(&self) -> u64 {
        assert!(self.size > 0, "empty branch has no tip");
        self.checkpoint + self.size - 1
    }

    /// One past the tip: the height the next appended header must have.
    #[must_use]
    pub fn next_height(&self) -> u64 {
        self.checkpoint + self.size
    }

    pub(crate) fn path(&self, config: &ClientConfig) -> PathBuf {
        branch_path(config, self.parent_id, self.checkpoint)
    }

    /// Recomputes `size` from the logical length of the backing file.
    pub(crate) fn update_size(&mut self, config: &ClientConfig) -> Result<(), Error> {
        let path = self.path(config);
        self.size = if path.exists() {
            let bytes = {
                let _guard = self.lock.lock();
                fileio::logical_len(&path)?
            };
            calculate_size(&config.network, self.checkpoint, bytes)
        } else {
            0
        };
        Ok(())
    }

    /// Reads the header stored at `height` in this branch's own file.
    ///
    /// Returns `None` outside `checkpoint..next_height()` and for an all-zero
    /// row (a hole left by an out-of-order chunk write).
    pub(crate) fn read_header(
        &self,
        config: &ClientConfig,
        height: u64,
    ) -> Result<Option<Header>, Error> {
        if height < self.checkpoint || height >= self.next_height() {
            return Ok(None);
        }

        let offset = get_offset(&config.network, self.checkpoint, height);
        let header_size = config.network.header_size(height);
        let data = {
            let _guard = self.lock.lock();
            fileio::read_exact_at(&self.path(config), offset, header_size)?
        };

        if data.iter().all(|&b| b == 0) {
            return Ok(None);
        }
        Ok(Some(Header::from_bytes(&data, height, &config.network)?))
    }

    pub(crate) fn read_all(&self, config: &ClientConfig) -> Result<Vec<u8>, Error> {
        self.read_from(config, 0)
    }

    pub(crate) fn read_from(&self, config: &ClientConfig, offset: u64) -> Result<Vec<u8>, Error> {
        let _guard = self.lock.lock();
        Ok(fileio::read_from(&self.path(config), offset)?)
    }

    /// Writes `data` at `offset` and fsyncs. With `truncate` set, an
    /// overwrite anywhere but the current end of the file also drops
    /// everything past `offset` first.
    pub(crate) fn write(
        &mut self,
        config: &ClientConfig,
        data: &[u8],
        offset: u64,
        truncate: bool,
    ) -> Result<(), Error> {
        let end_offset = get_offset(&config.network, self.checkpoint, self.next_height());
        {
            let _guard = self.lock.lock();
            fileio::write_at(&self.path(config), data, offset, truncate && offset != end_offset)?;
        }
        self.update_size(config)
    }
}

pub(crate) fn branch_path(config: &ClientConfig, parent_id: Option<u64>, checkpoint: u64) -> PathBuf {
    let mut name = match parent_id {
        None => PathBuf::from("blockchain_headers"),
        Some(parent) => Path::new("forks").join(format!("fork_{parent}_{checkpoint}")),
    };
    if cfg!(feature = "gzip") {
        name.set_extension("gz");
    }
    config.datadir.join(name)
}

/// Parses `fork_<parent>_<checkpoint>` (plus the `.gz` suffix when
/// compression is compiled in) into `(parent, checkpoint)`.
pub(crate) fn parse_fork_file_name(name: &str) -> Option<(u64, u64)> {
    #[cfg(feature = "gzip")]
    let name = name.strip_suffix(".gz")?;
    let rest = name.strip_prefix("fork_")?;
    let (parent, checkpoint) = rest.split_once('_')?;
    Some((parent.parse().ok()?, checkpoint.parse().ok()?))
}

pub(crate) fn create_empty_file(path: &Path) -> Result<(), Error> {
    Ok(fileio::create_empty(path)?)
}

/// Byte offset of the header at `height` within the file of a branch whose
/// first header sits at `checkpoint`. Three regimes can share one file:
/// legacy rows below the fork, post-fork rows, and (on networks that
/// hard-forked the Equihash parameters a second time) a third row size.
pub(crate) fn get_offset(net: &NetworkConfig, checkpoint: u64, height: u64) -> u64 {
    // Pre-fork rows
    let prb = if !net.is_post_btg_fork(height) {
        height - checkpoint
    } else if !net.is_post_btg_fork(checkpoint) {
        net.btg_height - checkpoint
    } else {
        0
    };

    // Second-regime Equihash rows
    let peb = match net.equihash_fork_height {
        Some(fork) if height >= fork => height - checkpoint.max(fork),
        _ => 0,
    };

    // Post-fork rows
    let pob = if net.is_post_btg_fork(height) {
        height - checkpoint.max(net.btg_height) - peb
    } else {
        0
    };

    prb * HEADER_SIZE_LEGACY as u64
        + pob * net.header_size as u64
        + peb * net.header_size_equihash as u64
}

/// Inverse of repeated appends from `checkpoint`: the number of whole headers
/// in a file of `size_in_bytes` logical bytes.
pub(crate) fn calculate_size(net: &NetworkConfig, checkpoint: u64, size_in_bytes: u64) -> u64 {
    let mut remaining = size_in_bytes;
    let mut cursor = checkpoint;
    let mut rows = 0u64;

    if !net.is_post_btg_fork(cursor) {
        let prefork_bytes = (net.btg_height - cursor) * HEADER_SIZE_LEGACY as u64;
        if remaining < prefork_bytes {
            return remaining / HEADER_SIZE_LEGACY as u64;
        }
        rows += net.btg_height - cursor;
        remaining -= prefork_bytes;
        cursor = net.btg_height;
    }

    if !net.is_post_equihash_fork(cursor) {
        let row = net.header_size as u64;
        match net.equihash_fork_height {
            Some(fork) => {
                let segment = (fork - cursor) * row;
                if remaining < segment {
                    return rows + remaining / row;
                }
                rows += fork - cursor;
                remaining -= segment;
            }
            None => return rows + remaining / row,
        }
    }

    rows + remaining / net.header_size_equihash as u64
}

#[cfg(not(feature = "gzip"))]
mod fileio {
    use std::fs::{self, File, OpenOptions};
    use std::io::{self, Read, Seek, SeekFrom, Write};
    use std::path::Path;

    pub fn create_empty(path: &Path) -> io::Result<()> {
        File::create(path)?.sync_all()
    }

    pub fn logical_len(path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    pub fn read_exact_at(path: &Path, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_from(path: &Path, offset: u64) -> io::Result<Vec<u8>> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    pub fn write_at(path: &Path, data: &[u8], offset: u64, truncate: bool) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        if truncate {
            file.set_len(offset)?;
        }
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.flush()?;
        file.sync_all()
    }
}

#[cfg(feature = "gzip")]
mod fileio {
    //! Same surface as the plain implementation, but the byte stream is
    //! gzip-wrapped on disk and offsets address the decompressed stream.

    use std::fs::File;
    use std::io::{self, Read, Write};
    use std::path::Path;

    use flate2::read::GzDecoder;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn read_whole(path: &Path) -> io::Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(File::open(path)?);
        let mut buf = Vec::new();
        decoder.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn write_whole(path: &Path, bytes: &[u8]) -> io::Result<()> {
        let mut encoder = GzEncoder::new(File::create(path)?, Compression::fast());
        encoder.write_all(bytes)?;
        encoder.finish()?.sync_all()
    }

    pub fn create_empty(path: &Path) -> io::Result<()> {
        write_whole(path, &[])
    }

    pub fn logical_len(path: &Path) -> io::Result<u64> {
        Ok(read_whole(path)?.len() as u64)
    }

    pub fn read_exact_at(path: &Path, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let bytes = read_whole(path)?;
        let offset = usize::try_from(offset).expect("offset fits in memory");
        if offset + len > bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "expected to read a full header",
            ));
        }
        Ok(bytes[offset..offset + len].to_vec())
    }

    pub fn read_from(path: &Path, offset: u64) -> io::Result<Vec<u8>> {
        let bytes = read_whole(path)?;
        let offset = usize::try_from(offset).expect("offset fits in memory");
        Ok(bytes.get(offset..).unwrap_or_default().to_vec())
    }

    pub fn write_at(path: &Path, data: &[u8], offset: u64, truncate: bool) -> io::Result<()> {
        let mut bytes = if path.exists() {
            read_whole(path)?
        } else {
            Vec::new()
        };
        let offset = usize::try_from(offset).expect("offset fits in memory");
        if truncate {
            bytes.truncate(offset);
        }
        let end = offset + data.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[offset..end].copy_from_slice(data);
        write_whole(path, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btg_types::network::{Network, NetworkConfig};

    fn two_regime_net() -> NetworkConfig {
        NetworkConfig {
            btg_height: 5,
            header_size: 177,
            header_size_equihash: 177,
            ..NetworkConfig::new(Network::Regtest)
        }
    }

    #[test]
    fn offset_delta_is_header_size() {
        let net = two_regime_net();
        for checkpoint in [0, 3, 5, 9] {
            for height in checkpoint..checkpoint + 12 {
                assert_eq!(
                    get_offset(&net, checkpoint, height + 1) - get_offset(&net, checkpoint, height),
                    net.header_size(height) as u64,
                    "checkpoint {checkpoint}, height {height}"
                );
            }
        }
    }

    #[test]
    fn offset_spans_the_fork() {
        let net = two_regime_net();
        // Five legacy rows then post-fork rows.
        assert_eq!(get_offset(&net, 0, 4), 4 * 80);
        assert_eq!(get_offset(&net, 0, 5), 5 * 80);
        assert_eq!(get_offset(&net, 0, 7), 5 * 80 + 2 * 177);
        // A branch anchored past the fork counts no legacy rows.
        assert_eq!(get_offset(&net, 6, 9), 3 * 177);
    }

    #[test]
    fn calculate_size_inverts_appends() {
        let net = two_regime_net();
        for checkpoint in [0, 2, 5, 8] {
            for appended in 0..12 {
                let bytes = get_offset(&net, checkpoint, checkpoint + appended);
                assert_eq!(
                    calculate_size(&net, checkpoint, bytes),
                    appended,
                    "checkpoint {checkpoint}, {appended} headers"
                );
            }
        }
    }

    #[test]
    fn three_regime_offsets() {
        let net = NetworkConfig {
            btg_height: 5,
            equihash_fork_height: Some(8),
            header_size: 177,
            header_size_equihash: 241,
            ..NetworkConfig::new(Network::Regtest)
        };
        assert_eq!(get_offset(&net, 0, 10), 5 * 80 + 3 * 177 + 2 * 241);
        assert_eq!(get_offset(&net, 6, 10), 2 * 177 + 2 * 241);
        assert_eq!(get_offset(&net, 9, 10), 241);
        for checkpoint in [0, 4, 6, 8, 9] {
            for appended in 0..10 {
                let bytes = get_offset(&net, checkpoint, checkpoint + appended);
                assert_eq!(calculate_size(&net, checkpoint, bytes), appended);
            }
        }
    }

    #[test]
    fn fork_file_names() {
        let plain = parse_fork_file_name(if cfg!(feature = "gzip") {
            "fork_0_1500.gz"
        } else {
            "fork_0_1500"
        });
        assert_eq!(plain, Some((0, 1500)));
        assert_eq!(parse_fork_file_name("blockchain_headers"), None);
        assert_eq!(parse_fork_file_name("fork_garbage"), None);
    }
}

//! Arrays of persistent fixed-size blocks with untorn writes.
//!
//! A [`BlockPool`] divides a pool file into blocks of one size, chosen at
//! creation. Block writes are atomic against crashes by indirection: the
//! new bytes go to a spare physical block and become visible only when one
//! aligned map-entry store is made durable, so recovery sees the whole old
//! block or the whole new block, never a mixture. Blocks additionally
//! carry a logical state: a zeroed block reads as zeros without zero
//! bytes on media, and an errored block fails reads until rewritten.
//!
//! ```no_run
//! # fn main() -> Result<(), pmem_blk::Error> {
//! let mut pool = pmem_blk::BlockPool::create("/pmem/blk.pool", 512, 2 << 20, 0o666)?;
//! pool.write(0, &[0xab; 512])?;
//! assert_eq!(pool.read(0)?, vec![0xab; 512]);
//! # Ok(())
//! # }
//! ```

mod layout;

#[cfg(test)]
mod tests;

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use pmem::RawMap;
use thiserror::Error;

use layout::{Geometry, HEADER_PREFIX, STATE_ERROR, STATE_NORMAL, STATE_ZERO};

/// Interface version implemented by this crate.
pub const VERSION_MAJOR: u32 = 1;
pub const VERSION_MINOR: u32 = 1;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The pool file could not be created.
    #[error("failed to create block pool: {0}")]
    Create(#[source] io::Error),
    /// The pool file is missing or inaccessible.
    #[error("failed to open block pool: {0}")]
    Open(#[source] io::Error),
    /// The file exists but does not hold a consistent block pool.
    #[error("not a block pool: {0}")]
    Format(String),
    /// The pool was created with a different block size than the caller
    /// expects.
    #[error("block size mismatch (expected {expected}, pool has {actual})")]
    BlockSizeMismatch { expected: usize, actual: usize },
    /// Block number outside `0..nblock`.
    #[error("block {block_no} out of range (pool has {nblock} blocks)")]
    BlockOutOfRange { block_no: u64, nblock: u64 },
    /// Write data whose length is not exactly the pool's block size.
    #[error("data length {actual} does not match block size {expected}")]
    BadBlockLength { expected: usize, actual: usize },
    /// The block is in the error state; rewriting it clears the state.
    #[error("block {block_no} is in the error state")]
    BadBlock { block_no: u64 },
    /// Failure in the underlying mapping or durability call.
    #[error("persistence layer: {0}")]
    Pmem(#[from] pmem::Error),
    /// The library does not satisfy a required interface version.
    #[error("{0}")]
    Version(String),
}

pub type Result<T> = core::result::Result<T, Error>;

/// An open block memory pool.
///
/// Mutations take `&mut self`; share a pool between threads by wrapping it
/// in a lock. Dropping the pool releases the mapping; the blocks live on
/// in the file and can be reopened.
pub struct BlockPool {
    map: RawMap,
    geo: Geometry,
    /// Physical index of the spare block. Derived, never stored on media:
    /// rediscovered at open by scanning the translation map.
    free_phys: u32,
}

impl BlockPool {
    /// Create a block pool of `pool_size` bytes carved into blocks of
    /// `block_size` bytes. The usable block count is strictly less than
    /// `pool_size / block_size`; see [`BlockPool::nblock`].
    pub fn create(
        path: impl AsRef<Path>,
        block_size: usize,
        pool_size: u64,
        mode: u32,
    ) -> Result<Self> {
        let path = path.as_ref();
        let bsize = u32::try_from(block_size)
            .ok()
            .filter(|&b| b > 0)
            .ok_or_else(|| {
                Error::Create(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unusable block size {block_size}"),
                ))
            })?;
        let geo = layout::geometry(pool_size, bsize).ok_or_else(|| {
            Error::Create(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("pool size {pool_size} too small for block size {block_size}"),
            ))
        })?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(path)
            .map_err(Error::Create)?;
        file.set_len(pool_size).map_err(Error::Create)?;

        let len = usize::try_from(pool_size)
            .map_err(|_| Error::Create(io::Error::new(io::ErrorKind::InvalidInput, "pool too large")))?;
        let map = RawMap::map(&file, len)?;

        map.write_at(0, &layout::encode(&geo));
        // Identity translation, every block logically zeroed; the spare is
        // the one physical block past the logical range.
        for block_no in 0..geo.nblock {
            map.write_u32_at(
                geo.map_entry_off(block_no),
                layout::entry_new(block_no as u32, STATE_ZERO),
            );
        }
        map.persist_or_msync(0, geo.data_off as usize)?;

        tracing::debug!(
            path = %path.display(),
            pool_size,
            block_size,
            nblock = geo.nblock,
            is_pmem = map.is_pmem(),
            "created block pool"
        );
        Ok(BlockPool {
            map,
            free_phys: geo.nblock as u32,
            geo,
        })
    }

    /// Open an existing block pool file.
    ///
    /// A non-zero `expected_block_size` is verified against the pool's
    /// stored block size; zero skips the check.
    pub fn open(path: impl AsRef<Path>, expected_block_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(Error::Open)?;
        let file_len = file.metadata().map_err(Error::Open)?.len();
        if file_len < layout::HEADER_LEN as u64 {
            return Err(Error::Format("file smaller than pool header".into()));
        }

        let len = usize::try_from(file_len)
            .map_err(|_| Error::Format("pool too large for address space".into()))?;
        let map = RawMap::map(&file, len)?;

        let mut header = [0u8; HEADER_PREFIX];
        map.read_at(0, &mut header);
        let geo = layout::decode(&header).map_err(|msg| Error::Format(msg.into()))?;
        layout::validate(&geo, file_len).map_err(|msg| Error::Format(msg.into()))?;

        if expected_block_size != 0 && expected_block_size != geo.bsize as usize {
            return Err(Error::BlockSizeMismatch {
                expected: expected_block_size,
                actual: geo.bsize as usize,
            });
        }

        let free_phys = recover_spare(&map, &geo).map_err(|msg| Error::Format(msg.into()))?;
        tracing::debug!(
            path = %path.display(),
            nblock = geo.nblock,
            block_size = geo.bsize,
            free_phys,
            "opened block pool"
        );
        Ok(BlockPool {
            map,
            geo,
            free_phys,
        })
    }

    /// Block size fixed at pool creation.
    pub fn bsize(&self) -> usize {
        self.geo.bsize as usize
    }

    /// Usable block count, fixed for the life of the pool file.
    pub fn nblock(&self) -> u64 {
        self.geo.nblock
    }

    fn entry(&self, block_no: u64) -> Result<u32> {
        if block_no >= self.geo.nblock {
            return Err(Error::BlockOutOfRange {
                block_no,
                nblock: self.geo.nblock,
            });
        }
        Ok(self.map.read_u32_at(self.geo.map_entry_off(block_no)))
    }

    fn publish_entry(&mut self, block_no: u64, entry: u32) -> Result<()> {
        let off = self.geo.map_entry_off(block_no);
        self.map.write_u32_at(off, entry);
        self.map.persist_or_msync(off, 4)?;
        Ok(())
    }

    /// Read block `block_no` as exactly [`BlockPool::bsize`] raw bytes.
    ///
    /// A never-written or zeroed block reads as zeros; a block in the
    /// error state fails with [`Error::BadBlock`] until rewritten.
    pub fn read(&self, block_no: u64) -> Result<Vec<u8>> {
        let entry = self.entry(block_no)?;
        match layout::entry_state(entry) {
            STATE_ERROR => Err(Error::BadBlock { block_no }),
            STATE_ZERO => Ok(vec![0; self.bsize()]),
            _ => {
                let mut out = vec![0; self.bsize()];
                self.map
                    .read_at(self.geo.block_off(layout::entry_phys(entry)), &mut out);
                Ok(out)
            }
        }
    }

    /// Write block `block_no`; `data` must be exactly
    /// [`BlockPool::bsize`] bytes.
    ///
    /// The bytes land in the spare physical block and are durable before
    /// one aligned map-entry store redirects the logical block to them, so
    /// a crash mid-write leaves the whole old or the whole new content.
    /// Clears any zeroed/error state.
    pub fn write(&mut self, block_no: u64, data: &[u8]) -> Result<()> {
        if data.len() != self.bsize() {
            return Err(Error::BadBlockLength {
                expected: self.bsize(),
                actual: data.len(),
            });
        }
        let old = self.entry(block_no)?;

        let spare = self.free_phys;
        let off = self.geo.block_off(spare);
        self.map.write_at(off, data);
        self.map.persist_or_msync(off, data.len())?;

        let published = self.publish_entry(block_no, layout::entry_new(spare, STATE_NORMAL));
        // The in-memory entry swap has happened even if the durability call
        // failed, so the displaced physical block is the spare either way.
        // Leaving `free_phys` on the published block would alias it on the
        // next write.
        self.free_phys = layout::entry_phys(old);
        published?;
        tracing::trace!(block_no, phys = spare, "wrote block");
        Ok(())
    }

    /// Mark block `block_no` as reading all-zero, without writing zero
    /// bytes to media. Observably equivalent to writing a zero-filled
    /// block.
    pub fn set_zero(&mut self, block_no: u64) -> Result<()> {
        let old = self.entry(block_no)?;
        self.publish_entry(block_no, layout::entry_new(layout::entry_phys(old), STATE_ZERO))
    }

    /// Mark block `block_no` as unreadable until the next write, the way a
    /// detected media error would.
    pub fn set_error(&mut self, block_no: u64) -> Result<()> {
        let old = self.entry(block_no)?;
        self.publish_entry(
            block_no,
            layout::entry_new(layout::entry_phys(old), STATE_ERROR),
        )
    }

    /// Release in-process resources. The pool lives on in its file.
    pub fn close(self) -> Result<()> {
        self.map.unmap()?;
        Ok(())
    }
}

/// Scan the translation map for the one physical block no entry points at.
fn recover_spare(map: &RawMap, geo: &Geometry) -> core::result::Result<u32, &'static str> {
    let nphys = geo.nphys() as usize;
    let mut referenced = vec![false; nphys];
    for block_no in 0..geo.nblock {
        let entry = map.read_u32_at(geo.map_entry_off(block_no));
        let phys = layout::entry_phys(entry) as usize;
        if layout::entry_state(entry) > STATE_ERROR {
            return Err("map entry with invalid state");
        }
        if phys >= nphys {
            return Err("map entry past physical block range");
        }
        if referenced[phys] {
            return Err("two map entries share a physical block");
        }
        referenced[phys] = true;
    }
    let spare = referenced.iter().position(|used| !used);
    // nblock entries over nblock + 1 physical blocks, all distinct:
    // exactly one is unreferenced.
    spare.map(|phys| phys as u32).ok_or("no spare physical block")
}

/// Read-only consistency probe of a pool file; a non-zero `block_size` is
/// also compared against the pool's. Returns false, not an error, on any
/// detected inconsistency; using such a pool is undefined behavior.
pub fn check(path: impl AsRef<Path>, block_size: usize) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let Ok(meta) = file.metadata() else {
        return false;
    };
    let mut header = [0u8; HEADER_PREFIX];
    if file.read_exact(&mut header).is_err() {
        return false;
    }
    let Ok(geo) = layout::decode(&header) else {
        return false;
    };
    if layout::validate(&geo, meta.len()).is_err() {
        return false;
    }
    if block_size != 0 && block_size != geo.bsize as usize {
        return false;
    }

    // The translation map must reference distinct in-range physical
    // blocks, leaving exactly one spare.
    if file
        .seek(SeekFrom::Start(layout::HEADER_LEN as u64))
        .is_err()
    {
        return false;
    }
    let mut map_bytes = vec![0u8; 4 * geo.nblock as usize];
    if file.read_exact(&mut map_bytes[..]).is_err() {
        return false;
    }
    let nphys = geo.nphys() as usize;
    let mut referenced = vec![false; nphys];
    for chunk in map_bytes.chunks_exact(4) {
        let entry = u32::from_le_bytes(chunk.try_into().unwrap());
        let phys = layout::entry_phys(entry) as usize;
        if layout::entry_state(entry) > STATE_ERROR || phys >= nphys || referenced[phys] {
            return false;
        }
        referenced[phys] = true;
    }
    true
}

/// Check that this crate satisfies the interface version a caller was
/// written against.
pub fn check_version(major_required: u32, minor_required: u32) -> Result<()> {
    if major_required != VERSION_MAJOR {
        return Err(Error::Version(format!(
            "pmem-blk major version mismatch (required {major_required}, available {VERSION_MAJOR})"
        )));
    }
    if minor_required > VERSION_MINOR {
        return Err(Error::Version(format!(
            "pmem-blk minor version {minor_required} not available (have {VERSION_MINOR})"
        )));
    }
    Ok(())
}

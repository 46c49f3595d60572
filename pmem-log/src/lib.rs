//! Append-only durable log pool.
//!
//! A [`LogPool`] is a fixed-capacity log living in a single pool file. The
//! only mutable on-media state is a write pointer: an append first makes
//! the new bytes durable, then publishes them with a single aligned store
//! of the pointer word. A crash mid-append therefore leaves the log either
//! exactly as it was or with the append fully applied, never partially
//! advanced.
//!
//! ```no_run
//! # fn main() -> Result<(), pmem_log::Error> {
//! let mut log = pmem_log::LogPool::create("/pmem/log.pool", 2 << 20, 0o666)?;
//! log.append(b"hello")?;
//! assert_eq!(log.tell(), 5);
//! log.walk(0, |chunk| {
//!     assert_eq!(chunk, b"hello");
//!     true
//! });
//! # Ok(())
//! # }
//! ```

mod layout;

#[cfg(test)]
mod tests;

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use pmem::RawMap;
use thiserror::Error;

use layout::{HEADER_LEN, HEADER_PREFIX, WRITE_OFF};

/// Interface version implemented by this crate.
pub const VERSION_MAJOR: u32 = 1;
pub const VERSION_MINOR: u32 = 1;

/// Smallest pool file this crate will create.
pub const MIN_POOL: u64 = 2 * 1024 * 1024;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The pool file could not be created.
    #[error("failed to create log pool: {0}")]
    Create(#[source] io::Error),
    /// The pool file is missing or inaccessible.
    #[error("failed to open log pool: {0}")]
    Open(#[source] io::Error),
    /// The file exists but does not hold a consistent log pool.
    #[error("not a log pool: {0}")]
    Format(String),
    /// Append rejected for lack of capacity; the write pointer is
    /// untouched. Recoverable; rotate to a new pool.
    #[error("log pool out of space (requested {requested} bytes, {remaining} remaining)")]
    OutOfSpace { requested: u64, remaining: u64 },
    /// Failure in the underlying mapping or durability call.
    #[error("persistence layer: {0}")]
    Pmem(#[from] pmem::Error),
    /// The library does not satisfy a required interface version.
    #[error("{0}")]
    Version(String),
}

pub type Result<T> = core::result::Result<T, Error>;

/// An open log memory pool.
///
/// Mutations take `&mut self`; share a pool between threads by wrapping it
/// in a lock. Dropping the pool releases the mapping; the log itself
/// lives on in the file and can be reopened.
#[derive(Debug)]
pub struct LogPool {
    map: RawMap,
    capacity: u64,
}

impl LogPool {
    /// Create a new log pool file of `pool_size` bytes with the given
    /// permission bits. The usable capacity is smaller than `pool_size`
    /// by the metadata overhead; see [`LogPool::nbyte`].
    pub fn create(path: impl AsRef<Path>, pool_size: u64, mode: u32) -> Result<Self> {
        let path = path.as_ref();
        if pool_size < MIN_POOL {
            return Err(Error::Create(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("pool size {pool_size} below minimum {MIN_POOL}"),
            )));
        }

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

        let capacity = pool_size - HEADER_LEN as u64;
        map.write_at(0, &layout::encode(capacity));
        map.persist_or_msync(0, HEADER_LEN)?;

        tracing::debug!(
            path = %path.display(),
            pool_size,
            capacity,
            is_pmem = map.is_pmem(),
            "created log pool"
        );
        Ok(LogPool { map, capacity })
    }

    /// Open an existing log pool file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(Error::Open)?;
        let file_len = file.metadata().map_err(Error::Open)?.len();
        if file_len < HEADER_LEN as u64 {
            return Err(Error::Format("file smaller than pool header".into()));
        }

        let len = usize::try_from(file_len)
            .map_err(|_| Error::Format("pool too large for address space".into()))?;
        let map = RawMap::map(&file, len)?;

        let mut header = [0u8; HEADER_PREFIX];
        map.read_at(0, &mut header);
        let decoded = layout::decode(&header).map_err(|msg| Error::Format(msg.into()))?;
        layout::validate(&decoded, file_len).map_err(|msg| Error::Format(msg.into()))?;

        tracing::debug!(
            path = %path.display(),
            capacity = decoded.capacity,
            write_offset = decoded.write_offset,
            is_pmem = map.is_pmem(),
            "opened log pool"
        );
        Ok(LogPool {
            map,
            capacity: decoded.capacity,
        })
    }

    /// Usable log space in bytes, fixed for the life of the pool file.
    pub fn nbyte(&self) -> u64 {
        self.capacity
    }

    /// Current write point as a byte offset into the usable log space.
    pub fn tell(&self) -> u64 {
        self.map.read_u64_at(WRITE_OFF)
    }

    /// Reset the write point to zero. Previously written bytes are not
    /// erased, but subsequent appends overwrite them.
    pub fn rewind(&mut self) -> Result<()> {
        self.publish_write_offset(0)
    }

    /// Atomically append `data` at the current write point.
    ///
    /// The bytes are durable before the write pointer moves, and the
    /// pointer moves with one aligned store: a crash anywhere in between
    /// is indistinguishable from the append never having happened.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        let offset = self.tell();
        let remaining = self.capacity - offset;
        if data.len() as u64 > remaining {
            return Err(Error::OutOfSpace {
                requested: data.len() as u64,
                remaining,
            });
        }
        if data.is_empty() {
            return Ok(());
        }

        let pos = HEADER_LEN + offset as usize;
        self.map.write_at(pos, data);
        self.map.persist_or_msync(pos, data.len())?;

        self.publish_write_offset(offset + data.len() as u64)?;
        tracing::trace!(len = data.len(), offset, "appended to log pool");
        Ok(())
    }

    fn publish_write_offset(&mut self, offset: u64) -> Result<()> {
        self.map.write_u64_at(WRITE_OFF, offset);
        self.map.persist_or_msync(WRITE_OFF, 8)?;
        Ok(())
    }

    /// Lazy sequence of written chunks from offset zero to the current
    /// write point. `chunk_size == 0` yields at most one chunk covering
    /// everything written; otherwise chunks are `chunk_size` bytes with a
    /// trailing partial chunk included.
    pub fn chunks(&self, chunk_size: usize) -> Chunks<'_> {
        let end = self.tell();
        let chunk = if chunk_size == 0 {
            end.max(1)
        } else {
            chunk_size as u64
        };
        Chunks {
            pool: self,
            end,
            pos: 0,
            chunk,
        }
    }

    /// Walk the written log, calling `process_chunk` per chunk. Returning
    /// `false` stops the walk early without error.
    pub fn walk(&self, chunk_size: usize, mut process_chunk: impl FnMut(&[u8]) -> bool) {
        for chunk in self.chunks(chunk_size) {
            if !process_chunk(chunk) {
                break;
            }
        }
    }

    /// Release in-process resources. The pool lives on in its file.
    pub fn close(self) -> Result<()> {
        self.map.unmap()?;
        Ok(())
    }
}

/// Iterator over written log chunks; see [`LogPool::chunks`].
pub struct Chunks<'a> {
    pool: &'a LogPool,
    end: u64,
    pos: u64,
    chunk: u64,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.pos >= self.end {
            return None;
        }
        let len = (self.end - self.pos).min(self.chunk);
        let off = HEADER_LEN + self.pos as usize;
        self.pos += len;
        let pool: &'a LogPool = self.pool;
        // Safety: the shared borrow of the pool rules out appends for 'a,
        // and bytes below the snapshot end are never rewritten in place.
        Some(unsafe { pool.map.slice(off, len as usize) })
    }
}

/// Read-only consistency probe of a pool file. Returns false, not an
/// error, on any detected inconsistency; using such a pool is undefined
/// behavior.
pub fn check(path: impl AsRef<Path>) -> bool {
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
    match layout::decode(&header) {
        Ok(decoded) => layout::validate(&decoded, meta.len()).is_ok(),
        Err(_) => false,
    }
}

/// Check that this crate satisfies the interface version a caller was
/// written against.
pub fn check_version(major_required: u32, minor_required: u32) -> Result<()> {
    if major_required != VERSION_MAJOR {
        return Err(Error::Version(format!(
            "pmem-log major version mismatch (required {major_required}, available {VERSION_MAJOR})"
        )));
    }
    if minor_required > VERSION_MINOR {
        return Err(Error::Version(format!(
            "pmem-log minor version {minor_required} not available (have {VERSION_MINOR})"
        )));
    }
    Ok(())
}

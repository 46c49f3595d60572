//! Low-level persistent memory support.
//!
//! Maps file-backed byte ranges into the address space and exposes the
//! flush/drain protocol that decides when a store is actually durable
//! rather than merely visible. Writes to persistent memory can sit in
//! volatile CPU caches indefinitely; nothing is durable until the cache
//! lines are flushed *and* the stores have drained to the persistence
//! domain:
//!
//! ```text
//! region.write(data)?;   // visible, not durable
//! region.flush();        // cache lines pushed toward memory
//! region.drain();        // stores guaranteed in the persistence domain
//! ```
//!
//! `persist` is the composite of the last two. Both primitives stay
//! separate on purpose: batching many flushes before one drain is a valid
//! and common pattern. For mappings without hardware persistence semantics
//! (`is_pmem() == false`) durability goes through `msync` instead;
//! [`MappedRegion::sync`] makes that decision for the caller.
//!
//! The sibling crates `pmem-log` and `pmem-blk` build crash-consistent
//! pool structures on the same primitives.

mod error;
mod hw;
mod region;

#[cfg(test)]
mod tests;

pub use error::{Error, Result};
pub use hw::RawMap;
pub use region::MappedRegion;

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// Interface version implemented by this crate.
pub const VERSION_MAJOR: u32 = 1;
pub const VERSION_MINOR: u32 = 1;

/// File-creation behavior for [`map_file`], bitwise-combinable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MapFlags(u32);

impl MapFlags {
    /// Create the file if it does not exist; requires a non-zero length.
    pub const CREATE: MapFlags = MapFlags(1 << 0);
    /// With `CREATE`: fail if the file already exists.
    pub const EXCLUSIVE: MapFlags = MapFlags(1 << 1);
    /// With `CREATE`: hole-punched file instead of physical allocation.
    pub const SPARSE: MapFlags = MapFlags(1 << 2);
    /// Unnamed mapping with no directory entry; the path names a directory.
    pub const TEMPFILE: MapFlags = MapFlags(1 << 3);

    pub const fn empty() -> Self {
        MapFlags(0)
    }

    pub const fn contains(self, other: MapFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl core::ops::BitOr for MapFlags {
    type Output = MapFlags;

    fn bitor(self, rhs: MapFlags) -> MapFlags {
        MapFlags(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for MapFlags {
    fn bitor_assign(&mut self, rhs: MapFlags) {
        self.0 |= rhs.0;
    }
}

/// Map a file into the address space for persistent byte access.
///
/// Without creation flags, `len` must be 0 and the whole existing file is
/// mapped, the region length taken from the file size. With
/// [`MapFlags::CREATE`] the file is created (permission bits from `mode`)
/// and sized to `len`, physically allocated unless [`MapFlags::SPARSE`].
/// [`MapFlags::TEMPFILE`] creates an unnamed file inside the directory
/// named by `path`.
///
/// Paths are opaque byte strings; non-UTF8 names work.
pub fn map_file(
    path: impl AsRef<Path>,
    len: usize,
    flags: MapFlags,
    mode: u32,
) -> Result<MappedRegion> {
    let path = path.as_ref();

    let (file, map_len) = if flags.contains(MapFlags::TEMPFILE) {
        if len == 0 {
            return Err(usage("TEMPFILE requires a non-zero length"));
        }
        let file = open_tempfile(path, mode)?;
        allocate(&file, len, flags.contains(MapFlags::SPARSE))?;
        (file, len)
    } else if flags.contains(MapFlags::CREATE) {
        if len == 0 {
            return Err(usage("CREATE requires a non-zero length"));
        }
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).mode(mode);
        if flags.contains(MapFlags::EXCLUSIVE) {
            opts.create_new(true);
        } else {
            opts.create(true);
        }
        let file = opts.open(path).map_err(Error::Map)?;
        allocate(&file, len, flags.contains(MapFlags::SPARSE))?;
        (file, len)
    } else {
        if len != 0 {
            return Err(usage("length must be 0 when mapping an existing file"));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(Error::Map)?;
        let size = file.metadata().map_err(Error::Map)?.len();
        let size = usize::try_from(size).map_err(|_| usage("file too large to map"))?;
        if size == 0 {
            return Err(usage("cannot map an empty file"));
        }
        (file, size)
    };

    let raw = RawMap::map(&file, map_len)?;
    tracing::trace!(
        path = %path.display(),
        len = map_len,
        is_pmem = raw.is_pmem(),
        "mapped file"
    );
    Ok(MappedRegion::new(raw))
}

#[cfg(target_os = "linux")]
fn open_tempfile(dir: &Path, mode: u32) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_TMPFILE)
        .mode(mode)
        .open(dir)
        .map_err(Error::Map)
}

#[cfg(not(target_os = "linux"))]
fn open_tempfile(_dir: &Path, _mode: u32) -> Result<File> {
    Err(Error::Map(io::Error::new(
        io::ErrorKind::Unsupported,
        "TEMPFILE requires O_TMPFILE support",
    )))
}

#[cfg(target_os = "linux")]
fn allocate(file: &File, len: usize, sparse: bool) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    if sparse {
        return file.set_len(len as u64).map_err(Error::Map);
    }
    let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len as libc::off_t) };
    match rc {
        0 => Ok(()),
        // Filesystems without allocation support; plain truncation still
        // sizes the file.
        libc::EOPNOTSUPP | libc::EINVAL => file.set_len(len as u64).map_err(Error::Map),
        err => Err(Error::Map(io::Error::from_raw_os_error(err))),
    }
}

#[cfg(not(target_os = "linux"))]
fn allocate(file: &File, len: usize, _sparse: bool) -> Result<()> {
    file.set_len(len as u64).map_err(Error::Map)
}

fn usage(msg: &'static str) -> Error {
    Error::Map(io::Error::new(io::ErrorKind::InvalidInput, msg))
}

/// Whether the CPU supports a true hardware drain instruction for
/// persistent memory, rather than falling back to a store fence.
/// Process-wide; computed once.
pub fn has_hw_drain() -> bool {
    hw::has_hw_drain()
}

/// Wait for in-flight persistent-memory stores to reach the persistence
/// domain. Only meaningful after one or more flushes.
pub fn drain() {
    hw::drain();
}

/// Check that this crate satisfies the interface version a caller was
/// written against. A failure is descriptive and always recoverable.
pub fn check_version(major_required: u32, minor_required: u32) -> Result<()> {
    if major_required != VERSION_MAJOR {
        return Err(Error::Version(format!(
            "pmem major version mismatch (required {major_required}, available {VERSION_MAJOR})"
        )));
    }
    if minor_required > VERSION_MINOR {
        return Err(Error::Version(format!(
            "pmem minor version {minor_required} not available (have {VERSION_MINOR})"
        )));
    }
    Ok(())
}

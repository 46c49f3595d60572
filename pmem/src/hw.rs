//! OS and CPU entry points behind the persistence protocol.
//!
//! Everything process-wide (which cache-line flush instruction to use,
//! whether a hardware drain exists) is detected once and cached; everything
//! per-mapping lives on [`RawMap`].

use std::fs::File;
use std::io;
use std::mem::ManuallyDrop;
use std::sync::atomic::{fence, Ordering};
use std::sync::OnceLock;

use memmap2::MmapOptions;

use crate::{Error, Result};

/// Flush granularity of every CPU this crate targets.
pub(crate) const CACHELINE: usize = 64;

const PAGE: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FlushKind {
    /// CLFLUSHOPT, weakly ordered against stores; must be paired with a
    /// drain before durability can be claimed.
    ClflushOpt,
    /// CLFLUSH on CPUs predating CLFLUSHOPT.
    Clflush,
    /// No cache-line primitive on this target; a full fence is the best
    /// available ordering and durability is carried by `msync`.
    Fence,
}

struct HwCaps {
    flush: FlushKind,
    has_hw_drain: bool,
}

fn caps() -> &'static HwCaps {
    static CAPS: OnceLock<HwCaps> = OnceLock::new();
    CAPS.get_or_init(|| {
        let flush = detect_flush();
        tracing::debug!(?flush, "selected cache flush primitive");
        HwCaps {
            flush,
            // PCOMMIT was withdrawn before shipping; no current platform
            // reports a hardware drain instruction.
            has_hw_drain: false,
        }
    })
}

#[cfg(target_arch = "x86_64")]
fn detect_flush() -> FlushKind {
    // CPUID leaf 7, sub-leaf 0: EBX bit 23 reports CLFLUSHOPT.
    let leaf = core::arch::x86_64::__cpuid_count(7, 0);
    if leaf.ebx & (1 << 23) != 0 {
        FlushKind::ClflushOpt
    } else {
        FlushKind::Clflush
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn detect_flush() -> FlushKind {
    FlushKind::Fence
}

/// Whether the platform has a true hardware drain instruction.
pub(crate) fn has_hw_drain() -> bool {
    caps().has_hw_drain
}

/// Flush the processor cache lines covering `[ptr, ptr + len)`.
///
/// Does not wait for the stores to reach the persistence domain; pair with
/// [`drain`]. Defined to never fail.
pub(crate) fn flush(ptr: *const u8, len: usize) {
    if len == 0 {
        return;
    }
    match caps().flush {
        #[cfg(target_arch = "x86_64")]
        FlushKind::ClflushOpt => unsafe { flush_clflushopt(ptr, len) },
        #[cfg(target_arch = "x86_64")]
        FlushKind::Clflush => unsafe { flush_clflush(ptr, len) },
        #[cfg(not(target_arch = "x86_64"))]
        FlushKind::ClflushOpt | FlushKind::Clflush => unreachable!(),
        FlushKind::Fence => fence(Ordering::SeqCst),
    }
}

/// Wait for in-flight persistent-memory stores to reach the persistence
/// domain. Defined to never fail.
pub(crate) fn drain() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_mm_sfence()
    };
    #[cfg(not(target_arch = "x86_64"))]
    fence(Ordering::SeqCst);
}

#[cfg(target_arch = "x86_64")]
unsafe fn flush_clflushopt(ptr: *const u8, len: usize) {
    let mut line = ptr as usize & !(CACHELINE - 1);
    let end = ptr as usize + len;
    while line < end {
        core::arch::asm!("clflushopt [{0}]", in(reg) line as *const u8);
        line += CACHELINE;
    }
}

#[cfg(target_arch = "x86_64")]
unsafe fn flush_clflush(ptr: *const u8, len: usize) {
    let mut line = ptr as usize & !(CACHELINE - 1);
    let end = ptr as usize + len;
    while line < end {
        core::arch::x86_64::_mm_clflush(line as *const u8);
        line += CACHELINE;
    }
}

pub(crate) fn page_align_up(len: usize) -> usize {
    len.div_ceil(PAGE) * PAGE
}

#[derive(Debug)]
enum Backing {
    /// MAP_SYNC mapping owned directly; released with `munmap`.
    Dax,
    /// Ordinary page-cache mapping owned by memmap2.
    Page(memmap2::MmapRaw),
}

/// An established mapping of a file into the address space.
///
/// This is the opaque backend handle the higher layers build on: it knows
/// its address, its length, whether true persistent-memory semantics apply,
/// and how to flush itself. The mapping is released on drop with any
/// `munmap` error ignored; call [`RawMap::unmap`] to observe it.
#[derive(Debug)]
pub struct RawMap {
    ptr: *mut u8,
    len: usize,
    mapped_len: usize,
    is_pmem: bool,
    backing: Backing,
}

// The mapping is owned; shared mutation through `&self` raw-pointer writes
// is the caller's concern, exactly as with `memmap2::MmapRaw`.
unsafe impl Send for RawMap {}
unsafe impl Sync for RawMap {}

impl RawMap {
    /// Map `len` bytes of an open file.
    ///
    /// Tries a `MAP_SYNC` mapping first; success means the range is true
    /// persistent memory. Anything else falls back to a page-cache-backed
    /// mapping with `msync` durability.
    pub fn map(file: &File, len: usize) -> Result<Self> {
        #[cfg(target_os = "linux")]
        if let Some(map) = Self::try_map_sync(file, len) {
            return Ok(map);
        }

        let raw = MmapOptions::new()
            .len(len)
            .map_raw(file)
            .map_err(Error::Map)?;
        let ptr = raw.as_mut_ptr();
        Ok(RawMap {
            ptr,
            len,
            mapped_len: page_align_up(len),
            is_pmem: false,
            backing: Backing::Page(raw),
        })
    }

    #[cfg(target_os = "linux")]
    fn try_map_sync(file: &File, len: usize) -> Option<Self> {
        use std::os::unix::io::AsRawFd;

        let mapped_len = page_align_up(len);
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED_VALIDATE | libc::MAP_SYNC,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            // Not DAX-backed (EOPNOTSUPP/EINVAL). Real mapping failures
            // resurface from the fallback path with errno intact.
            return None;
        }
        Some(RawMap {
            ptr: ptr.cast(),
            len,
            mapped_len,
            is_pmem: true,
            backing: Backing::Dax,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Length actually mapped; may exceed [`RawMap::len`] due to page
    /// rounding.
    pub fn mapped_len(&self) -> usize {
        self.mapped_len
    }

    /// Whether hardware persistence semantics apply to this range.
    pub fn is_pmem(&self) -> bool {
        self.is_pmem
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }

    fn check_range(&self, offset: usize, len: usize) {
        let end = offset
            .checked_add(len)
            .expect("range end overflows usize");
        assert!(end <= self.len, "range past end of mapping");
    }

    /// Copy `data` into the mapping at `offset`. Does not flush.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        self.check_range(offset, data.len());
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(offset), data.len()) }
    }

    /// Copy bytes at `offset` out of the mapping.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) {
        self.check_range(offset, out.len());
        unsafe { std::ptr::copy_nonoverlapping(self.ptr.add(offset), out.as_mut_ptr(), out.len()) }
    }

    /// Borrow mapped bytes directly.
    ///
    /// # Safety
    ///
    /// The caller must guarantee no concurrent `write_at` to the same range
    /// for the lifetime of the slice.
    pub unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        self.check_range(offset, len);
        std::slice::from_raw_parts(self.ptr.add(offset), len)
    }

    /// Volatile aligned 8-byte load, decoded from the on-media little
    /// endian representation.
    pub fn read_u64_at(&self, offset: usize) -> u64 {
        self.check_range(offset, 8);
        assert!(offset % 8 == 0, "unaligned u64 load");
        u64::from_le(unsafe { (self.ptr.add(offset) as *const u64).read_volatile() })
    }

    /// Volatile aligned 8-byte store. A single aligned store is the unit
    /// of crash atomicity the pool layouts rely on. Does not flush.
    pub fn write_u64_at(&self, offset: usize, value: u64) {
        self.check_range(offset, 8);
        assert!(offset % 8 == 0, "unaligned u64 store");
        unsafe { (self.ptr.add(offset) as *mut u64).write_volatile(value.to_le()) }
    }

    pub fn read_u32_at(&self, offset: usize) -> u32 {
        self.check_range(offset, 4);
        assert!(offset % 4 == 0, "unaligned u32 load");
        u32::from_le(unsafe { (self.ptr.add(offset) as *const u32).read_volatile() })
    }

    pub fn write_u32_at(&self, offset: usize, value: u32) {
        self.check_range(offset, 4);
        assert!(offset % 4 == 0, "unaligned u32 store");
        unsafe { (self.ptr.add(offset) as *mut u32).write_volatile(value.to_le()) }
    }

    /// Flush cache lines covering the range. Never fails; pair with
    /// [`RawMap::drain`].
    pub fn flush(&self, offset: usize, len: usize) {
        self.check_range(offset, len);
        flush(unsafe { self.ptr.add(offset) }, len);
    }

    /// Wait for flushed stores to reach the persistence domain.
    pub fn drain(&self) {
        drain();
    }

    /// `flush` followed by `drain`; the one call for "make this pmem range
    /// durable".
    pub fn persist(&self, offset: usize, len: usize) {
        self.flush(offset, len);
        self.drain();
    }

    /// Write modified pages in the range back to the file.
    pub fn msync(&self, offset: usize, len: usize) -> Result<()> {
        self.check_range(offset, len);
        match &self.backing {
            Backing::Page(map) => map.flush_range(offset, len).map_err(Error::Sync),
            Backing::Dax => {
                let addr = self.ptr as usize + offset;
                let aligned = addr & !(PAGE - 1);
                let rc = unsafe {
                    libc::msync(aligned as *mut _, len + (addr - aligned), libc::MS_SYNC)
                };
                if rc != 0 {
                    return Err(Error::Sync(io::Error::last_os_error()));
                }
                Ok(())
            }
        }
    }

    /// The canonical durability decision: `persist` when the range is true
    /// persistent memory, `msync` otherwise.
    pub fn persist_or_msync(&self, offset: usize, len: usize) -> Result<()> {
        if self.is_pmem {
            self.persist(offset, len);
            Ok(())
        } else {
            self.msync(offset, len)
        }
    }

    /// Release the mapping, reporting any OS failure.
    pub fn unmap(self) -> Result<()> {
        let this = ManuallyDrop::new(self);
        // Safety: `this` is never dropped, so the backing is moved out
        // exactly once.
        let backing = unsafe { std::ptr::read(&this.backing) };
        match backing {
            Backing::Dax => {
                let rc = unsafe { libc::munmap(this.ptr.cast(), this.mapped_len) };
                if rc != 0 {
                    return Err(Error::Unmap(io::Error::last_os_error()));
                }
                Ok(())
            }
            Backing::Page(map) => {
                drop(map);
                Ok(())
            }
        }
    }
}

impl Drop for RawMap {
    fn drop(&mut self) {
        if let Backing::Dax = self.backing {
            // Errors cannot surface from drop; `unmap` reports them.
            unsafe { libc::munmap(self.ptr.cast(), self.mapped_len) };
        }
    }
}

//! Sequential cursor view over a persistent mapping.

use crate::hw::RawMap;
use crate::{Error, Result};

/// A mapped byte range with a read/write cursor.
///
/// Writes land in the mapping immediately but carry no durability
/// guarantee until [`MappedRegion::persist`] (true pmem) or
/// [`MappedRegion::msync`] (page-cache mapping); [`MappedRegion::sync`]
/// picks the right one. Consuming [`MappedRegion::unmap`] /
/// [`MappedRegion::close`] make use-after-unmap unrepresentable.
#[derive(Debug)]
pub struct MappedRegion {
    map: RawMap,
    pos: usize,
}

impl MappedRegion {
    pub(crate) fn new(map: RawMap) -> Self {
        MappedRegion { map, pos: 0 }
    }

    /// Usable length in bytes.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Length actually mapped; may exceed [`MappedRegion::len`] due to page
    /// alignment.
    pub fn mapped_len(&self) -> usize {
        self.map.mapped_len()
    }

    /// Current cursor position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Whether the whole range has hardware persistence semantics.
    ///
    /// Decided when the mapping is established: a `MAP_SYNC` mapping is
    /// persistent memory for as long as it exists, and anything else went
    /// through the page-cache fallback. The answer cannot change until the
    /// region is unmapped and the file remapped.
    pub fn is_pmem(&self) -> bool {
        self.map.is_pmem()
    }

    /// Write `data` at the cursor and advance it. Empty input is a no-op.
    ///
    /// Fails with [`Error::OutOfRange`] before touching memory when the
    /// write would cross the end of the region; the cursor is left
    /// unchanged in that case.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = self.bounded_end(data.len())?;
        self.map.write_at(self.pos, data);
        self.pos = end;
        Ok(())
    }

    /// Read `size` bytes at the cursor and advance it.
    ///
    /// `size == 0` reads to the end of the region and fails with
    /// [`Error::EndOfRegion`] if the cursor is already there. A non-zero
    /// `size` past the end fails with [`Error::OutOfRange`] and leaves the
    /// cursor unchanged.
    pub fn read(&mut self, size: usize) -> Result<Vec<u8>> {
        let size = if size == 0 {
            if self.pos >= self.len() {
                return Err(Error::EndOfRegion);
            }
            self.len() - self.pos
        } else {
            size
        };

        let end = self.bounded_end(size)?;
        let mut out = vec![0; size];
        self.map.read_at(self.pos, &mut out);
        self.pos = end;
        Ok(out)
    }

    /// Move the cursor to `pos`, which must lie in `0..=len`.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.len() {
            return Err(Error::InvalidPosition {
                pos,
                len: self.len(),
            });
        }
        self.pos = pos;
        Ok(())
    }

    fn bounded_end(&self, len: usize) -> Result<usize> {
        match self.pos.checked_add(len) {
            Some(end) if end <= self.len() => Ok(end),
            _ => Err(Error::OutOfRange {
                pos: self.pos,
                len,
                capacity: self.len(),
            }),
        }
    }

    /// Flush processor cache lines covering the region. Never fails and
    /// does not wait for persistence; pair with [`MappedRegion::drain`].
    pub fn flush(&self) {
        self.map.flush(0, self.len());
    }

    /// Wait for flushed stores to reach the persistence domain.
    pub fn drain(&self) {
        self.map.drain();
    }

    /// `flush` + `drain` over the whole region.
    pub fn persist(&self) {
        self.map.persist(0, self.len());
    }

    /// Write modified pages back to the file; the durability fallback when
    /// [`MappedRegion::is_pmem`] is false.
    pub fn msync(&self) -> Result<()> {
        self.map.msync(0, self.len())
    }

    /// `persist` when the region is true persistent memory, `msync`
    /// otherwise. The single durability entry point for callers that do
    /// not want to branch on media type.
    pub fn sync(&self) -> Result<()> {
        self.map.persist_or_msync(0, self.len())
    }

    /// Release the mapping without flushing anything.
    pub fn unmap(self) -> Result<()> {
        self.map.unmap()
    }

    /// Success-path teardown: make the region durable, then unmap.
    ///
    /// On a sync failure the error is returned and the mapping is released
    /// unflushed; callers that must not lose the mapping should call
    /// [`MappedRegion::sync`] and [`MappedRegion::unmap`] separately.
    pub fn close(self) -> Result<()> {
        self.sync()?;
        self.map.unmap()
    }
}

//! On-media layout of a block pool.
//!
//! Header page, then a translation map of one little-endian u32 entry per
//! logical block, then a page-aligned data area holding one physical block
//! more than the logical count. An entry carries a 30-bit physical block
//! index and a 2-bit state; rewriting a block means filling the spare
//! physical block and swapping one map entry, so a block write is published
//! by a single aligned 4-byte store.

pub const HEADER_LEN: usize = 4096;
pub const MAGIC: [u8; 8] = *b"RPMBLK\0\0";
pub const FORMAT_VERSION: u32 = 1;
pub const HEADER_PREFIX: usize = 36;

/// Spare physical blocks beyond the logical block count.
pub const NFREE: u64 = 1;

pub const STATE_NORMAL: u32 = 0;
pub const STATE_ZERO: u32 = 1;
pub const STATE_ERROR: u32 = 2;

const STATE_SHIFT: u32 = 30;
const PHYS_MASK: u32 = (1 << STATE_SHIFT) - 1;

pub fn entry_new(phys: u32, state: u32) -> u32 {
    debug_assert!(phys <= PHYS_MASK);
    debug_assert!(state <= STATE_ERROR);
    phys | (state << STATE_SHIFT)
}

pub fn entry_phys(entry: u32) -> u32 {
    entry & PHYS_MASK
}

pub fn entry_state(entry: u32) -> u32 {
    entry >> STATE_SHIFT
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub bsize: u32,
    pub nblock: u64,
    /// Page-aligned start of the data area.
    pub data_off: u64,
}

impl Geometry {
    pub fn nphys(&self) -> u64 {
        self.nblock + NFREE
    }

    pub fn map_entry_off(&self, block_no: u64) -> usize {
        HEADER_LEN + 4 * block_no as usize
    }

    pub fn block_off(&self, phys: u32) -> usize {
        self.data_off as usize + phys as usize * self.bsize as usize
    }

    pub fn end(&self) -> u64 {
        self.data_off + self.nphys() * self.bsize as u64
    }
}

fn page_align(len: u64) -> u64 {
    len.div_ceil(4096) * 4096
}

fn fits(pool_size: u64, bsize: u64, nblock: u64) -> bool {
    let map_end = page_align(HEADER_LEN as u64 + 4 * nblock);
    match (nblock + NFREE).checked_mul(bsize) {
        Some(data) => map_end.checked_add(data).is_some_and(|end| end <= pool_size),
        None => false,
    }
}

/// Largest geometry fitting in `pool_size`, or `None` when not even one
/// block fits. `nblock` always undercuts `pool_size / bsize` because the
/// header, the map, and the spare block all charge against the pool.
pub fn geometry(pool_size: u64, bsize: u32) -> Option<Geometry> {
    if bsize == 0 {
        return None;
    }
    let mut nblock = pool_size / (bsize as u64 + 4);
    while nblock > 0 && !fits(pool_size, bsize as u64, nblock) {
        nblock -= 1;
    }
    if nblock == 0 {
        return None;
    }
    Some(Geometry {
        bsize,
        nblock,
        data_off: page_align(HEADER_LEN as u64 + 4 * nblock),
    })
}

pub fn encode(geo: &Geometry) -> [u8; HEADER_PREFIX] {
    let mut buf = [0u8; HEADER_PREFIX];
    buf[0..8].copy_from_slice(&MAGIC);
    buf[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf[12..16].copy_from_slice(&geo.bsize.to_le_bytes());
    buf[16..24].copy_from_slice(&geo.nblock.to_le_bytes());
    buf[24..32].copy_from_slice(&geo.data_off.to_le_bytes());
    let crc = crc32fast::hash(&buf[0..32]);
    buf[32..36].copy_from_slice(&crc.to_le_bytes());
    buf
}

pub fn decode(buf: &[u8]) -> Result<Geometry, &'static str> {
    if buf.len() < HEADER_PREFIX {
        return Err("header truncated");
    }
    if buf[0..8] != MAGIC {
        return Err("bad magic");
    }
    let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err("unsupported format version");
    }
    let crc = u32::from_le_bytes(buf[32..36].try_into().unwrap());
    if crc != crc32fast::hash(&buf[0..32]) {
        return Err("header checksum mismatch");
    }
    Ok(Geometry {
        bsize: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        nblock: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        data_off: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
    })
}

pub fn validate(geo: &Geometry, file_len: u64) -> Result<(), &'static str> {
    if geo.bsize == 0 {
        return Err("zero block size");
    }
    if geo.nblock == 0 {
        return Err("pool has no usable blocks");
    }
    if geo.data_off != page_align(HEADER_LEN as u64 + 4 * geo.nblock) {
        return Err("data area offset disagrees with block count");
    }
    if geo.end() > file_len {
        return Err("data area past end of file");
    }
    Ok(())
}

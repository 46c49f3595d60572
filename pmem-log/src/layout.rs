//! On-media layout of a log pool.
//!
//! One 4 KiB header page followed by the raw log bytes. The checksum covers
//! only the immutable prefix; the write-offset word changes on every append
//! and is published by a single aligned 8-byte store instead.

pub const HEADER_LEN: usize = 4096;
pub const MAGIC: [u8; 8] = *b"RPMLOG\0\0";
pub const FORMAT_VERSION: u32 = 1;

/// Length of the meaningful header prefix (through the write-offset word).
pub const HEADER_PREFIX: usize = 40;

/// Byte offset of the durable write pointer. 8-byte aligned so that a
/// single store is the commit point of an append.
pub const WRITE_OFF: usize = 32;

pub struct Decoded {
    pub capacity: u64,
    pub write_offset: u64,
}

pub fn encode(capacity: u64) -> [u8; HEADER_PREFIX] {
    let mut buf = [0u8; HEADER_PREFIX];
    buf[0..8].copy_from_slice(&MAGIC);
    buf[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    // 12..16 reserved
    buf[16..24].copy_from_slice(&capacity.to_le_bytes());
    let crc = crc32fast::hash(&buf[0..24]);
    buf[24..28].copy_from_slice(&crc.to_le_bytes());
    // 28..32 pad, 32..40 write offset: zero on a fresh pool
    buf
}

pub fn decode(buf: &[u8]) -> Result<Decoded, &'static str> {
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
    let crc = u32::from_le_bytes(buf[24..28].try_into().unwrap());
    if crc != crc32fast::hash(&buf[0..24]) {
        return Err("header checksum mismatch");
    }
    let capacity = u64::from_le_bytes(buf[16..24].try_into().unwrap());
    let write_offset = u64::from_le_bytes(buf[32..40].try_into().unwrap());
    Ok(Decoded {
        capacity,
        write_offset,
    })
}

pub fn validate(decoded: &Decoded, file_len: u64) -> Result<(), &'static str> {
    if decoded.capacity != file_len.saturating_sub(HEADER_LEN as u64) {
        return Err("capacity disagrees with file size");
    }
    if decoded.capacity == 0 {
        return Err("pool has no usable space");
    }
    if decoded.write_offset > decoded.capacity {
        return Err("write offset past capacity");
    }
    Ok(())
}

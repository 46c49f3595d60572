use std::io;

use thiserror::Error;

/// Errors reported by the mapping layer and the persistence protocol.
///
/// `flush`/`drain`/`persist` never fail observably and therefore have no
/// representation here; only OS-level calls and bounds checks do.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The OS refused to create or map the file.
    #[error("failed to map file: {0}")]
    Map(#[source] io::Error),
    /// The OS refused to tear the mapping down.
    #[error("failed to unmap region: {0}")]
    Unmap(#[source] io::Error),
    /// `msync` failed while writing pages back to the file.
    #[error("msync failed: {0}")]
    Sync(#[source] io::Error),
    /// A read or write would cross the end of the region.
    #[error("range [{pos}, {pos}+{len}) exceeds region length {capacity}")]
    OutOfRange {
        pos: usize,
        len: usize,
        capacity: usize,
    },
    /// A seek target outside `0..=len`.
    #[error("position {pos} exceeds region length {len}")]
    InvalidPosition { pos: usize, len: usize },
    /// A read was requested with the cursor already at the end.
    #[error("cursor is at the end of the region")]
    EndOfRegion,
    /// The library does not satisfy a required interface version.
    #[error("{0}")]
    Version(String),
}

pub type Result<T> = core::result::Result<T, Error>;

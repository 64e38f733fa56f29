//! Storage layer: sector-aligned I/O and platform device queries.
//!
//! This module handles:
//! - Blockwise reads/writes with read-modify-write of partial sectors
//! - Kernel queries for size, topology and read-only state
//! - Locating kernel holders and mounts of a device

pub mod block_io;

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "linux")]
pub(crate) use linux as platform;

#[cfg(not(target_os = "linux"))]
pub(crate) mod fallback;
#[cfg(not(target_os = "linux"))]
pub(crate) use fallback as platform;

pub use block_io::{BlockDevice, BlockOpen};

use crate::config::DEFAULT_MEM_ALIGNMENT;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

/// I/O topology reported by a block device, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Topology {
    pub min_io: u64,
    pub opt_io: u64,
    pub alignment_offset: u64,
}

/// System page size, or the default memory alignment if unknown.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size)
        .ok()
        .filter(|s| s.is_power_of_two())
        .unwrap_or(DEFAULT_MEM_ALIGNMENT)
}

/// Buffer alignment used for direct I/O.
pub(crate) fn mem_alignment() -> usize {
    page_size().max(DEFAULT_MEM_ALIGNMENT)
}

pub(crate) fn is_block_device(path: &Path) -> io::Result<bool> {
    Ok(std::fs::metadata(path)?.file_type().is_block_device())
}

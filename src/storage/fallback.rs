//! Stand-ins for platforms without Linux block device ioctls.
//!
//! Only regular image files are fully supported here.

use super::Topology;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

pub const DIRECT_FLAGS: libc::c_int = libc::O_SYNC;

fn unsupported() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "block device queries are only available on Linux",
    )
}

pub fn sector_size(_file: &File) -> io::Result<u32> {
    Err(unsupported())
}

pub fn size_bytes(_file: &File) -> io::Result<u64> {
    Err(unsupported())
}

pub fn is_read_only(_file: &File) -> io::Result<bool> {
    Ok(false)
}

pub fn read_ahead(_file: &File) -> io::Result<u32> {
    Err(unsupported())
}

pub fn topology(_file: &File) -> Topology {
    Topology::default()
}

pub fn dev_numbers(rdev: u64) -> (u32, u32) {
    (((rdev >> 24) & 0xff) as u32, (rdev & 0xff_ffff) as u32)
}

pub fn rotational(_major: u32, _minor: u32) -> Option<bool> {
    None
}

pub fn holders(_major: u32, _minor: u32) -> io::Result<Vec<String>> {
    Ok(Vec::new())
}

pub fn dm_uuid(_holder: &str) -> Option<String> {
    None
}

pub fn holder_dev_id(_holder: &str) -> Option<String> {
    None
}

pub fn uevent_devname(_dev_id: &str) -> Option<String> {
    None
}

pub fn mount_points(_device: &Path) -> io::Result<Vec<PathBuf>> {
    Ok(Vec::new())
}

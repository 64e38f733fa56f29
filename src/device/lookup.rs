//! Resolve kernel device numbers to device node paths.

use crate::storage::platform;
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

/// Maps a `major:minor` pair to a device node.
pub trait DeviceLookup: Send + Sync {
    fn lookup(&self, major: u32, minor: u32) -> Option<PathBuf>;
}

/// Lookup through sysfs uevent files, falling back to scanning device nodes.
#[derive(Debug, Clone)]
pub struct SysfsLookup {
    dev_dir: PathBuf,
}

impl SysfsLookup {
    pub fn new() -> Self {
        Self::with_dev_dir("/dev")
    }

    /// Use a different device directory (for tests and chroots).
    pub fn with_dev_dir(dev_dir: impl Into<PathBuf>) -> Self {
        Self {
            dev_dir: dev_dir.into(),
        }
    }

    fn scan(&self, dir: &Path, major: u32, minor: u32) -> Option<PathBuf> {
        let entries = fs::read_dir(dir).ok()?;
        entries.flatten().map(|e| e.path()).find(|path| {
            // symlink_metadata so /dev/disk/by-* style links are skipped.
            fs::symlink_metadata(path)
                .map(|m| {
                    m.file_type().is_block_device()
                        && platform::dev_numbers(m.rdev()) == (major, minor)
                })
                .unwrap_or(false)
        })
    }
}

impl Default for SysfsLookup {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceLookup for SysfsLookup {
    fn lookup(&self, major: u32, minor: u32) -> Option<PathBuf> {
        if let Some(name) = platform::uevent_devname(&format!("{}:{}", major, minor)) {
            let path = self.dev_dir.join(name);
            if path.exists() {
                return Some(path);
            }
        }
        // Prefer the friendly mapper name for device-mapper nodes.
        self.scan(&self.dev_dir.join("mapper"), major, minor)
            .or_else(|| self.scan(&self.dev_dir, major, minor))
    }
}

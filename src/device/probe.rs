//! Probing device state from the running system.

use super::lookup::{DeviceLookup, SysfsLookup};
use crate::config::SECTOR_SIZE;
use crate::error::{Error, Result};
use crate::storage::{platform, Topology};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Prefix of device-mapper UUIDs owned by dm-crypt mappings.
const CRYPT_UUID_PREFIX: &str = "CRYPT-";

/// Raw facts about a device, as probed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFacts {
    /// Size in bytes.
    pub size: u64,
    pub read_only: bool,
    /// `None` when the kernel does not say.
    pub rotational: Option<bool>,
    pub sector_size: u32,
    pub topology: Topology,
    /// Read-ahead in 512-byte sectors.
    pub read_ahead: Option<u32>,
    pub is_block_device: bool,
}

impl DeviceFacts {
    /// Facts for a plain image file of `size` bytes.
    pub fn image(size: u64) -> Self {
        Self {
            size,
            read_only: false,
            rotational: None,
            sector_size: SECTOR_SIZE as u32,
            topology: Topology::default(),
            read_ahead: None,
            is_block_device: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimKind {
    Exclusive,
    Shared,
}

/// Someone else's use of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub holder: String,
    pub kind: ClaimKind,
}

impl Claim {
    pub fn exclusive(holder: impl Into<String>) -> Self {
        Self {
            holder: holder.into(),
            kind: ClaimKind::Exclusive,
        }
    }

    pub fn shared(holder: impl Into<String>) -> Self {
        Self {
            holder: holder.into(),
            kind: ClaimKind::Shared,
        }
    }
}

/// Source of device facts and claims.
pub trait DeviceProbe: Send + Sync {
    fn inspect(&self, path: &Path) -> Result<DeviceFacts>;

    /// Current claims on the device by other holders.
    fn claims(&self, path: &Path) -> Result<Vec<Claim>>;
}

/// Probe backed by ioctls, sysfs, the mount table and `flock`.
pub struct SystemProbe {
    lookup: Box<dyn DeviceLookup>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self::with_lookup(Box::new(SysfsLookup::new()))
    }

    pub fn with_lookup(lookup: Box<dyn DeviceLookup>) -> Self {
        Self { lookup }
    }

    fn inspect_block(&self, path: &Path, meta: &fs::Metadata) -> Result<DeviceFacts> {
        let file = File::open(path).map_err(|e| Error::not_ready(path, e.to_string()))?;
        let (major, minor) = platform::dev_numbers(meta.rdev());
        Ok(DeviceFacts {
            size: platform::size_bytes(&file)?,
            read_only: platform::is_read_only(&file).unwrap_or(false),
            rotational: platform::rotational(major, minor),
            sector_size: platform::sector_size(&file).unwrap_or(SECTOR_SIZE as u32),
            topology: platform::topology(&file),
            read_ahead: platform::read_ahead(&file).ok(),
            is_block_device: true,
        })
    }

    fn describe_holder(&self, holder: &str) -> String {
        let node = platform::holder_dev_id(holder).and_then(|id| {
            let (major, minor) = id.split_once(':')?;
            self.lookup.lookup(major.parse().ok()?, minor.parse().ok()?)
        });
        match node {
            Some(node) => format!("held by {}", node.display()),
            None => format!("held by {}", holder),
        }
    }

    fn block_claims(&self, path: &Path, meta: &fs::Metadata) -> Result<Vec<Claim>> {
        let (major, minor) = platform::dev_numbers(meta.rdev());
        let mut claims = Vec::new();

        for holder in platform::holders(major, minor)? {
            let crypt = platform::dm_uuid(&holder)
                .map(|uuid| uuid.starts_with(CRYPT_UUID_PREFIX))
                .unwrap_or(false);
            let description = self.describe_holder(&holder);
            claims.push(if crypt {
                Claim::shared(description)
            } else {
                Claim::exclusive(description)
            });
        }

        for mount in platform::mount_points(path)? {
            claims.push(Claim::exclusive(format!("mounted on {}", mount.display())));
        }

        if claims.is_empty() {
            let excl = OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_EXCL)
                .open(path);
            if let Err(e) = excl {
                if e.raw_os_error() == Some(libc::EBUSY) {
                    claims.push(Claim::exclusive("exclusive open by another process"));
                } else {
                    return Err(Error::not_ready(path, e.to_string()));
                }
            }
        }
        Ok(claims)
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceProbe for SystemProbe {
    fn inspect(&self, path: &Path) -> Result<DeviceFacts> {
        let meta = fs::metadata(path).map_err(|e| Error::not_ready(path, e.to_string()))?;
        let file_type = meta.file_type();

        if file_type.is_block_device() {
            self.inspect_block(path, &meta)
        } else if file_type.is_file() {
            let mut facts = DeviceFacts::image(meta.len());
            facts.read_only = image_read_only(path)?;
            Ok(facts)
        } else {
            Err(Error::not_ready(path, "not a block device or image file"))
        }
    }

    fn claims(&self, path: &Path) -> Result<Vec<Claim>> {
        let meta = fs::metadata(path).map_err(|e| Error::not_ready(path, e.to_string()))?;
        if meta.file_type().is_block_device() {
            self.block_claims(path, &meta)
        } else {
            flock_claims(path)
        }
    }
}

fn image_read_only(path: &Path) -> Result<bool> {
    match OpenOptions::new().read(true).write(true).open(path) {
        Ok(_) => Ok(false),
        Err(e) => match e.raw_os_error() {
            Some(libc::EROFS) | Some(libc::EACCES) | Some(libc::EPERM) => Ok(true),
            _ => Err(Error::not_ready(path, e.to_string())),
        },
    }
}

fn try_flock(file: &File, op: libc::c_int) -> io::Result<bool> {
    // SAFETY: the descriptor is valid for the lifetime of `file`.
    let rc = unsafe { libc::flock(file.as_raw_fd(), op | libc::LOCK_NB) };
    if rc == 0 {
        // SAFETY: as above.
        unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err)
    }
}

/// Claims on an image file, read from advisory locks held by others.
fn flock_claims(path: &Path) -> Result<Vec<Claim>> {
    let file = File::open(path).map_err(|e| Error::not_ready(path, e.to_string()))?;
    if try_flock(&file, libc::LOCK_EX)? {
        return Ok(Vec::new());
    }
    if try_flock(&file, libc::LOCK_SH)? {
        Ok(vec![Claim::shared("shared lock held by another process")])
    } else {
        Ok(vec![Claim::exclusive("exclusive lock held by another process")])
    }
}

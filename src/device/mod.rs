//! Device readiness, exclusivity and alignment checks.
//!
//! Nothing here is cached. Every call probes the device again, so results
//! reflect the system at the time of the call. A holder can still appear
//! between validation and the caller's open; opening block devices with
//! `O_EXCL` afterwards closes most of that window.

mod lookup;
mod probe;

pub use lookup::{DeviceLookup, SysfsLookup};
pub use probe::{Claim, ClaimKind, DeviceFacts, DeviceProbe, SystemProbe};

use crate::error::{Error, Result};
use crate::logging::Diagnostics;
use crate::storage::{BlockDevice, BlockOpen};
use std::ops::BitOr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Exclusivity requirement of a validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCheck {
    /// Ignore other holders.
    Ok,
    /// Fail on any other holder.
    RequireExclusive,
    /// Fail only on an exclusive holder.
    AllowShared,
}

/// Summary of other holders at validation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusivityState {
    Free,
    ExclusiveHeld,
    SharedInUse,
}

impl ExclusivityState {
    pub fn from_claims(claims: &[Claim]) -> Self {
        if claims.iter().any(|c| c.kind == ClaimKind::Exclusive) {
            ExclusivityState::ExclusiveHeld
        } else if claims.is_empty() {
            ExclusivityState::Free
        } else {
            ExclusivityState::SharedInUse
        }
    }
}

/// Activation flags adjusted by validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DeviceFlags(u32);

impl DeviceFlags {
    pub const READ_ONLY: DeviceFlags = DeviceFlags(1);

    pub const fn empty() -> Self {
        DeviceFlags(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: DeviceFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for DeviceFlags {
    type Output = DeviceFlags;

    fn bitor(self, rhs: DeviceFlags) -> DeviceFlags {
        DeviceFlags(self.0 | rhs.0)
    }
}

/// A validated device with offset and size adjusted for alignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub path: PathBuf,
    /// Usable size in bytes from `offset`.
    pub size: u64,
    /// Aligned start offset in bytes.
    pub offset: u64,
    pub alignment: u64,
    pub alignment_offset: u64,
    pub sector_size: u32,
    pub rotational: Option<bool>,
    /// Read-ahead in 512-byte sectors.
    pub read_ahead: Option<u32>,
    /// Total device size in bytes.
    pub device_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedDevice {
    pub descriptor: DeviceDescriptor,
    pub flags: DeviceFlags,
    pub exclusivity: ExclusivityState,
}

/// Validates block devices before use.
#[derive(Clone)]
pub struct DeviceGuard {
    probe: Arc<dyn DeviceProbe>,
    diag: Arc<Diagnostics>,
    disk_alignment: u64,
}

impl DeviceGuard {
    pub fn new(probe: Arc<dyn DeviceProbe>, diag: Arc<Diagnostics>, disk_alignment: u64) -> Self {
        Self {
            probe,
            diag,
            disk_alignment,
        }
    }

    /// Check that `path` exists and can be opened.
    pub fn ready(&self, path: &Path, writable: bool) -> Result<()> {
        self.probe.inspect(path)?;
        BlockDevice::open_with(
            path,
            BlockOpen {
                write: writable,
                ..Default::default()
            },
        )?;
        self.diag.debug(format_args!(
            "Device {} is ready{}.",
            path.display(),
            if writable { " for writing" } else { "" }
        ));
        Ok(())
    }

    /// Device size in bytes.
    pub fn device_size(&self, path: &Path) -> Result<u64> {
        Ok(self.probe.inspect(path)?.size)
    }

    /// Whether the device is rotational, if the kernel says.
    pub fn is_rotational(&self, path: &Path) -> Result<Option<bool>> {
        Ok(self.probe.inspect(path)?.rotational)
    }

    /// Read-ahead in 512-byte sectors, if the kernel reports one.
    pub fn read_ahead(&self, path: &Path) -> Result<Option<u32>> {
        Ok(self.probe.inspect(path)?.read_ahead)
    }

    /// Raw probed facts.
    pub fn inspect(&self, path: &Path) -> Result<DeviceFacts> {
        self.probe.inspect(path)
    }

    /// Validate `path` for use at byte `offset` with `size` bytes.
    ///
    /// Checks run in order: readiness, range, exclusivity, alignment. The
    /// read-only flag is added last when the device cannot be written.
    ///
    /// # Arguments
    /// * `path` - Block device or image file
    /// * `check` - Which concurrent users are tolerated
    /// * `size` - Bytes required, or zero for "to the end of the device"
    /// * `offset` - Requested start in bytes, rounded up to the alignment
    /// * `flags` - Caller flags, returned with `READ_ONLY` added if needed
    ///
    /// # Returns
    /// The descriptor with the aligned offset and resulting size, plus the
    /// observed exclusivity. `DeviceNotReady`, `SizeMismatch`, `DeviceBusy`
    /// or `Alignment` otherwise.
    pub fn validate(
        &self,
        path: &Path,
        check: DeviceCheck,
        size: u64,
        offset: u64,
        flags: DeviceFlags,
    ) -> Result<ValidatedDevice> {
        let facts = self.probe.inspect(path)?;
        if facts.size == 0 {
            return Err(Error::not_ready(path, "device has zero size"));
        }

        if offset >= facts.size {
            return Err(Error::too_small(
                path,
                format!("offset {} is beyond device size {}", offset, facts.size),
            ));
        }
        if size > facts.size || size > facts.size - offset {
            return Err(Error::too_small(
                path,
                format!(
                    "{} bytes at offset {} do not fit {} byte device",
                    size, offset, facts.size
                ),
            ));
        }

        let exclusivity = match check {
            DeviceCheck::Ok => ExclusivityState::Free,
            DeviceCheck::RequireExclusive | DeviceCheck::AllowShared => {
                let claims = self.probe.claims(path)?;
                let state = ExclusivityState::from_claims(&claims);
                let refuse = match check {
                    DeviceCheck::RequireExclusive => state != ExclusivityState::Free,
                    _ => state == ExclusivityState::ExclusiveHeld,
                };
                if refuse {
                    let holder = claims
                        .iter()
                        .find(|c| check == DeviceCheck::RequireExclusive || c.kind == ClaimKind::Exclusive)
                        .map(|c| c.holder.clone())
                        .unwrap_or_default();
                    self.diag.error(format_args!(
                        "Cannot use device {} which is in use ({}).",
                        path.display(),
                        holder
                    ));
                    return Err(Error::busy(path, holder));
                }
                state
            }
        };

        let (alignment, alignment_offset) = self.required_alignment(&facts);
        let adjusted = align_up(offset, alignment, alignment_offset).ok_or_else(|| {
            Error::Alignment(format!("offset {} cannot be aligned", offset))
        })?;

        let usable = if size == 0 {
            facts.size.checked_sub(adjusted).filter(|&s| s > 0)
        } else {
            adjusted
                .checked_add(size)
                .filter(|&end| end <= facts.size)
                .map(|_| size)
        };
        let usable = usable.ok_or_else(|| {
            Error::Alignment(format!(
                "offset {} aligned to {} (alignment {}, alignment offset {}) leaves no room for {} bytes on {}",
                offset,
                adjusted,
                alignment,
                alignment_offset,
                size,
                path.display()
            ))
        })?;

        let mut out_flags = flags;
        if facts.read_only {
            out_flags = out_flags | DeviceFlags::READ_ONLY;
        }

        self.diag.debug(format_args!(
            "Device {}: size {}, offset {} -> {}, alignment {}/{}, {:?}.",
            path.display(),
            facts.size,
            offset,
            adjusted,
            alignment,
            alignment_offset,
            exclusivity
        ));

        Ok(ValidatedDevice {
            descriptor: DeviceDescriptor {
                path: path.to_path_buf(),
                size: usable,
                offset: adjusted,
                alignment,
                alignment_offset,
                sector_size: facts.sector_size,
                rotational: facts.rotational,
                read_ahead: facts.read_ahead,
                device_size: facts.size,
            },
            flags: out_flags,
            exclusivity,
        })
    }

    /// Alignment and alignment offset for the probed topology.
    fn required_alignment(&self, facts: &DeviceFacts) -> (u64, u64) {
        let default = self.disk_alignment;
        let device = facts.topology.min_io.max(facts.topology.opt_io);
        let alignment = if device != 0 && default % device != 0 {
            device
        } else {
            default
        };
        (alignment, facts.topology.alignment_offset % alignment)
    }
}

impl std::fmt::Debug for DeviceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceGuard")
            .field("disk_alignment", &self.disk_alignment)
            .finish_non_exhaustive()
    }
}

/// Smallest `alignment_offset + k * alignment` not below `offset`.
fn align_up(offset: u64, alignment: u64, alignment_offset: u64) -> Option<u64> {
    if offset <= alignment_offset {
        return Some(alignment_offset);
    }
    let k = (offset - alignment_offset).div_ceil(alignment);
    k.checked_mul(alignment)?.checked_add(alignment_offset)
}

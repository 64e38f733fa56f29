//! Linux block device queries: ioctls, sysfs and the mount table.

use super::Topology;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Extra open flags for direct I/O.
pub const DIRECT_FLAGS: libc::c_int = libc::O_DIRECT | libc::O_SYNC;

// <linux/fs.h> request numbers.
const BLKROGET: u64 = 0x125e;
const BLKRAGET: u64 = 0x1263;
const BLKSSZGET: u64 = 0x1268;
const BLKIOMIN: u64 = 0x1278;
const BLKIOOPT: u64 = 0x1279;
const BLKALIGNOFF: u64 = 0x127a;
// _IOR(0x12, 114, size_t): the size field follows pointer width.
const BLKGETSIZE64: u64 = if cfg!(target_pointer_width = "64") {
    0x8008_1272
} else {
    0x8004_1272
};

fn ioctl_read<T: Default>(file: &File, request: u64) -> io::Result<T> {
    let mut value = T::default();
    // SAFETY: every request used here writes exactly one value of type T.
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), request as _, &mut value as *mut T) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value)
}

/// Logical sector size.
pub fn sector_size(file: &File) -> io::Result<u32> {
    let size: libc::c_int = ioctl_read(file, BLKSSZGET)?;
    u32::try_from(size).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "negative sector size"))
}

/// Device size in bytes.
pub fn size_bytes(file: &File) -> io::Result<u64> {
    ioctl_read::<u64>(file, BLKGETSIZE64)
}

pub fn is_read_only(file: &File) -> io::Result<bool> {
    let ro: libc::c_int = ioctl_read(file, BLKROGET)?;
    Ok(ro != 0)
}

/// Read-ahead in 512-byte sectors.
pub fn read_ahead(file: &File) -> io::Result<u32> {
    let ra: libc::c_long = ioctl_read(file, BLKRAGET)?;
    Ok(u32::try_from(ra).unwrap_or(0))
}

/// I/O topology. Missing values read as zero.
pub fn topology(file: &File) -> Topology {
    let min_io: libc::c_uint = ioctl_read(file, BLKIOMIN).unwrap_or(0);
    let opt_io: libc::c_uint = ioctl_read(file, BLKIOOPT).unwrap_or(0);
    // -1 means misaligned or unknown.
    let align_off: libc::c_int = ioctl_read(file, BLKALIGNOFF).unwrap_or(0);
    Topology {
        min_io: u64::from(min_io),
        opt_io: u64::from(opt_io),
        alignment_offset: u64::try_from(align_off).unwrap_or(0),
    }
}

/// Split a `dev_t` into major and minor numbers (glibc encoding).
pub fn dev_numbers(rdev: u64) -> (u32, u32) {
    let major = ((rdev >> 8) & 0xfff) | ((rdev >> 32) & !0xfff);
    let minor = (rdev & 0xff) | ((rdev >> 12) & !0xff);
    (major as u32, minor as u32)
}

fn sysfs_dev(major: u32, minor: u32) -> PathBuf {
    PathBuf::from(format!("/sys/dev/block/{}:{}", major, minor))
}

/// Whether the device is rotational. Partitions inherit the disk's queue.
pub fn rotational(major: u32, minor: u32) -> Option<bool> {
    let base = sysfs_dev(major, minor);
    [base.join("queue/rotational"), base.join("../queue/rotational")]
        .iter()
        .find_map(|p| fs::read_to_string(p).ok())
        .map(|v| v.trim() != "0")
}

/// Kernel holders (e.g. `dm-0`) stacked on the device.
pub fn holders(major: u32, minor: u32) -> io::Result<Vec<String>> {
    let dir = sysfs_dev(major, minor).join("holders");
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut names = Vec::new();
    for entry in entries {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

/// Device-mapper UUID of a holder, if it is a dm device.
pub fn dm_uuid(holder: &str) -> Option<String> {
    fs::read_to_string(format!("/sys/block/{}/dm/uuid", holder))
        .ok()
        .map(|s| s.trim().to_string())
}

/// `MAJ:MIN` of a holder such as `dm-0`.
pub fn holder_dev_id(holder: &str) -> Option<String> {
    fs::read_to_string(format!("/sys/block/{}/dev", holder))
        .ok()
        .map(|s| s.trim().to_string())
}

/// DEVNAME from the uevent file of `MAJ:MIN`.
pub fn uevent_devname(dev_id: &str) -> Option<String> {
    let content = fs::read_to_string(format!("/sys/dev/block/{}/uevent", dev_id)).ok()?;
    content
        .lines()
        .find_map(|line| line.strip_prefix("DEVNAME="))
        .map(str::to_string)
}

/// Mount points whose source is `device`.
pub fn mount_points(device: &Path) -> io::Result<Vec<PathBuf>> {
    let device = device.canonicalize()?;
    let mounts = File::open("/proc/self/mounts")?;
    let reader = BufReader::new(mounts);

    let mut found = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 || !parts[0].starts_with("/dev/") {
            continue;
        }
        let source = Path::new(parts[0]);
        let same = source
            .canonicalize()
            .map(|s| s == device)
            .unwrap_or(false);
        if same {
            found.push(PathBuf::from(parts[1]));
        }
    }
    Ok(found)
}

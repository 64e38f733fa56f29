//! Device validation against image files with advisory lock holders.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use tempfile::NamedTempFile;
use volume_keycore::device::SystemProbe;
use volume_keycore::logging::LogCrateLogger;
use volume_keycore::{
    DeviceCheck, DeviceFlags, DeviceGuard, Diagnostics, Error, ExclusivityState,
};

const MIB: u64 = 1 << 20;

fn guard() -> DeviceGuard {
    DeviceGuard::new(
        Arc::new(SystemProbe::new()),
        Arc::new(Diagnostics::new(Arc::new(LogCrateLogger), true)),
        MIB,
    )
}

fn image(size: u64) -> NamedTempFile {
    let file = NamedTempFile::new().expect("Failed to create image");
    file.as_file().set_len(size).expect("Failed to size image");
    file
}

/// Open a second handle on `path` and lock it the way another process would.
fn hold(path: &Path, op: libc::c_int) -> File {
    let holder = File::open(path).expect("Failed to open holder");
    let rc = unsafe { libc::flock(holder.as_raw_fd(), op | libc::LOCK_NB) };
    assert_eq!(rc, 0, "Failed to take lock");
    holder
}

fn validate(path: &Path, check: DeviceCheck) -> volume_keycore::Result<volume_keycore::ValidatedDevice> {
    guard().validate(path, check, 0, 0, DeviceFlags::empty())
}

#[test]
fn test_exclusive_holder_refused() {
    let file = image(4 * MIB);
    let _holder = hold(file.path(), libc::LOCK_EX);

    assert!(matches!(
        validate(file.path(), DeviceCheck::RequireExclusive),
        Err(Error::DeviceBusy { .. })
    ));
    assert!(matches!(
        validate(file.path(), DeviceCheck::AllowShared),
        Err(Error::DeviceBusy { .. })
    ));
    assert!(validate(file.path(), DeviceCheck::Ok).is_ok());
}

#[test]
fn test_shared_holder_allowed_when_shared() {
    let file = image(4 * MIB);
    let _holder = hold(file.path(), libc::LOCK_SH);

    let validated = validate(file.path(), DeviceCheck::AllowShared).expect("Validation failed");
    assert_eq!(validated.exclusivity, ExclusivityState::SharedInUse);

    match validate(file.path(), DeviceCheck::RequireExclusive) {
        Err(e) => assert!(e.is_retryable()),
        Ok(v) => panic!("expected DeviceBusy, got {:?}", v),
    }
}

#[test]
fn test_released_holder_frees_device() {
    let file = image(4 * MIB);
    {
        let _holder = hold(file.path(), libc::LOCK_EX);
        assert!(validate(file.path(), DeviceCheck::RequireExclusive).is_err());
    }
    let validated = validate(file.path(), DeviceCheck::RequireExclusive).expect("Validation failed");
    assert_eq!(validated.exclusivity, ExclusivityState::Free);
    assert_eq!(validated.descriptor.size, 4 * MIB);
    assert_eq!(validated.descriptor.device_size, 4 * MIB);
}

#[test]
fn test_alignment_is_deterministic() {
    let file = image(8 * MIB);
    let g = guard();

    let a = g
        .validate(file.path(), DeviceCheck::AllowShared, 2 * MIB, 12_345, DeviceFlags::empty())
        .expect("Validation failed");
    let b = g
        .validate(file.path(), DeviceCheck::AllowShared, 2 * MIB, 12_345, DeviceFlags::empty())
        .expect("Validation failed");
    assert_eq!(a, b);
    assert_eq!(a.descriptor.offset, MIB);
    assert_eq!(a.descriptor.size, 2 * MIB);
}

#[test]
fn test_readiness_helpers() {
    let file = image(MIB);
    let g = guard();

    g.ready(file.path(), true).expect("Image not ready");
    assert_eq!(g.device_size(file.path()).unwrap(), MIB);
    assert_eq!(g.is_rotational(file.path()).unwrap(), None);
    assert_eq!(g.read_ahead(file.path()).unwrap(), None);

    assert!(matches!(
        g.ready(Path::new("/nonexistent/disk"), false),
        Err(Error::DeviceNotReady { .. })
    ));
    let empty = image(0);
    assert!(matches!(
        validate(empty.path(), DeviceCheck::Ok),
        Err(Error::DeviceNotReady { .. })
    ));
}

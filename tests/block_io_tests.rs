//! Direct I/O through `BlockDevice` on a disk-backed file.

use std::fs::{self, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use tempfile::NamedTempFile;
use volume_keycore::storage::BlockOpen;
use volume_keycore::BlockDevice;

const PAGE: usize = 4096;

/// Image in the target directory; tmpfs may refuse O_DIRECT.
fn direct_image(pages: usize, fill: u8) -> Option<NamedTempFile> {
    let file = NamedTempFile::new_in(env!("CARGO_TARGET_TMPDIR")).expect("Failed to create image");
    fs::write(file.path(), vec![fill; pages * PAGE]).expect("Failed to fill image");
    let supported = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECT)
        .open(file.path())
        .is_ok();
    if !supported {
        eprintln!("skipping: O_DIRECT not supported for {}", file.path().display());
        return None;
    }
    Some(file)
}

fn open_direct(path: &Path) -> BlockDevice {
    BlockDevice::open_with(
        path,
        BlockOpen {
            write: true,
            direct: true,
            exclusive: true,
        },
    )
    .expect("Failed to open image")
}

#[test]
fn test_direct_io_from_misaligned_memory() {
    let Some(file) = direct_image(4, 0xcd) else {
        return;
    };
    let mut dev = open_direct(file.path());

    // One byte in, so the slice is never page aligned.
    let mut backing = vec![0u8; 2 * PAGE + 1];
    let data = &mut backing[1..];
    data.iter_mut()
        .enumerate()
        .for_each(|(i, b)| *b = (i % 251) as u8);
    assert_ne!(data.as_ptr() as usize % PAGE, 0);
    assert_eq!(dev.write_at_offset_blockwise(data, PAGE as u64).unwrap(), 2 * PAGE);
    dev.sync().unwrap();

    let mut readback = vec![0u8; 2 * PAGE + 1];
    let out = &mut readback[1..];
    assert_eq!(dev.read_at_offset_blockwise(out, PAGE as u64).unwrap(), 2 * PAGE);
    assert_eq!(out, &backing[1..]);

    drop(dev);
    let on_disk = fs::read(file.path()).unwrap();
    assert!(on_disk[..PAGE].iter().all(|&b| b == 0xcd));
    assert_eq!(&on_disk[PAGE..3 * PAGE], &backing[1..]);
    assert!(on_disk[3 * PAGE..].iter().all(|&b| b == 0xcd));
}

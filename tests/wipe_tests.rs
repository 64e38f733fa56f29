//! End-to-end wipe tests against image files.

use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use volume_keycore::device::{Claim, DeviceFacts, DeviceProbe, SystemProbe};
use volume_keycore::memory::MemoryPinner;
use volume_keycore::wipe::Guarantee;
use volume_keycore::{
    CoreConfig, CryptContext, Error, WipeFlags, WipeJob, WipeSpec, WipeState, WipeStrategy,
};

const SECTOR: usize = 512;

struct NoopPinner;

impl MemoryPinner for NoopPinner {
    fn pin(&self) -> io::Result<()> {
        Ok(())
    }

    fn unpin(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Real probe with the rotational flag forced.
struct MediaProbe {
    rotational: Option<bool>,
}

impl DeviceProbe for MediaProbe {
    fn inspect(&self, path: &Path) -> volume_keycore::Result<DeviceFacts> {
        let mut facts = SystemProbe::new().inspect(path)?;
        facts.rotational = self.rotational;
        Ok(facts)
    }

    fn claims(&self, path: &Path) -> volume_keycore::Result<Vec<Claim>> {
        SystemProbe::new().claims(path)
    }
}

/// Reports any path as a rotational device of `size` bytes with no holders.
struct SinkProbe {
    size: u64,
}

impl DeviceProbe for SinkProbe {
    fn inspect(&self, _path: &Path) -> volume_keycore::Result<DeviceFacts> {
        Ok(DeviceFacts {
            rotational: Some(true),
            ..DeviceFacts::image(self.size)
        })
    }

    fn claims(&self, _path: &Path) -> volume_keycore::Result<Vec<Claim>> {
        Ok(Vec::new())
    }
}

fn image(sectors: usize, fill: u8) -> NamedTempFile {
    let file = NamedTempFile::new().expect("Failed to create image");
    fs::write(file.path(), vec![fill; sectors * SECTOR]).expect("Failed to fill image");
    file
}

fn context_with(config: CoreConfig) -> CryptContext {
    CryptContext::builder()
        .config(config)
        .memory_pinner(Box::new(NoopPinner))
        .build()
        .expect("Failed to build context")
}

fn context() -> CryptContext {
    context_with(CoreConfig::default())
}

fn spec(path: &Path, offset: u64, sectors: u64, strategy: WipeStrategy) -> WipeSpec {
    WipeSpec {
        path: PathBuf::from(path),
        offset,
        sectors,
        strategy,
        flags: WipeFlags::NO_CONFIRM,
    }
}

#[test]
fn test_zero_wipe_clears_range_only() {
    let file = image(16, 0xab);
    let ctx = context();

    let report = ctx
        .wiper()
        .wipe(spec(file.path(), 2 * SECTOR as u64, 10, WipeStrategy::Zero))
        .expect("Wipe failed");
    assert_eq!(report.passes, 1);
    assert_eq!(report.sectors_written, 10);
    assert_eq!(report.guarantee, Guarantee::Overwritten);

    let data = fs::read(file.path()).unwrap();
    assert!(data[..2 * SECTOR].iter().all(|&b| b == 0xab));
    assert!(data[2 * SECTOR..12 * SECTOR].iter().all(|&b| b == 0));
    assert!(data[12 * SECTOR..].iter().all(|&b| b == 0xab));
}

#[test]
fn test_random_wipe_distribution() {
    let file = image(10, 0x5a);
    let ctx = context();

    ctx.wiper()
        .wipe(spec(file.path(), 0, 10, WipeStrategy::Random))
        .expect("Wipe failed");

    let data = fs::read(file.path()).unwrap();
    for sector in data.chunks(SECTOR) {
        assert!(sector.iter().any(|&b| b != 0x5a));
    }

    // Chi-square over byte values: 255 degrees of freedom, mean 255,
    // standard deviation about 22.6.
    let mut counts = [0u64; 256];
    data.iter().for_each(|&b| counts[b as usize] += 1);
    let expected = data.len() as f64 / 256.0;
    let chi2: f64 = counts
        .iter()
        .map(|&c| (c as f64 - expected).powi(2) / expected)
        .sum();
    assert!(chi2 < 400.0, "chi-square {} too high", chi2);
}

#[test]
fn test_cancel_leaves_whole_sectors() {
    let file = image(32, 0xab);
    let mut config = CoreConfig::default();
    config.wipe.chunk_sectors = 3;
    let ctx = context_with(config);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let job = WipeJob::new(spec(file.path(), 0, 32, WipeStrategy::Zero));
    let token = job.cancel_token();
    let progress = seen.clone();
    let mut job = job.with_progress(move |done| {
        progress.lock().unwrap().push(done);
        if done >= 6 {
            token.cancel();
        }
    });

    match ctx.wiper().run(&mut job) {
        Err(Error::WipeCancelled { sectors_written }) => assert_eq!(sectors_written, 6),
        other => panic!("expected WipeCancelled, got {:?}", other),
    }
    assert_eq!(job.state(), WipeState::Failed);
    assert_eq!(*seen.lock().unwrap(), vec![3, 6]);

    let data = fs::read(file.path()).unwrap();
    for (i, sector) in data.chunks(SECTOR).enumerate() {
        let expected = if i < 6 { 0 } else { 0xab };
        assert!(
            sector.iter().all(|&b| b == expected),
            "sector {} is torn or unexpected",
            i
        );
    }
}

#[test]
fn test_adaptive_on_flash_falls_back() {
    let file = image(4, 0xab);
    let ctx = CryptContext::builder()
        .memory_pinner(Box::new(NoopPinner))
        .device_probe(Arc::new(MediaProbe {
            rotational: Some(false),
        }))
        .build()
        .expect("Failed to build context");

    let report = ctx
        .wiper()
        .wipe(spec(file.path(), 0, 4, WipeStrategy::DiskAdaptive))
        .expect("Wipe failed");
    assert_eq!(report.requested, WipeStrategy::DiskAdaptive);
    assert_eq!(report.applied, WipeStrategy::SolidState);
    assert_eq!(report.guarantee, Guarantee::FlashBestEffort);
    assert_eq!(report.passes, 1);
}

#[test]
fn test_adaptive_full_sequence_strict() {
    let file = image(4, 0xab);
    let ctx = context();

    let mut spec = spec(file.path(), 0, 4, WipeStrategy::DiskAdaptive);
    spec.flags = spec.flags | WipeFlags::STRICT;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let progress = seen.clone();
    let mut job = WipeJob::new(spec).with_progress(move |done| progress.lock().unwrap().push(done));

    let report = ctx.wiper().run(&mut job).expect("Wipe failed");
    assert_eq!(report.applied, WipeStrategy::DiskAdaptive);
    assert_eq!(report.passes, 35);
    assert_eq!(report.sectors_written, 35 * 4);
    assert_eq!(job.state(), WipeState::Completed);

    let seen = seen.lock().unwrap();
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(seen.last(), Some(&(35 * 4)));
}

#[test]
fn test_declined_confirmation_writes_nothing() {
    let file = image(4, 0xab);
    let asked = Arc::new(Mutex::new(Vec::new()));
    let log = asked.clone();
    let ctx = CryptContext::builder()
        .memory_pinner(Box::new(NoopPinner))
        .confirm(move |msg: &str| {
            log.lock().unwrap().push(msg.to_string());
            false
        })
        .build()
        .expect("Failed to build context");

    let mut request = spec(file.path(), 0, 4, WipeStrategy::Zero);
    request.flags = WipeFlags::empty();
    assert!(matches!(
        ctx.wiper().wipe(request.clone()),
        Err(Error::ConfirmationDeclined(_))
    ));
    assert_eq!(asked.lock().unwrap().len(), 1);
    assert!(fs::read(file.path()).unwrap().iter().all(|&b| b == 0xab));

    // NO_CONFIRM skips the prompt.
    request.flags = WipeFlags::NO_CONFIRM;
    ctx.wiper().wipe(request).expect("Wipe failed");
    assert_eq!(asked.lock().unwrap().len(), 1);
}

#[test]
fn test_job_runs_once() {
    let file = image(2, 0xab);
    let ctx = context();

    let mut job = WipeJob::new(spec(file.path(), 0, 2, WipeStrategy::Zero));
    ctx.wiper().run(&mut job).expect("Wipe failed");
    assert!(matches!(
        ctx.wiper().run(&mut job),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(job.state(), WipeState::Completed);
}

#[test]
fn test_bad_ranges_rejected() {
    let file = image(4, 0xab);
    let ctx = context();

    assert!(matches!(
        ctx.wiper().wipe(spec(file.path(), 100, 1, WipeStrategy::Zero)),
        Err(Error::Alignment(_))
    ));
    assert!(matches!(
        ctx.wiper().wipe(spec(file.path(), 1024, 3, WipeStrategy::Zero)),
        Err(Error::SizeMismatch { .. })
    ));
    assert!(matches!(
        ctx.wiper()
            .wipe(spec(Path::new("/nonexistent/disk"), 0, 1, WipeStrategy::Zero)),
        Err(Error::DeviceNotReady { .. })
    ));
    assert!(fs::read(file.path()).unwrap().iter().all(|&b| b == 0xab));
}

#[test]
fn test_cancel_between_passes_keeps_sectors_whole() {
    let file = image(4, 0xab);
    let mut config = CoreConfig::default();
    config.wipe.chunk_sectors = 2;
    let ctx = context_with(config);

    // Four random passes, then 0x55 (pass 5) and 0xaa (pass 6).
    let job = WipeJob::new(spec(file.path(), 0, 4, WipeStrategy::DiskAdaptive));
    let token = job.cancel_token();
    let mut job = job.with_progress(move |done| {
        if done >= 5 * 4 + 2 {
            token.cancel();
        }
    });

    match ctx.wiper().run(&mut job) {
        Err(Error::WipeCancelled { sectors_written }) => assert_eq!(sectors_written, 22),
        other => panic!("expected WipeCancelled, got {:?}", other),
    }
    assert_eq!(job.state(), WipeState::Failed);

    let data = fs::read(file.path()).unwrap();
    for (i, sector) in data.chunks(SECTOR).enumerate() {
        let expected = if i < 2 { 0xaa } else { 0x55 };
        assert!(
            sector.iter().all(|&b| b == expected),
            "sector {} is torn or unexpected",
            i
        );
    }
}

#[test]
fn test_strict_detects_readback_mismatch() {
    // Writes to /dev/zero are discarded and reads return zeros.
    let ctx = CryptContext::builder()
        .memory_pinner(Box::new(NoopPinner))
        .device_probe(Arc::new(SinkProbe {
            size: 8 * SECTOR as u64,
        }))
        .build()
        .expect("Failed to build context");

    let mut request = spec(Path::new("/dev/zero"), 0, 8, WipeStrategy::Random);
    request.flags = request.flags | WipeFlags::STRICT;
    let mut job = WipeJob::new(request);

    match ctx.wiper().run(&mut job) {
        Err(Error::WipeFailed {
            pass,
            sectors_written,
            source,
        }) => {
            assert_eq!(pass, 1);
            assert_eq!(sectors_written, 0);
            assert!(
                matches!(*source, Error::Io(ref e) if e.kind() == io::ErrorKind::InvalidData),
                "unexpected cause {:?}",
                source
            );
        }
        other => panic!("expected WipeFailed, got {:?}", other),
    }
    assert_eq!(job.state(), WipeState::Failed);
    let logged = ctx.diagnostics().last_error().unwrap_or_default();
    assert!(logged.contains("/dev/zero"), "unexpected log {:?}", logged);
}

#[test]
fn test_direct_io_wipe() {
    // tmpfs may refuse O_DIRECT, so use the target directory.
    let file = NamedTempFile::new_in(env!("CARGO_TARGET_TMPDIR")).expect("Failed to create image");
    fs::write(file.path(), vec![0xab; 64 * SECTOR]).expect("Failed to fill image");
    if OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_DIRECT)
        .open(file.path())
        .is_err()
    {
        eprintln!("skipping: O_DIRECT not supported for {}", file.path().display());
        return;
    }
    let ctx = context();

    let mut request = spec(file.path(), 8 * SECTOR as u64, 48, WipeStrategy::Random);
    request.flags = request.flags | WipeFlags::DIRECT_IO | WipeFlags::STRICT;
    let report = ctx.wiper().wipe(request).expect("Wipe failed");
    assert_eq!(report.sectors_written, 48);

    let data = fs::read(file.path()).unwrap();
    assert!(data[..8 * SECTOR].iter().all(|&b| b == 0xab));
    assert!(data[56 * SECTOR..].iter().all(|&b| b == 0xab));
    for sector in data[8 * SECTOR..56 * SECTOR].chunks(SECTOR) {
        assert!(sector.iter().any(|&b| b != 0xab));
    }
}

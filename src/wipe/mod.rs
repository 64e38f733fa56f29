//! Secure erasure of device ranges.
//!
//! A [`WipeJob`] runs once: `Pending -> InProgress -> Completed | Failed`.
//! Passes run in order with a data sync after each one. Cancellation is
//! checked before every chunk, so a sector is always either untouched by a
//! pass or fully written by it.

mod patterns;

use crate::config::{WipeConfig, SECTOR_SIZE};
use crate::context::Confirm;
use crate::device::DeviceGuard;
use crate::error::{Error, Result};
use crate::logging::Diagnostics;
use crate::random::{Blocking, RandomSource};
use crate::storage::block_io::AlignedBuf;
use crate::storage::{mem_alignment, BlockDevice, BlockOpen};
use patterns::PassKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::ops::BitOr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Erasure strategy. Names and ordinals are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum WipeStrategy {
    /// Single pass of zeros.
    Zero = 0,
    /// Gutmann sequence on rotational media, flash fallback otherwise.
    DiskAdaptive = 1,
    /// Key-quality random passes for flash media.
    SolidState = 2,
    /// Single pass of random data.
    Random = 3,
}

impl WipeStrategy {
    pub fn as_ordinal(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for WipeStrategy {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(WipeStrategy::Zero),
            1 => Ok(WipeStrategy::DiskAdaptive),
            2 => Ok(WipeStrategy::SolidState),
            3 => Ok(WipeStrategy::Random),
            other => Err(Error::InvalidArgument(format!(
                "unknown wipe strategy {}",
                other
            ))),
        }
    }
}

impl fmt::Display for WipeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WipeStrategy::Zero => "zero",
            WipeStrategy::DiskAdaptive => "disk-adaptive",
            WipeStrategy::SolidState => "solid-state",
            WipeStrategy::Random => "random",
        };
        f.write_str(name)
    }
}

/// Wipe options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct WipeFlags(u32);

impl WipeFlags {
    /// Read back and compare every chunk of the final pass.
    pub const STRICT: WipeFlags = WipeFlags(1 << 0);
    /// Bypass the page cache.
    pub const DIRECT_IO: WipeFlags = WipeFlags(1 << 1);
    /// Do not ask the confirmation callback.
    pub const NO_CONFIRM: WipeFlags = WipeFlags(1 << 2);

    pub const fn empty() -> Self {
        WipeFlags(0)
    }

    pub const fn contains(self, other: WipeFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for WipeFlags {
    type Output = WipeFlags;

    fn bitor(self, rhs: WipeFlags) -> WipeFlags {
        WipeFlags(self.0 | rhs.0)
    }
}

/// Range and method of one erasure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WipeSpec {
    pub path: PathBuf,
    /// Start in bytes; must be sector aligned.
    pub offset: u64,
    /// Length in 512-byte sectors.
    pub sectors: u64,
    pub strategy: WipeStrategy,
    pub flags: WipeFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WipeState {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Cooperative cancellation flag, checked between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

type ProgressFn<'a> = Box<dyn FnMut(u64) + Send + 'a>;

/// A single wipe request and its state.
pub struct WipeJob<'a> {
    spec: WipeSpec,
    state: WipeState,
    cancel: CancelToken,
    progress: Option<ProgressFn<'a>>,
}

impl<'a> WipeJob<'a> {
    pub fn new(spec: WipeSpec) -> Self {
        Self {
            spec,
            state: WipeState::Pending,
            cancel: CancelToken::new(),
            progress: None,
        }
    }

    /// Call `progress` with the running total of sectors written.
    pub fn with_progress(mut self, progress: impl FnMut(u64) + Send + 'a) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn spec(&self) -> &WipeSpec {
        &self.spec
    }

    pub fn state(&self) -> WipeState {
        self.state
    }

    /// Token cancelling this job from another thread or a callback.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn report_progress(&mut self, sectors_written: u64) {
        if let Some(progress) = self.progress.as_mut() {
            progress(sectors_written);
        }
    }
}

impl fmt::Debug for WipeJob<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WipeJob")
            .field("spec", &self.spec)
            .field("state", &self.state)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// What a completed wipe can promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guarantee {
    /// Every sector in range was overwritten by every pass.
    Overwritten,
    /// Overwritten through the flash translation layer; remapped blocks may
    /// keep old data.
    FlashBestEffort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WipeReport {
    pub requested: WipeStrategy,
    pub applied: WipeStrategy,
    pub passes: usize,
    /// Total across all passes.
    pub sectors_written: u64,
    pub guarantee: Guarantee,
}

/// Runs wipe jobs.
#[derive(Clone)]
pub struct Wiper {
    random: Arc<RandomSource>,
    guard: DeviceGuard,
    diag: Arc<Diagnostics>,
    config: WipeConfig,
    confirm: Option<Arc<dyn Confirm>>,
}

impl Wiper {
    /// Wiper over the shared random source and device guard.
    ///
    /// Fails with [`Error::Config`] when `config` does not validate, which
    /// bounds the chunk buffer allocated per wipe.
    pub fn new(
        random: Arc<RandomSource>,
        guard: DeviceGuard,
        diag: Arc<Diagnostics>,
        config: WipeConfig,
        confirm: Option<Arc<dyn Confirm>>,
    ) -> Result<Self> {
        config.validate().map_err(Error::Config)?;
        Ok(Self {
            random,
            guard,
            diag,
            config,
            confirm,
        })
    }

    /// Run `spec` as a fresh job.
    pub fn wipe(&self, spec: WipeSpec) -> Result<WipeReport> {
        self.run(&mut WipeJob::new(spec))
    }

    /// Run a pending job to completion, failure or cancellation.
    pub fn run(&self, job: &mut WipeJob<'_>) -> Result<WipeReport> {
        if job.state != WipeState::Pending {
            return Err(Error::InvalidArgument(format!(
                "wipe job is {:?}, not pending",
                job.state
            )));
        }
        job.state = WipeState::InProgress;

        let result = self.execute(job);
        job.state = match result {
            Ok(_) => WipeState::Completed,
            Err(_) => WipeState::Failed,
        };
        if let Err(e) = &result {
            self.diag.error(format_args!(
                "Wipe of {} failed: {}",
                job.spec.path.display(),
                e
            ));
        }
        result
    }

    fn execute(&self, job: &mut WipeJob<'_>) -> Result<WipeReport> {
        let spec = job.spec.clone();
        if spec.sectors == 0 {
            return Err(Error::InvalidArgument("empty wipe range".to_string()));
        }
        if spec.offset % SECTOR_SIZE != 0 {
            return Err(Error::Alignment(format!(
                "wipe offset {} is not a multiple of {} bytes",
                spec.offset, SECTOR_SIZE
            )));
        }

        if !spec.flags.contains(WipeFlags::NO_CONFIRM) {
            if let Some(confirm) = &self.confirm {
                let question = format!(
                    "This will overwrite data on {} irrevocably.",
                    spec.path.display()
                );
                if !confirm.confirm(&question) {
                    return Err(Error::ConfirmationDeclined(question));
                }
            }
        }

        let facts = self.guard.inspect(&spec.path)?;
        let length = spec
            .sectors
            .checked_mul(SECTOR_SIZE)
            .and_then(|len| len.checked_add(spec.offset).map(|end| (len, end)));
        let length = match length {
            Some((len, end)) if end <= facts.size => len,
            _ => {
                return Err(Error::too_small(
                    &spec.path,
                    format!(
                        "{} sectors at offset {} do not fit {} byte device",
                        spec.sectors, spec.offset, facts.size
                    ),
                ))
            }
        };

        let mut device = BlockDevice::open_with(
            &spec.path,
            BlockOpen {
                write: true,
                direct: spec.flags.contains(WipeFlags::DIRECT_IO),
                exclusive: true,
            },
        )?;

        let plan = patterns::plan(spec.strategy, facts.rotational, &self.config);
        let guarantee = if plan.applied == WipeStrategy::SolidState {
            Guarantee::FlashBestEffort
        } else {
            Guarantee::Overwritten
        };
        if plan.applied != spec.strategy {
            self.diag.verbose(format_args!(
                "{} is not rotational, using {} wipe instead of {}.",
                spec.path.display(),
                plan.applied,
                spec.strategy
            ));
        }
        if guarantee == Guarantee::FlashBestEffort {
            self.diag.verbose(format_args!(
                "Overwriting flash storage cannot reach remapped blocks; only physical destruction is certain."
            ));
        }
        self.diag.debug(format_args!(
            "Wiping {} bytes at offset {} of {} with {} ({} passes).",
            length,
            spec.offset,
            spec.path.display(),
            plan.applied,
            plan.passes.len()
        ));

        let chunk_sectors = self.config.chunk_sectors.clamp(1, spec.sectors);
        let chunk_bytes = usize::try_from(chunk_sectors * SECTOR_SIZE)
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        let mut buffer = AlignedBuf::new(chunk_bytes, mem_alignment())?;
        let mut verify = if spec.flags.contains(WipeFlags::STRICT) {
            Some(AlignedBuf::new(chunk_bytes, mem_alignment())?)
        } else {
            None
        };

        let last_pass = plan.passes.len() - 1;
        let mut sectors_written = 0u64;

        for (index, pass) in plan.passes.iter().enumerate() {
            let pass_no = index + 1;
            let failed = |written: u64, source: Error| Error::WipeFailed {
                pass: pass_no,
                sectors_written: written,
                source: Box::new(source),
            };

            let mut sector = 0u64;
            while sector < spec.sectors {
                if job.cancel.is_cancelled() {
                    self.diag.verbose(format_args!(
                        "Wipe of {} cancelled in pass {}.",
                        spec.path.display(),
                        pass_no
                    ));
                    // Leave what was written on disk before reporting.
                    device.sync().map_err(|e| failed(sectors_written, e))?;
                    return Err(Error::WipeCancelled { sectors_written });
                }

                let count = chunk_sectors.min(spec.sectors - sector);
                let start = sector * SECTOR_SIZE;
                let chunk = &mut buffer[..(count * SECTOR_SIZE) as usize];

                match pass {
                    PassKind::Zero => chunk.fill(0),
                    PassKind::Pattern(pattern) => patterns::fill_pattern(chunk, *pattern, start),
                    PassKind::Random(quality) => self
                        .random
                        .get(*quality, chunk, Blocking::Allowed)
                        .map_err(|e| failed(sectors_written, e))?,
                }

                device
                    .write_at_offset_blockwise(chunk, spec.offset + start)
                    .map_err(|e| failed(sectors_written, e))?;

                if index == last_pass {
                    if let Some(verify) = verify.as_mut() {
                        let readback = &mut verify[..chunk.len()];
                        device
                            .read_at_offset_blockwise(readback, spec.offset + start)
                            .map_err(|e| failed(sectors_written, e))?;
                        if *readback != *chunk {
                            return Err(failed(
                                sectors_written,
                                Error::Io(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    format!("read back mismatch at byte {}", spec.offset + start),
                                )),
                            ));
                        }
                    }
                }

                sector += count;
                sectors_written += count;
                job.report_progress(sectors_written);
            }

            device.sync().map_err(|e| failed(sectors_written, e))?;
            self.diag.debug(format_args!(
                "Wipe pass {}/{} on {} done.",
                pass_no,
                plan.passes.len(),
                spec.path.display()
            ));
        }

        Ok(WipeReport {
            requested: spec.strategy,
            applied: plan.applied,
            passes: plan.passes.len(),
            sectors_written,
            guarantee,
        })
    }
}

impl fmt::Debug for Wiper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wiper")
            .field("config", &self.config)
            .field("confirm", &self.confirm.is_some())
            .finish_non_exhaustive()
    }
}

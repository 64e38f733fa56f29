//! Production entropy backend.

use super::{Blocking, BlockingReader, EntropyBackend, EntropyKind};
use crate::logging::Diagnostics;
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;

const RANDOM_DEVICE: &str = "/dev/random";

/// Poll interval while a key read is stalled, in milliseconds.
const STALL_POLL_MS: libc::c_int = 1000;

/// Backend reading from the OS.
///
/// - `Fast`: `StdRng` seeded from `OsRng` at open time.
/// - `System`: `OsRng` (getrandom / urandom).
/// - `Blocking`: `/dev/random`, opened lazily in non-blocking mode and waited
///   on with `poll(2)` when the caller allows blocking. Readers get their own
///   duplicated descriptor.
pub struct SystemEntropy {
    fast: Option<StdRng>,
    random: Option<File>,
    random_path: PathBuf,
    diag: Arc<Diagnostics>,
}

impl SystemEntropy {
    pub fn new(diag: Arc<Diagnostics>) -> Self {
        Self {
            fast: None,
            random: None,
            random_path: PathBuf::from(RANDOM_DEVICE),
            diag,
        }
    }

    fn random_device(&mut self) -> io::Result<&File> {
        if self.random.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(&self.random_path)?;
            self.random = Some(file);
        }
        self.random
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "random device not open"))
    }
}

/// Independent handle on the blocking device.
struct RandomDevice {
    file: File,
    diag: Arc<Diagnostics>,
}

impl BlockingReader for RandomDevice {
    fn fill(&mut self, buf: &mut [u8], blocking: Blocking) -> io::Result<()> {
        let mut filled = 0;
        let mut warned = false;

        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "random device returned no data",
                    ))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if blocking == Blocking::Forbidden {
                        return Err(e);
                    }
                    if !warned {
                        self.diag.normal(format_args!(
                            "System is out of entropy while generating volume key. \
                             Please move mouse or type some text in another window \
                             to gather some random events."
                        ));
                        warned = true;
                    }
                    wait_readable(&self.file)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn wait_readable(file: &File) -> io::Result<()> {
    let mut pfd = libc::pollfd {
        fd: file.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: pfd is a valid pollfd for the duration of the call.
    let rc = unsafe { libc::poll(&mut pfd, 1, STALL_POLL_MS) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
    Ok(())
}

impl EntropyBackend for SystemEntropy {
    fn open(&mut self) -> io::Result<()> {
        let fast = StdRng::from_rng(OsRng).map_err(io::Error::other)?;
        self.fast = Some(fast);
        Ok(())
    }

    fn close(&mut self) {
        self.fast = None;
        self.random = None;
    }

    fn fill(&mut self, kind: EntropyKind, buf: &mut [u8], blocking: Blocking) -> io::Result<()> {
        match kind {
            EntropyKind::Fast => {
                let rng = self
                    .fast
                    .as_mut()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "fast RNG not open"))?;
                rng.try_fill_bytes(buf).map_err(io::Error::other)
            }
            EntropyKind::System => OsRng.try_fill_bytes(buf).map_err(io::Error::other),
            EntropyKind::Blocking => self.blocking_reader()?.fill(buf, blocking),
        }
    }

    fn blocking_reader(&mut self) -> io::Result<Box<dyn BlockingReader>> {
        let file = self.random_device()?.try_clone()?;
        Ok(Box::new(RandomDevice {
            file,
            diag: self.diag.clone(),
        }))
    }
}

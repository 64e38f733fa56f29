//! Process-wide memory locking.
//!
//! The OS primitive (`mlockall(2)`) works at process granularity, so the lock
//! is reference counted: the first holder pins the process, the last one to
//! leave unpins it. Key material holds a [`MemLockGuard`] for its lifetime.
//!
//! Locking is advisory. If the kernel refuses (no `CAP_IPC_LOCK`, low
//! `RLIMIT_MEMLOCK`) a warning is logged and the counter stays where it was.

use crate::config::DEFAULT_PROCESS_PRIORITY;
use crate::logging::Diagnostics;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

/// OS hooks used by [`MemoryLock`].
pub trait MemoryPinner: Send + Sync {
    /// Keep all current and future pages of the process resident.
    fn pin(&self) -> io::Result<()>;

    /// Release the residency requirement.
    fn unpin(&self) -> io::Result<()>;
}

/// `mlockall`/`munlockall` pinner, optionally raising process priority while
/// pinned. Priority failures are logged and otherwise ignored.
#[derive(Debug)]
pub struct ProcessPinner {
    raise_priority: bool,
    saved_priority: Mutex<Option<libc::c_int>>,
    diag: Arc<Diagnostics>,
}

impl ProcessPinner {
    pub fn new(raise_priority: bool, diag: Arc<Diagnostics>) -> Self {
        Self {
            raise_priority,
            saved_priority: Mutex::new(None),
            diag,
        }
    }

    fn raise(&self) -> io::Result<()> {
        // getpriority may legitimately return -1, so errno must be checked.
        clear_errno();
        // SAFETY: plain syscall on the current process.
        let current = unsafe { libc::getpriority(libc::PRIO_PROCESS as _, 0) };
        if current == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error().unwrap_or(0) != 0 {
                return Err(err);
            }
        }
        *self
            .saved_priority
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(current);

        // SAFETY: plain syscall on the current process.
        if unsafe { libc::setpriority(libc::PRIO_PROCESS as _, 0, DEFAULT_PROCESS_PRIORITY) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn restore(&self) -> io::Result<()> {
        let saved = self
            .saved_priority
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(priority) = saved {
            // SAFETY: plain syscall on the current process.
            if unsafe { libc::setpriority(libc::PRIO_PROCESS as _, 0, priority) } != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

impl MemoryPinner for ProcessPinner {
    fn pin(&self) -> io::Result<()> {
        // SAFETY: mlockall has no memory-safety preconditions.
        if unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) } != 0 {
            return Err(io::Error::last_os_error());
        }
        if self.raise_priority {
            if let Err(e) = self.raise() {
                self.diag
                    .normal(format_args!("Cannot raise process priority: {}", e));
            }
        }
        Ok(())
    }

    fn unpin(&self) -> io::Result<()> {
        if let Err(e) = self.restore() {
            self.diag
                .normal(format_args!("Cannot restore process priority: {}", e));
        }
        // SAFETY: munlockall has no memory-safety preconditions.
        if unsafe { libc::munlockall() } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn clear_errno() {
    // SAFETY: __errno_location always returns a valid thread-local pointer.
    unsafe { *libc::__errno_location() = 0 };
}

#[cfg(not(target_os = "linux"))]
fn clear_errno() {}

/// Reference-counted process memory lock.
pub struct MemoryLock {
    count: Mutex<usize>,
    pinner: Box<dyn MemoryPinner>,
    diag: Arc<Diagnostics>,
}

impl MemoryLock {
    pub fn new(pinner: Box<dyn MemoryPinner>, diag: Arc<Diagnostics>) -> Self {
        Self {
            count: Mutex::new(0),
            pinner,
            diag,
        }
    }

    /// Take a reference on the lock, pinning memory on the first one.
    ///
    /// Returns whether memory is locked after the call.
    pub fn increment(&self) -> bool {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        if *count == 0 {
            self.diag.debug(format_args!("Locking memory."));
            if let Err(e) = self.pinner.pin() {
                self.diag.error(format_args!(
                    "WARNING!!! Possibly insecure memory. Are you root? ({})",
                    e
                ));
                return false;
            }
        }
        *count += 1;
        true
    }

    /// Drop a reference, unpinning memory when the last one goes.
    ///
    /// Returns whether memory is still locked after the call.
    pub fn decrement(&self) -> bool {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        if *count == 0 {
            return false;
        }
        *count -= 1;
        if *count == 0 {
            self.diag.debug(format_args!("Unlocking memory."));
            if let Err(e) = self.pinner.unpin() {
                self.diag.error(format_args!("Cannot unlock memory: {}", e));
            }
        }
        *count > 0
    }

    /// Number of live references.
    pub fn locked_regions(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a reference released when the guard drops.
    pub fn acquire(self: &Arc<Self>) -> MemLockGuard {
        let held = self.increment();
        MemLockGuard {
            lock: Arc::clone(self),
            held,
        }
    }
}

impl std::fmt::Debug for MemoryLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLock")
            .field("locked_regions", &self.locked_regions())
            .finish()
    }
}

/// One reference on a [`MemoryLock`].
#[derive(Debug)]
pub struct MemLockGuard {
    lock: Arc<MemoryLock>,
    held: bool,
}

impl MemLockGuard {
    /// Whether pinning succeeded for this reference.
    pub fn is_locked(&self) -> bool {
        self.held
    }
}

impl Drop for MemLockGuard {
    fn drop(&mut self) {
        if self.held {
            self.lock.decrement();
        }
    }
}

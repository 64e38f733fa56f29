//! Volume key allocation, generation and destruction.
//!
//! [`KeyMaterial`] owns its buffer outright and zeroes it when dropped, so
//! every exit path (early return, `?`, panic unwind) destroys the key. The
//! only ways out of a scope are to move the material on or let it be wiped.

use crate::config::MAX_VOLUME_KEY_LENGTH;
use crate::error::{Error, Result};
use crate::logging::Diagnostics;
use crate::memory::{MemLockGuard, MemoryLock};
use crate::random::{Blocking, RandomQuality, RandomSource};
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroize;

/// Raw volume key bytes.
///
/// Fixed length, never cloned, never resized. Holds a reference on the
/// process memory lock until dropped.
pub struct KeyMaterial {
    bytes: Box<[u8]>,
    lock: MemLockGuard,
}

impl KeyMaterial {
    /// Key length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Writable view, for derivation results computed by the caller.
    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Whether the process memory lock was obtained for this key.
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("len", &self.bytes.len())
            .field("bytes", &"<redacted>")
            .finish()
    }
}

/// Creates and destroys [`KeyMaterial`].
#[derive(Debug, Clone)]
pub struct VolumeKeyStore {
    memlock: Arc<MemoryLock>,
    random: Arc<RandomSource>,
    diag: Arc<Diagnostics>,
    require_locked: bool,
}

impl VolumeKeyStore {
    pub fn new(
        memlock: Arc<MemoryLock>,
        random: Arc<RandomSource>,
        diag: Arc<Diagnostics>,
        require_locked: bool,
    ) -> Self {
        Self {
            memlock,
            random,
            diag,
            require_locked,
        }
    }

    /// Allocate a key of `length` bytes, optionally copying `initial` in.
    ///
    /// Without `initial` the buffer is zero-filled until the caller derives or
    /// generates into it.
    pub fn allocate(&self, length: usize, initial: Option<&[u8]>) -> Result<KeyMaterial> {
        if length == 0 || length > MAX_VOLUME_KEY_LENGTH {
            return Err(Error::Allocation(format!(
                "key length {} outside 1..={}",
                length, MAX_VOLUME_KEY_LENGTH
            )));
        }
        if let Some(bytes) = initial {
            if bytes.len() != length {
                return Err(Error::InvalidArgument(format!(
                    "initial key is {} bytes, expected {}",
                    bytes.len(),
                    length
                )));
            }
        }

        let lock = self.memlock.acquire();
        if self.require_locked && !lock.is_locked() {
            return Err(Error::Allocation(
                "locked memory required but unavailable".to_string(),
            ));
        }

        // Reserve exactly, so the buffer is never reallocated (and a stale
        // copy never left behind) while key bytes are in it.
        let mut buf: Vec<u8> = Vec::new();
        buf.try_reserve_exact(length)
            .map_err(|e| Error::Allocation(e.to_string()))?;
        match initial {
            Some(bytes) => buf.extend_from_slice(bytes),
            None => buf.resize(length, 0),
        }

        Ok(KeyMaterial {
            bytes: buf.into_boxed_slice(),
            lock,
        })
    }

    /// Generate a random key of `length` bytes at key quality.
    pub fn generate(&self, length: usize) -> Result<KeyMaterial> {
        let mut key = self.allocate(length, None)?;
        self.random
            .get(RandomQuality::Key, key.as_mut_bytes(), Blocking::Allowed)
            .map_err(|e| {
                self.diag
                    .error(format_args!("Cannot generate volume key: {}", e));
                e
            })?;
        self.diag
            .debug(format_args!("Generated {} byte volume key.", length));
        Ok(key)
    }

    /// Wipe and free a key.
    pub fn release(&self, key: KeyMaterial) {
        self.diag
            .debug(format_args!("Releasing {} byte volume key.", key.len()));
        drop(key);
    }
}

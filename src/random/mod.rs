//! Tiered entropy provider.
//!
//! Three quality tiers map onto backend sources:
//!
//! | Tier     | Source                                         |
//! |----------|------------------------------------------------|
//! | `Normal` | fast user-space CSPRNG seeded from the OS      |
//! | `Salt`   | OS generator, never blocks                     |
//! | `Key`    | OS generator or `/dev/random`, per [`KeyRng`]  |
//!
//! A key-tier failure is reported as such. It is never retried on a weaker
//! tier.

mod system;

pub use system::SystemEntropy;

use crate::error::{Error, Result};
use crate::logging::Diagnostics;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

/// Requested randomness quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RandomQuality {
    /// Bulk randomness for non-secret data such as wipe patterns.
    Normal,
    /// Public but unpredictable values (salts, IVs).
    Salt,
    /// Volume key material.
    Key,
}

/// Source backing the key-quality tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyRng {
    /// Non-blocking OS generator.
    Urandom,
    /// `/dev/random`; may stall until the kernel has entropy.
    Random,
}

/// Whether a call may stall waiting for entropy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocking {
    Allowed,
    Forbidden,
}

/// Concrete source a tier resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntropyKind {
    /// Fast generator.
    Fast,
    /// Non-blocking OS generator.
    System,
    /// High-assurance blocking device.
    Blocking,
}

/// Supplier of raw random bytes.
///
/// `fill` must either fill the whole buffer or fail. A would-block condition
/// is reported with [`io::ErrorKind::WouldBlock`].
pub trait EntropyBackend: Send {
    /// Open handles to the underlying sources.
    fn open(&mut self) -> io::Result<()>;

    /// Close all handles.
    fn close(&mut self);

    fn fill(&mut self, kind: EntropyKind, buf: &mut [u8], blocking: Blocking) -> io::Result<()>;

    /// Handle on the [`EntropyKind::Blocking`] source that stays valid
    /// without the backend. [`RandomSource`] reads it after releasing its
    /// lock, so a stalled key read never holds up the other tiers.
    fn blocking_reader(&mut self) -> io::Result<Box<dyn BlockingReader>>;
}

/// Reader detached from an [`EntropyBackend`] for a single blocking request.
pub trait BlockingReader: Send {
    fn fill(&mut self, buf: &mut [u8], blocking: Blocking) -> io::Result<()>;
}

struct SourceState {
    refs: usize,
    backend: Box<dyn EntropyBackend>,
}

/// Reference-counted, mutex-guarded entropy provider.
pub struct RandomSource {
    state: Mutex<SourceState>,
    key_rng: KeyRng,
    default_quality: RandomQuality,
    diag: Arc<Diagnostics>,
}

impl RandomSource {
    pub fn new(
        backend: Box<dyn EntropyBackend>,
        key_rng: KeyRng,
        default_quality: RandomQuality,
        diag: Arc<Diagnostics>,
    ) -> Self {
        Self {
            state: Mutex::new(SourceState { refs: 0, backend }),
            key_rng,
            default_quality,
            diag,
        }
    }

    /// Take a reference, opening the backend on the first one.
    pub fn init(&self) -> Result<()> {
        let mut state = self.lock();
        if state.refs == 0 {
            self.diag.debug(format_args!("Initialising random source."));
            state.backend.open().map_err(|e| {
                self.diag
                    .error(format_args!("Fatal error during RNG initialisation: {}", e));
                Error::EntropyUnavailable(format!("cannot initialise random source: {}", e))
            })?;
            if self.key_rng == KeyRng::Urandom {
                self.diag.verbose(format_args!(
                    "Using the non-blocking OS generator for key material."
                ));
            }
        }
        state.refs += 1;
        Ok(())
    }

    /// Drop a reference, closing the backend when the last one goes.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        if state.refs == 0 {
            return;
        }
        state.refs -= 1;
        if state.refs == 0 {
            self.diag.debug(format_args!("Closing random source."));
            state.backend.close();
        }
    }

    /// Whether at least one reference is held.
    pub fn is_initialized(&self) -> bool {
        self.lock().refs > 0
    }

    /// Fill `buf` with randomness of the requested quality.
    ///
    /// The shared lock only covers non-blocking work. Key reads from the
    /// blocking device run on a detached reader once the lock is released.
    pub fn get(&self, quality: RandomQuality, buf: &mut [u8], blocking: Blocking) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let kind = self.kind_for(quality);
        let len = buf.len();
        let reader = {
            let mut state = self.lock();
            if state.refs == 0 {
                return Err(Error::EntropyUnavailable(
                    "random source is not initialised".to_string(),
                ));
            }
            if kind != EntropyKind::Blocking {
                return state
                    .backend
                    .fill(kind, buf, blocking)
                    .map_err(|e| self.fill_error(e, quality, len));
            }
            state.backend.blocking_reader()
        };

        reader
            .and_then(|mut reader| reader.fill(buf, blocking))
            .map_err(|e| self.fill_error(e, quality, len))
    }

    /// Fill `buf` at the process default tier.
    pub fn fill_default(&self, buf: &mut [u8]) -> Result<()> {
        self.get(self.default_quality, buf, Blocking::Allowed)
    }

    /// Tier used by [`RandomSource::fill_default`].
    pub fn default_quality_policy(&self) -> RandomQuality {
        self.default_quality
    }

    /// Source backing the key tier.
    pub fn default_key_rng(&self) -> KeyRng {
        self.key_rng
    }

    fn kind_for(&self, quality: RandomQuality) -> EntropyKind {
        match (quality, self.key_rng) {
            (RandomQuality::Normal, _) => EntropyKind::Fast,
            (RandomQuality::Salt, _) | (RandomQuality::Key, KeyRng::Urandom) => EntropyKind::System,
            (RandomQuality::Key, KeyRng::Random) => EntropyKind::Blocking,
        }
    }

    fn fill_error(&self, e: io::Error, quality: RandomQuality, len: usize) -> Error {
        if e.kind() == io::ErrorKind::WouldBlock {
            return Error::WouldBlock;
        }
        self.diag.error(format_args!(
            "Cannot read {} bytes of {:?} quality randomness: {}",
            len, quality, e
        ));
        Error::EntropyUnavailable(e.to_string())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for RandomSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RandomSource")
            .field("key_rng", &self.key_rng)
            .field("default_quality", &self.default_quality)
            .finish_non_exhaustive()
    }
}

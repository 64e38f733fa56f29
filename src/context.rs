//! Process-wide resources shared by the core components.
//!
//! A [`CryptContext`] owns the memory lock, the random source, diagnostics
//! and configuration, and hands them to the key store, device guard and
//! wiper. The random source is initialised when the context is built and
//! shut down when it is dropped.

use crate::config::CoreConfig;
use crate::device::{DeviceGuard, DeviceProbe, SystemProbe};
use crate::error::{Error, Result};
use crate::logging::{Diagnostics, LogCrateLogger, Logger};
use crate::memory::{MemoryLock, MemoryPinner, ProcessPinner};
use crate::random::{EntropyBackend, RandomSource, SystemEntropy};
use crate::volume_key::VolumeKeyStore;
use crate::wipe::Wiper;
use std::fmt;
use std::sync::Arc;

/// Yes/no prompt for destructive operations.
pub trait Confirm: Send + Sync {
    fn confirm(&self, message: &str) -> bool;
}

impl<F> Confirm for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn confirm(&self, message: &str) -> bool {
        self(message)
    }
}

/// Builder for [`CryptContext`]. Every collaborator has a system default.
pub struct CryptContextBuilder {
    config: CoreConfig,
    logger: Option<Arc<dyn Logger>>,
    confirm: Option<Arc<dyn Confirm>>,
    pinner: Option<Box<dyn MemoryPinner>>,
    entropy: Option<Box<dyn EntropyBackend>>,
    probe: Option<Arc<dyn DeviceProbe>>,
}

impl CryptContextBuilder {
    pub fn new() -> Self {
        Self {
            config: CoreConfig::default(),
            logger: None,
            confirm: None,
            pinner: None,
            entropy: None,
            probe: None,
        }
    }

    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Prompt asked before wiping. Without one, wipes proceed.
    pub fn confirm(mut self, confirm: impl Confirm + 'static) -> Self {
        self.confirm = Some(Arc::new(confirm));
        self
    }

    pub fn memory_pinner(mut self, pinner: Box<dyn MemoryPinner>) -> Self {
        self.pinner = Some(pinner);
        self
    }

    pub fn entropy_backend(mut self, backend: Box<dyn EntropyBackend>) -> Self {
        self.entropy = Some(backend);
        self
    }

    pub fn device_probe(mut self, probe: Arc<dyn DeviceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Validate the configuration and initialise the random source.
    pub fn build(self) -> Result<CryptContext> {
        self.config.validate().map_err(Error::Config)?;
        let config = self.config;

        let logger = self.logger.unwrap_or_else(|| Arc::new(LogCrateLogger));
        let diag = Arc::new(Diagnostics::new(logger, config.debug));

        let pinner = self
            .pinner
            .unwrap_or_else(|| Box::new(ProcessPinner::new(config.raise_priority, diag.clone())));
        let memlock = Arc::new(MemoryLock::new(pinner, diag.clone()));

        let entropy = self
            .entropy
            .unwrap_or_else(|| Box::new(SystemEntropy::new(diag.clone())));
        let random = Arc::new(RandomSource::new(
            entropy,
            config.default_key_rng,
            config.default_quality,
            diag.clone(),
        ));
        random.init()?;

        let probe = self.probe.unwrap_or_else(|| Arc::new(SystemProbe::new()));
        let guard = DeviceGuard::new(probe, diag.clone(), config.disk_alignment);

        let keys = VolumeKeyStore::new(
            memlock.clone(),
            random.clone(),
            diag.clone(),
            config.require_locked_memory,
        );
        let wiper = Wiper::new(
            random.clone(),
            guard.clone(),
            diag.clone(),
            config.wipe.clone(),
            self.confirm,
        )?;

        diag.debug(format_args!("Crypto context initialised."));
        Ok(CryptContext {
            config,
            diag,
            memlock,
            random,
            keys,
            guard,
            wiper,
        })
    }
}

impl Default for CryptContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Owner of the process-wide core state.
pub struct CryptContext {
    config: CoreConfig,
    diag: Arc<Diagnostics>,
    memlock: Arc<MemoryLock>,
    random: Arc<RandomSource>,
    keys: VolumeKeyStore,
    guard: DeviceGuard,
    wiper: Wiper,
}

impl CryptContext {
    pub fn builder() -> CryptContextBuilder {
        CryptContextBuilder::new()
    }

    /// Context with system defaults and the given configuration.
    pub fn new(config: CoreConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diag
    }

    pub fn memory_lock(&self) -> &Arc<MemoryLock> {
        &self.memlock
    }

    pub fn random(&self) -> &Arc<RandomSource> {
        &self.random
    }

    pub fn key_store(&self) -> &VolumeKeyStore {
        &self.keys
    }

    pub fn device_guard(&self) -> &DeviceGuard {
        &self.guard
    }

    pub fn wiper(&self) -> &Wiper {
        &self.wiper
    }
}

impl Drop for CryptContext {
    fn drop(&mut self) {
        self.random.shutdown();
        self.diag.debug(format_args!("Crypto context released."));
    }
}

impl fmt::Debug for CryptContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptContext")
            .field("config", &self.config)
            .field("memlock", &self.memlock)
            .field("random", &self.random)
            .finish_non_exhaustive()
    }
}

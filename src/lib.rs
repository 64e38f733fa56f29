//! Volume key core
//!
//! The trust core beneath a block-device encryption library: it generates,
//! holds and destroys raw volume keys, erases device ranges, and checks that a
//! target device is safe to use.
//!
//! # Components
//!
//! - **VolumeKeyStore**: key allocation and generation; keys zero themselves on drop
//! - **RandomSource**: tiered entropy with explicit init/shutdown
//! - **Wiper**: multi-pass erasure with media-aware strategies
//! - **DeviceGuard**: readiness, exclusivity and alignment validation
//! - **BlockDevice**: sector-aligned I/O with read-modify-write of partial sectors
//! - **MemoryLock**: reference-counted `mlockall` guard
//!
//! # Example
//!
//! ```rust,no_run
//! use volume_keycore::{CoreConfig, CryptContext, WipeFlags, WipeSpec, WipeStrategy};
//! use std::path::PathBuf;
//!
//! let ctx = CryptContext::new(CoreConfig::default()).unwrap();
//!
//! let key = ctx.key_store().generate(64).unwrap();
//! assert_eq!(key.len(), 64);
//! ctx.key_store().release(key);
//!
//! ctx.wiper()
//!     .wipe(WipeSpec {
//!         path: PathBuf::from("/dev/sdx1"),
//!         offset: 0,
//!         sectors: 2048,
//!         strategy: WipeStrategy::DiskAdaptive,
//!         flags: WipeFlags::NO_CONFIRM,
//!     })
//!     .unwrap();
//! ```

pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod logging;
pub mod memory;
pub mod random;
pub mod storage;
pub mod volume_key;
pub mod wipe;

pub use config::{CoreConfig, WipeConfig};
pub use context::{Confirm, CryptContext, CryptContextBuilder};
pub use device::{DeviceCheck, DeviceFlags, DeviceGuard, ExclusivityState, ValidatedDevice};
pub use error::{Error, Result};
pub use logging::{Diagnostics, LogLevel, Logger};
pub use random::{Blocking, KeyRng, RandomQuality, RandomSource};
pub use storage::BlockDevice;
pub use volume_key::{KeyMaterial, VolumeKeyStore};
pub use wipe::{CancelToken, WipeFlags, WipeJob, WipeReport, WipeSpec, WipeState, WipeStrategy, Wiper};

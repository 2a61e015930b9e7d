#![warn(missing_docs)]

//! ZenFS core: a filesystem for zoned block devices.
//!
//! File data is appended into zones as extents. File metadata lives in a
//! CRC-framed log in dedicated meta zones, starting with a superblock and a
//! full snapshot and followed by incremental records. A mount replays the
//! newest recoverable log and rolls to a fresh meta zone. A background worker
//! migrates live extents out of mostly-garbage zones so they can be reset.

pub mod aux_fs;
pub mod error;
pub mod file;
pub mod files;
pub mod fs;
pub mod gc;
pub mod metalog;
pub mod metrics;
pub mod options;
pub mod snapshot;
pub mod superblock;
pub mod zbd;

pub use aux_fs::{AuxFileLock, AuxFileSystem, LocalAuxFs};
pub use error::{ZenFsError, ZenFsResult};
pub use file::{WriteLifetimeHint, ZoneExtent, ZoneFile, ZonedReadableFile, ZonedWritableFile};
pub use files::{normalize_path, FileTable};
pub use fs::{ZenFs, ZENFS_NAME};
pub use gc::{select_victims, GcConfig, GcPhase, GcRunStat, GcWorker};
pub use metalog::{LogRead, ZenMetaLog};
pub use metrics::{GcTotals, NoZenFsMetrics, SpaceReport, ZenFsMetrics, ZenFsReport};
pub use options::{MkfsOptions, ZenFsOptions};
pub use snapshot::{recover_from, DeletionRecord, FileRecord, MetaRecord, RecoveryStats, SnapshotRecord};
pub use superblock::{Superblock, CURRENT_SUPERBLOCK_VERSION, SUPERBLOCK_MAGIC};
pub use zbd::{DeviceGeometry, MemoryBackend, Zone, ZoneLease, ZoneUsage, ZonedBackend, ZonedBlockDevice, META_ZONES};

/// Version string recorded in superblocks written by this build.
pub const ZENFS_VERSION: &str = concat!("zenfs-", env!("CARGO_PKG_VERSION"));

//! Superblock codec: filesystem identity, static geometry and feature flags.
//!
//! The superblock is a fixed 512-byte little-endian record. It is the first
//! record of every meta zone and carries a sequence number that grows with
//! every meta zone roll, so mount can tell which meta zone is the newest.

use std::fmt::Write as _;

use tracing::debug;

use crate::error::{ZenFsError, ZenFsResult};
use crate::options::MkfsOptions;
use crate::zbd::DeviceGeometry;

/// Superblock magic: "ZENF" = 0x5A454E46
pub const SUPERBLOCK_MAGIC: u32 = 0x5A454E46;
/// Current superblock format version
pub const CURRENT_SUPERBLOCK_VERSION: u32 = 2;
/// Size of the encoded superblock in bytes
pub const ENCODED_SIZE: usize = 512;
/// Default value of both flag words
pub const DEFAULT_FLAGS: u32 = 0;
/// General flag: background garbage collection is enabled
pub const FLAGS_ENABLE_GC: u32 = 1 << 0;
/// WAL placement flag: WAL files live on the auxiliary filesystem
pub const FLAGS_WAL_ON_AUX: u32 = 1 << 0;

const UUID_CAP: usize = 37;
const AUX_PATH_CAP: usize = 256;
const VERSION_STR_CAP: usize = 64;

const OFF_MAGIC: usize = 0;
const OFF_UUID: usize = OFF_MAGIC + 4;
const OFF_SEQUENCE: usize = OFF_UUID + UUID_CAP;
const OFF_VERSION: usize = OFF_SEQUENCE + 4;
const OFF_FLAGS: usize = OFF_VERSION + 4;
const OFF_WAL_FLAGS: usize = OFF_FLAGS + 4;
const OFF_BLOCK_SIZE: usize = OFF_WAL_FLAGS + 4;
const OFF_ZONE_SIZE: usize = OFF_BLOCK_SIZE + 4;
const OFF_NR_ZONES: usize = OFF_ZONE_SIZE + 4;
const OFF_AUX_PATH: usize = OFF_NR_ZONES + 4;
const OFF_FINISH_THRESHOLD: usize = OFF_AUX_PATH + AUX_PATH_CAP;
const OFF_VERSION_STR: usize = OFF_FINISH_THRESHOLD + 4;
const OFF_RESERVED: usize = OFF_VERSION_STR + VERSION_STR_CAP;
const RESERVED_SIZE: usize = ENCODED_SIZE - OFF_RESERVED;

/// Filesystem superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    uuid: String,
    sequence: u32,
    superblock_version: u32,
    flags: u32,
    wal_flags: u32,
    block_size: u32,
    zone_size: u32,
    nr_zones: u32,
    aux_fs_path: String,
    finish_threshold: u32,
    zenfs_version: String,
}

impl Superblock {
    /// Creates a superblock for a freshly formatted device.
    pub fn new(geometry: DeviceGeometry, opts: &MkfsOptions) -> ZenFsResult<Self> {
        if opts.aux_fs_path.len() >= AUX_PATH_CAP {
            return Err(ZenFsError::InvalidArgument(format!(
                "aux path is {} bytes, at most {} allowed",
                opts.aux_fs_path.len(),
                AUX_PATH_CAP - 1
            )));
        }
        if opts.aux_fs_path.as_bytes().contains(&0) {
            return Err(ZenFsError::InvalidArgument(
                "aux path contains a NUL byte".to_string(),
            ));
        }
        let zone_size = u32::try_from(geometry.zone_size_blocks()).map_err(|_| {
            ZenFsError::InvalidArgument(format!(
                "zone size of {} blocks does not fit the superblock",
                geometry.zone_size_blocks()
            ))
        })?;

        let mut flags = DEFAULT_FLAGS;
        if opts.enable_gc {
            flags |= FLAGS_ENABLE_GC;
        }
        let mut wal_flags = DEFAULT_FLAGS;
        if opts.wal_on_aux {
            wal_flags |= FLAGS_WAL_ON_AUX;
        }

        let mut version = crate::ZENFS_VERSION.to_string();
        truncate_at_char_boundary(&mut version, VERSION_STR_CAP - 1);

        Ok(Self {
            uuid: uuid::Uuid::new_v4().hyphenated().to_string(),
            sequence: 0,
            superblock_version: CURRENT_SUPERBLOCK_VERSION,
            flags,
            wal_flags,
            block_size: geometry.block_size,
            zone_size,
            nr_zones: geometry.nr_zones,
            aux_fs_path: opts.aux_fs_path.clone(),
            finish_threshold: opts.finish_threshold,
            zenfs_version: version,
        })
    }

    /// Encodes the superblock into its fixed 512-byte layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; ENCODED_SIZE];
        put_u32(&mut buf, OFF_MAGIC, SUPERBLOCK_MAGIC);
        put_cstr(&mut buf, OFF_UUID, UUID_CAP, &self.uuid);
        put_u32(&mut buf, OFF_SEQUENCE, self.sequence);
        put_u32(&mut buf, OFF_VERSION, self.superblock_version);
        put_u32(&mut buf, OFF_FLAGS, self.flags);
        put_u32(&mut buf, OFF_WAL_FLAGS, self.wal_flags);
        put_u32(&mut buf, OFF_BLOCK_SIZE, self.block_size);
        put_u32(&mut buf, OFF_ZONE_SIZE, self.zone_size);
        put_u32(&mut buf, OFF_NR_ZONES, self.nr_zones);
        put_cstr(&mut buf, OFF_AUX_PATH, AUX_PATH_CAP, &self.aux_fs_path);
        put_u32(&mut buf, OFF_FINISH_THRESHOLD, self.finish_threshold);
        put_cstr(&mut buf, OFF_VERSION_STR, VERSION_STR_CAP, &self.zenfs_version);
        debug_assert_eq!(RESERVED_SIZE, 119);
        buf
    }

    /// Decodes a superblock, rejecting bad size and magic as corruption and
    /// an unknown format version as [`ZenFsError::UnsupportedVersion`].
    pub fn decode(buf: &[u8]) -> ZenFsResult<Self> {
        if buf.len() != ENCODED_SIZE {
            return Err(ZenFsError::corruption(
                "superblock",
                format!("size {} != {}", buf.len(), ENCODED_SIZE),
            ));
        }
        let magic = get_u32(buf, OFF_MAGIC);
        if magic != SUPERBLOCK_MAGIC {
            return Err(ZenFsError::corruption(
                "superblock",
                format!("bad magic {:#010x}", magic),
            ));
        }
        let superblock_version = get_u32(buf, OFF_VERSION);
        if superblock_version != CURRENT_SUPERBLOCK_VERSION {
            return Err(ZenFsError::UnsupportedVersion {
                expected: CURRENT_SUPERBLOCK_VERSION,
                found: superblock_version,
            });
        }

        let sb = Self {
            uuid: get_cstr(buf, OFF_UUID, UUID_CAP, "uuid")?,
            sequence: get_u32(buf, OFF_SEQUENCE),
            superblock_version,
            flags: get_u32(buf, OFF_FLAGS),
            wal_flags: get_u32(buf, OFF_WAL_FLAGS),
            block_size: get_u32(buf, OFF_BLOCK_SIZE),
            zone_size: get_u32(buf, OFF_ZONE_SIZE),
            nr_zones: get_u32(buf, OFF_NR_ZONES),
            aux_fs_path: get_cstr(buf, OFF_AUX_PATH, AUX_PATH_CAP, "aux path")?,
            finish_threshold: get_u32(buf, OFF_FINISH_THRESHOLD),
            zenfs_version: get_cstr(buf, OFF_VERSION_STR, VERSION_STR_CAP, "version string")?,
        };
        debug!(uuid = %sb.uuid, sequence = sb.sequence, "decoded superblock");
        Ok(sb)
    }

    /// Checks the recorded geometry against the device.
    pub fn compatible_with(&self, geometry: &DeviceGeometry) -> ZenFsResult<()> {
        if self.block_size != geometry.block_size {
            return Err(ZenFsError::GeometryMismatch {
                field: "block size",
                recorded: self.block_size as u64,
                device: geometry.block_size as u64,
            });
        }
        if self.zone_size as u64 != geometry.zone_size_blocks() {
            return Err(ZenFsError::GeometryMismatch {
                field: "zone size",
                recorded: self.zone_size as u64,
                device: geometry.zone_size_blocks(),
            });
        }
        if self.nr_zones != geometry.nr_zones {
            return Err(ZenFsError::GeometryMismatch {
                field: "nr of zones",
                recorded: self.nr_zones as u64,
                device: geometry.nr_zones as u64,
            });
        }
        Ok(())
    }

    /// Advances the sequence number ahead of writing this superblock to a new meta zone.
    pub fn bump_sequence(&mut self) {
        self.sequence = self.sequence.wrapping_add(1);
    }

    /// Sequence number of this superblock.
    pub fn seq(&self) -> u32 {
        self.sequence
    }

    /// Filesystem UUID in 36-character text form.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Mount path of the auxiliary filesystem.
    pub fn aux_fs_path(&self) -> &str {
        &self.aux_fs_path
    }

    /// Percentage of remaining zone capacity below which open zones are finished.
    pub fn finish_threshold(&self) -> u32 {
        self.finish_threshold
    }

    /// Whether background garbage collection is enabled.
    pub fn is_gc_enabled(&self) -> bool {
        self.flags & FLAGS_ENABLE_GC != 0
    }

    /// Whether WAL files are placed on the auxiliary filesystem.
    pub fn is_wal_on_aux(&self) -> bool {
        self.wal_flags & FLAGS_WAL_ON_AUX != 0
    }

    /// Version string of the build that formatted the filesystem.
    pub fn zenfs_version(&self) -> &str {
        &self.zenfs_version
    }

    /// Zone size in blocks recorded at format time.
    pub fn zone_size_blocks(&self) -> u32 {
        self.zone_size
    }

    /// Human-readable dump of all fields.
    pub fn report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Magic:\t\t{:#010x}", SUPERBLOCK_MAGIC);
        let _ = writeln!(out, "UUID:\t\t{}", self.uuid);
        let _ = writeln!(out, "Sequence Nr:\t{}", self.sequence);
        let _ = writeln!(out, "SB Version:\t{}", self.superblock_version);
        let _ = writeln!(out, "Flags [Decimal]:\t{} (GC {})", self.flags, on_off(self.is_gc_enabled()));
        let _ = writeln!(out, "WAL Flags:\t{} (WAL on aux {})", self.wal_flags, on_off(self.is_wal_on_aux()));
        let _ = writeln!(out, "Block Size [Bytes]:\t{}", self.block_size);
        let _ = writeln!(out, "Zone Size [Blocks]:\t{}", self.zone_size);
        let _ = writeln!(out, "Nr of Zones:\t{}", self.nr_zones);
        let _ = writeln!(out, "Finish Threshold [%]:\t{}", self.finish_threshold);
        let _ = writeln!(out, "Aux Filesystem:\t{}", self.aux_fs_path);
        let _ = writeln!(out, "ZenFS version:\t{}", self.zenfs_version);
        out
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "enabled"
    } else {
        "disabled"
    }
}

fn truncate_at_char_boundary(s: &mut String, max: usize) {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
}

fn put_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(bytes)
}

fn put_cstr(buf: &mut [u8], off: usize, cap: usize, s: &str) {
    let n = s.len().min(cap - 1);
    buf[off..off + n].copy_from_slice(&s.as_bytes()[..n]);
}

fn get_cstr(buf: &[u8], off: usize, cap: usize, field: &str) -> ZenFsResult<String> {
    let raw = &buf[off..off + cap];
    let len = raw.iter().position(|&b| b == 0).ok_or_else(|| {
        ZenFsError::corruption("superblock", format!("{} is not NUL-terminated", field))
    })?;
    String::from_utf8(raw[..len].to_vec())
        .map_err(|_| ZenFsError::corruption("superblock", format!("{} is not valid UTF-8", field)))
}

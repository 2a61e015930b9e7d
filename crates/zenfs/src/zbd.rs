//! Zoned block device support.
//!
//! Zones must be written sequentially at their write pointer and can only be
//! reclaimed by a reset. This module provides the raw backend abstraction
//! ([`ZonedBackend`]), an in-memory backend, and the [`ZonedBlockDevice`]
//! that tracks write pointers, live data, leases and lifetime placement.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ZenFsError, ZenFsResult};
use crate::file::{WriteLifetimeHint, ZoneExtent};

/// Number of zones reserved at the start of the device for the metadata log.
pub const META_ZONES: usize = 3;

/// Lifetime distance used when a zone is a poor match for a file.
const LIFETIME_DIFF_NOT_GOOD: u8 = 100;
/// Lifetime distance used when zone and file lifetimes are equal.
const LIFETIME_DIFF_COULD_BE_WORSE: u8 = 50;

/// Static geometry of a zoned device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGeometry {
    /// Logical block size in bytes.
    pub block_size: u32,
    /// Zone size in bytes.
    pub zone_size: u64,
    /// Number of zones.
    pub nr_zones: u32,
}

impl DeviceGeometry {
    /// Zone size expressed in blocks.
    pub fn zone_size_blocks(&self) -> u64 {
        self.zone_size / self.block_size as u64
    }
}

/// Raw zone I/O. Implementations can be a real ZNS device or memory.
pub trait ZonedBackend: Send + Sync {
    /// Returns the device geometry.
    fn geometry(&self) -> DeviceGeometry;

    /// Reads `buf.len()` bytes at an absolute byte offset inside one zone.
    /// Bytes past the write pointer read as zero.
    fn read(&self, offset: u64, buf: &mut [u8]) -> ZenFsResult<()>;

    /// Writes `data` at `offset`, which must equal the zone's write pointer.
    fn write(&self, offset: u64, data: &[u8]) -> ZenFsResult<()>;

    /// Resets the zone starting at `zone_start` to empty.
    fn reset(&self, zone_start: u64) -> ZenFsResult<()>;

    /// Moves the write pointer of the zone to its end.
    fn finish(&self, zone_start: u64) -> ZenFsResult<()>;

    /// Returns the absolute write pointer of the zone.
    fn write_pointer(&self, zone_start: u64) -> ZenFsResult<u64>;
}

#[derive(Debug, Default)]
struct MemZone {
    data: Vec<u8>,
    finished: bool,
}

/// In-memory zoned backend for testing.
/// Contents survive as long as the backend does, so dropping a filesystem
/// and re-opening the backend simulates a power cycle.
pub struct MemoryBackend {
    geometry: DeviceGeometry,
    zones: Vec<Mutex<MemZone>>,
}

impl MemoryBackend {
    /// Creates a backend with `nr_zones` empty zones of `zone_blocks` blocks.
    pub fn new(block_size: u32, zone_blocks: u64, nr_zones: u32) -> Self {
        let geometry = DeviceGeometry {
            block_size,
            zone_size: zone_blocks * block_size as u64,
            nr_zones,
        };
        let zones = (0..nr_zones).map(|_| Mutex::new(MemZone::default())).collect();
        debug!(
            block_size,
            zone_blocks, nr_zones, "created in-memory zoned backend"
        );
        Self { geometry, zones }
    }

    fn locate(&self, offset: u64, len: usize) -> ZenFsResult<(usize, usize)> {
        let zone_size = self.geometry.zone_size;
        let idx = (offset / zone_size) as usize;
        let rel = (offset % zone_size) as usize;
        if idx >= self.zones.len() || rel as u64 + len as u64 > zone_size {
            return Err(ZenFsError::InvalidArgument(format!(
                "range {}+{} crosses a zone boundary or the device end",
                offset, len
            )));
        }
        Ok((idx, rel))
    }
}

impl ZonedBackend for MemoryBackend {
    fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> ZenFsResult<()> {
        let (idx, rel) = self.locate(offset, buf.len())?;
        let zone = self.zones[idx].lock();
        buf.fill(0);
        if rel < zone.data.len() {
            let n = (zone.data.len() - rel).min(buf.len());
            buf[..n].copy_from_slice(&zone.data[rel..rel + n]);
        }
        Ok(())
    }

    fn write(&self, offset: u64, data: &[u8]) -> ZenFsResult<()> {
        let (idx, rel) = self.locate(offset, data.len())?;
        let mut zone = self.zones[idx].lock();
        if zone.finished || rel != zone.data.len() {
            return Err(ZenFsError::InvalidArgument(format!(
                "write at {} is not at the write pointer of zone {}",
                offset, idx
            )));
        }
        zone.data.extend_from_slice(data);
        Ok(())
    }

    fn reset(&self, zone_start: u64) -> ZenFsResult<()> {
        let (idx, _) = self.locate(zone_start, 0)?;
        let mut zone = self.zones[idx].lock();
        zone.data.clear();
        zone.finished = false;
        Ok(())
    }

    fn finish(&self, zone_start: u64) -> ZenFsResult<()> {
        let (idx, _) = self.locate(zone_start, 0)?;
        self.zones[idx].lock().finished = true;
        Ok(())
    }

    fn write_pointer(&self, zone_start: u64) -> ZenFsResult<u64> {
        let (idx, _) = self.locate(zone_start, 0)?;
        let zone = self.zones[idx].lock();
        if zone.finished {
            Ok(zone_start + self.geometry.zone_size)
        } else {
            Ok(zone_start + zone.data.len() as u64)
        }
    }
}

/// One zone of the device with its in-memory accounting.
pub struct Zone {
    nr: u64,
    start: u64,
    max_capacity: u64,
    block_size: u64,
    wp: AtomicU64,
    used_capacity: AtomicU64,
    busy: AtomicBool,
    lifetime: AtomicU8,
    backend: Arc<dyn ZonedBackend>,
}

impl Zone {
    fn new(nr: u64, backend: Arc<dyn ZonedBackend>) -> ZenFsResult<Self> {
        let geometry = backend.geometry();
        let start = nr * geometry.zone_size;
        let wp = backend.write_pointer(start)?;
        Ok(Self {
            nr,
            start,
            max_capacity: geometry.zone_size,
            block_size: geometry.block_size as u64,
            wp: AtomicU64::new(wp),
            used_capacity: AtomicU64::new(0),
            busy: AtomicBool::new(false),
            lifetime: AtomicU8::new(WriteLifetimeHint::NotSet as u8),
            backend,
        })
    }

    /// Zone number (0-based).
    pub fn nr(&self) -> u64 {
        self.nr
    }

    /// Absolute byte offset of the zone start.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Zone size in bytes.
    pub fn max_capacity(&self) -> u64 {
        self.max_capacity
    }

    /// Absolute write pointer.
    pub fn write_pointer(&self) -> u64 {
        self.wp.load(Ordering::Acquire)
    }

    /// Bytes written since the last reset, including padding.
    pub fn written(&self) -> u64 {
        self.write_pointer() - self.start
    }

    /// Bytes that can still be appended.
    pub fn capacity_left(&self) -> u64 {
        (self.start + self.max_capacity).saturating_sub(self.write_pointer())
    }

    /// Bytes referenced by live extents.
    pub fn used_capacity(&self) -> u64 {
        self.used_capacity.load(Ordering::Acquire)
    }

    /// True if no data has been written since the last reset.
    pub fn is_empty(&self) -> bool {
        self.write_pointer() == self.start
    }

    /// True if the write pointer reached the zone end.
    pub fn is_full(&self) -> bool {
        self.capacity_left() == 0
    }

    /// True if any live extent references this zone.
    pub fn is_used(&self) -> bool {
        self.used_capacity() > 0
    }

    /// True while someone holds the zone lease.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Lifetime class the zone was opened for.
    pub fn lifetime(&self) -> WriteLifetimeHint {
        WriteLifetimeHint::from_u8(self.lifetime.load(Ordering::Acquire))
    }

    /// Returns true if `offset` lies inside this zone.
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.start + self.max_capacity
    }

    /// Reads bytes at an absolute offset inside this zone.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> ZenFsResult<()> {
        self.backend.read(offset, buf)
    }

    /// Takes the zone lease. Returns `None` if it is already held.
    pub fn try_acquire(self: &Arc<Self>) -> Option<ZoneLease> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ZoneLease {
                zone: Arc::clone(self),
            })
    }

    pub(crate) fn add_used(&self, bytes: u64) {
        self.used_capacity.fetch_add(bytes, Ordering::AcqRel);
    }

    pub(crate) fn sub_used(&self, bytes: u64) {
        let _ = self
            .used_capacity
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    fn clear_used(&self) {
        self.used_capacity.store(0, Ordering::Release);
    }

    fn snapshot(&self) -> ZoneUsage {
        ZoneUsage {
            zone: self.nr,
            start: self.start,
            max_capacity: self.max_capacity,
            written: self.written(),
            used_capacity: self.used_capacity(),
            full: self.is_full(),
            busy: self.is_busy(),
        }
    }
}

impl std::fmt::Debug for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zone")
            .field("nr", &self.nr)
            .field("start", &self.start)
            .field("wp", &self.write_pointer())
            .field("used", &self.used_capacity())
            .field("busy", &self.is_busy())
            .finish()
    }
}

/// Exclusive right to append to, reset or finish a zone.
/// The lease is released when dropped.
#[derive(Debug)]
pub struct ZoneLease {
    zone: Arc<Zone>,
}

impl ZoneLease {
    /// The leased zone.
    pub fn zone(&self) -> &Arc<Zone> {
        &self.zone
    }

    /// Appends `data` padded with zeroes to a block multiple.
    /// Returns the absolute offset the data was written to.
    pub fn append(&self, data: &[u8]) -> ZenFsResult<u64> {
        let zone = &self.zone;
        let bs = zone.block_size;
        let padded = (data.len() as u64).div_ceil(bs) * bs;
        let available = zone.capacity_left();
        if padded > available {
            return Err(ZenFsError::NoSpace {
                zone: zone.nr,
                requested: padded,
                available,
            });
        }

        let offset = zone.write_pointer();
        if padded == data.len() as u64 {
            zone.backend.write(offset, data)?;
        } else {
            let mut buf = Vec::with_capacity(padded as usize);
            buf.extend_from_slice(data);
            buf.resize(padded as usize, 0);
            zone.backend.write(offset, &buf)?;
        }
        zone.wp.store(offset + padded, Ordering::Release);
        Ok(offset)
    }

    /// Resets the zone to empty.
    pub fn reset(&self) -> ZenFsResult<()> {
        self.zone.backend.reset(self.zone.start)?;
        self.zone.wp.store(self.zone.start, Ordering::Release);
        self.zone.clear_used();
        self.zone
            .lifetime
            .store(WriteLifetimeHint::NotSet as u8, Ordering::Release);
        debug!(zone = self.zone.nr, "zone reset");
        Ok(())
    }

    /// Finishes the zone so no further appends are accepted.
    pub fn finish(&self) -> ZenFsResult<()> {
        self.zone.backend.finish(self.zone.start)?;
        self.zone
            .wp
            .store(self.zone.start + self.zone.max_capacity, Ordering::Release);
        debug!(zone = self.zone.nr, "zone finished");
        Ok(())
    }

    fn set_lifetime(&self, hint: WriteLifetimeHint) {
        self.zone.lifetime.store(hint as u8, Ordering::Release);
    }
}

impl Deref for ZoneLease {
    type Target = Zone;

    fn deref(&self) -> &Zone {
        &self.zone
    }
}

impl Drop for ZoneLease {
    fn drop(&mut self) {
        let was_busy = self.zone.busy.swap(false, Ordering::AcqRel);
        debug_assert!(was_busy, "zone {} lease released twice", self.zone.nr);
    }
}

/// Point-in-time usage of one zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneUsage {
    /// Zone number.
    pub zone: u64,
    /// Absolute start offset.
    pub start: u64,
    /// Zone size in bytes.
    pub max_capacity: u64,
    /// Bytes written since the last reset.
    pub written: u64,
    /// Bytes referenced by live extents.
    pub used_capacity: u64,
    /// Whether the zone accepts no further appends.
    pub full: bool,
    /// Whether the zone lease is held.
    pub busy: bool,
}

impl ZoneUsage {
    /// Approximate garbage percentage (0-100) of the zone.
    pub fn garbage_pct(&self) -> u64 {
        if self.max_capacity == 0 {
            return 0;
        }
        100 - (100 * self.used_capacity.min(self.max_capacity)) / self.max_capacity
    }
}

#[derive(Debug, Default)]
struct DeviceStats {
    zone_lifetimes: [AtomicU64; 6],
    lifetime_diff: [AtomicU64; 4],
    same_lifetime: [AtomicU64; 6],
    zone_diff: [AtomicU64; 6],
    reset_calls: AtomicU64,
    reset_zones: AtomicU64,
    reset_util_max: AtomicU64,
    reset_util_sum: AtomicU64,
}

/// Lifetime placement and reset statistics drained from a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatsReport {
    /// Zones opened per lifetime class, indexed by hint value.
    pub zone_lifetimes: [u64; 6],
    /// Allocations into an open zone by lifetime distance (0, 1, 2, 3+).
    pub lifetime_diff: [u64; 4],
    /// Allocations into an open zone of the same lifetime, by hint value.
    pub same_lifetime: [u64; 6],
    /// Allocations into an open zone by absolute distance between the
    /// zone's lifetime and the file's hint, mismatches included.
    pub zone_diff: [u64; 6],
    /// Calls to reset unused zones.
    pub reset_calls: u64,
    /// Zones reset.
    pub reset_zones: u64,
    /// Highest written percentage of a zone at reset.
    pub reset_util_max: u64,
    /// Sum of written percentages of zones at reset.
    pub reset_util_sum: u64,
}

/// Zone bookkeeping on top of a [`ZonedBackend`].
pub struct ZonedBlockDevice {
    backend: Arc<dyn ZonedBackend>,
    geometry: DeviceGeometry,
    zones: Vec<Arc<Zone>>,
    alloc_mtx: Mutex<()>,
    stats: DeviceStats,
}

impl ZonedBlockDevice {
    /// Opens a device, reading every zone's write pointer from the backend.
    pub fn open(backend: Arc<dyn ZonedBackend>) -> ZenFsResult<Self> {
        let geometry = backend.geometry();
        if geometry.block_size == 0 || geometry.zone_size % geometry.block_size as u64 != 0 {
            return Err(ZenFsError::InvalidArgument(format!(
                "zone size {} is not a multiple of block size {}",
                geometry.zone_size, geometry.block_size
            )));
        }
        if (geometry.nr_zones as usize) <= META_ZONES {
            return Err(ZenFsError::InvalidArgument(format!(
                "device has {} zones, at least {} required",
                geometry.nr_zones,
                META_ZONES + 1
            )));
        }

        let zones = (0..geometry.nr_zones as u64)
            .map(|nr| Zone::new(nr, Arc::clone(&backend)).map(Arc::new))
            .collect::<ZenFsResult<Vec<_>>>()?;

        info!(
            block_size = geometry.block_size,
            zone_size = geometry.zone_size,
            nr_zones = geometry.nr_zones,
            "opened zoned block device"
        );

        Ok(Self {
            backend,
            geometry,
            zones,
            alloc_mtx: Mutex::new(()),
            stats: DeviceStats::default(),
        })
    }

    /// Returns the device geometry.
    pub fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> u32 {
        self.geometry.block_size
    }

    /// Zone size in bytes.
    pub fn zone_size(&self) -> u64 {
        self.geometry.zone_size
    }

    /// Number of zones.
    pub fn nr_zones(&self) -> u32 {
        self.geometry.nr_zones
    }

    /// Zones reserved for the metadata log.
    pub fn meta_zones(&self) -> &[Arc<Zone>] {
        &self.zones[..META_ZONES]
    }

    /// Zones holding file data.
    pub fn io_zones(&self) -> &[Arc<Zone>] {
        &self.zones[META_ZONES..]
    }

    /// Returns the zone containing `offset`.
    pub fn zone_for(&self, offset: u64) -> Option<&Arc<Zone>> {
        self.zones.get((offset / self.geometry.zone_size) as usize)
    }

    /// Reads bytes at an absolute offset.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> ZenFsResult<()> {
        self.backend.read(offset, buf)
    }

    /// Bytes that can still be appended to I/O zones.
    pub fn get_free_space(&self) -> u64 {
        self.io_zones().iter().map(|z| z.capacity_left()).sum()
    }

    /// Bytes referenced by live extents.
    pub fn get_used_space(&self) -> u64 {
        self.io_zones().iter().map(|z| z.used_capacity()).sum()
    }

    /// Written bytes no longer referenced by any extent.
    pub fn get_reclaimable_space(&self) -> u64 {
        self.io_zones()
            .iter()
            .map(|z| z.written().saturating_sub(z.used_capacity()))
            .sum()
    }

    /// Free space as a percentage of I/O zone capacity.
    pub fn free_percent(&self) -> u64 {
        let free = self.get_free_space();
        let non_free = self.get_used_space() + self.get_reclaimable_space();
        if free + non_free == 0 {
            return 0;
        }
        (100 * free) / (free + non_free)
    }

    /// Point-in-time usage of every I/O zone.
    pub fn io_zone_usage(&self) -> Vec<ZoneUsage> {
        self.io_zones().iter().map(|z| z.snapshot()).collect()
    }

    /// Leases a metadata zone, resetting it if it holds stale data.
    pub fn allocate_meta_zone(&self) -> ZenFsResult<ZoneLease> {
        let _guard = self.alloc_mtx.lock();
        for zone in self.meta_zones() {
            if let Some(lease) = zone.try_acquire() {
                if !lease.is_empty() {
                    lease.reset()?;
                }
                debug!(zone = lease.nr(), "allocated meta zone");
                return Ok(lease);
            }
        }
        Err(ZenFsError::NoFreeZone { purpose: "metadata" })
    }

    /// Leases an I/O zone for data with the given lifetime.
    ///
    /// An open zone whose lifetime is the closest value at or above the hint
    /// is preferred; otherwise an empty zone is opened for the hint.
    pub fn allocate_io_zone(&self, hint: WriteLifetimeHint) -> ZenFsResult<ZoneLease> {
        let _guard = self.alloc_mtx.lock();

        let mut best: Option<(u8, ZoneLease)> = None;
        for zone in self.io_zones() {
            if zone.is_empty() || zone.is_full() {
                continue;
            }
            let diff = lifetime_diff(zone.lifetime(), hint);
            if best.as_ref().is_some_and(|(d, _)| *d <= diff) {
                continue;
            }
            if let Some(lease) = zone.try_acquire() {
                best = Some((diff, lease));
            }
        }

        if let Some((diff, lease)) = best.take() {
            let distance = (lease.lifetime() as usize).abs_diff(hint as usize);
            self.stats.zone_diff[distance].fetch_add(1, Ordering::Relaxed);
            if diff != LIFETIME_DIFF_NOT_GOOD {
                self.record_lifetime_match(diff, hint);
                debug!(zone = lease.nr(), ?hint, diff, "allocated open io zone");
                return Ok(lease);
            }
            best = Some((diff, lease));
        }

        for zone in self.io_zones() {
            if !zone.is_empty() {
                continue;
            }
            if let Some(lease) = zone.try_acquire() {
                lease.set_lifetime(hint);
                self.stats.zone_lifetimes[hint as usize].fetch_add(1, Ordering::Relaxed);
                debug!(zone = lease.nr(), ?hint, "opened empty io zone");
                return Ok(lease);
            }
        }

        match best {
            Some((_, lease)) => {
                debug!(zone = lease.nr(), ?hint, "allocated mismatched io zone");
                Ok(lease)
            }
            None => Err(ZenFsError::NoFreeZone { purpose: "io" }),
        }
    }

    fn record_lifetime_match(&self, diff: u8, hint: WriteLifetimeHint) {
        if diff == LIFETIME_DIFF_COULD_BE_WORSE {
            self.stats.same_lifetime[hint as usize].fetch_add(1, Ordering::Relaxed);
        } else {
            let idx = (diff as usize).min(3);
            self.stats.lifetime_diff[idx].fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Resets written I/O zones that no live extent references.
    /// Returns the number of zones reset.
    pub fn reset_unused_io_zones(&self) -> ZenFsResult<usize> {
        self.stats.reset_calls.fetch_add(1, Ordering::Relaxed);
        let mut reset = 0;
        for zone in self.io_zones() {
            if zone.is_empty() || zone.is_used() {
                continue;
            }
            let Some(lease) = zone.try_acquire() else {
                continue;
            };
            if lease.is_empty() || lease.is_used() {
                continue;
            }
            let util = (100 * lease.written()) / lease.max_capacity();
            lease.reset()?;
            self.stats.reset_zones.fetch_add(1, Ordering::Relaxed);
            self.stats.reset_util_sum.fetch_add(util, Ordering::Relaxed);
            self.stats.reset_util_max.fetch_max(util, Ordering::Relaxed);
            reset += 1;
        }
        if reset > 0 {
            debug!(reset, "reset unused io zones");
        }
        Ok(reset)
    }

    /// Finishes open I/O zones whose remaining capacity is below
    /// `threshold_pct` percent of the zone size. Returns the count finished.
    pub fn finish_cheap_io_zones(&self, threshold_pct: u32) -> ZenFsResult<usize> {
        let mut finished = 0;
        for zone in self.io_zones() {
            if zone.is_empty() || zone.is_full() {
                continue;
            }
            if zone.capacity_left() * 100 >= threshold_pct as u64 * zone.max_capacity() {
                continue;
            }
            let Some(lease) = zone.try_acquire() else {
                continue;
            };
            lease.finish()?;
            finished += 1;
        }
        Ok(finished)
    }

    /// Drops the live-byte reference an extent holds on its zone.
    pub(crate) fn release_extent(&self, extent: &ZoneExtent) {
        if let Some(zone) = self.zone_for(extent.start) {
            zone.sub_used(extent.length);
        }
    }

    /// Rebuilds live-byte accounting from a full set of extents.
    pub(crate) fn recompute_used<'a>(&self, extents: impl IntoIterator<Item = &'a ZoneExtent>) {
        for zone in &self.zones {
            zone.clear_used();
        }
        for extent in extents {
            if let Some(zone) = self.zone_for(extent.start) {
                zone.add_used(extent.length);
            }
        }
    }

    /// Drains lifetime and reset statistics, zeroing the counters.
    pub fn take_stats(&self) -> DeviceStatsReport {
        let drain = |c: &AtomicU64| c.swap(0, Ordering::AcqRel);
        DeviceStatsReport {
            zone_lifetimes: std::array::from_fn(|i| drain(&self.stats.zone_lifetimes[i])),
            lifetime_diff: std::array::from_fn(|i| drain(&self.stats.lifetime_diff[i])),
            same_lifetime: std::array::from_fn(|i| drain(&self.stats.same_lifetime[i])),
            zone_diff: std::array::from_fn(|i| drain(&self.stats.zone_diff[i])),
            reset_calls: drain(&self.stats.reset_calls),
            reset_zones: drain(&self.stats.reset_zones),
            reset_util_max: drain(&self.stats.reset_util_max),
            reset_util_sum: drain(&self.stats.reset_util_sum),
        }
    }
}

/// Distance between a zone's lifetime and a file's hint; lower is better.
fn lifetime_diff(zone: WriteLifetimeHint, file: WriteLifetimeHint) -> u8 {
    if matches!(file, WriteLifetimeHint::NotSet | WriteLifetimeHint::None) {
        return if zone == file { 0 } else { LIFETIME_DIFF_NOT_GOOD };
    }
    let (z, f) = (zone as u8, file as u8);
    match z.cmp(&f) {
        std::cmp::Ordering::Greater => z - f,
        std::cmp::Ordering::Equal => LIFETIME_DIFF_COULD_BE_WORSE,
        std::cmp::Ordering::Less => LIFETIME_DIFF_NOT_GOOD,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_device() -> ZonedBlockDevice {
        let backend = Arc::new(MemoryBackend::new(4096, 16, 8));
        ZonedBlockDevice::open(backend).unwrap()
    }

    #[test]
    fn test_device_geometry() {
        let dev = test_device();
        assert_eq!(dev.block_size(), 4096);
        assert_eq!(dev.zone_size(), 16 * 4096);
        assert_eq!(dev.nr_zones(), 8);
        assert_eq!(dev.meta_zones().len(), META_ZONES);
        assert_eq!(dev.io_zones().len(), 8 - META_ZONES);
        assert_eq!(dev.geometry().zone_size_blocks(), 16);
    }

    #[test]
    fn test_too_few_zones() {
        let backend = Arc::new(MemoryBackend::new(4096, 16, META_ZONES as u32));
        assert!(ZonedBlockDevice::open(backend).is_err());
    }

    #[test]
    fn test_append_pads_to_block_size() {
        let dev = test_device();
        let lease = dev.allocate_io_zone(WriteLifetimeHint::Short).unwrap();
        let start = lease.start();

        let offset = lease.append(b"hello").unwrap();
        assert_eq!(offset, start);
        assert_eq!(lease.written(), 4096);

        let offset = lease.append(&[7u8; 4096]).unwrap();
        assert_eq!(offset, start + 4096);

        let mut buf = [0u8; 5];
        dev.read(start, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_append_no_space() {
        let dev = test_device();
        let lease = dev.allocate_io_zone(WriteLifetimeHint::Medium).unwrap();
        lease.append(&vec![0u8; 15 * 4096]).unwrap();

        let err = lease.append(&[1u8; 4097]).unwrap_err();
        assert!(err.is_no_space());

        lease.append(&[1u8; 4096]).unwrap();
        assert!(lease.is_full());
    }

    #[test]
    fn test_lease_released_on_drop() {
        let dev = test_device();
        let zone = Arc::clone(&dev.io_zones()[0]);
        {
            let lease = zone.try_acquire().unwrap();
            assert!(lease.is_busy());
            assert!(zone.try_acquire().is_none());
        }
        assert!(!zone.is_busy());
        assert!(zone.try_acquire().is_some());
    }

    #[test]
    fn test_reset_and_finish() {
        let dev = test_device();
        let lease = dev.allocate_io_zone(WriteLifetimeHint::Long).unwrap();
        lease.append(b"data").unwrap();
        lease.finish().unwrap();
        assert!(lease.is_full());
        assert!(lease.append(b"more").unwrap_err().is_no_space());

        lease.reset().unwrap();
        assert!(lease.is_empty());
        assert_eq!(lease.lifetime(), WriteLifetimeHint::NotSet);
    }

    #[test]
    fn test_write_pointer_survives_reopen() {
        let backend = Arc::new(MemoryBackend::new(4096, 16, 8));
        {
            let dev = ZonedBlockDevice::open(backend.clone()).unwrap();
            let lease = dev.allocate_io_zone(WriteLifetimeHint::Short).unwrap();
            lease.append(&[1u8; 8192]).unwrap();
        }
        let dev = ZonedBlockDevice::open(backend).unwrap();
        assert_eq!(dev.io_zones()[0].written(), 8192);
    }

    #[test]
    fn test_lifetime_placement_prefers_closest_longer_zone() {
        let dev = test_device();
        let short = dev.allocate_io_zone(WriteLifetimeHint::Short).unwrap();
        short.append(b"s").unwrap();
        let long = dev.allocate_io_zone(WriteLifetimeHint::Long).unwrap();
        long.append(b"l").unwrap();
        let extreme = dev.allocate_io_zone(WriteLifetimeHint::Extreme).unwrap();
        extreme.append(b"e").unwrap();
        let (long_nr, extreme_nr) = (long.nr(), extreme.nr());
        drop((short, long, extreme));

        // Medium data goes to the Long zone, the closest lifetime above it.
        let lease = dev.allocate_io_zone(WriteLifetimeHint::Medium).unwrap();
        assert_eq!(lease.nr(), long_nr);
        drop(lease);

        // Data outliving every open zone gets a fresh zone.
        let extreme2 = dev.allocate_io_zone(WriteLifetimeHint::Extreme).unwrap();
        assert_eq!(extreme2.nr(), extreme_nr);

        let stats = dev.take_stats();
        assert_eq!(stats.lifetime_diff[1], 1);
        assert_eq!(stats.same_lifetime[WriteLifetimeHint::Extreme as usize], 1);
        assert_eq!(stats.zone_lifetimes[WriteLifetimeHint::Short as usize], 1);
        assert_eq!(stats.zone_diff, [1, 1, 0, 0, 0, 0]);

        let drained = dev.take_stats();
        assert_eq!(drained, DeviceStatsReport::default());
    }

    #[test]
    fn test_lifetime_diff() {
        use WriteLifetimeHint::*;
        assert_eq!(lifetime_diff(NotSet, NotSet), 0);
        assert_eq!(lifetime_diff(Short, NotSet), LIFETIME_DIFF_NOT_GOOD);
        assert_eq!(lifetime_diff(Long, Short), 2);
        assert_eq!(lifetime_diff(Short, Short), LIFETIME_DIFF_COULD_BE_WORSE);
        assert_eq!(lifetime_diff(Short, Long), LIFETIME_DIFF_NOT_GOOD);
    }

    #[test]
    fn test_space_accounting() {
        let dev = test_device();
        let total = dev.io_zones().len() as u64 * dev.zone_size();
        assert_eq!(dev.get_free_space(), total);
        assert_eq!(dev.free_percent(), 100);

        let lease = dev.allocate_io_zone(WriteLifetimeHint::Short).unwrap();
        let offset = lease.append(&[0u8; 8192]).unwrap();
        lease.add_used(4096);

        assert_eq!(dev.get_free_space(), total - 8192);
        assert_eq!(dev.get_used_space(), 4096);
        assert_eq!(dev.get_reclaimable_space(), 4096);

        dev.release_extent(&ZoneExtent::new(offset, 4096));
        assert_eq!(dev.get_used_space(), 0);
    }

    #[test]
    fn test_reset_unused_io_zones() {
        let dev = test_device();
        let a = dev.allocate_io_zone(WriteLifetimeHint::Short).unwrap();
        a.append(&[1u8; 4096]).unwrap();
        a.add_used(4096);
        let b = dev.allocate_io_zone(WriteLifetimeHint::Extreme).unwrap();
        b.append(&[2u8; 4096]).unwrap();
        let (a_nr, b_nr) = (a.nr(), b.nr());
        drop((a, b));

        assert_eq!(dev.reset_unused_io_zones().unwrap(), 1);
        assert!(!dev.zone_for(a_nr * dev.zone_size()).unwrap().is_empty());
        assert!(dev.zone_for(b_nr * dev.zone_size()).unwrap().is_empty());

        let stats = dev.take_stats();
        assert_eq!(stats.reset_calls, 1);
        assert_eq!(stats.reset_zones, 1);
    }

    #[test]
    fn test_busy_zone_not_reset() {
        let dev = test_device();
        let lease = dev.allocate_io_zone(WriteLifetimeHint::Short).unwrap();
        lease.append(&[1u8; 4096]).unwrap();
        assert_eq!(dev.reset_unused_io_zones().unwrap(), 0);
        assert!(!lease.is_empty());
    }

    #[test]
    fn test_finish_cheap_io_zones() {
        let dev = test_device();
        let lease = dev.allocate_io_zone(WriteLifetimeHint::Short).unwrap();
        lease.append(&vec![0u8; 15 * 4096]).unwrap();
        drop(lease);

        // One block left of sixteen is 6.25%, below a 10% threshold.
        assert_eq!(dev.finish_cheap_io_zones(5).unwrap(), 0);
        assert_eq!(dev.finish_cheap_io_zones(10).unwrap(), 1);
        assert!(dev.io_zones()[0].is_full());
    }

    #[test]
    fn test_allocate_meta_zone_resets_stale_data() {
        let dev = test_device();
        {
            let lease = dev.allocate_meta_zone().unwrap();
            lease.append(b"stale").unwrap();
        }
        let lease = dev.allocate_meta_zone().unwrap();
        assert!(lease.is_empty());

        let _second = dev.allocate_meta_zone().unwrap();
        let _third = dev.allocate_meta_zone().unwrap();
        assert!(matches!(
            dev.allocate_meta_zone(),
            Err(ZenFsError::NoFreeZone { .. })
        ));
    }

    #[test]
    fn test_memory_backend_rejects_out_of_order_write() {
        let backend = MemoryBackend::new(4096, 16, 4);
        assert!(backend.write(4096, &[0u8; 4096]).is_err());
        backend.write(0, &[0u8; 4096]).unwrap();
        assert_eq!(backend.write_pointer(0).unwrap(), 4096);
    }

    #[test]
    fn test_garbage_pct() {
        let usage = ZoneUsage {
            zone: 3,
            start: 0,
            max_capacity: 100,
            written: 100,
            used_capacity: 25,
            full: true,
            busy: false,
        };
        assert_eq!(usage.garbage_pct(), 75);
    }
}

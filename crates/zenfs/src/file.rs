//! Zoned files: extent lists, per-file metadata and the data I/O handles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ZenFsError, ZenFsResult};
use crate::snapshot::FileRecord;
use crate::zbd::{Zone, ZoneLease, ZonedBlockDevice};

/// Expected lifetime of written data, used to group data in zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum WriteLifetimeHint {
    /// No hint given
    #[default]
    NotSet = 0,
    /// Explicitly no expectation
    None = 1,
    /// Short-lived data
    Short = 2,
    /// Medium-lived data
    Medium = 3,
    /// Long-lived data
    Long = 4,
    /// Data that is rarely rewritten
    Extreme = 5,
}

impl WriteLifetimeHint {
    /// Converts a raw value, mapping unknown values to `NotSet`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::None,
            2 => Self::Short,
            3 => Self::Medium,
            4 => Self::Long,
            5 => Self::Extreme,
            _ => Self::NotSet,
        }
    }
}

/// A contiguous run of file data inside one zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ZoneExtent {
    /// Absolute device offset of the first byte.
    pub start: u64,
    /// Length in bytes.
    pub length: u64,
}

impl ZoneExtent {
    /// Creates an extent.
    pub fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    /// Offset one past the last byte.
    pub fn end(&self) -> u64 {
        self.start + self.length
    }
}

/// Capability to durably log one file's metadata.
pub trait MetadataWriter: Send + Sync {
    /// Persists the metadata of `file` to the metadata log.
    fn persist(&self, file: &ZoneFile) -> ZenFsResult<()>;
}

#[derive(Debug, Default)]
struct FileState {
    extents: Vec<ZoneExtent>,
    synced_extents: usize,
    size: u64,
    lifetime: WriteLifetimeHint,
    mtime: u64,
    links: Vec<String>,
    deleted: bool,
    readers: usize,
    retired: Vec<ZoneExtent>,
}

/// A file made of extents in zoned storage.
#[derive(Debug)]
pub struct ZoneFile {
    id: u64,
    state: Mutex<FileState>,
    open_for_write: AtomicBool,
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl ZoneFile {
    /// Creates an empty file with one link.
    pub fn new(id: u64, name: impl Into<String>, lifetime: WriteLifetimeHint) -> Self {
        Self {
            id,
            state: Mutex::new(FileState {
                lifetime,
                mtime: now_secs(),
                links: vec![name.into()],
                ..FileState::default()
            }),
            open_for_write: AtomicBool::new(false),
        }
    }

    /// Rebuilds a file from a logged record.
    pub fn from_record(rec: FileRecord) -> Self {
        let synced = rec.extents.len();
        Self {
            id: rec.id,
            state: Mutex::new(FileState {
                extents: rec.extents,
                synced_extents: synced,
                size: rec.size,
                lifetime: rec.lifetime,
                mtime: rec.mtime,
                links: rec.links,
                ..FileState::default()
            }),
            open_for_write: AtomicBool::new(false),
        }
    }

    /// File identifier, stable across renames.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Logical size in bytes.
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    /// Lifetime hint of the data.
    pub fn lifetime(&self) -> WriteLifetimeHint {
        self.state.lock().lifetime
    }

    /// Sets the lifetime hint used for future zone allocations.
    pub fn set_lifetime(&self, hint: WriteLifetimeHint) {
        self.state.lock().lifetime = hint;
    }

    /// Modification time in seconds since the epoch.
    pub fn mtime(&self) -> u64 {
        self.state.lock().mtime
    }

    /// Sets the modification time.
    pub fn set_mtime(&self, mtime: u64) {
        self.state.lock().mtime = mtime;
    }

    /// Copy of the extent list.
    pub fn extents(&self) -> Vec<ZoneExtent> {
        self.state.lock().extents.clone()
    }

    /// Names linking to this file.
    pub fn links(&self) -> Vec<String> {
        self.state.lock().links.clone()
    }

    /// Number of names linking to this file.
    pub fn link_count(&self) -> usize {
        self.state.lock().links.len()
    }

    /// True once the last link was deleted.
    pub fn is_deleted(&self) -> bool {
        self.state.lock().deleted
    }

    /// True while a writer or a migration holds the file.
    pub fn is_open_for_write(&self) -> bool {
        self.open_for_write.load(Ordering::Acquire)
    }

    /// Takes the exclusive write lock on the file.
    pub fn try_acquire_write(self: &Arc<Self>) -> Option<FileWriteGuard> {
        self.open_for_write
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FileWriteGuard {
                file: Arc::clone(self),
            })
    }

    pub(crate) fn add_link(&self, name: &str) {
        let mut state = self.state.lock();
        if !state.links.iter().any(|l| l == name) {
            state.links.push(name.to_string());
        }
    }

    pub(crate) fn remove_link(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        let before = state.links.len();
        state.links.retain(|l| l != name);
        state.links.len() != before
    }

    pub(crate) fn rename_link(&self, from: &str, to: &str) -> bool {
        let mut state = self.state.lock();
        match state.links.iter_mut().find(|l| *l == from) {
            Some(link) => {
                *link = to.to_string();
                true
            }
            None => false,
        }
    }

    /// Appends an extent and accounts its bytes as live in `zone`.
    /// Returns false, leaving the zone untouched, if the file was deleted.
    pub(crate) fn push_extent(&self, extent: ZoneExtent, size_delta: u64, zone: &Zone) -> bool {
        let mut state = self.state.lock();
        if state.deleted {
            return false;
        }
        state.extents.push(extent);
        state.size += size_delta;
        state.mtime = now_secs();
        zone.add_used(extent.length);
        true
    }

    /// Marks the file deleted. Its extents stay readable, and their bytes
    /// live, until the last open reader is closed.
    pub(crate) fn mark_deleted(&self, device: &ZonedBlockDevice) {
        let mut state = self.state.lock();
        if state.deleted {
            return;
        }
        state.deleted = true;
        if state.readers == 0 {
            release_deleted(&mut state, device);
        }
    }

    /// Releases extents no longer in the extent list, or defers the release
    /// until open readers are gone.
    pub(crate) fn retire_extents(&self, extents: &[ZoneExtent], device: &ZonedBlockDevice) {
        let mut state = self.state.lock();
        if state.readers == 0 {
            for extent in extents {
                device.release_extent(extent);
            }
        } else {
            state.retired.extend_from_slice(extents);
        }
    }

    /// Number of open readers.
    pub fn reader_count(&self) -> usize {
        self.state.lock().readers
    }

    fn open_reader(&self) {
        self.state.lock().readers += 1;
    }

    fn close_reader(&self, device: &ZonedBlockDevice) {
        let mut state = self.state.lock();
        debug_assert!(state.readers > 0, "file {} reader closed twice", self.id);
        state.readers = state.readers.saturating_sub(1);
        if state.readers > 0 {
            return;
        }
        for extent in std::mem::take(&mut state.retired) {
            device.release_extent(&extent);
        }
        if state.deleted {
            release_deleted(&mut state, device);
        }
    }

    /// Swaps the extent list, returning the previous one.
    pub(crate) fn replace_extents(&self, extents: Vec<ZoneExtent>) -> Vec<ZoneExtent> {
        let mut state = self.state.lock();
        std::mem::replace(&mut state.extents, extents)
    }

    /// Applies a logged update. `replace` discards the current extents.
    pub(crate) fn merge_update(&self, rec: FileRecord, replace: bool) {
        let mut state = self.state.lock();
        if replace {
            state.extents = rec.extents;
        } else {
            state.extents.extend(rec.extents);
        }
        state.synced_extents = state.extents.len();
        state.size = rec.size;
        state.lifetime = rec.lifetime;
        state.mtime = rec.mtime;
        state.links = rec.links;
    }

    /// Builds the record describing this file's metadata.
    ///
    /// A full record carries every extent; an incremental one only the
    /// extents appended since the last sync. Also returns the number of
    /// extents the record brings the log up to.
    pub fn metadata_record(&self, full: bool) -> (FileRecord, usize) {
        let state = self.state.lock();
        let from = if full {
            0
        } else {
            state.synced_extents.min(state.extents.len())
        };
        let rec = FileRecord {
            id: self.id,
            size: state.size,
            lifetime: state.lifetime,
            mtime: state.mtime,
            extents: state.extents[from..].to_vec(),
            links: state.links.clone(),
        };
        (rec, state.extents.len())
    }

    /// Full record of the file.
    pub fn to_record(&self) -> FileRecord {
        self.metadata_record(true).0
    }

    /// Records that the log reflects the first `count` extents.
    pub(crate) fn mark_synced(&self, count: usize) {
        let mut state = self.state.lock();
        state.synced_extents = state.synced_extents.max(count).min(state.extents.len());
    }

    /// Number of extents the log already reflects.
    pub fn synced_extents(&self) -> usize {
        self.state.lock().synced_extents
    }
}

fn release_deleted(state: &mut FileState, device: &ZonedBlockDevice) {
    for extent in state.extents.drain(..) {
        device.release_extent(&extent);
    }
    state.synced_extents = 0;
}

/// Exclusive write access to a [`ZoneFile`], released on drop.
#[derive(Debug)]
pub struct FileWriteGuard {
    file: Arc<ZoneFile>,
}

impl FileWriteGuard {
    /// The guarded file.
    pub fn file(&self) -> &Arc<ZoneFile> {
        &self.file
    }
}

impl Drop for FileWriteGuard {
    fn drop(&mut self) {
        let was_open = self.file.open_for_write.swap(false, Ordering::AcqRel);
        debug_assert!(was_open, "file {} write lock released twice", self.file.id);
    }
}

/// Append-only writer for a zoned file.
pub struct ZonedWritableFile {
    guard: FileWriteGuard,
    device: Arc<ZonedBlockDevice>,
    metadata: Arc<dyn MetadataWriter>,
    active: Option<ZoneLease>,
    finish_threshold: u32,
}

impl ZonedWritableFile {
    pub(crate) fn new(
        guard: FileWriteGuard,
        device: Arc<ZonedBlockDevice>,
        metadata: Arc<dyn MetadataWriter>,
        finish_threshold: u32,
    ) -> Self {
        Self {
            guard,
            device,
            metadata,
            active: None,
            finish_threshold,
        }
    }

    /// The file being written.
    pub fn file(&self) -> &Arc<ZoneFile> {
        self.guard.file()
    }

    /// Sets the lifetime hint for data appended from now on.
    pub fn set_write_lifetime_hint(&mut self, hint: WriteLifetimeHint) {
        self.file().set_lifetime(hint);
    }

    /// Appends data, splitting it across zones as they fill up.
    pub fn append(&mut self, data: &[u8]) -> ZenFsResult<()> {
        let mut rest = data;
        while !rest.is_empty() {
            let lease = match self.active.take() {
                Some(lease) if !lease.is_full() => lease,
                _ => self.device.allocate_io_zone(self.file().lifetime())?,
            };
            let room = lease.capacity_left();
            let chunk = rest.len().min(room as usize);
            let offset = lease.append(&rest[..chunk])?;
            let extent = ZoneExtent::new(offset, chunk as u64);
            if !self.file().push_extent(extent, chunk as u64, &lease) {
                return Err(ZenFsError::not_found(format!("file id {}", self.file().id())));
            }
            debug!(
                file = self.file().id(),
                zone = lease.nr(),
                offset,
                len = chunk,
                "appended extent"
            );
            rest = &rest[chunk..];
            self.active = Some(lease);
        }
        Ok(())
    }

    /// Makes the file's metadata durable.
    pub fn fsync(&mut self) -> ZenFsResult<()> {
        self.metadata.persist(self.file())
    }

    /// Syncs metadata and releases the active zone.
    pub fn close(mut self) -> ZenFsResult<()> {
        let res = self.fsync();
        self.release_active();
        res
    }

    fn release_active(&mut self) {
        if let Some(lease) = self.active.take() {
            let threshold = self.finish_threshold as u64 * lease.max_capacity();
            if !lease.is_full() && lease.capacity_left() * 100 < threshold {
                if let Err(e) = lease.finish() {
                    warn!(zone = lease.nr(), error = %e, "failed to finish zone on close");
                }
            }
        }
    }
}

impl Drop for ZonedWritableFile {
    fn drop(&mut self) {
        self.release_active();
    }
}

/// Reader over a zoned file's extents.
pub struct ZonedReadableFile {
    file: Arc<ZoneFile>,
    device: Arc<ZonedBlockDevice>,
    pos: u64,
}

impl ZonedReadableFile {
    pub(crate) fn new(file: Arc<ZoneFile>, device: Arc<ZonedBlockDevice>) -> Self {
        file.open_reader();
        Self {
            file,
            device,
            pos: 0,
        }
    }

    /// The file being read.
    pub fn file(&self) -> &Arc<ZoneFile> {
        &self.file
    }

    /// Reads up to `buf.len()` bytes at logical `offset`. Returns bytes read.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> ZenFsResult<usize> {
        let size = self.file.size();
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min((size - offset) as usize);
        let mut done = 0usize;
        let mut logical = 0u64;
        for extent in self.file.extents() {
            if done == want {
                break;
            }
            let ext_end = logical + extent.length;
            let at = offset + done as u64;
            if at < ext_end {
                let within = at - logical;
                let n = ((extent.length - within) as usize).min(want - done);
                self.device
                    .read(extent.start + within, &mut buf[done..done + n])?;
                done += n;
            }
            logical = ext_end;
        }
        Ok(done)
    }

    /// Reads sequentially from the current position.
    pub fn read(&mut self, buf: &mut [u8]) -> ZenFsResult<usize> {
        let n = self.read_at(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Advances the read position.
    pub fn skip(&mut self, n: u64) {
        self.pos = self.pos.saturating_add(n).min(self.file.size());
    }
}

impl Drop for ZonedReadableFile {
    fn drop(&mut self) {
        self.file.close_reader(&self.device);
    }
}

//! The zoned filesystem: format, mount, metadata persistence and the file
//! operations built on top of the file table.
//!
//! Lock order is file table first, then the metadata log. Table mutations
//! happen before the matching record is persisted, so a roll triggered by a
//! full meta zone writes a snapshot that already contains the change.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::aux_fs::{AuxFileLock, AuxFileSystem};
use crate::error::{ZenFsError, ZenFsResult};
use crate::file::{MetadataWriter, WriteLifetimeHint, ZoneFile, ZonedReadableFile, ZonedWritableFile};
use crate::files::{normalize_path, FileTable};
use crate::gc::{GcConfig, GcCounters, GcPhase, GcRunStat, GcWorker};
use crate::metalog::{LogRead, ZenMetaLog};
use crate::metrics::{SpaceReport, ZenFsMetrics, ZenFsReport};
use crate::options::{MkfsOptions, ZenFsOptions};
use crate::snapshot::{recover_from, DeletionRecord, FileRecord, MetaRecord, SnapshotRecord};
use crate::superblock::Superblock;
use crate::zbd::ZonedBlockDevice;

/// Name the filesystem registers under.
pub const ZENFS_NAME: &str = "ZenFS - The Zoned-enabled File System";

struct MetaState {
    log: ZenMetaLog,
    superblock: Superblock,
}

/// State shared between the filesystem handle, open files and the GC worker.
pub(crate) struct FsCore {
    pub(crate) device: Arc<ZonedBlockDevice>,
    aux: Arc<dyn AuxFileSystem>,
    aux_root: String,
    pub(crate) files: Mutex<FileTable>,
    meta: Mutex<MetaState>,
    pub(crate) metrics: Arc<dyn ZenFsMetrics>,
    pub(crate) gc: GcCounters,
    pub(crate) finish_threshold: u32,
    readonly: bool,
}

fn join_path(dir: &str, rel: &str) -> String {
    if dir == "/" {
        format!("/{}", rel)
    } else {
        format!("{}/{}", dir, rel)
    }
}

impl FsCore {
    fn to_aux(&self, path: &str) -> String {
        format!("{}{}", self.aux_root, normalize_path(path))
    }

    fn check_writable(&self) -> ZenFsResult<()> {
        if self.readonly {
            return Err(ZenFsError::ReadOnly);
        }
        Ok(())
    }

    /// Appends a record to the metadata log, rolling to a new meta zone
    /// when the current one is full.
    pub(crate) fn persist_record_locked(
        &self,
        files: &FileTable,
        record: &MetaRecord,
    ) -> ZenFsResult<()> {
        self.check_writable()?;
        let payload = record.encode()?;
        let mut meta = self.meta.lock();
        match meta.log.add_record(&payload) {
            Ok(()) => Ok(()),
            Err(e) if e.is_no_space() => {
                debug!(zone = meta.log.zone().nr(), tag = ?record.tag(), "meta zone full");
                self.roll_meta_zone_locked(files, &mut meta)
            }
            Err(e) => Err(e),
        }
    }

    /// Logs the metadata of one file that is in the table.
    pub(crate) fn sync_file_metadata_locked(
        &self,
        files: &FileTable,
        file: &ZoneFile,
    ) -> ZenFsResult<()> {
        self.check_writable()?;
        if file.is_deleted() {
            return Ok(());
        }
        let (record, count) = file.metadata_record(false);
        self.persist_record_locked(files, &MetaRecord::Update(record))?;
        file.mark_synced(count);
        Ok(())
    }

    /// Moves the log to a fresh meta zone holding the superblock and a full
    /// snapshot, then retires the old zone.
    fn roll_meta_zone_locked(&self, files: &FileTable, meta: &mut MetaState) -> ZenFsResult<()> {
        let lease = self.device.allocate_meta_zone()?;
        let mut log = ZenMetaLog::new(lease, self.device.block_size());
        let mut superblock = meta.superblock.clone();
        superblock.bump_sequence();
        log.add_record(&superblock.encode())?;
        let (snapshot, synced) = files.snapshot_record();
        log.add_record(&MetaRecord::Snapshot(snapshot).encode()?)?;

        let old = std::mem::replace(&mut meta.log, log);
        meta.superblock = superblock;
        for (file, count) in synced {
            file.mark_synced(count);
        }

        let old_zone = old.zone().nr();
        if let Err(e) = Self::retire_meta_log(old) {
            warn!(zone = old_zone, error = %e, "failed to retire old meta zone");
        }
        info!(
            from = old_zone,
            to = meta.log.zone().nr(),
            sequence = meta.superblock.seq(),
            "rolled meta zone"
        );
        Ok(())
    }

    fn retire_meta_log(mut old: ZenMetaLog) -> ZenFsResult<()> {
        if let Err(e) = old.add_record(&MetaRecord::End.encode()?) {
            if !e.is_no_space() {
                return Err(e);
            }
        }
        let lease = old.into_lease();
        if !lease.is_full() {
            lease.finish()?;
        }
        lease.reset()
    }

    /// Removes one name. The file's extents are released once its last name
    /// is gone and no reader holds it; the caller resets unused zones after
    /// dropping the table lock.
    fn delete_file_locked(&self, files: &mut FileTable, path: &str) -> ZenFsResult<()> {
        let file = files
            .remove_name(path)
            .ok_or_else(|| ZenFsError::not_found(path))?;
        file.remove_link(path);
        let record = MetaRecord::Deletion(DeletionRecord {
            id: file.id(),
            name: path.to_string(),
        });
        if let Err(e) = self.persist_record_locked(files, &record) {
            file.add_link(path);
            files.insert(path, file);
            return Err(e);
        }
        if file.link_count() == 0 {
            file.mark_deleted(&self.device);
        }
        debug!(path, id = file.id(), links = file.link_count(), "deleted file");
        Ok(())
    }

    fn rename_file_locked(&self, files: &mut FileTable, src: &str, dst: &str) -> ZenFsResult<()> {
        let file = files
            .get(src)
            .cloned()
            .ok_or_else(|| ZenFsError::not_found(src))?;
        if src == dst {
            return Ok(());
        }
        if let Some(target) = files.get(dst).cloned() {
            if Arc::ptr_eq(&target, &file) {
                return self.delete_file_locked(files, src);
            }
            self.delete_file_locked(files, dst)?;
        }

        files.remove_name(src);
        file.rename_link(src, dst);
        files.insert(dst, Arc::clone(&file));
        if let Err(e) = self.sync_file_metadata_locked(files, &file) {
            files.remove_name(dst);
            file.rename_link(dst, src);
            files.insert(src, file);
            return Err(e);
        }
        debug!(src, dst, id = file.id(), "renamed file");
        Ok(())
    }

    fn rename_dir_locked(&self, files: &mut FileTable, src: &str, dst: &str) -> ZenFsResult<()> {
        let aux_src = self.to_aux(src);
        let aux_dst = self.to_aux(dst);
        let aux_exists = self.aux.is_directory(&aux_src).unwrap_or(false);
        if aux_exists {
            self.aux.rename_file(&aux_src, &aux_dst)?;
        }

        let mut done: Vec<(String, String)> = Vec::new();
        for rel in files.children(src, true) {
            let from = join_path(src, &rel);
            let to = join_path(dst, &rel);
            if let Err(e) = self.rename_file_locked(files, &from, &to) {
                for (from, to) in done.iter().rev() {
                    if let Err(undo) = self.rename_file_locked(files, to, from) {
                        error!(from = %to, to = %from, error = %undo, "failed to undo rename");
                    }
                }
                if aux_exists {
                    if let Err(undo) = self.aux.rename_file(&aux_dst, &aux_src) {
                        error!(error = %undo, "failed to undo aux directory rename");
                    }
                }
                return Err(e);
            }
            done.push((from, to));
        }
        debug!(src, dst, files = done.len(), "renamed directory");
        Ok(())
    }

    fn delete_aux_tree(&self, path: &str) -> ZenFsResult<()> {
        for child in self.aux.get_children(path)? {
            let child_path = format!("{}/{}", path, child);
            if self.aux.is_directory(&child_path)? {
                self.delete_aux_tree(&child_path)?;
            } else {
                self.aux.delete_file(&child_path)?;
            }
        }
        self.aux.delete_dir(path)
    }

    fn reset_unused_zones(&self) -> ZenFsResult<()> {
        let reset = self.device.reset_unused_io_zones()?;
        if reset > 0 {
            self.metrics.report_zone_reset(reset as u64);
        }
        Ok(())
    }
}

impl MetadataWriter for FsCore {
    fn persist(&self, file: &ZoneFile) -> ZenFsResult<()> {
        let files = self.files.lock();
        self.sync_file_metadata_locked(&files, file)
    }
}

/// A mounted zoned filesystem.
///
/// Dropping it stops the GC worker and waits for a pass in progress to
/// return; [`ZenFs::shutdown`] additionally waits for the task to exit.
pub struct ZenFs {
    core: Arc<FsCore>,
    gc_config: GcConfig,
    gc_worker: Mutex<Option<GcWorker>>,
}

impl ZenFs {
    /// Formats the device: resets every zone and writes the superblock and
    /// an empty snapshot to the first meta zone.
    pub fn mkfs(
        device: &ZonedBlockDevice,
        aux: &dyn AuxFileSystem,
        options: &MkfsOptions,
    ) -> ZenFsResult<()> {
        if options.aux_fs_path.is_empty() {
            return Err(ZenFsError::InvalidArgument(
                "an aux filesystem path is required".to_string(),
            ));
        }
        let mut options = options.clone();
        if !options.aux_fs_path.ends_with('/') {
            options.aux_fs_path.push('/');
        }

        // Nothing on the device changes until the options are known good,
        // every zone is idle and the aux directory exists.
        let superblock = Superblock::new(device.geometry(), &options)?;
        let leases = device
            .meta_zones()
            .iter()
            .chain(device.io_zones())
            .map(|zone| {
                zone.try_acquire().ok_or_else(|| ZenFsError::Busy {
                    path: format!("zone {}", zone.nr()),
                })
            })
            .collect::<ZenFsResult<Vec<_>>>()?;
        aux.create_dir_if_missing(&options.aux_fs_path)?;
        for lease in leases.iter().filter(|l| !l.is_empty()) {
            lease.reset()?;
        }
        drop(leases);

        let mut log = ZenMetaLog::new(device.allocate_meta_zone()?, device.block_size());
        log.add_record(&superblock.encode())?;
        log.add_record(&MetaRecord::Snapshot(SnapshotRecord::default()).encode()?)?;
        info!(
            uuid = superblock.uuid(),
            aux = superblock.aux_fs_path(),
            gc = superblock.is_gc_enabled(),
            "formatted zoned filesystem"
        );
        Ok(())
    }

    /// Mounts the filesystem.
    ///
    /// The newest meta zone whose log replays cleanly wins. A read-write
    /// mount rolls to a fresh meta zone, resets unused zones and, when the
    /// superblock enables it and a tokio runtime is present, starts GC.
    pub fn mount(
        device: Arc<ZonedBlockDevice>,
        aux: Arc<dyn AuxFileSystem>,
        options: ZenFsOptions,
        metrics: Arc<dyn ZenFsMetrics>,
    ) -> ZenFsResult<Self> {
        let geometry = device.geometry();
        let mut candidates = Vec::new();
        let mut first_error = None;
        for zone in device.meta_zones() {
            let Some(lease) = zone.try_acquire() else {
                warn!(zone = zone.nr(), "meta zone busy, skipping");
                continue;
            };
            if lease.is_empty() {
                continue;
            }
            let mut log = ZenMetaLog::new(lease, geometry.block_size);
            match log.read_record() {
                Ok(LogRead::Record(payload)) => match Superblock::decode(&payload) {
                    Ok(superblock) => candidates.push((superblock, log)),
                    Err(e) => {
                        warn!(zone = zone.nr(), error = %e, "invalid superblock in meta zone");
                        first_error.get_or_insert(e);
                    }
                },
                Ok(LogRead::EndOfLog) => debug!(zone = zone.nr(), "meta zone holds no records"),
                Err(e) => {
                    warn!(zone = zone.nr(), error = %e, "unreadable meta zone");
                    first_error.get_or_insert(e);
                }
            }
        }
        if candidates.is_empty() {
            return Err(first_error
                .unwrap_or_else(|| ZenFsError::corruption("mount", "no valid superblock found")));
        }

        candidates.sort_by(|a, b| b.0.seq().cmp(&a.0.seq()));
        for (superblock, _) in &candidates {
            superblock.compatible_with(&geometry)?;
        }

        let mut recovered = None;
        for (superblock, mut log) in candidates {
            let mut table = FileTable::new();
            match recover_from(&mut log, &mut table) {
                Ok(stats) => {
                    debug!(?stats, "meta zone recovered");
                    recovered = Some((superblock, log, table));
                    break;
                }
                Err(e) => warn!(
                    zone = log.zone().nr(),
                    sequence = superblock.seq(),
                    error = %e,
                    "meta zone recovery failed, trying an older one"
                ),
            }
        }
        let Some((superblock, log, table)) = recovered else {
            return Err(ZenFsError::corruption("mount", "no meta zone could be recovered"));
        };

        let extents: Vec<_> = table
            .unique_files()
            .iter()
            .flat_map(|f| f.extents())
            .collect();
        device.recompute_used(&extents);

        let gc_enabled = superblock.is_gc_enabled();
        let core = Arc::new(FsCore {
            aux_root: superblock.aux_fs_path().trim_end_matches('/').to_string(),
            finish_threshold: superblock.finish_threshold(),
            device,
            aux,
            files: Mutex::new(table),
            meta: Mutex::new(MetaState { log, superblock }),
            metrics,
            gc: GcCounters::default(),
            readonly: options.readonly,
        });

        if !options.readonly {
            {
                let files = core.files.lock();
                let mut meta = core.meta.lock();
                core.roll_meta_zone_locked(&files, &mut meta)?;
            }
            core.reset_unused_zones()?;
        }

        let fs = Self {
            core,
            gc_config: options.gc,
            gc_worker: Mutex::new(None),
        };
        if !options.readonly && gc_enabled {
            match Handle::try_current() {
                Ok(runtime) => {
                    let worker =
                        GcWorker::spawn(Arc::clone(&fs.core), fs.gc_config.clone(), &runtime);
                    *fs.gc_worker.lock() = Some(worker);
                }
                Err(_) => warn!("no tokio runtime, GC worker not started"),
            }
        }

        let files = fs.core.files.lock().len();
        info!(
            files,
            readonly = options.readonly,
            gc = fs.is_gc_running(),
            "mounted zoned filesystem"
        );
        Ok(fs)
    }

    fn writer(&self, guard: crate::file::FileWriteGuard) -> ZonedWritableFile {
        let metadata: Arc<dyn MetadataWriter> = Arc::clone(&self.core) as Arc<dyn MetadataWriter>;
        ZonedWritableFile::new(
            guard,
            Arc::clone(&self.core.device),
            metadata,
            self.core.finish_threshold,
        )
    }

    /// Creates a file for writing, replacing any existing file of that name.
    pub fn new_writable_file(
        &self,
        fname: &str,
        hint: WriteLifetimeHint,
    ) -> ZenFsResult<ZonedWritableFile> {
        self.core.check_writable()?;
        let path = normalize_path(fname);
        let mut files = self.core.files.lock();
        let replaced = files.contains(&path);
        if replaced {
            self.core.delete_file_locked(&mut files, &path)?;
        }

        let file = Arc::new(ZoneFile::new(files.allocate_id(), path.clone(), hint));
        let guard = file
            .try_acquire_write()
            .ok_or_else(|| ZenFsError::Busy { path: path.clone() })?;
        files.insert(path.clone(), Arc::clone(&file));
        if let Err(e) = self.core.sync_file_metadata_locked(&files, &file) {
            files.remove_name(&path);
            return Err(e);
        }
        drop(files);

        if replaced {
            self.core.reset_unused_zones()?;
        }
        debug!(path = %path, id = file.id(), ?hint, "created file");
        Ok(self.writer(guard))
    }

    /// Opens an existing file for appending, creating it if missing.
    pub fn reopen_writable_file(&self, fname: &str) -> ZenFsResult<ZonedWritableFile> {
        self.core.check_writable()?;
        let path = normalize_path(fname);
        let existing = self.core.files.lock().get(&path).cloned();
        match existing {
            Some(file) => {
                let guard = file
                    .try_acquire_write()
                    .ok_or(ZenFsError::Busy { path })?;
                Ok(self.writer(guard))
            }
            None => self.new_writable_file(&path, WriteLifetimeHint::NotSet),
        }
    }

    /// Deletes `old_fname` if present and creates `fname` afresh.
    pub fn reuse_writable_file(
        &self,
        fname: &str,
        old_fname: &str,
        hint: WriteLifetimeHint,
    ) -> ZenFsResult<ZonedWritableFile> {
        match self.delete_file(old_fname) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.new_writable_file(fname, hint)
    }

    fn open_readable(&self, fname: &str) -> ZenFsResult<ZonedReadableFile> {
        let path = normalize_path(fname);
        let file = self
            .core
            .files
            .lock()
            .get(&path)
            .cloned()
            .ok_or_else(|| ZenFsError::not_found(path))?;
        Ok(ZonedReadableFile::new(file, Arc::clone(&self.core.device)))
    }

    /// Opens a file for sequential reading.
    pub fn new_sequential_file(&self, fname: &str) -> ZenFsResult<ZonedReadableFile> {
        self.open_readable(fname)
    }

    /// Opens a file for positional reads.
    pub fn new_random_access_file(&self, fname: &str) -> ZenFsResult<ZonedReadableFile> {
        self.open_readable(fname)
    }

    /// Always fails: files are append-only.
    pub fn new_random_rw_file(&self, _fname: &str) -> ZenFsResult<ZonedWritableFile> {
        Err(ZenFsError::NotSupported("RandomRWFile"))
    }

    /// Always fails: zoned files cannot be memory mapped.
    pub fn new_memory_mapped_file_buffer(&self, _fname: &str) -> ZenFsResult<Vec<u8>> {
        Err(ZenFsError::NotSupported("MemoryMappedFileBuffer"))
    }

    /// Always fails: files are append-only.
    pub fn truncate(&self, _fname: &str, _size: u64) -> ZenFsResult<()> {
        Err(ZenFsError::NotSupported("Truncate"))
    }

    /// Whether a zoned file or aux entry exists.
    pub fn file_exists(&self, fname: &str) -> ZenFsResult<bool> {
        let path = normalize_path(fname);
        if self.core.files.lock().contains(&path) {
            return Ok(true);
        }
        self.core.aux.file_exists(&self.core.to_aux(&path))
    }

    /// Entry names in a directory: aux entries merged with zoned files.
    pub fn get_children(&self, dir: &str) -> ZenFsResult<Vec<String>> {
        let dir = normalize_path(dir);
        let aux_children = self.core.aux.get_children(&self.core.to_aux(&dir));
        let mut names = BTreeSet::new();
        {
            let files = self.core.files.lock();
            names.extend(files.children(&dir, false));
            names.extend(files.child_dirs(&dir));
        }
        match aux_children {
            Ok(children) => names.extend(children),
            Err(e) if e.is_not_found() && !names.is_empty() => {}
            Err(e) => return Err(e),
        }
        Ok(names.into_iter().collect())
    }

    /// Deletes a file. Zones left without live data are reset afterwards.
    pub fn delete_file(&self, fname: &str) -> ZenFsResult<()> {
        self.core.check_writable()?;
        let path = normalize_path(fname);
        let mut files = self.core.files.lock();
        if !files.contains(&path) {
            drop(files);
            return self.core.aux.delete_file(&self.core.to_aux(&path));
        }
        self.core.delete_file_locked(&mut files, &path)?;
        drop(files);
        self.core.reset_unused_zones()
    }

    /// Renames a file or a directory and every zoned file below it.
    pub fn rename_file(&self, src: &str, dst: &str) -> ZenFsResult<()> {
        self.core.check_writable()?;
        let src = normalize_path(src);
        let dst = normalize_path(dst);
        let mut files = self.core.files.lock();
        if files.contains(&src) {
            self.core.rename_file_locked(&mut files, &src, &dst)?;
        } else if !files.children(&src, true).is_empty()
            || self.core.aux.is_directory(&self.core.to_aux(&src)).unwrap_or(false)
        {
            self.core.rename_dir_locked(&mut files, &src, &dst)?;
        } else {
            drop(files);
            return self
                .core
                .aux
                .rename_file(&self.core.to_aux(&src), &self.core.to_aux(&dst));
        }
        drop(files);
        self.core.reset_unused_zones()
    }

    /// Adds `dst` as another name for the file `src`.
    pub fn link_file(&self, src: &str, dst: &str) -> ZenFsResult<()> {
        self.core.check_writable()?;
        let src = normalize_path(src);
        let dst = normalize_path(dst);
        let mut files = self.core.files.lock();
        let Some(file) = files.get(&src).cloned() else {
            drop(files);
            return self
                .core
                .aux
                .link_file(&self.core.to_aux(&src), &self.core.to_aux(&dst));
        };
        if files.contains(&dst) {
            return Err(ZenFsError::AlreadyExists { path: dst });
        }
        file.add_link(&dst);
        files.insert(dst.clone(), Arc::clone(&file));
        if let Err(e) = self.core.sync_file_metadata_locked(&files, &file) {
            files.remove_name(&dst);
            file.remove_link(&dst);
            return Err(e);
        }
        debug!(src = %src, dst = %dst, id = file.id(), "linked file");
        Ok(())
    }

    /// Number of names linking to a zoned file.
    pub fn num_file_links(&self, fname: &str) -> ZenFsResult<u64> {
        let path = normalize_path(fname);
        self.core
            .files
            .lock()
            .get(&path)
            .map(|f| f.link_count() as u64)
            .ok_or_else(|| ZenFsError::not_found(path))
    }

    /// True if both names link to the same zoned file.
    pub fn are_files_same(&self, first: &str, second: &str) -> ZenFsResult<bool> {
        let files = self.core.files.lock();
        let a = files.get(&normalize_path(first));
        let b = files.get(&normalize_path(second));
        match (a, b) {
            (Some(a), Some(b)) => Ok(Arc::ptr_eq(a, b)),
            (None, None) => Err(ZenFsError::not_found(first)),
            _ => Ok(false),
        }
    }

    /// Size of a zoned or aux file.
    pub fn get_file_size(&self, fname: &str) -> ZenFsResult<u64> {
        let path = normalize_path(fname);
        if let Some(file) = self.core.files.lock().get(&path) {
            return Ok(file.size());
        }
        self.core.aux.get_file_size(&self.core.to_aux(&path))
    }

    /// Modification time of a zoned or aux file in seconds since the epoch.
    pub fn get_file_modification_time(&self, fname: &str) -> ZenFsResult<u64> {
        let path = normalize_path(fname);
        if let Some(file) = self.core.files.lock().get(&path) {
            return Ok(file.mtime());
        }
        self.core
            .aux
            .get_file_modification_time(&self.core.to_aux(&path))
    }

    /// Bytes still appendable on the device.
    pub fn get_free_space(&self, _path: &str) -> u64 {
        self.core.device.get_free_space()
    }

    /// Whether the path is a directory.
    pub fn is_directory(&self, path: &str) -> ZenFsResult<bool> {
        let path = normalize_path(path);
        {
            let files = self.core.files.lock();
            if files.contains(&path) {
                return Ok(false);
            }
            if !files.children(&path, true).is_empty() {
                return Ok(true);
            }
        }
        self.core.aux.is_directory(&self.core.to_aux(&path))
    }

    /// Creates a directory on the aux filesystem.
    pub fn create_dir(&self, dir: &str) -> ZenFsResult<()> {
        self.core.check_writable()?;
        self.core.aux.create_dir(&self.core.to_aux(dir))
    }

    /// Creates a directory and its parents if missing.
    pub fn create_dir_if_missing(&self, dir: &str) -> ZenFsResult<()> {
        self.core.check_writable()?;
        self.core.aux.create_dir_if_missing(&self.core.to_aux(dir))
    }

    /// Deletes an empty directory.
    pub fn delete_dir(&self, dir: &str) -> ZenFsResult<()> {
        self.core.check_writable()?;
        let dir = normalize_path(dir);
        if !self.core.files.lock().children(&dir, true).is_empty() {
            return Err(ZenFsError::InvalidArgument(format!(
                "directory {} is not empty",
                dir
            )));
        }
        self.core.aux.delete_dir(&self.core.to_aux(&dir))
    }

    /// Deletes a directory with every zoned file and aux entry below it.
    pub fn delete_dir_recursive(&self, dir: &str) -> ZenFsResult<()> {
        self.core.check_writable()?;
        let dir = normalize_path(dir);
        let mut files = self.core.files.lock();
        for rel in files.children(&dir, true) {
            self.core
                .delete_file_locked(&mut files, &join_path(&dir, &rel))?;
        }
        let aux_dir = self.core.to_aux(&dir);
        if self.core.aux.file_exists(&aux_dir)? {
            self.core.delete_aux_tree(&aux_dir)?;
        }
        drop(files);
        self.core.reset_unused_zones()
    }

    /// Absolute form of a path in the zoned namespace.
    pub fn get_absolute_path(&self, path: &str) -> ZenFsResult<String> {
        Ok(normalize_path(path))
    }

    /// Takes an exclusive lock backed by the aux filesystem.
    pub fn lock_file(&self, fname: &str) -> ZenFsResult<AuxFileLock> {
        self.core.aux.lock_file(&self.core.to_aux(fname))
    }

    /// Releases a lock from [`ZenFs::lock_file`].
    pub fn unlock_file(&self, lock: AuxFileLock) -> ZenFsResult<()> {
        self.core.aux.unlock_file(lock)
    }

    /// Opens a log file on the aux filesystem.
    pub fn new_logger(&self, fname: &str) -> ZenFsResult<Box<dyn Write + Send>> {
        self.core.aux.new_logger(&self.core.to_aux(fname))
    }

    /// Lifetime hint of every zoned file by name.
    pub fn get_write_lifetime_hints(&self) -> BTreeMap<String, WriteLifetimeHint> {
        self.core
            .files
            .lock()
            .iter()
            .map(|(name, file)| (name.clone(), file.lifetime()))
            .collect()
    }

    /// Full metadata of every zoned file by name.
    pub fn file_records(&self) -> BTreeMap<String, FileRecord> {
        self.core.files.lock().records()
    }

    /// JSON dump of every zoned file with its extents.
    pub fn encode_json(&self) -> ZenFsResult<String> {
        serde_json::to_string(&self.file_records()).map_err(|e| ZenFsError::Serialization {
            reason: e.to_string(),
        })
    }

    /// The superblock in use.
    pub fn superblock(&self) -> Superblock {
        self.core.meta.lock().superblock.clone()
    }

    /// Human-readable superblock dump.
    pub fn report_superblock(&self) -> String {
        self.core.meta.lock().superblock.report()
    }

    /// Filesystem name.
    pub fn name(&self) -> &'static str {
        ZENFS_NAME
    }

    /// The underlying device.
    pub fn device(&self) -> &Arc<ZonedBlockDevice> {
        &self.core.device
    }

    /// Drains GC, reset and lifetime statistics into a report and hands it
    /// to the metrics sink. Counters restart from zero.
    pub fn report(&self) -> ZenFsReport {
        let (gc, runs) = self.core.gc.take();
        let device = self.core.device.take_stats();
        let space = SpaceReport::new(
            self.core.device.get_free_space(),
            self.core.device.get_used_space(),
            self.core.device.get_reclaimable_space(),
        );
        let report = ZenFsReport {
            gc,
            runs,
            device,
            space,
        };
        self.core.metrics.report(&report);
        report
    }

    /// Runs one GC pass on the calling thread.
    pub fn run_gc_once(&self) -> ZenFsResult<Option<GcRunStat>> {
        self.core.check_writable()?;
        self.core.run_gc_pass(&self.gc_config, &|| false)
    }

    /// Current GC phase.
    pub fn gc_phase(&self) -> GcPhase {
        self.core.gc.phase()
    }

    /// Whether the background GC worker is running.
    pub fn is_gc_running(&self) -> bool {
        self.gc_worker
            .lock()
            .as_ref()
            .is_some_and(|w| w.is_running())
    }

    /// Stops the GC worker and waits for it to exit.
    pub async fn shutdown(&self) {
        let worker = self.gc_worker.lock().take();
        if let Some(worker) = worker {
            worker.stop().await;
        }
        info!("zoned filesystem shut down");
    }
}

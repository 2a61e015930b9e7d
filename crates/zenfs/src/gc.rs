//! Garbage collection: victim policy, live extent migration and the
//! background worker.
//!
//! A pass runs when free space drops to `start_level_pct` or below. The
//! victim threshold tightens linearly with the deficit: a full zone is a
//! victim once its garbage percentage exceeds
//! `100 - slope * (start_level_pct - free_pct)`. Victims with the least live
//! data are migrated first.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ZenFsResult;
use crate::file::{WriteLifetimeHint, ZoneExtent, ZoneFile};
use crate::fs::FsCore;
use crate::metrics::GcTotals;
use crate::snapshot::MetaRecord;
use crate::zbd::{ZoneLease, ZoneUsage};

/// Most recent per-pass statistics kept between reports.
const MAX_RUN_STATS: usize = 1024;

/// Garbage collection tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Free space percentage at or below which GC starts.
    pub start_level_pct: u64,
    /// How fast the victim threshold drops per percent of deficit.
    pub slope: u64,
    /// Worker period in milliseconds.
    pub interval_ms: u64,
    /// Upper bound on victims per pass.
    pub max_victims_per_run: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            start_level_pct: 20,
            slope: 3,
            interval_ms: 10_000,
            max_victims_per_run: usize::MAX,
        }
    }
}

impl GcConfig {
    /// Minimum garbage percentage for a victim at the given free space, or
    /// `None` when there is no space pressure.
    pub fn threshold(&self, free_pct: u64) -> Option<u64> {
        if free_pct > self.start_level_pct {
            return None;
        }
        let deficit = self.start_level_pct - free_pct;
        Some(100u64.saturating_sub(self.slope.saturating_mul(deficit)))
    }
}

/// Picks full, idle zones holding live data whose garbage percentage
/// exceeds `threshold`, least live data first.
pub fn select_victims(usage: &[ZoneUsage], threshold: u64, max: usize) -> Vec<ZoneUsage> {
    let mut victims: Vec<ZoneUsage> = usage
        .iter()
        .filter(|z| z.full && !z.busy && z.used_capacity > 0 && z.garbage_pct() > threshold)
        .cloned()
        .collect();
    victims.sort_by(|a, b| {
        let lhs = a.used_capacity as u128 * b.max_capacity as u128;
        let rhs = b.used_capacity as u128 * a.max_capacity as u128;
        lhs.cmp(&rhs).then(a.zone.cmp(&b.zone))
    });
    victims.truncate(max);
    victims
}

/// Where the GC loop is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GcPhase {
    /// Waiting for the next pass.
    #[default]
    Idle,
    /// Measuring free space.
    Scanning,
    /// Choosing victim zones.
    SelectingVictims,
    /// Copying live extents.
    Migrating,
    /// Resetting emptied zones.
    Finishing,
    /// The worker has exited.
    Stopped,
}

/// Statistics of one GC pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcRunStat {
    /// Wall time of the pass in microseconds.
    pub elapsed_us: u64,
    /// Free space percentage that triggered the pass.
    pub free_percent: u64,
    /// Open zones finished.
    pub num_finished: u64,
    /// Zones chosen as victims.
    pub num_victimed: u64,
    /// Bytes copied out of victims.
    pub copied_bytes: u64,
}

#[derive(Debug, Default)]
pub(crate) struct GcCounters {
    runs: AtomicU64,
    zones_victimed: AtomicU64,
    zones_reset: AtomicU64,
    bytes_copied: AtomicU64,
    extents_migrated: AtomicU64,
    extents_failed: AtomicU64,
    files_skipped: AtomicU64,
    migrated_files: AtomicU64,
    migrated_by_lifetime: [AtomicU64; 6],
    run_stats: Mutex<VecDeque<GcRunStat>>,
    phase: Mutex<GcPhase>,
}

impl GcCounters {
    pub(crate) fn phase(&self) -> GcPhase {
        *self.phase.lock()
    }

    pub(crate) fn set_phase(&self, phase: GcPhase) {
        *self.phase.lock() = phase;
    }

    fn push_run(&self, stat: GcRunStat) {
        let mut runs = self.run_stats.lock();
        if runs.len() == MAX_RUN_STATS {
            runs.pop_front();
        }
        runs.push_back(stat);
    }

    /// Drains totals and per-pass statistics, zeroing them.
    pub(crate) fn take(&self) -> (GcTotals, Vec<GcRunStat>) {
        let drain = |c: &AtomicU64| c.swap(0, Ordering::AcqRel);
        let totals = GcTotals {
            runs: drain(&self.runs),
            zones_victimed: drain(&self.zones_victimed),
            zones_reset: drain(&self.zones_reset),
            bytes_copied: drain(&self.bytes_copied),
            extents_migrated: drain(&self.extents_migrated),
            extents_failed: drain(&self.extents_failed),
            files_skipped: drain(&self.files_skipped),
            migrated_files: drain(&self.migrated_files),
            migrated_by_lifetime: std::array::from_fn(|i| drain(&self.migrated_by_lifetime[i])),
        };
        let runs = self.run_stats.lock().drain(..).collect();
        (totals, runs)
    }
}

/// Background GC task.
///
/// Dropping the worker signals it to stop and blocks until a pass already
/// running on the blocking pool has returned; no pass starts afterwards.
pub struct GcWorker {
    stop_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
    pass_gate: Arc<Mutex<()>>,
}

impl GcWorker {
    pub(crate) fn spawn(core: Arc<FsCore>, config: GcConfig, runtime: &Handle) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let pass_gate = Arc::new(Mutex::new(()));
        let handle = runtime.spawn(Self::run(core, config, stop_rx, Arc::clone(&pass_gate)));
        Self {
            stop_tx,
            handle: Some(handle),
            pass_gate,
        }
    }

    async fn run(
        core: Arc<FsCore>,
        config: GcConfig,
        mut stop_rx: watch::Receiver<bool>,
        pass_gate: Arc<Mutex<()>>,
    ) {
        let interval = Duration::from_millis(config.interval_ms);
        info!(interval_ms = config.interval_ms, "GC worker started");
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if *stop_rx.borrow() {
                break;
            }

            let pass_core = Arc::clone(&core);
            let pass_config = config.clone();
            let pass_stop = stop_rx.clone();
            let pass_gate = Arc::clone(&pass_gate);
            let result = tokio::task::spawn_blocking(move || {
                let _gate = pass_gate.lock();
                if *pass_stop.borrow() {
                    return Ok(None);
                }
                pass_core.run_gc_pass(&pass_config, &|| *pass_stop.borrow())
            })
            .await;
            match result {
                Ok(Ok(Some(stat))) => debug!(copied = stat.copied_bytes, "GC pass done"),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => error!(error = %e, "GC pass failed"),
                Err(e) => error!(error = %e, "GC pass panicked"),
            }
        }
        core.gc.set_phase(GcPhase::Stopped);
        info!("GC worker stopped");
    }

    /// Signals the worker and waits for it to exit.
    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "GC worker ended abnormally");
            }
        }
    }

    /// True until the worker task exits.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for GcWorker {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
        drop(self.pass_gate.lock());
    }
}

impl FsCore {
    /// Runs one GC pass. Returns `None` when free space is above the start
    /// level. `should_stop` is checked between victim zones.
    pub(crate) fn run_gc_pass(
        &self,
        config: &GcConfig,
        should_stop: &dyn Fn() -> bool,
    ) -> ZenFsResult<Option<GcRunStat>> {
        let started = Instant::now();
        self.gc.set_phase(GcPhase::Scanning);
        let free_percent = self.device.free_percent();
        let result = match config.threshold(free_percent) {
            Some(threshold) => self
                .collect(config, free_percent, threshold, should_stop, started)
                .map(Some),
            None => Ok(None),
        };
        self.gc.set_phase(GcPhase::Idle);
        result
    }

    fn collect(
        &self,
        config: &GcConfig,
        free_percent: u64,
        threshold: u64,
        should_stop: &dyn Fn() -> bool,
        started: Instant,
    ) -> ZenFsResult<GcRunStat> {
        let num_finished = self.device.finish_cheap_io_zones(self.finish_threshold)? as u64;

        self.gc.set_phase(GcPhase::SelectingVictims);
        let victims = select_victims(
            &self.device.io_zone_usage(),
            threshold,
            config.max_victims_per_run,
        );
        debug!(
            free_percent,
            threshold,
            victims = victims.len(),
            "selected GC victims"
        );

        self.gc.set_phase(GcPhase::Migrating);
        let mut copied_bytes = 0;
        let mut processed = Vec::with_capacity(victims.len());
        for victim in &victims {
            if should_stop() {
                info!(remaining = victims.len() - processed.len(), "GC pass interrupted");
                break;
            }
            copied_bytes += self.migrate_zone(victim);
            processed.push(victim.start);
        }

        self.gc.set_phase(GcPhase::Finishing);
        let reset = self.device.reset_unused_io_zones()? as u64;
        let victims_reset = processed
            .iter()
            .filter(|start| self.device.zone_for(**start).is_some_and(|z| z.is_empty()))
            .count() as u64;

        let stat = GcRunStat {
            elapsed_us: started.elapsed().as_micros() as u64,
            free_percent,
            num_finished,
            num_victimed: processed.len() as u64,
            copied_bytes,
        };
        self.gc.runs.fetch_add(1, Ordering::Relaxed);
        self.gc
            .zones_victimed
            .fetch_add(stat.num_victimed, Ordering::Relaxed);
        self.gc.zones_reset.fetch_add(victims_reset, Ordering::Relaxed);
        self.gc.bytes_copied.fetch_add(copied_bytes, Ordering::Relaxed);
        self.gc.push_run(stat.clone());
        self.metrics.report_gc_run(&stat);
        if reset > 0 {
            self.metrics.report_zone_reset(reset);
        }
        info!(
            free_percent,
            victims = stat.num_victimed,
            reset = victims_reset,
            copied = copied_bytes,
            elapsed_us = stat.elapsed_us,
            "GC pass complete"
        );
        Ok(stat)
    }

    /// Moves every live extent out of one victim zone. Returns bytes copied.
    fn migrate_zone(&self, victim: &ZoneUsage) -> u64 {
        let range = victim.start..victim.start + victim.max_capacity;
        let files = self.files.lock().unique_files();
        let mut copied = 0;
        for file in files {
            if !file.extents().iter().any(|e| range.contains(&e.start)) {
                continue;
            }
            let Some(guard) = file.try_acquire_write() else {
                self.gc.files_skipped.fetch_add(1, Ordering::Relaxed);
                debug!(file = file.id(), zone = victim.zone, "file open for write, skipping");
                continue;
            };
            match self.migrate_file_extents(guard.file(), &range) {
                Ok(bytes) => copied += bytes,
                Err(e) => warn!(
                    file = file.id(),
                    zone = victim.zone,
                    error = %e,
                    "extent migration failed"
                ),
            }
        }
        copied
    }

    /// Copies the file's extents inside `range` elsewhere and logs the new
    /// extent list. The old extents stay live until the replace record is
    /// durable.
    fn migrate_file_extents(&self, file: &Arc<ZoneFile>, range: &Range<u64>) -> ZenFsResult<u64> {
        let old = file.extents();
        let hint = file.lifetime();
        let mut target = None;
        let mut new_extents = Vec::with_capacity(old.len());
        let mut fresh = Vec::new();
        let mut moved = Vec::new();

        for extent in &old {
            if !range.contains(&extent.start) {
                new_extents.push(*extent);
                continue;
            }
            match self.copy_extent(extent, hint, &mut target) {
                Ok(pieces) => {
                    fresh.extend_from_slice(&pieces);
                    new_extents.extend(pieces);
                    moved.push(*extent);
                }
                Err(e) => {
                    self.gc.extents_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        file = file.id(),
                        start = extent.start,
                        len = extent.length,
                        error = %e,
                        "failed to copy extent, leaving it in place"
                    );
                    new_extents.push(*extent);
                }
            }
        }
        drop(target);
        if moved.is_empty() {
            return Ok(0);
        }

        let files = self.files.lock();
        let still_linked = file
            .links()
            .first()
            .and_then(|name| files.get(name))
            .is_some_and(|f| Arc::ptr_eq(f, file));
        if !still_linked || file.is_deleted() {
            debug!(file = file.id(), "file deleted during migration");
            self.release_extents(&fresh);
            return Ok(0);
        }

        let previous = file.replace_extents(new_extents);
        let (record, count) = file.metadata_record(true);
        if let Err(e) = self.persist_record_locked(&files, &MetaRecord::Replace(record)) {
            file.replace_extents(previous);
            self.release_extents(&fresh);
            return Err(e);
        }
        file.mark_synced(count);
        drop(files);

        file.retire_extents(&moved, &self.device);
        self.gc
            .extents_migrated
            .fetch_add(moved.len() as u64, Ordering::Relaxed);
        self.gc.migrated_files.fetch_add(1, Ordering::Relaxed);
        self.gc.migrated_by_lifetime[hint as usize].fetch_add(1, Ordering::Relaxed);
        let bytes = moved.iter().map(|e| e.length).sum();
        debug!(file = file.id(), extents = moved.len(), bytes, "migrated extents");
        Ok(bytes)
    }

    /// Copies one extent into the target zone, continuing in newly
    /// allocated zones as needed.
    fn copy_extent(
        &self,
        extent: &ZoneExtent,
        hint: WriteLifetimeHint,
        target: &mut Option<ZoneLease>,
    ) -> ZenFsResult<Vec<ZoneExtent>> {
        let mut data = vec![0u8; extent.length as usize];
        self.device.read(extent.start, &mut data)?;

        let mut pieces = Vec::new();
        let mut rest = &data[..];
        while !rest.is_empty() {
            let lease = match target.take() {
                Some(lease) if !lease.is_full() => lease,
                _ => match self.device.allocate_io_zone(hint) {
                    Ok(lease) => lease,
                    Err(e) => {
                        self.release_extents(&pieces);
                        return Err(e);
                    }
                },
            };
            let chunk = rest.len().min(lease.capacity_left() as usize);
            match lease.append(&rest[..chunk]) {
                Ok(offset) => {
                    lease.add_used(chunk as u64);
                    pieces.push(ZoneExtent::new(offset, chunk as u64));
                }
                Err(e) => {
                    self.release_extents(&pieces);
                    return Err(e);
                }
            }
            rest = &rest[chunk..];
            *target = Some(lease);
        }
        Ok(pieces)
    }

    fn release_extents(&self, extents: &[ZoneExtent]) {
        for extent in extents {
            self.device.release_extent(extent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(zone: u64, used: u64, full: bool, busy: bool) -> ZoneUsage {
        ZoneUsage {
            zone,
            start: zone * 100,
            max_capacity: 100,
            written: 100,
            used_capacity: used,
            full,
            busy,
        }
    }

    #[test]
    fn test_threshold_slope() {
        let config = GcConfig::default();
        assert_eq!(config.threshold(25), None);
        assert_eq!(config.threshold(20), Some(100));
        assert_eq!(config.threshold(10), Some(70));
        assert_eq!(config.threshold(0), Some(40));

        let steep = GcConfig {
            slope: 10,
            ..GcConfig::default()
        };
        assert_eq!(steep.threshold(5), Some(0));
    }

    #[test]
    fn test_lowest_live_fraction_first() {
        let config = GcConfig {
            start_level_pct: 20,
            slope: 3,
            ..GcConfig::default()
        };
        let threshold = config.threshold(10).unwrap();
        let zones = vec![
            usage(3, 25, true, false),
            usage(4, 5, true, false),
            usage(5, 50, true, false),
            usage(6, 15, true, false),
            usage(7, 1, false, false),
            usage(8, 2, true, true),
            usage(9, 0, true, false),
        ];
        let victims = select_victims(&zones, threshold, usize::MAX);
        let order: Vec<u64> = victims.iter().map(|v| v.zone).collect();
        assert_eq!(order, vec![4, 6, 3]);

        let capped = select_victims(&zones, threshold, 1);
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].zone, 4);
    }

    #[test]
    fn test_no_victims_without_pressure() {
        let zones = vec![usage(3, 1, true, false)];
        assert!(select_victims(&zones, 100, usize::MAX).is_empty());
    }

    #[test]
    fn test_counters_drain() {
        let counters = GcCounters::default();
        counters.runs.fetch_add(2, Ordering::Relaxed);
        counters.migrated_files.fetch_add(1, Ordering::Relaxed);
        counters.migrated_by_lifetime[WriteLifetimeHint::Long as usize]
            .fetch_add(1, Ordering::Relaxed);
        counters.push_run(GcRunStat {
            num_victimed: 1,
            ..GcRunStat::default()
        });
        let (totals, runs) = counters.take();
        assert_eq!(totals.runs, 2);
        assert_eq!(totals.migrated_files, 1);
        assert_eq!(totals.migrated_by_lifetime, [0, 0, 0, 0, 1, 0]);
        assert_eq!(runs.len(), 1);

        let (totals, runs) = counters.take();
        assert_eq!(totals, GcTotals::default());
        assert!(runs.is_empty());
    }

    #[test]
    fn test_run_stats_are_bounded() {
        let counters = GcCounters::default();
        for i in 0..(MAX_RUN_STATS as u64 + 5) {
            counters.push_run(GcRunStat {
                elapsed_us: i,
                ..GcRunStat::default()
            });
        }
        let (_, runs) = counters.take();
        assert_eq!(runs.len(), MAX_RUN_STATS);
        assert_eq!(runs[0].elapsed_us, 5);
    }

    #[test]
    fn test_phase_transitions() {
        let counters = GcCounters::default();
        assert_eq!(counters.phase(), GcPhase::Idle);
        counters.set_phase(GcPhase::Migrating);
        assert_eq!(counters.phase(), GcPhase::Migrating);
    }
}

//! Pluggable metrics sink and the structured statistics report.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ZenFsError, ZenFsResult};
use crate::gc::GcRunStat;
use crate::zbd::DeviceStatsReport;

/// Receiver of filesystem statistics. Every method defaults to a no-op.
pub trait ZenFsMetrics: Send + Sync {
    /// Called after every GC pass that migrated data.
    fn report_gc_run(&self, _run: &GcRunStat) {}

    /// Called when a pass resets zones.
    fn report_zone_reset(&self, _zones: u64) {}

    /// Called with a drained statistics report.
    fn report(&self, _report: &ZenFsReport) {}
}

/// Metrics sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoZenFsMetrics;

impl ZenFsMetrics for NoZenFsMetrics {}

/// Cumulative GC counters since the previous report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcTotals {
    /// Passes that found space pressure.
    pub runs: u64,
    /// Zones chosen as victims.
    pub zones_victimed: u64,
    /// Victim zones reset afterwards.
    pub zones_reset: u64,
    /// Bytes copied out of victims.
    pub bytes_copied: u64,
    /// Extents moved to new zones.
    pub extents_migrated: u64,
    /// Extents whose copy failed and stayed in place.
    pub extents_failed: u64,
    /// Files skipped because a writer held them.
    pub files_skipped: u64,
    /// Files whose extents were migrated.
    pub migrated_files: u64,
    /// Migrated files per lifetime class, indexed by hint value.
    pub migrated_by_lifetime: [u64; 6],
}

/// Device capacity breakdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceReport {
    /// Bytes still appendable.
    pub free_bytes: u64,
    /// Bytes referenced by files.
    pub used_bytes: u64,
    /// Written bytes no longer referenced.
    pub reclaimable_bytes: u64,
    /// Free space as a percentage.
    pub free_percent: u64,
    /// Written bytes per used byte, as a percentage.
    pub space_amplification_pct: u64,
}

impl SpaceReport {
    /// Builds the breakdown from raw totals.
    pub fn new(free_bytes: u64, used_bytes: u64, reclaimable_bytes: u64) -> Self {
        let total = free_bytes + used_bytes + reclaimable_bytes;
        let free_percent = if total == 0 { 0 } else { 100 * free_bytes / total };
        let space_amplification_pct = if used_bytes == 0 {
            0
        } else {
            100 * (used_bytes + reclaimable_bytes) / used_bytes
        };
        Self {
            free_bytes,
            used_bytes,
            reclaimable_bytes,
            free_percent,
            space_amplification_pct,
        }
    }
}

/// Statistics drained from a mounted filesystem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZenFsReport {
    /// GC totals.
    pub gc: GcTotals,
    /// Per-pass GC statistics, oldest first.
    pub runs: Vec<GcRunStat>,
    /// Zone reset and lifetime placement statistics.
    pub device: DeviceStatsReport,
    /// Space breakdown at report time.
    pub space: SpaceReport,
}

impl ZenFsReport {
    /// Serializes the report as JSON.
    pub fn to_json(&self) -> ZenFsResult<String> {
        serde_json::to_string(self).map_err(|e| ZenFsError::Serialization {
            reason: e.to_string(),
        })
    }
}

impl fmt::Display for ZenFsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "GC: runs {} victims {} reset {} copied {} bytes",
            self.gc.runs, self.gc.zones_victimed, self.gc.zones_reset, self.gc.bytes_copied
        )?;
        writeln!(
            f,
            "Migrated files: {} by lifetime {:?}",
            self.gc.migrated_files, self.gc.migrated_by_lifetime
        )?;
        for run in &self.runs {
            writeln!(
                f,
                "  run: {}us free {}% finished {} victims {} copied {}",
                run.elapsed_us, run.free_percent, run.num_finished, run.num_victimed, run.copied_bytes
            )?;
        }
        writeln!(
            f,
            "Zone resets: calls {} zones {} util max {}% sum {}%",
            self.device.reset_calls,
            self.device.reset_zones,
            self.device.reset_util_max,
            self.device.reset_util_sum
        )?;
        writeln!(f, "Zone lifetimes: {:?}", self.device.zone_lifetimes)?;
        writeln!(f, "Lifetime diff: {:?}", self.device.lifetime_diff)?;
        writeln!(f, "Same lifetime: {:?}", self.device.same_lifetime)?;
        writeln!(f, "Zone lifetime diff: {:?}", self.device.zone_diff)?;
        write!(
            f,
            "Space: free {} used {} reclaimable {} ({}% free, {}% amplification)",
            self.space.free_bytes,
            self.space.used_bytes,
            self.space.reclaimable_bytes,
            self.space.free_percent,
            self.space.space_amplification_pct
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_space_report() {
        let space = SpaceReport::new(50, 25, 25);
        assert_eq!(space.free_percent, 50);
        assert_eq!(space.space_amplification_pct, 200);

        let empty = SpaceReport::new(0, 0, 0);
        assert_eq!(empty.free_percent, 0);
        assert_eq!(empty.space_amplification_pct, 0);
    }

    #[test]
    fn test_report_json() {
        let mut report = ZenFsReport::default();
        report.gc.runs = 2;
        report.runs.push(GcRunStat {
            elapsed_us: 10,
            free_percent: 9,
            num_finished: 1,
            num_victimed: 2,
            copied_bytes: 4096,
        });
        let json = report.to_json().unwrap();
        let back: ZenFsReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn test_report_display() {
        let report = ZenFsReport::default();
        let text = report.to_string();
        assert!(text.starts_with("GC: runs 0"));
        assert!(text.contains("Migrated files: 0"));
        assert!(text.contains("Zone lifetime diff: [0, 0, 0, 0, 0, 0]"));
        assert!(text.contains("Space: free 0"));
    }

    #[test]
    fn test_no_metrics_is_noop() {
        let sink: &dyn ZenFsMetrics = &NoZenFsMetrics;
        sink.report_zone_reset(3);
        sink.report(&ZenFsReport::default());
    }
}

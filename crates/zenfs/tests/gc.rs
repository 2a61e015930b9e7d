//! Garbage collection: migration keeps data intact and only empty zones
//! are reset.

mod common;

use std::time::Duration;

use common::{pattern, read_all, write_file, TestFs};
use zenfs::{GcConfig, GcPhase, MkfsOptions, WriteLifetimeHint, ZenFs, ZenFsOptions, ZonedBackend};

const HALF_ZONE: usize = 8 * 4096;

/// Fills seven I/O zones with two half-zone files each, then deletes one
/// file per zone so every full zone is half garbage.
fn fragment(fs: &ZenFs) -> Vec<String> {
    let mut kept = Vec::new();
    for i in 0..14u64 {
        let name = format!("/db/{:06}.sst", i);
        write_file(fs, &name, &pattern(i, HALF_ZONE), WriteLifetimeHint::Medium);
        if i % 2 == 0 {
            kept.push(name);
        }
    }
    for i in (1..14u64).step_by(2) {
        fs.delete_file(&format!("/db/{:06}.sst", i)).unwrap();
    }
    kept
}

fn assert_contents(fs: &ZenFs, kept: &[String]) {
    for name in kept {
        let seed: u64 = name[4..10].parse().unwrap();
        assert_eq!(read_all(fs, name), pattern(seed, HALF_ZONE), "content of {}", name);
    }
}

fn pressure_config() -> GcConfig {
    GcConfig {
        start_level_pct: 30,
        slope: 10,
        ..GcConfig::default()
    }
}

#[test]
fn test_gc_pass_migrates_without_data_loss() {
    let t = TestFs::format(16, 12);
    let options = ZenFsOptions {
        gc: pressure_config(),
        ..ZenFsOptions::default()
    };
    let kept;
    {
        let fs = t.try_mount(options.clone()).unwrap();
        kept = fragment(&fs);
        let reclaimable = fs.device().get_reclaimable_space();
        assert_eq!(reclaimable, 7 * HALF_ZONE as u64);
        let used = fs.device().get_used_space();

        let stat = fs.run_gc_once().unwrap().expect("free space is below the start level");
        assert!(stat.num_victimed >= 1);
        assert!(stat.copied_bytes >= HALF_ZONE as u64);
        assert_eq!(fs.gc_phase(), GcPhase::Idle);

        assert_eq!(fs.device().get_used_space(), used);
        assert!(fs.device().get_reclaimable_space() < reclaimable);
        for zone in fs.device().io_zones() {
            if !zone.is_used() {
                assert!(zone.is_empty(), "zone {} has no live data but was not reset", zone.nr());
            }
        }
        assert_contents(&fs, &kept);

        let report = fs.report();
        assert_eq!(report.gc.runs, 1);
        assert!(report.gc.extents_migrated >= 1);
        assert!(report.gc.migrated_files >= 1);
        assert_eq!(
            report.gc.migrated_by_lifetime[WriteLifetimeHint::Medium as usize],
            report.gc.migrated_files
        );
        assert_eq!(report.runs.len(), 1);
    }

    let fs = t.try_mount(options).unwrap();
    assert_contents(&fs, &kept);
}

#[test]
fn test_gc_skips_when_space_is_plentiful() {
    let t = TestFs::format(16, 12);
    let fs = t.mount();
    write_file(&fs, "/a", &pattern(0, HALF_ZONE), WriteLifetimeHint::Short);
    assert!(fs.run_gc_once().unwrap().is_none());
    assert_eq!(fs.report().gc.runs, 0);
}

#[test]
fn test_gc_leaves_open_files_alone() {
    let t = TestFs::format(16, 12);
    let fs = t
        .try_mount(ZenFsOptions {
            gc: pressure_config(),
            ..ZenFsOptions::default()
        })
        .unwrap();
    let kept = fragment(&fs);
    let busy = fs.reopen_writable_file(&kept[0]).unwrap();
    let before = fs.file_records()[&kept[0]].extents.clone();

    fs.run_gc_once().unwrap();
    assert_eq!(fs.file_records()[&kept[0]].extents, before);
    assert!(fs.report().gc.files_skipped >= 1);
    drop(busy);
    assert_contents(&fs, &kept);
}

#[test]
fn test_gc_replace_survives_unclean_remount() {
    let t = TestFs::format(16, 12);
    let options = ZenFsOptions {
        gc: pressure_config(),
        ..ZenFsOptions::default()
    };
    let before;
    let kept;
    {
        let fs = t.try_mount(options.clone()).unwrap();
        kept = fragment(&fs);
        fs.run_gc_once().unwrap();
        before = fs.file_records();
    }
    let fs = t.try_mount(options).unwrap();
    assert_eq!(fs.file_records(), before);
    assert_contents(&fs, &kept);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_background_worker_reclaims_and_stops() {
    let t = TestFs::format_with(
        16,
        12,
        MkfsOptions {
            enable_gc: true,
            ..MkfsOptions::default()
        },
    );
    let fs = t
        .try_mount(ZenFsOptions {
            gc: GcConfig {
                interval_ms: 10,
                ..pressure_config()
            },
            ..ZenFsOptions::default()
        })
        .unwrap();
    assert!(fs.is_gc_running());

    let kept = fragment(&fs);
    let reclaimable = fs.device().get_reclaimable_space();
    let mut reclaimed = false;
    for _ in 0..500 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if fs.device().get_reclaimable_space() < reclaimable {
            reclaimed = true;
            break;
        }
    }
    assert!(reclaimed, "background GC never reclaimed space");

    fs.shutdown().await;
    assert!(!fs.is_gc_running());
    assert_eq!(fs.gc_phase(), GcPhase::Stopped);
    assert_contents(&fs, &kept);
}

#[test]
fn test_open_reader_survives_migration() {
    let t = TestFs::format(16, 12);
    let fs = t
        .try_mount(ZenFsOptions {
            gc: pressure_config(),
            ..ZenFsOptions::default()
        })
        .unwrap();
    let kept = fragment(&fs);
    let readers: Vec<_> = kept
        .iter()
        .map(|name| fs.new_random_access_file(name).unwrap())
        .collect();
    let used = fs.device().get_used_space();

    let stat = fs.run_gc_once().unwrap().unwrap();
    assert!(stat.copied_bytes > 0);
    // Old copies stay live while readers may still hold the old extent list.
    assert!(fs.device().get_used_space() > used);
    for (name, reader) in kept.iter().zip(&readers) {
        let seed: u64 = name[4..10].parse().unwrap();
        let mut buf = vec![0u8; HALF_ZONE];
        assert_eq!(reader.read_at(0, &mut buf).unwrap(), HALF_ZONE);
        assert_eq!(buf, pattern(seed, HALF_ZONE), "content of {}", name);
    }

    drop(readers);
    assert_eq!(fs.device().get_used_space(), used);
    assert_contents(&fs, &kept);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_drop_without_shutdown_stops_passes() {
    let t = TestFs::format_with(
        16,
        12,
        MkfsOptions {
            enable_gc: true,
            ..MkfsOptions::default()
        },
    );
    let options = ZenFsOptions {
        gc: GcConfig {
            interval_ms: 1,
            ..pressure_config()
        },
        ..ZenFsOptions::default()
    };
    let fs = t.try_mount(options.clone()).unwrap();
    let kept = fragment(&fs);
    tokio::time::sleep(Duration::from_millis(20)).await;
    let zone_size = fs.device().zone_size();
    let nr_zones = fs.device().nr_zones() as u64;
    drop(fs);

    let pointers = |backend: &dyn ZonedBackend| -> Vec<u64> {
        (0..nr_zones)
            .map(|z| backend.write_pointer(z * zone_size).unwrap())
            .collect()
    };
    let after_drop = pointers(t.backend.as_ref());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pointers(t.backend.as_ref()), after_drop);

    let fs = t
        .try_mount(ZenFsOptions {
            readonly: true,
            ..options
        })
        .unwrap();
    assert_contents(&fs, &kept);
}

#[tokio::test]
async fn test_worker_not_started_on_readonly_mount() {
    let t = TestFs::format_with(
        16,
        12,
        MkfsOptions {
            enable_gc: true,
            ..MkfsOptions::default()
        },
    );
    let fs = t
        .try_mount(ZenFsOptions {
            readonly: true,
            ..ZenFsOptions::default()
        })
        .unwrap();
    assert!(!fs.is_gc_running());
}
